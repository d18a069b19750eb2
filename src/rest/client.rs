use std::marker::PhantomData;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::model::{Model, RecordId};
use crate::rest::filter::Filter;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const API_ROOT: &'static str = "/api";
}

#[derive(Clone, Debug)]
pub struct RestClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub api_root: String,
    pub access_token: Option<SecretString>,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            request_timeout: RestDefaults::REQUEST_TIMEOUT,
            api_root: RestDefaults::API_ROOT.to_string(),
            access_token: None,
        }
    }
}

/// HTTP client shared by every [`ModelApi`].
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    access_token: Option<SecretString>,
    request_timeout: Duration,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RestError> {
        Self::with_options(base_url, RestClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: RestClientOptions,
    ) -> Result<Self, RestError> {
        let base_url = base_url.into();
        let base_url = base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RestError::InvalidUrl(base_url.to_string()));
        }

        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RestError::Transport)?;

        let api_root = options.api_root.trim_matches('/');
        let base_url = if api_root.is_empty() {
            base_url.to_string()
        } else {
            format!("{base_url}/{api_root}")
        };

        Ok(Self {
            http,
            base_url,
            access_token: options.access_token,
            request_timeout: options.request_timeout,
        })
    }

    /// Returns the API for records of type `T` mounted at `path` (e.g. `Rooms`).
    pub fn model<T: Model>(&self, path: impl Into<String>) -> ModelApi<T> {
        ModelApi {
            client: self.clone(),
            path: path.into().trim_matches('/').to_string(),
            _record: PhantomData,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.endpoint(path))
            .timeout(self.request_timeout);
        if let Some(token) = self.access_token.as_ref() {
            builder = builder.header("authorization", token.expose_secret());
        }
        builder
    }

    async fn send<R: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<R, RestError> {
        let response = builder.send().await.map_err(RestError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(RestError::Transport)?;

        if !status.is_success() {
            debug!(event = "rest_request_failed", status = status.as_u16());
            return Err(RestError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| RestError::Parse(err.to_string()))
    }
}

/// Typed CRUD, relation, and remote-method access to one model.
pub struct ModelApi<T> {
    client: RestClient,
    path: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for ModelApi<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            path: self.path.clone(),
            _record: PhantomData,
        }
    }
}

/// Result of bulk updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCount {
    pub count: u64,
}

impl<T: Model> ModelApi<T> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn create(&self, record: &T) -> Result<T, RestError> {
        self.client
            .send(self.client.request(Method::POST, &self.path).json(record))
            .await
    }

    pub async fn find(&self, filter: &Filter) -> Result<Vec<T>, RestError> {
        let builder = self.client.request(Method::GET, &self.path);
        self.client.send(with_filter(builder, Some(filter))?).await
    }

    pub async fn find_by_id(
        &self,
        id: &RecordId,
        filter: Option<&Filter>,
    ) -> Result<T, RestError> {
        let builder = self
            .client
            .request(Method::GET, &format!("{}/{id}", self.path));
        self.client.send(with_filter(builder, filter)?).await
    }

    pub async fn find_one(&self, filter: &Filter) -> Result<T, RestError> {
        let builder = self
            .client
            .request(Method::GET, &format!("{}/findOne", self.path));
        self.client.send(with_filter(builder, Some(filter))?).await
    }

    /// Applies `data` to every record matching `condition`.
    pub async fn update_all(
        &self,
        condition: &Value,
        data: &Value,
    ) -> Result<UpdateCount, RestError> {
        let condition =
            serde_json::to_string(condition).map_err(|err| RestError::Parse(err.to_string()))?;
        let builder = self
            .client
            .request(Method::POST, &format!("{}/update", self.path))
            .query(&[("where", condition)])
            .json(data);
        self.client.send(builder).await
    }

    pub async fn update_attributes(&self, id: &RecordId, data: &Value) -> Result<T, RestError> {
        let builder = self
            .client
            .request(Method::PUT, &format!("{}/{id}", self.path))
            .json(data);
        self.client.send(builder).await
    }

    /// Writes every field of an already created record.
    pub async fn update_record(&self, record: &T) -> Result<T, RestError> {
        let id = record.id().ok_or(RestError::MissingIdentifier)?;
        let builder = self
            .client
            .request(Method::PUT, &format!("{}/{id}", self.path))
            .json(record);
        self.client.send(builder).await
    }

    /// Creates a record in `relation` under the record `id`.
    pub async fn create_related<U>(
        &self,
        id: &RecordId,
        relation: &str,
        record: &U,
    ) -> Result<U, RestError>
    where
        U: Serialize + DeserializeOwned,
    {
        let builder = self
            .client
            .request(Method::POST, &format!("{}/{id}/{relation}", self.path))
            .json(record);
        self.client.send(builder).await
    }

    pub async fn get_related<U>(
        &self,
        id: &RecordId,
        relation: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<U>, RestError>
    where
        U: DeserializeOwned,
    {
        let builder = self
            .client
            .request(Method::GET, &format!("{}/{id}/{relation}", self.path));
        self.client.send(with_filter(builder, filter)?).await
    }

    /// Links the record `id` to the related record `fk` through `relation`.
    pub async fn link_related(
        &self,
        id: &RecordId,
        relation: &str,
        fk: &RecordId,
    ) -> Result<Value, RestError> {
        let builder = self
            .client
            .request(Method::PUT, &format!("{}/{id}/{relation}/rel/{fk}", self.path));
        self.client.send(builder).await
    }

    /// Invokes a custom remote method mounted under this model's path.
    pub async fn invoke<R>(
        &self,
        method: Method,
        suffix: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<R, RestError>
    where
        R: DeserializeOwned,
    {
        let path = format!("{}/{}", self.path, suffix.trim_start_matches('/'));
        let mut builder = self.client.request(method, &path);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.client.send(builder).await
    }
}

fn with_filter(
    builder: RequestBuilder,
    filter: Option<&Filter>,
) -> Result<RequestBuilder, RestError> {
    match filter {
        Some(filter) => {
            let encoded = filter.to_json().map_err(|err| RestError::Parse(err.to_string()))?;
            Ok(builder.query(&[("filter", encoded)]))
        }
        None => Ok(builder),
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("record has no identifier")]
    MissingIdentifier,

    #[error("invalid base url: {0}")]
    InvalidUrl(String),
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<Value>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let nested = parsed.error.and_then(|error| match error {
            Value::String(message) => Some(message),
            Value::Object(fields) => fields
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        });
        if let Some(message) = nested.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::{
        summarize_error_body, RestClient, RestClientOptions, RestError, ERROR_BODY_SNIPPET_LEN,
    };

    #[test]
    fn endpoint_joins_base_api_root_and_path() {
        let client = RestClient::new("http://localhost:3000/").expect("client");
        assert_eq!(client.endpoint("Rooms"), "http://localhost:3000/api/Rooms");
        assert_eq!(client.endpoint("/Rooms/1"), "http://localhost:3000/api/Rooms/1");
    }

    #[test]
    fn empty_api_root_is_omitted() {
        let options = RestClientOptions {
            api_root: "/".to_string(),
            ..RestClientOptions::default()
        };
        let client = RestClient::with_options("https://example.com", options).expect("client");
        assert_eq!(client.endpoint("Rooms"), "https://example.com/Rooms");
    }

    #[test]
    fn non_http_base_url_is_rejected() {
        assert!(matches!(
            RestClient::new("ws://localhost:3000"),
            Err(RestError::InvalidUrl(_))
        ));
    }

    #[test]
    fn error_body_prefers_nested_error_message() {
        let body = r#"{"error":{"statusCode":422,"name":"ValidationError","message":"name can't be blank"}}"#;
        assert_eq!(summarize_error_body(body), "name can't be blank");
        assert_eq!(summarize_error_body(r#"{"error":"denied"}"#), "denied");
    }

    #[test]
    fn unstructured_error_body_is_truncated() {
        let long = "x".repeat(ERROR_BODY_SNIPPET_LEN + 10);
        assert_eq!(summarize_error_body(&long).len(), ERROR_BODY_SNIPPET_LEN);
    }
}
