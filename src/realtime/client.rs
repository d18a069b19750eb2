//! Low-level realtime websocket client and outbound message sender.
//!
//! The client performs the `hello_ok` handshake and then pumps frames between
//! the socket and a pair of in-process channels. It does not reconnect: once
//! the socket ends the inbound channel closes and the owning session fails
//! whatever is still pending.

use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::realtime::proto::{ClientMessage, ServerMessage};

/// Path the realtime endpoint is mounted on when no override is given.
pub const DEFAULT_REALTIME_PATH: &str = "/realtime";

/// Entry point for opening realtime connections.
#[derive(Clone)]
pub struct RealtimeClient {
    base_url: String,
    path: String,
    access_token: Option<SecretString>,
    endpoint_override: Option<String>,
}

impl RealtimeClient {
    /// Creates a client for the backend served at `base_url`.
    ///
    /// `http://` and `https://` schemes are rewritten to `ws://` and `wss://`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end().trim_end_matches('/').to_string(),
            path: DEFAULT_REALTIME_PATH.to_string(),
            access_token: None,
            endpoint_override: None,
        }
    }

    /// Sets the path the realtime endpoint is mounted on.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    /// Sets an explicit websocket endpoint.
    ///
    /// The override takes precedence over base URL and path when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Sends `token` as the `authorization` header of the websocket upgrade.
    pub fn with_access_token(mut self, token: SecretString) -> Self {
        self.access_token = Some(token);
        self
    }

    /// Opens a realtime connection.
    ///
    /// This spawns a background worker that owns the websocket and resolves
    /// once the server has sent `hello_ok`.
    pub async fn connect(&self) -> Result<Connection, RealtimeError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let url = self.endpoint();
        let access_token = self.access_token.clone();

        tokio::spawn(async move {
            connection_worker(
                url,
                access_token,
                outbound_rx,
                inbound_tx,
                status_tx,
                ready_tx,
            )
            .await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Connection {
                sender: RealtimeSender { tx: outbound_tx },
                receiver: inbound_rx,
                status: Some(status_rx),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RealtimeError::Protocol(
                "realtime worker stopped before initial connect".to_string(),
            )),
        }
    }

    pub(crate) fn endpoint(&self) -> String {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint.to_string();
        }
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}{}", self.path)
    }
}

/// Connection lifecycle updates produced by the websocket worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Active realtime connection channels.
#[derive(Debug)]
pub struct Connection {
    sender: RealtimeSender,
    receiver: mpsc::UnboundedReceiver<ServerMessage>,
    status: Option<mpsc::UnboundedReceiver<ConnectionStatus>>,
}

impl Connection {
    /// Assembles a connection from raw channels.
    ///
    /// Any transport that can move [`ClientMessage`] values out and
    /// [`ServerMessage`] values in can back a session this way. Closing the
    /// inbound sender ends the connection.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self {
            sender: RealtimeSender { tx: outbound },
            receiver: inbound,
            status: None,
        }
    }

    /// Returns a cloneable sender for client messages.
    pub fn sender(&self) -> RealtimeSender {
        self.sender.clone()
    }

    /// Takes the connection status receiver, if the transport reports one.
    pub fn take_status(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionStatus>> {
        self.status.take()
    }

    /// Splits into sender and raw inbound message receiver.
    pub fn split(self) -> (RealtimeSender, mpsc::UnboundedReceiver<ServerMessage>) {
        (self.sender, self.receiver)
    }

    /// Receives the next server message from the transport.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }
}

/// Cloneable sender for outbound client messages.
#[derive(Clone, Debug)]
pub struct RealtimeSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl RealtimeSender {
    /// Queues a raw client message for the transport.
    pub fn send(&self, message: ClientMessage) -> Result<(), RealtimeError> {
        self.tx
            .send(message)
            .map_err(|_| RealtimeError::TransportUnavailable)
    }

    /// Sends a heartbeat ping with client timestamp.
    pub fn ping(&self, client_time_ms: u64) -> Result<(), RealtimeError> {
        self.send(ClientMessage::Ping { client_time_ms })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Errors produced by realtime references, subscriptions, and transport.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The connection is not established or has ended.
    #[error("realtime transport is unavailable")]
    TransportUnavailable,

    /// The mutation needs an identifier the record does not carry.
    #[error("record has no identifier")]
    MissingIdentifier,

    /// The backend declined the mutation.
    #[error("backend rejected mutation: {reason}")]
    BackendRejected { reason: String },

    /// The subscription was already unsubscribed.
    #[error("subscription is already closed")]
    SubscriptionAlreadyClosed,

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Access token could not be converted to a valid HTTP header value.
    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// Realtime protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

async fn connection_worker(
    url: String,
    access_token: Option<SecretString>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    status_tx: mpsc::UnboundedSender<ConnectionStatus>,
    ready_tx: oneshot::Sender<Result<(), RealtimeError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let outcome = run_connected_session(
        &url,
        access_token.as_ref(),
        &mut outbound_rx,
        &inbound_tx,
        &status_tx,
        &mut ready_tx,
    )
    .await;

    match outcome {
        Ok(()) => debug!(event = "realtime_disconnected", url = %url),
        Err(err) => {
            debug!(event = "realtime_connect_failed", url = %url, error = %err);
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(err));
                return;
            }
        }
    }
    let _ = status_tx.send(ConnectionStatus::Disconnected);
}

async fn run_connected_session(
    url: &str,
    access_token: Option<&SecretString>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    inbound_tx: &mpsc::UnboundedSender<ServerMessage>,
    status_tx: &mpsc::UnboundedSender<ConnectionStatus>,
    ready_tx: &mut Option<oneshot::Sender<Result<(), RealtimeError>>>,
) -> Result<(), RealtimeError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = access_token {
        let header = token.expose_secret().parse()?;
        request.headers_mut().insert("authorization", header);
    }

    let (mut socket, _) = connect_async(request).await?;

    let first_server_message = recv_hello(&mut socket).await?;
    if !matches!(&first_server_message, ServerMessage::HelloOk { .. }) {
        return Err(RealtimeError::Protocol(
            "expected first server message to be hello_ok".to_string(),
        ));
    }
    let _ = inbound_tx.send(first_server_message);
    let _ = status_tx.send(ConnectionStatus::Connected);
    debug!(event = "realtime_connected", url = %url);

    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Ok(()));
    }

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(client_msg) => {
                        if send_client_message(&mut socket, &client_msg).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return Ok(());
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        match ServerMessage::from_text(&text) {
                            Ok(server_msg) => {
                                if inbound_tx.send(server_msg).is_err() {
                                    let _ = socket.close(None).await;
                                    return Ok(());
                                }
                            }
                            Err(err) => {
                                debug!(event = "realtime_frame_malformed", error = %err);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return Ok(()),
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn recv_hello<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
) -> Result<ServerMessage, RealtimeError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return ServerMessage::from_text(&text).map_err(RealtimeError::Json)
            }
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(RealtimeError::Protocol(
                    "socket closed before hello_ok".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(RealtimeError::Protocol(
                    "received non-text frame before hello_ok".to_string(),
                ));
            }
            Some(Err(err)) => return Err(RealtimeError::WebSocket(err)),
            None => {
                return Err(RealtimeError::Protocol(
                    "socket ended before hello_ok".to_string(),
                ));
            }
        }
    }
}

async fn send_client_message<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    message: &ClientMessage,
) -> Result<(), RealtimeError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::{Connection, RealtimeClient, RealtimeError};
    use crate::realtime::proto::ServerMessage;

    #[test]
    fn http_base_url_maps_to_ws_endpoint() {
        let client = RealtimeClient::new("http://localhost:3000/");
        assert_eq!(client.endpoint(), "ws://localhost:3000/realtime");
    }

    #[test]
    fn https_base_url_maps_to_wss_with_custom_path() {
        let client = RealtimeClient::new("https://api.example.com").with_path("live");
        assert_eq!(client.endpoint(), "wss://api.example.com/live");
    }

    #[test]
    fn endpoint_override_takes_precedence() {
        let client = RealtimeClient::new("http://localhost:3000")
            .with_path("/live")
            .with_endpoint("ws://127.0.0.1:9000/ws   \n");
        assert_eq!(client.endpoint(), "ws://127.0.0.1:9000/ws");
    }

    #[test]
    fn sender_reports_transport_unavailable_once_receiver_is_gone() {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let connection = Connection::from_channels(outbound_tx, inbound_rx);
        drop(outbound_rx);

        let err = connection.sender().ping(1).expect_err("closed queue");
        assert!(matches!(err, RealtimeError::TransportUnavailable));
        assert!(connection.sender().is_closed());
    }
}
