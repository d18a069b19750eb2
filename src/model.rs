//! Record identity shared by the realtime and REST surfaces.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Server-assigned record identifier.
///
/// Backends hand out either numeric or string identifiers; both are accepted
/// on the wire without a tag.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::Str(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self::Str(id)
    }
}

/// A typed record stored in a remote collection.
pub trait Model: Serialize + DeserializeOwned + Send + 'static {
    /// Collection (model) name used for realtime routing.
    const COLLECTION: &'static str;

    /// Identifier assigned by the backend, if the record was created.
    fn id(&self) -> Option<&RecordId>;
}

#[cfg(test)]
mod tests {
    use super::RecordId;

    #[test]
    fn numeric_and_string_ids_decode_untagged() {
        let int: RecordId = serde_json::from_str("42").expect("int id");
        let text: RecordId = serde_json::from_str("\"5f2a\"").expect("string id");
        assert_eq!(int, RecordId::Int(42));
        assert_eq!(text, RecordId::Str("5f2a".to_string()));
    }

    #[test]
    fn display_renders_bare_value_for_url_paths() {
        assert_eq!(RecordId::Int(7).to_string(), "7");
        assert_eq!(RecordId::from("abc").to_string(), "abc");
    }
}
