use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::RecordId;

/// Kind of change a subscription listens for.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChildAdded,
    ChildChanged,
    ChildRemoved,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChildAdded => "child_added",
            Self::ChildChanged => "child_changed",
            Self::ChildRemoved => "child_removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Upsert,
    Remove,
}

impl MutationOp {
    /// Event kind the backend broadcasts once this mutation commits.
    pub fn broadcast_kind(self) -> EventKind {
        match self {
            Self::Create => EventKind::ChildAdded,
            Self::Upsert => EventKind::ChildChanged,
            Self::Remove => EventKind::ChildRemoved,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentScopeMsg {
    pub id: RecordId,
    pub relation: String,
}

/// Collection a mutation or change applies to.
///
/// Child collections carry the parent record id and relation name; the
/// `collection` is then the parent's collection.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTarget {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentScopeMsg>,
}

impl RefTarget {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            parent: None,
        }
    }

    pub fn child(
        collection: impl Into<String>,
        parent_id: RecordId,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            parent: Some(ParentScopeMsg {
                id: parent_id,
                relation: relation.into(),
            }),
        }
    }
}

impl fmt::Display for RefTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}/{}/{}", self.collection, parent.id, parent.relation),
            None => f.write_str(&self.collection),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        client_time_ms: u64,
    },
    Mutate {
        request_id: u64,
        op: MutationOp,
        target: RefTarget,
        data: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HelloOk {
        session_id: u64,
        server_time_ms: u64,
    },
    Pong {
        server_time_ms: u64,
    },
    Error {
        code: String,
        message: String,
    },
    MutationAck {
        request_id: u64,
        data: Value,
    },
    MutationRejected {
        request_id: u64,
        reason: String,
    },
    Change {
        kind: EventKind,
        target: RefTarget,
        data: Value,
    },
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
