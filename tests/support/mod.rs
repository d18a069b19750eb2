#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fireloop_sdk::realtime::proto::{ClientMessage, MutationOp, RefTarget, ServerMessage};
use fireloop_sdk::realtime::{Connection, Listener};
use fireloop_sdk::{Model, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub name: String,
}

impl Room {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl Model for Room {
    const COLLECTION: &'static str = "Room";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub text: String,
}

impl Message {
    pub fn with_text(text: &str) -> Self {
        Self {
            id: None,
            text: text.to_string(),
        }
    }
}

impl Model for Message {
    const COLLECTION: &'static str = "Message";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }
}

/// Waits for the next record on `listener`, failing the test on timeout.
pub async fn next<T>(listener: &mut Listener<T>) -> T {
    timeout(WAIT, listener.recv())
        .await
        .expect("timed out waiting for change event")
        .expect("listener closed")
}

#[derive(Default)]
struct BackendState {
    next_id: i64,
    mutations: usize,
    records: HashMap<RefTarget, BTreeMap<RecordId, Value>>,
    clients: Vec<mpsc::UnboundedSender<ServerMessage>>,
}

/// In-memory realtime backend: acks each mutation to its sender, then
/// broadcasts the change to every connected client.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Opens a new client connection to this backend.
    pub fn connect(&self) -> Connection {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let session_id = {
            let mut state = self.state.lock().expect("backend state");
            state.clients.push(inbound_tx.clone());
            state.clients.len() as u64
        };
        let _ = inbound_tx.send(ServerMessage::HelloOk {
            session_id,
            server_time_ms: 1_700_000_000_000,
        });

        let backend = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_message = outbound_rx.recv() => {
                        match maybe_message {
                            Some(message) => backend.handle(message, &inbound_tx),
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        Connection::from_channels(outbound_tx, inbound_rx)
    }

    /// Drops every client connection.
    pub fn disconnect_all(&self) {
        self.state.lock().expect("backend state").clients.clear();
        let _ = self.shutdown.send(true);
    }

    /// Number of mutation requests the backend has received.
    pub fn mutations(&self) -> usize {
        self.state.lock().expect("backend state").mutations
    }

    pub fn stored(&self, target: &RefTarget) -> Vec<Value> {
        self.state
            .lock()
            .expect("backend state")
            .records
            .get(target)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    fn handle(&self, message: ClientMessage, reply: &mpsc::UnboundedSender<ServerMessage>) {
        let ClientMessage::Mutate {
            request_id,
            op,
            target,
            data,
        } = message
        else {
            let _ = reply.send(ServerMessage::Pong {
                server_time_ms: 1_700_000_000_001,
            });
            return;
        };

        let mut state = self.state.lock().expect("backend state");
        state.mutations += 1;
        match commit(&mut state, op, &target, data) {
            Ok(record) => {
                let _ = reply.send(ServerMessage::MutationAck {
                    request_id,
                    data: record.clone(),
                });
                let change = ServerMessage::Change {
                    kind: op.broadcast_kind(),
                    target,
                    data: record,
                };
                for client in &state.clients {
                    let _ = client.send(change.clone());
                }
            }
            Err(reason) => {
                let _ = reply.send(ServerMessage::MutationRejected { request_id, reason });
            }
        }
    }
}

fn commit(
    state: &mut BackendState,
    op: MutationOp,
    target: &RefTarget,
    mut data: Value,
) -> Result<Value, String> {
    if data.get("name").and_then(Value::as_str) == Some("") {
        return Err("name can't be blank".to_string());
    }
    let existing_id = data
        .get("id")
        .and_then(|id| serde_json::from_value::<RecordId>(id.clone()).ok());

    match op {
        MutationOp::Create => {
            state.next_id += 1;
            let id = RecordId::Int(state.next_id);
            data["id"] = serde_json::to_value(&id).map_err(|err| err.to_string())?;
            state
                .records
                .entry(target.clone())
                .or_default()
                .insert(id, data.clone());
            Ok(data)
        }
        MutationOp::Upsert => {
            let id = existing_id.ok_or_else(|| "id is required".to_string())?;
            state
                .records
                .entry(target.clone())
                .or_default()
                .insert(id, data.clone());
            Ok(data)
        }
        MutationOp::Remove => {
            let id = existing_id.ok_or_else(|| "id is required".to_string())?;
            state
                .records
                .get_mut(target)
                .and_then(|records| records.remove(&id))
                .ok_or_else(|| format!("{target} has no record {id}"))
        }
    }
}
