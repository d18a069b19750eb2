//! Realtime session: owns the connection, dispatches inbound messages and
//! hands out references.
//!
//! A single dispatcher task consumes the inbound channel. Mutation acks
//! resolve their [`Pending`](crate::realtime::Pending) results and change
//! broadcasts fan out through the registry to every matching subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::model::Model;
use crate::realtime::client::{Connection, RealtimeClient, RealtimeError, RealtimeSender};
use crate::realtime::event::ChangeEvent;
use crate::realtime::proto::{ClientMessage, MutationOp, RefTarget, ServerMessage};
use crate::realtime::reference::Reference;
use crate::realtime::registry::{self, Registry, SharedRegistry};

type MutationResult = Result<Value, RealtimeError>;

struct PendingMutation {
    op: MutationOp,
    target: RefTarget,
    tx: oneshot::Sender<MutationResult>,
}

/// State shared by the session, its dispatcher, and every reference.
pub(crate) struct SessionShared {
    sender: Mutex<Option<RealtimeSender>>,
    pub(crate) registry: SharedRegistry,
    pending: Mutex<HashMap<u64, PendingMutation>>,
    open: AtomicBool,
    next_request_id: AtomicU64,
    session_id: AtomicU64,
}

impl SessionShared {
    fn new(sender: RealtimeSender) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            registry: Registry::shared(),
            pending: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            next_request_id: AtomicU64::new(1),
            session_id: AtomicU64::new(0),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Result<RealtimeSender, RealtimeError> {
        if !self.is_open() {
            return Err(RealtimeError::TransportUnavailable);
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RealtimeError::TransportUnavailable)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingMutation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends a mutation and returns the receiver its outcome resolves on.
    pub(crate) fn submit(
        &self,
        op: MutationOp,
        target: RefTarget,
        data: Value,
    ) -> Result<oneshot::Receiver<MutationResult>, RealtimeError> {
        let sender = self.sender()?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Registered before sending so an early ack always finds its entry.
        self.pending().insert(
            request_id,
            PendingMutation {
                op,
                target: target.clone(),
                tx,
            },
        );

        let sent = sender.send(ClientMessage::Mutate {
            request_id,
            op,
            target,
            data,
        });
        if let Err(err) = sent {
            self.pending().remove(&request_id);
            return Err(err);
        }
        if !self.is_open() {
            self.pending().remove(&request_id);
            return Err(RealtimeError::TransportUnavailable);
        }
        Ok(rx)
    }

    fn apply_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::HelloOk { session_id, .. } => {
                self.session_id.store(session_id, Ordering::Relaxed);
                debug!(event = "realtime_hello", session_id);
            }
            ServerMessage::Pong { server_time_ms } => {
                debug!(event = "realtime_pong", server_time_ms);
            }
            ServerMessage::Error { code, message } => {
                warn!(event = "realtime_server_error", code = %code, message = %message);
            }
            ServerMessage::MutationAck { request_id, data } => {
                self.resolve(request_id, Ok(data));
            }
            ServerMessage::MutationRejected { request_id, reason } => {
                self.resolve(request_id, Err(RealtimeError::BackendRejected { reason }));
            }
            ServerMessage::Change { kind, target, data } => {
                let event = ChangeEvent { kind, target, data };
                let slots = registry::lock(&self.registry).matching(&event.target, event.kind);
                for slot in slots {
                    slot.deliver(&event);
                }
            }
        }
    }

    fn resolve(&self, request_id: u64, result: MutationResult) {
        let Some(pending) = self.pending().remove(&request_id) else {
            warn!(event = "mutation_ack_unknown", request_id);
            return;
        };
        if let Err(RealtimeError::BackendRejected { reason }) = &result {
            debug!(
                event = "mutation_rejected",
                request_id,
                op = ?pending.op,
                target = %pending.target,
                reason = %reason
            );
        }
        let _ = pending.tx.send(result);
    }

    /// Marks the session closed and fails every pending mutation.
    fn shut_down(&self) {
        self.open.store(false, Ordering::SeqCst);
        let drained: Vec<PendingMutation> = self.pending().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send(Err(RealtimeError::TransportUnavailable));
        }
    }
}

/// Top-level façade over one realtime connection.
pub struct RealtimeSession {
    shared: Arc<SessionShared>,
    dispatcher: JoinHandle<()>,
    closed: bool,
}

impl RealtimeSession {
    /// Opens a websocket connection and starts a session on it.
    pub async fn connect(client: &RealtimeClient) -> Result<Self, RealtimeError> {
        let connection = client.connect().await?;
        Ok(Self::from_connection(connection))
    }

    /// Starts a session on an established connection.
    ///
    /// Must be called from within a tokio runtime; the dispatcher runs as a
    /// spawned task.
    pub fn from_connection(connection: Connection) -> Self {
        let (sender, inbound) = connection.split();
        let shared = Arc::new(SessionShared::new(sender));
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), inbound));
        Self {
            shared,
            dispatcher,
            closed: false,
        }
    }

    /// Returns a reference to the collection named by `T::COLLECTION`.
    pub fn reference<T: Model>(&self) -> Result<Reference<T>, RealtimeError> {
        self.reference_named(T::COLLECTION)
    }

    /// Returns a reference to an explicitly named collection.
    ///
    /// Repeated calls hand out distinct references that observe the same
    /// broadcasts.
    pub fn reference_named<T: Model>(
        &self,
        collection: &str,
    ) -> Result<Reference<T>, RealtimeError> {
        if !self.shared.is_open() {
            return Err(RealtimeError::TransportUnavailable);
        }
        Ok(Reference::attach(
            Arc::clone(&self.shared),
            RefTarget::collection(collection),
            collection.to_string(),
            None,
        ))
    }

    /// Whether the underlying connection is still established.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Session id announced by the server's `hello_ok`, if one was seen.
    pub fn session_id(&self) -> Option<u64> {
        let id = self.shared.session_id.load(Ordering::Relaxed);
        (id != 0).then_some(id)
    }

    /// Sends a heartbeat ping with client timestamp.
    pub fn ping(&self, client_time_ms: u64) -> Result<(), RealtimeError> {
        self.shared.sender()?.ping(client_time_ms)
    }

    /// Number of reference instances currently attached.
    pub fn active_references(&self) -> usize {
        registry::lock(&self.shared.registry).active_references()
    }

    /// Number of open subscriptions across all references.
    pub fn subscription_count(&self) -> usize {
        registry::lock(&self.shared.registry).subscription_count()
    }

    /// Closes every subscription, fails pending mutations, and drops the
    /// connection.
    pub fn close(mut self) {
        self.tear_down();
    }

    fn tear_down(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.shut_down();
        let taken = registry::lock(&self.shared.registry).clear();
        let closed = registry::close_all(taken);
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.dispatcher.abort();
        debug!(event = "realtime_session_closed", subscriptions_closed = closed);
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.tear_down();
    }
}

async fn dispatch_loop(
    shared: Arc<SessionShared>,
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = inbound.recv().await {
        shared.apply_message(message);
    }
    shared.shut_down();
    let taken = registry::lock(&shared.registry).clear();
    let closed = registry::close_all(taken);
    debug!(event = "realtime_inbound_closed", subscriptions_closed = closed);
}
