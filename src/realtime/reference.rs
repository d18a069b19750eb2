//! Typed handles bound to remote collections.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::model::{Model, RecordId};
use crate::realtime::client::RealtimeError;
use crate::realtime::event::EventStream;
use crate::realtime::proto::{EventKind, MutationOp, RefTarget};
use crate::realtime::registry::{self, ReferenceId};
use crate::realtime::session::SessionShared;

/// Live handle to a remote collection or a parent-scoped child collection.
///
/// Each instance owns the subscriptions created through it. Broadcasts reach
/// every subscription registered for the same target, whichever instance
/// created it. Dropping a reference leaves its subscriptions running; call
/// [`release`](Self::release) to close them. A dropped reference is forgotten
/// once its last subscription and derived child are gone.
pub struct Reference<T> {
    shared: Arc<SessionShared>,
    target: RefTarget,
    model: String,
    id: ReferenceId,
    _record: PhantomData<fn() -> T>,
}

impl<T: Model> Reference<T> {
    pub(crate) fn attach(
        shared: Arc<SessionShared>,
        target: RefTarget,
        model: String,
        parent: Option<ReferenceId>,
    ) -> Self {
        let id = registry::lock(&shared.registry).attach(target.clone(), parent);
        Self {
            shared,
            target,
            model,
            id,
            _record: PhantomData,
        }
    }

    /// Target this reference routes mutations and broadcasts through.
    pub fn target(&self) -> &RefTarget {
        &self.target
    }

    /// Model name of the records this reference holds.
    pub fn collection(&self) -> &str {
        &self.model
    }

    pub fn is_child(&self) -> bool {
        self.target.parent.is_some()
    }

    /// Returns a subscribable stream for `kind`.
    pub fn on(&self, kind: EventKind) -> EventStream<T> {
        EventStream::new(
            Arc::clone(&self.shared.registry),
            self.target.clone(),
            self.id,
            kind,
        )
    }

    /// Creates `record` on the backend.
    ///
    /// The request is sent before this returns. The result arrives both here
    /// and, as `child_added`, on every matching subscription including the
    /// caller's own; the two deliveries are not ordered relative to each
    /// other.
    pub fn create(&self, record: &T) -> Pending<T> {
        self.mutate(MutationOp::Create, record, decode_record::<T>)
    }

    /// Updates (or inserts) an identified record.
    pub fn upsert(&self, record: &T) -> Pending<T> {
        if record.id().is_none() {
            return Pending::failed(RealtimeError::MissingIdentifier);
        }
        self.mutate(MutationOp::Upsert, record, decode_record::<T>)
    }

    /// Removes an identified record.
    pub fn remove(&self, record: &T) -> Pending<()> {
        if record.id().is_none() {
            return Pending::failed(RealtimeError::MissingIdentifier);
        }
        self.mutate(MutationOp::Remove, record, |_| Ok(()))
    }

    /// Binds an already created `parent` record as scope for a child lookup.
    pub fn make(&self, parent: &T) -> Result<PartialReference, RealtimeError> {
        let parent_id = parent.id().cloned().ok_or(RealtimeError::MissingIdentifier)?;
        Ok(PartialReference {
            shared: Arc::clone(&self.shared),
            collection: self.model.clone(),
            parent_id,
            parent_ref: self.id,
        })
    }

    /// Closes this instance's subscriptions of one kind.
    pub fn off(&self, kind: EventKind) -> usize {
        let taken = registry::lock(&self.shared.registry).take_kind(self.id, kind);
        registry::close_all(taken)
    }

    /// Closes every subscription of this instance and of the child
    /// references derived from it. Returns how many were closed.
    pub fn release(self) -> usize {
        let taken = registry::lock(&self.shared.registry).release(self.id);
        registry::close_all(taken)
    }

    fn mutate<R>(
        &self,
        op: MutationOp,
        record: &T,
        decode: fn(Value) -> Result<R, RealtimeError>,
    ) -> Pending<R> {
        let data = match serde_json::to_value(record) {
            Ok(data) => data,
            Err(err) => return Pending::failed(err.into()),
        };
        match self.shared.submit(op, self.target.clone(), data) {
            Ok(rx) => Pending::waiting(rx, decode),
            Err(err) => Pending::failed(err),
        }
    }
}

impl<T> Drop for Reference<T> {
    fn drop(&mut self) {
        registry::lock(&self.shared.registry).detach(self.id);
    }
}

/// A reference bound to one parent record, waiting for a relation name.
pub struct PartialReference {
    shared: Arc<SessionShared>,
    collection: String,
    parent_id: RecordId,
    parent_ref: ReferenceId,
}

impl PartialReference {
    pub fn parent_id(&self) -> &RecordId {
        &self.parent_id
    }

    /// Returns a reference to the `relation` child collection of the parent.
    ///
    /// Mutations travel with the parent scope and broadcasts only reach
    /// subscribers of this exact (parent, relation) pair.
    pub fn child<U: Model>(&self, relation: &str) -> Reference<U> {
        let target = RefTarget::child(self.collection.clone(), self.parent_id.clone(), relation);
        Reference::attach(
            Arc::clone(&self.shared),
            target,
            U::COLLECTION.to_string(),
            Some(self.parent_ref),
        )
    }
}

fn decode_record<T: DeserializeOwned>(data: Value) -> Result<T, RealtimeError> {
    serde_json::from_value(data).map_err(RealtimeError::Json)
}

/// Single-value result of a mutation.
///
/// Resolves exactly once. Dropping it discards the result; the mutation
/// itself is not cancelled.
#[must_use = "a pending mutation reports its outcome only when awaited"]
pub struct Pending<T> {
    state: PendingState,
    decode: fn(Value) -> Result<T, RealtimeError>,
}

enum PendingState {
    Failed(Option<RealtimeError>),
    Waiting(oneshot::Receiver<Result<Value, RealtimeError>>),
}

impl<T> Pending<T> {
    fn failed(err: RealtimeError) -> Self {
        Self {
            state: PendingState::Failed(Some(err)),
            decode: |_| Err(RealtimeError::TransportUnavailable),
        }
    }

    fn waiting(
        rx: oneshot::Receiver<Result<Value, RealtimeError>>,
        decode: fn(Value) -> Result<T, RealtimeError>,
    ) -> Self {
        Self {
            state: PendingState::Waiting(rx),
            decode,
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, RealtimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            PendingState::Failed(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or(RealtimeError::TransportUnavailable))),
            PendingState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(Ok(data))) => Poll::Ready((this.decode)(data)),
                Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
                Poll::Ready(Err(_)) => Poll::Ready(Err(RealtimeError::TransportUnavailable)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
