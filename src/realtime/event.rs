//! Change events and the subscriptions that observe them.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::realtime::client::RealtimeError;
use crate::realtime::proto::{EventKind, RefTarget};
use crate::realtime::registry::{self, ReferenceId, SharedRegistry, SubscriptionSlot};

/// A committed change pushed by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub kind: EventKind,
    /// Collection (or parent-scoped child collection) the change applies to.
    pub target: RefTarget,
    /// Full record after the change; the last known state for removals.
    pub data: Value,
}

/// Subscribable stream of one event kind on one reference.
///
/// Returned by [`Reference::on`](crate::realtime::Reference::on). Every call
/// to [`subscribe`](Self::subscribe) creates an independent subscription
/// over the same broadcast.
pub struct EventStream<T> {
    registry: SharedRegistry,
    target: RefTarget,
    owner: ReferenceId,
    kind: EventKind,
    _record: PhantomData<fn() -> T>,
}

impl<T> EventStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        registry: SharedRegistry,
        target: RefTarget,
        owner: ReferenceId,
        kind: EventKind,
    ) -> Self {
        Self {
            registry,
            target,
            owner,
            kind,
            _record: PhantomData,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Registers `handler` for every matching change.
    ///
    /// Handlers run on the session's dispatcher task in arrival order and
    /// must not block it. Payloads that fail to decode as `T` are logged and
    /// skipped. Dropping the returned [`Subscription`] does not unsubscribe.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut handler = handler;
        let erased = Box::new(move |event: &ChangeEvent| {
            match serde_json::from_value::<T>(event.data.clone()) {
                Ok(record) => handler(record),
                Err(err) => warn!(
                    event = "change_payload_undecodable",
                    kind = %event.kind,
                    target = %event.target,
                    error = %err
                ),
            }
        });
        let slot =
            registry::lock(&self.registry).insert_slot(&self.target, self.owner, self.kind, erased);
        Subscription {
            registry: Arc::clone(&self.registry),
            target: self.target.clone(),
            slot,
        }
    }

    /// Subscribes through an unbounded channel instead of a callback.
    pub fn listen(&self) -> Listener<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |record| {
            let _ = tx.send(record);
        });
        Listener { subscription, rx }
    }
}

/// Handle for one registered handler.
pub struct Subscription {
    registry: SharedRegistry,
    target: RefTarget,
    slot: Arc<SubscriptionSlot>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.slot.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// Stops delivery to this subscription's handler.
    ///
    /// Takes effect before returning: no handler invocation starts
    /// afterwards. Safe to call from inside the handler itself.
    pub fn unsubscribe(&self) -> Result<(), RealtimeError> {
        if !self.slot.close() {
            return Err(RealtimeError::SubscriptionAlreadyClosed);
        }
        registry::lock(&self.registry).remove_slot(&self.target, self.slot.id());
        Ok(())
    }
}

/// Channel-backed subscription, convenient from async code.
///
/// Dropping a listener unsubscribes it.
pub struct Listener<T> {
    subscription: Subscription,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Listener<T> {
    /// Receives the next record, or `None` once the subscription is closed
    /// and every buffered record has been taken.
    ///
    /// A call already waiting when the subscription closes (through
    /// `unsubscribe`, `off`, `release`, or the session ending) returns
    /// `None` as well.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns a buffered record without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn unsubscribe(&self) -> Result<(), RealtimeError> {
        self.subscription.unsubscribe()
    }
}

impl<T> Drop for Listener<T> {
    fn drop(&mut self) {
        let _ = self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde::Deserialize;
    use serde_json::json;

    use super::{ChangeEvent, EventStream};
    use crate::realtime::client::RealtimeError;
    use crate::realtime::proto::{EventKind, RefTarget};
    use crate::realtime::registry::{self, Registry};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Room {
        id: i64,
        name: String,
    }

    fn dispatch(shared: &registry::SharedRegistry, event: &ChangeEvent) {
        let slots = registry::lock(shared).matching(&event.target, event.kind);
        for slot in slots {
            slot.deliver(event);
        }
    }

    fn room_added(name: &str) -> ChangeEvent {
        ChangeEvent {
            kind: EventKind::ChildAdded,
            target: RefTarget::collection("Room"),
            data: json!({ "id": 1, "name": name }),
        }
    }

    fn stream(shared: &registry::SharedRegistry) -> EventStream<Room> {
        let target = RefTarget::collection("Room");
        let owner = registry::lock(shared).attach(target.clone(), None);
        EventStream::new(Arc::clone(shared), target, owner, EventKind::ChildAdded)
    }

    #[test]
    fn subscribe_decodes_typed_records() {
        let shared = Registry::shared();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = stream(&shared).subscribe(move |room: Room| {
            sink.lock().expect("lock").push(room);
        });

        dispatch(&shared, &room_added("lobby"));
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![Room {
                id: 1,
                name: "lobby".to_string()
            }]
        );
    }

    #[test]
    fn undecodable_payload_is_skipped() {
        let shared = Registry::shared();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _subscription = stream(&shared).subscribe(move |_room: Room| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut event = room_added("lobby");
        event.data = json!({ "name": 5 });
        dispatch(&shared, &event);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn second_unsubscribe_reports_already_closed() {
        let shared = Registry::shared();
        let subscription = stream(&shared).subscribe(|_room: Room| {});

        subscription.unsubscribe().expect("first unsubscribe");
        assert!(matches!(
            subscription.unsubscribe(),
            Err(RealtimeError::SubscriptionAlreadyClosed)
        ));
        assert_eq!(registry::lock(&shared).subscription_count(), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let shared = Registry::shared();
        let calls = Arc::new(AtomicUsize::new(0));
        let holder: Arc<Mutex<Option<super::Subscription>>> = Arc::new(Mutex::new(None));

        let counter = Arc::clone(&calls);
        let inner = Arc::clone(&holder);
        let subscription = stream(&shared).subscribe(move |_room: Room| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(subscription) = inner.lock().expect("lock").as_ref() {
                subscription.unsubscribe().expect("unsubscribe from handler");
            }
        });
        *holder.lock().expect("lock") = Some(subscription);

        dispatch(&shared, &room_added("a"));
        dispatch(&shared, &room_added("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_a_listener_unsubscribes() {
        let shared = Registry::shared();
        let listener = stream(&shared).listen();
        assert_eq!(registry::lock(&shared).subscription_count(), 1);
        drop(listener);
        assert_eq!(registry::lock(&shared).subscription_count(), 0);
    }

    #[tokio::test]
    async fn waiting_listener_wakes_when_unsubscribed() {
        let shared = Registry::shared();
        let mut listener = stream(&shared).listen();
        dispatch(&shared, &room_added("buffered"));
        let subscription = Arc::clone(&listener.subscription.slot);

        let waiter = tokio::spawn(async move {
            let first = listener.recv().await.map(|room| room.name);
            let second = listener.recv().await;
            (first, second)
        });
        tokio::task::yield_now().await;
        assert!(subscription.close());

        let (first, second) = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("listener should wake")
            .expect("join");
        assert_eq!(first, Some("buffered".to_string()));
        assert!(second.is_none());
    }

    #[test]
    fn listener_buffers_until_read() {
        let shared = Registry::shared();
        let mut listener = stream(&shared).listen();
        dispatch(&shared, &room_added("first"));
        dispatch(&shared, &room_added("second"));

        assert_eq!(listener.try_recv().map(|room| room.name), Some("first".to_string()));
        assert_eq!(listener.try_recv().map(|room| room.name), Some("second".to_string()));
        assert!(listener.try_recv().is_none());
    }
}
