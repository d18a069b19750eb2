//! Arena of live references and the subscriptions they own.
//!
//! References are indexed by their [`RefTarget`]. A child reference stores
//! only the id of the reference it was derived from, so releasing a parent
//! walks the arena instead of following owning pointers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::realtime::event::ChangeEvent;
use crate::realtime::proto::{EventKind, RefTarget};

pub(crate) type ReferenceId = u64;
pub(crate) type SubscriptionId = u64;
pub(crate) type ErasedHandler = Box<dyn FnMut(&ChangeEvent) + Send>;
pub(crate) type SharedRegistry = Arc<Mutex<Registry>>;

/// Slots removed from the registry that still have to be closed.
///
/// Closing drops handlers, and a handler may own a reference whose `Drop`
/// takes the registry lock, so callers close these after unlocking.
pub(crate) type DetachedSlots = Vec<Arc<SubscriptionSlot>>;

pub(crate) fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Closes `slots`, returning how many were still open.
pub(crate) fn close_all(slots: DetachedSlots) -> usize {
    slots.iter().filter(|slot| slot.close()).count()
}

/// One handler bound to a (reference instance, event kind) pair.
///
/// Closing a slot drops its handler, and with it whatever the handler owns
/// (a listener's channel sender, for one). A handler that is running when
/// the slot closes is dropped as soon as that delivery returns.
pub(crate) struct SubscriptionSlot {
    id: SubscriptionId,
    owner: ReferenceId,
    kind: EventKind,
    closed: AtomicBool,
    handler: Mutex<Option<ErasedHandler>>,
}

impl SubscriptionSlot {
    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn kind(&self) -> EventKind {
        self.kind
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the slot closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // A held lock means a delivery is in flight, possibly the very
        // handler calling us; `deliver` drops the handler once it returns.
        let stale = match self.handler.try_lock() {
            Ok(mut handler) => handler.take(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
            Err(TryLockError::WouldBlock) => None,
        };
        drop(stale);
        true
    }

    /// Runs the handler unless the slot was closed before the call started.
    pub(crate) fn deliver(&self, event: &ChangeEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        let delivered = {
            let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
            match handler.as_mut() {
                Some(handler) if !self.is_closed() => {
                    handler(event);
                    true
                }
                _ => false,
            }
        };
        if self.is_closed() {
            let stale = self.handler.lock().unwrap_or_else(PoisonError::into_inner).take();
            drop(stale);
        }
        delivered
    }
}

#[derive(Default)]
struct RefEntry {
    members: HashSet<ReferenceId>,
    slots: Vec<Arc<SubscriptionSlot>>,
}

impl RefEntry {
    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.slots.is_empty()
    }
}

struct Instance {
    target: RefTarget,
    parent: Option<ReferenceId>,
    /// The handle was dropped; the instance lives on only while it still
    /// owns subscriptions or derived children.
    dropped: bool,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<RefTarget, RefEntry>,
    instances: HashMap<ReferenceId, Instance>,
    next_reference: ReferenceId,
    next_subscription: SubscriptionId,
}

impl Registry {
    pub(crate) fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Registers a new reference instance bound to `target`.
    pub(crate) fn attach(
        &mut self,
        target: RefTarget,
        parent: Option<ReferenceId>,
    ) -> ReferenceId {
        self.next_reference += 1;
        let id = self.next_reference;
        self.entries
            .entry(target.clone())
            .or_default()
            .members
            .insert(id);
        self.instances.insert(
            id,
            Instance {
                target,
                parent,
                dropped: false,
            },
        );
        id
    }

    pub(crate) fn insert_slot(
        &mut self,
        target: &RefTarget,
        owner: ReferenceId,
        kind: EventKind,
        handler: ErasedHandler,
    ) -> Arc<SubscriptionSlot> {
        self.next_subscription += 1;
        let slot = Arc::new(SubscriptionSlot {
            id: self.next_subscription,
            owner,
            kind,
            closed: AtomicBool::new(false),
            handler: Mutex::new(Some(handler)),
        });
        self.entries
            .entry(target.clone())
            .or_default()
            .slots
            .push(Arc::clone(&slot));
        slot
    }

    pub(crate) fn remove_slot(&mut self, target: &RefTarget, id: SubscriptionId) -> bool {
        let Some(entry) = self.entries.get_mut(target) else {
            return false;
        };
        let Some(owner) = entry
            .slots
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| slot.owner)
        else {
            return false;
        };
        entry.slots.retain(|slot| slot.id != id);
        self.prune(target);
        self.collect(owner);
        true
    }

    /// Open slots that should observe a change of `kind` on `target`.
    ///
    /// Routing is by exact target: a child change never reaches a reference
    /// scoped to another parent, and a top-level change reaches every
    /// reference bound to that collection.
    pub(crate) fn matching(
        &self,
        target: &RefTarget,
        kind: EventKind,
    ) -> Vec<Arc<SubscriptionSlot>> {
        self.entries
            .get(target)
            .map(|entry| {
                entry
                    .slots
                    .iter()
                    .filter(|slot| slot.kind == kind && !slot.is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes every slot `owner` holds for `kind`.
    pub(crate) fn take_kind(&mut self, owner: ReferenceId, kind: EventKind) -> DetachedSlots {
        let Some(target) = self
            .instances
            .get(&owner)
            .map(|instance| instance.target.clone())
        else {
            return Vec::new();
        };
        let taken =
            self.take_slots_where(&target, |slot| slot.owner == owner && slot.kind == kind);
        self.prune(&target);
        self.collect(owner);
        taken
    }

    /// Records that the handle for `id` was dropped and forgets the instance
    /// once nothing depends on it.
    pub(crate) fn detach(&mut self, id: ReferenceId) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        instance.dropped = true;
        self.collect(id);
    }

    /// Forgets `owner` and every reference derived from it, handing back
    /// their slots.
    pub(crate) fn release(&mut self, owner: ReferenceId) -> DetachedSlots {
        let mut doomed = Vec::new();
        let mut queue = VecDeque::from([owner]);
        while let Some(id) = queue.pop_front() {
            if !self.instances.contains_key(&id) || doomed.contains(&id) {
                continue;
            }
            doomed.push(id);
            queue.extend(
                self.instances
                    .iter()
                    .filter(|(_, instance)| instance.parent == Some(id))
                    .map(|(child, _)| *child),
            );
        }

        let mut taken = Vec::new();
        let mut ancestor = None;
        for id in doomed {
            let Some(instance) = self.instances.remove(&id) else {
                continue;
            };
            if id == owner {
                ancestor = instance.parent;
            }
            taken.extend(self.take_slots_where(&instance.target, |slot| slot.owner == id));
            if let Some(entry) = self.entries.get_mut(&instance.target) {
                entry.members.remove(&id);
            }
            self.prune(&instance.target);
        }
        if let Some(ancestor) = ancestor {
            self.collect(ancestor);
        }
        taken
    }

    /// Forgets every reference, handing back every slot.
    pub(crate) fn clear(&mut self) -> DetachedSlots {
        self.instances.clear();
        self.entries
            .drain()
            .flat_map(|(_, entry)| entry.slots)
            .collect()
    }

    pub(crate) fn active_references(&self) -> usize {
        self.instances.len()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.entries.values().map(|entry| entry.slots.len()).sum()
    }

    fn take_slots_where<F>(&mut self, target: &RefTarget, pred: F) -> DetachedSlots
    where
        F: Fn(&SubscriptionSlot) -> bool,
    {
        let Some(entry) = self.entries.get_mut(target) else {
            return Vec::new();
        };
        let (taken, kept): (DetachedSlots, DetachedSlots) = entry
            .slots
            .drain(..)
            .partition(|slot| pred(slot.as_ref()));
        entry.slots = kept;
        taken
    }

    /// Forgets `id` if its handle is gone and it owns no subscriptions or
    /// children, then retries with its parent.
    fn collect(&mut self, id: ReferenceId) {
        let mut next = Some(id);
        while let Some(id) = next {
            let (target, parent) = match self.instances.get(&id) {
                Some(instance) if instance.dropped => (instance.target.clone(), instance.parent),
                _ => return,
            };
            let owns_slots = self
                .entries
                .get(&target)
                .is_some_and(|entry| entry.slots.iter().any(|slot| slot.owner == id));
            let has_children = self
                .instances
                .values()
                .any(|instance| instance.parent == Some(id));
            if owns_slots || has_children {
                return;
            }

            self.instances.remove(&id);
            if let Some(entry) = self.entries.get_mut(&target) {
                entry.members.remove(&id);
            }
            self.prune(&target);
            next = parent;
        }
    }

    fn prune(&mut self, target: &RefTarget) {
        if self.entries.get(target).is_some_and(RefEntry::is_empty) {
            self.entries.remove(target);
        }
    }
}
