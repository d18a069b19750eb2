//! Realtime reference modules.
//!
//! - `client`: websocket transport and outbound message sender.
//! - `proto`: protocol messages shared with the realtime service.
//! - `event`: change events, subscriptions, and channel listeners.
//! - `registry`: arena of live references and their subscriptions.
//! - `reference`: typed collection handles and pending mutation results.
//! - `session`: connection owner and inbound dispatcher.

/// Websocket connection and message sender.
pub mod client;
/// Change events and subscriptions.
pub mod event;
/// Realtime protocol messages.
pub mod proto;
/// Typed references to remote collections.
pub mod reference;
mod registry;
/// Session façade over one connection.
pub mod session;

pub use client::{Connection, ConnectionStatus, RealtimeClient, RealtimeError, RealtimeSender};
pub use event::{ChangeEvent, EventStream, Listener, Subscription};
pub use proto::{EventKind, RefTarget};
pub use reference::{PartialReference, Pending, Reference};
pub use session::RealtimeSession;
