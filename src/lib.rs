//! Client SDK for model-relation backends with live collection references.
//!
//! The crate is organized by transport surface:
//! - `realtime`: websocket session handing out live references that can be
//!   subscribed to and mutated, with every committed change echoed back.
//! - `rest`: HTTP client for CRUD, relation sub-resources, and remote methods.
//! - `model`: record identity shared by both surfaces.

/// Record identity and the `Model` trait.
pub mod model;
/// Realtime references, subscriptions, and session.
pub mod realtime;
/// REST client, model APIs, and query filters.
pub mod rest;

pub use model::{Model, RecordId};
