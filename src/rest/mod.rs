//! REST modules.
//!
//! - `client`: HTTP client and per-model CRUD, relation, and remote-method
//!   access.
//! - `filter`: query filters with nested relation inclusion.

/// HTTP client and model APIs.
pub mod client;
/// Query filter builders.
pub mod filter;

pub use client::{ModelApi, RestClient, RestClientOptions, RestDefaults, RestError, UpdateCount};
pub use filter::{Filter, Include};
