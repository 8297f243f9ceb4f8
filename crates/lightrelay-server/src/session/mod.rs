//! Client sessions and the registry of who is connected.
//!
//! - `client`: per-connection state (identity, outbound queue, last subscription)
//! - `registry`: session id to session map, used for fan-out and cleanup

pub mod client;
pub mod registry;

pub use client::{ClientSession, SessionId, OUTBOUND_QUEUE_CAPACITY};
pub use registry::SessionRegistry;
