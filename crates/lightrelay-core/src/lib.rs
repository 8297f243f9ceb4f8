//! lightrelay-core: Shared protocol library for the light node relay.
//!
//! Provides the gateway's error taxonomy, the client-facing error codes,
//! JSON-RPC correlation-key extraction, correlated response framing, and
//! API key fingerprints for logging.

pub mod error;
pub mod frame;
pub mod identity;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use frame::{
    correlated_response, error_frame, request_error_frame, CorrelationKey, ErrorCode, RpcFrame,
};
pub use identity::key_fingerprint;
