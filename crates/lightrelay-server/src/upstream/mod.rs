//! The single connection to the light node.
//!
//! [`UpstreamLink`] owns the physical WebSocket and reconnects forever.
//! The router talks to it only through [`UpstreamSink`] and hears from it
//! only through [`LinkObserver`], so tests can stand in a fake upstream.

pub mod link;

pub use link::UpstreamLink;

use lightrelay_core::RelayResult;
use std::fmt;
use std::time::Duration;

/// Connection parameters for the light node.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// `ws://` or `wss://` URL of the node's RPC endpoint.
    pub endpoint: String,
    /// Sent as `Authorization: Bearer <token>`. Empty means no header.
    pub auth_token: String,
    /// Fixed wait between a close and the next connect attempt.
    pub reconnect_delay: Duration,
}

/// Physical connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Outbound side of the upstream, as seen by the router.
pub trait UpstreamSink: Send + Sync {
    /// Queue a frame for the upstream. Fails with
    /// [`RelayError::UpstreamUnavailable`](lightrelay_core::RelayError::UpstreamUnavailable)
    /// unless the link is open; never waits for it to become open.
    fn send(&self, frame: String) -> RelayResult<()>;

    /// Current connection state.
    fn state(&self) -> LinkState;
}

/// Consumer of upstream events. Registered once for the link's lifetime.
pub trait LinkObserver: Send + Sync {
    /// Called each time a physical connection opens, before the link accepts
    /// any other traffic. Returned frames are sent first, in order.
    fn on_opened(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called for every inbound text frame.
    fn on_message(&self, frame: &str);

    /// Called after a physical connection is gone.
    fn on_closed(&self) {}
}
