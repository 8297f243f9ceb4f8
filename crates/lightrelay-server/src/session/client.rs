//! Per-client session state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frames a session may have queued before it is treated as a stalled reader.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Process-lifetime-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// One authenticated client connection.
///
/// The socket itself is owned by the connection task; the session holds the
/// sending half of that task's bounded outbound queue, so a frame delivered
/// here is written to the socket in delivery order. When the queue fills up
/// the sender is dropped: the connection task drains what is queued, sees
/// the queue end and closes the client.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    /// Fingerprint of the API key the client authenticated with.
    key_fingerprint: String,
    remote_addr: SocketAddr,
    /// `None` once the session was evicted for not keeping up.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// Last subscribe-style message sent upstream, replayed after reconnect.
    last_subscription: Mutex<Option<String>>,
    connected_at: Instant,
}

impl ClientSession {
    pub fn new(
        id: SessionId,
        key_fingerprint: String,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            key_fingerprint,
            remote_addr,
            outbound: Mutex::new(Some(outbound)),
            last_subscription: Mutex::new(None),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key_fingerprint(&self) -> &str {
        &self.key_fingerprint
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }

    /// Queue a frame for the client without waiting. Returns `false` if the
    /// connection is gone or the frame did not fit, in which case the session
    /// is evicted.
    pub fn deliver(&self, frame: String) -> bool {
        let mut outbound = self.lock_outbound();
        let Some(tx) = outbound.as_ref() else {
            debug!(session = %self.id, "dropping frame for evicted session");
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    session = %self.id,
                    capacity = OUTBOUND_QUEUE_CAPACITY,
                    "outbound queue full, evicting client"
                );
                *outbound = None;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %self.id, "dropping frame for closed session");
                false
            }
        }
    }

    /// Whether the session stopped accepting frames because its queue filled up.
    pub fn is_evicted(&self) -> bool {
        self.lock_outbound().is_none()
    }

    /// Remember `raw` as this session's subscription.
    pub fn set_last_subscription(&self, raw: String) {
        *self.lock_subscription() = Some(raw);
    }

    pub fn last_subscription(&self) -> Option<String> {
        self.lock_subscription().clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock_subscription().is_some()
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        // The guarded value is a plain Option; a poisoned lock still holds a usable one.
        self.last_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
