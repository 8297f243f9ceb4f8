//! Registry of connected client sessions.
//!
//! Single source of truth for "who is connected": the router reaches a
//! session only through this map, and the server removes the entry before
//! the socket task finishes tearing down.

use super::client::{ClientSession, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Summary of a session for logging and status output.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub key_fingerprint: String,
    pub remote_addr: SocketAddr,
    pub connected_secs: u64,
    pub subscribed: bool,
}

/// Registry of connected sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<ClientSession>>>,
    /// Monotonic session ID counter.
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create and insert a session for an authenticated connection.
    pub fn register(
        &self,
        key_fingerprint: String,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<String>,
    ) -> Arc<ClientSession> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(ClientSession::new(id, key_fingerprint, remote_addr, outbound));

        let count = {
            let mut sessions = self.lock();
            sessions.insert(id, session.clone());
            sessions.len()
        };

        info!(
            session = %id,
            key = %session.key_fingerprint(),
            remote = %remote_addr,
            active = count,
            "session registered"
        );
        session
    }

    /// Remove a session. Returns it if it was present.
    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            debug!(session = %id, "session removed");
        }
        removed
    }

    /// Look up a live session.
    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.lock().get(&id).cloned()
    }

    /// Every session that has a subscription on record.
    pub fn subscribers(&self) -> Vec<Arc<ClientSession>> {
        self.lock()
            .values()
            .filter(|s| s.is_subscribed())
            .cloned()
            .collect()
    }

    /// Subscription messages to resend after the upstream reconnects,
    /// paired with the session they belong to.
    pub fn replay_frames(&self) -> Vec<(SessionId, String)> {
        let mut frames: Vec<(SessionId, String)> = self
            .lock()
            .values()
            .filter_map(|s| s.last_subscription().map(|raw| (s.id(), raw)))
            .collect();
        // Oldest sessions resubscribe first.
        frames.sort_by_key(|(id, _)| *id);
        frames
    }

    /// List all registered sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.lock()
            .values()
            .map(|s| SessionInfo {
                id: s.id(),
                key_fingerprint: s.key_fingerprint().to_string(),
                remote_addr: s.remote_addr(),
                connected_secs: s.connected_secs(),
                subscribed: s.is_subscribed(),
            })
            .collect()
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<ClientSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn register_assigns_unique_ids() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = reg.register("a".into(), addr(), tx.clone());
        let b = reg.register("b".into(), addr(), tx);
        assert_ne!(a.id(), b.id());
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn removed_session_is_unreachable() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let s = reg.register("a".into(), addr(), tx);
        assert!(reg.get(s.id()).is_some());
        assert!(reg.remove(s.id()).is_some());
        assert!(reg.get(s.id()).is_none());
        assert!(reg.remove(s.id()).is_none());
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let first = reg.register("a".into(), addr(), tx.clone()).id();
        reg.remove(first);
        let second = reg.register("a".into(), addr(), tx).id();
        assert_ne!(first, second);
    }

    #[test]
    fn subscribers_and_replay_frames() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = reg.register("a".into(), addr(), tx.clone());
        let b = reg.register("b".into(), addr(), tx.clone());
        let _c = reg.register("c".into(), addr(), tx);

        b.set_last_subscription("sub-b".into());
        a.set_last_subscription("sub-a".into());

        let subs: Vec<SessionId> = {
            let mut ids: Vec<_> = reg.subscribers().iter().map(|s| s.id()).collect();
            ids.sort();
            ids
        };
        assert_eq!(subs, vec![a.id(), b.id()]);

        let frames = reg.replay_frames();
        assert_eq!(
            frames,
            vec![(a.id(), "sub-a".to_string()), (b.id(), "sub-b".to_string())]
        );
    }

    #[test]
    fn list_reports_subscription_state() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let s = reg.register("fp".into(), addr(), tx);
        s.set_last_subscription("sub".into());
        let list = reg.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].key_fingerprint, "fp");
        assert!(list[0].subscribed);
    }
}
