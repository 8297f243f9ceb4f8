//! Correlation table: which session is waiting for which upstream response.
//!
//! Each key maps to a FIFO of slots in forwarding order. The front slot is the
//! key's current owner and receives the next upstream message carrying the
//! key. A slot whose session disconnected or timed out stays in place as an
//! orphan, so the late response it was waiting for is swallowed instead of
//! reaching whoever claimed the same key next.

use crate::session::SessionId;
use lightrelay_core::CorrelationKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Who a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Session(SessionId),
    /// Nobody: the response for this slot is dropped when it arrives.
    Orphaned,
}

#[derive(Debug, Clone)]
struct Slot {
    ticket: u64,
    owner: Owner,
    /// When the slot was claimed, or when it was orphaned.
    since: Instant,
}

/// Handle for one claim, used to expire or withdraw exactly that claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: CorrelationKey,
    pub ticket: u64,
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    slots: HashMap<CorrelationKey, VecDeque<Slot>>,
    /// Keys each session has in flight.
    pending: HashMap<SessionId, HashSet<CorrelationKey>>,
    next_ticket: u64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session` is waiting for a response carrying `key`.
    pub fn claim(&mut self, key: CorrelationKey, session: SessionId) -> Claim {
        self.pending
            .entry(session)
            .or_default()
            .insert(key.clone());
        self.push(key, Owner::Session(session))
    }

    /// Reserve a slot whose response nobody should receive.
    pub fn claim_orphan(&mut self, key: CorrelationKey) -> Claim {
        self.push(key, Owner::Orphaned)
    }

    fn push(&mut self, key: CorrelationKey, owner: Owner) -> Claim {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.slots.entry(key.clone()).or_default().push_back(Slot {
            ticket,
            owner,
            since: Instant::now(),
        });
        Claim { key, ticket }
    }

    /// Pop the current owner of `key`. `None` means the key is unknown.
    pub fn resolve(&mut self, key: &CorrelationKey) -> Option<Owner> {
        let queue = self.slots.get_mut(key)?;
        let slot = queue.pop_front()?;
        if queue.is_empty() {
            self.slots.remove(key);
        }
        if let Owner::Session(session) = slot.owner {
            self.forget_if_done(session, key);
        }
        Some(slot.owner)
    }

    /// Withdraw a claim whose request never reached the upstream.
    pub fn cancel(&mut self, claim: &Claim) {
        if let Some(slot) = self.take(claim) {
            if let Owner::Session(session) = slot.owner {
                self.forget_if_done(session, &claim.key);
            }
        }
    }

    /// Orphan a claim that waited too long. Returns the session that owned
    /// it, or `None` if the claim was already answered or released.
    pub fn expire(&mut self, claim: &Claim) -> Option<SessionId> {
        let slot = self
            .slots
            .get_mut(&claim.key)?
            .iter_mut()
            .find(|s| s.ticket == claim.ticket)?;
        let Owner::Session(session) = slot.owner else {
            return None;
        };
        slot.owner = Owner::Orphaned;
        slot.since = Instant::now();
        self.forget_if_done(session, &claim.key);
        Some(session)
    }

    /// Orphan every slot owned by `session`. Returns how many were pending.
    pub fn release_session(&mut self, session: SessionId) -> usize {
        let Some(keys) = self.pending.remove(&session) else {
            return 0;
        };
        let now = Instant::now();
        let mut released = 0;
        for key in keys {
            if let Some(queue) = self.slots.get_mut(&key) {
                for slot in queue.iter_mut() {
                    if slot.owner == Owner::Session(session) {
                        slot.owner = Owner::Orphaned;
                        slot.since = now;
                        released += 1;
                    }
                }
            }
        }
        released
    }

    /// Drop orphaned slots older than `max_age`. Returns how many were removed.
    pub fn sweep_orphans(&mut self, max_age: Duration) -> usize {
        let mut removed = 0;
        self.slots.retain(|_, queue| {
            queue.retain(|slot| {
                let stale = slot.owner == Owner::Orphaned && slot.since.elapsed() >= max_age;
                if stale {
                    removed += 1;
                }
                !stale
            });
            !queue.is_empty()
        });
        removed
    }

    /// Empty the table after the upstream connection is lost. Responses to
    /// anything sent on the old connection will never arrive, so every slot
    /// goes, orphans included. Returns the live claims in forwarding order so
    /// their owners can be told.
    pub fn reset(&mut self) -> Vec<(SessionId, CorrelationKey)> {
        let mut live: Vec<(u64, SessionId, CorrelationKey)> = Vec::new();
        for (key, queue) in self.slots.drain() {
            for slot in queue {
                if let Owner::Session(session) = slot.owner {
                    live.push((slot.ticket, session, key.clone()));
                }
            }
        }
        self.pending.clear();
        live.sort_by_key(|(ticket, _, _)| *ticket);
        live.into_iter()
            .map(|(_, session, key)| (session, key))
            .collect()
    }

    /// Number of keys `session` is waiting on.
    #[cfg(test)]
    pub fn pending_for(&self, session: SessionId) -> usize {
        self.pending.get(&session).map_or(0, HashSet::len)
    }

    /// Total slots across all keys.
    pub fn len(&self) -> usize {
        self.slots.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn take(&mut self, claim: &Claim) -> Option<Slot> {
        let queue = self.slots.get_mut(&claim.key)?;
        let pos = queue.iter().position(|s| s.ticket == claim.ticket)?;
        let slot = queue.remove(pos);
        if queue.is_empty() {
            self.slots.remove(&claim.key);
        }
        slot
    }

    /// Drop `key` from the session's pending set once no slot of it remains.
    fn forget_if_done(&mut self, session: SessionId, key: &CorrelationKey) {
        let still_waiting = self
            .slots
            .get(key)
            .is_some_and(|q| q.iter().any(|s| s.owner == Owner::Session(session)));
        if still_waiting {
            return;
        }
        if let Some(keys) = self.pending.get_mut(&session) {
            keys.remove(key);
            if keys.is_empty() {
                self.pending.remove(&session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(v: serde_json::Value) -> CorrelationKey {
        CorrelationKey::from_value(&v).unwrap()
    }

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    #[test]
    fn resolve_is_at_most_once() {
        let mut t = CorrelationTable::new();
        t.claim(key(json!(1)), A);
        assert_eq!(t.pending_for(A), 1);
        assert_eq!(t.resolve(&key(json!(1))), Some(Owner::Session(A)));
        assert_eq!(t.resolve(&key(json!(1))), None);
        assert_eq!(t.pending_for(A), 0);
        assert!(t.is_empty());
    }

    #[test]
    fn unknown_key_resolves_to_none() {
        let mut t = CorrelationTable::new();
        t.claim(key(json!(1)), A);
        assert_eq!(t.resolve(&key(json!("1"))), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn same_key_from_two_sessions_is_served_in_order() {
        let mut t = CorrelationTable::new();
        t.claim(key(json!(1)), A);
        t.claim(key(json!(1)), B);
        assert_eq!(t.resolve(&key(json!(1))), Some(Owner::Session(A)));
        assert_eq!(t.resolve(&key(json!(1))), Some(Owner::Session(B)));
    }

    #[test]
    fn released_session_leaves_tombstones() {
        let mut t = CorrelationTable::new();
        t.claim(key(json!(1)), A);
        t.claim(key(json!(2)), A);
        assert_eq!(t.release_session(A), 2);
        assert_eq!(t.pending_for(A), 0);

        // B reuses key 1 after A left: A's late response must not reach B.
        t.claim(key(json!(1)), B);
        assert_eq!(t.resolve(&key(json!(1))), Some(Owner::Orphaned));
        assert_eq!(t.resolve(&key(json!(1))), Some(Owner::Session(B)));
    }

    #[test]
    fn release_unknown_session_is_noop() {
        let mut t = CorrelationTable::new();
        assert_eq!(t.release_session(A), 0);
    }

    #[test]
    fn cancel_withdraws_only_that_claim() {
        let mut t = CorrelationTable::new();
        let first = t.claim(key(json!(5)), A);
        t.claim(key(json!(5)), A);
        t.cancel(&first);
        assert_eq!(t.len(), 1);
        assert_eq!(t.pending_for(A), 1);
        assert_eq!(t.resolve(&key(json!(5))), Some(Owner::Session(A)));
        assert_eq!(t.pending_for(A), 0);
    }

    #[test]
    fn expire_orphans_pending_claim() {
        let mut t = CorrelationTable::new();
        let claim = t.claim(key(json!("q")), A);
        assert_eq!(t.expire(&claim), Some(A));
        assert_eq!(t.pending_for(A), 0);
        // Second expiry of the same claim is a no-op.
        assert_eq!(t.expire(&claim), None);
        assert_eq!(t.resolve(&key(json!("q"))), Some(Owner::Orphaned));
    }

    #[test]
    fn expire_after_answer_is_noop() {
        let mut t = CorrelationTable::new();
        let claim = t.claim(key(json!(9)), A);
        t.resolve(&key(json!(9)));
        assert_eq!(t.expire(&claim), None);
        assert!(t.is_empty());
    }

    #[test]
    fn sweep_removes_old_orphans_only() {
        let mut t = CorrelationTable::new();
        t.claim(key(json!(1)), A);
        t.claim(key(json!(2)), B);
        t.claim_orphan(key(json!(3)));
        t.release_session(A);

        assert_eq!(t.sweep_orphans(Duration::ZERO), 2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.resolve(&key(json!(2))), Some(Owner::Session(B)));
    }

    #[test]
    fn sweep_keeps_fresh_orphans() {
        let mut t = CorrelationTable::new();
        t.claim_orphan(key(json!(1)));
        assert_eq!(t.sweep_orphans(Duration::from_secs(300)), 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn reset_returns_live_claims_and_drops_orphans() {
        let mut t = CorrelationTable::new();
        let expired = t.claim(key(json!(7)), B);
        t.claim(key(json!(1)), A);
        t.claim_orphan(key(json!(2)));
        t.claim(key(json!(1)), B);
        t.expire(&expired);

        assert_eq!(
            t.reset(),
            vec![(A, key(json!(1))), (B, key(json!(1)))]
        );
        assert!(t.is_empty());
        assert_eq!(t.pending_for(A), 0);
        assert_eq!(t.pending_for(B), 0);

        // A timer firing for a claim from before the reset finds nothing.
        assert_eq!(t.expire(&expired), None);
        assert_eq!(t.resolve(&key(json!(1))), None);
    }
}
