//! Multiplexing between client sessions and the upstream link.
//!
//! Client → upstream goes through [`Router::forward`]: restart check, parse,
//! subscription capture, correlation claim, send. Upstream → client goes
//! through [`Router::dispatch`]: a frame whose key has an owner goes to that
//! owner only, and a frame for an orphaned key is dropped. A frame with no
//! known key is a push and goes to every subscribed session.
//!
//! # Locking
//!
//! The registry and the correlation table each sit behind one mutex, held
//! only for a lookup or update and never while calling into the upstream
//! link or a session's outbound queue.

pub mod correlation;

pub use correlation::{Claim, CorrelationTable, Owner};

use crate::restart::RestartCoordinator;
use crate::session::{ClientSession, SessionId, SessionRegistry};
use crate::upstream::{LinkObserver, LinkState, UpstreamSink};
use lightrelay_core::{
    correlated_response, error_frame, request_error_frame, CorrelationKey, ErrorCode, RelayError,
    RelayResult, RpcFrame,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Routing knobs.
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    /// Method names that mark a client message as a subscribe request.
    pub subscription_methods: Vec<String>,
    /// How long a correlated request may wait for its response. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// How long an orphaned correlation slot is kept to swallow a late response.
    pub orphan_ttl: Duration,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            subscription_methods: vec!["header.Subscribe".into(), "blob.Subscribe".into()],
            request_timeout: None,
            orphan_ttl: Duration::from_secs(300),
        }
    }
}

/// What happened to one upstream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Correlated response handed to its owner.
    Delivered(SessionId),
    /// Correlated response whose owner is gone; discarded.
    Dropped,
    /// Push delivered to this many subscribed sessions.
    Broadcast(usize),
    /// Nobody to deliver to.
    Unroutable,
    /// Not JSON.
    Malformed,
}

impl Dispatch {
    /// Outcomes where the frame reached nobody, as the matching error.
    /// `Dropped` is a deliberate discard and stays `Ok`.
    pub fn into_result(self) -> RelayResult<Dispatch> {
        match self {
            Dispatch::Unroutable => Err(RelayError::Unroutable),
            Dispatch::Malformed => Err(RelayError::InvalidMessage(
                "upstream frame is not JSON".into(),
            )),
            other => Ok(other),
        }
    }
}

/// Counter snapshot for logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: u64,
    pub delivered: u64,
    pub broadcast: u64,
    pub dropped: u64,
    pub unroutable: u64,
    pub timed_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    delivered: AtomicU64,
    broadcast: AtomicU64,
    dropped: AtomicU64,
    unroutable: AtomicU64,
    timed_out: AtomicU64,
}

pub struct Router {
    registry: Arc<SessionRegistry>,
    correlations: Mutex<CorrelationTable>,
    upstream: Arc<dyn UpstreamSink>,
    restart: Arc<RestartCoordinator>,
    policy: RoutingPolicy,
    counters: Counters,
    /// Handle to ourselves for request timers.
    this: Weak<Router>,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        upstream: Arc<dyn UpstreamSink>,
        restart: Arc<RestartCoordinator>,
        policy: RoutingPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            correlations: Mutex::new(CorrelationTable::new()),
            upstream,
            restart,
            policy,
            counters: Counters::default(),
            this: this.clone(),
        })
    }

    /// Forward a client frame upstream.
    ///
    /// Every failure is also reported to the session as an error frame; the
    /// returned error is for the caller's logs.
    pub fn forward(&self, session: &ClientSession, raw: &str) -> RelayResult<()> {
        if self.restart.is_restarting() {
            session.deliver(error_frame(ErrorCode::NodeIsRestarting));
            return Err(RelayError::NodeRestarting);
        }

        let frame = match RpcFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                session.deliver(error_frame(ErrorCode::InvalidMessage));
                return Err(e);
            }
        };

        if let Some(method) = frame.method() {
            if self.is_subscription(method) {
                session.set_last_subscription(raw.to_string());
                debug!(session = %session.id(), method, "subscription recorded");
            }
        }

        let claim = frame
            .correlation_key()
            .map(|key| self.table().claim(key, session.id()));

        if let Err(e) = self.upstream.send(raw.to_string()) {
            if let Some(claim) = &claim {
                self.table().cancel(claim);
            }
            let code = e.code().unwrap_or(ErrorCode::LightNodeNotConnected);
            session.deliver(error_frame(code));
            return Err(e);
        }

        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        if let (Some(claim), Some(timeout)) = (claim, self.policy.request_timeout) {
            self.arm_timeout(claim, timeout);
        }
        Ok(())
    }

    /// Route one upstream frame to its owner, or to subscribers if it has none.
    pub fn dispatch(&self, raw: &str) -> Dispatch {
        let frame = match RpcFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed upstream frame");
                return Dispatch::Malformed;
            }
        };

        if let Some(key) = frame.correlation_key() {
            let owner = self.table().resolve(&key);
            match owner {
                Some(Owner::Session(id)) => return self.deliver_correlated(id, &key, &frame),
                Some(Owner::Orphaned) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "dropping response with no live owner");
                    return Dispatch::Dropped;
                }
                None => {}
            }
        }

        self.broadcast(raw)
    }

    /// Subscription frames to resend after the upstream reconnects.
    ///
    /// The upstream's reply to a replayed subscribe is swallowed: the client
    /// already got one when it first subscribed.
    pub fn on_upstream_opened(&self) -> Vec<String> {
        // Nothing claimed on the previous connection can be answered on this one.
        self.fail_pending();

        let frames = self.registry.replay_frames();
        if frames.is_empty() {
            return Vec::new();
        }

        let mut table = self.table();
        let mut out = Vec::with_capacity(frames.len());
        for (session, raw) in frames {
            if let Some(key) = RpcFrame::parse(&raw)
                .ok()
                .and_then(|f| f.correlation_key())
            {
                table.claim_orphan(key);
            }
            debug!(session = %session, "replaying subscription");
            out.push(raw);
        }
        drop(table);

        info!(count = out.len(), "replaying subscriptions to upstream");
        out
    }

    /// Forget everything a disconnected session was waiting for.
    pub fn release(&self, session: SessionId) -> usize {
        let released = self.table().release_session(session);
        if released > 0 {
            debug!(session = %session, released, "orphaned pending requests");
        }
        released
    }

    /// Empty the correlation table after the upstream connection is lost.
    ///
    /// Sessions still waiting get a request-scoped `light_node_not_connected`
    /// per claim. Orphans are dropped with everything else, so a key reused on
    /// the next connection cannot be matched to a request from the last one.
    /// Returns how many sessions' claims were failed.
    pub fn fail_pending(&self) -> usize {
        let failed = {
            let mut table = self.table();
            if table.is_empty() {
                return 0;
            }
            table.reset()
        };

        for (id, key) in &failed {
            if let Some(session) = self.registry.get(*id) {
                session.deliver(request_error_frame(key, ErrorCode::LightNodeNotConnected));
            }
        }
        if !failed.is_empty() {
            info!(failed = failed.len(), "failed requests pending on lost upstream");
        }
        failed.len()
    }

    /// Drop orphaned slots older than the configured TTL.
    pub fn sweep(&self) -> usize {
        self.table().sweep_orphans(self.policy.orphan_ttl)
    }

    /// Number of correlation slots currently held.
    pub fn pending(&self) -> usize {
        self.table().len()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            broadcast: self.counters.broadcast.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            unroutable: self.counters.unroutable.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    pub fn upstream_state(&self) -> LinkState {
        self.upstream.state()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn restart(&self) -> &Arc<RestartCoordinator> {
        &self.restart
    }

    fn deliver_correlated(&self, id: SessionId, key: &CorrelationKey, frame: &RpcFrame) -> Dispatch {
        let delivered = self
            .registry
            .get(id)
            .map(|session| session.deliver(correlated_response(key, frame)))
            .unwrap_or(false);

        if delivered {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            Dispatch::Delivered(id)
        } else {
            // Owner left between claim and response.
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(session = %id, key = %key, "owner gone, dropping response");
            Dispatch::Dropped
        }
    }

    fn broadcast(&self, raw: &str) -> Dispatch {
        let subscribers = self.registry.subscribers();
        let reached = subscribers
            .iter()
            .filter(|session| session.deliver(raw.to_string()))
            .count();

        if reached == 0 {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(len = raw.len(), "no subscriber for upstream frame");
            return Dispatch::Unroutable;
        }
        self.counters.broadcast.fetch_add(1, Ordering::Relaxed);
        Dispatch::Broadcast(reached)
    }

    fn arm_timeout(&self, claim: Claim, timeout: Duration) {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(router) = this.upgrade() {
                router.expire(&claim);
            }
        });
    }

    fn expire(&self, claim: &Claim) {
        let Some(id) = self.table().expire(claim) else {
            return;
        };
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        info!(session = %id, key = %claim.key, "request timed out");
        if let Some(session) = self.registry.get(id) {
            session.deliver(request_error_frame(&claim.key, ErrorCode::RequestTimeout));
        }
    }

    fn is_subscription(&self, method: &str) -> bool {
        self.policy
            .subscription_methods
            .iter()
            .any(|m| m == method)
    }

    fn table(&self) -> MutexGuard<'_, CorrelationTable> {
        self.correlations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LinkObserver for Router {
    fn on_opened(&self) -> Vec<String> {
        self.on_upstream_opened()
    }

    fn on_message(&self, frame: &str) {
        if let Err(e) = self.dispatch(frame).into_result() {
            debug!(error = %e, "upstream frame not delivered");
        }
    }

    fn on_closed(&self) {
        debug!(
            sessions = self.registry.count(),
            pending = self.pending(),
            "upstream closed"
        );
        self.fail_pending();
    }
}
