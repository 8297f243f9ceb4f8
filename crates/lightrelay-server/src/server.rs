//! Gateway server: accepts client connections and wires them to the router.
//!
//! Owns the credential store, the failed-auth limiter and the shutdown
//! broadcast. Each connection runs in its own task; its session is
//! registered only after authentication succeeds and is removed, with its
//! pending correlations, when the task ends.

use crate::auth::{Access, AuthFailureLimiter, CredentialStore};
use crate::config::ServerConfig;
use crate::router::Router;
use crate::session::{ClientSession, OUTBOUND_QUEUE_CAPACITY};
use crate::transport::websocket::{self, ClientFrame, WebSocketConnection};
use lightrelay_core::{error_frame, key_fingerprint, ErrorCode, RelayError, RelayResult};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Interval of the orphan sweep / limiter GC / stats task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for sessions to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct GatewayServer {
    bind: SocketAddr,
    credential_header: String,
    health_interval: Duration,
    credentials: Arc<dyn CredentialStore>,
    router: Arc<Router>,
    auth_failures: Mutex<AuthFailureLimiter>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    pub fn new(
        config: &ServerConfig,
        credentials: Arc<dyn CredentialStore>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            bind: config.bind,
            credential_header: config.credential_header.clone(),
            health_interval: config.health_interval,
            credentials,
            router,
            auth_failures: Mutex::new(AuthFailureLimiter::new(
                config.auth.max_auth_failures,
                crate::auth::rate_limit::AUTH_FAILURE_WINDOW,
            )),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> RelayResult<()> {
        let (addr, rx) = websocket::start_listener(self.bind, self.credential_header.clone()).await?;
        info!(addr = %addr, "lightrelay ready");
        self.serve(rx, shutdown).await;
        Ok(())
    }

    /// Serve already-accepted connections until `shutdown` resolves or the
    /// listener goes away, then close every session.
    pub async fn serve(
        self: Arc<Self>,
        mut connections: mpsc::Receiver<WebSocketConnection>,
        shutdown: impl Future<Output = ()>,
    ) {
        let maintenance = tokio::spawn(Self::maintenance(self.clone()));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = connections.recv() => {
                    let Some(conn) = accepted else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = self.clone();
                    tokio::spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = srv.handle_websocket(conn).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
            }
        }

        maintenance.abort();

        // Broadcast shutdown to all connected clients
        let registry = self.router.registry();
        info!(sessions = registry.count(), "broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while registry.count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
    }

    async fn maintenance(self: Arc<Self>) {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let swept = self.router.sweep();
            let tracked = self.limiter().gc();
            let stats = self.router.stats();
            let sessions = self.router.registry().list();
            for s in &sessions {
                debug!(
                    session = %s.id,
                    key = %s.key_fingerprint,
                    remote = %s.remote_addr,
                    connected_secs = s.connected_secs,
                    subscribed = s.subscribed,
                    "active session"
                );
            }
            info!(
                upstream = %self.router.upstream_state(),
                sessions = sessions.len(),
                pending = self.router.pending(),
                swept,
                tracked_ips = tracked,
                forwarded = stats.forwarded,
                delivered = stats.delivered,
                broadcast = stats.broadcast,
                dropped = stats.dropped,
                unroutable = stats.unroutable,
                timed_out = stats.timed_out,
                "relay stats"
            );
        }
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> RelayResult<()> {
        let remote = conn.remote_addr;
        let key = match self.authenticate(remote.ip(), conn.credential.as_deref()).await {
            Ok(key) => key,
            Err(e) => {
                info!(remote = %remote, reason = %e, "rejected client");
                websocket::ws_close_unauthorized(&mut conn.ws_stream).await;
                return Ok(());
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let registry = self.router.registry();
        let session = registry.register(key_fingerprint(&key), remote, outbound_tx);
        if self.router.restart().is_restarting() {
            session.deliver(error_frame(ErrorCode::NodeIsRestarting));
        }

        let result = self.session_loop(&mut conn, &session, outbound_rx).await;

        registry.remove(session.id());
        self.router.release(session.id());
        info!(
            session = %session.id(),
            duration_secs = session.connected_secs(),
            active = registry.count(),
            "session closed"
        );
        result
    }

    /// Returns the trimmed API key on success.
    async fn authenticate(&self, ip: IpAddr, credential: Option<&str>) -> RelayResult<String> {
        if self.limiter().is_blocked(ip) {
            return Err(RelayError::Unauthorized("too many failed attempts".into()));
        }

        let key = credential.map(str::trim).unwrap_or_default();
        if key.is_empty() {
            self.limiter().record_failure(ip);
            return Err(RelayError::Unauthorized("missing credential".into()));
        }

        match self.credentials.lookup(key).await {
            Ok(Access::Allowed) => Ok(key.to_string()),
            Ok(Access::Denied) => {
                self.limiter().record_failure(ip);
                Err(RelayError::Unauthorized(format!(
                    "unknown key {}",
                    key_fingerprint(key)
                )))
            }
            Err(e) => {
                warn!(error = %e, "credential lookup failed");
                Err(RelayError::Unauthorized("credential lookup failed".into()))
            }
        }
    }

    /// Post-auth message loop.
    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        session: &ClientSession,
        mut outbound: mpsc::Receiver<String>,
    ) -> RelayResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + self.health_interval,
            self.health_interval,
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(session = %session.id(), "shutdown signal received, closing client");
                    websocket::ws_close(&mut conn.ws_stream, "server shutdown".into()).await;
                    break;
                }

                queued = outbound.recv() => {
                    let Some(frame) = queued else {
                        // Sender dropped: the session was evicted for not reading.
                        info!(session = %session.id(), "closing client that stopped reading");
                        websocket::ws_close(&mut conn.ws_stream, "outbound queue full".into()).await;
                        break;
                    };
                    websocket::ws_send_text(&mut conn.ws_stream, frame).await?;
                }

                _ = health.tick() => {
                    if self.router.restart().is_restarting() {
                        websocket::ws_send_text(
                            &mut conn.ws_stream,
                            error_frame(ErrorCode::NodeIsRestarting),
                        )
                        .await?;
                    } else {
                        websocket::ws_send_ping(&mut conn.ws_stream).await?;
                    }
                }

                received = websocket::ws_recv(&mut conn.ws_stream) => {
                    match received {
                        Ok(Some(ClientFrame::Text(text))) => {
                            if let Err(e) = self.router.forward(session, &text) {
                                debug!(session = %session.id(), error = %e, "message not forwarded");
                            }
                        }
                        Ok(Some(ClientFrame::NotUtf8)) => {
                            session.deliver(error_frame(ErrorCode::InvalidMessage));
                        }
                        Ok(None) => {
                            debug!(session = %session.id(), "client closed");
                            break;
                        }
                        Err(e) => {
                            debug!(session = %session.id(), error = %e, "session ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn limiter(&self) -> MutexGuard<'_, AuthFailureLimiter> {
        self.auth_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
