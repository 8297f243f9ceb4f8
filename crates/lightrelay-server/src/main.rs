//! lightrelay: WebSocket relay gateway for a Celestia light node.
//!
//! Accepts authenticated client WebSocket connections and multiplexes them
//! over one upstream connection to the node, routing responses back to the
//! caller and replaying subscriptions across upstream reconnects.

mod admin;
mod auth;
mod config;
mod restart;
mod router;
mod server;
mod session;
mod transport;
mod upstream;

use admin::NodeAdmin;
use clap::Parser;
use config::{Overrides, ServerConfig};
use restart::{RestartCoordinator, MAX_SETTLE_GRACE};
use router::Router;
use server::GatewayServer;
use session::SessionRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use upstream::UpstreamLink;

/// Environment variable holding the light node auth token.
const UPSTREAM_TOKEN_ENV: &str = "LIGHTRELAY_UPSTREAM_TOKEN";

/// lightrelay: light node WebSocket relay
#[derive(Parser, Debug)]
#[command(name = "lightrelay", version, about = "Light node WebSocket relay gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.lightrelay/config.toml")]
    config: String,

    /// Light node RPC endpoint (ws:// or wss://)
    #[arg(long)]
    upstream: Option<String>,

    /// Seconds between upstream reconnect attempts
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Seconds a request may wait for its response (0 disables)
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting lightrelay");

    let overrides = Overrides {
        port: cli.port,
        upstream: cli.upstream,
        upstream_token: std::env::var(UPSTREAM_TOKEN_ENV).ok(),
        reconnect_delay: cli.reconnect_delay,
        request_timeout: cli.request_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SessionRegistry::new());
    let restart = Arc::new(RestartCoordinator::new());

    let link = UpstreamLink::new(config.upstream.clone());
    let router = Router::new(
        registry,
        link.clone(),
        restart.clone(),
        config.routing.clone(),
    );
    link.subscribe(&router);
    info!(endpoint = %link.endpoint(), "connecting to light node");
    link.connect();

    let credentials = auth::build_store(&config.auth, &config.credential_header);

    let admin = Arc::new(NodeAdmin::new(config.node.clone(), restart));
    spawn_restart_trigger(admin);

    let server = Arc::new(GatewayServer::new(&config, credentials, router));
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    link.shutdown();
    info!("lightrelay stopped");
}

/// Restart the light node on SIGHUP.
#[cfg(unix)]
fn spawn_restart_trigger(admin: Arc<NodeAdmin>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGHUP handler, restart trigger disabled");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, restarting light node");
            let admin = admin.clone();
            tokio::spawn(async move {
                if let Err(e) = admin.restart_if_idle(MAX_SETTLE_GRACE).await {
                    warn!(error = %e, "light node restart failed");
                }
            });
        }
    });
}

#[cfg(not(unix))]
fn spawn_restart_trigger(_admin: Arc<NodeAdmin>) {}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
