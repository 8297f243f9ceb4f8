//! Server configuration: TOML file + CLI overrides.

use crate::admin::NodeConfig;
use crate::auth::AuthConfig;
use crate::router::RoutingPolicy;
use crate::upstream::UpstreamConfig;
use lightrelay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub node: NodeSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credential_header")]
    pub credential_header: String,
    #[serde(default = "default_health_interval")]
    pub health_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            credential_header: default_credential_header(),
            health_interval: default_health_interval(),
        }
    }
}

/// `[upstream]` section: the light node connection.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            auth_token: String::new(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

/// `[router]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_subscription_methods")]
    pub subscription_methods: Vec<String>,
    /// Seconds; 0 disables the per-request timeout.
    #[serde(default)]
    pub request_timeout: u64,
    #[serde(default = "default_orphan_ttl")]
    pub orphan_ttl: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            subscription_methods: default_subscription_methods(),
            request_timeout: 0,
            orphan_ttl: default_orphan_ttl(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub revoked_keys: Vec<String>,
    #[serde(default)]
    pub lookup_url: Option<String>,
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            revoked_keys: Vec::new(),
            lookup_url: None,
            max_auth_failures: default_max_auth_failures(),
        }
    }
}

/// `[node]` section: administrative operations against the light node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            restart_command: default_restart_command(),
            restart_timeout: default_restart_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_credential_header() -> String {
    "x-api-key".to_string()
}
fn default_health_interval() -> u64 {
    30
}
fn default_endpoint() -> String {
    "ws://localhost:10102".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_subscription_methods() -> Vec<String> {
    vec!["header.Subscribe".to_string(), "blob.Subscribe".to_string()]
}
fn default_orphan_ttl() -> u64 {
    300
}
fn default_max_auth_failures() -> u32 {
    10
}
fn default_restart_command() -> Vec<String> {
    vec![
        "docker".to_string(),
        "restart".to_string(),
        "celestia-light-node".to_string(),
    ]
}
fn default_restart_timeout() -> u64 {
    120
}

/// Values given on the command line (or environment) that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub upstream: Option<String>,
    pub upstream_token: Option<String>,
    pub reconnect_delay: Option<u64>,
    pub request_timeout: Option<u64>,
}

/// Resolved server configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub credential_header: String,
    pub health_interval: Duration,
    pub upstream: UpstreamConfig,
    pub routing: RoutingPolicy,
    pub auth: AuthConfig,
    pub node: NodeConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    ConfigFile::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed config file with overrides.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> RelayResult<Self> {
        let port = overrides.port.unwrap_or(file.server.port);
        let bind: SocketAddr = format!("{}:{port}", file.server.host)
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bind address: {e}")))?;

        let endpoint = overrides.upstream.unwrap_or(file.upstream.endpoint);
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(RelayError::Config(format!(
                "upstream endpoint must be a ws:// or wss:// URL: {endpoint}"
            )));
        }
        let auth_token = overrides
            .upstream_token
            .unwrap_or(file.upstream.auth_token);
        let reconnect_delay = overrides
            .reconnect_delay
            .unwrap_or(file.upstream.reconnect_delay);

        let request_timeout = overrides
            .request_timeout
            .unwrap_or(file.router.request_timeout);

        if file.server.credential_header.trim().is_empty() {
            return Err(RelayError::Config("credential_header must not be empty".into()));
        }
        if file.node.restart_command.is_empty() {
            return Err(RelayError::Config("restart_command must not be empty".into()));
        }

        Ok(Self {
            bind,
            credential_header: file.server.credential_header.to_ascii_lowercase(),
            health_interval: Duration::from_secs(file.server.health_interval.max(1)),
            upstream: UpstreamConfig {
                endpoint,
                auth_token,
                reconnect_delay: Duration::from_secs(reconnect_delay),
            },
            routing: RoutingPolicy {
                subscription_methods: file.router.subscription_methods,
                request_timeout: (request_timeout > 0)
                    .then(|| Duration::from_secs(request_timeout)),
                orphan_ttl: Duration::from_secs(file.router.orphan_ttl),
            },
            auth: AuthConfig {
                api_keys: file.auth.api_keys,
                revoked_keys: file.auth.revoked_keys,
                lookup_url: file.auth.lookup_url.filter(|u| !u.trim().is_empty()),
                max_auth_failures: file.auth.max_auth_failures,
            },
            node: NodeConfig {
                restart_command: file.node.restart_command,
                restart_timeout: Duration::from_secs(file.node.restart_timeout),
            },
        })
    }
}

impl ConfigFile {
    pub fn parse(content: &str) -> RelayResult<Self> {
        toml::from_str(content).map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), Overrides::default()).unwrap();
        assert_eq!(cfg.bind.port(), 8787);
        assert_eq!(cfg.credential_header, "x-api-key");
        assert_eq!(cfg.upstream.reconnect_delay, Duration::from_secs(5));
        assert!(cfg.routing.request_timeout.is_none());
        assert_eq!(cfg.node.restart_command[0], "docker");
    }

    #[test]
    fn file_sections_parse() {
        let file = ConfigFile::parse(
            r#"
            [server]
            port = 9000
            credential_header = "X-Relay-Key"

            [upstream]
            endpoint = "wss://node.example:26658"
            auth_token = "from-file"
            reconnect_delay = 2

            [router]
            subscription_methods = ["header.Subscribe"]
            request_timeout = 30

            [auth]
            api_keys = ["k1", "k2"]
            revoked_keys = ["k2"]
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, Overrides::default()).unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.credential_header, "x-relay-key");
        assert_eq!(cfg.upstream.auth_token, "from-file");
        assert_eq!(cfg.routing.subscription_methods, vec!["header.Subscribe"]);
        assert_eq!(cfg.routing.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.auth.revoked_keys, vec!["k2"]);
    }

    #[test]
    fn overrides_win_over_file() {
        let file = ConfigFile::parse("[upstream]\nauth_token = \"file\"\n").unwrap();
        let cfg = ServerConfig::resolve(
            file,
            Overrides {
                port: Some(1234),
                upstream: Some("ws://127.0.0.1:1".into()),
                upstream_token: Some("env".into()),
                reconnect_delay: Some(1),
                request_timeout: Some(0),
            },
        )
        .unwrap();
        assert_eq!(cfg.bind.port(), 1234);
        assert_eq!(cfg.upstream.endpoint, "ws://127.0.0.1:1");
        assert_eq!(cfg.upstream.auth_token, "env");
        assert!(cfg.routing.request_timeout.is_none());
    }

    #[test]
    fn rejects_non_websocket_endpoint() {
        let err = ServerConfig::resolve(
            ConfigFile::default(),
            Overrides {
                upstream: Some("http://localhost:10102".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn bad_toml_is_config_error() {
        assert!(matches!(
            ConfigFile::parse("[server\nport = ").unwrap_err(),
            RelayError::Config(_)
        ));
    }
}
