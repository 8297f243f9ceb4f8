//! Client authentication: credential lookup and failed-attempt limiting.

pub mod rate_limit;
pub mod store;

pub use rate_limit::AuthFailureLimiter;
pub use store::{Access, CredentialStore, HttpKeyStore, StaticKeyStore};

use std::sync::Arc;
use tracing::{info, warn};

/// `[auth]` settings after resolution.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Accepted API keys for the static store.
    pub api_keys: Vec<String>,
    /// Keys that stay rejected even when listed in `api_keys`.
    pub revoked_keys: Vec<String>,
    /// When set, keys are checked against this HTTP endpoint instead.
    pub lookup_url: Option<String>,
    /// Failed attempts per IP inside one window before the IP is refused outright.
    pub max_auth_failures: u32,
}

/// Build the credential store the config asks for.
pub fn build_store(config: &AuthConfig, header: &str) -> Arc<dyn CredentialStore> {
    if let Some(url) = &config.lookup_url {
        info!(url = %url, "using HTTP credential lookup");
        return Arc::new(HttpKeyStore::new(url.clone(), header.to_string()));
    }

    let store = StaticKeyStore::new(
        config.api_keys.iter().cloned(),
        config.revoked_keys.iter().cloned(),
    );
    if store.is_empty() {
        warn!("no API keys configured, every client will be rejected");
    } else {
        info!(keys = store.len(), "using static API keys");
    }
    Arc::new(store)
}
