//! Credential lookup backends.

use lightrelay_core::{RelayError, RelayResult};
use reqwest::StatusCode;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Result of a credential lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// Opaque "is this API key allowed" check.
///
/// An `Err` means the lookup itself failed; the connection is refused the
/// same way as a denial, but the error is logged.
pub trait CredentialStore: Send + Sync {
    fn lookup<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Access>> + Send + 'a>>;
}

/// Fixed key set from the config file.
#[derive(Debug, Default)]
pub struct StaticKeyStore {
    keys: HashSet<String>,
}

impl StaticKeyStore {
    pub fn new(
        keys: impl IntoIterator<Item = String>,
        revoked: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut keys: HashSet<String> = keys.into_iter().collect();
        for key in revoked {
            keys.remove(&key);
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl CredentialStore for StaticKeyStore {
    fn lookup<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Access>> + Send + 'a>> {
        Box::pin(async move {
            Ok(if self.keys.contains(key) {
                Access::Allowed
            } else {
                Access::Denied
            })
        })
    }
}

/// Asks an external service whether a key is valid.
///
/// Sends `GET <url>` carrying the key in the credential header.
#[derive(Debug)]
pub struct HttpKeyStore {
    client: reqwest::Client,
    url: String,
    header: String,
}

impl HttpKeyStore {
    pub fn new(url: String, header: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            header,
        }
    }
}

impl CredentialStore for HttpKeyStore {
    fn lookup<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Access>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .header(self.header.as_str(), key)
                .send()
                .await
                .map_err(|e| RelayError::Transport(format!("credential lookup: {e}")))?;

            let status = response.status();
            debug!(status = %status, "credential lookup answered");
            match status {
                s if s.is_success() => Ok(Access::Allowed),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    Ok(Access::Denied)
                }
                s => Err(RelayError::Transport(format!(
                    "credential lookup returned {s}"
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn static_store_excludes_revoked_keys() {
        let store = StaticKeyStore::new(
            ["k1".to_string(), "k2".to_string()],
            ["k2".to_string()],
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("k1").await.unwrap(), Access::Allowed);
        assert_eq!(store.lookup("k2").await.unwrap(), Access::Denied);
        assert_eq!(store.lookup("nope").await.unwrap(), Access::Denied);
    }

    #[tokio::test]
    async fn empty_static_store_denies_everything() {
        let store = StaticKeyStore::default();
        assert!(store.is_empty());
        assert_eq!(store.lookup("").await.unwrap(), Access::Denied);
    }

    /// One-shot HTTP responder: answers 200 when the credential header
    /// carries `good`, otherwise `fallback`.
    async fn key_service(fallback: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let mut len = 0;
                loop {
                    let n = stream.read(&mut buf[len..]).await.unwrap();
                    len += n;
                    if n == 0 || buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buf[..len]).to_lowercase();
                let status = if request.contains("x-api-key: good\r\n") {
                    "200 OK"
                } else {
                    fallback
                };
                let reply =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        format!("http://{addr}/keys")
    }

    #[tokio::test]
    async fn http_store_maps_status_codes() {
        let url = key_service("403 Forbidden").await;
        let store = HttpKeyStore::new(url, "x-api-key".into());
        assert_eq!(store.lookup("good").await.unwrap(), Access::Allowed);
        assert_eq!(store.lookup("bad").await.unwrap(), Access::Denied);
    }

    #[tokio::test]
    async fn http_store_server_error_is_an_error() {
        let url = key_service("500 Internal Server Error").await;
        let store = HttpKeyStore::new(url, "x-api-key".into());
        assert!(matches!(
            store.lookup("bad").await,
            Err(RelayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn http_store_unreachable_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let store = HttpKeyStore::new(format!("http://{addr}/"), "x-api-key".into());
        assert!(store.lookup("k").await.is_err());
    }
}
