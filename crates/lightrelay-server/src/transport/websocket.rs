//! Client-facing WebSocket listener using tokio-tungstenite.
//!
//! The handshake callback captures the credential header so the server can
//! authenticate before touching the connection. Every accepted socket is
//! handed over through a channel; handshake failures are logged and dropped.

use futures_util::{SinkExt, StreamExt};
use lightrelay_core::{error_frame, ErrorCode, RelayError, RelayResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// How long to wait for the client to acknowledge our close frame.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Raw value of the credential header, if the client sent one.
    pub credential: Option<String>,
}

/// One client frame, as the session loop sees it.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    /// Binary frame that is not valid UTF-8.
    NotUtf8,
}

/// Bind the listener and start accepting.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    credential_header: String,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let header = credential_header.clone();
                    tokio::spawn(async move {
                        match accept(stream, &header).await {
                            Ok((ws_stream, credential)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    credential,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    if tx.is_closed() {
                        break;
                    }
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

async fn accept(
    stream: TcpStream,
    header: &str,
) -> RelayResult<(WebSocketStream<TcpStream>, Option<String>)> {
    let mut credential = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        credential = req
            .headers()
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| RelayError::Transport(format!("WS accept failed: {e}")))?;
    Ok((ws_stream, credential))
}

/// Send a text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> RelayResult<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
}

/// Send a ping used as a liveness check.
pub async fn ws_send_ping(ws: &mut WebSocketStream<TcpStream>) -> RelayResult<()> {
    ws.send(Message::Ping(Vec::new()))
        .await
        .map_err(|e| RelayError::Transport(format!("WS ping failed: {e}")))
}

/// Receive the next data frame.
///
/// Returns `None` once the client closed. Control frames are handled here;
/// tungstenite answers pings on the next write.
pub async fn ws_recv(ws: &mut WebSocketStream<TcpStream>) -> RelayResult<Option<ClientFrame>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(ClientFrame::Text(text))),
            Some(Ok(Message::Binary(data))) => {
                return Ok(Some(match String::from_utf8(data) {
                    Ok(text) => ClientFrame::Text(text),
                    Err(_) => ClientFrame::NotUtf8,
                }));
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RelayError::Transport(format!("WS recv failed: {e}"))),
        }
    }
}

/// Close with code 1000 and `reason` as the close reason, then wait briefly
/// for the client's side of the close handshake.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>, reason: String) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "close frame not sent");
        return;
    }
    let _ = tokio::time::timeout(CLOSE_LINGER, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

/// Refuse an unauthenticated client.
pub async fn ws_close_unauthorized(ws: &mut WebSocketStream<TcpStream>) {
    ws_close(ws, error_frame(ErrorCode::Unauthorized)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    async fn listen() -> (SocketAddr, mpsc::Receiver<WebSocketConnection>) {
        start_listener("127.0.0.1:0".parse().unwrap(), "x-api-key".into())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn captures_credential_header() {
        let (addr, mut rx) = listen().await;
        let mut request = format!("ws://{addr}/").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("x-api-key", "secret".parse().unwrap());
        let client = tokio::spawn(tokio_tungstenite::connect_async(request));

        let conn = rx.recv().await.unwrap();
        assert_eq!(conn.credential.as_deref(), Some("secret"));
        assert!(conn.remote_addr.ip().is_loopback());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_header_is_none() {
        let (addr, mut rx) = listen().await;
        let client = tokio::spawn(tokio_tungstenite::connect_async(format!("ws://{addr}/")));
        let conn = rx.recv().await.unwrap();
        assert_eq!(conn.credential, None);
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_unauthorized_sends_reason() {
        let (addr, mut rx) = listen().await;
        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
                .await
                .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    _ => return None,
                }
            }
        });

        let mut conn = rx.recv().await.unwrap();
        ws_close_unauthorized(&mut conn.ws_stream).await;

        let frame = client.await.unwrap().expect("close frame");
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason, r#"{"error":"unauthorized"}"#);
    }

    #[tokio::test]
    async fn binary_frames_are_decoded_as_text() {
        let (addr, mut rx) = listen().await;
        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
                .await
                .unwrap();
            ws.send(Message::Binary(br#"{"id":1}"#.to_vec())).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut conn = rx.recv().await.unwrap();
        assert_eq!(
            ws_recv(&mut conn.ws_stream).await.unwrap(),
            Some(ClientFrame::Text(r#"{"id":1}"#.into()))
        );
        assert_eq!(
            ws_recv(&mut conn.ws_stream).await.unwrap(),
            Some(ClientFrame::NotUtf8)
        );
        assert_eq!(ws_recv(&mut conn.ws_stream).await.unwrap(), None);
        client.await.unwrap();
    }
}
