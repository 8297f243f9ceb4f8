//! Supervised WebSocket client connection to the light node.
//!
//! One supervisor task owns the physical connection: connect, pump frames
//! until the peer goes away, wait `reconnect_delay`, connect again. Retries
//! never stop. Observers register once and survive every reconnect.

use super::{LinkObserver, LinkState, UpstreamConfig, UpstreamSink};
use futures_util::{SinkExt, StreamExt};
use lightrelay_core::{RelayError, RelayResult};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames that may wait for the socket on top of a connection's replay frames.
const WRITER_QUEUE_CAPACITY: usize = 1024;

/// State guarded together so `send` sees state and writer atomically.
struct LinkInner {
    state: LinkState,
    /// Queue drained by the connection task into the socket. Present only while open.
    writer: Option<mpsc::Sender<Message>>,
    /// Whether a supervisor task is running.
    supervising: bool,
}

/// The gateway's single connection to the light node.
pub struct UpstreamLink {
    config: UpstreamConfig,
    inner: Mutex<LinkInner>,
    observers: Mutex<Vec<Weak<dyn LinkObserver>>>,
    shutdown: watch::Sender<bool>,
}

impl UpstreamLink {
    pub fn new(config: UpstreamConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                writer: None,
                supervising: false,
            }),
            observers: Mutex::new(Vec::new()),
            shutdown: watch::channel(false).0,
        })
    }

    /// Register an observer for the lifetime of the link.
    ///
    /// The link holds it weakly; dropping the last `Arc` unsubscribes it.
    pub fn subscribe<O: LinkObserver + 'static>(&self, observer: &Arc<O>) {
        let weak: Weak<O> = Arc::downgrade(observer);
        let weak: Weak<dyn LinkObserver> = weak;
        let mut observers = self.lock_observers();
        observers.push(weak);
        debug!(observers = observers.len(), "upstream observer registered");
    }

    /// Start the supervisor if it is not already running.
    pub fn connect(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.supervising {
                debug!(state = %inner.state, "upstream connect already in progress");
                return;
            }
            inner.supervising = true;
            inner.state = LinkState::Connecting;
        }
        self.shutdown.send_replace(false);

        let link = self.clone();
        tokio::spawn(async move {
            link.supervise().await;
        });
    }

    /// Close the connection and stop reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut attempt: u64 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            attempt += 1;
            self.set_state(LinkState::Connecting);

            let connected = tokio::select! {
                result = self.open() => result,
                _ = shutdown_rx.changed() => break,
            };

            match connected {
                Ok(ws) => {
                    attempt = 0;
                    self.run_connection(ws, &mut shutdown_rx).await;
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.config.endpoint,
                        attempt,
                        error = %e,
                        "upstream connect failed"
                    );
                }
            }

            self.mark_disconnected();

            if *shutdown_rx.borrow() {
                break;
            }
            debug!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "scheduling upstream reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        {
            let mut inner = self.lock();
            inner.state = LinkState::Disconnected;
            inner.writer = None;
            inner.supervising = false;
        }
        info!(endpoint = %self.config.endpoint, "upstream link stopped");
    }

    /// Open one physical connection with the configured auth header.
    async fn open(&self) -> RelayResult<UpstreamStream> {
        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Transport(format!("invalid upstream endpoint: {e}")))?;

        if !self.config.auth_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.config.auth_token))
                .map_err(|e| RelayError::Config(format!("invalid upstream token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| RelayError::Transport(format!("upstream connect error: {e}")))?;
        Ok(ws)
    }

    /// Pump one open connection until either side closes it.
    async fn run_connection(&self, ws: UpstreamStream, shutdown_rx: &mut watch::Receiver<bool>) {
        let (mut sink, mut stream) = ws.split();

        // Replay frames go into the queue before the state flips to Open, under
        // the same lock `send` takes, so nothing can overtake them. The queue is
        // sized so every replay frame fits.
        let observers = self.live_observers();
        let (mut rx, replayed) = {
            let mut inner = self.lock();
            let frames: Vec<String> = observers.iter().flat_map(|o| o.on_opened()).collect();
            let replayed = frames.len();
            let (tx, rx) = mpsc::channel::<Message>(WRITER_QUEUE_CAPACITY + replayed);
            for frame in frames {
                let _ = tx.try_send(Message::Text(frame));
            }
            inner.writer = Some(tx);
            inner.state = LinkState::Open;
            (rx, replayed)
        };
        drop(observers);
        info!(endpoint = %self.config.endpoint, replayed, "upstream link open");

        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if let Err(e) = sink.send(msg).await {
                        warn!(error = %e, "upstream write failed");
                        break;
                    }
                }

                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.notify_message(&text),
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => self.notify_message(&text),
                            Err(_) => warn!("dropping non-UTF-8 binary frame from upstream"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "upstream closed connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "upstream read failed");
                            break;
                        }
                        None => {
                            info!("upstream stream ended");
                            break;
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    self.close_writer();
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(error = %e, "upstream close frame not sent");
                    }
                    break;
                }
            }
        }

        self.close_writer();
    }

    /// Stop accepting sends for the current connection.
    fn close_writer(&self) {
        let mut inner = self.lock();
        inner.writer = None;
        inner.state = LinkState::Closing;
    }

    fn mark_disconnected(&self) {
        {
            let mut inner = self.lock();
            inner.writer = None;
            inner.state = LinkState::Disconnected;
        }
        for observer in self.live_observers() {
            observer.on_closed();
        }
    }

    fn notify_message(&self, frame: &str) {
        for observer in self.live_observers() {
            observer.on_message(frame);
        }
    }

    /// Upgrade the registered observers, pruning ones that were dropped.
    fn live_observers(&self) -> Vec<Arc<dyn LinkObserver>> {
        let mut observers = self.lock_observers();
        let mut live = Vec::with_capacity(observers.len());
        observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => false,
        });
        live
    }

    fn set_state(&self, state: LinkState) {
        self.lock().state = state;
    }

    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<Weak<dyn LinkObserver>>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl UpstreamSink for UpstreamLink {
    fn send(&self, frame: String) -> RelayResult<()> {
        let inner = self.lock();
        if inner.state != LinkState::Open {
            return Err(RelayError::UpstreamUnavailable);
        }
        let Some(writer) = &inner.writer else {
            return Err(RelayError::UpstreamUnavailable);
        };
        match writer.try_send(Message::Text(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    capacity = WRITER_QUEUE_CAPACITY,
                    "upstream write queue full, rejecting frame"
                );
                Err(RelayError::UpstreamUnavailable)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::UpstreamUnavailable),
        }
    }

    fn state(&self) -> LinkState {
        self.lock().state
    }
}
