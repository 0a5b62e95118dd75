//! Endpoint subscriber.
//!
//! Maintains one long-lived WebSocket connection per configured feed
//! endpoint, reconnecting with a configurable delay until the subscriber
//! is shut down or exhausts its reconnect budget. Frames are handed to a
//! caller-supplied handler bounded by a five-second processing deadline,
//! so a stalled handler can never wedge the read loop.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fixed subscribe frame Blitzortung endpoints require immediately after
/// connecting, regardless of any per-endpoint init payload.
pub const BLITZORTUNG_INIT_MESSAGE: &str = r#"{"a": 111}"#;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_INBOUND_FRAME_BYTES: usize = 10 * 1024 * 1024;
const PROCESSING_DEADLINE: Duration = Duration::from_secs(5);

/// A boxed, one-shot future returned by a [`Handler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// `handler(endpoint_url, payload)`, invoked once per accepted frame.
pub type Handler = Arc<dyn Fn(String, Vec<u8>) -> HandlerFuture + Send + Sync>;

#[derive(Debug)]
pub enum SubscriberError {
    Connect(String),
    Handshake(String),
}

impl std::fmt::Display for SubscriberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberError::Connect(msg) => write!(f, "connect failed: {msg}"),
            SubscriberError::Handshake(msg) => write!(f, "handshake failed: {msg}"),
        }
    }
}

impl std::error::Error for SubscriberError {}

/// Static configuration for one endpoint subscriber.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub url: String,
    pub init_payload: Option<String>,
    pub init_required: bool,
    pub queue_max_size: usize,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: Option<u32>,
}

/// Shared, lock-free view of one subscriber's live state, handed back to
/// the caller at spawn time for stats aggregation.
#[derive(Debug, Default)]
pub struct SubscriberHandle {
    connected: AtomicBool,
    queue_len: AtomicUsize,
}

impl SubscriberHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }
}

/// Tracks the depth of the conceptual per-endpoint backlog without ever
/// materializing it as a real buffer: frames are dispatched to the
/// handler as they arrive, so this only counts "in flight" work between
/// receipt and the handler's eventual completion.
struct BoundedTracker {
    max: usize,
    len: usize,
}

impl BoundedTracker {
    fn new(max: usize) -> Self {
        BoundedTracker { max: max.max(1), len: 0 }
    }

    /// Returns `true` if the virtual backlog was already at capacity, in
    /// which case the oldest outstanding unit is considered dropped to
    /// make room for this one.
    fn enter(&mut self) -> bool {
        let dropped = self.len >= self.max;
        if !dropped {
            self.len += 1;
        }
        dropped
    }

    fn leave(&mut self) {
        self.len = self.len.saturating_sub(1);
    }
}

/// One endpoint's subscription loop: connect, subscribe, receive until
/// the socket drops or `shutdown` fires, then reconnect after a delay.
pub struct EndpointSubscriber {
    config: SubscriberConfig,
}

impl EndpointSubscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        EndpointSubscriber { config }
    }

    /// Spawn the subscriber loop on the current runtime, returning its
    /// join handle and a shared status handle.
    pub fn spawn(
        self,
        handler: Handler,
        shutdown: CancellationToken,
    ) -> (tokio::task::JoinHandle<()>, Arc<SubscriberHandle>) {
        let handle = Arc::new(SubscriberHandle::default());
        let task_handle = handle.clone();
        let join = tokio::spawn(async move {
            self.run(handler, shutdown, task_handle).await;
        });
        (join, handle)
    }

    async fn run(self, handler: Handler, shutdown: CancellationToken, handle: Arc<SubscriberHandle>) {
        let mut attempt: u32 = 0;
        let mut tracker = BoundedTracker::new(self.config.queue_max_size);

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            attempt += 1;

            let connect_result = tokio::select! {
                () = shutdown.cancelled() => break,
                res = connect(&self.config.url) => res,
            };

            let mut ws = match connect_result {
                Ok(ws) => {
                    info!(url = %self.config.url, "endpoint connected");
                    attempt = 0;
                    ws
                }
                Err(err) => {
                    error!(url = %self.config.url, attempt, error = %err, "endpoint connect failed");
                    if self.exhausted(attempt) {
                        warn!(url = %self.config.url, "reconnect attempts exhausted, giving up");
                        break;
                    }
                    if self.wait_or_shutdown(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if self.config.init_required
                && ws.send(Message::Text(BLITZORTUNG_INIT_MESSAGE.into())).await.is_err()
            {
                warn!(url = %self.config.url, "failed to send subscribe frame");
            }
            if let Some(payload) = self.config.init_payload.clone() {
                if ws.send(Message::Text(payload.into())).await.is_err() {
                    warn!(url = %self.config.url, "failed to send init payload");
                }
            }

            handle.connected.store(true, Ordering::Relaxed);
            self.receive_until_closed(&mut ws, &handler, &shutdown, &mut tracker, &handle)
                .await;
            handle.connected.store(false, Ordering::Relaxed);

            close_gracefully(&mut ws).await;

            if shutdown.is_cancelled() {
                break;
            }
            if self.exhausted(attempt) {
                warn!(url = %self.config.url, "reconnect attempts exhausted, giving up");
                break;
            }
            if self.wait_or_shutdown(&shutdown).await {
                break;
            }
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.config.max_reconnect_attempts, Some(max) if attempt >= max)
    }

    /// Sleep for the reconnect delay, returning `true` if shutdown fired
    /// first (in which case the caller should stop reconnecting).
    async fn wait_or_shutdown(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => true,
            () = tokio::time::sleep(self.config.reconnect_delay) => false,
        }
    }

    async fn receive_until_closed(
        &self,
        ws: &mut WsStream,
        handler: &Handler,
        shutdown: &CancellationToken,
        tracker: &mut BoundedTracker,
        handle: &Arc<SubscriberHandle>,
    ) {
        let mut last_activity = Instant::now();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = heartbeat.tick() => {
                    if last_activity.elapsed() > HEARTBEAT_TIMEOUT + HEARTBEAT_INTERVAL {
                        warn!(url = %self.config.url, "heartbeat timeout, reconnecting");
                        return;
                    }
                    if ws.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                        return;
                    }
                }
                frame = ws.next() => {
                    last_activity = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(text.as_bytes().to_vec(), handler, tracker, handle).await;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            self.dispatch(bytes.to_vec(), handler, tracker, handle).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            debug!(url = %self.config.url, ?frame, "endpoint closed connection");
                            return;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(err)) => {
                            warn!(url = %self.config.url, error = %err, "websocket read error");
                            return;
                        }
                        None => {
                            debug!(url = %self.config.url, "endpoint stream ended");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        payload: Vec<u8>,
        handler: &Handler,
        tracker: &mut BoundedTracker,
        handle: &Arc<SubscriberHandle>,
    ) {
        if payload.is_empty() {
            return;
        }
        if tracker.enter() {
            warn!(url = %self.config.url, "per-endpoint queue full, dropping oldest in-flight slot");
        }
        handle.queue_len.store(tracker.len, Ordering::Relaxed);

        let fut = handler(self.config.url.clone(), payload);
        if tokio::time::timeout(PROCESSING_DEADLINE, fut).await.is_err() {
            error!(url = %self.config.url, "message processing exceeded deadline");
        }
        tracker.leave();
        handle.queue_len.store(tracker.len, Ordering::Relaxed);
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str) -> Result<WsStream, SubscriberError> {
    let config = WebSocketConfig::default()
        .max_message_size(Some(MAX_INBOUND_FRAME_BYTES))
        .max_frame_size(Some(MAX_INBOUND_FRAME_BYTES));

    let (ws, _response) = tokio_tungstenite::connect_async_with_config(url, Some(config), false)
        .await
        .map_err(|err| SubscriberError::Connect(err.to_string()))?;
    Ok(ws)
}

async fn close_gracefully(ws: &mut WsStream) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, SinkExt::close(ws)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_tracker_drops_oldest_at_capacity() {
        let mut tracker = BoundedTracker::new(2);
        assert!(!tracker.enter());
        assert!(!tracker.enter());
        assert!(tracker.enter()); // at capacity, next entry reports a drop
        tracker.leave();
        assert!(!tracker.enter());
    }

    #[test]
    fn bounded_tracker_clamps_zero_to_one() {
        let tracker = BoundedTracker::new(0);
        assert_eq!(tracker.max, 1);
    }

    #[test]
    fn exhausted_respects_configured_cap() {
        let subscriber = EndpointSubscriber::new(SubscriberConfig {
            url: "wss://example.invalid".into(),
            init_payload: None,
            init_required: false,
            queue_max_size: 32,
            reconnect_delay: Duration::from_millis(1),
            max_reconnect_attempts: Some(3),
        });
        assert!(!subscriber.exhausted(2));
        assert!(subscriber.exhausted(3));
        assert!(subscriber.exhausted(4));
    }

    #[test]
    fn unbounded_reconnects_when_no_cap_configured() {
        let subscriber = EndpointSubscriber::new(SubscriberConfig {
            url: "wss://example.invalid".into(),
            init_payload: None,
            init_required: false,
            queue_max_size: 32,
            reconnect_delay: Duration::from_millis(1),
            max_reconnect_attempts: None,
        });
        assert!(!subscriber.exhausted(10_000));
    }
}
