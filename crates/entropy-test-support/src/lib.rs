//! Test-only helpers shared across the workspace's integration tests.
//!
//! A mock feed server for exercising `entropy_ws::EndpointSubscriber`
//! without a real upstream endpoint.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock WebSocket feed server for integration testing.
///
/// Binds to a random local port, accepts a single connection, records
/// whatever the client sends before its first frame is read back (the
/// subscribe/init payload), then streams a scripted sequence of text
/// frames to the client at the caller's pace via [`MockFeedServer::send`].
pub struct MockFeedServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    outbound: tokio::sync::mpsc::UnboundedSender<Message>,
    connections: Arc<AtomicUsize>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockFeedServer {
    /// Start the mock server. Returns immediately once the listener is bound.
    pub async fn start() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let task_received = received.clone();
        let task_connections = connections.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, task_received, rx, task_connections).await;
        });

        Ok(Self {
            addr,
            received,
            outbound: tx,
            connections,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Push a scripted text frame to the (most recent) connected client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.outbound.send(Message::Text(text.into().into()));
    }

    /// Push a scripted binary frame, e.g. invalid UTF-8 or an oversized
    /// payload, to the (most recent) connected client.
    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.outbound.send(Message::Binary(bytes.into()));
    }

    /// Every frame the client sent before the server began replaying the
    /// outbound script — i.e. subscribe and init-payload frames.
    pub async fn received(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    async fn accept_loop(
        listener: TcpListener,
        received: Arc<Mutex<Vec<String>>>,
        outbound: tokio::sync::mpsc::UnboundedReceiver<Message>,
        connections: Arc<AtomicUsize>,
    ) {
        let outbound = Arc::new(Mutex::new(outbound));
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    connections.fetch_add(1, Ordering::Relaxed);
                    let received = received.clone();
                    let outbound = outbound.clone();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream, received, outbound).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        received: Arc<Mutex<Vec<String>>>,
        outbound: Arc<Mutex<tokio::sync::mpsc::UnboundedReceiver<Message>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            received.lock().await.push(text.to_string());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
                outgoing = async {
                    let mut guard = outbound.lock().await;
                    guard.recv().await
                } => {
                    match outgoing {
                        Some(msg) => write.send(msg).await?,
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }
}
