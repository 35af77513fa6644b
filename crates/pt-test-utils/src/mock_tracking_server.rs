// mock_tracking_server: A mock tracking-events WebSocket server.
//
// Accepts connections on ws://127.0.0.1:<port>/ws, records the upgrade
// request and every client message, acknowledges subscribe/unsubscribe/ping
// the way the real endpoint does, and lets tests push server messages or
// close connections with a chosen code.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pt_protocol::ClientMessage;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};

/// What a client sent in its upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Path and query, e.g. `/ws?user_id=42`.
    pub uri: String,
    pub authorization: Option<String>,
}

impl UpgradeRequest {
    pub fn query_param(&self, key: &str) -> Option<String> {
        let (_, query) = self.uri.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == key).then(|| v.to_owned())
        })
    }
}

struct Peer {
    outbound: mpsc::UnboundedSender<Message>,
    task: AbortHandle,
}

#[derive(Default)]
struct Shared {
    received: Vec<Value>,
    upgrades: Vec<UpgradeRequest>,
    peers: Vec<Peer>,
}

/// A mock tracking-events server for integration testing.
///
/// Binds to port 0 (random).  Each test spins up its own isolated instance.
pub struct MockTrackingServer {
    addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    /// Handle to the background accept loop; aborted when the server is dropped.
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MockTrackingServer {
    fn drop(&mut self) {
        self.task.abort();
        self.drop_all();
    }
}

impl MockTrackingServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Mutex::new(Shared::default()));

        let loop_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, loop_shared).await;
        });

        Ok(Self { addr, shared, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://127.0.0.1:<port>/ws`
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Every JSON message received so far, across all connections, in order.
    pub fn received(&self) -> Vec<Value> {
        self.shared.lock().unwrap().received.clone()
    }

    /// Received messages whose `action` equals `action`.
    pub fn received_actions(&self, action: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m["action"] == action)
            .collect()
    }

    pub fn upgrades(&self) -> Vec<UpgradeRequest> {
        self.shared.lock().unwrap().upgrades.clone()
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        let mut shared = self.shared.lock().unwrap();
        shared.peers.retain(|p| !p.outbound.is_closed());
        shared.peers.len()
    }

    /// Send `message` to every open connection.  Returns how many got it.
    pub fn push(&self, message: Value) -> usize {
        let text = message.to_string();
        let shared = self.shared.lock().unwrap();
        shared
            .peers
            .iter()
            .filter(|p| p.outbound.send(Message::Text(text.clone().into())).is_ok())
            .count()
    }

    /// Close every open connection with a close frame carrying `code`.
    pub fn close_all(&self, code: u16) {
        let peers = std::mem::take(&mut self.shared.lock().unwrap().peers);
        for peer in peers {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            };
            let _ = peer.outbound.send(Message::Close(Some(frame)));
        }
    }

    /// Drop every open connection without a close frame.
    pub fn drop_all(&self) {
        let peers = match self.shared.lock() {
            Ok(mut shared) => std::mem::take(&mut shared.peers),
            Err(_) => return,
        };
        for peer in peers {
            peer.task.abort();
        }
    }

    /// Poll until at least `count` messages have been received.
    ///
    /// Panics on timeout.
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {count} messages, got {}: {received:?}",
                    received.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until at least `count` upgrade requests have been accepted in
    /// total.  Panics on timeout.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.shared.lock().unwrap().upgrades.len();
            if seen >= count {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {count} connections, got {seen}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // -- internal --

    /// Accepts TCP connections and spawns a handshake task per connection.
    async fn accept_loop(listener: TcpListener, shared: Arc<Mutex<Shared>>) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                // In tests, handshake errors are expected (e.g. client drops).
                let _ = Self::accept_connection(stream, &shared).await;
            });
        }
    }

    async fn accept_connection(
        stream: TcpStream,
        shared: &Arc<Mutex<Shared>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut upgrade = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            upgrade = Some(UpgradeRequest {
                uri: request.uri().to_string(),
                authorization: request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned),
            });
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::handle_connection(
            ws_stream,
            rx,
            outbound.clone(),
            Arc::clone(shared),
        ));

        let mut guard = shared.lock().unwrap();
        if let Some(upgrade) = upgrade {
            guard.upgrades.push(upgrade);
        }
        guard.peers.push(Peer {
            outbound,
            task: task.abort_handle(),
        });
        Ok(())
    }

    async fn handle_connection(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        replies: mpsc::UnboundedSender<Message>,
        shared: Arc<Mutex<Shared>>,
    ) {
        let (mut write, mut read) = ws_stream.split();
        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(msg) = outgoing else { break };
                    let closing = matches!(msg, Message::Close(_));
                    if write.send(msg).await.is_err() || closing {
                        // Let the client's close reply drain before dropping.
                        if closing {
                            while let Some(Ok(_)) = read.next().await {}
                        }
                        break;
                    }
                }
                incoming = read.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => continue,
                    };
                    let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    if let Some(reply) = Self::auto_reply(&value) {
                        let _ = replies.send(Message::Text(reply.to_string().into()));
                    }
                    shared.lock().unwrap().received.push(value);
                }
            }
        }
    }

    fn auto_reply(message: &Value) -> Option<Value> {
        let reply = match ClientMessage::deserialize(message).ok()? {
            ClientMessage::Subscribe { package_code, .. } => json!({
                "action": "subscribed",
                "package_code": package_code,
            }),
            ClientMessage::Unsubscribe { package_code } => json!({
                "action": "unsubscribed",
                "package_code": package_code,
            }),
            ClientMessage::Ping => json!({"action": "pong"}),
        };
        Some(reply)
    }
}
