//! Tracking-events WebSocket connection manager.
//!
//! Owns the single physical connection to the tracking endpoint and its
//! bookkeeping: state, reconnect attempts, heartbeat and reconnect deadlines.
//! Socket I/O runs in a per-connection link task that only forwards frames;
//! every decision is made synchronously in [`ConnectionManager::handle_event`]
//! and [`ConnectionManager::on_timer`], driven by the owning session loop.
//!
//! # Lifecycle
//! 1. `connect()` dials `ws_url?user_id=<id>` with a Bearer header when a token
//!    is configured.  No-op while connecting or connected.
//! 2. On open: state `connected`, attempts reset, heartbeat scheduled.
//! 3. On close with code 1000: state `disconnected`, nothing scheduled.
//! 4. On any other close or a failed dial: reconnect after
//!    `base_delay * attempt` while `attempt <= max_attempts`, else `error`.
//! 5. `disconnect()` sends close code 1000 and clears every timer.

use futures_util::{SinkExt, StreamExt};
use pt_protocol::{ClientMessage, ControlAction, DomainEvent, ServerMessage};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tracing::{debug, error, info, trace, warn};

use crate::config::ReconnectConfig;
use crate::identity::user_id_from_token;

/// Close code for an intentional, clean shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL of the tracking endpoint, e.g. `wss://track.example.com/ws`.
    pub ws_url: String,
    /// Identity token; sent as a Bearer header and used to derive `user_id`.
    pub token: Option<String>,
    pub reconnect: ReconnectConfig,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted.  Only an explicit `connect()` leaves it.
    Error,
}

/// What observers see on the status channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

/// Raw input from link tasks.  Every event carries the generation of the
/// connection it belongs to; events from older generations are ignored.
#[derive(Debug)]
pub enum ConnEvent {
    Opened {
        generation: u64,
        outbound: mpsc::UnboundedSender<Message>,
    },
    Inbound {
        generation: u64,
        text: String,
    },
    /// `code` is `None` when the socket ended without a close frame.
    Closed {
        generation: u64,
        code: Option<u16>,
    },
    DialFailed {
        generation: u64,
        error: String,
    },
}

/// What the owning session needs to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection is usable.  `resumed` is true after a reconnect.
    Ready { resumed: bool },
    Event(DomainEvent),
    Lost,
}

/// Observer for every decoded inbound frame.
pub type MessageHandler = Box<dyn FnMut(&ServerMessage) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid tracking URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("invalid upgrade request: {0}")]
    Request(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid auth header: {0}")]
    Header(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

pub struct ConnectionManager {
    config: ConnectionConfig,
    user_id: Option<String>,
    state: ConnectionState,
    last_error: Option<String>,
    reconnect_attempts: u32,
    generation: u64,
    has_connected: bool,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    link: Option<JoinHandle<()>>,
    reconnect_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    status_tx: watch::Sender<ConnectionSnapshot>,
    on_message: Option<MessageHandler>,
}

impl ConnectionManager {
    /// Create an idle manager and the receiver its link tasks report to.
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<ConnEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionSnapshot::default());
        let user_id = config.token.as_deref().and_then(user_id_from_token);
        let manager = Self {
            config,
            user_id,
            state: ConnectionState::Disconnected,
            last_error: None,
            reconnect_attempts: 0,
            generation: 0,
            has_connected: false,
            outbound: None,
            link: None,
            reconnect_at: None,
            heartbeat_at: None,
            events_tx,
            status_tx,
            on_message: None,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            last_error: self.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.status_tx.subscribe()
    }

    /// Replace the raw-message observer.  The manager always dispatches to
    /// whatever is registered at the time a frame arrives.
    pub fn set_message_handler(&mut self, handler: Option<MessageHandler>) {
        self.on_message = handler;
    }

    /// Earliest pending reconnect or heartbeat deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.heartbeat_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Open the connection unless one is open or in progress.
    ///
    /// Called from `error` this starts a fresh retry budget.
    pub fn connect(&mut self) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!(state = ?self.state, "connect ignored: already active");
                return;
            }
            ConnectionState::Error => {
                self.reconnect_attempts = 0;
                self.last_error = None;
            }
            ConnectionState::Disconnected => {}
        }
        self.reconnect_at = None;
        self.dial();
    }

    /// Close with code 1000 and drop all bookkeeping.  Nothing is scheduled
    /// after this returns.
    pub fn disconnect(&mut self) {
        self.generation += 1;
        if let Some(outbound) = self.outbound.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            };
            let _ = outbound.send(Message::Close(Some(frame)));
            // The link task flushes the close frame and exits on its own.
            self.link = None;
        } else if let Some(link) = self.link.take() {
            link.abort();
        }
        self.reconnect_at = None;
        self.heartbeat_at = None;
        self.reconnect_attempts = 0;
        self.has_connected = false;
        self.last_error = None;
        self.set_state(ConnectionState::Disconnected);
        info!("tracking connection closed by client");
    }

    /// Serialize and send `msg` if connected.  Returns whether it was handed
    /// to the link; loss while the link is down is expected.
    pub fn send_message(&self, msg: &ClientMessage) -> bool {
        if self.state != ConnectionState::Connected {
            debug!(?msg, state = ?self.state, "not connected, message not sent");
            return false;
        }
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match serde_json::to_string(msg) {
            Ok(json) => outbound.send(Message::Text(json.into())).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to serialize client message");
                false
            }
        }
    }

    /// Process one link event.
    pub fn handle_event(&mut self, event: ConnEvent, now: Instant) -> Option<ConnectionSignal> {
        match event {
            ConnEvent::Opened {
                generation,
                outbound,
            } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "dropping stale link");
                    return None;
                }
                let resumed = self.has_connected;
                self.has_connected = true;
                self.outbound = Some(outbound);
                self.reconnect_attempts = 0;
                self.last_error = None;
                self.reconnect_at = None;
                self.heartbeat_at = Some(now + self.config.heartbeat_interval);
                self.set_state(ConnectionState::Connected);
                info!(generation, resumed, "tracking connection established");
                Some(ConnectionSignal::Ready { resumed })
            }
            ConnEvent::Inbound { generation, text } => {
                if generation != self.generation {
                    return None;
                }
                self.dispatch(&text)
            }
            ConnEvent::Closed { generation, code } => {
                if generation != self.generation {
                    return None;
                }
                self.outbound = None;
                self.link = None;
                self.heartbeat_at = None;
                if code == Some(NORMAL_CLOSURE) {
                    info!(generation, "tracking connection closed normally");
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    warn!(generation, ?code, "tracking connection lost");
                    self.last_error = Some(match code {
                        Some(code) => format!("connection closed with code {code}"),
                        None => "connection dropped".to_owned(),
                    });
                    self.schedule_reconnect(now);
                }
                Some(ConnectionSignal::Lost)
            }
            ConnEvent::DialFailed { generation, error } => {
                if generation != self.generation {
                    return None;
                }
                warn!(generation, error = %error, "tracking connection failed");
                self.link = None;
                self.last_error = Some(error);
                self.schedule_reconnect(now);
                None
            }
        }
    }

    /// Fire any reconnect or heartbeat deadline that has passed.
    pub fn on_timer(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            info!(attempt = self.reconnect_attempts, "reconnecting");
            self.dial();
        }
        if self.heartbeat_at.is_some_and(|at| at <= now) {
            self.heartbeat_at = Some(now + self.config.heartbeat_interval);
            if !self.send_message(&ClientMessage::Ping) {
                debug!("heartbeat skipped");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn dial(&mut self) {
        let request = match build_ws_request(
            &self.config.ws_url,
            self.config.token.as_deref(),
            self.user_id.as_deref(),
        ) {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "cannot build tracking connection request");
                self.last_error = Some(e.to_string());
                self.set_state(ConnectionState::Error);
                return;
            }
        };
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        debug!(generation, url = %request.uri(), "dialing tracking endpoint");
        self.link = Some(tokio::spawn(run_link(
            generation,
            request,
            self.events_tx.clone(),
        )));
    }

    /// Linear backoff: attempt `k` waits `base_delay * k`.
    fn schedule_reconnect(&mut self, now: Instant) {
        let max = self.config.reconnect.max_attempts;
        if self.reconnect_attempts < max {
            self.reconnect_attempts += 1;
            let delay = self.config.reconnect.base_delay * self.reconnect_attempts;
            self.reconnect_at = Some(now + delay);
            info!(
                attempt = self.reconnect_attempts,
                max,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            self.set_state(ConnectionState::Disconnected);
        } else {
            self.reconnect_at = None;
            self.last_error = Some(format!(
                "giving up after {max} reconnect attempts: {}",
                self.last_error.as_deref().unwrap_or("connection lost")
            ));
            error!(max, "reconnect attempts exhausted");
            self.set_state(ConnectionState::Error);
        }
    }

    fn dispatch(&mut self, text: &str) -> Option<ConnectionSignal> {
        let msg = match ServerMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping malformed tracking message");
                return None;
            }
        };
        if let Some(handler) = self.on_message.as_mut() {
            handler(&msg);
        }
        match msg {
            ServerMessage::Control(ControlAction::Pong) => {
                trace!("pong");
                None
            }
            ServerMessage::Control(control) => {
                debug!(?control, "control acknowledged");
                None
            }
            ServerMessage::Event(event) => Some(ConnectionSignal::Event(event)),
            ServerMessage::Unknown { action } => {
                warn!(%action, "ignoring unrecognized tracking action");
                None
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let next = self.snapshot();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Upgrade request
// ---------------------------------------------------------------------------

/// Build the upgrade request: `user_id` query parameter when known, Bearer
/// header when a token is configured.  Goes through `IntoClientRequest` so the
/// WebSocket upgrade headers are populated.
pub fn build_ws_request(
    ws_url: &str,
    token: Option<&str>,
    user_id: Option<&str>,
) -> Result<Request, ConnectError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut url = url::Url::parse(ws_url).map_err(|source| ConnectError::InvalidUrl {
        url: ws_url.to_owned(),
        source,
    })?;
    if let Some(user_id) = user_id {
        url.query_pairs_mut().append_pair("user_id", user_id);
    }

    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = token {
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse()?);
    }
    Ok(request)
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// Dial, then pump frames both ways until either side closes.
async fn run_link(generation: u64, request: Request, events: mpsc::UnboundedSender<ConnEvent>) {
    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send(ConnEvent::DialFailed {
                generation,
                error: e.to_string(),
            });
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    if events
        .send(ConnEvent::Opened {
            generation,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return;
    }

    let code = loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = sink.send(msg).await {
                        debug!(generation, error = %e, "send failed");
                        break None;
                    }
                    if closing {
                        break Some(NORMAL_CLOSURE);
                    }
                }
                // Manager dropped the sender without a close frame.
                None => break Some(NORMAL_CLOSURE),
            },
            frame = stream.next() => match frame {
                None => break None,
                Some(Err(e)) => {
                    debug!(generation, error = %e, "read failed");
                    break None;
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ConnEvent::Inbound {
                        generation,
                        text: text.as_str().to_owned(),
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    // 1005: closed without a status code.
                    break Some(frame.map(|f| u16::from(f.code)).unwrap_or(1005));
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol.
                Some(Ok(_)) => {}
            },
        }
    };
    let _ = sink.close().await;
    let _ = events.send(ConnEvent::Closed { generation, code });
}
