//! Workspace transport session: one logical WebSocket kept alive across
//! network interruptions.
//!
//! ## State machine
//!
//! ```text
//!   DISCONNECTED / ERROR ──connect()──► CONNECTING ──open──► CONNECTED
//!          ▲                               ▲                    │
//!          │                               │ retry fires        │ close
//!   attempts exhausted                RECONNECTING ◄──schedule── DISCONNECTED
//!          │                                                    │
//!        ERROR ◄────────────────────────────────────────────────┘
//! ```
//!
//! Reconnect delay is `min(base · 2^attempt + jitter, 30s)` with
//! `jitter ∈ [0, 1000ms]`. At most one reconnect timer is outstanding.
//!
//! Each socket task carries the connection epoch it was started under.
//! Callbacks from an older epoch (a socket replaced by `connect` or torn down
//! by `disconnect`) are ignored.
//!
//! Outbound traffic takes the immediate path when the socket is open and
//! falls back to the [`DeliveryQueue`], whose send function retries the same
//! immediate path.

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::event_bus::{Event, InstrumentedEventBus, Subscription};
use crate::message::{Message, MessageBody, MessageError};
use crate::presence::{PresenceChange, PresenceConfig, PresenceTracker};
use crate::queue::{DeliveryError, DeliveryQueue, QueueConfig};

/// Upper bound on any reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Upper bound on the random component added to a reconnect delay.
pub const MAX_RECONNECT_JITTER: Duration = Duration::from_millis(1000);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base WebSocket endpoint; `workspaceId` and `token` are appended.
    pub url: String,
    /// Base of the exponential reconnect delay.
    pub reconnect_interval: Duration,
    /// Automatic reconnects allowed before giving up with `Error`.
    pub max_reconnect_attempts: u32,
    /// Presence heartbeat and sweep period.
    pub heartbeat_interval: Duration,
    /// Presence staleness threshold.
    pub inactivity_timeout: Duration,
    /// Bound on the WebSocket handshake.
    pub connection_timeout: Duration,
    /// Log every frame at debug level.
    pub debug: bool,
    pub queue: QueueConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(10),
            debug: false,
            queue: QueueConfig::default(),
        }
    }
}

/// Delay before reconnect attempt number `attempt`.
pub fn reconnect_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(20))
        .saturating_add(jitter)
        .min(MAX_RECONNECT_DELAY)
}

pub(crate) fn random_jitter() -> Duration {
    let max = MAX_RECONNECT_JITTER.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=max))
}

// ───────────────────────────────────────────────────────────────────
// Connection status
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Caller asked for a connection.
    Connect,
    /// Socket handshake completed.
    Opened,
    /// Socket reported an error.
    Failed,
    /// Socket closed.
    Closed,
    /// A reconnect timer was armed.
    ScheduleReconnect,
    /// The reconnect timer fired.
    RetryFired,
    /// No reconnect attempts left.
    Exhausted,
    /// Explicit teardown.
    Teardown,
}

impl ConnectionStatus {
    /// Transition table. `None` means the signal does not apply in this
    /// state and is ignored.
    pub fn apply(self, signal: Signal) -> Option<ConnectionStatus> {
        use ConnectionStatus::*;
        match (self, signal) {
            (Connected, Signal::Connect) => None,
            (_, Signal::Connect) => Some(Connecting),
            (Connecting, Signal::Opened) => Some(Connected),
            (Connecting | Connected, Signal::Failed) => Some(Error),
            (Connecting | Connected | Error, Signal::Closed) => Some(Disconnected),
            (Disconnected, Signal::ScheduleReconnect) => Some(Reconnecting),
            (Reconnecting, Signal::RetryFired) => Some(Connecting),
            (Disconnected, Signal::Exhausted) => Some(Error),
            (_, Signal::Teardown) => Some(Disconnected),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors and events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum TransportError {
    InvalidToken(String),
    InvalidUrl(String),
    NotConnected,
    Socket(String),
    Timeout,
    ReconnectExhausted(u32),
    Encode(MessageError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken(e) => write!(f, "Invalid auth token: {e}"),
            Self::InvalidUrl(e) => write!(f, "Invalid endpoint URL: {e}"),
            Self::NotConnected => write!(f, "Socket is not connected"),
            Self::Socket(e) => write!(f, "Socket error: {e}"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::ReconnectExhausted(n) => write!(f, "Gave up after {n} reconnect attempts"),
            Self::Encode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<MessageError> for TransportError {
    fn from(e: MessageError) -> Self {
        Self::Encode(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Connect,
    Disconnect,
    Message,
    Error,
    StatusChange,
    Presence,
    Reconnecting,
}

/// Everything a session publishes on its bus.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connect,
    Disconnect {
        reason: Option<String>,
    },
    Message(Message),
    Error(TransportError),
    StatusChange {
        previous: ConnectionStatus,
        current: ConnectionStatus,
    },
    Presence(PresenceChange),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
}

impl Event for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::Connect => TransportEventKind::Connect,
            TransportEvent::Disconnect { .. } => TransportEventKind::Disconnect,
            TransportEvent::Message(_) => TransportEventKind::Message,
            TransportEvent::Error(_) => TransportEventKind::Error,
            TransportEvent::StatusChange { .. } => TransportEventKind::StatusChange,
            TransportEvent::Presence(_) => TransportEventKind::Presence,
            TransportEvent::Reconnecting { .. } => TransportEventKind::Reconnecting,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Auth token and URL
// ───────────────────────────────────────────────────────────────────

/// Extract the user id (`sub`, else `userId`) from a bearer token's
/// base64url JSON payload segment.
pub fn user_id_from_token(token: &str) -> Result<String, TransportError> {
    let segment = token
        .split('.')
        .nth(1)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransportError::InvalidToken("missing payload segment".into()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| TransportError::InvalidToken(e.to_string()))?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|e| TransportError::InvalidToken(e.to_string()))?;

    ["sub", "userId"]
        .iter()
        .find_map(|key| match claims.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| TransportError::InvalidToken("no sub or userId claim".into()))
}

/// Append `workspaceId` and `token` query parameters to the endpoint.
pub fn connection_url(base: &str, workspace_id: &str, token: &str) -> Result<String, TransportError> {
    let mut url = url::Url::parse(base).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("workspaceId", workspace_id)
        .append_pair("token", token);
    Ok(url.into())
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

struct SessionState {
    status: ConnectionStatus,
    workspace_id: Option<String>,
    auth_token: Option<String>,
    user_id: Option<String>,
    reconnect_attempts: u32,
    epoch: u64,
    outgoing: Option<mpsc::UnboundedSender<WsMessage>>,
    socket_task: Option<JoinHandle<()>>,
    pending_reconnect: Option<JoinHandle<()>>,
    presence: Option<PresenceTracker>,
    presence_subscription: Option<Subscription>,
}

impl SessionState {
    fn transition(&mut self, signal: Signal, events: &mut Vec<TransportEvent>) -> bool {
        let previous = self.status;
        match previous.apply(signal) {
            Some(current) if current != previous => {
                self.status = current;
                log::info!("Connection status {previous:?} -> {current:?}");
                events.push(TransportEvent::StatusChange { previous, current });
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.pending_reconnect.take() {
            timer.abort();
        }
    }
}

struct SessionInner {
    config: TransportConfig,
    bus: InstrumentedEventBus<TransportEvent>,
    queue: DeliveryQueue,
    state: Mutex<SessionState>,
}

/// The connection state machine plus its queue and presence tracker.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<SessionInner>,
}

impl TransportSession {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_event_bus(config, InstrumentedEventBus::new())
    }

    /// Create a session that publishes on an existing bus.
    pub fn with_event_bus(config: TransportConfig, bus: InstrumentedEventBus<TransportEvent>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let session = weak.clone();
            let queue = DeliveryQueue::new(
                move |message: Message| {
                    let session = session.clone();
                    async move {
                        let inner = session
                            .upgrade()
                            .ok_or_else(|| DeliveryError::new("session dropped"))?;
                        TransportSession { inner }
                            .send_now(&message)
                            .map_err(|e| DeliveryError::new(e.to_string()))
                    }
                },
                config.queue.clone(),
            );
            SessionInner {
                config,
                bus,
                queue,
                state: Mutex::new(SessionState {
                    status: ConnectionStatus::Disconnected,
                    workspace_id: None,
                    auth_token: None,
                    user_id: None,
                    reconnect_attempts: 0,
                    epoch: 0,
                    outgoing: None,
                    socket_task: None,
                    pending_reconnect: None,
                    presence: None,
                    presence_subscription: None,
                }),
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.state.lock().user_id.clone()
    }

    pub fn workspace_id(&self) -> Option<String> {
        self.inner.state.lock().workspace_id.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    pub fn event_bus(&self) -> &InstrumentedEventBus<TransportEvent> {
        &self.inner.bus
    }

    /// Subscribe to one kind of transport event.
    pub fn on<F>(&self, kind: TransportEventKind, callback: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, callback)
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.inner.queue
    }

    /// The presence tracker for the current workspace, once `connect` ran.
    pub fn presence(&self) -> Option<PresenceTracker> {
        self.inner.state.lock().presence.clone()
    }

    /// Open the socket for `workspace_id`, authenticated by `auth_token`.
    ///
    /// A no-op when already connected. A malformed token fails here, before
    /// any state changes. Must be called from within a tokio runtime.
    pub fn connect(&self, workspace_id: &str, auth_token: &str) -> Result<(), TransportError> {
        let user_id = user_id_from_token(auth_token)?;
        connection_url(&self.inner.config.url, workspace_id, auth_token)?;
        if self.is_connected() {
            log::debug!("connect() ignored, already connected");
            return Ok(());
        }

        self.prepare_presence(&user_id, workspace_id);

        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.status == ConnectionStatus::Connected {
                return Ok(());
            }
            state.cancel_reconnect();
            state.reconnect_attempts = 0;
            state.workspace_id = Some(workspace_id.to_string());
            state.auth_token = Some(auth_token.to_string());
            state.user_id = Some(user_id);
            start_socket(&self.inner, &mut state, Signal::Connect, &mut events)?;
        }
        self.emit_all(events);
        Ok(())
    }

    /// Send now if the socket is open, otherwise hand the message to the
    /// delivery queue. Returns whether the immediate send succeeded.
    pub fn send_message(&self, message: Message) -> bool {
        let message = message.prepared();
        match self.send_now(&message) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Immediate send of {} failed ({e}), queueing", message.kind());
                self.inner.queue.enqueue(message);
                false
            }
        }
    }

    /// Write one frame on the open socket.
    fn send_now(&self, message: &Message) -> Result<(), TransportError> {
        let text = message.encode()?;
        let state = self.inner.state.lock();
        let outgoing = match (&state.outgoing, state.status) {
            (Some(tx), ConnectionStatus::Connected) => tx,
            _ => return Err(TransportError::NotConnected),
        };
        if self.inner.config.debug {
            log::debug!("-> {text}");
        }
        outgoing
            .send(WsMessage::Text(text.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Explicit teardown. Safe to call repeatedly and from any state.
    pub fn disconnect(&self) {
        // Cleaning presence first lets the final offline record go out on
        // the still-open socket.
        let presence = {
            let mut state = self.inner.state.lock();
            state.presence_subscription.take();
            state.presence.take()
        };
        if let Some(presence) = presence {
            presence.cleanup();
        }

        self.inner.queue.clear();
        self.inner.bus.remove_all_listeners(None);

        let mut state = self.inner.state.lock();
        state.epoch += 1;
        let was_connected = state.status == ConnectionStatus::Connected;
        // Dropping the sender closes the socket gracefully.
        state.outgoing = None;
        if let Some(task) = state.socket_task.take() {
            if !was_connected {
                task.abort();
            }
        }
        state.cancel_reconnect();
        state.reconnect_attempts = 0;
        // Listeners were removed above; the status change has no audience.
        let mut unheard = Vec::new();
        state.transition(Signal::Teardown, &mut unheard);
    }

    /// Reuse the tracker for the same user, otherwise replace it.
    /// Runs without the state lock held: tracker callbacks re-enter it.
    fn prepare_presence(&self, user_id: &str, workspace_id: &str) {
        let existing = self.inner.state.lock().presence.clone();
        if let Some(tracker) = existing {
            if tracker.local_user_id() == user_id {
                tracker.update_workspace(workspace_id);
                return;
            }
            let subscription = {
                let mut state = self.inner.state.lock();
                state.presence.take();
                state.presence_subscription.take()
            };
            if let Some(subscription) = subscription {
                subscription.unsubscribe();
            }
            tracker.cleanup();
        }

        let tracker = PresenceTracker::new(
            user_id,
            workspace_id,
            PresenceConfig {
                heartbeat_interval: self.inner.config.heartbeat_interval,
                inactivity_timeout: self.inner.config.inactivity_timeout,
            },
        );
        let session = Arc::downgrade(&self.inner);
        let subscription = tracker.on_presence_change(move |change| {
            if let Some(inner) = session.upgrade() {
                TransportSession { inner }.forward_presence(change);
            }
        });
        let mut state = self.inner.state.lock();
        state.presence = Some(tracker);
        state.presence_subscription = Some(subscription);
    }

    fn forward_presence(&self, change: &PresenceChange) {
        self.inner.bus.emit(&TransportEvent::Presence(change.clone()));
        if change.local {
            let message = Message::presence(change.record.clone()).prepared();
            if let Err(e) = self.send_now(&message) {
                log::debug!("Local presence not broadcast: {e}");
            }
        }
    }

    fn emit_all(&self, events: Vec<TransportEvent>) {
        for event in &events {
            self.inner.bus.emit(event);
        }
    }
}

/// Replace the socket with a fresh one. Caller holds the state lock.
fn start_socket(
    inner: &Arc<SessionInner>,
    state: &mut SessionState,
    signal: Signal,
    events: &mut Vec<TransportEvent>,
) -> Result<(), TransportError> {
    let (workspace_id, token) = match (&state.workspace_id, &state.auth_token) {
        (Some(w), Some(t)) => (w.clone(), t.clone()),
        _ => return Err(TransportError::NotConnected),
    };
    let url = connection_url(&inner.config.url, &workspace_id, &token)?;

    state.epoch += 1;
    state.outgoing = None;
    if let Some(old) = state.socket_task.take() {
        old.abort();
    }
    state.transition(signal, events);

    let epoch = state.epoch;
    let session = Arc::downgrade(inner);
    let timeout = inner.config.connection_timeout;
    state.socket_task = Some(tokio::spawn(run_socket(session, epoch, url, timeout)));
    Ok(())
}

async fn run_socket(session: Weak<SessionInner>, epoch: u64, url: String, timeout: Duration) {
    let ws = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            on_error(&session, epoch, TransportError::Socket(e.to_string()));
            on_close(&session, epoch, None);
            return;
        }
        Err(_) => {
            on_error(&session, epoch, TransportError::Timeout);
            on_close(&session, epoch, None);
            return;
        }
    };

    let (mut writer, mut reader) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    if !on_open(&session, epoch, tx) {
        return;
    }

    let mut reason = None;
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        on_error(&session, epoch, TransportError::Socket(e.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    break;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => on_frame(&session, epoch, text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    reason = frame.map(|f| f.reason.as_str().to_string());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    on_error(&session, epoch, TransportError::Socket(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    on_close(&session, epoch, reason);
}

/// Upgrade the session handle if `epoch` is still current.
fn current(session: &Weak<SessionInner>, epoch: u64) -> Option<TransportSession> {
    let inner = session.upgrade()?;
    let live = inner.state.lock().epoch == epoch;
    live.then_some(TransportSession { inner })
}

fn on_open(session: &Weak<SessionInner>, epoch: u64, tx: mpsc::UnboundedSender<WsMessage>) -> bool {
    let Some(session) = current(session, epoch) else {
        return false;
    };
    let mut events = Vec::new();
    let presence = {
        let mut state = session.inner.state.lock();
        if state.epoch != epoch {
            return false;
        }
        state.outgoing = Some(tx);
        state.reconnect_attempts = 0;
        state.transition(Signal::Opened, &mut events);
        events.push(TransportEvent::Connect);
        state.presence.clone()
    };
    log::info!("Connected to {}", session.inner.config.url);
    session.emit_all(events);
    if let Some(presence) = presence {
        presence.start();
    }
    true
}

fn on_error(session: &Weak<SessionInner>, epoch: u64, error: TransportError) {
    let Some(session) = current(session, epoch) else {
        return;
    };
    let mut events = Vec::new();
    {
        let mut state = session.inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.transition(Signal::Failed, &mut events);
    }
    log::warn!("Transport error: {error}");
    events.push(TransportEvent::Error(error));
    session.emit_all(events);
}

fn on_close(session: &Weak<SessionInner>, epoch: u64, reason: Option<String>) {
    let Some(session) = current(session, epoch) else {
        return;
    };
    let config = &session.inner.config;
    let mut events = Vec::new();
    let presence = {
        let mut state = session.inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.outgoing = None;
        // This is the socket task itself; let it finish on its own.
        state.socket_task = None;
        state.transition(Signal::Closed, &mut events);
        events.push(TransportEvent::Disconnect {
            reason: reason.clone(),
        });

        state.cancel_reconnect();
        if state.reconnect_attempts >= config.max_reconnect_attempts {
            state.transition(Signal::Exhausted, &mut events);
            log::error!(
                "Reconnect attempts exhausted ({}), giving up",
                state.reconnect_attempts
            );
            events.push(TransportEvent::Error(TransportError::ReconnectExhausted(
                state.reconnect_attempts,
            )));
        } else {
            state.reconnect_attempts += 1;
            let attempt = state.reconnect_attempts;
            let delay = reconnect_delay(config.reconnect_interval, attempt, random_jitter());
            let weak = Arc::downgrade(&session.inner);
            state.pending_reconnect = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                on_retry(&weak, epoch);
            }));
            state.transition(Signal::ScheduleReconnect, &mut events);
            log::info!(
                "Reconnect attempt {attempt}/{} in {delay:?}",
                config.max_reconnect_attempts
            );
            events.push(TransportEvent::Reconnecting { attempt, delay });
        }
        state.presence.clone()
    };

    session.emit_all(events);
    if let Some(presence) = presence {
        presence.stop();
    }
}

fn on_retry(session: &Weak<SessionInner>, epoch: u64) {
    let Some(session) = current(session, epoch) else {
        return;
    };
    let mut events = Vec::new();
    {
        let mut state = session.inner.state.lock();
        if state.epoch != epoch || state.status != ConnectionStatus::Reconnecting {
            return;
        }
        // This timer is the pending one; dropping the handle detaches it.
        state.pending_reconnect = None;
        if let Err(e) = start_socket(&session.inner, &mut state, Signal::RetryFired, &mut events) {
            log::error!("Reconnect could not start: {e}");
        }
    }
    session.emit_all(events);
}

/// Decode and route one inbound text frame. Malformed frames are dropped.
fn on_frame(session: &Weak<SessionInner>, epoch: u64, text: &str) {
    let Some(session) = current(session, epoch) else {
        return;
    };
    if session.inner.config.debug {
        log::debug!("<- {text}");
    }

    let message = match Message::decode(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping malformed frame: {e}");
            return;
        }
    };

    if let MessageBody::Presence(record) = &message.body {
        if let Some(presence) = session.presence() {
            presence.update_presence(&record.user_id, record.clone());
        }
    }

    session.inner.bus.emit(&TransportEvent::Message(message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with(claims: Value) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.reconnect_interval, Duration::from_millis(1000));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert!(!config.debug);
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let base = Duration::from_millis(1000);
        let none = Duration::ZERO;
        assert_eq!(reconnect_delay(base, 1, none), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(base, 2, none), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(base, 3, none), Duration::from_millis(8000));
        assert_eq!(reconnect_delay(base, 3, Duration::from_millis(999)), Duration::from_millis(8999));
        assert_eq!(reconnect_delay(base, 5, none), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(base, 40, none), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn test_random_jitter_bounded() {
        for _ in 0..100 {
            assert!(random_jitter() <= MAX_RECONNECT_JITTER);
        }
    }

    #[test]
    fn test_status_transition_table() {
        use ConnectionStatus::*;
        assert_eq!(Disconnected.apply(Signal::Connect), Some(Connecting));
        assert_eq!(Error.apply(Signal::Connect), Some(Connecting));
        assert_eq!(Connected.apply(Signal::Connect), None);
        assert_eq!(Connecting.apply(Signal::Opened), Some(Connected));
        assert_eq!(Connected.apply(Signal::Closed), Some(Disconnected));
        assert_eq!(Error.apply(Signal::Closed), Some(Disconnected));
        assert_eq!(Disconnected.apply(Signal::ScheduleReconnect), Some(Reconnecting));
        assert_eq!(Reconnecting.apply(Signal::RetryFired), Some(Connecting));
        assert_eq!(Disconnected.apply(Signal::Exhausted), Some(Error));
        assert_eq!(Connected.apply(Signal::Failed), Some(Error));

        // Signals that do not apply are ignored.
        assert_eq!(Disconnected.apply(Signal::Opened), None);
        assert_eq!(Reconnecting.apply(Signal::Failed), None);
        assert_eq!(Connected.apply(Signal::RetryFired), None);

        for status in [Connecting, Connected, Disconnected, Reconnecting, Error] {
            assert_eq!(status.apply(Signal::Teardown), Some(Disconnected));
        }
    }

    #[test]
    fn test_user_id_from_sub_claim() {
        let token = token_with(json!({"sub": "user-42", "userId": "ignored"}));
        assert_eq!(user_id_from_token(&token).unwrap(), "user-42");
    }

    #[test]
    fn test_user_id_from_user_id_claim() {
        let token = token_with(json!({"userId": 7}));
        assert_eq!(user_id_from_token(&token).unwrap(), "7");
    }

    #[test]
    fn test_user_id_from_padded_segment() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"sub":"ab"}"#);
        let token = format!("h.{payload}.s");
        assert_eq!(user_id_from_token(&token).unwrap(), "ab");
    }

    #[test]
    fn test_malformed_tokens_fail() {
        assert!(matches!(user_id_from_token("no-dots"), Err(TransportError::InvalidToken(_))));
        assert!(matches!(user_id_from_token("a..c"), Err(TransportError::InvalidToken(_))));
        assert!(matches!(user_id_from_token("a.!!!.c"), Err(TransportError::InvalidToken(_))));
        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode("plain text"));
        assert!(matches!(user_id_from_token(&not_json), Err(TransportError::InvalidToken(_))));
        let no_claim = token_with(json!({"name": "Alice"}));
        assert!(matches!(user_id_from_token(&no_claim), Err(TransportError::InvalidToken(_))));
    }

    #[test]
    fn test_connection_url_appends_query() {
        let url = connection_url("ws://localhost:9090/ws", "ws 1", "a.b.c").unwrap();
        assert_eq!(url, "ws://localhost:9090/ws?workspaceId=ws+1&token=a.b.c");

        let url = connection_url("ws://localhost:9090/ws?v=2", "w", "t").unwrap();
        assert_eq!(url, "ws://localhost:9090/ws?v=2&workspaceId=w&token=t");

        assert!(matches!(connection_url("not a url", "w", "t"), Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(TransportEvent::Connect.kind(), TransportEventKind::Connect);
        assert_eq!(
            TransportEvent::Disconnect { reason: None }.kind(),
            TransportEventKind::Disconnect
        );
        assert_eq!(
            TransportEvent::Reconnecting { attempt: 1, delay: Duration::ZERO }.kind(),
            TransportEventKind::Reconnecting
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_token() {
        let session = TransportSession::new(TransportConfig::default());
        let result = session.connect("ws1", "garbage");

        assert!(matches!(result, Err(TransportError::InvalidToken(_))));
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert!(session.presence().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_while_disconnected_queues() {
        let session = TransportSession::new(TransportConfig::default());

        assert!(!session.send_message(Message::chat("hello")));
        assert_eq!(session.queue().get_queue_length(), 1);
        let pending = session.queue().get_pending_messages();
        assert!(pending[0].message.id.is_some());

        session.disconnect();
        assert_eq!(session.queue().get_queue_length(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let session = TransportSession::new(TransportConfig::default());
        session.disconnect();
        session.disconnect();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert_eq!(session.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_ends_in_error() {
        // Reserve a port, then free it so connections are refused.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = TransportConfig {
            url: format!("ws://127.0.0.1:{port}/ws"),
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 3,
            connection_timeout: Duration::from_secs(2),
            ..TransportConfig::default()
        };
        let session = TransportSession::new(config);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let s = statuses.clone();
        session.on(TransportEventKind::StatusChange, move |event| {
            if let TransportEvent::StatusChange { current, .. } = event {
                s.lock().push(*current);
            }
        });
        let delays = Arc::new(Mutex::new(Vec::new()));
        let d = delays.clone();
        session.on(TransportEventKind::Reconnecting, move |event| {
            if let TransportEvent::Reconnecting { attempt, delay } = event {
                d.lock().push((*attempt, *delay));
            }
        });

        session
            .connect("ws1", &token_with(json!({"sub": "me"})))
            .unwrap();

        for _ in 0..120 {
            if session.status() == ConnectionStatus::Error && delays.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        assert_eq!(session.status(), ConnectionStatus::Error);
        assert_eq!(statuses.lock().last(), Some(&ConnectionStatus::Error));

        let delays = delays.lock().clone();
        let attempts: Vec<u32> = delays.iter().map(|(a, _)| *a).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        for ((_, delay), base_ms) in delays.iter().zip([2000u64, 4000, 8000]) {
            assert!(*delay >= Duration::from_millis(base_ms), "{delay:?}");
            assert!(*delay <= Duration::from_millis(base_ms + 1000), "{delay:?}");
        }

        // Terminal: no further automatic attempts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(session.status(), ConnectionStatus::Error);
        assert_eq!(delays.len(), 3);

        // Teardown leaves the terminal state.
        session.disconnect();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert_eq!(session.reconnect_attempts(), 0);
    }
}
