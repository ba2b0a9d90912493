//! Registry of per-document CRDT sessions.
//!
//! Each entry owns one [`DocumentSession`]: a `yrs` document plus the
//! [`SyncChannel`] that keeps it in step with other peers. Entries are
//! reference-counted by listener id and reaped either when the last listener
//! leaves or, with no listeners, after sitting idle past
//! [`PoolConfig::max_inactive_time`].
//!
//! Disposal always runs in the same order: disconnect the channel, release
//! the document, remove the entry. All map mutations happen under one lock
//! and never yield.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::event_bus::{InstrumentedEventBus, DEFAULT_MAX_LISTENERS};
use crate::protocol::{PeerInfo, ProtocolError};
use crate::sync::{SyncChannel, SyncEvent};
use crate::transport::{random_jitter, reconnect_delay, TransportEvent};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle time after which a listener-less entry is reaped.
    pub max_inactive_time: Duration,
    pub sweep_interval: Duration,
    /// Base delay before a dropped document channel reconnects. Doubles per
    /// failed attempt, capped like the transport's reconnect delay.
    pub reconnect_interval: Duration,
    /// Soft listener ceiling for the shared event bus.
    pub max_listeners: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_inactive_time: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            reconnect_interval: Duration::from_millis(1000),
            max_listeners: DEFAULT_MAX_LISTENERS,
        }
    }
}

/// Room name used for a document's sync channel.
pub fn document_room(document_id: &str) -> String {
    format!("doc-{document_id}")
}

// ───────────────────────────────────────────────────────────────────
// Document session
// ───────────────────────────────────────────────────────────────────

/// A shared CRDT document and its sync channel.
pub struct DocumentSession {
    document_id: String,
    channel: SyncChannel,
    doc: Mutex<Option<Doc>>,
    peers: Mutex<HashSet<Uuid>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentSession {
    /// Create the session and start connecting in the background.
    fn open(document_id: &str, endpoint: &str, peer: PeerInfo, reconnect_interval: Duration) -> Arc<Self> {
        let channel = SyncChannel::new(peer, document_room(document_id), endpoint);
        let events = channel.take_event_rx();
        let session = Arc::new(Self {
            document_id: document_id.to_string(),
            channel,
            doc: Mutex::new(Some(Doc::new())),
            peers: Mutex::new(HashSet::new()),
            sync_task: Mutex::new(None),
        });

        if let Some(events) = events {
            let task = tokio::spawn(run_sync(Arc::downgrade(&session), events, reconnect_interval));
            *session.sync_task.lock() = Some(task);
        }
        session
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn room(&self) -> &str {
        self.channel.room()
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Whether the document has been released by disposal.
    pub fn is_released(&self) -> bool {
        self.doc.lock().is_none()
    }

    /// Remote peers currently joined to the room.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Read access to the document. `None` once released.
    pub fn with_doc<R>(&self, f: impl FnOnce(&Doc) -> R) -> Option<R> {
        self.doc.lock().as_ref().map(f)
    }

    /// Apply a local change and ship the resulting update.
    ///
    /// While disconnected the update is queued and replayed on connect.
    pub fn edit<F>(&self, f: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        // `Doc` is a shared handle; `f` runs without the session lock held.
        let doc = self.doc.lock().clone().ok_or(ProtocolError::ConnectionClosed)?;
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            f(&mut txn);
        }
        let update = doc.transact().encode_diff_v1(&before);
        self.channel.send_delta(update)
    }

    /// Full document state as a v1 update.
    pub fn encode_state(&self) -> Option<Vec<u8>> {
        self.with_doc(|doc| doc.transact().encode_state_as_update_v1(&StateVector::default()))
    }

    fn state_vector(&self) -> Option<Vec<u8>> {
        self.with_doc(|doc| doc.transact().state_vector().encode_v1())
    }

    fn apply_update(&self, bytes: &[u8]) {
        let update = match Update::decode_v1(bytes) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping undecodable update for {}: {e}", self.document_id);
                return;
            }
        };
        let guard = self.doc.lock();
        if let Some(doc) = guard.as_ref() {
            let mut txn = doc.transact_mut();
            let _ = txn.apply_update(update);
        }
    }

    fn answer_state(&self, state_vector: &[u8]) {
        let remote = match StateVector::decode_v1(state_vector) {
            Ok(sv) => sv,
            Err(e) => {
                log::warn!("Bad state vector for {}: {e}", self.document_id);
                return;
            }
        };
        let Some(diff) = self.with_doc(|doc| doc.transact().encode_diff_v1(&remote)) else {
            return;
        };
        if let Err(e) = self.channel.send_state(diff) {
            log::debug!("State reply for {} not sent: {e}", self.document_id);
        }
    }

    fn handle(&self, event: SyncEvent) {
        match event {
            SyncEvent::RemoteDelta { update, .. } | SyncEvent::StateSynced(update) => {
                self.apply_update(&update);
            }
            SyncEvent::StateRequested { state_vector, .. } => self.answer_state(&state_vector),
            SyncEvent::PeerJoined(info) => {
                log::debug!("{} joined {}", info.name, self.document_id);
                self.peers.lock().insert(info.peer_id);
            }
            SyncEvent::PeerLeft(peer_id) => {
                self.peers.lock().remove(&peer_id);
            }
            // Remote peers re-announce themselves after the next handshake.
            SyncEvent::Disconnected => self.peers.lock().clear(),
            SyncEvent::Connected => {}
        }
    }

    /// Disconnect the channel, then drop the document. Idempotent.
    fn release(&self) {
        self.channel.disconnect();
        self.channel.clear_offline();
        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
        }
        self.doc.lock().take();
        self.peers.lock().clear();
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Keep the channel connected for as long as the session lives, routing its
/// events into the document. Every (re)connect sends a fresh state vector.
async fn run_sync(
    session: Weak<DocumentSession>,
    mut events: mpsc::UnboundedReceiver<SyncEvent>,
    reconnect_interval: Duration,
) {
    let mut attempt = 0u32;
    loop {
        let connecting = session
            .upgrade()
            .and_then(|s| s.state_vector().map(|sv| (s.channel.clone(), sv)));
        let Some((channel, state_vector)) = connecting else {
            return;
        };
        match channel.connect(state_vector).await {
            Ok(()) => attempt = 0,
            Err(e) => log::warn!("Document channel {} unavailable: {e}", channel.room()),
        }
        let room = channel.room().to_string();
        let connected = channel.is_connected();
        drop(channel);

        if connected {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    return;
                };
                let lost = matches!(event, SyncEvent::Disconnected);
                session.handle(event);
                if lost {
                    break;
                }
            }
        }

        let delay = reconnect_delay(reconnect_interval, attempt, random_jitter());
        attempt = attempt.saturating_add(1);
        log::info!("Reconnecting document channel {room} in {delay:?} (attempt {attempt})");
        tokio::time::sleep(delay).await;
    }
}

// ───────────────────────────────────────────────────────────────────
// Pool
// ───────────────────────────────────────────────────────────────────

struct PooledEntry {
    session: Arc<DocumentSession>,
    listeners: HashSet<String>,
    last_used: Instant,
    created_at: Instant,
}

/// Per-document snapshot inside [`PoolStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub document_id: String,
    pub room: String,
    pub listeners: usize,
    pub connected: bool,
    pub peers: usize,
    pub offline_deltas: usize,
    pub idle_for: Duration,
    pub age: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    /// Entries with no listeners.
    pub idle_connections: usize,
    pub total_listeners: usize,
    pub connections: Vec<ConnectionInfo>,
}

struct PoolInner {
    config: PoolConfig,
    peer: PeerInfo,
    entries: Mutex<HashMap<String, PooledEntry>>,
    bus: InstrumentedEventBus<TransportEvent>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

/// Owned registry of document sessions. Clones share the registry.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool with an anonymous peer identity.
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_peer(config, PeerInfo::new("anonymous"))
    }

    pub fn with_peer(config: PoolConfig, peer: PeerInfo) -> Self {
        let bus = InstrumentedEventBus::with_max_listeners(config.max_listeners);
        let inner = Arc::new(PoolInner {
            config,
            peer,
            entries: Mutex::new(HashMap::new()),
            bus,
            sweep: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let period = inner.config.sweep_interval;
        let sweep = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionPool { inner }.sweep_idle();
            }
        });
        *inner.sweep.lock() = Some(sweep);

        Self { inner }
    }

    /// Configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// Bus shared with transport sessions built by the same composition root.
    pub fn event_bus(&self) -> &InstrumentedEventBus<TransportEvent> {
        &self.inner.bus
    }

    /// Return the session for `document_id`, creating it on first use.
    /// Reuse refreshes the entry's idle clock.
    pub fn get_connection(&self, document_id: &str, endpoint: &str) -> Arc<DocumentSession> {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(document_id) {
            entry.last_used = Instant::now();
            return entry.session.clone();
        }

        let session = DocumentSession::open(
            document_id,
            endpoint,
            self.inner.peer.clone(),
            self.inner.config.reconnect_interval,
        );
        let now = Instant::now();
        entries.insert(
            document_id.to_string(),
            PooledEntry {
                session: session.clone(),
                listeners: HashSet::new(),
                last_used: now,
                created_at: now,
            },
        );
        log::info!("Opened document session {}", session.room());
        session
    }

    pub fn has_connection(&self, document_id: &str) -> bool {
        self.inner.entries.lock().contains_key(document_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns `false` when no entry exists for `document_id`.
    pub fn register_listener(&self, document_id: &str, listener_id: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(document_id) {
            Some(entry) => {
                entry.listeners.insert(listener_id.to_string());
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a listener; the entry is disposed when none remain, even if
    /// `listener_id` was never registered. Returns whether it was.
    pub fn unregister_listener(&self, document_id: &str, listener_id: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(document_id) else {
            return false;
        };
        let removed = entry.listeners.remove(listener_id);
        entry.last_used = Instant::now();
        if entry.listeners.is_empty() {
            dispose_locked(&mut entries, document_id);
        }
        removed
    }

    /// Dispose one entry regardless of listeners.
    pub fn dispose_connection(&self, document_id: &str) -> bool {
        dispose_locked(&mut self.inner.entries.lock(), document_id)
    }

    /// Dispose every listener-less entry idle past the threshold.
    /// Returns the disposed document ids.
    pub fn sweep_idle(&self) -> Vec<String> {
        let max_idle = self.inner.config.max_inactive_time;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.listeners.is_empty() && now.duration_since(e.last_used) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            dispose_locked(&mut entries, id);
        }
        if !expired.is_empty() {
            log::info!("Reaped {} idle document session(s)", expired.len());
        }
        expired
    }

    pub fn get_connection_stats(&self) -> PoolStats {
        let now = Instant::now();
        let entries = self.inner.entries.lock();
        let mut connections: Vec<ConnectionInfo> = entries
            .iter()
            .map(|(id, e)| ConnectionInfo {
                document_id: id.clone(),
                room: e.session.room().to_string(),
                listeners: e.listeners.len(),
                connected: e.session.is_connected(),
                peers: e.session.peer_count(),
                offline_deltas: e.session.channel().offline_queue_len(),
                idle_for: now.duration_since(e.last_used),
                age: now.duration_since(e.created_at),
            })
            .collect();
        connections.sort_by(|a, b| a.document_id.cmp(&b.document_id));

        PoolStats {
            total_connections: connections.len(),
            active_connections: connections.iter().filter(|c| c.connected).count(),
            idle_connections: connections.iter().filter(|c| c.listeners == 0).count(),
            total_listeners: connections.iter().map(|c| c.listeners).sum(),
            connections,
        }
    }

    /// Stop the sweep, dispose every entry and clear the shared bus.
    /// Safe to call repeatedly.
    pub fn destroy(&self) {
        if let Some(sweep) = self.inner.sweep.lock().take() {
            sweep.abort();
        }
        {
            let mut entries = self.inner.entries.lock();
            let ids: Vec<String> = entries.keys().cloned().collect();
            for id in &ids {
                dispose_locked(&mut entries, id);
            }
        }
        self.inner.bus.remove_all_listeners(None);
    }
}

fn dispose_locked(entries: &mut HashMap<String, PooledEntry>, document_id: &str) -> bool {
    let Some(entry) = entries.get(document_id) else {
        return false;
    };
    entry.session.release();
    entries.remove(document_id);
    log::debug!("Disposed document session {document_id}");
    true
}
