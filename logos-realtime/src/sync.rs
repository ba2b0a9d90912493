//! Per-document CRDT sync channel.
//!
//! One WebSocket per room, speaking the binary protocol in
//! [`crate::protocol`]. The channel never touches a document itself: it
//! reports remote traffic as [`SyncEvent`]s and leaves merging to its owner.
//!
//! Deltas sent while disconnected go to an [`OfflineQueue`] and are replayed,
//! in order, right after the next successful connect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Bound on the WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default offline queue capacity.
pub const DEFAULT_OFFLINE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Incremental update from a remote peer
    RemoteDelta { peer_id: Uuid, clock: u64, update: Vec<u8> },
    /// A peer sent its state vector and expects the missing update back
    StateRequested { peer_id: Uuid, state_vector: Vec<u8> },
    /// Reply to our own state vector
    StateSynced(Vec<u8>),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// A delta waiting for the channel to come back.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedDelta {
    pub clock: u64,
    pub update: Vec<u8>,
}

/// Bounded FIFO of deltas made while disconnected.
#[derive(Debug)]
pub struct OfflineQueue {
    deltas: VecDeque<QueuedDelta>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            deltas: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, clock: u64, update: Vec<u8>) -> Result<(), ProtocolError> {
        if self.deltas.len() >= self.capacity {
            return Err(ProtocolError::QueueFull);
        }
        self.deltas.push_back(QueuedDelta { clock, update });
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<QueuedDelta> {
        self.deltas.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn clear(&mut self) {
        self.deltas.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.deltas.iter().map(|d| d.update.len()).sum()
    }
}

struct ChannelState {
    status: ChannelStatus,
    clock: u64,
    epoch: u64,
    offline: OfflineQueue,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    socket_task: Option<JoinHandle<()>>,
}

struct ChannelInner {
    peer: PeerInfo,
    room: String,
    endpoint: String,
    state: Mutex<ChannelState>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
}

/// Handle to one room's sync socket. Clones share the connection.
#[derive(Clone)]
pub struct SyncChannel {
    inner: Arc<ChannelInner>,
}

impl SyncChannel {
    pub fn new(peer: PeerInfo, room: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::with_offline_capacity(peer, room, endpoint, DEFAULT_OFFLINE_CAPACITY)
    }

    pub fn with_offline_capacity(
        peer: PeerInfo,
        room: impl Into<String>,
        endpoint: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                peer,
                room: room.into(),
                endpoint: endpoint.into(),
                state: Mutex::new(ChannelState {
                    status: ChannelStatus::Disconnected,
                    clock: 0,
                    epoch: 0,
                    offline: OfflineQueue::new(capacity),
                    outgoing: None,
                    socket_task: None,
                }),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.inner.event_rx.lock().take()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.inner.peer
    }

    pub fn room(&self) -> &str {
        &self.inner.room
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.inner.endpoint.trim_end_matches('/'), self.inner.room)
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    pub fn clock(&self) -> u64 {
        self.inner.state.lock().clock
    }

    pub fn offline_queue_len(&self) -> usize {
        self.inner.state.lock().offline.len()
    }

    /// Open the socket, announce ourselves, request the missing state with
    /// `state_vector` and replay queued deltas.
    pub async fn connect(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let join = SyncMessage::peer_joined(&self.inner.room, &self.inner.peer)?.encode()?;
        let step1 = SyncMessage::sync_step1(self.inner.peer.peer_id, &self.inner.room, state_vector).encode()?;

        let epoch = {
            let mut state = self.inner.state.lock();
            if state.status != ChannelStatus::Disconnected {
                return Ok(());
            }
            state.status = ChannelStatus::Connecting;
            state.epoch += 1;
            state.epoch
        };

        let url = self.url();
        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                log::warn!("Sync channel {} failed to connect: {e}", self.inner.room);
                self.reset_if_current(epoch);
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(_) => {
                log::warn!("Sync channel {} timed out connecting", self.inner.room);
                self.reset_if_current(epoch);
                return Err(ProtocolError::Timeout);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let replay = {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                // Disconnected while the handshake was in flight.
                return Err(ProtocolError::ConnectionClosed);
            }
            let _ = tx.send(join);
            let _ = tx.send(step1);
            let queued = state.offline.drain();
            for delta in &queued {
                let frame = SyncMessage::delta(self.inner.peer.peer_id, &self.inner.room, delta.clock, delta.update.clone());
                if let Ok(bytes) = frame.encode() {
                    let _ = tx.send(bytes);
                }
            }
            state.status = ChannelStatus::Connected;
            state.outgoing = Some(tx.clone());
            let pong = tx.downgrade();
            state.socket_task = Some(tokio::spawn(run_socket(self.clone(), epoch, ws, pong, rx)));
            queued.len()
        };

        if replay > 0 {
            log::info!("Replayed {replay} queued deltas to {}", self.inner.room);
        }
        log::info!("Sync channel {} connected", self.inner.room);
        let _ = self.inner.event_tx.send(SyncEvent::Connected);
        Ok(())
    }

    /// Send a local update, or queue it while disconnected.
    pub fn send_delta(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let mut state = self.inner.state.lock();
        state.clock += 1;
        let clock = state.clock;

        if let (ChannelStatus::Connected, Some(tx)) = (state.status, &state.outgoing) {
            let bytes = SyncMessage::delta(self.inner.peer.peer_id, &self.inner.room, clock, update.clone()).encode()?;
            if tx.send(bytes).is_ok() {
                return Ok(());
            }
        }
        state.offline.push(clock, update)
    }

    /// Answer a peer's state vector. Dropped while disconnected; the peer
    /// asks again on its next handshake.
    pub fn send_state(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let frame = SyncMessage::sync_step2(self.inner.peer.peer_id, &self.inner.room, update);
        self.send_frame(&frame)
    }

    pub fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(&SyncMessage::ping(self.inner.peer.peer_id, &self.inner.room))
    }

    fn send_frame(&self, frame: &SyncMessage) -> Result<(), ProtocolError> {
        let bytes = frame.encode()?;
        let state = self.inner.state.lock();
        match (&state.outgoing, state.status) {
            (Some(tx), ChannelStatus::Connected) => tx.send(bytes).map_err(|_| ProtocolError::ConnectionClosed),
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Announce departure and close the socket. Queued deltas are kept.
    /// Safe to call repeatedly.
    pub fn disconnect(&self) {
        let was = {
            let mut state = self.inner.state.lock();
            let was = state.status;
            if was == ChannelStatus::Connected {
                if let (Some(tx), Ok(bytes)) = (
                    &state.outgoing,
                    SyncMessage::peer_left(self.inner.peer.peer_id, &self.inner.room).encode(),
                ) {
                    let _ = tx.send(bytes);
                }
            }
            state.epoch += 1;
            state.status = ChannelStatus::Disconnected;
            // Dropping the last sender lets the socket task close gracefully.
            state.outgoing = None;
            state.socket_task.take();
            was
        };
        if was == ChannelStatus::Connected {
            log::debug!("Sync channel {} disconnected", self.inner.room);
            let _ = self.inner.event_tx.send(SyncEvent::Disconnected);
        }
    }

    /// Drop queued deltas.
    pub fn clear_offline(&self) {
        self.inner.state.lock().offline.clear();
    }

    fn reset_if_current(&self, epoch: u64) {
        let mut state = self.inner.state.lock();
        if state.epoch == epoch {
            state.status = ChannelStatus::Disconnected;
        }
    }

    fn on_closed(&self, epoch: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.status = ChannelStatus::Disconnected;
            state.outgoing = None;
            state.socket_task = None;
        }
        log::info!("Sync channel {} lost its connection", self.inner.room);
        let _ = self.inner.event_tx.send(SyncEvent::Disconnected);
    }

    fn on_frame(&self, bytes: &[u8], pong: &mpsc::UnboundedSender<Vec<u8>>) {
        let frame = match SyncMessage::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed sync frame on {}: {e}", self.inner.room);
                return;
            }
        };
        if frame.peer_id == self.inner.peer.peer_id || frame.room != self.inner.room {
            return;
        }

        let event = match frame.msg_type {
            MessageType::Delta => Some(SyncEvent::RemoteDelta {
                peer_id: frame.peer_id,
                clock: frame.clock,
                update: frame.payload,
            }),
            MessageType::SyncStep1 => Some(SyncEvent::StateRequested {
                peer_id: frame.peer_id,
                state_vector: frame.payload,
            }),
            MessageType::SyncStep2 => Some(SyncEvent::StateSynced(frame.payload)),
            MessageType::PeerJoined => frame.peer_info().ok().map(SyncEvent::PeerJoined),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(frame.peer_id)),
            MessageType::Ping => {
                if let Ok(bytes) = SyncMessage::pong(self.inner.peer.peer_id, &self.inner.room).encode() {
                    let _ = pong.send(bytes);
                }
                None
            }
            MessageType::Pong => None,
        };

        if let Some(event) = event {
            let _ = self.inner.event_tx.send(event);
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_socket(
    channel: SyncChannel,
    epoch: u64,
    ws: WsStream,
    pong: mpsc::WeakUnboundedSender<Vec<u8>>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut writer, mut reader) = ws.split();

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(bytes) => {
                    if writer.send(WsMessage::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    break;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Binary(data))) => {
                    if let Some(pong) = pong.upgrade() {
                        channel.on_frame(&data, &pong);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    channel.on_closed(epoch);
}
