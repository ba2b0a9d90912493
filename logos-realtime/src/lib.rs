//! # logos-realtime — Real-time transport layer for Logos workspaces
//!
//! Keeps a workspace connected for chat, presence and document sync across
//! flaky networks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   JSON text frames   ┌─────────────┐
//! │ TransportSession │ ◄──────────────────► │ workspace   │
//! │  ├ DeliveryQueue │                      │ server      │
//! │  └ Presence      │                      └─────────────┘
//! └────────┬─────────┘
//!          │ events
//!          ▼
//! ┌──────────────────┐
//! │ EventBus         │ ◄── shared with SessionPool
//! └──────────────────┘
//!
//! ┌──────────────────┐  bincode frames   ┌─────────────┐
//! │ SessionPool      │ ◄───────────────► │ sync relay  │
//! │  └ DocumentSession (Yrs Doc +        │ (per room)  │
//! │       SyncChannel) per document      └─────────────┘
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`event_bus`] — Typed publish/subscribe with listener isolation
//! - [`message`] — JSON wire envelope (presence, chat, custom kinds)
//! - [`queue`] — FIFO delivery queue with exponential backoff
//! - [`presence`] — Workspace presence table with heartbeat and sweep
//! - [`transport`] — Connection state machine and reconnect policy
//! - [`protocol`] — Binary CRDT sync frames
//! - [`sync`] — Per-document sync channel with offline delta queue
//! - [`pool`] — Reference-counted registry of document sessions
//!
//! The crate logs through the `log` facade and never installs a logger.

pub mod event_bus;
pub mod message;
pub mod pool;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use event_bus::{
    BusDiagnostics, Event, EventBus, EventDiagnostics, InstrumentedEventBus, ListenerId,
    Subscription,
};
pub use message::{ChatMessage, Message, MessageBody, MessageError};
pub use pool::{ConnectionInfo, DocumentSession, PoolConfig, PoolStats, SessionPool};
pub use presence::{PresenceChange, PresenceConfig, PresenceRecord, PresenceStatus, PresenceTracker};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use queue::{DeliveryError, DeliveryQueue, PendingMessage, QueueConfig, QueueStats};
pub use sync::{ChannelStatus, OfflineQueue, SyncChannel, SyncEvent};
pub use transport::{
    ConnectionStatus, TransportConfig, TransportError, TransportEvent, TransportEventKind,
    TransportSession,
};
