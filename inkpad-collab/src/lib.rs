//! # inkpad-collab: Collaboration layer for Inkpad documents
//!
//! Binds a [`ReplicatedDocument`](inkpad_core::ReplicatedDocument) to peers
//! over a WebSocket relay and to the collaborator HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   WebSocket    ┌──────────────┐
//! │ DocumentSession │ ◄────────────► │ RelayServer  │
//! │  store + feed   │  bincode Frame │  room replica│
//! └──┬──────────┬───┘                └──────┬───────┘
//!    │          │                           │
//!    │ HTTP     ▼                           ▼
//!    │   ┌─────────────┐            ┌───────────────┐
//!    │   │ SyncChannel │            │ BroadcastGroup│
//!    │   │ offline queue│            │ (fan-out)     │
//!    │   └─────────────┘            └───────────────┘
//!    ▼
//! ┌──────────────────────────────┐
//! │ CollaboratorApi              │
//! │ documents, versions, files   │
//! └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded [`Frame`])
//! - [`channel`]: Sync Channel: client link, offline queue, reconnection
//! - [`session`]: One open document bound to the channel and snapshots
//! - [`snapshot`]: Version Snapshot Manager
//! - [`api`] / [`auth`]: Collaborator HTTP API and login
//! - [`server`] / [`broadcast`]: Relay server with per-room fan-out
//! - [`config`] / [`reconnect`]: Client configuration and backoff policy
//! - [`error`]: Error types

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod snapshot;

// Re-exports for convenience
pub use api::{CollaboratorApi, DocumentRecord, WireBytes};
pub use auth::{login, AuthSession, UserProfile};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use channel::{ChannelState, DeltaSink, DocumentEvent, DocumentFeed, OfflineQueue, SyncChannel};
pub use config::ClientConfig;
pub use error::{
    ConfigError, ConnectionError, PermissionError, PersistenceError, ProtocolError, SessionError,
};
pub use protocol::Frame;
pub use reconnect::ReconnectPolicy;
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{DocumentSession, SessionEvent};
pub use snapshot::{RestoredContent, RestoredPayload, SnapshotManager, VersionSnapshot};
