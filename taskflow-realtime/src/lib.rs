//! # taskflow-realtime: real-time collaboration core for Taskflow
//!
//! One persistent WebSocket per client carries channel pub/sub, advisory
//! edit locks, optimistic edit submission and presence signals.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐                        ┌────────────────────┐
//! │ RealtimeClient   │      JSON frames       │ CoordinationServer │
//! │ (per session)    │ ◄────────────────────► │ (relay + arbiter)  │
//! └────────┬─────────┘                        └─────────┬──────────┘
//!          │                                            │
//!   Connection (state machine, backoff)        BroadcastGroup, Coordinator
//!          │ TransportEvent, in order
//!          ▼
//!   Router ──► SubscriptionRegistry ──► listeners
//!     │
//!     ├── EditLockManager      (edit.lock.*)
//!     ├── OperationSubmitter   (edit.operation.submit)
//!     └── PresenceBroadcaster  (presence, typing)
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: connection state machine and reconnect backoff
//! - [`registry`]: `(channel, resourceId)` → listener sets
//! - [`router`]: inbound dispatch, resubscription replay, request correlation
//! - [`locks`]: edit lock acquisition and release
//! - [`operations`]: version-checked operation submission
//! - [`presence`]: presence/typing broadcaster and roster
//! - [`client`]: facade tying the above to one connection
//! - [`server`]: reference relay with lock table and version arbiter

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod locks;
pub mod operations;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerSession};
pub use client::RealtimeClient;
pub use config::{BackoffPolicy, RealtimeConfig};
pub use error::RealtimeError;
pub use locks::EditLockManager;
pub use operations::OperationSubmitter;
pub use presence::{PresenceBroadcaster, PresenceRoster, RemotePresence};
pub use protocol::{
    EditOperation, Frame, LockGrant, LockResult, OperationApplied, PresenceStatus, PresenceUpdate,
    ResourceRef, SubmitOutcome, TypingUpdate, UserRef, Version,
};
pub use registry::{
    ChannelMessage, Listener, Subscription, SubscriptionKey, SubscriptionRegistry, WireChange, WILDCARD,
};
pub use router::Router;
pub use server::{CoordinationServer, Coordinator, ServerConfig, ServerStats};
pub use transport::{Connection, ConnectionState, Connector, TransportEvent, WsConnector};
