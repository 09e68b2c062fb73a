//! Chatlink - real-time messaging client core.
//!
//! This crate keeps a client's view of its conversations consistent with
//! the chat server over an unreliable persistent connection.
//!
//! # Architecture
//!
//! - **Connection** - actor owning the socket: heartbeat, health states,
//!   bounded exponential reconnect, outbound buffering while disconnected
//! - **Dispatch** - optimistic sends: pending record first, then delivery
//!   over the socket or the REST fallback, retries and reconciliation
//! - **Store** - per-conversation ordered message lists and change events
//! - **Router** - classifies inbound frames, drops duplicates, applies them
//! - **Session** - wires the above together for one client context
//!
//! # Modules
//!
//! - [`session`] - [`MessagingSession`], the entry point
//! - [`connection`] - connection state machine and manager actor
//! - [`dispatch`] - outbound dispatch pipeline
//! - [`store`] - conversation state store
//! - [`router`] - inbound event router and dedup window
//! - [`history`] - backward pagination
//! - [`telemetry`] - connection health counters and scoring
//! - [`transport`] - frame transports (WebSocket, in-memory)
//! - [`rest`] - REST fallback and history client
//! - [`config`] - configuration loading/saving

pub mod config;
pub mod connection;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod model;
pub mod protocol;
pub mod rest;
pub mod router;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use config::ClientConfig;
pub use connection::{CloseReason, ConnectionSnapshot, ConnectionState};
pub use dispatch::{DispatchEvent, FallbackSender};
pub use error::{ClientError, Result};
pub use history::{HistoryLoader, HistorySource, LoadOutcome};
pub use model::{
    ConversationId, MessageId, MessageRecord, MessageStatus, OutboundMessage, SendErrorCode,
    SenderType, ServerMessage, TempId,
};
pub use protocol::DomainEvent;
pub use session::{MessagingSession, MessagingSessionBuilder};
pub use store::{ConversationStore, StoreEvent};
pub use telemetry::TelemetrySnapshot;
