//! Connection lifecycle: state machine, heartbeat, reconnect backoff,
//! outbound buffering, and the manager task tying them to a transport.

// Rust guideline compliant 2026-02

pub mod backoff;
pub mod buffer;
pub mod heartbeat;
pub mod manager;
pub mod state;

pub use backoff::ReconnectPolicy;
pub use buffer::OutboundBuffer;
pub use heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
pub use manager::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionSnapshot, LinkEvent,
    SendReceipt,
};
pub use state::{CloseReason, ConnectionState, ConnectionStateMachine, LifecycleEvent};
