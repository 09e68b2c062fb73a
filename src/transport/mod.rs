//! Transport boundary for the connection manager.
//!
//! The connection manager never touches sockets directly. It asks a
//! [`Connector`] for a fresh link and receives split halves:
//!
//! ```text
//! Connector::connect()
//!     │
//!     ├── FrameSink   (send JSON frames, close)
//!     │
//!     └── FrameSource (receive JSON frames until the stream ends)
//! ```
//!
//! Split halves let the manager's `tokio::select!` loop await inbound
//! frames while it writes heartbeats and queued sends.
//!
//! Implementations:
//!
//! - [`ws::WsConnector`] - WebSocket via `tokio-tungstenite`
//! - [`memory::MemoryConnector`] - in-process link driven by a
//!   [`memory::MemoryServer`], used by tests and local demos

pub mod memory;
pub mod ws;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Frame;

/// Write half of an open link.
#[async_trait]
pub trait FrameSink: Send {
    /// Transmit one frame.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the link is broken, or
    /// `ClientError::Closed` after [`FrameSink::close`].
    async fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Close the link. Idempotent.
    async fn close(&mut self);
}

/// Read half of an open link.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame, or `None` once the link has ended.
    ///
    /// Undecodable frames surface as `Some(Err(ClientError::Protocol))` and
    /// do not end the stream; I/O failures surface as
    /// `Some(Err(ClientError::Transport))`.
    async fn recv(&mut self) -> Option<Result<Frame>>;
}

/// Freshly opened link: (writer, reader).
pub type Link = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Factory for links, called on every (re)connect.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a new link.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the handshake fails.
    async fn connect(&self) -> Result<Link>;
}
