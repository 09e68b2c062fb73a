//! In-process transport.
//!
//! [`memory_link`] returns a [`MemoryConnector`] (handed to the session) and
//! a [`MemoryServer`] (kept by the caller). Every successful connect yields
//! a [`ServerConnection`] on the server side: read what the client sent,
//! push frames to the client, or drop it to simulate a lost socket.
//!
//! The server answers client pings on its own while `auto_pong` is on, so
//! long-running scenarios are not disturbed by heartbeats. Turn it off to
//! script liveness failures.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Connector, FrameSink, FrameSource, Link};
use crate::error::{ClientError, Result};
use crate::protocol::{self, Frame, Heartbeat, InboundEvent};

#[derive(Debug)]
struct ServerState {
    reachable: bool,
    auto_pong: bool,
    connects: u32,
    refused: u32,
}

/// Client side of the in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ServerState>>,
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
}

/// Test/demo side of the in-process transport.
#[derive(Debug)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
}

/// Create a connected (connector, server) pair.
pub fn memory_link() -> (MemoryConnector, MemoryServer) {
    let state = Arc::new(Mutex::new(ServerState {
        reachable: true,
        auto_pong: true,
        connects: 0,
        refused: 0,
    }));
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            state: Arc::clone(&state),
            accept_tx,
        },
        MemoryServer { state, accept_rx },
    )
}

impl MemoryServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.recv().await
    }

    /// Refuse (false) or accept (true) subsequent connects.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().expect("memory server lock poisoned").reachable = reachable;
    }

    /// Answer client pings automatically on connections opened from now on.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.state.lock().expect("memory server lock poisoned").auto_pong = enabled;
    }

    /// Total connect attempts seen, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().expect("memory server lock poisoned").connects
    }

    /// Connect attempts refused while unreachable.
    pub fn refused_attempts(&self) -> u32 {
        self.state.lock().expect("memory server lock poisoned").refused
    }
}

/// Server end of one accepted connection. Dropping it disconnects the client.
#[derive(Debug)]
pub struct ServerConnection {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    kill: CancellationToken,
}

impl ServerConnection {
    /// Next frame sent by the client (pings excluded while auto-pong is on).
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Next frame whose `type` equals `event_type`, skipping others.
    pub async fn recv_type(&mut self, event_type: &str) -> Option<Frame> {
        loop {
            let frame = self.inbound.recv().await?;
            if protocol::event_type(&frame).ok() == Some(event_type) {
                return Some(frame);
            }
        }
    }

    /// Push a frame to the client. Returns false if the client is gone.
    pub fn push(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Disconnect the client.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link> {
        let auto_pong = {
            let mut state = self.state.lock().expect("memory server lock poisoned");
            state.connects += 1;
            if !state.reachable {
                state.refused += 1;
                return Err(ClientError::Transport("memory server unreachable".into()));
            }
            state.auto_pong
        };

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (visible_tx, visible_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();

        tokio::spawn(relay(
            to_server_rx,
            visible_tx,
            to_client_tx.clone(),
            auto_pong,
            kill.clone(),
        ));

        let conn = ServerConnection {
            inbound: visible_rx,
            outbound: to_client_tx,
            kill: kill.clone(),
        };
        if self.accept_tx.send(conn).is_err() {
            return Err(ClientError::Transport("memory server shut down".into()));
        }

        Ok((
            Box::new(MemorySink {
                tx: Some(to_server_tx),
                kill: kill.clone(),
            }),
            Box::new(MemorySource {
                rx: to_client_rx,
                kill,
            }),
        ))
    }
}

/// Forwards client frames to the server end, answering pings when enabled.
async fn relay(
    mut from_client: mpsc::UnboundedReceiver<Frame>,
    to_server: mpsc::UnboundedSender<Frame>,
    to_client: mpsc::UnboundedSender<Frame>,
    auto_pong: bool,
    kill: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = kill.cancelled() => break,
            frame = from_client.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if auto_pong {
            if let Ok(InboundEvent::Heartbeat(Heartbeat::Ping { ts })) = protocol::decode(&frame) {
                let _ = to_client.send(protocol::pong(ts));
                continue;
            }
        }
        if to_server.send(frame).is_err() {
            break;
        }
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    kill: CancellationToken,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        if self.kill.is_cancelled() {
            return Err(ClientError::Transport("memory link closed".into()));
        }
        let tx = self.tx.as_ref().ok_or(ClientError::Closed)?;
        tx.send(frame.clone())
            .map_err(|e| ClientError::Transport(format!("memory link closed: {e}")))
    }

    async fn close(&mut self) {
        self.tx = None;
        self.kill.cancel();
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Frame>,
    kill: CancellationToken,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame.map(Ok),
            () = self.kill.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut server) = memory_link();
        let (mut sink, mut source) = connector.connect().await.unwrap();
        let mut conn = server.accept().await.unwrap();

        assert!(conn.push(json!({"type": "hello"})));
        let frame = source.recv().await.unwrap().unwrap();
        assert_eq!(frame["type"], "hello");

        sink.send(&json!({"type": "send_message"})).await.unwrap();
        assert_eq!(conn.recv().await.unwrap()["type"], "send_message");
    }

    #[tokio::test]
    async fn test_auto_pong_answers_pings() {
        let (connector, mut server) = memory_link();
        let (mut sink, mut source) = connector.connect().await.unwrap();
        let _conn = server.accept().await.unwrap();

        sink.send(&protocol::ping(42)).await.unwrap();
        let reply = source.recv().await.unwrap().unwrap();
        assert_eq!(reply, protocol::pong(42));
    }

    #[tokio::test]
    async fn test_dropping_server_connection_ends_stream() {
        let (connector, mut server) = memory_link();
        let (mut sink, mut source) = connector.connect().await.unwrap();
        let conn = server.accept().await.unwrap();
        conn.close();

        assert!(source.recv().await.is_none());
        assert!(sink.send(&json!({"type": "x"})).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_refuses() {
        let (connector, server) = memory_link();
        server.set_reachable(false);
        assert!(matches!(
            connector.connect().await,
            Err(ClientError::Transport(_))
        ));
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(server.refused_attempts(), 1);
    }
}
