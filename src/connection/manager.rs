//! Connection manager actor.
//!
//! One background task owns the transport. Everything else talks to it
//! through a cloneable [`ConnectionHandle`]:
//!
//! ```text
//! ConnectionHandle ──Command──► ConnectionManager task ──LinkEvent──► router
//!        ▲                           │
//!        └──── watch<ConnectionSnapshot> (state, retries, heartbeat stats)
//! ```
//!
//! The task runs the reconnect loop (connect, run the open loop until the
//! link is lost, back off, repeat) and, while open, a `tokio::select!` over
//! commands, inbound frames, the heartbeat ticker and the cancellation
//! token. State transitions go through one mutex shared with the handle, so
//! `close()` and the task never transition concurrently.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::backoff::ReconnectPolicy;
use super::buffer::OutboundBuffer;
use super::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use super::state::{CloseReason, ConnectionState, ConnectionStateMachine, LifecycleEvent};
use crate::constants::{
    DEGRADED_AFTER_MISSED, FORCE_CLOSE_AFTER_MISSED, HEARTBEAT_INTERVAL, OUTBOUND_BUFFER_CAPACITY,
};
use crate::error::{ClientError, Result};
use crate::protocol::{self, Frame};
use crate::telemetry::{Recorder, TelemetryEvent};
use crate::transport::{Connector, FrameSink, FrameSource};

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between pings.
    pub heartbeat_interval: Duration,
    /// Consecutive misses before `degraded`.
    pub degraded_after_missed: u32,
    /// Consecutive misses before the transport is force-closed.
    pub force_close_after_missed: u32,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Frames held while not open.
    pub buffer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            degraded_after_missed: DEGRADED_AFTER_MISSED,
            force_close_after_missed: FORCE_CLOSE_AFTER_MISSED,
            reconnect: ReconnectPolicy::default(),
            buffer_capacity: OUTBOUND_BUFFER_CAPACITY,
        }
    }
}

/// Observable connection data.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Failed attempts since the last successful open.
    pub retry_count: u32,
    /// Consecutive unanswered pings on the current transport.
    pub missed_heartbeats: u32,
    /// Most recent heartbeat round trip.
    pub last_rtt: Option<Duration>,
    /// Wall-clock time of the last ping.
    pub last_heartbeat_sent_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the last matching pong.
    pub last_heartbeat_ack_at: Option<DateTime<Utc>>,
    /// Frames waiting for the transport to open.
    pub buffered_frames: usize,
}

/// What happened to a frame handed to [`ConnectionHandle::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReceipt {
    /// Written to the open transport.
    Transmitted,
    /// Held in the outbound buffer until the next open.
    Buffered,
}

/// Notifications from the manager to the event router.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Transport opened.
    Connected,
    /// Open transport lost.
    Disconnected {
        /// Cause.
        reason: String,
    },
    /// Connect attempt failed.
    ConnectFailed {
        /// Cause.
        message: String,
    },
    /// Inbound frame (heartbeats already handled).
    Frame(Frame),
    /// Inbound data that could not be decoded.
    Malformed {
        /// Decoder error.
        error: String,
    },
    /// Buffered frame dropped to make room (never transmitted).
    Evicted(Frame),
    /// Buffered frame written to a newly opened transport.
    Flushed(Frame),
    /// Terminal state reached.
    Closed(CloseReason),
}

enum Command {
    Connect,
    Send {
        frame: Frame,
        reply: oneshot::Sender<Result<SendReceipt>>,
    },
}

/// Why the open loop returned.
enum OpenExit {
    Shutdown,
    Lost(String),
}

#[derive(Debug)]
struct Shared {
    machine: Mutex<ConnectionStateMachine>,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl Shared {
    /// Apply a transition and publish it, atomically with respect to other callers.
    fn apply(&self, event: LifecycleEvent) -> Option<ConnectionState> {
        let mut machine = self.machine.lock().expect("connection state lock poisoned");
        let before = machine.state();
        match machine.apply(event) {
            Ok(after) => {
                if before != after {
                    log::info!("[Connection] {before} -> {after}");
                }
                self.snapshot.send_modify(|s| s.state = after);
                Some(after)
            }
            Err(e) => {
                log::debug!("[Connection] {e}");
                None
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.machine
            .lock()
            .expect("connection state lock poisoned")
            .state()
    }
}

/// Cloneable handle to a running connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => f.write_str("Connect"),
            Self::Send { frame, .. } => f.debug_struct("Send").field("frame", frame).finish(),
        }
    }
}

impl ConnectionHandle {
    /// Start connecting. No-op if already connecting, open or reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] once the connection is closed.
    pub fn connect(&self) -> Result<()> {
        match self.shared.state() {
            ConnectionState::Idle => self
                .commands
                .send(Command::Connect)
                .map_err(|e| ClientError::Transport(format!("connection task gone: {e}"))),
            ConnectionState::Closed(_) => Err(ClientError::Closed),
            _ => Ok(()),
        }
    }

    /// Transmit `frame` now if open, otherwise buffer it for the next open.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] once the connection is closed.
    pub async fn send(&self, frame: Frame) -> Result<SendReceipt> {
        if self.cancel.is_cancelled() || self.shared.state().is_closed() {
            return Err(ClientError::Closed);
        }
        let (reply, receipt) = oneshot::channel();
        if self.commands.send(Command::Send { frame, reply }).is_err() {
            return Err(ClientError::Closed);
        }
        receipt.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Close the connection. Idempotent; suppresses all further reconnects.
    ///
    /// Timers stop as soon as the task observes the cancellation, and the
    /// outbound buffer is discarded.
    pub fn close(&self) {
        self.shared.apply(LifecycleEvent::Close);
        self.cancel.cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Current snapshot (state plus heartbeat/retry data).
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Watch snapshots as they change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Wait until `predicate` holds for the state, or the connection closes.
    ///
    /// Returns the matching state (or the closed state).
    pub async fn wait_for(&self, predicate: impl Fn(&ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|snap| predicate(&snap.state) || snap.state.is_closed())
            .await
            .map(|snap| snap.state);
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }
}

/// Background task owning the transport.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<LinkEvent>,
    buffer: OutboundBuffer,
    heartbeat: HeartbeatMonitor,
    retry_count: u32,
    recorder: Recorder,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connector", &self.connector)
            .field("retry_count", &self.retry_count)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Spawn the manager task.
    ///
    /// Returns the handle, the stream of [`LinkEvent`]s for the router, and
    /// the task's join handle. The task ends when `cancel` fires, when every
    /// handle is dropped, or when the retry budget runs out.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        recorder: Recorder,
        cancel: CancellationToken,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<LinkEvent>,
        JoinHandle<()>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(ConnectionSnapshot::default());
        let shared = Arc::new(Shared {
            machine: Mutex::new(ConnectionStateMachine::new()),
            snapshot: snapshot_tx,
        });

        let manager = Self {
            connector,
            heartbeat: HeartbeatMonitor::new(
                config.degraded_after_missed,
                config.force_close_after_missed,
            ),
            buffer: OutboundBuffer::new(config.buffer_capacity.max(1)),
            config,
            shared: Arc::clone(&shared),
            commands: command_rx,
            events: event_tx,
            retry_count: 0,
            recorder,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(manager.run());

        (
            ConnectionHandle {
                commands: command_tx,
                shared,
                cancel,
            },
            event_rx,
            task,
        )
    }

    async fn run(mut self) {
        if self.wait_for_connect().await {
            self.reconnect_loop().await;
        }
        self.finish();
    }

    async fn reconnect_loop(&mut self) {
        loop {
            if self.shared.apply(LifecycleEvent::Connect).is_none() {
                return;
            }
            self.recorder.record(TelemetryEvent::ConnectAttempt);

            let attempt = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok((mut sink, source)) => {
                    if self.shared.apply(LifecycleEvent::Opened).is_none() {
                        sink.close().await;
                        return;
                    }
                    self.on_open();
                    match self.run_open(sink, source).await {
                        OpenExit::Shutdown => return,
                        OpenExit::Lost(reason) => {
                            log::warn!("[Connection] transport lost: {reason}");
                            self.recorder.record(TelemetryEvent::Disconnected);
                            self.emit(LinkEvent::Disconnected { reason });
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Connection] connect failed: {e}");
                    self.recorder.record(TelemetryEvent::ConnectFailed);
                    self.emit(LinkEvent::ConnectFailed {
                        message: e.to_string(),
                    });
                }
            }

            self.retry_count += 1;
            if self.config.reconnect.is_exhausted(self.retry_count) {
                log::error!(
                    "[Connection] giving up after {} failed attempts",
                    self.retry_count
                );
                self.shared.apply(LifecycleEvent::GiveUp);
                return;
            }

            let delay = self.config.reconnect.next_delay(self.retry_count - 1);
            let scheduled = self.shared.apply(LifecycleEvent::LinkLost {
                attempt: self.retry_count,
                delay_ms: delay.as_millis() as u64,
            });
            if scheduled.is_none() {
                return;
            }
            self.publish_stats();
            log::info!(
                "[Connection] reconnecting in {:.1}s (attempt {})",
                delay.as_secs_f32(),
                self.retry_count
            );
            if !self.backoff(delay).await {
                return;
            }
        }
    }

    /// Idle until `connect()`; sends issued meanwhile are buffered.
    async fn wait_for_connect(&mut self) -> bool {
        loop {
            let command = tokio::select! {
                () = self.cancel.cancelled() => return false,
                command = self.commands.recv() => command,
            };
            match command {
                Some(Command::Connect) => return true,
                Some(command) => self.handle_offline(command),
                None => return false,
            }
        }
    }

    /// Sleep for `delay` while buffering sends. False if shut down meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                () = self.cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_offline(command),
                    None => return false,
                },
            }
        }
    }

    fn handle_offline(&mut self, command: Command) {
        match command {
            Command::Connect => {}
            Command::Send { frame, reply } => {
                self.buffer_frame(frame);
                let _ = reply.send(Ok(SendReceipt::Buffered));
            }
        }
    }

    fn buffer_frame(&mut self, frame: Frame) {
        if let Some(evicted) = self.buffer.push(frame) {
            log::warn!(
                "[Connection] outbound buffer full ({}), dropping oldest frame",
                self.buffer.capacity()
            );
            self.emit(LinkEvent::Evicted(evicted));
        }
        self.publish_stats();
    }

    fn on_open(&mut self) {
        self.retry_count = 0;
        self.heartbeat.reset();
        self.recorder.record(TelemetryEvent::ConnectSucceeded);
        self.publish_stats();
        self.emit(LinkEvent::Connected);
    }

    async fn run_open(
        &mut self,
        mut sink: Box<dyn FrameSink>,
        mut source: Box<dyn FrameSource>,
    ) -> OpenExit {
        if let Err(e) = self.flush(sink.as_mut()).await {
            sink.close().await;
            return OpenExit::Lost(e.to_string());
        }

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break OpenExit::Shutdown,
                command = self.commands.recv() => match command {
                    Some(Command::Send { frame, reply }) => match sink.send(&frame).await {
                        Ok(()) => {
                            let _ = reply.send(Ok(SendReceipt::Transmitted));
                        }
                        Err(e) => {
                            self.buffer_frame(frame);
                            let _ = reply.send(Ok(SendReceipt::Buffered));
                            break OpenExit::Lost(e.to_string());
                        }
                    },
                    Some(Command::Connect) => {}
                    None => break OpenExit::Shutdown,
                },
                inbound = source.recv() => match inbound {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.handle_frame(sink.as_mut(), frame).await {
                            break OpenExit::Lost(e.to_string());
                        }
                    }
                    Some(Err(ClientError::Protocol(error))) => {
                        log::warn!("[Connection] undecodable frame: {error}");
                        self.emit(LinkEvent::Malformed { error });
                    }
                    Some(Err(e)) => break OpenExit::Lost(e.to_string()),
                    None => break OpenExit::Lost("stream ended".into()),
                },
                _ = ticker.tick() => {
                    if let Err(reason) = self.heartbeat_tick(sink.as_mut()).await {
                        break OpenExit::Lost(reason);
                    }
                }
            }
        };

        sink.close().await;
        self.heartbeat.reset();
        self.publish_stats();
        exit
    }

    /// Write buffered frames in order; on failure the frame goes back to the head.
    async fn flush(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        let pending = self.buffer.len();
        if pending > 0 {
            log::info!("[Connection] flushing {pending} buffered frame(s)");
        }
        while let Some(frame) = self.buffer.pop() {
            if let Err(e) = sink.send(&frame).await {
                if let Some(evicted) = self.buffer.push_front(frame) {
                    self.emit(LinkEvent::Evicted(evicted));
                }
                self.publish_stats();
                return Err(e);
            }
            self.emit(LinkEvent::Flushed(frame));
        }
        self.publish_stats();
        Ok(())
    }

    async fn handle_frame(&mut self, sink: &mut dyn FrameSink, frame: Frame) -> Result<()> {
        let is_heartbeat = matches!(protocol::event_type(&frame), Ok("ping" | "pong"));
        if !is_heartbeat {
            self.emit(LinkEvent::Frame(frame));
            return Ok(());
        }
        match protocol::decode(&frame) {
            Ok(protocol::InboundEvent::Heartbeat(protocol::Heartbeat::Ping { ts })) => {
                sink.send(&protocol::pong(ts)).await?;
            }
            Ok(protocol::InboundEvent::Heartbeat(protocol::Heartbeat::Pong { ts })) => {
                self.on_pong(ts);
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("[Connection] bad heartbeat frame: {e}");
                self.emit(LinkEvent::Malformed {
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn on_pong(&mut self, ts: i64) {
        let Some(rtt) = self.heartbeat.on_pong(ts, Instant::now()) else {
            log::debug!("[Connection] ignoring pong for stale ping {ts}");
            return;
        };
        self.recorder.record(TelemetryEvent::HeartbeatRtt(rtt));
        if matches!(self.shared.state(), ConnectionState::Degraded { .. }) {
            self.shared.apply(LifecycleEvent::HeartbeatRecovered);
        }
        self.publish_stats();
    }

    /// Account for the previous ping and send the next one.
    ///
    /// Returns `Err(reason)` when the transport must be dropped.
    async fn heartbeat_tick(&mut self, sink: &mut dyn FrameSink) -> std::result::Result<(), String> {
        let ts = protocol::now_millis();
        let verdict = self.heartbeat.on_tick(ts, Instant::now());
        match verdict {
            HeartbeatVerdict::Healthy { missed } => {
                if missed > 0 {
                    log::warn!("[Connection] heartbeat missed ({missed})");
                    self.recorder.record(TelemetryEvent::HeartbeatMissed);
                }
            }
            HeartbeatVerdict::Degraded { missed } => {
                log::warn!("[Connection] heartbeat missed ({missed}), connection degraded");
                self.recorder.record(TelemetryEvent::HeartbeatMissed);
                self.shared
                    .apply(LifecycleEvent::HeartbeatMissed { missed });
            }
            HeartbeatVerdict::Dead { missed } => {
                self.recorder.record(TelemetryEvent::HeartbeatMissed);
                self.publish_stats();
                return Err(format!("{missed} heartbeats unanswered"));
            }
        }
        self.publish_stats();
        sink.send(&protocol::ping(ts))
            .await
            .map_err(|e| e.to_string())
    }

    fn publish_stats(&self) {
        let retry_count = self.retry_count;
        let missed = self.heartbeat.missed();
        let last_rtt = self.heartbeat.last_rtt();
        let sent_at = self.heartbeat.last_sent_at();
        let ack_at = self.heartbeat.last_ack_at();
        let buffered = self.buffer.len();
        self.shared.snapshot.send_modify(|s| {
            s.retry_count = retry_count;
            s.missed_heartbeats = missed;
            s.last_rtt = last_rtt;
            s.last_heartbeat_sent_at = sent_at;
            s.last_heartbeat_ack_at = ack_at;
            s.buffered_frames = buffered;
        });
    }

    fn emit(&self, event: LinkEvent) {
        // The router may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    /// Reach `Closed`, abandon buffered frames and reject queued sends.
    fn finish(&mut self) {
        self.shared.apply(LifecycleEvent::Close);
        let state = self.shared.state();
        let abandoned = self.buffer.clear();
        if !abandoned.is_empty() {
            log::info!(
                "[Connection] discarding {} buffered frame(s) on close",
                abandoned.len()
            );
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send { reply, .. } = command {
                let _ = reply.send(Err(ClientError::Closed));
            }
        }
        self.publish_stats();
        if let ConnectionState::Closed(reason) = state {
            self.emit(LinkEvent::Closed(reason));
        }
    }
}
