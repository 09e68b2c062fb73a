//! Inbound event router.
//!
//! Consumes [`LinkEvent`]s from the connection manager, drops redelivered
//! frames through a [`RecentEventWindow`], decodes the rest into
//! [`InboundEvent`]s and dispatches them with one exhaustive match:
//!
//! - transport family (connected / disconnected / error): consumed here
//! - domain family: applied to the store or the dispatch pipeline, then
//!   rebroadcast to external subscribers
//! - unknown types: logged at debug and dropped
//!
//! Malformed frames are counted and dropped; they never stop the router.

// Rust guideline compliant 2026-02

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::connection::LinkEvent;
use crate::constants::PAYLOAD_HASH_PREFIX_LEN;
use crate::dispatch::DispatchPipeline;
use crate::error::Result;
use crate::model::MessageRecord;
use crate::protocol::{self, DomainEvent, Frame, InboundEvent, TransportEvent};
use crate::store::ConversationStore;
use crate::telemetry::{Recorder, TelemetryEvent};

// ============================================================================
// Dedup window
// ============================================================================

/// Fixed-capacity ring of recently seen event keys.
///
/// Slots are overwritten in insertion order; the set mirrors the ring for
/// O(1) membership checks. Memory is bounded by `capacity` keys.
#[derive(Debug)]
pub struct RecentEventWindow {
    slots: Vec<Option<String>>,
    next: usize,
    keys: HashSet<String>,
}

impl RecentEventWindow {
    /// Create a window remembering the last `capacity` keys.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RecentEventWindow capacity must be > 0");
        Self {
            slots: vec![None; capacity],
            next: 0,
            keys: HashSet::with_capacity(capacity),
        }
    }

    /// Record `key`. Returns false if it is already in the window.
    pub fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if let Some(evicted) = self.slots[self.next].take() {
            self.keys.remove(&evicted);
        }
        self.keys.insert(key.clone());
        self.slots[self.next] = Some(key);
        self.next = (self.next + 1) % self.slots.len();
        true
    }

    /// Whether `key` is in the window.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Forget everything (a new connection starts a new window).
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.keys.clear();
        self.next = 0;
    }

    /// Keys currently remembered.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Maximum keys remembered.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Stable dedup key for a frame.
///
/// Preference order: message id, secondary message id, timestamp, then a
/// truncated SHA-256 of the payload.
pub fn dedup_key(frame: &Frame) -> Result<String> {
    let event_type = protocol::event_type(frame)?;
    let data = protocol::payload(frame);

    let primary = data
        .get("id")
        .or_else(|| data.get("message").and_then(|m| m.get("id")));
    if let Some(id) = primary.and_then(scalar) {
        return Ok(format!("{event_type}:{id}"));
    }
    let secondary = data.get("messageId").or_else(|| data.get("message_id"));
    if let Some(id) = secondary.and_then(scalar) {
        return Ok(format!("{event_type}:{id}"));
    }
    let timestamp = data.get("timestamp").or_else(|| data.get("ts"));
    if let Some(ts) = timestamp.and_then(scalar) {
        return Ok(format!("{event_type}:ts:{ts}"));
    }

    let digest = Sha256::digest(data.to_string().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!(
        "{event_type}:h:{}",
        &hex[..PAYLOAD_HASH_PREFIX_LEN]
    ))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Router
// ============================================================================

/// What the router did with one [`LinkEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Domain event applied and rebroadcast.
    Domain,
    /// Transport event consumed.
    Transport,
    /// Dropped as a duplicate.
    Duplicate,
    /// Unknown type, dropped.
    Unknown(String),
    /// Undecodable, dropped.
    Malformed,
    /// Connection-level notification (lifecycle, eviction).
    Lifecycle,
}

/// Routes inbound frames to the store, the pipeline and subscribers.
#[derive(Debug)]
pub struct EventRouter {
    store: Arc<ConversationStore>,
    pipeline: Arc<DispatchPipeline>,
    window: RecentEventWindow,
    domain_events: broadcast::Sender<DomainEvent>,
    recorder: Recorder,
}

impl EventRouter {
    /// Create a router with a dedup window of `window_capacity` keys.
    pub fn new(
        store: Arc<ConversationStore>,
        pipeline: Arc<DispatchPipeline>,
        window_capacity: usize,
        domain_events: broadcast::Sender<DomainEvent>,
        recorder: Recorder,
    ) -> Self {
        Self {
            store,
            pipeline,
            window: RecentEventWindow::new(window_capacity.max(1)),
            domain_events,
            recorder,
        }
    }

    /// Route events until the channel closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.route(event);
                    }
                    None => break,
                },
            }
        }
        log::debug!("[Router] stopped");
    }

    /// Handle one event from the connection manager.
    pub fn route(&mut self, event: LinkEvent) -> RouteOutcome {
        match event {
            LinkEvent::Connected => {
                self.window.clear();
                log::info!("[Router] connected, dedup window reset");
                RouteOutcome::Lifecycle
            }
            LinkEvent::Disconnected { reason } => {
                log::info!("[Router] disconnected: {reason}");
                self.pipeline.on_link_lost();
                RouteOutcome::Lifecycle
            }
            LinkEvent::ConnectFailed { message } => {
                log::debug!("[Router] connect failed: {message}");
                RouteOutcome::Lifecycle
            }
            LinkEvent::Malformed { error } => {
                log::warn!("[Router] dropping malformed frame: {error}");
                self.recorder.record(TelemetryEvent::ProtocolError);
                RouteOutcome::Malformed
            }
            LinkEvent::Evicted(frame) => {
                if let Some(temp_id) = protocol::send_message_temp_id(&frame) {
                    self.pipeline.on_evicted(&temp_id);
                }
                RouteOutcome::Lifecycle
            }
            LinkEvent::Flushed(frame) => {
                if let Some(temp_id) = protocol::send_message_temp_id(&frame) {
                    self.pipeline.on_transmitted(&temp_id);
                }
                RouteOutcome::Lifecycle
            }
            LinkEvent::Closed(reason) => {
                log::info!("[Router] connection closed ({reason:?})");
                self.pipeline.abandon_all();
                RouteOutcome::Lifecycle
            }
            LinkEvent::Frame(frame) => self.route_frame(&frame),
        }
    }

    fn route_frame(&mut self, frame: &Frame) -> RouteOutcome {
        let key = match dedup_key(frame) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("[Router] dropping frame: {e}");
                self.recorder.record(TelemetryEvent::ProtocolError);
                return RouteOutcome::Malformed;
            }
        };
        if !self.window.insert(key.clone()) {
            log::debug!("[Router] duplicate {key} dropped");
            self.recorder.record(TelemetryEvent::DuplicateDropped);
            return RouteOutcome::Duplicate;
        }

        let event = match protocol::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("[Router] dropping frame {key}: {e}");
                self.recorder.record(TelemetryEvent::ProtocolError);
                return RouteOutcome::Malformed;
            }
        };
        self.recorder.record(TelemetryEvent::InboundEvent);

        match event {
            InboundEvent::Heartbeat(heartbeat) => {
                // Answered by the connection manager before frames get here.
                log::debug!("[Router] stray heartbeat {heartbeat:?}");
                RouteOutcome::Transport
            }
            InboundEvent::Transport(transport) => {
                self.on_transport(transport);
                RouteOutcome::Transport
            }
            InboundEvent::Domain(domain) => {
                self.on_domain(domain);
                RouteOutcome::Domain
            }
            InboundEvent::Unknown { event_type } => {
                log::debug!("[Router] unknown event type {event_type}, dropped");
                self.recorder.record(TelemetryEvent::UnknownEvent);
                RouteOutcome::Unknown(event_type)
            }
        }
    }

    fn on_transport(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => log::debug!("[Router] server welcome"),
            TransportEvent::Disconnected { reason } => {
                log::info!("[Router] server announced disconnect: {reason}");
            }
            TransportEvent::Error { message } => {
                log::warn!("[Router] server error: {message}");
            }
        }
    }

    fn on_domain(&self, event: DomainEvent) {
        match &event {
            DomainEvent::MessageAppended(message) => {
                if message.temp_id.is_some() {
                    self.pipeline.handle_server_message(message.clone());
                } else {
                    self.store
                        .append_message(MessageRecord::Server(message.clone()));
                }
            }
            DomainEvent::ConversationCreated(summary)
            | DomainEvent::ConversationUpdated(summary) => {
                self.store.upsert_conversation(summary.clone());
            }
            DomainEvent::MessageRead {
                conversation_id,
                message_id,
                read_at,
            } => {
                self.store
                    .mark_message_read(conversation_id, message_id, *read_at);
            }
            DomainEvent::Typing { .. } => {}
        }
        // Nobody listening is fine.
        let _ = self.domain_events.send(event);
    }
}
