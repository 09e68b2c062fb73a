//! Outbound dispatch pipeline.
//!
//! Turns a user's "send" into a delivered, server-confirmed message:
//!
//! 1. [`DispatchPipeline::enqueue`] creates an [`OutboundMessage`] with a
//!    fresh temp id, appends it to the store (optimistic UI) and queues it.
//! 2. [`DispatchPipeline::drain`] takes ready items in FIFO order, one in
//!    flight at a time. An attempt goes over the socket first when
//!    configured, otherwise (or when the connection is closed) through the
//!    [`FallbackSender`].
//! 3. A server record, from the REST response or pushed over the socket,
//!    replaces the temp record in the store. First writer wins; later acks
//!    for the same temp id are no-ops.
//! 4. A failed attempt is requeued at the tail after `retry_delay * attempt`
//!    while `attempt <= max_retries`, then the record is marked `failed`
//!    and waits for [`DispatchPipeline::resend_failed`].
//! 5. A frame written to a socket that drops before the server echo counts
//!    as a failed attempt ([`DispatchPipeline::on_link_lost`]). Frames still
//!    sitting in the outbound buffer are left alone; they go out on the next
//!    open.
//!
//! The queue capacity only limits admission. Retries of admitted messages
//! are always requeued.
//!
//! The queue lives behind a `std::sync::Mutex` and a `Notify` wakes the
//! background loop, the same shape as a PTY message delivery queue.

// Rust guideline compliant 2026-02

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionHandle, SendReceipt};
use crate::constants::{
    DISPATCH_MAX_RETRIES, DISPATCH_QUEUE_CAPACITY, DISPATCH_RETRY_DELAY, DUPLICATE_SEND_WINDOW,
    EVENT_CHANNEL_CAPACITY,
};
use crate::error::{ClientError, Result};
use crate::model::{
    ConversationId, MessageId, MessageRecord, MessageStatus, OutboundMessage, SendErrorCode,
    ServerMessage, TempId,
};
use crate::protocol;
use crate::store::{ConversationStore, ReplaceOutcome};
use crate::telemetry::{Recorder, TelemetryEvent};

/// Secondary delivery route (the REST endpoint in production).
#[async_trait]
pub trait FallbackSender: Send + Sync + std::fmt::Debug {
    /// Persist `message` and return the server record.
    async fn send_message(&self, message: &OutboundMessage) -> Result<ServerMessage>;
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Try the socket before the fallback route.
    pub socket_first: bool,
    /// Failed attempts tolerated before a message is marked `failed`.
    pub max_retries: u32,
    /// Retry delay unit; the n-th retry waits `retry_delay * n`.
    pub retry_delay: Duration,
    /// Maximum queued items.
    pub queue_capacity: usize,
    /// Repeating an unconfirmed send within this window returns the first
    /// message. Zero disables the check.
    pub duplicate_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            socket_first: false,
            max_retries: DISPATCH_MAX_RETRIES,
            retry_delay: DISPATCH_RETRY_DELAY,
            queue_capacity: DISPATCH_QUEUE_CAPACITY,
            duplicate_window: DUPLICATE_SEND_WINDOW,
        }
    }
}

/// Where an acknowledgement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSource {
    /// The fallback route's response.
    Response,
    /// A server push carrying the temp id.
    Push,
}

/// Pipeline progress notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// Message queued (new or resent).
    Enqueued {
        /// Temp id.
        temp_id: TempId,
        /// Conversation.
        conversation_id: ConversationId,
    },
    /// Message handed to the socket; waiting for the server push.
    Dispatched {
        /// Temp id.
        temp_id: TempId,
        /// Whether the frame went out now or sits in the outbound buffer.
        buffered: bool,
    },
    /// Temp record replaced by the server record.
    Acknowledged {
        /// Temp id.
        temp_id: TempId,
        /// Server id.
        message_id: MessageId,
        /// Where the ack came from.
        source: AckSource,
    },
    /// One attempt failed; the message is requeued.
    AttemptFailed {
        /// Temp id.
        temp_id: TempId,
        /// Failed attempts so far.
        attempt: u32,
        /// Failure cause.
        error: String,
        /// Classified cause.
        code: SendErrorCode,
        /// Delay before the next attempt.
        retry_in: Duration,
    },
    /// Retry budget exhausted; waiting for manual resend.
    Failed {
        /// Temp id.
        temp_id: TempId,
        /// Failed attempts.
        attempt: u32,
        /// Last failure cause.
        error: String,
        /// Classified cause.
        code: SendErrorCode,
    },
    /// Dropped because the session closed.
    Abandoned {
        /// Temp id.
        temp_id: TempId,
    },
}

#[derive(Debug, Clone)]
struct QueuedItem {
    temp_id: TempId,
    not_before: Option<Instant>,
}

enum Delivery {
    Dispatched(SendReceipt),
    Confirmed(ServerMessage),
}

/// Messages whose frame reached an open socket and now wait for the echo.
#[derive(Debug, Default)]
struct InFlight {
    /// Bumped on every link loss.
    link_epoch: u64,
    temp_ids: HashSet<TempId>,
}

/// FIFO delivery queue with retry and reconciliation.
pub struct DispatchPipeline {
    store: Arc<ConversationStore>,
    connection: Option<ConnectionHandle>,
    fallback: Option<Arc<dyn FallbackSender>>,
    config: DispatchConfig,
    queue: Mutex<VecDeque<QueuedItem>>,
    wake: Notify,
    /// Held for the duration of a drain; keeps one attempt in flight.
    draining: tokio::sync::Mutex<()>,
    in_flight: Mutex<InFlight>,
    closed: AtomicBool,
    events: broadcast::Sender<DispatchEvent>,
    recorder: Recorder,
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("pending", &self.pending_count())
            .field("socket_first", &self.config.socket_first)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DispatchPipeline {
    /// Create a pipeline. Either route may be absent; with neither, every
    /// attempt fails and messages end up `failed`.
    pub fn new(
        store: Arc<ConversationStore>,
        connection: Option<ConnectionHandle>,
        fallback: Option<Arc<dyn FallbackSender>>,
        config: DispatchConfig,
        recorder: Recorder,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            connection,
            fallback,
            config,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            draining: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(InFlight::default()),
            closed: AtomicBool::new(false),
            events,
            recorder,
        }
    }

    /// Subscribe to pipeline notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Items waiting in the queue (including ones waiting for a retry delay).
    pub fn pending_count(&self) -> usize {
        self.queue.lock().expect("dispatch queue lock poisoned").len()
    }

    fn emit(&self, event: DispatchEvent) {
        let _ = self.events.send(event);
    }

    fn queue_full(&self) -> ClientError {
        ClientError::Delivery(format!(
            "dispatch queue full ({} items)",
            self.config.queue_capacity
        ))
    }

    /// Queue a retry of an admitted message, replacing any stale entry.
    fn requeue(&self, item: QueuedItem) {
        {
            let mut queue = self.queue.lock().expect("dispatch queue lock poisoned");
            queue.retain(|queued| queued.temp_id != item.temp_id);
            queue.push_back(item);
        }
        self.wake.notify_one();
    }

    /// An unconfirmed message with the same fingerprint created within the
    /// duplicate window.
    fn find_duplicate(&self, candidate: &OutboundMessage) -> Option<OutboundMessage> {
        if self.config.duplicate_window.is_zero() {
            return None;
        }
        let fingerprint = candidate.fingerprint();
        [MessageStatus::Pending, MessageStatus::Dispatched]
            .into_iter()
            .flat_map(|status| self.store.outbound_with_status(status))
            .find(|m| {
                m.fingerprint() == fingerprint
                    && (candidate.created_at - m.created_at)
                        .to_std()
                        .is_ok_and(|age| age <= self.config.duplicate_window)
            })
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Create a pending message, show it in the store and queue it.
    ///
    /// A repeat of a still unconfirmed message (same conversation and
    /// content prefix, see [`OutboundMessage::fingerprint`]) inside the
    /// duplicate window returns the existing message and queues nothing.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] after [`abandon_all`](Self::abandon_all),
    /// [`ClientError::Delivery`] when the queue is full. Nothing is added
    /// to the store on error.
    pub fn enqueue(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<OutboundMessage> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let message = OutboundMessage::new(conversation_id, content);
        if let Some(existing) = self.find_duplicate(&message) {
            log::debug!(
                "[Dispatch] ignoring repeated send, {} is still unconfirmed",
                existing.temp_id
            );
            return Ok(existing);
        }
        {
            // Held across the store append so the record and its queue
            // entry appear together.
            let mut queue = self.queue.lock().expect("dispatch queue lock poisoned");
            if queue.len() >= self.config.queue_capacity {
                return Err(self.queue_full());
            }
            self.store
                .append_message(MessageRecord::Outbound(message.clone()));
            queue.push_back(QueuedItem {
                temp_id: message.temp_id.clone(),
                not_before: None,
            });
        }
        self.wake.notify_one();
        log::debug!(
            "[Dispatch] queued {} for {}",
            message.temp_id,
            message.conversation_id
        );
        self.emit(DispatchEvent::Enqueued {
            temp_id: message.temp_id.clone(),
            conversation_id: message.conversation_id.clone(),
        });
        Ok(message)
    }

    /// Reset a `failed` message's attempt count and queue it again.
    ///
    /// # Errors
    ///
    /// [`ClientError::Delivery`] if no failed message has this temp id or
    /// the queue is full; the message then stays `failed`.
    pub fn resend_failed(&self, temp_id: &TempId) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let is_failed = self
            .store
            .find_outbound(temp_id)
            .is_some_and(|m| m.status == MessageStatus::Failed);
        if !is_failed {
            return Err(ClientError::Delivery(format!(
                "{temp_id} is not a failed message"
            )));
        }
        let message = {
            let mut queue = self.queue.lock().expect("dispatch queue lock poisoned");
            if queue.len() >= self.config.queue_capacity {
                return Err(self.queue_full());
            }
            let Some(message) = self.store.update_outbound(temp_id, |m| {
                m.status = MessageStatus::Pending;
                m.attempt = 0;
                m.last_error = None;
                m.error_code = None;
            }) else {
                return Err(ClientError::Delivery(format!("{temp_id} vanished")));
            };
            queue.push_back(QueuedItem {
                temp_id: temp_id.clone(),
                not_before: None,
            });
            message
        };
        self.wake.notify_one();
        log::info!("[Dispatch] resending {temp_id}");
        self.emit(DispatchEvent::Enqueued {
            temp_id: temp_id.clone(),
            conversation_id: message.conversation_id,
        });
        Ok(())
    }

    /// Resend every `failed` message. Returns how many were requeued.
    pub fn resend_all_failed(&self) -> usize {
        self.store
            .outbound_with_status(MessageStatus::Failed)
            .iter()
            .filter(|m| self.resend_failed(&m.temp_id).is_ok())
            .count()
    }

    /// Process ready items in FIFO order until none is ready.
    ///
    /// Items waiting for a retry delay are skipped. Returns the number of
    /// attempts made.
    pub async fn drain(&self) -> usize {
        let _draining = self.draining.lock().await;
        let mut attempts = 0;
        while let Some(item) = self.next_ready() {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            self.attempt(item).await;
            attempts += 1;
        }
        attempts
    }

    /// Background loop: drain whenever woken or a retry comes due.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        log::debug!("[Dispatch] pipeline started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = self.drain() => {}
            }
            let next_due = self.next_due();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.wake.notified() => {}
                () = sleep_until(next_due) => {}
            }
        }
        log::debug!("[Dispatch] pipeline stopped");
    }

    /// Reconcile a server-pushed message.
    ///
    /// With a temp id it replaces the matching temp record (even while a
    /// local attempt is in flight); an unknown temp id is a reconciliation
    /// conflict and the message is kept as new. Without one it is appended.
    pub fn handle_server_message(&self, message: ServerMessage) {
        match message.temp_id.clone() {
            Some(temp_id) => {
                self.reconcile(&temp_id, message, AckSource::Push);
            }
            None => {
                self.store.append_message(MessageRecord::Server(message));
            }
        }
    }

    /// A buffered `send_message` frame was dropped before transmission.
    pub fn on_evicted(&self, temp_id: &TempId) {
        self.attempt_failed(
            temp_id,
            &ClientError::Delivery("dropped from the outbound buffer".into()),
        );
    }

    /// A buffered `send_message` frame was written after a reconnect.
    pub fn on_transmitted(&self, temp_id: &TempId) {
        let dispatched = self
            .store
            .find_outbound(temp_id)
            .is_some_and(|m| m.status == MessageStatus::Dispatched);
        if dispatched {
            self.in_flight
                .lock()
                .expect("dispatch in-flight lock poisoned")
                .temp_ids
                .insert(temp_id.clone());
        }
    }

    /// The socket dropped. Every message written to it that the server has
    /// not echoed yet counts as a failed attempt and goes back to the queue.
    ///
    /// Returns how many messages were affected.
    pub fn on_link_lost(&self) -> usize {
        let stranded = {
            let mut in_flight = self
                .in_flight
                .lock()
                .expect("dispatch in-flight lock poisoned");
            in_flight.link_epoch += 1;
            std::mem::take(&mut in_flight.temp_ids)
        };
        let mut waiting: Vec<OutboundMessage> = self
            .store
            .outbound_with_status(MessageStatus::Dispatched)
            .into_iter()
            .filter(|m| stranded.contains(&m.temp_id))
            .collect();
        waiting.sort_by_key(|m| m.created_at);
        for message in &waiting {
            self.attempt_failed(&message.temp_id, &link_lost());
        }
        if !waiting.is_empty() {
            log::info!(
                "[Dispatch] link lost with {} unacknowledged message(s)",
                waiting.len()
            );
        }
        waiting.len()
    }

    /// Discard the queue and mark every unconfirmed message abandoned.
    ///
    /// Further enqueues fail with [`ClientError::Closed`].
    pub fn abandon_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue
            .lock()
            .expect("dispatch queue lock poisoned")
            .clear();
        self.in_flight
            .lock()
            .expect("dispatch in-flight lock poisoned")
            .temp_ids
            .clear();

        let mut abandoned = 0;
        for status in [MessageStatus::Pending, MessageStatus::Dispatched] {
            for message in self.store.outbound_with_status(status) {
                let marked = self.store.update_outbound(&message.temp_id, |m| {
                    m.status = MessageStatus::Failed;
                    m.last_error = Some("abandoned: session closed".into());
                    m.error_code = Some(SendErrorCode::NotConnected);
                });
                if marked.is_some() {
                    abandoned += 1;
                    self.emit(DispatchEvent::Abandoned {
                        temp_id: message.temp_id,
                    });
                }
            }
        }
        if abandoned > 0 {
            log::info!("[Dispatch] abandoned {abandoned} unconfirmed message(s)");
        }
        self.wake.notify_one();
    }

    // ========================================================================
    // Attempts
    // ========================================================================

    fn next_ready(&self) -> Option<QueuedItem> {
        let now = Instant::now();
        let mut queue = self.queue.lock().expect("dispatch queue lock poisoned");
        let index = queue
            .iter()
            .position(|item| match item.not_before {
                Some(due) => due <= now,
                None => true,
            })?;
        queue.remove(index)
    }

    fn next_due(&self) -> Option<Instant> {
        let queue = self.queue.lock().expect("dispatch queue lock poisoned");
        queue.iter().filter_map(|item| item.not_before).min()
    }

    async fn attempt(&self, item: QueuedItem) {
        let temp_id = item.temp_id;
        let Some(message) = self.store.update_outbound(&temp_id, |m| {
            if m.status == MessageStatus::Pending {
                m.status = MessageStatus::Dispatched;
            }
        }) else {
            // Unchanged means it was not pending; gone means already confirmed.
            log::debug!("[Dispatch] skipping {temp_id}: no pending record");
            return;
        };

        let epoch = self.link_epoch();
        match self.deliver(&message).await {
            Ok(Delivery::Dispatched(receipt)) => {
                let buffered = receipt == SendReceipt::Buffered;
                if !buffered && !self.track_in_flight(&temp_id, epoch) {
                    // The socket dropped while the frame was being written.
                    self.attempt_failed(&temp_id, &link_lost());
                    return;
                }
                log::debug!(
                    "[Dispatch] {temp_id} handed to socket{}",
                    if buffered { " (buffered)" } else { "" }
                );
                self.emit(DispatchEvent::Dispatched { temp_id, buffered });
            }
            Ok(Delivery::Confirmed(server)) => {
                log::debug!("[Dispatch] {temp_id} confirmed by fallback response");
                self.reconcile(&temp_id, server, AckSource::Response);
            }
            Err(e) => self.attempt_failed(&temp_id, &e),
        }
    }

    fn link_epoch(&self) -> u64 {
        self.in_flight
            .lock()
            .expect("dispatch in-flight lock poisoned")
            .link_epoch
    }

    /// Record a transmitted message unless the link dropped since `epoch`.
    fn track_in_flight(&self, temp_id: &TempId, epoch: u64) -> bool {
        let mut in_flight = self
            .in_flight
            .lock()
            .expect("dispatch in-flight lock poisoned");
        if in_flight.link_epoch != epoch {
            return false;
        }
        in_flight.temp_ids.insert(temp_id.clone());
        true
    }

    fn forget_in_flight(&self, temp_id: &TempId) {
        self.in_flight
            .lock()
            .expect("dispatch in-flight lock poisoned")
            .temp_ids
            .remove(temp_id);
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<Delivery> {
        if self.config.socket_first {
            if let Some(connection) = &self.connection {
                match connection.send(protocol::send_message(message)).await {
                    Ok(receipt) => return Ok(Delivery::Dispatched(receipt)),
                    Err(e) => log::warn!(
                        "[Dispatch] socket send failed for {}, falling back: {e}",
                        message.temp_id
                    ),
                }
            }
        }
        match &self.fallback {
            Some(fallback) => fallback
                .send_message(message)
                .await
                .map(Delivery::Confirmed),
            None => Err(ClientError::Delivery("no delivery route available".into())),
        }
    }

    fn attempt_failed(&self, temp_id: &TempId, error: &ClientError) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.forget_in_flight(temp_id);
        let max_retries = self.config.max_retries;
        let code = error.send_error_code();
        let Some(updated) = self.store.update_outbound(temp_id, |m| {
            m.attempt += 1;
            m.last_error = Some(error.to_string());
            m.error_code = Some(code);
            m.status = if m.attempt <= max_retries {
                MessageStatus::Pending
            } else {
                MessageStatus::Failed
            };
        }) else {
            log::debug!("[Dispatch] {temp_id} already confirmed, ignoring failure");
            return;
        };

        self.recorder.record(TelemetryEvent::DeliveryAttemptFailed);
        if updated.status == MessageStatus::Failed {
            log::warn!(
                "[Dispatch] {temp_id} failed after {} attempt(s) ({code:?}): {error}",
                updated.attempt
            );
            self.recorder.record(TelemetryEvent::MessageFailed);
            self.emit(DispatchEvent::Failed {
                temp_id: temp_id.clone(),
                attempt: updated.attempt,
                error: error.to_string(),
                code,
            });
            return;
        }

        let retry_in = self.config.retry_delay * updated.attempt;
        log::info!(
            "[Dispatch] attempt {} for {temp_id} failed ({code:?}), retrying in {retry_in:?}: {error}",
            updated.attempt
        );
        self.requeue(QueuedItem {
            temp_id: temp_id.clone(),
            not_before: Some(Instant::now() + retry_in),
        });
        self.emit(DispatchEvent::AttemptFailed {
            temp_id: temp_id.clone(),
            attempt: updated.attempt,
            error: error.to_string(),
            code,
            retry_in,
        });
    }

    fn reconcile(&self, temp_id: &TempId, server: ServerMessage, source: AckSource) {
        let message_id = server.id.clone();
        match self.store.replace_temp(temp_id, server) {
            ReplaceOutcome::Replaced => {
                self.queue
                    .lock()
                    .expect("dispatch queue lock poisoned")
                    .retain(|item| &item.temp_id != temp_id);
                self.forget_in_flight(temp_id);
                self.recorder.record(TelemetryEvent::MessageAcknowledged);
                log::debug!("[Dispatch] {temp_id} -> {message_id} ({source:?})");
                self.emit(DispatchEvent::Acknowledged {
                    temp_id: temp_id.clone(),
                    message_id,
                    source,
                });
            }
            ReplaceOutcome::AlreadyPresent => {
                log::debug!("[Dispatch] duplicate ack for {temp_id} ignored");
            }
            ReplaceOutcome::Appended => {
                log::warn!(
                    "[Dispatch] {}; kept {message_id} as a new message",
                    ClientError::ReconciliationConflict(temp_id.clone())
                );
            }
        }
    }
}

fn link_lost() -> ClientError {
    ClientError::Transport("connection lost before acknowledgement".into())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
    use crate::model::SenderType;
    use crate::transport::memory::memory_link;
    use chrono::Utc;

    /// Fallback that fails a scripted number of times, then succeeds.
    #[derive(Debug)]
    struct ScriptedFallback {
        failures_left: Mutex<u32>,
        calls: Mutex<Vec<TempId>>,
        next_id: Mutex<u32>,
    }

    impl ScriptedFallback {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: Mutex::new(times),
                calls: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
            })
        }

        fn calls(&self) -> Vec<TempId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FallbackSender for ScriptedFallback {
        async fn send_message(&self, message: &OutboundMessage) -> Result<ServerMessage> {
            self.calls.lock().unwrap().push(message.temp_id.clone());
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(ClientError::Http {
                        status: 503,
                        message: "unavailable".into(),
                    });
                }
            }
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(server_record(&format!("srv-{}", *next), message))
        }
    }

    fn server_record(id: &str, message: &OutboundMessage) -> ServerMessage {
        ServerMessage {
            id: MessageId::from(id),
            temp_id: Some(message.temp_id.clone()),
            conversation_id: message.conversation_id.clone(),
            sender_type: SenderType::Agent,
            content: message.content.clone(),
            created_at: Utc::now(),
            read_at: None,
            sequence: None,
        }
    }

    fn pipeline(fallback: Option<Arc<ScriptedFallback>>) -> (Arc<DispatchPipeline>, Arc<ConversationStore>) {
        let store = Arc::new(ConversationStore::default());
        let fallback = fallback.map(|f| f as Arc<dyn FallbackSender>);
        let pipeline = Arc::new(DispatchPipeline::new(
            Arc::clone(&store),
            None,
            fallback,
            DispatchConfig::default(),
            Recorder::disabled(),
        ));
        (pipeline, store)
    }

    fn pipeline_with(
        fallback: Option<Arc<ScriptedFallback>>,
        config: DispatchConfig,
    ) -> (Arc<DispatchPipeline>, Arc<ConversationStore>) {
        let store = Arc::new(ConversationStore::default());
        let pipeline = Arc::new(DispatchPipeline::new(
            Arc::clone(&store),
            None,
            fallback.map(|f| f as Arc<dyn FallbackSender>),
            config,
            Recorder::disabled(),
        ));
        (pipeline, store)
    }

    fn conv() -> ConversationId {
        ConversationId::from("c1")
    }

    // ========== Enqueue / Drain Tests ==========

    #[tokio::test]
    async fn test_enqueue_is_optimistic_then_confirmed() {
        let fallback = ScriptedFallback::failing(0);
        let (pipeline, store) = pipeline(Some(Arc::clone(&fallback)));

        let message = pipeline.enqueue(conv(), "hello").unwrap();
        let records = store.messages(&conv());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status(), MessageStatus::Pending);
        assert_eq!(pipeline.pending_count(), 1);

        assert_eq!(pipeline.drain().await, 1);
        let records = store.messages(&conv());
        assert_eq!(records[0].status(), MessageStatus::Sent);
        assert_eq!(records[0].id(), Some(&MessageId::from("srv-1")));
        assert_eq!(records[0].temp_id(), Some(&message.temp_id));
        assert_eq!(pipeline.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_preserves_fifo_order() {
        let fallback = ScriptedFallback::failing(0);
        let (pipeline, _store) = pipeline(Some(Arc::clone(&fallback)));

        let a = pipeline.enqueue(conv(), "a").unwrap();
        let b = pipeline.enqueue(conv(), "b").unwrap();
        let c = pipeline.enqueue(conv(), "c").unwrap();
        pipeline.drain().await;
        assert_eq!(fallback.calls(), vec![a.temp_id, b.temp_id, c.temp_id]);
    }

    #[tokio::test]
    async fn test_queue_capacity_enforced() {
        let store = Arc::new(ConversationStore::default());
        let pipeline = DispatchPipeline::new(
            Arc::clone(&store),
            None,
            None,
            DispatchConfig {
                queue_capacity: 1,
                ..DispatchConfig::default()
            },
            Recorder::disabled(),
        );
        pipeline.enqueue(conv(), "a").unwrap();
        assert!(matches!(
            pipeline.enqueue(conv(), "b"),
            Err(ClientError::Delivery(_))
        ));
        assert_eq!(store.messages(&conv()).len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_send_returns_unconfirmed_message() {
        let fallback = ScriptedFallback::failing(0);
        let (pipeline, store) = pipeline(Some(Arc::clone(&fallback)));

        let first = pipeline.enqueue(conv(), "double click").unwrap();
        let again = pipeline.enqueue(conv(), "double click").unwrap();
        assert_eq!(again.temp_id, first.temp_id);
        assert_eq!(pipeline.pending_count(), 1);
        assert_eq!(store.messages(&conv()).len(), 1);

        let other = pipeline.enqueue(ConversationId::from("c2"), "double click").unwrap();
        assert_ne!(other.temp_id, first.temp_id);

        // Once confirmed the same text is a new message.
        pipeline.drain().await;
        let later = pipeline.enqueue(conv(), "double click").unwrap();
        assert_ne!(later.temp_id, first.temp_id);
        assert_eq!(store.messages(&conv()).len(), 2);
    }

    #[tokio::test]
    async fn test_zero_duplicate_window_allows_repeats() {
        let (pipeline, store) = pipeline_with(
            None,
            DispatchConfig {
                duplicate_window: Duration::ZERO,
                ..DispatchConfig::default()
            },
        );
        pipeline.enqueue(conv(), "again").unwrap();
        pipeline.enqueue(conv(), "again").unwrap();
        assert_eq!(store.messages(&conv()).len(), 2);
    }

    // ========== Retry Tests ==========

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_fails_terminally() {
        let fallback = ScriptedFallback::failing(10);
        let (pipeline, store) = pipeline(Some(Arc::clone(&fallback)));
        let mut events = pipeline.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&pipeline).run(cancel.clone()));

        let message = pipeline.enqueue(conv(), "doomed").unwrap();
        let mut retry_delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                DispatchEvent::AttemptFailed { retry_in, .. } => retry_delays.push(retry_in),
                DispatchEvent::Failed { attempt, .. } => {
                    assert_eq!(attempt, 3);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(
            retry_delays,
            vec![Duration::from_millis(800), Duration::from_millis(1600)]
        );
        let record = store.find_outbound(&message.temp_id).unwrap();
        assert_eq!(record.status, MessageStatus::Failed);
        assert_eq!(record.attempt, 3);
        assert_eq!(fallback.calls().len(), 3);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_failed_resets_attempt_and_succeeds() {
        let fallback = ScriptedFallback::failing(3);
        let (pipeline, store) = pipeline(Some(Arc::clone(&fallback)));
        let mut events = pipeline.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&pipeline).run(cancel.clone()));

        let message = pipeline.enqueue(conv(), "retry me").unwrap();
        while !matches!(events.recv().await.unwrap(), DispatchEvent::Failed { .. }) {}

        pipeline.resend_failed(&message.temp_id).unwrap();
        assert!(matches!(
            pipeline.resend_failed(&message.temp_id),
            Err(ClientError::Delivery(_))
        ));
        loop {
            if let DispatchEvent::Acknowledged { temp_id, .. } = events.recv().await.unwrap() {
                assert_eq!(temp_id, message.temp_id);
                break;
            }
        }
        let records = store.messages(&conv());
        assert_eq!(records[0].status(), MessageStatus::Sent);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_requeues_at_tail() {
        let fallback = ScriptedFallback::failing(1);
        let (pipeline, _store) = pipeline(Some(Arc::clone(&fallback)));
        let mut events = pipeline.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&pipeline).run(cancel.clone()));

        let a = pipeline.enqueue(conv(), "a").unwrap();
        let b = pipeline.enqueue(conv(), "b").unwrap();
        let mut acked = 0;
        while acked < 2 {
            if let DispatchEvent::Acknowledged { .. } = events.recv().await.unwrap() {
                acked += 1;
            }
        }
        assert_eq!(
            fallback.calls(),
            vec![a.temp_id.clone(), b.temp_id, a.temp_id]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_no_route_fails_each_attempt() {
        let (pipeline, store) = pipeline(None);
        let message = pipeline.enqueue(conv(), "nowhere").unwrap();
        pipeline.drain().await;
        let record = store.find_outbound(&message.temp_id).unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.error_code, Some(SendErrorCode::NotConnected));
        assert!(record.last_error.unwrap().contains("no delivery route"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_requeued_when_queue_is_full() {
        let fallback = ScriptedFallback::failing(1);
        let (pipeline, store) = pipeline_with(
            Some(Arc::clone(&fallback)),
            DispatchConfig {
                queue_capacity: 1,
                ..DispatchConfig::default()
            },
        );
        let mut events = pipeline.subscribe();

        let a = pipeline.enqueue(conv(), "a").unwrap();
        let in_flight = pipeline.next_ready().unwrap();
        let b = pipeline.enqueue(conv(), "b").unwrap();
        pipeline.attempt(in_flight).await;

        let record = store.find_outbound(&a.temp_id).unwrap();
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.error_code, Some(SendErrorCode::ServerError));
        assert_eq!(pipeline.pending_count(), 2);

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&pipeline).run(cancel.clone()));
        let mut acked = Vec::new();
        while acked.len() < 2 {
            if let DispatchEvent::Acknowledged { temp_id, .. } = events.recv().await.unwrap() {
                acked.push(temp_id);
            }
        }
        assert_eq!(acked, vec![b.temp_id, a.temp_id]);
        assert!(store
            .messages(&conv())
            .iter()
            .all(|m| m.status() == MessageStatus::Sent));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_resend_into_full_queue_stays_failed() {
        let (pipeline, store) = pipeline_with(
            None,
            DispatchConfig {
                queue_capacity: 1,
                max_retries: 0,
                ..DispatchConfig::default()
            },
        );
        let a = pipeline.enqueue(conv(), "a").unwrap();
        pipeline.drain().await;
        assert_eq!(
            store.find_outbound(&a.temp_id).unwrap().status,
            MessageStatus::Failed
        );

        pipeline.enqueue(conv(), "b").unwrap();
        assert!(matches!(
            pipeline.resend_failed(&a.temp_id),
            Err(ClientError::Delivery(_))
        ));
        let record = store.find_outbound(&a.temp_id).unwrap();
        assert_eq!(record.status, MessageStatus::Failed);
        assert_eq!(record.attempt, 1);
        assert_eq!(pipeline.pending_count(), 1);
    }

    // ========== Link Loss Tests ==========

    #[tokio::test]
    async fn test_link_loss_requeues_transmitted_send() {
        let (connector, mut server) = memory_link();
        let cancel = CancellationToken::new();
        let (connection, _link_events, _task) = ConnectionManager::spawn(
            Arc::new(connector),
            ConnectionConfig::default(),
            Recorder::disabled(),
            cancel.clone(),
        );
        connection.connect().unwrap();
        let mut conn = server.accept().await.unwrap();
        connection.wait_for(|s| *s == ConnectionState::Open).await;

        let store = Arc::new(ConversationStore::default());
        let pipeline = DispatchPipeline::new(
            Arc::clone(&store),
            Some(connection),
            None,
            DispatchConfig {
                socket_first: true,
                ..DispatchConfig::default()
            },
            Recorder::disabled(),
        );
        let message = pipeline.enqueue(conv(), "hello").unwrap();
        pipeline.drain().await;
        let frame = conn.recv_type("send_message").await.unwrap();
        assert_eq!(frame["tempId"], message.temp_id.as_str());
        assert_eq!(
            store.find_outbound(&message.temp_id).unwrap().status,
            MessageStatus::Dispatched
        );

        assert_eq!(pipeline.on_link_lost(), 1);
        let record = store.find_outbound(&message.temp_id).unwrap();
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.error_code, Some(SendErrorCode::NotConnected));
        assert_eq!(pipeline.pending_count(), 1);

        // Already requeued; a second drop changes nothing.
        assert_eq!(pipeline.on_link_lost(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_buffered_send_is_left_alone_until_flushed() {
        let (connector, _server) = memory_link();
        let cancel = CancellationToken::new();
        let (connection, _link_events, _task) = ConnectionManager::spawn(
            Arc::new(connector),
            ConnectionConfig::default(),
            Recorder::disabled(),
            cancel.clone(),
        );
        let store = Arc::new(ConversationStore::default());
        let pipeline = DispatchPipeline::new(
            Arc::clone(&store),
            Some(connection),
            None,
            DispatchConfig {
                socket_first: true,
                ..DispatchConfig::default()
            },
            Recorder::disabled(),
        );
        let message = pipeline.enqueue(conv(), "hello").unwrap();
        pipeline.drain().await;

        // Still in the outbound buffer, it goes out on the next open.
        assert_eq!(pipeline.on_link_lost(), 0);
        assert_eq!(
            store.find_outbound(&message.temp_id).unwrap().status,
            MessageStatus::Dispatched
        );

        pipeline.on_transmitted(&message.temp_id);
        assert_eq!(pipeline.on_link_lost(), 1);
        assert_eq!(store.find_outbound(&message.temp_id).unwrap().attempt, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_acknowledged_send_is_not_requeued_on_link_loss() {
        let (pipeline, store) = pipeline(None);
        let message = pipeline.enqueue(conv(), "hi").unwrap();
        store.update_outbound(&message.temp_id, |m| m.status = MessageStatus::Dispatched);
        pipeline.on_transmitted(&message.temp_id);
        pipeline.handle_server_message(server_record("push-1", &message));

        assert_eq!(pipeline.on_link_lost(), 0);
        assert_eq!(store.messages(&conv())[0].status(), MessageStatus::Sent);
    }

    // ========== Reconciliation Tests ==========

    #[tokio::test]
    async fn test_push_ack_first_writer_wins() {
        let fallback = ScriptedFallback::failing(0);
        let (pipeline, store) = pipeline(Some(Arc::clone(&fallback)));
        let mut events = pipeline.subscribe();

        let message = pipeline.enqueue(conv(), "hi").unwrap();
        pipeline.handle_server_message(server_record("push-1", &message));
        // The queued attempt finds no pending record and is skipped.
        pipeline.drain().await;
        pipeline.handle_server_message(server_record("push-1", &message));

        let records = store.messages(&conv());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), Some(&MessageId::from("push-1")));
        assert!(fallback.calls().is_empty());

        let mut acks = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DispatchEvent::Acknowledged { source: AckSource::Push, .. }) {
                acks += 1;
            }
        }
        assert_eq!(acks, 1);
    }

    #[tokio::test]
    async fn test_push_with_unknown_temp_is_kept_as_new() {
        let (pipeline, store) = pipeline(None);
        let stranger = OutboundMessage::new(conv(), "from another device");
        pipeline.handle_server_message(server_record("m-x", &stranger));
        assert_eq!(store.messages(&conv()).len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_counts_as_failed_attempt() {
        let (pipeline, store) = pipeline(None);
        let message = pipeline.enqueue(conv(), "evicted").unwrap();
        pipeline.on_evicted(&message.temp_id);
        let record = store.find_outbound(&message.temp_id).unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.error_code, Some(SendErrorCode::NotConnected));
        // The retry replaces the stale entry and waits for its delay.
        assert_eq!(pipeline.pending_count(), 1);
        assert_eq!(pipeline.drain().await, 0);
    }

    // ========== Close Tests ==========

    #[tokio::test]
    async fn test_abandon_all_marks_failed_and_rejects_new_sends() {
        let (pipeline, store) = pipeline(None);
        let message = pipeline.enqueue(conv(), "bye").unwrap();
        let mut events = pipeline.subscribe();

        pipeline.abandon_all();
        assert_eq!(pipeline.pending_count(), 0);
        let record = store.find_outbound(&message.temp_id).unwrap();
        assert_eq!(record.status, MessageStatus::Failed);
        assert!(record.last_error.unwrap().contains("abandoned"));
        assert_eq!(
            events.try_recv().unwrap(),
            DispatchEvent::Abandoned {
                temp_id: message.temp_id
            }
        );
        assert!(matches!(
            pipeline.enqueue(conv(), "late"),
            Err(ClientError::Closed)
        ));
    }
}
