//! Messaging session: one connection, one store, one pipeline.
//!
//! [`MessagingSession`] is built once per client context and owns every
//! background task. Components receive their collaborators explicitly;
//! nothing is looked up globally.
//!
//! ```text
//! ConnectionManager ──LinkEvent──► EventRouter ──► ConversationStore
//!        ▲                              │                 ▲
//!        │ send_message frames          ▼                 │
//!        └──────────────────────── DispatchPipeline ──────┘
//!                                       │
//!                                       ▼ fallback
//!                                   RestClient
//! ```
//!
//! Dropping or [`close`](MessagingSession::close)-ing the session cancels
//! all tasks and abandons unconfirmed sends.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectionSnapshot, ConnectionState};
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::dispatch::{DispatchEvent, DispatchPipeline, FallbackSender};
use crate::error::{ClientError, Result};
use crate::history::{HistoryLoader, HistorySource, LoadOutcome};
use crate::model::{ConversationId, MessageId, MessageRecord, OutboundMessage, TempId};
use crate::protocol::DomainEvent;
use crate::rest::RestClient;
use crate::router::EventRouter;
use crate::store::{ConversationStore, StoreEvent};
use crate::telemetry::{Recorder, Telemetry, TelemetrySnapshot};
use crate::transport::ws::WsConnector;
use crate::transport::Connector;

/// Builder for [`MessagingSession`].
#[derive(Debug)]
pub struct MessagingSessionBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    fallback: Option<Arc<dyn FallbackSender>>,
    history: Option<Arc<dyn HistorySource>>,
    telemetry: Option<Arc<Telemetry>>,
}

impl MessagingSessionBuilder {
    /// Start from `config` with no collaborators.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: None,
            fallback: None,
            history: None,
            telemetry: None,
        }
    }

    /// Use the production transports: a WebSocket to `socket_url()` and a
    /// [`RestClient`] for both fallback sends and history.
    pub fn with_default_transports(self) -> Result<Self> {
        let rest = Arc::new(RestClient::new(
            self.config.rest_base_url(),
            self.config.token.clone(),
        )?);
        let connector = WsConnector::new(&self.config.socket_url(), self.config.token.clone());
        Ok(self
            .connector(Arc::new(connector))
            .fallback(Arc::clone(&rest) as Arc<dyn FallbackSender>)
            .history(rest))
    }

    /// Transport used by the connection manager.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Secondary delivery route.
    #[must_use]
    pub fn fallback(mut self, fallback: Arc<dyn FallbackSender>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// History collaborator for pagination.
    #[must_use]
    pub fn history(mut self, history: Arc<dyn HistorySource>) -> Self {
        self.history = Some(history);
        self
    }

    /// Share an existing telemetry aggregator instead of creating one.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validate the config, wire the components and spawn their tasks.
    ///
    /// Must be called inside a tokio runtime. The connection stays idle
    /// until [`MessagingSession::connect`].
    pub fn build(self) -> Result<MessagingSession> {
        self.config
            .validate()
            .map_err(|e| ClientError::Config(format!("{e:#}")))?;
        let connector = self
            .connector
            .ok_or_else(|| ClientError::Config("no connector configured".into()))?;

        let telemetry = if self.config.telemetry_enabled {
            Some(self.telemetry.unwrap_or_else(Telemetry::new))
        } else {
            None
        };
        let recorder = telemetry.as_ref().map_or_else(Recorder::disabled, Recorder::new);

        let has_fallback = self.fallback.is_some();
        let cancel = CancellationToken::new();
        let store = Arc::new(ConversationStore::new(self.config.local_sender));
        let (connection, link_events, connection_task) = ConnectionManager::spawn(
            connector,
            self.config.connection_config(),
            recorder.clone(),
            cancel.clone(),
        );
        let pipeline = Arc::new(DispatchPipeline::new(
            Arc::clone(&store),
            Some(connection.clone()),
            self.fallback,
            self.config.dispatch_config(),
            recorder.clone(),
        ));
        let (domain_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let router = EventRouter::new(
            Arc::clone(&store),
            Arc::clone(&pipeline),
            self.config.dedup_window,
            domain_events.clone(),
            recorder,
        );

        let tasks = vec![
            connection_task,
            tokio::spawn(router.run(link_events, cancel.clone())),
            tokio::spawn(Arc::clone(&pipeline).run(cancel.clone())),
        ];
        log::info!(
            "[Session] ready (socket_first={}, fallback={}, history={})",
            self.config.socket_first,
            has_fallback,
            self.history.is_some()
        );

        Ok(MessagingSession {
            config: self.config,
            store,
            pipeline,
            connection,
            history_source: self.history,
            loaders: Mutex::new(HashMap::new()),
            domain_events,
            telemetry,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }
}

/// A running messaging client.
pub struct MessagingSession {
    config: ClientConfig,
    store: Arc<ConversationStore>,
    pipeline: Arc<DispatchPipeline>,
    connection: ConnectionHandle,
    history_source: Option<Arc<dyn HistorySource>>,
    loaders: Mutex<HashMap<ConversationId, Arc<HistoryLoader>>>,
    domain_events: broadcast::Sender<DomainEvent>,
    telemetry: Option<Arc<Telemetry>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MessagingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingSession")
            .field("server_url", &self.config.server_url)
            .field("state", &self.connection.state())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl MessagingSession {
    /// Builder starting from `config`.
    pub fn builder(config: ClientConfig) -> MessagingSessionBuilder {
        MessagingSessionBuilder::new(config)
    }

    /// Session with the production WebSocket and REST transports.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        Self::builder(config).with_default_transports()?.build()
    }

    /// Configuration the session was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the connection. No-op if already connecting or open.
    pub fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    /// Send `content` to a conversation.
    ///
    /// The returned record is already in the store as `pending`; progress
    /// is reported through [`subscribe_dispatch`](Self::subscribe_dispatch)
    /// and store events.
    pub fn send_text(
        &self,
        conversation_id: &ConversationId,
        content: impl Into<String>,
    ) -> Result<OutboundMessage> {
        self.pipeline.enqueue(conversation_id.clone(), content)
    }

    /// Requeue a `failed` message with a fresh retry budget.
    pub fn resend_failed(&self, temp_id: &TempId) -> Result<()> {
        self.pipeline.resend_failed(temp_id)
    }

    /// Requeue every `failed` message.
    pub fn resend_all_failed(&self) -> usize {
        self.pipeline.resend_all_failed()
    }

    /// Mark all inbound messages of a conversation read.
    pub fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Vec<MessageId> {
        self.store
            .mark_conversation_read(conversation_id, chrono::Utc::now())
    }

    /// Current messages of a conversation.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        self.store.messages(conversation_id)
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// The dispatch pipeline.
    pub fn pipeline(&self) -> &Arc<DispatchPipeline> {
        &self.pipeline
    }

    /// Pagination loader for a conversation (one per conversation).
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] if no history collaborator was configured.
    pub fn history(&self, conversation_id: &ConversationId) -> Result<Arc<HistoryLoader>> {
        let source = self
            .history_source
            .as_ref()
            .ok_or_else(|| ClientError::Config("no history source configured".into()))?;
        let mut loaders = self.loaders.lock().expect("history loaders lock poisoned");
        let loader = loaders.entry(conversation_id.clone()).or_insert_with(|| {
            Arc::new(HistoryLoader::new(
                conversation_id.clone(),
                Arc::clone(source),
                Arc::clone(&self.store),
                self.config.page_size,
            ))
        });
        Ok(Arc::clone(loader))
    }

    /// Load the next older history page of a conversation.
    pub async fn load_older(&self, conversation_id: &ConversationId) -> Result<LoadOutcome> {
        self.history(conversation_id)?.load_older().await
    }

    /// Store change notifications.
    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Dispatch pipeline notifications.
    pub fn subscribe_dispatch(&self) -> broadcast::Receiver<DispatchEvent> {
        self.pipeline.subscribe()
    }

    /// Domain events as received from the server (after dedup).
    pub fn subscribe_domain(&self) -> broadcast::Receiver<DomainEvent> {
        self.domain_events.subscribe()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connection state plus heartbeat and retry data.
    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    /// Watch connection snapshots.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.subscribe()
    }

    /// Wait until the connection state satisfies `predicate` (or closes).
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        self.connection.wait_for(predicate).await
    }

    /// Telemetry snapshot, `None` when telemetry is disabled.
    pub fn telemetry_snapshot(&self, reset: bool) -> Option<TelemetrySnapshot> {
        self.telemetry.as_ref().map(|t| t.snapshot(reset))
    }

    /// Close the session: stop timers, abandon unconfirmed sends, stop tasks.
    ///
    /// Idempotent. Takes effect synchronously; use
    /// [`closed`](Self::closed) to wait for the tasks to finish.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("[Session] closing");
        self.pipeline.abandon_all();
        self.connection.close();
        self.cancel.cancel();
    }

    /// Wait for every background task to finish.
    pub async fn closed(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("session tasks lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("[Session] task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for MessagingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
