//! Conversation state store.
//!
//! Single source of truth for per-conversation message lists, read markers,
//! history cursors and conversation summaries. Every other component reads
//! and writes through [`ConversationStore`]; nobody keeps a private copy.
//!
//! # Notifications
//!
//! Each mutating call emits exactly one [`StoreEvent`] on a broadcast
//! channel (or none when it changed nothing), so render layers can stay
//! purely reactive. The one exception is [`SetMessagesMode::ElementWise`],
//! which emits one append per message for consumers that only understand
//! appends.
//!
//! # Locking
//!
//! All state sits behind one `RwLock`. Writers are serialized, readers see
//! either the state before or after a mutation, never a half-applied one.
//! Events are sent while the write lock is held so their order matches the
//! order of mutations.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::model::{
    ConversationCursor, ConversationId, ConversationSummary, MessageId, MessageKey, MessageRecord,
    MessageStatus, OutboundMessage, SenderType, ServerMessage, TempId,
};

/// Change notification emitted by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A record was appended to the end of a conversation.
    MessageAppended {
        /// Conversation.
        conversation_id: ConversationId,
        /// The new record.
        message: MessageRecord,
    },
    /// A record changed in place (status, attempt, read marker).
    MessageUpdated {
        /// Conversation.
        conversation_id: ConversationId,
        /// The record after the change.
        message: MessageRecord,
    },
    /// A temp record was replaced by its server counterpart.
    MessageReconciled {
        /// Conversation.
        conversation_id: ConversationId,
        /// The temp id that was replaced.
        temp_id: TempId,
        /// The authoritative record now in its place.
        message: ServerMessage,
    },
    /// The whole list was replaced.
    MessagesLoaded {
        /// Conversation.
        conversation_id: ConversationId,
        /// The new list.
        messages: Vec<MessageRecord>,
    },
    /// Older records were inserted at the front.
    MessagesPrepended {
        /// Conversation.
        conversation_id: ConversationId,
        /// Inserted records, oldest first.
        messages: Vec<MessageRecord>,
    },
    /// One message was marked read.
    MessageRead {
        /// Conversation.
        conversation_id: ConversationId,
        /// The message after marking.
        message: ServerMessage,
    },
    /// A batch of messages was marked read.
    ConversationRead {
        /// Conversation.
        conversation_id: ConversationId,
        /// Ids marked by this call.
        message_ids: Vec<MessageId>,
        /// Read time applied.
        read_at: DateTime<Utc>,
    },
    /// A record was removed.
    MessageRemoved {
        /// Conversation.
        conversation_id: ConversationId,
        /// The removed record.
        message: MessageRecord,
    },
    /// Conversation metadata was created or changed.
    ConversationUpdated(ConversationSummary),
}

impl StoreEvent {
    /// Conversation this event belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageAppended {
                conversation_id, ..
            }
            | Self::MessageUpdated {
                conversation_id, ..
            }
            | Self::MessageReconciled {
                conversation_id, ..
            }
            | Self::MessagesLoaded {
                conversation_id, ..
            }
            | Self::MessagesPrepended {
                conversation_id, ..
            }
            | Self::MessageRead {
                conversation_id, ..
            }
            | Self::ConversationRead {
                conversation_id, ..
            }
            | Self::MessageRemoved {
                conversation_id, ..
            } => conversation_id,
            Self::ConversationUpdated(summary) => &summary.id,
        }
    }
}

/// How [`ConversationStore::set_messages`] reports the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetMessagesMode {
    /// One `MessagesLoaded` event.
    #[default]
    Bulk,
    /// One `MessageAppended` event per record.
    ElementWise,
}

/// Result of [`ConversationStore::replace_temp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The temp record was swapped in place.
    Replaced,
    /// The server record was already present; nothing changed.
    AlreadyPresent,
    /// No temp record existed; the server record was appended as new.
    Appended,
}

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<MessageRecord>,
    cursor: ConversationCursor,
    summary: Option<ConversationSummary>,
}

impl Conversation {
    fn position(&self, key: &MessageKey) -> Option<usize> {
        self.messages.iter().position(|m| m.matches(key))
    }

    fn contains_id(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| m.id() == Some(id))
    }
}

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<ConversationId, Conversation>,
    /// Hint for O(1) reconciliation. May drift; lookups verify it.
    temp_index: HashMap<TempId, (ConversationId, usize)>,
}

impl Inner {
    fn conversation_mut(&mut self, id: &ConversationId) -> &mut Conversation {
        self.conversations.entry(id.clone()).or_default()
    }

    /// Rebuild temp index entries for one conversation after positions moved.
    fn reindex(&mut self, id: &ConversationId) {
        self.temp_index.retain(|_, entry| entry.0 != *id);
        if let Some(conversation) = self.conversations.get(id) {
            for (index, record) in conversation.messages.iter().enumerate() {
                if let MessageRecord::Outbound(m) = record {
                    self.temp_index
                        .insert(m.temp_id.clone(), (id.clone(), index));
                }
            }
        }
    }

    /// Locate an outbound record: indexed position first, then linear search.
    fn locate_temp(&self, temp_id: &TempId) -> Option<(ConversationId, usize)> {
        if let Some((conv, index)) = self.temp_index.get(temp_id) {
            let hit = self
                .conversations
                .get(conv)
                .and_then(|c| c.messages.get(*index))
                .and_then(MessageRecord::as_outbound)
                .is_some_and(|m| &m.temp_id == temp_id);
            if hit {
                return Some((conv.clone(), *index));
            }
            log::debug!("[Store] temp index drifted for {temp_id}, searching");
        }
        self.conversations.iter().find_map(|(conv, c)| {
            c.messages
                .iter()
                .position(|m| m.as_outbound().is_some_and(|o| &o.temp_id == temp_id))
                .map(|index| (conv.clone(), index))
        })
    }
}

/// Shared conversation state.
#[derive(Debug)]
pub struct ConversationStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
    local_sender: SenderType,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(SenderType::Agent)
    }
}

impl ConversationStore {
    /// Create an empty store. `local_sender` is the sender type of messages
    /// authored on this client; read markers only apply to the others.
    pub fn new(local_sender: SenderType) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            local_sender,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Append a record to the end of its conversation.
    ///
    /// Returns false (and emits nothing) if a record with the same server id
    /// or temp id is already present.
    pub fn append_message(&self, record: MessageRecord) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let conv_id = record.conversation_id().clone();
        let conversation = inner.conversation_mut(&conv_id);

        let duplicate = match &record {
            MessageRecord::Server(m) => conversation.contains_id(&m.id),
            MessageRecord::Outbound(m) => conversation
                .position(&MessageKey::Temp(m.temp_id.clone()))
                .is_some(),
        };
        if duplicate {
            return false;
        }

        conversation.messages.push(record.clone());
        let index = conversation.messages.len() - 1;
        let computed = ConversationCursor::from_messages(&conversation.messages);
        conversation.cursor.merge(&computed);
        if let MessageRecord::Outbound(m) = &record {
            inner
                .temp_index
                .insert(m.temp_id.clone(), (conv_id.clone(), index));
        }

        self.emit(StoreEvent::MessageAppended {
            conversation_id: conv_id,
            message: record,
        });
        true
    }

    /// Modify the record matching `key` (by server id or temp id).
    ///
    /// Emits `MessageUpdated` and returns the new record if `update` changed
    /// anything.
    pub fn update_message(
        &self,
        conversation_id: &ConversationId,
        key: &MessageKey,
        update: impl FnOnce(&mut MessageRecord),
    ) -> Option<MessageRecord> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let conversation = inner.conversations.get_mut(conversation_id)?;
        let index = conversation.position(key)?;
        let record = &mut conversation.messages[index];
        let before = record.clone();
        update(record);
        if *record == before {
            return None;
        }
        let after = record.clone();
        self.emit(StoreEvent::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message: after.clone(),
        });
        Some(after)
    }

    /// Modify the outbound record `temp_id`, if it has not been reconciled yet.
    pub fn update_outbound(
        &self,
        temp_id: &TempId,
        update: impl FnOnce(&mut OutboundMessage),
    ) -> Option<OutboundMessage> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let (conv_id, index) = inner.locate_temp(temp_id)?;
        let conversation = inner.conversations.get_mut(&conv_id)?;
        let MessageRecord::Outbound(message) = &mut conversation.messages[index] else {
            return None;
        };
        let before = message.clone();
        update(message);
        if *message == before {
            return None;
        }
        let after = message.clone();
        self.emit(StoreEvent::MessageUpdated {
            conversation_id: conv_id,
            message: MessageRecord::Outbound(after.clone()),
        });
        Some(after)
    }

    /// Swap the temp record `temp_id` for its server counterpart, keeping its
    /// position in the list.
    ///
    /// Idempotent: once the server id is present further calls are no-ops.
    /// When no temp record exists the server record is appended instead.
    pub fn replace_temp(&self, temp_id: &TempId, server: ServerMessage) -> ReplaceOutcome {
        let mut server = server;
        if server.temp_id.is_none() {
            server.temp_id = Some(temp_id.clone());
        }
        let mut inner = self.inner.write().expect("store lock poisoned");
        let conv_id = server.conversation_id.clone();
        let located = inner.locate_temp(temp_id);
        let already_present = inner
            .conversations
            .get(&conv_id)
            .is_some_and(|c| c.contains_id(&server.id));

        match (located, already_present) {
            (None, true) => ReplaceOutcome::AlreadyPresent,
            (Some((temp_conv, index)), true) => {
                // The server record arrived separately; drop the leftover temp.
                if let Some(conversation) = inner.conversations.get_mut(&temp_conv) {
                    conversation.messages.remove(index);
                }
                inner.temp_index.remove(temp_id);
                inner.reindex(&temp_conv);
                self.emit(StoreEvent::MessageReconciled {
                    conversation_id: temp_conv,
                    temp_id: temp_id.clone(),
                    message: server,
                });
                ReplaceOutcome::Replaced
            }
            (Some((temp_conv, index)), false) => {
                let conversation = inner.conversation_mut(&temp_conv);
                conversation.messages[index] = MessageRecord::Server(server.clone());
                let computed = ConversationCursor::from_messages(&conversation.messages);
                conversation.cursor.merge(&computed);
                inner.temp_index.remove(temp_id);
                self.emit(StoreEvent::MessageReconciled {
                    conversation_id: temp_conv,
                    temp_id: temp_id.clone(),
                    message: server,
                });
                ReplaceOutcome::Replaced
            }
            (None, false) => {
                let conversation = inner.conversation_mut(&conv_id);
                conversation
                    .messages
                    .push(MessageRecord::Server(server.clone()));
                let computed = ConversationCursor::from_messages(&conversation.messages);
                conversation.cursor.merge(&computed);
                self.emit(StoreEvent::MessageAppended {
                    conversation_id: conv_id,
                    message: MessageRecord::Server(server),
                });
                ReplaceOutcome::Appended
            }
        }
    }

    /// Replace a conversation's whole list (initial load, conversation switch).
    ///
    /// The cursor is reset to what the new list implies.
    pub fn set_messages(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<MessageRecord>,
        mode: SetMessagesMode,
    ) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let conversation = inner.conversation_mut(conversation_id);
        conversation.cursor = ConversationCursor::from_messages(&messages);
        conversation.messages.clone_from(&messages);
        inner.reindex(conversation_id);

        match mode {
            SetMessagesMode::Bulk => self.emit(StoreEvent::MessagesLoaded {
                conversation_id: conversation_id.clone(),
                messages,
            }),
            SetMessagesMode::ElementWise => {
                for message in messages {
                    self.emit(StoreEvent::MessageAppended {
                        conversation_id: conversation_id.clone(),
                        message,
                    });
                }
            }
        }
    }

    /// Insert older server messages at the front, skipping ids already present.
    ///
    /// Returns the number inserted. The cursor only moves further back.
    pub fn prepend_messages(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<ServerMessage>,
    ) -> usize {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let conversation = inner.conversation_mut(conversation_id);

        let mut fresh: Vec<MessageRecord> = Vec::with_capacity(messages.len());
        for message in messages {
            let seen = conversation.contains_id(&message.id)
                || fresh.iter().any(|r| r.id() == Some(&message.id));
            if !seen {
                fresh.push(MessageRecord::Server(message));
            }
        }
        if fresh.is_empty() {
            return 0;
        }

        let inserted = fresh.len();
        conversation.messages.splice(0..0, fresh.iter().cloned());
        let computed = ConversationCursor::from_messages(&conversation.messages);
        conversation.cursor.merge(&computed);
        inner.reindex(conversation_id);

        self.emit(StoreEvent::MessagesPrepended {
            conversation_id: conversation_id.clone(),
            messages: fresh,
        });
        inserted
    }

    /// Mark one server message read. Already-read messages are untouched.
    pub fn mark_message_read(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        read_at: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(conversation) = inner.conversations.get_mut(conversation_id) else {
            return false;
        };
        let target = conversation.messages.iter_mut().find_map(|r| match r {
            MessageRecord::Server(m) if &m.id == message_id => Some(m),
            _ => None,
        });
        let Some(message) = target else {
            return false;
        };
        if message.read_at.is_some() {
            return false;
        }
        message.read_at = Some(read_at);
        let message = message.clone();
        self.emit(StoreEvent::MessageRead {
            conversation_id: conversation_id.clone(),
            message,
        });
        true
    }

    /// Mark every unread inbound message in the conversation read.
    ///
    /// Emits one `ConversationRead` batch; a second call finds nothing to
    /// change and emits nothing. Returns the ids marked.
    pub fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        read_at: DateTime<Utc>,
    ) -> Vec<MessageId> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(conversation) = inner.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        let mut marked = Vec::new();
        for record in &mut conversation.messages {
            if let MessageRecord::Server(m) = record {
                if m.sender_type != self.local_sender && m.read_at.is_none() {
                    m.read_at = Some(read_at);
                    marked.push(m.id.clone());
                }
            }
        }
        if marked.is_empty() {
            return marked;
        }
        if let Some(summary) = conversation.summary.as_mut() {
            summary.unread_count = 0;
        }
        self.emit(StoreEvent::ConversationRead {
            conversation_id: conversation_id.clone(),
            message_ids: marked.clone(),
            read_at,
        });
        marked
    }

    /// Remove the record matching `key`.
    pub fn remove_message(
        &self,
        conversation_id: &ConversationId,
        key: &MessageKey,
    ) -> Option<MessageRecord> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let conversation = inner.conversations.get_mut(conversation_id)?;
        let index = conversation.position(key)?;
        let removed = conversation.messages.remove(index);
        inner.reindex(conversation_id);
        self.emit(StoreEvent::MessageRemoved {
            conversation_id: conversation_id.clone(),
            message: removed.clone(),
        });
        Some(removed)
    }

    /// Create or replace conversation metadata. No event if unchanged.
    pub fn upsert_conversation(&self, summary: ConversationSummary) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let conversation = inner.conversation_mut(&summary.id);
        if conversation.summary.as_ref() == Some(&summary) {
            return false;
        }
        conversation.summary = Some(summary.clone());
        self.emit(StoreEvent::ConversationUpdated(summary));
        true
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Snapshot of a conversation's list, oldest first.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// The record matching `key` in a conversation.
    pub fn find(&self, conversation_id: &ConversationId, key: &MessageKey) -> Option<MessageRecord> {
        let inner = self.inner.read().expect("store lock poisoned");
        let conversation = inner.conversations.get(conversation_id)?;
        conversation
            .position(key)
            .map(|i| conversation.messages[i].clone())
    }

    /// The outbound record `temp_id`, wherever it lives, if not yet reconciled.
    pub fn find_outbound(&self, temp_id: &TempId) -> Option<OutboundMessage> {
        let inner = self.inner.read().expect("store lock poisoned");
        let (conv, index) = inner.locate_temp(temp_id)?;
        inner
            .conversations
            .get(&conv)
            .and_then(|c| c.messages.get(index))
            .and_then(MessageRecord::as_outbound)
            .cloned()
    }

    /// Outbound records in `status`, across all conversations, oldest first.
    pub fn outbound_with_status(&self, status: MessageStatus) -> Vec<OutboundMessage> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut found: Vec<OutboundMessage> = inner
            .conversations
            .values()
            .flat_map(|c| c.messages.iter())
            .filter_map(MessageRecord::as_outbound)
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.created_at);
        found
    }

    /// Inbound server messages without a read marker.
    pub fn unread_count(&self, conversation_id: &ConversationId) -> usize {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.conversations.get(conversation_id).map_or(0, |c| {
            c.messages
                .iter()
                .filter_map(MessageRecord::as_server)
                .filter(|m| m.sender_type != self.local_sender && m.read_at.is_none())
                .count()
        })
    }

    /// History cursor for a conversation.
    pub fn cursor(&self, conversation_id: &ConversationId) -> ConversationCursor {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .conversations
            .get(conversation_id)
            .map(|c| c.cursor.clone())
            .unwrap_or_default()
    }

    /// Known conversation summaries, most recently updated first.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .filter_map(|c| c.summary.clone())
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Sender type treated as "us" for read markers.
    pub fn local_sender(&self) -> SenderType {
        self.local_sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conv() -> ConversationId {
        ConversationId::from("c1")
    }

    fn server(id: &str, minute: u32, sender: SenderType) -> ServerMessage {
        ServerMessage {
            id: MessageId::from(id),
            temp_id: None,
            conversation_id: conv(),
            sender_type: sender,
            content: format!("body {id}"),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 10, minute, 0).unwrap(),
            read_at: None,
            sequence: None,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ========== Append / Update Tests ==========

    #[test]
    fn test_append_emits_one_event_and_rejects_duplicates() {
        let store = ConversationStore::default();
        let mut rx = store.subscribe();

        assert!(store.append_message(MessageRecord::Server(server("m1", 0, SenderType::Customer))));
        assert!(!store.append_message(MessageRecord::Server(server("m1", 0, SenderType::Customer))));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StoreEvent::MessageAppended { .. }));
        assert_eq!(store.messages(&conv()).len(), 1);
    }

    #[test]
    fn test_update_outbound_noop_emits_nothing() {
        let store = ConversationStore::default();
        let outbound = OutboundMessage::new(conv(), "hi");
        let temp = outbound.temp_id.clone();
        store.append_message(MessageRecord::Outbound(outbound));
        let mut rx = store.subscribe();

        let updated = store.update_outbound(&temp, |m| m.status = MessageStatus::Dispatched);
        assert_eq!(updated.unwrap().status, MessageStatus::Dispatched);
        assert!(store
            .update_outbound(&temp, |m| m.status = MessageStatus::Dispatched)
            .is_none());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_update_message_by_temp_key() {
        let store = ConversationStore::default();
        let outbound = OutboundMessage::new(conv(), "hi");
        let key = MessageKey::Temp(outbound.temp_id.clone());
        store.append_message(MessageRecord::Outbound(outbound));

        let updated = store.update_message(&conv(), &key, |r| {
            if let MessageRecord::Outbound(m) = r {
                m.attempt = 3;
            }
        });
        assert_eq!(updated.unwrap().as_outbound().unwrap().attempt, 3);
    }

    // ========== Reconciliation Tests ==========

    #[test]
    fn test_replace_temp_keeps_position_and_is_idempotent() {
        let store = ConversationStore::default();
        let outbound = OutboundMessage::new(conv(), "hello");
        let temp = outbound.temp_id.clone();
        store.append_message(MessageRecord::Outbound(outbound));
        store.append_message(MessageRecord::Server(server("m9", 5, SenderType::Customer)));
        let mut rx = store.subscribe();

        let ack = server("m2", 1, SenderType::Agent);
        assert_eq!(store.replace_temp(&temp, ack.clone()), ReplaceOutcome::Replaced);
        assert_eq!(
            store.replace_temp(&temp, ack.clone()),
            ReplaceOutcome::AlreadyPresent
        );

        let messages = store.messages(&conv());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id(), Some(&MessageId::from("m2")));
        assert_eq!(messages[0].temp_id(), Some(&temp));
        assert!(store.find_outbound(&temp).is_none());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StoreEvent::MessageReconciled { .. }));
    }

    #[test]
    fn test_replace_temp_after_prepend_shifts_positions() {
        let store = ConversationStore::default();
        let outbound = OutboundMessage::new(conv(), "hello");
        let temp = outbound.temp_id.clone();
        store.append_message(MessageRecord::Outbound(outbound));
        store.prepend_messages(
            &conv(),
            vec![
                server("m0", 0, SenderType::Customer),
                server("m1", 1, SenderType::Customer),
            ],
        );

        assert_eq!(
            store.replace_temp(&temp, server("m5", 9, SenderType::Agent)),
            ReplaceOutcome::Replaced
        );
        let ids: Vec<_> = store
            .messages(&conv())
            .iter()
            .map(|m| m.id().cloned())
            .collect();
        assert_eq!(
            ids,
            vec![
                Some(MessageId::from("m0")),
                Some(MessageId::from("m1")),
                Some(MessageId::from("m5"))
            ]
        );
    }

    #[test]
    fn test_replace_unknown_temp_appends() {
        let store = ConversationStore::default();
        let outcome = store.replace_temp(&TempId::from("tmp_x"), server("m1", 0, SenderType::Agent));
        assert_eq!(outcome, ReplaceOutcome::Appended);
        assert_eq!(store.messages(&conv()).len(), 1);
    }

    #[test]
    fn test_replace_drops_temp_when_server_record_already_appended() {
        let store = ConversationStore::default();
        let outbound = OutboundMessage::new(conv(), "hello");
        let temp = outbound.temp_id.clone();
        store.append_message(MessageRecord::Outbound(outbound));
        store.append_message(MessageRecord::Server(server("m1", 0, SenderType::Agent)));

        assert_eq!(
            store.replace_temp(&temp, server("m1", 0, SenderType::Agent)),
            ReplaceOutcome::Replaced
        );
        assert_eq!(store.messages(&conv()).len(), 1);
    }

    // ========== Bulk / Cursor Tests ==========

    #[test]
    fn test_set_messages_bulk_and_elementwise() {
        let store = ConversationStore::default();
        let mut rx = store.subscribe();
        let list = vec![
            MessageRecord::Server(server("m1", 1, SenderType::Customer)),
            MessageRecord::Server(server("m2", 2, SenderType::Customer)),
        ];

        store.set_messages(&conv(), list.clone(), SetMessagesMode::Bulk);
        assert_eq!(drain(&mut rx).len(), 1);

        store.set_messages(&conv(), list, SetMessagesMode::ElementWise);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, StoreEvent::MessageAppended { .. })));
    }

    #[test]
    fn test_cursor_never_regresses_on_prepend() {
        let store = ConversationStore::default();
        let mut m3 = server("m3", 3, SenderType::Customer);
        m3.sequence = Some(30);
        store.set_messages(&conv(), vec![MessageRecord::Server(m3)], SetMessagesMode::Bulk);
        assert_eq!(store.cursor(&conv()).oldest.unwrap().cursor, "m3");

        let mut m1 = server("m1", 1, SenderType::Customer);
        m1.sequence = Some(10);
        assert_eq!(store.prepend_messages(&conv(), vec![m1]), 1);
        let cursor = store.cursor(&conv());
        assert_eq!(cursor.oldest.unwrap().cursor, "m1");
        assert_eq!(cursor.newest_sequence_id, Some(30));

        // Re-prepending a known id changes nothing.
        assert_eq!(
            store.prepend_messages(&conv(), vec![server("m1", 1, SenderType::Customer)]),
            0
        );
    }

    #[test]
    fn test_set_messages_resets_cursor_baseline() {
        let store = ConversationStore::default();
        store.set_messages(
            &conv(),
            vec![MessageRecord::Server(server("m1", 1, SenderType::Customer))],
            SetMessagesMode::Bulk,
        );
        store.set_messages(
            &conv(),
            vec![MessageRecord::Server(server("m7", 7, SenderType::Customer))],
            SetMessagesMode::Bulk,
        );
        assert_eq!(store.cursor(&conv()).oldest.unwrap().cursor, "m7");
    }

    // ========== Read Marker Tests ==========

    #[test]
    fn test_mark_conversation_read_is_idempotent() {
        let store = ConversationStore::new(SenderType::Agent);
        store.append_message(MessageRecord::Server(server("m1", 1, SenderType::Customer)));
        store.append_message(MessageRecord::Server(server("m2", 2, SenderType::Agent)));
        store.append_message(MessageRecord::Server(server("m3", 3, SenderType::Customer)));
        assert_eq!(store.unread_count(&conv()), 2);
        let mut rx = store.subscribe();

        let now = Utc::now();
        let marked = store.mark_conversation_read(&conv(), now);
        assert_eq!(marked, vec![MessageId::from("m1"), MessageId::from("m3")]);
        assert!(store.mark_conversation_read(&conv(), now).is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(store.unread_count(&conv()), 0);
    }

    #[test]
    fn test_mark_message_read_untouched_when_already_read() {
        let store = ConversationStore::default();
        store.append_message(MessageRecord::Server(server("m1", 1, SenderType::Customer)));
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        assert!(store.mark_message_read(&conv(), &MessageId::from("m1"), first));
        assert!(!store.mark_message_read(&conv(), &MessageId::from("m1"), Utc::now()));
        let record = store
            .find(&conv(), &MessageKey::Id(MessageId::from("m1")))
            .unwrap();
        assert_eq!(record.as_server().unwrap().read_at, Some(first));
    }

    // ========== Misc Tests ==========

    #[test]
    fn test_remove_and_summaries() {
        let store = ConversationStore::default();
        store.append_message(MessageRecord::Server(server("m1", 1, SenderType::Customer)));
        assert!(store
            .remove_message(&conv(), &MessageKey::Id(MessageId::from("m1")))
            .is_some());
        assert!(store.messages(&conv()).is_empty());

        let summary = ConversationSummary {
            id: conv(),
            title: Some("Order #12".into()),
            status: Some("open".into()),
            last_message: None,
            unread_count: 1,
            updated_at: None,
        };
        assert!(store.upsert_conversation(summary.clone()));
        assert!(!store.upsert_conversation(summary));
        assert_eq!(store.conversations().len(), 1);
    }

    #[test]
    fn test_outbound_with_status_spans_conversations() {
        let store = ConversationStore::default();
        let mut a = OutboundMessage::new(conv(), "a");
        a.status = MessageStatus::Failed;
        let mut b = OutboundMessage::new(ConversationId::from("c2"), "b");
        b.status = MessageStatus::Failed;
        store.append_message(MessageRecord::Outbound(a));
        store.append_message(MessageRecord::Outbound(b));
        store.append_message(MessageRecord::Outbound(OutboundMessage::new(conv(), "c")));

        assert_eq!(store.outbound_with_status(MessageStatus::Failed).len(), 2);
        assert_eq!(store.outbound_with_status(MessageStatus::Pending).len(), 1);
    }
}
