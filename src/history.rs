//! Backward pagination of conversation history.
//!
//! A [`HistoryLoader`] walks one conversation from newest to oldest. Each
//! [`load_older`](HistoryLoader::load_older) fetches the page before the
//! current cursor, prepends it to the store and recomputes the cursor from
//! the store's first message. An empty or short page marks the loader
//! exhausted; from then on calls are no-ops until [`reset`](HistoryLoader::reset).

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::model::{ConversationId, ServerMessage};
use crate::store::ConversationStore;

/// One page of history, oldest message first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    /// Messages in the page.
    pub messages: Vec<ServerMessage>,
    /// Server-provided cursor for the next older page, if any.
    pub cursor: Option<String>,
}

/// Paged history fetch (the REST endpoint in production).
#[async_trait]
pub trait HistorySource: Send + Sync + std::fmt::Debug {
    /// Fetch up to `page_size` messages older than `before` (newest page
    /// when `None`).
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<&str>,
        page_size: usize,
    ) -> Result<HistoryPage>;
}

/// Observable loader state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoaderState {
    /// A fetch is in flight.
    pub loading: bool,
    /// No older messages remain.
    pub exhausted: bool,
    /// Cursor the next fetch will use.
    pub cursor: Option<String>,
}

/// Result of [`HistoryLoader::load_older`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched.
    Loaded {
        /// Messages returned by the server.
        fetched: usize,
        /// Messages actually added (duplicates skipped).
        inserted: usize,
    },
    /// Another load is in flight; nothing was done.
    Busy,
    /// History is exhausted; nothing was done.
    Exhausted,
}

/// Pagination state machine for one conversation.
#[derive(Debug)]
pub struct HistoryLoader {
    conversation_id: ConversationId,
    source: Arc<dyn HistorySource>,
    store: Arc<ConversationStore>,
    page_size: usize,
    state: Mutex<LoaderState>,
}

impl HistoryLoader {
    /// Create a loader starting from the store's current oldest message.
    pub fn new(
        conversation_id: ConversationId,
        source: Arc<dyn HistorySource>,
        store: Arc<ConversationStore>,
        page_size: usize,
    ) -> Self {
        let cursor = store.cursor(&conversation_id).oldest.map(|p| p.cursor);
        Self {
            conversation_id,
            source,
            store,
            page_size: page_size.max(1),
            state: Mutex::new(LoaderState {
                cursor,
                ..LoaderState::default()
            }),
        }
    }

    /// Conversation this loader pages through.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Snapshot of the loader state.
    pub fn state(&self) -> LoaderState {
        self.state.lock().expect("history state lock poisoned").clone()
    }

    /// Fetch the next older page.
    ///
    /// # Errors
    ///
    /// Returns the source's error; `exhausted` and the cursor are unchanged
    /// so the call can simply be retried.
    pub async fn load_older(&self) -> Result<LoadOutcome> {
        let before = {
            let mut state = self.state.lock().expect("history state lock poisoned");
            if state.exhausted {
                return Ok(LoadOutcome::Exhausted);
            }
            if state.loading {
                return Ok(LoadOutcome::Busy);
            }
            state.loading = true;
            state.cursor.clone()
        };

        // Clears `loading` if this future is dropped mid-fetch.
        let in_flight = scopeguard::guard((), |()| {
            self.state
                .lock()
                .expect("history state lock poisoned")
                .loading = false;
        });
        let result = self
            .source
            .fetch_page(&self.conversation_id, before.as_deref(), self.page_size)
            .await;
        scopeguard::ScopeGuard::into_inner(in_flight);

        let mut state = self.state.lock().expect("history state lock poisoned");
        state.loading = false;
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                log::warn!(
                    "[History] loading {} before {:?} failed: {e}",
                    self.conversation_id,
                    before
                );
                return Err(e);
            }
        };

        let fetched = page.messages.len();
        let inserted = self
            .store
            .prepend_messages(&self.conversation_id, page.messages);
        if fetched < self.page_size {
            state.exhausted = true;
        }
        // The store's first message is the authority; the server cursor is a
        // fallback for pages whose messages were all duplicates.
        state.cursor = self
            .store
            .cursor(&self.conversation_id)
            .oldest
            .map(|p| p.cursor)
            .or(page.cursor)
            .or(state.cursor.take());

        log::debug!(
            "[History] {}: fetched {fetched}, inserted {inserted}, exhausted={}",
            self.conversation_id,
            state.exhausted
        );
        Ok(LoadOutcome::Loaded { fetched, inserted })
    }

    /// Start over from the store's current oldest message.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("history state lock poisoned");
        *state = LoaderState {
            cursor: self
                .store
                .cursor(&self.conversation_id)
                .oldest
                .map(|p| p.cursor),
            ..LoaderState::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::model::{MessageId, SenderType};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tokio::sync::Notify;

    /// Serves a fixed history of `total` messages, newest last.
    #[derive(Debug)]
    struct FixedHistory {
        total: usize,
        requests: Mutex<Vec<Option<String>>>,
        fail_next: Mutex<bool>,
        gate: Option<Arc<Notify>>,
    }

    impl FixedHistory {
        fn new(total: usize) -> Self {
            Self {
                total,
                requests: Mutex::new(Vec::new()),
                fail_next: Mutex::new(false),
                gate: None,
            }
        }

        fn message(index: usize) -> ServerMessage {
            let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            ServerMessage {
                id: MessageId::from(format!("m{index:03}")),
                temp_id: None,
                conversation_id: ConversationId::from("c1"),
                sender_type: SenderType::Customer,
                content: format!("message {index}"),
                created_at: base + ChronoDuration::minutes(index as i64),
                read_at: None,
                sequence: Some(index as i64),
            }
        }
    }

    #[async_trait]
    impl HistorySource for FixedHistory {
        async fn fetch_page(
            &self,
            _conversation_id: &ConversationId,
            before: Option<&str>,
            page_size: usize,
        ) -> Result<HistoryPage> {
            self.requests
                .lock()
                .unwrap()
                .push(before.map(str::to_string));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(ClientError::Http {
                    status: 502,
                    message: "bad gateway".into(),
                });
            }
            let end = match before {
                Some(cursor) => cursor[1..].parse::<usize>().unwrap(),
                None => self.total,
            };
            let start = end.saturating_sub(page_size);
            Ok(HistoryPage {
                messages: (start..end).map(Self::message).collect(),
                cursor: None,
            })
        }
    }

    fn loader(source: Arc<FixedHistory>, page_size: usize) -> (HistoryLoader, Arc<ConversationStore>) {
        let store = Arc::new(ConversationStore::default());
        let loader = HistoryLoader::new(
            ConversationId::from("c1"),
            source,
            Arc::clone(&store),
            page_size,
        );
        (loader, store)
    }

    #[tokio::test]
    async fn test_short_page_exhausts() {
        let (loader, store) = loader(Arc::new(FixedHistory::new(5)), 30);
        assert_eq!(
            loader.load_older().await.unwrap(),
            LoadOutcome::Loaded {
                fetched: 5,
                inserted: 5
            }
        );
        assert!(loader.state().exhausted);
        assert_eq!(loader.load_older().await.unwrap(), LoadOutcome::Exhausted);
        assert_eq!(store.messages(&ConversationId::from("c1")).len(), 5);
    }

    #[tokio::test]
    async fn test_pages_walk_backwards_with_cursor() {
        let source = Arc::new(FixedHistory::new(25));
        let (loader, store) = loader(Arc::clone(&source), 10);

        loader.load_older().await.unwrap();
        assert_eq!(loader.state().cursor.as_deref(), Some("m015"));
        loader.load_older().await.unwrap();
        assert_eq!(loader.state().cursor.as_deref(), Some("m005"));
        assert!(!loader.state().exhausted);
        loader.load_older().await.unwrap();
        assert!(loader.state().exhausted);

        let ids: Vec<String> = store
            .messages(&ConversationId::from("c1"))
            .iter()
            .filter_map(|m| m.id().map(|id| id.0.clone()))
            .collect();
        assert_eq!(ids.len(), 25);
        assert_eq!(ids.first().map(String::as_str), Some("m000"));
        assert_eq!(ids.last().map(String::as_str), Some("m024"));
        assert_eq!(
            *source.requests.lock().unwrap(),
            vec![None, Some("m015".to_string()), Some("m005".to_string())]
        );
    }

    #[tokio::test]
    async fn test_error_leaves_state_retryable() {
        let source = Arc::new(FixedHistory::new(50));
        *source.fail_next.lock().unwrap() = true;
        let (loader, _store) = loader(Arc::clone(&source), 10);

        assert!(matches!(
            loader.load_older().await,
            Err(ClientError::Http { status: 502, .. })
        ));
        let state = loader.state();
        assert!(!state.exhausted);
        assert!(!state.loading);
        assert_eq!(state.cursor, None);

        assert!(matches!(
            loader.load_older().await.unwrap(),
            LoadOutcome::Loaded { fetched: 10, .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_load_is_busy() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(FixedHistory {
            gate: Some(Arc::clone(&gate)),
            ..FixedHistory::new(50)
        });
        let (loader, _store) = loader(source, 10);
        let loader = Arc::new(loader);

        let first = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.load_older().await }
        });
        while !loader.state().loading {
            tokio::task::yield_now().await;
        }
        assert_eq!(loader.load_older().await.unwrap(), LoadOutcome::Busy);

        gate.notify_one();
        assert!(matches!(
            first.await.unwrap().unwrap(),
            LoadOutcome::Loaded { fetched: 10, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_load_releases_loading_flag() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(FixedHistory {
            gate: Some(Arc::clone(&gate)),
            ..FixedHistory::new(50)
        });
        let (loader, _store) = loader(Arc::clone(&source), 10);

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_secs(5), loader.load_older()).await;
        assert!(timed_out.is_err());
        assert!(!loader.state().loading);

        let retry = tokio::spawn({
            let loader = Arc::new(loader);
            async move { loader.load_older().await }
        });
        while source.requests.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        assert!(matches!(
            retry.await.unwrap().unwrap(),
            LoadOutcome::Loaded { fetched: 10, .. }
        ));
    }

    #[tokio::test]
    async fn test_reset_reopens_exhausted_loader() {
        let (loader, _store) = loader(Arc::new(FixedHistory::new(3)), 10);
        loader.load_older().await.unwrap();
        assert!(loader.state().exhausted);

        loader.reset();
        let state = loader.state();
        assert!(!state.exhausted);
        assert_eq!(state.cursor.as_deref(), Some("m000"));
    }
}
