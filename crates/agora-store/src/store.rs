//! The [`Store`] handle: in-memory source of truth plus write-behind flushing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agora_shared::constants::DEFAULT_FLUSH_INTERVAL_MS;
use agora_shared::{FileId, MessageId, UserId};
use chrono::Utc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::backend::SnapshotBackend;
use crate::document::{self, LoadReport};
use crate::error::{Result, StoreError};
use crate::models::{FileRecord, Message, User};
use crate::write_behind::{self, WriteBehind};

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Coalescing window between the first change and the flush covering it.
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

/// Everything the store owns. Ordered maps keep id order for free.
#[derive(Debug)]
pub(crate) struct StoreState {
    pub(crate) users: BTreeMap<UserId, User>,
    pub(crate) messages: BTreeMap<MessageId, Message>,
    pub(crate) files: BTreeMap<FileId, FileRecord>,
    pub(crate) next_user_id: u64,
    pub(crate) next_message_id: u64,
    pub(crate) next_file_id: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            messages: BTreeMap::new(),
            files: BTreeMap::new(),
            next_user_id: 1,
            next_message_id: 1,
            next_file_id: 1,
        }
    }
}

impl StoreState {
    pub(crate) fn allocate_user_id(&mut self) -> UserId {
        let id = UserId(self.next_user_id);
        self.next_user_id += 1;
        id
    }

    pub(crate) fn allocate_message_id(&mut self) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        id
    }

    pub(crate) fn allocate_file_id(&mut self) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id += 1;
        id
    }
}

struct Shared {
    state: RwLock<StoreState>,
    persist: WriteBehind,
}

impl Shared {
    async fn flush(&self) -> Result<bool> {
        self.persist
            .flush(|| async {
                let state = self.state.read().await;
                document::encode(&state)
            })
            .await
    }
}

/// Cheaply clonable handle to the authoritative state.
///
/// Reads see every completed mutation immediately; durability trails by at
/// most one flush interval.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    /// Load the document from `backend` (or start empty) and spawn the
    /// write-behind task. Must be called inside a tokio runtime.
    pub async fn open(backend: Arc<dyn SnapshotBackend>, config: StoreConfig) -> Result<Self> {
        let loader = Arc::clone(&backend);
        let raw = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| StoreError::Backend(format!("load task failed: {e}")))??;

        let (state, report) = match raw.as_deref().map(str::trim) {
            None | Some("") => (StoreState::default(), LoadReport::default()),
            Some(raw) => document::decode(raw, Utc::now())?,
        };

        if report.dropped_anything() {
            warn!(?report, "dropped malformed records while loading store");
        }
        info!(
            users = report.users,
            messages = report.messages,
            files = report.files,
            "store loaded"
        );

        let (persist, rx) = WriteBehind::new(backend);
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            persist,
        });

        let weak = Arc::downgrade(&shared);
        tokio::spawn(write_behind::run(rx, config.flush_interval, move || {
            let shared = weak.upgrade()?;
            // Failures are logged inside flush; the task retries them.
            Some(async move { shared.flush().await.is_err() })
        }));

        Ok(Self { shared })
    }

    /// Flush immediately if anything is pending. Returns whether a write
    /// happened. Used on shutdown.
    pub async fn flush_now(&self) -> Result<bool> {
        self.shared.flush().await
    }

    /// Whether there are changes not yet written to the backend.
    pub fn has_pending_writes(&self) -> bool {
        self.shared.persist.is_dirty()
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.shared.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.shared.state.write().await
    }

    /// Schedule a flush covering the mutation just made. Callers invoke this
    /// while still holding the write guard.
    pub(crate) fn changed(&self) {
        self.shared.persist.schedule();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::memory_store;
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_changes_is_one_flush() {
        let (store, backend) = memory_store().await;
        let author = store.create_user("a@example.com", "ada", "x").await.unwrap();

        for i in 0..10 {
            store
                .append_message(Some(author.id), &format!("msg {i}"), Utc::now(), None)
                .await;
        }
        assert!(store.has_pending_writes());
        assert_eq!(backend.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(backend.save_count(), 1);
        assert!(!store.has_pending_writes());
        let doc = backend.document().unwrap();
        assert!(doc.contains("msg 9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_is_retried_on_next_change() {
        let (store, backend) = memory_store().await;
        backend.set_failing(true);

        store.create_user("a@example.com", "ada", "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.save_count(), 0);
        assert!(store.has_pending_writes());

        // In-memory state is unaffected by the failed write.
        assert!(store.user_by_email("a@example.com").await.is_some());

        backend.set_failing(false);
        store.create_user("b@example.com", "bob", "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(backend.save_count(), 1);
        let doc = backend.document().unwrap();
        assert!(doc.contains("a@example.com"));
        assert!(doc.contains("b@example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_recovers_without_further_changes() {
        let (store, backend) = memory_store().await;
        backend.set_failing(true);

        store.create_user("a@example.com", "ada", "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.save_count(), 0);

        // No mutation after the backend comes back.
        backend.set_failing(false);
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(backend.save_count(), 1);
        assert!(!store.has_pending_writes());
        assert!(backend.document().unwrap().contains("a@example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_capped() {
        let (store, backend) = memory_store().await;
        backend.set_failing(true);
        store.create_user("a@example.com", "ada", "x").await.unwrap();

        // Long enough for the delay to reach its ceiling.
        tokio::time::sleep(Duration::from_secs(600)).await;
        backend.set_failing(false);
        tokio::time::sleep(write_behind::MAX_RETRY_DELAY + Duration::from_millis(10)).await;

        assert_eq!(backend.save_count(), 1);
        assert!(!store.has_pending_writes());
    }

    #[tokio::test]
    async fn test_flush_now_is_noop_when_clean() {
        let (store, backend) = memory_store().await;
        assert!(!store.flush_now().await.unwrap());

        store.create_user("a@example.com", "ada", "x").await.unwrap();
        assert!(store.flush_now().await.unwrap());
        assert!(!store.flush_now().await.unwrap());
        assert_eq!(backend.save_count(), 1);
    }

    #[tokio::test]
    async fn test_reopen_restores_state_and_counters() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = Store::open(backend.clone(), StoreConfig::default())
                .await
                .unwrap();
            let user = store.create_user("a@example.com", "ada", "x").await.unwrap();
            store
                .append_message(Some(user.id), "first", Utc::now(), None)
                .await;
            store.flush_now().await.unwrap();
        }

        let store = Store::open(backend.clone(), StoreConfig::default())
            .await
            .unwrap();
        let next = store
            .append_message(Some(UserId(1)), "second", Utc::now(), None)
            .await;
        assert_eq!(next.id, MessageId(2));
        let user = store.create_user("b@example.com", "bob", "x").await.unwrap();
        assert_eq!(user.id, UserId(2));
    }

    #[tokio::test]
    async fn test_corrupt_document_refuses_to_open() {
        let backend = Arc::new(MemoryBackend::with_document("{ definitely not json"));
        assert!(Store::open(backend, StoreConfig::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.db");
        {
            let db = Arc::new(crate::Database::open_at(&path).unwrap());
            let store = Store::open(db, StoreConfig::default()).await.unwrap();
            store.create_user("a@example.com", "ada", "x").await.unwrap();
            store.flush_now().await.unwrap();
        }

        let db = Arc::new(crate::Database::open_at(&path).unwrap());
        let store = Store::open(db, StoreConfig::default()).await.unwrap();
        assert_eq!(store.users().await.len(), 1);
    }
}
