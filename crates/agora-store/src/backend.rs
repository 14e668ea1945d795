//! Where the store document is persisted.
//!
//! Backends are synchronous; the write-behind flusher calls them from a
//! blocking task so they never stall the async hot path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, StoreError};

/// Key-value persistence of the serialized store document.
pub trait SnapshotBackend: Send + Sync + 'static {
    /// Return the last saved document, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<String>>;

    /// Replace the saved document.
    fn save(&self, document: &str) -> Result<()>;
}

/// In-memory backend for tests and ephemeral instances.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    document: Mutex<Option<String>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing document, as if it had been saved earlier.
    pub fn with_document(document: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(Some(document.into())),
            ..Self::default()
        }
    }

    /// Make every subsequent `save` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last successfully saved document.
    pub fn document(&self) -> Option<String> {
        self.document.lock().ok().and_then(|doc| doc.clone())
    }
}

impl SnapshotBackend for MemoryBackend {
    fn load(&self) -> Result<Option<String>> {
        let doc = self
            .document
            .lock()
            .map_err(|_| StoreError::Backend("memory backend lock poisoned".into()))?;
        Ok(doc.clone())
    }

    fn save(&self, document: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory backend set to fail".into()));
        }
        let mut doc = self
            .document
            .lock()
            .map_err(|_| StoreError::Backend("memory backend lock poisoned".into()))?;
        *doc = Some(document.to_string());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
