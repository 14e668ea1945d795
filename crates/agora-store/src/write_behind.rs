//! Debounced write-behind persistence.
//!
//! Mutations call [`WriteBehind::schedule`], which never blocks. The first
//! signal after an idle period arms a timer; when it fires, every mutation
//! that arrived in the meantime is covered by one serialized snapshot and one
//! backend write. Only one write is ever in flight. A failed write keeps the
//! dirty flag and the task retries it with a doubling delay, so an idle store
//! still reaches the backend once it recovers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::backend::SnapshotBackend;
use crate::error::{Result, StoreError};

/// Upper bound on the delay between retries of a failing backend.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub(crate) struct WriteBehind {
    backend: Arc<dyn SnapshotBackend>,
    dirty: AtomicBool,
    in_flight: Mutex<()>,
    signal: mpsc::Sender<()>,
}

impl WriteBehind {
    /// Build the flusher and the receiving end its background task drains.
    pub(crate) fn new(backend: Arc<dyn SnapshotBackend>) -> (Self, mpsc::Receiver<()>) {
        // Capacity 1: a pending signal already covers every later mutation.
        let (signal, rx) = mpsc::channel(1);
        (
            Self {
                backend,
                dirty: AtomicBool::new(false),
                in_flight: Mutex::new(()),
                signal,
            },
            rx,
        )
    }

    /// Mark the state dirty and make sure a flush is pending.
    pub(crate) fn schedule(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        // Full means a flush is already armed; Closed means the task is gone
        // (runtime shutting down) and flush_now is the only way left.
        let _ = self.signal.try_send(());
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the snapshot produced by `snapshot` if anything changed since the
    /// last successful write.
    pub(crate) async fn flush<F, Fut>(&self, snapshot: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let _guard = self.in_flight.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let result = match snapshot().await {
            Ok(document) => {
                let backend = Arc::clone(&self.backend);
                let bytes = document.len();
                match tokio::task::spawn_blocking(move || backend.save(&document)).await {
                    Ok(Ok(())) => {
                        debug!(bytes, "store flushed");
                        Ok(true)
                    }
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(StoreError::Backend(format!("flush task failed: {e}"))),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.dirty.store(true, Ordering::SeqCst);
            warn!(error = %e, "store flush failed, will retry");
        }
        result
    }
}

/// Drive the debounce loop until every sender is dropped.
///
/// `flush` resolves to `true` when the write failed and must be retried.
pub(crate) async fn run<F, Fut>(mut rx: mpsc::Receiver<()>, interval: Duration, mut flush: F)
where
    F: FnMut() -> Option<Fut>,
    Fut: Future<Output = bool>,
{
    'signals: while rx.recv().await.is_some() {
        let mut delay = interval;
        loop {
            tokio::time::sleep(delay).await;
            // Anything signalled during the sleep is covered by this flush.
            while rx.try_recv().is_ok() {}
            let Some(fut) = flush() else {
                break 'signals;
            };
            if !fut.await {
                break;
            }
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }
    debug!("write-behind task stopped");
}
