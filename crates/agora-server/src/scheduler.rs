//! Deferred execution for presence departures.
//!
//! The coordinator hands the scheduler a future to run after the grace
//! period. Cancellation is not the scheduler's job: a departure that lost the
//! race against a reconnect finds its token stale and does nothing.

use std::time::Duration;

use futures::future::BoxFuture;

pub trait DepartureScheduler: Send + Sync + 'static {
    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Production scheduler: one sleeping tokio task per departure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl DepartureScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

/// Test scheduler that only runs tasks when told to.
#[cfg(test)]
#[derive(Default)]
pub struct ManualScheduler {
    tasks: std::sync::Mutex<Vec<(Duration, BoxFuture<'static, ()>)>>,
}

#[cfg(test)]
impl ManualScheduler {
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Run every queued task in scheduling order.
    pub async fn fire_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for (_, task) in tasks {
            task.await;
        }
    }
}

#[cfg(test)]
impl DepartureScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        self.tasks.lock().unwrap().push((delay, task));
    }
}
