//! Status observation for a running engine
//!
//! Operator transitions made through the in-process task manager arrive
//! immediately over a watch channel. Transitions written to the store by
//! another process are picked up by re-reading the record once the cached
//! value is older than the refresh interval.

use super::persistence::TaskStore;
use relayman_types::TaskStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

pub struct StatusWatch {
    task_id: Uuid,
    store: Arc<dyn TaskStore>,
    signal: watch::Receiver<TaskStatus>,
    signal_closed: bool,
    cached: TaskStatus,
    refreshed_at: Instant,
    refresh_every: Duration,
}

impl StatusWatch {
    pub fn new(
        task_id: Uuid,
        store: Arc<dyn TaskStore>,
        signal: watch::Receiver<TaskStatus>,
        refresh_every: Duration,
    ) -> Self {
        let cached = *signal.borrow();
        Self {
            task_id,
            store,
            signal,
            signal_closed: false,
            cached,
            refreshed_at: Instant::now(),
            refresh_every,
        }
    }

    /// Latest known status of the task.
    ///
    /// A record that disappeared from the store reads as DELETED.
    pub async fn current(&mut self) -> TaskStatus {
        if !self.signal_closed {
            match self.signal.has_changed() {
                Ok(true) => {
                    self.cached = *self.signal.borrow_and_update();
                    self.refreshed_at = Instant::now();
                    return self.cached;
                }
                Ok(false) => {}
                Err(_) => {
                    // Manager released the task; its last word still counts
                    self.signal_closed = true;
                    let last = *self.signal.borrow();
                    if !last.is_active() {
                        self.cached = last;
                        return last;
                    }
                }
            }
        }

        if self.refreshed_at.elapsed() >= self.refresh_every || self.signal_closed {
            self.refresh().await;
        }
        self.cached
    }

    /// Resolve when an operator signal arrives or `max_wait` elapses
    pub async fn changed(&mut self, max_wait: Duration) {
        if self.signal_closed {
            tokio::time::sleep(max_wait).await;
            return;
        }
        tokio::select! {
            result = self.signal.changed() => {
                if result.is_err() {
                    self.signal_closed = true;
                }
            }
            _ = tokio::time::sleep(max_wait) => {}
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_every
    }

    async fn refresh(&mut self) {
        match self.store.get_task(self.task_id).await {
            Ok(Some(task)) => self.cached = task.status,
            Ok(None) => self.cached = TaskStatus::Deleted,
            Err(e) => warn!(
                "Failed to refresh status of task {}, keeping {}: {}",
                self.task_id, self.cached, e
            ),
        }
        self.refreshed_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryTaskStore;
    use relayman_types::{AuthMethod, ForwardMode, Task};

    async fn setup() -> (MemoryTaskStore, Task) {
        let store = MemoryTaskStore::new();
        let task = Task::new(
            "@src".into(),
            "@dst".into(),
            AuthMethod::UserAccount,
            ForwardMode::Live,
            1,
        );
        store.create_task(&task).await.unwrap();
        (store, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_is_seen_immediately() {
        let (store, task) = setup().await;
        let (tx, rx) = watch::channel(TaskStatus::Running);
        let mut watch = StatusWatch::new(task.id, Arc::new(store), rx, Duration::from_secs(5));

        assert_eq!(watch.current().await, TaskStatus::Running);
        tx.send_replace(TaskStatus::Paused);
        assert_eq!(watch.current().await, TaskStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_change_seen_after_refresh_interval() {
        let (store, task) = setup().await;
        let (_tx, rx) = watch::channel(TaskStatus::Running);
        let mut watch =
            StatusWatch::new(task.id, Arc::new(store.clone()), rx, Duration::from_secs(5));

        store.update_status(task.id, TaskStatus::Stopped).await.unwrap();
        assert_eq!(watch.current().await, TaskStatus::Running);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(watch.current().await, TaskStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_record_reads_as_deleted() {
        let (store, task) = setup().await;
        let (_tx, rx) = watch::channel(TaskStatus::Running);
        let mut watch = StatusWatch::new(task.id, Arc::new(store.clone()), rx, Duration::ZERO);

        store.delete_task(task.id).await.unwrap();
        assert_eq!(watch.current().await, TaskStatus::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_signal_keeps_last_terminal_value() {
        let (store, task) = setup().await;
        let (tx, rx) = watch::channel(TaskStatus::Running);
        let mut watch = StatusWatch::new(task.id, Arc::new(store), rx, Duration::from_secs(5));

        tx.send_replace(TaskStatus::Deleted);
        drop(tx);
        assert_eq!(watch.current().await, TaskStatus::Deleted);
    }
}
