//! Forwarding engine
//!
//! Runs one task: enumerates (complete mode) or tails (live mode) the
//! source channel and forwards each content message to the destination,
//! pacing every attempt through the connection's shared rate limiter.
//!
//! Delivery is at-least-once. Progress is checkpointed after batches, so
//! a crash between checkpoints re-forwards the messages since the last one.

use super::persistence::TaskStore;
use super::rate_limiter::RateLimiter;
use super::status::StatusWatch;
use super::transport::Transport;
use crate::error::{RelayError, TransportError};
use futures::StreamExt;
use relayman_types::{
    Checkpoint, CoreEvent, ForwardMode, Message, MessageId, Settings, Task, TaskStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Tunables of one engine run
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Attempts per message, at least one
    pub max_retries: u32,
    /// Forwarded messages between complete-mode checkpoints
    pub checkpoint_batch: u64,
    /// Sleep between status polls while paused
    pub poll_interval: Duration,
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            checkpoint_batch: settings.checkpoint_batch.max(1),
            poll_interval: settings.live_poll_interval(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Executes a single task until it completes, fails, or is stopped
pub struct ForwardingEngine {
    task: Task,
    transport: Arc<dyn Transport>,
    rate_limiter: RateLimiter,
    store: Arc<dyn TaskStore>,
    status: StatusWatch,
    event_tx: broadcast::Sender<CoreEvent>,
    options: EngineOptions,
}

impl ForwardingEngine {
    pub fn new(
        task: Task,
        transport: Arc<dyn Transport>,
        rate_limiter: RateLimiter,
        store: Arc<dyn TaskStore>,
        status: StatusWatch,
        event_tx: broadcast::Sender<CoreEvent>,
        options: EngineOptions,
    ) -> Self {
        Self {
            task,
            transport,
            rate_limiter,
            store,
            status,
            event_tx,
            options,
        }
    }

    /// Run the task in its configured mode
    pub async fn run(mut self) -> Result<(), RelayError> {
        match self.task.mode {
            ForwardMode::Complete => self.run_complete().await,
            ForwardMode::Live => self.run_live().await,
        }
    }

    /// Deliver one message, retrying up to `max_retries` attempts.
    ///
    /// Every attempt is paced by the rate limiter. Flood waits are honored
    /// exactly and count as attempts.
    pub async fn forward_one(&self, message_id: MessageId) -> Result<(), RelayError> {
        let attempts = self.options.max_retries.max(1);
        let mut last_error = RelayError::Unknown(format!("message {} was never attempted", message_id));

        for attempt in 0..attempts {
            self.rate_limiter.wait_before_send().await;

            let result = self
                .transport
                .forward(&self.task.source_channel, &self.task.dest_channel, message_id)
                .await;

            let is_last = attempt + 1 == attempts;
            match result {
                Ok(()) => {
                    self.rate_limiter.note_success().await;
                    debug!("Task {} forwarded message {}", self.task.id, message_id);
                    return Ok(());
                }
                Err(TransportError::Throttle { seconds }) => {
                    self.record_throttle(seconds).await;
                    self.rate_limiter.on_throttle_signal(seconds).await;
                    last_error = RelayError::Throttled { seconds };
                }
                Err(TransportError::Failed(cause)) => {
                    self.rate_limiter.note_failure().await;
                    warn!(
                        "Task {} attempt {}/{} for message {} failed: {}",
                        self.task.id,
                        attempt + 1,
                        attempts,
                        message_id,
                        cause
                    );
                    last_error = RelayError::Transport(cause);
                }
            }

            if !is_last {
                let backoff = self.rate_limiter.backoff_delay(attempt);
                debug!("Task {} retrying message {} in {:?}", self.task.id, message_id, backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error)
    }

    async fn run_complete(&mut self) -> Result<(), RelayError> {
        info!(
            "Task {} forwarding backlog {} -> {}",
            self.task.id, self.task.source_channel, self.task.dest_channel
        );

        let messages = match self.collect_backlog().await {
            Ok(messages) => messages,
            Err(e) => {
                self.fail(&e).await;
                return Err(e);
            }
        };

        let total = messages.len() as u64;
        let mut cursor = self.task.progress.last_forwarded_message_id;
        let mut forwarded = self.task.progress.forwarded_count.min(total);
        self.checkpoint(forwarded, total, cursor).await;

        if total == 0 {
            info!("Task {} source channel is empty", self.task.id);
            self.finish().await;
            return Ok(());
        }

        let batch = self.options.checkpoint_batch.max(1);
        for message in messages {
            if message.id <= cursor {
                continue;
            }
            if !self.wait_until_runnable().await {
                self.checkpoint(forwarded, total, cursor).await;
                return Ok(());
            }

            match self.forward_one(message.id).await {
                Ok(()) => {
                    forwarded += 1;
                    cursor = message.id;
                    if forwarded % batch == 0 {
                        self.checkpoint(forwarded, total, cursor).await;
                        info!("Task {} progress {}/{}", self.task.id, forwarded, total);
                    }
                }
                Err(e) => self.log_message_failure(message.id, &e).await,
            }
        }

        if forwarded % batch != 0 {
            self.checkpoint(forwarded, total, cursor).await;
        }

        if self.wait_until_runnable().await {
            self.finish().await;
        }
        Ok(())
    }

    async fn run_live(&mut self) -> Result<(), RelayError> {
        info!(
            "Task {} tailing {} -> {}",
            self.task.id, self.task.source_channel, self.task.dest_channel
        );

        let mut cursor = self.task.progress.last_forwarded_message_id;
        let mut forwarded = self.task.progress.forwarded_count;
        let mut seen = self.task.progress.total_messages.max(forwarded);

        let transport = Arc::clone(&self.transport);
        let resume_after = (cursor > 0).then_some(cursor);
        let mut stream = transport.follow_messages(&self.task.source_channel, resume_after);
        let recheck_every = self.status.refresh_interval().max(Duration::from_secs(1));

        loop {
            if !self.wait_until_runnable().await {
                break;
            }

            // Status first, so a pause wins over an already queued message
            let next = tokio::select! {
                biased;
                _ = self.status.changed(recheck_every) => continue,
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    let err = RelayError::from(e);
                    self.fail(&err).await;
                    return Err(err);
                }
                None => {
                    warn!("Task {} live stream closed by transport", self.task.id);
                    break;
                }
            };

            if message.id <= cursor || !message.has_content {
                continue;
            }
            seen += 1;

            match self.forward_one(message.id).await {
                Ok(()) => {
                    forwarded += 1;
                    cursor = message.id;
                }
                Err(e) => self.log_message_failure(message.id, &e).await,
            }
            self.checkpoint(forwarded, seen, cursor).await;
        }

        info!("Task {} live forwarding ended after {} messages", self.task.id, forwarded);
        Ok(())
    }

    /// Enumerate the source backlog, keeping content messages only
    async fn collect_backlog(&self) -> Result<Vec<Message>, RelayError> {
        let resume_after = self.task.progress.last_forwarded_message_id;
        let mut stream = self
            .transport
            .enumerate_messages(&self.task.source_channel, None);

        let mut messages = Vec::new();
        while let Some(item) = stream.next().await {
            let message = item?;
            if message.has_content {
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| m.id);

        debug!(
            "Task {} backlog has {} messages, {} after cursor {}",
            self.task.id,
            messages.len(),
            messages.iter().filter(|m| m.id > resume_after).count(),
            resume_after
        );
        Ok(messages)
    }

    /// Block while the task is paused. Returns false once it should exit.
    async fn wait_until_runnable(&mut self) -> bool {
        loop {
            match self.status.current().await {
                TaskStatus::Running => return true,
                TaskStatus::Paused => {
                    debug!("Task {} paused", self.task.id);
                    self.status.changed(self.options.poll_interval).await;
                }
                other => {
                    info!("Task {} exiting, status is {}", self.task.id, other);
                    return false;
                }
            }
        }
    }

    async fn checkpoint(&self, forwarded: u64, total: u64, cursor: MessageId) {
        let checkpoint = Checkpoint {
            forwarded_count: forwarded,
            total_messages: total,
            last_forwarded_message_id: cursor,
        };
        if let Err(e) = self.store.update_progress(self.task.id, checkpoint).await {
            warn!("Failed to checkpoint task {}: {}", self.task.id, e);
        }
        let _ = self.event_tx.send(CoreEvent::TaskProgress {
            id: self.task.id,
            forwarded,
            total,
            last_message_id: cursor,
        });
    }

    async fn record_throttle(&self, seconds: u64) {
        if let Err(e) = self.store.record_rate_limit_event(self.task.id).await {
            warn!("Failed to record rate limit event for task {}: {}", self.task.id, e);
        }
        let _ = self.event_tx.send(CoreEvent::TaskRateLimited {
            id: self.task.id,
            wait_seconds: seconds,
        });
    }

    async fn log_message_failure(&self, message_id: MessageId, err: &RelayError) {
        error!(
            "Task {} giving up on message {}: {}",
            self.task.id, message_id, err
        );
        let entry = format!("Failed to forward message {}: {}", message_id, err);
        if let Err(e) = self.store.append_error_log(self.task.id, &entry).await {
            warn!("Failed to append error log for task {}: {}", self.task.id, e);
        }
        let _ = self.event_tx.send(CoreEvent::TaskMessageFailed {
            id: self.task.id,
            message_id,
            error: err.to_string(),
        });
    }

    /// Mark the task COMPLETED unless an operator moved it meanwhile
    async fn finish(&self) {
        if self.set_status_from(TaskStatus::Running, TaskStatus::Completed).await {
            info!("Task {} completed", self.task.id);
        }
    }

    /// Record a fatal error and move a RUNNING task to ERROR
    async fn fail(&mut self, err: &RelayError) {
        error!("Task {} failed: {}", self.task.id, err);
        if let Err(e) = self
            .store
            .append_error_log(self.task.id, &err.to_string())
            .await
        {
            warn!("Failed to append error log for task {}: {}", self.task.id, e);
        }
        self.set_status_from(TaskStatus::Running, TaskStatus::Error).await;
    }

    /// Write `status` only if the stored status is still `expected`
    async fn set_status_from(&self, expected: TaskStatus, status: TaskStatus) -> bool {
        match self
            .store
            .update_status_if(self.task.id, &[expected], status)
            .await
        {
            Ok(true) => {
                let _ = self.event_tx.send(CoreEvent::TaskStatusChanged {
                    id: self.task.id,
                    status,
                });
                true
            }
            Ok(false) => {
                info!(
                    "Task {} left as is, it was no longer {} when marking {}",
                    self.task.id, expected, status
                );
                false
            }
            Err(e) => {
                warn!("Failed to persist status {} for task {}: {}", status, self.task.id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryTaskStore, MemoryTransport};
    use relayman_types::{AuthMethod, RateLimitProfile};
    use tokio::sync::watch;

    fn fast_profile() -> RateLimitProfile {
        RateLimitProfile {
            base_delay: 0.1,
            min_delay: 0.1,
            max_delay: 0.2,
            batch_size: 0,
            batch_cooldown: 0.0,
            max_forwards_per_minute: 1000,
            backoff_multiplier: 2.0,
        }
    }

    async fn engine_for(
        transport: MemoryTransport,
        store: MemoryTaskStore,
        mode: ForwardMode,
    ) -> (ForwardingEngine, watch::Sender<TaskStatus>) {
        let task = Task::new("@src".into(), "@dst".into(), AuthMethod::UserAccount, mode, 1);
        store.create_task(&task).await.unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(store);
        let (tx, rx) = watch::channel(TaskStatus::Running);
        let status = StatusWatch::new(task.id, Arc::clone(&store), rx, Duration::from_secs(5));
        let limiter = RateLimiter::new(
            AuthMethod::UserAccount,
            fast_profile(),
            Duration::from_secs(300),
        );
        let (event_tx, _) = broadcast::channel(64);
        let engine = ForwardingEngine::new(
            task,
            Arc::new(transport),
            limiter,
            store,
            status,
            event_tx,
            EngineOptions::default(),
        );
        (engine, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_one_succeeds_on_third_attempt() {
        let transport = MemoryTransport::new();
        transport.fail_next(
            42,
            [
                TransportError::Failed("timeout".into()),
                TransportError::Failed("timeout".into()),
            ],
        );
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(transport.clone(), store.clone(), ForwardMode::Complete).await;

        engine.forward_one(42).await.unwrap();
        assert_eq!(transport.attempts(42), 3);

        let task = store.get_task(engine.task.id).await.unwrap().unwrap();
        assert!(task.error_log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_one_gives_up_after_max_retries() {
        let transport = MemoryTransport::new();
        transport.fail_always(9, TransportError::Failed("forbidden".into()));
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(transport.clone(), store, ForwardMode::Complete).await;

        let err = engine.forward_one(9).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(ref cause) if cause == "forbidden"));
        assert_eq!(transport.attempts(9), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_counts_as_attempt_and_is_recorded() {
        let transport = MemoryTransport::new();
        transport.fail_next(5, [TransportError::Throttle { seconds: 30 }]);
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(transport.clone(), store.clone(), ForwardMode::Complete).await;

        let start = tokio::time::Instant::now();
        engine.forward_one(5).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(transport.attempts(5), 2);

        let task = store.get_task(engine.task.id).await.unwrap().unwrap();
        assert_eq!(task.progress.rate_limit_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumeration_failure_marks_error() {
        let transport = MemoryTransport::new();
        transport.fail_enumeration("channel is private");
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(transport, store.clone(), ForwardMode::Complete).await;
        let id = engine.task.id;

        assert!(engine.run().await.is_err());
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_log.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_channel_completes_immediately() {
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(MemoryTransport::new(), store.clone(), ForwardMode::Complete).await;
        let id = engine.task.id;

        engine.run().await.unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress.total_messages, 0);
        assert_eq!(task.progress.forwarded_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_filter_skips_service_messages() {
        let transport = MemoryTransport::new().with_history("@src", [1, 3]);
        transport.push_message(
            "@src",
            Message {
                id: 2,
                has_content: false,
            },
        );
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(transport.clone(), store.clone(), ForwardMode::Complete).await;
        let id = engine.task.id;

        engine.run().await.unwrap();
        assert_eq!(transport.delivered("@src", "@dst"), vec![1, 3]);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.progress.total_messages, 2);
        assert_eq!(task.progress.forwarded_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_exits_without_completing() {
        let transport = MemoryTransport::new().with_history("@src", 1..=10);
        let store = MemoryTaskStore::new();
        let (engine, tx) = engine_for(transport.clone(), store.clone(), ForwardMode::Complete).await;
        let id = engine.task.id;

        store.update_status(id, TaskStatus::Stopped).await.unwrap();
        tx.send_replace(TaskStatus::Stopped);
        engine.run().await.unwrap();

        assert!(transport.delivered("@src", "@dst").is_empty());
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_delete_is_not_overwritten_on_finish() {
        let transport = MemoryTransport::new().with_history("@src", 1..=3);
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(transport.clone(), store.clone(), ForwardMode::Complete).await;
        let id = engine.task.id;

        // Written by another process: no signal, and the cached status is still fresh
        store.update_status(id, TaskStatus::Deleted).await.unwrap();
        engine.run().await.unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_is_not_overwritten_by_error() {
        let transport = MemoryTransport::new();
        transport.fail_enumeration("channel is private");
        let store = MemoryTaskStore::new();
        let (engine, _tx) = engine_for(transport, store.clone(), ForwardMode::Complete).await;
        let id = engine.task.id;

        store.update_status(id, TaskStatus::Stopped).await.unwrap();
        assert!(engine.run().await.is_err());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert_eq!(task.error_log.len(), 1);
    }
}
