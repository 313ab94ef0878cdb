//! In-memory implementations of the store and transport seams
//!
//! Used for embedding without a database and for driving the engine in
//! tests with scripted transport behavior.

use super::persistence::TaskStore;
use super::transport::{MessageStream, Transport};
use crate::error::{RelayError, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use relayman_types::{
    ChannelKind, Checkpoint, ErrorLogEntry, Message, MessageId, Task, TaskStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

// ============================================================================
// Task store
// ============================================================================

/// Task store kept in process memory
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<RwLock<HashMap<Uuid, Task>>>,
    checkpoints: Arc<Mutex<Vec<(Uuid, Checkpoint)>>>,
    /// Engine claims as (holder, last heartbeat)
    claims: Arc<Mutex<HashMap<Uuid, (Uuid, DateTime<Utc>)>>>,
    channels: Arc<RwLock<Vec<(i64, ChannelKind, String)>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkpoint written for `id`, in write order
    pub fn checkpoints(&self, id: Uuid) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .iter()
            .filter(|(task_id, _)| *task_id == id)
            .map(|(_, checkpoint)| *checkpoint)
            .collect()
    }

    fn with_task<F>(&self, id: Uuid, f: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(RelayError::NotFound(id))?;
        f(task);
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, task: &Task) -> Result<(), RelayError> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, RelayError> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), RelayError> {
        self.with_task(id, |task| task.status = status)
    }

    async fn update_status_if(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        status: TaskStatus,
    ) -> Result<bool, RelayError> {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(&id) {
            Some(task) if expected.contains(&task.status) => {
                task.status = status;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(&self, id: Uuid, checkpoint: Checkpoint) -> Result<(), RelayError> {
        self.with_task(id, |task| {
            task.progress.forwarded_count = checkpoint.forwarded_count;
            task.progress.total_messages = checkpoint.total_messages;
            task.progress.last_forwarded_message_id = task
                .progress
                .last_forwarded_message_id
                .max(checkpoint.last_forwarded_message_id);
            task.progress.last_forwarded_at = Some(Utc::now());
        })?;
        self.checkpoints.lock().push((id, checkpoint));
        Ok(())
    }

    async fn record_rate_limit_event(&self, id: Uuid) -> Result<(), RelayError> {
        self.with_task(id, |task| task.progress.rate_limit_events += 1)
    }

    async fn append_error_log(&self, id: Uuid, message: &str) -> Result<(), RelayError> {
        self.with_task(id, |task| {
            task.error_log.push(ErrorLogEntry {
                message: message.to_string(),
                timestamp: Utc::now(),
            })
        })
    }

    async fn list_active_tasks(&self) -> Result<Vec<Task>, RelayError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn list_tasks_by_owner(&self, owner: i64) -> Result<Vec<Task>, RelayError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn list_all_tasks(&self) -> Result<Vec<Task>, RelayError> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.tasks.write().remove(&id);
        self.claims.lock().remove(&id);
        Ok(())
    }

    async fn claim_engine(
        &self,
        id: Uuid,
        owner: Uuid,
        stale_after: Duration,
    ) -> Result<bool, RelayError> {
        if !self.tasks.read().contains_key(&id) {
            return Ok(false);
        }

        let now = Utc::now();
        let mut claims = self.claims.lock();
        let free = match claims.get(&id) {
            None => true,
            Some((holder, heartbeat)) => {
                *holder == owner
                    || (now - *heartbeat).to_std().map_or(false, |age| age > stale_after)
            }
        };
        if free {
            claims.insert(id, (owner, now));
        }
        Ok(free)
    }

    async fn heartbeat_engine(&self, id: Uuid, owner: Uuid) -> Result<bool, RelayError> {
        let mut claims = self.claims.lock();
        match claims.get_mut(&id) {
            Some((holder, heartbeat)) if *holder == owner => {
                *heartbeat = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_engine(&self, id: Uuid, owner: Uuid) -> Result<(), RelayError> {
        let mut claims = self.claims.lock();
        if claims.get(&id).is_some_and(|(holder, _)| *holder == owner) {
            claims.remove(&id);
        }
        Ok(())
    }

    async fn add_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<bool, RelayError> {
        let mut channels = self.channels.write();
        if channels
            .iter()
            .any(|(o, k, c)| *o == owner && *k == kind && c == channel)
        {
            return Ok(false);
        }
        channels.push((owner, kind, channel.to_string()));
        Ok(true)
    }

    async fn remove_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<bool, RelayError> {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|(o, k, c)| !(*o == owner && *k == kind && c == channel));
        Ok(channels.len() < before)
    }

    async fn list_channels(
        &self,
        owner: i64,
        kind: ChannelKind,
    ) -> Result<Vec<String>, RelayError> {
        Ok(self
            .channels
            .read()
            .iter()
            .filter(|(o, k, _)| *o == owner && *k == kind)
            .map(|(_, _, c)| c.clone())
            .collect())
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Default)]
struct ChannelState {
    history: Vec<Message>,
    followers: Vec<(Option<MessageId>, mpsc::UnboundedSender<Message>)>,
}

#[derive(Default)]
struct TransportState {
    channels: HashMap<String, ChannelState>,
    /// Successful forwards as (source, dest, message id), in delivery order
    delivered: Vec<(String, String, MessageId)>,
    attempts: HashMap<MessageId, u32>,
    scripted: HashMap<MessageId, VecDeque<TransportError>>,
    always_fail: HashMap<MessageId, TransportError>,
    enumerate_error: Option<String>,
    unready: bool,
}

/// Scriptable in-process transport
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a channel's backlog with content messages `ids`
    pub fn with_history(self, channel: &str, ids: impl IntoIterator<Item = MessageId>) -> Self {
        {
            let mut state = self.state.lock();
            let history = &mut state.channels.entry(channel.to_string()).or_default().history;
            history.extend(ids.into_iter().map(|id| Message {
                id,
                has_content: true,
            }));
            history.sort_by_key(|m| m.id);
        }
        self
    }

    /// Publish a new message to a channel and every follower of it
    pub fn push_message(&self, channel: &str, message: Message) {
        let mut state = self.state.lock();
        let channel_state = state.channels.entry(channel.to_string()).or_default();
        channel_state.history.push(message);
        channel_state
            .followers
            .retain(|(_, tx)| tx.send(message).is_ok());
    }

    /// Fail the next forwards of `message_id` with `errors`, in order
    pub fn fail_next(&self, message_id: MessageId, errors: impl IntoIterator<Item = TransportError>) {
        self.state
            .lock()
            .scripted
            .entry(message_id)
            .or_default()
            .extend(errors);
    }

    /// Fail every forward of `message_id`
    pub fn fail_always(&self, message_id: MessageId, error: TransportError) {
        self.state.lock().always_fail.insert(message_id, error);
    }

    /// Make backlog enumeration fail
    pub fn fail_enumeration(&self, cause: &str) {
        self.state.lock().enumerate_error = Some(cause.to_string());
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().unready = !ready;
    }

    pub fn attempts(&self, message_id: MessageId) -> u32 {
        self.state.lock().attempts.get(&message_id).copied().unwrap_or(0)
    }

    /// Ids forwarded from `source` to `dest`, in delivery order
    pub fn delivered(&self, source: &str, dest: &str) -> Vec<MessageId> {
        self.state
            .lock()
            .delivered
            .iter()
            .filter(|(s, d, _)| s == source && d == dest)
            .map(|(_, _, id)| *id)
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn forward(
        &self,
        source: &str,
        dest: &str,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        *state.attempts.entry(message_id).or_insert(0) += 1;

        if let Some(err) = state.scripted.get_mut(&message_id).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        if let Some(err) = state.always_fail.get(&message_id) {
            return Err(err.clone());
        }

        state
            .delivered
            .push((source.to_string(), dest.to_string(), message_id));
        Ok(())
    }

    fn enumerate_messages(&self, channel: &str, after: Option<MessageId>) -> MessageStream<'_> {
        let state = self.state.lock();
        if let Some(cause) = &state.enumerate_error {
            let err = TransportError::Failed(cause.clone());
            return futures::stream::once(async move { Err(err) }).boxed();
        }

        let messages: Vec<Result<Message, TransportError>> = state
            .channels
            .get(channel)
            .map(|c| {
                c.history
                    .iter()
                    .filter(|m| after.map_or(true, |after| m.id > after))
                    .copied()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();
        futures::stream::iter(messages).boxed()
    }

    fn follow_messages(&self, channel: &str, after: Option<MessageId>) -> MessageStream<'_> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let channel_state = state.channels.entry(channel.to_string()).or_default();

        if let Some(after) = after {
            for message in channel_state.history.iter().filter(|m| m.id > after) {
                let _ = tx.send(*message);
            }
        }
        channel_state.followers.push((after, tx));

        UnboundedReceiverStream::new(rx).map(Ok).boxed()
    }

    async fn is_ready(&self) -> bool {
        !self.state.lock().unready
    }
}
