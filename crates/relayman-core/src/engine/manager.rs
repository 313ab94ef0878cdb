//! Task Manager - owns the lifecycle of every forwarding task
//!
//! This is the top-level coordinator that:
//! - Validates and creates tasks, then spawns their engines
//! - Turns operator commands into persisted status transitions
//! - Signals running engines about those transitions
//! - Resumes work after a restart and pauses it on shutdown
//!
//! Several processes may share one task database. Each engine holds a
//! claim on its task record, refreshed by a heartbeat, so a task runs in
//! at most one process at a time.

use crate::engine::{
    Connections, EngineOptions, ForwardingEngine, RateLimiter, StatusWatch, TaskStore,
};
use crate::error::RelayError;
use crate::validation::validate_channel_pair;
use relayman_types::{AuthMethod, CoreEvent, ForwardMode, Settings, Task, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often a running engine refreshes its claim
const CLAIM_HEARTBEAT: Duration = Duration::from_secs(15);

/// Age after which a claim from a silent process may be taken over
const CLAIM_TTL: Duration = Duration::from_secs(60);

/// Attempts at a status transition racing with other writers
const TRANSITION_ATTEMPTS: usize = 5;

/// Coordinates all forwarding tasks of this process
pub struct TaskManager {
    /// Identifies this process in engine claims
    instance_id: Uuid,
    /// Engines running in this process. The store stays the source of
    /// truth for status and for which process runs a task.
    active_tasks: Arc<RwLock<HashMap<Uuid, TaskHandle>>>,
    store: Arc<dyn TaskStore>,
    connections: Connections,
    /// One limiter per connection class, shared by all of its tasks
    rate_limiters: HashMap<AuthMethod, RateLimiter>,
    options: EngineOptions,
    status_refresh: Duration,
    event_tx: broadcast::Sender<CoreEvent>,
}

/// Handle to a running engine
struct TaskHandle {
    join_handle: tokio::task::JoinHandle<Result<(), RelayError>>,
    status_tx: watch::Sender<TaskStatus>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        connections: Connections,
        settings: &Settings,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        let rate_limiters = AuthMethod::ALL
            .into_iter()
            .map(|auth| {
                let limiter =
                    RateLimiter::new(auth, settings.profile(auth).clone(), settings.max_backoff());
                (auth, limiter)
            })
            .collect();

        Self {
            instance_id: Uuid::new_v4(),
            active_tasks: Arc::new(RwLock::new(HashMap::new())),
            store,
            connections,
            rate_limiters,
            options: EngineOptions::from(settings),
            status_refresh: settings.status_refresh(),
            event_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Shared limiter of a connection class
    pub fn rate_limiter(&self, auth_method: AuthMethod) -> Option<&RateLimiter> {
        self.rate_limiters.get(&auth_method)
    }

    /// Validate, persist and launch a new task
    pub async fn start_task(
        &self,
        source_channel: &str,
        dest_channel: &str,
        auth_method: AuthMethod,
        mode: ForwardMode,
        owner: i64,
    ) -> Result<Uuid, RelayError> {
        let (source, dest) = validate_channel_pair(source_channel, dest_channel)?;

        if !self.connections.is_connection_ready(auth_method).await {
            return Err(RelayError::ConnectionUnavailable(auth_method));
        }

        let task = Task::new(source, dest, auth_method, mode, owner);
        let id = task.id;
        self.store.create_task(&task).await?;
        info!(
            "Created {} task {}: {} -> {} via {}",
            mode, id, task.source_channel, task.dest_channel, auth_method
        );

        let _ = self.event_tx.send(CoreEvent::TaskAdded { task: task.clone() });
        self.spawn_engine(task).await?;

        Ok(id)
    }

    /// Spawn an engine for a RUNNING task loaded from the store.
    ///
    /// Fails with `AlreadyRunning` when an engine for the task runs here or
    /// in another process holding a live claim.
    async fn spawn_engine(&self, task: Task) -> Result<(), RelayError> {
        let id = task.id;
        let auth_method = task.auth_method;
        let transport = self
            .connections
            .get(auth_method)
            .ok_or(RelayError::ConnectionUnavailable(auth_method))?;
        let rate_limiter = self
            .rate_limiters
            .get(&auth_method)
            .cloned()
            .ok_or(RelayError::ConnectionUnavailable(auth_method))?;

        let mut tasks = self.active_tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(RelayError::AlreadyRunning(id));
        }
        if !self.store.claim_engine(id, self.instance_id, CLAIM_TTL).await? {
            debug!("Task {} is claimed by another process", id);
            return Err(RelayError::AlreadyRunning(id));
        }

        let (status_tx, status_rx) = watch::channel(task.status);
        let status = StatusWatch::new(id, Arc::clone(&self.store), status_rx, self.status_refresh);
        let engine = ForwardingEngine::new(
            task,
            transport,
            rate_limiter,
            Arc::clone(&self.store),
            status,
            self.event_tx.clone(),
            self.options,
        );

        let active_tasks = self.active_tasks.clone();
        let store = Arc::clone(&self.store);
        let owner = self.instance_id;
        let join_handle = tokio::spawn(async move {
            let result = tokio::select! {
                result = engine.run() => result,
                lost = hold_claim(Arc::clone(&store), id, owner) => Err(lost),
            };
            if let Err(e) = &result {
                warn!("Task {} engine exited with error: {}", id, e);
            }
            if let Err(e) = store.release_engine(id, owner).await {
                warn!("Failed to release engine claim of task {}: {}", id, e);
            }
            // Remove from active tasks when done
            active_tasks.write().await.remove(&id);
            result
        });

        tasks.insert(
            id,
            TaskHandle {
                join_handle,
                status_tx,
            },
        );
        debug!("Spawned engine for task {}", id);
        Ok(())
    }

    /// Persist a status transition and signal the task's engine.
    /// Requesting the current status is a no-op.
    ///
    /// The write only lands if the stored status is still the one the
    /// transition was checked against; otherwise the check is redone.
    async fn transition(&self, id: Uuid, next: TaskStatus) -> Result<Task, RelayError> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let mut task = self
                .store
                .get_task(id)
                .await?
                .ok_or(RelayError::NotFound(id))?;

            if task.status == next {
                debug!("Task {} already {}", id, next);
                return Ok(task);
            }
            if !task.status.can_transition_to(next) {
                return Err(RelayError::InvalidTransition {
                    from: task.status,
                    to: next,
                });
            }

            if !self.store.update_status_if(id, &[task.status], next).await? {
                debug!("Task {} changed while moving to {}, retrying", id, next);
                continue;
            }
            if let Some(handle) = self.active_tasks.read().await.get(&id) {
                handle.status_tx.send_replace(next);
            }

            info!("Task {} {} -> {}", id, task.status, next);
            let _ = self
                .event_tx
                .send(CoreEvent::TaskStatusChanged { id, status: next });

            task.status = next;
            return Ok(task);
        }

        Err(RelayError::Unknown(format!(
            "task {} kept changing while moving to {}",
            id, next
        )))
    }

    pub async fn pause_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.transition(id, TaskStatus::Paused).await.map(|_| ())
    }

    /// Resume a paused task. Without a local engine, one is started when the
    /// task's connection is available; otherwise the task stays RUNNING for
    /// whichever process holds that connection.
    pub async fn resume_task(&self, id: Uuid) -> Result<(), RelayError> {
        let task = self.transition(id, TaskStatus::Running).await?;

        if self.is_active(id).await {
            return Ok(());
        }
        if !self.connections.is_connection_ready(task.auth_method).await {
            warn!(
                "Task {} resumed without a live {} connection here, leaving it for later",
                id, task.auth_method
            );
            return Ok(());
        }

        match self.spawn_engine(task).await {
            Err(RelayError::AlreadyRunning(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn stop_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.transition(id, TaskStatus::Stopped).await.map(|_| ())
    }

    /// Mark a task DELETED and drop it from the registry. The record is kept.
    pub async fn delete_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.transition(id, TaskStatus::Deleted).await?;
        if self.active_tasks.write().await.remove(&id).is_some() {
            debug!("Released engine handle of task {}", id);
        }
        Ok(())
    }

    /// Delete a task and erase its record
    pub async fn purge_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.delete_task(id).await?;
        self.store.delete_task(id).await?;
        info!("Purged task {}", id);
        let _ = self.event_tx.send(CoreEvent::TaskRemoved { id });
        Ok(())
    }

    /// Current snapshot of a task from the store
    pub async fn get_task_status(&self, id: Uuid) -> Result<Task, RelayError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(RelayError::NotFound(id))
    }

    /// All tasks, or those of one owner
    pub async fn list_tasks(&self, owner: Option<i64>) -> Result<Vec<Task>, RelayError> {
        match owner {
            Some(owner) => self.store.list_tasks_by_owner(owner).await,
            None => self.store.list_all_tasks().await,
        }
    }

    /// Spawn engines for RUNNING tasks that have none in this process.
    ///
    /// Tasks whose connection is not ready are skipped and stay RUNNING.
    /// PAUSED tasks wait for an explicit resume.
    pub async fn resume_all_on_startup(&self) -> Result<Vec<Uuid>, RelayError> {
        let tasks = self.store.list_active_tasks().await?;
        let mut resumed = Vec::new();

        for task in tasks {
            if task.status != TaskStatus::Running || self.is_active(task.id).await {
                continue;
            }
            if !self.connections.is_connection_ready(task.auth_method).await {
                warn!(
                    "Skipping task {}: no live {} connection",
                    task.id, task.auth_method
                );
                continue;
            }

            let id = task.id;
            match self.spawn_engine(task).await {
                Ok(()) => {
                    info!("Resumed task {}", id);
                    resumed.push(id);
                }
                Err(RelayError::AlreadyRunning(_)) => {}
                Err(e) => warn!("Failed to resume task {}: {}", id, e),
            }
        }

        Ok(resumed)
    }

    /// Pause the RUNNING tasks whose engines run in this process, stop
    /// those engines and release their claims. Tasks driven by other
    /// processes are left alone.
    pub async fn pause_all_on_shutdown(&self) -> Result<usize, RelayError> {
        let ids: Vec<Uuid> = self.active_tasks.read().await.keys().copied().collect();
        let mut paused = 0;

        for id in &ids {
            match self.store.update_status_if(*id, &[TaskStatus::Running], TaskStatus::Paused).await {
                Ok(true) => {
                    paused += 1;
                    let _ = self.event_tx.send(CoreEvent::TaskStatusChanged {
                        id: *id,
                        status: TaskStatus::Paused,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to pause task {} on shutdown: {}", id, e),
            }
        }

        let handles: Vec<(Uuid, TaskHandle)> = self.active_tasks.write().await.drain().collect();
        for (id, handle) in handles {
            handle.join_handle.abort();
            if let Err(e) = self.store.release_engine(id, self.instance_id).await {
                warn!("Failed to release engine claim of task {}: {}", id, e);
            }
        }

        info!("Paused {} tasks for shutdown", paused);
        Ok(paused)
    }

    /// Get count of engines running in this process
    pub async fn active_count(&self) -> usize {
        self.active_tasks.read().await.len()
    }

    /// Check if an engine for the task runs in this process
    pub async fn is_active(&self, id: Uuid) -> bool {
        self.active_tasks.read().await.contains_key(&id)
    }
}

/// Keep a task's engine claim fresh. Resolves only if the claim is lost.
async fn hold_claim(store: Arc<dyn TaskStore>, id: Uuid, owner: Uuid) -> RelayError {
    let mut heartbeat = tokio::time::interval(CLAIM_HEARTBEAT);
    heartbeat.tick().await;

    loop {
        heartbeat.tick().await;
        match store.heartbeat_engine(id, owner).await {
            Ok(true) => {}
            Ok(false) => return RelayError::ClaimLost(id),
            Err(e) => warn!("Failed to refresh engine claim of task {}: {}", id, e),
        }
    }
}
