//! Relayman Core - Forwarding Task Engine
//!
//! This crate provides the core forwarding functionality for Relayman.
//! It paces sends per connection class, retries failed forwards, keeps a
//! resumable progress cursor per task and coordinates task lifecycles.

pub mod engine;
mod error;
mod storage;
mod validation;

pub use engine::{
    BotApiTransport, Connections, MemoryTaskStore, MemoryTransport, SqliteTaskStore, TaskManager,
    TaskStore, Transport,
};
pub use error::*;
pub use storage::*;
pub use validation::*;

use relayman_types::{AuthMethod, ChannelKind, CoreEvent, ForwardMode, Settings, Task};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;
use uuid::Uuid;

/// The main Relayman core instance
pub struct RelaymanCore {
    /// Engine settings as loaded at startup
    pub settings: Arc<RwLock<Settings>>,
    /// Data directory storage, absent for embedded in-memory cores
    storage: Option<Storage>,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    /// Task manager
    task_manager: Arc<TaskManager>,
}

impl RelaymanCore {
    /// Open the core on a data directory with the given connections
    pub async fn new(data_dir: PathBuf, connections: Connections) -> Result<Self, RelayError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        let store = SqliteTaskStore::new(storage.database_path()).await?;

        info!("Opened data directory {}", storage.data_dir().display());

        let mut core = Self::with_store(settings, Arc::new(store), connections);
        core.storage = Some(storage);
        Ok(core)
    }

    /// Build a core on top of any task store
    pub fn with_store(
        settings: Settings,
        store: Arc<dyn TaskStore>,
        connections: Connections,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        let task_manager = Arc::new(TaskManager::new(
            store,
            connections,
            &settings,
            event_tx.clone(),
        ));

        Self {
            settings: Arc::new(RwLock::new(settings)),
            storage: None,
            event_tx,
            task_manager,
        }
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Create a task and start forwarding
    pub async fn start_task(
        &self,
        source_channel: &str,
        dest_channel: &str,
        auth_method: AuthMethod,
        mode: ForwardMode,
        owner: i64,
    ) -> Result<Uuid, RelayError> {
        self.task_manager
            .start_task(source_channel, dest_channel, auth_method, mode, owner)
            .await
    }

    pub async fn pause_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.task_manager.pause_task(id).await
    }

    pub async fn resume_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.task_manager.resume_task(id).await
    }

    pub async fn stop_task(&self, id: Uuid) -> Result<(), RelayError> {
        self.task_manager.stop_task(id).await
    }

    /// Delete a task; with `purge` its record is erased as well
    pub async fn delete_task(&self, id: Uuid, purge: bool) -> Result<(), RelayError> {
        if purge {
            self.task_manager.purge_task(id).await
        } else {
            self.task_manager.delete_task(id).await
        }
    }

    pub async fn get_task_status(&self, id: Uuid) -> Result<Task, RelayError> {
        self.task_manager.get_task_status(id).await
    }

    pub async fn list_tasks(&self, owner: Option<i64>) -> Result<Vec<Task>, RelayError> {
        self.task_manager.list_tasks(owner).await
    }

    /// Pick up RUNNING tasks without an engine in this process
    pub async fn resume_all_on_startup(&self) -> Result<Vec<Uuid>, RelayError> {
        self.task_manager.resume_all_on_startup().await
    }

    pub async fn pause_all_on_shutdown(&self) -> Result<usize, RelayError> {
        self.task_manager.pause_all_on_shutdown().await
    }

    // ========================================================================
    // Saved Channel Operations
    // ========================================================================

    /// Save a channel to an owner's source or destination list.
    /// Returns the stored form and whether it was newly added.
    pub async fn add_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<(String, bool), RelayError> {
        let channel = validate_channel_identifier(channel)?;
        let added = self
            .task_manager
            .store()
            .add_channel(owner, kind, &channel)
            .await?;
        if added {
            info!("Saved {} channel {} for owner {}", kind, channel, owner);
        }
        Ok((channel, added))
    }

    /// Remove a saved channel. Returns whether it was saved.
    pub async fn remove_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<bool, RelayError> {
        let channel = validate_channel_identifier(channel)?;
        self.task_manager
            .store()
            .remove_channel(owner, kind, &channel)
            .await
    }

    pub async fn list_channels(
        &self,
        owner: i64,
        kind: ChannelKind,
    ) -> Result<Vec<String>, RelayError> {
        self.task_manager.store().list_channels(owner, kind).await
    }

    // ========================================================================
    // Settings Operations
    // ========================================================================

    /// Get current settings
    pub async fn get_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Validate and persist new settings. Rate limit profiles and engine
    /// tunables apply to cores opened afterwards.
    pub async fn update_settings(&self, settings: Settings) -> Result<(), RelayError> {
        validate_settings(&settings)?;
        if let Some(storage) = &self.storage {
            storage.save_settings(&settings).await?;
        }
        *self.settings.write().await = settings;
        Ok(())
    }
}
