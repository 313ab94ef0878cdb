//! Task record persistence
//!
//! `TaskStore` is the storage seam the engine and task manager talk to.
//! `SqliteTaskStore` keeps tasks and their error log in a relational database.

use crate::error::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayman_types::{
    AuthMethod, ChannelKind, Checkpoint, ErrorLogEntry, ForwardMode, Task, TaskProgress,
    TaskStatus,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow},
    Row,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Persistent store for task records
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task record
    async fn create_task(&self, task: &Task) -> Result<(), RelayError>;

    /// Load a task with its error log
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, RelayError>;

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), RelayError>;

    /// Set `status` only while the stored status is one of `expected`.
    /// Returns whether the write happened.
    async fn update_status_if(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        status: TaskStatus,
    ) -> Result<bool, RelayError>;

    /// Write a progress checkpoint. The resume cursor never moves backwards.
    async fn update_progress(&self, id: Uuid, checkpoint: Checkpoint) -> Result<(), RelayError>;

    /// Count one transport throttle signal against the task
    async fn record_rate_limit_event(&self, id: Uuid) -> Result<(), RelayError>;

    /// Append to the task's error log
    async fn append_error_log(&self, id: Uuid, message: &str) -> Result<(), RelayError>;

    /// Tasks that are RUNNING or PAUSED
    async fn list_active_tasks(&self) -> Result<Vec<Task>, RelayError>;

    async fn list_tasks_by_owner(&self, owner: i64) -> Result<Vec<Task>, RelayError>;

    async fn list_all_tasks(&self) -> Result<Vec<Task>, RelayError>;

    /// Remove a task record and its error log
    async fn delete_task(&self, id: Uuid) -> Result<(), RelayError>;

    /// Take the right to run the task's engine for `owner`. Succeeds when the
    /// task is unclaimed, already held by `owner`, or its holder has not
    /// heartbeated within `stale_after`.
    async fn claim_engine(
        &self,
        id: Uuid,
        owner: Uuid,
        stale_after: Duration,
    ) -> Result<bool, RelayError>;

    /// Refresh a held claim. Returns false once `owner` no longer holds it.
    async fn heartbeat_engine(&self, id: Uuid, owner: Uuid) -> Result<bool, RelayError>;

    /// Give up a claim held by `owner`
    async fn release_engine(&self, id: Uuid, owner: Uuid) -> Result<(), RelayError>;

    /// Save a channel for later use. Returns false if it was already saved.
    async fn add_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<bool, RelayError>;

    /// Forget a saved channel. Returns false if it was not saved.
    async fn remove_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<bool, RelayError>;

    /// Saved channels of one owner, oldest first
    async fn list_channels(&self, owner: i64, kind: ChannelKind)
        -> Result<Vec<String>, RelayError>;
}

/// SQLite-backed task store
#[derive(Clone, Debug)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, RelayError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner INTEGER NOT NULL,
                source_channel TEXT NOT NULL,
                dest_channel TEXT NOT NULL,
                auth_method TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                total_messages INTEGER NOT NULL DEFAULT 0,
                forwarded_count INTEGER NOT NULL DEFAULT 0,
                last_forwarded_message_id INTEGER NOT NULL DEFAULT 0,
                last_forwarded_at TEXT,
                start_time TEXT NOT NULL,
                rate_limit_events INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                engine_owner TEXT,
                engine_heartbeat INTEGER
            );

            CREATE TABLE IF NOT EXISTS task_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS saved_channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner INTEGER NOT NULL,
                kind TEXT NOT NULL,
                channel TEXT NOT NULL,
                added_at TEXT NOT NULL,
                UNIQUE (owner, kind, channel)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner);
            CREATE INDEX IF NOT EXISTS idx_task_errors_task ON task_errors(task_id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Load error logs for the given task rows, grouped by task id
    async fn load_error_logs(
        &self,
        rows: &[SqliteRow],
    ) -> Result<HashMap<String, Vec<ErrorLogEntry>>, RelayError> {
        let mut logs: HashMap<String, Vec<ErrorLogEntry>> = HashMap::new();
        if rows.is_empty() {
            return Ok(logs);
        }

        let ids: Vec<String> = rows.iter().map(|row| row.get::<String, _>("id")).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT task_id, message, timestamp FROM task_errors WHERE task_id IN ({}) ORDER BY id",
            placeholders
        );

        let mut error_query = sqlx::query(&query);
        for id in &ids {
            error_query = error_query.bind(id);
        }

        for row in error_query.fetch_all(&self.pool).await? {
            let task_id: String = row.get("task_id");
            let entry = ErrorLogEntry {
                message: row.get("message"),
                timestamp: parse_timestamp(&row.get::<String, _>("timestamp"))?,
            };
            logs.entry(task_id).or_default().push(entry);
        }

        Ok(logs)
    }

    async fn rows_to_tasks(&self, rows: Vec<SqliteRow>) -> Result<Vec<Task>, RelayError> {
        let mut logs = self.load_error_logs(&rows).await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let error_log = logs.remove(&id).unwrap_or_default();
            tasks.push(row_to_task(row, error_log)?);
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(&self, task: &Task) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, owner, source_channel, dest_channel, auth_method, mode, status,
                total_messages, forwarded_count, last_forwarded_message_id,
                last_forwarded_at, start_time, rate_limit_events, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.owner)
        .bind(&task.source_channel)
        .bind(&task.dest_channel)
        .bind(task.auth_method.as_str())
        .bind(task.mode.as_str())
        .bind(task.status.as_str())
        .bind(task.progress.total_messages as i64)
        .bind(task.progress.forwarded_count as i64)
        .bind(task.progress.last_forwarded_message_id)
        .bind(task.progress.last_forwarded_at.map(|d| d.to_rfc3339()))
        .bind(task.progress.start_time.to_rfc3339())
        .bind(task.progress.rate_limit_events as i64)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, RelayError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(self.rows_to_tasks(vec![row]).await?.pop())
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), RelayError> {
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_status_if(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        status: TaskStatus,
    ) -> Result<bool, RelayError> {
        if expected.is_empty() {
            return Ok(false);
        }

        let placeholders = expected.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );

        let mut update = sqlx::query(&query)
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string());
        for current in expected {
            update = update.bind(current.as_str());
        }

        let result = update.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(&self, id: Uuid, checkpoint: Checkpoint) -> Result<(), RelayError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE tasks
            SET forwarded_count = ?,
                total_messages = ?,
                last_forwarded_message_id = MAX(last_forwarded_message_id, ?),
                last_forwarded_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(checkpoint.forwarded_count as i64)
        .bind(checkpoint.total_messages as i64)
        .bind(checkpoint.last_forwarded_message_id)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_rate_limit_event(&self, id: Uuid) -> Result<(), RelayError> {
        sqlx::query(
            "UPDATE tasks SET rate_limit_events = rate_limit_events + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_error_log(&self, id: Uuid, message: &str) -> Result<(), RelayError> {
        sqlx::query("INSERT INTO task_errors (task_id, message, timestamp) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(message)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_active_tasks(&self) -> Result<Vec<Task>, RelayError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status IN ('RUNNING', 'PAUSED') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        self.rows_to_tasks(rows).await
    }

    async fn list_tasks_by_owner(&self, owner: i64) -> Result<Vec<Task>, RelayError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE owner = ? ORDER BY created_at DESC")
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;

        self.rows_to_tasks(rows).await
    }

    async fn list_all_tasks(&self) -> Result<Vec<Task>, RelayError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        self.rows_to_tasks(rows).await
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), RelayError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM task_errors WHERE task_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_engine(
        &self,
        id: Uuid,
        owner: Uuid,
        stale_after: Duration,
    ) -> Result<bool, RelayError> {
        let now = Utc::now().timestamp_millis();
        let stale_before = now - stale_after.as_millis() as i64;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET engine_owner = ?, engine_heartbeat = ?
            WHERE id = ?
              AND (engine_owner IS NULL OR engine_owner = ? OR engine_heartbeat < ?)
            "#,
        )
        .bind(owner.to_string())
        .bind(now)
        .bind(id.to_string())
        .bind(owner.to_string())
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat_engine(&self, id: Uuid, owner: Uuid) -> Result<bool, RelayError> {
        let result =
            sqlx::query("UPDATE tasks SET engine_heartbeat = ? WHERE id = ? AND engine_owner = ?")
                .bind(Utc::now().timestamp_millis())
                .bind(id.to_string())
                .bind(owner.to_string())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_engine(&self, id: Uuid, owner: Uuid) -> Result<(), RelayError> {
        sqlx::query(
            "UPDATE tasks SET engine_owner = NULL, engine_heartbeat = NULL WHERE id = ? AND engine_owner = ?",
        )
        .bind(id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO saved_channels (owner, kind, channel, added_at) VALUES (?, ?, ?, ?)",
        )
        .bind(owner)
        .bind(kind.as_str())
        .bind(channel)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_channel(
        &self,
        owner: i64,
        kind: ChannelKind,
        channel: &str,
    ) -> Result<bool, RelayError> {
        let result =
            sqlx::query("DELETE FROM saved_channels WHERE owner = ? AND kind = ? AND channel = ?")
                .bind(owner)
                .bind(kind.as_str())
                .bind(channel)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_channels(
        &self,
        owner: i64,
        kind: ChannelKind,
    ) -> Result<Vec<String>, RelayError> {
        let channels = sqlx::query_scalar::<_, String>(
            "SELECT channel FROM saved_channels WHERE owner = ? AND kind = ? ORDER BY id",
        )
        .bind(owner)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(channels)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RelayError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RelayError::Serialization(e.to_string()))
}

/// Convert a database row to a Task
fn row_to_task(row: SqliteRow, error_log: Vec<ErrorLogEntry>) -> Result<Task, RelayError> {
    let auth_method: AuthMethod = row
        .get::<String, _>("auth_method")
        .parse()
        .map_err(RelayError::Serialization)?;
    let mode: ForwardMode = row
        .get::<String, _>("mode")
        .parse()
        .map_err(RelayError::Serialization)?;
    let status: TaskStatus = row
        .get::<String, _>("status")
        .parse()
        .map_err(RelayError::Serialization)?;

    Ok(Task {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| RelayError::Serialization(e.to_string()))?,
        owner: row.get("owner"),
        source_channel: row.get("source_channel"),
        dest_channel: row.get("dest_channel"),
        auth_method,
        mode,
        status,
        progress: TaskProgress {
            total_messages: row.get::<i64, _>("total_messages") as u64,
            forwarded_count: row.get::<i64, _>("forwarded_count") as u64,
            last_forwarded_message_id: row.get("last_forwarded_message_id"),
            last_forwarded_at: row
                .get::<Option<String>, _>("last_forwarded_at")
                .and_then(|s| parse_timestamp(&s).ok()),
            start_time: parse_timestamp(&row.get::<String, _>("start_time"))?,
            rate_limit_events: row.get::<i64, _>("rate_limit_events") as u64,
        },
        error_log,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, SqliteTaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::new(dir.path().join("tasks.db")).await.unwrap();
        (dir, store)
    }

    fn sample_task(owner: i64) -> Task {
        Task::new(
            "@source".to_string(),
            "-1001234567890".to_string(),
            AuthMethod::UserAccount,
            ForwardMode::Complete,
            owner,
        )
    }

    #[tokio::test]
    async fn test_create_and_load_task() {
        let (_dir, store) = open_store().await;
        let task = sample_task(7);
        store.create_task(&task).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.source_channel, "@source");
        assert_eq!(loaded.auth_method, AuthMethod::UserAccount);
        assert_eq!(loaded.mode, ForwardMode::Complete);
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.error_log.is_empty());

        assert!(store.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let (_dir, store) = open_store().await;
        let task = sample_task(1);
        store.create_task(&task).await.unwrap();

        let forward = Checkpoint {
            forwarded_count: 10,
            total_messages: 50,
            last_forwarded_message_id: 120,
        };
        store.update_progress(task.id, forward).await.unwrap();
        let stale = Checkpoint {
            forwarded_count: 11,
            total_messages: 50,
            last_forwarded_message_id: 90,
        };
        store.update_progress(task.id, stale).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress.last_forwarded_message_id, 120);
        assert_eq!(loaded.progress.forwarded_count, 11);
        assert!(loaded.progress.last_forwarded_at.is_some());
    }

    #[tokio::test]
    async fn test_error_log_is_ordered_and_append_only() {
        let (_dir, store) = open_store().await;
        let task = sample_task(1);
        store.create_task(&task).await.unwrap();

        store.append_error_log(task.id, "first").await.unwrap();
        store.append_error_log(task.id, "second").await.unwrap();
        store.record_rate_limit_event(task.id).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        let messages: Vec<_> = loaded.error_log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(loaded.progress.rate_limit_events, 1);
    }

    #[tokio::test]
    async fn test_list_active_and_by_owner() {
        let (_dir, store) = open_store().await;
        let running = sample_task(1);
        let paused = sample_task(1);
        let finished = sample_task(2);
        for task in [&running, &paused, &finished] {
            store.create_task(task).await.unwrap();
        }
        store.update_status(paused.id, TaskStatus::Paused).await.unwrap();
        store.update_status(finished.id, TaskStatus::Completed).await.unwrap();

        let active: Vec<Uuid> = store
            .list_active_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&running.id) && active.contains(&paused.id));

        assert_eq!(store.list_tasks_by_owner(1).await.unwrap().len(), 2);
        assert_eq!(store.list_tasks_by_owner(2).await.unwrap().len(), 1);
        assert_eq!(store.list_all_tasks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_conditional_status_update() {
        let (_dir, store) = open_store().await;
        let task = sample_task(1);
        store.create_task(&task).await.unwrap();
        store.update_status(task.id, TaskStatus::Deleted).await.unwrap();

        let written = store
            .update_status_if(task.id, &[TaskStatus::Running], TaskStatus::Completed)
            .await
            .unwrap();
        assert!(!written);
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Deleted);

        store.update_status(task.id, TaskStatus::Running).await.unwrap();
        assert!(store
            .update_status_if(
                task.id,
                &[TaskStatus::Running, TaskStatus::Paused],
                TaskStatus::Stopped
            )
            .await
            .unwrap());
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn test_engine_claim_is_exclusive_until_stale() {
        let (_dir, store) = open_store().await;
        let task = sample_task(1);
        store.create_task(&task).await.unwrap();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let ttl = Duration::from_secs(60);

        assert!(store.claim_engine(task.id, first, ttl).await.unwrap());
        assert!(store.claim_engine(task.id, first, ttl).await.unwrap());
        assert!(!store.claim_engine(task.id, second, ttl).await.unwrap());
        assert!(store.heartbeat_engine(task.id, first).await.unwrap());
        assert!(!store.heartbeat_engine(task.id, second).await.unwrap());

        // A holder that stopped heartbeating loses the claim
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .claim_engine(task.id, second, Duration::from_millis(1))
            .await
            .unwrap());
        assert!(!store.heartbeat_engine(task.id, first).await.unwrap());

        store.release_engine(task.id, first).await.unwrap();
        assert!(!store.claim_engine(task.id, first, ttl).await.unwrap());
        store.release_engine(task.id, second).await.unwrap();
        assert!(store.claim_engine(task.id, first, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_saved_channels_per_owner_and_kind() {
        let (_dir, store) = open_store().await;

        assert!(store.add_channel(1, ChannelKind::Source, "@news").await.unwrap());
        assert!(store.add_channel(1, ChannelKind::Source, "@sport").await.unwrap());
        assert!(!store.add_channel(1, ChannelKind::Source, "@news").await.unwrap());
        assert!(store.add_channel(1, ChannelKind::Dest, "@news").await.unwrap());
        assert!(store.add_channel(2, ChannelKind::Source, "@other").await.unwrap());

        assert_eq!(
            store.list_channels(1, ChannelKind::Source).await.unwrap(),
            vec!["@news", "@sport"]
        );
        assert_eq!(
            store.list_channels(1, ChannelKind::Dest).await.unwrap(),
            vec!["@news"]
        );

        assert!(store.remove_channel(1, ChannelKind::Source, "@news").await.unwrap());
        assert!(!store.remove_channel(1, ChannelKind::Source, "@news").await.unwrap());
        assert_eq!(
            store.list_channels(1, ChannelKind::Source).await.unwrap(),
            vec!["@sport"]
        );
        assert!(store.list_channels(3, ChannelKind::Dest).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_errors() {
        let (_dir, store) = open_store().await;
        let task = sample_task(1);
        store.create_task(&task).await.unwrap();
        store.append_error_log(task.id, "boom").await.unwrap();

        store.delete_task(task.id).await.unwrap();
        assert!(store.get_task(task.id).await.unwrap().is_none());
    }
}
