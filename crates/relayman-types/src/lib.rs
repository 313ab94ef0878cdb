//! Shared types for Relayman
//!
//! This crate contains the data model shared between the forwarding
//! engine and the command-line front-end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Platform message identifier. Ids grow monotonically within a channel.
pub type MessageId = i64;

// ============================================================================
// Task Types
// ============================================================================

/// A forwarding job from one source channel to one destination channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Platform user id of the operator that created the task
    pub owner: i64,
    pub source_channel: String,
    pub dest_channel: String,
    pub auth_method: AuthMethod,
    pub mode: ForwardMode,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    /// Per-message failures, oldest first. Never cleared.
    #[serde(default)]
    pub error_log: Vec<ErrorLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        source_channel: String,
        dest_channel: String,
        auth_method: AuthMethod,
        mode: ForwardMode,
        owner: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            source_channel,
            dest_channel,
            auth_method,
            mode,
            status: TaskStatus::Running,
            progress: TaskProgress::new(now),
            error_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Completion percentage, only meaningful for complete-mode tasks
    pub fn percent(&self) -> f64 {
        match self.progress.total_messages {
            0 => 0.0,
            total => (self.progress.forwarded_count as f64 / total as f64) * 100.0,
        }
    }
}

/// Which transport connection executes a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    UserAccount,
    BotAccount,
}

impl AuthMethod {
    pub const ALL: [AuthMethod; 2] = [AuthMethod::UserAccount, AuthMethod::BotAccount];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::UserAccount => "user_account",
            AuthMethod::BotAccount => "bot_account",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user_account" | "user" => Ok(AuthMethod::UserAccount),
            "bot_account" | "bot" => Ok(AuthMethod::BotAccount),
            other => Err(format!("Unknown auth method: {}", other)),
        }
    }
}

/// Traversal strategy of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// One bounded pass over the existing backlog
    Complete,
    /// Unbounded tailing of new messages
    Live,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMode::Complete => "complete",
            ForwardMode::Live => "live",
        }
    }
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "complete" => Ok(ForwardMode::Complete),
            "live" => Ok(ForwardMode::Live),
            other => Err(format!("Unknown forward mode: {}", other)),
        }
    }
}

/// Which end of a forwarding task a saved channel is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Source,
    Dest,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Source, ChannelKind::Dest];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Source => "source",
            ChannelKind::Dest => "dest",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "source" | "src" => Ok(ChannelKind::Source),
            "dest" | "destination" => Ok(ChannelKind::Dest),
            other => Err(format!("Unknown channel kind: {}", other)),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Deleted => "DELETED",
        }
    }

    /// No operator transition leaves a terminal state, except deletion of a finished task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Deleted
        )
    }

    /// Whether an engine should keep its loop alive in this state
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Paused)
    }

    /// Edges of the task state machine
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Running, Paused | Stopped | Completed | Error | Deleted) => true,
            (Paused, Running | Stopped | Deleted) => true,
            (Stopped | Completed | Error, Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RUNNING" => Ok(TaskStatus::Running),
            "PAUSED" => Ok(TaskStatus::Paused),
            "STOPPED" => Ok(TaskStatus::Stopped),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "ERROR" => Ok(TaskStatus::Error),
            "DELETED" => Ok(TaskStatus::Deleted),
            other => Err(format!("Unknown task status: {}", other)),
        }
    }
}

/// Forwarding progress of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total_messages: u64,
    pub forwarded_count: u64,
    /// Resume cursor. Never decreases within a task's lifetime.
    pub last_forwarded_message_id: MessageId,
    pub last_forwarded_at: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub rate_limit_events: u64,
}

impl TaskProgress {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_messages: 0,
            forwarded_count: 0,
            last_forwarded_message_id: 0,
            last_forwarded_at: None,
            start_time,
            rate_limit_events: 0,
        }
    }
}

/// A progress snapshot written by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub forwarded_count: u64,
    pub total_messages: u64,
    pub last_forwarded_message_id: MessageId,
}

/// One recoverable failure recorded against a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A message as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Whether the message carries forwardable content
    pub has_content: bool,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Throughput profile of one connection class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitProfile {
    /// Seconds between sends in steady state
    pub base_delay: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    /// Sends between two batch cooldowns (0 disables)
    pub batch_size: u32,
    /// Seconds of extra pause after every `batch_size` sends
    pub batch_cooldown: f64,
    pub max_forwards_per_minute: u32,
    pub backoff_multiplier: f64,
}

impl RateLimitProfile {
    pub fn user_account() -> Self {
        Self {
            base_delay: 1.0,
            min_delay: 0.5,
            max_delay: 3.0,
            batch_size: 50,
            batch_cooldown: 10.0,
            max_forwards_per_minute: 40,
            backoff_multiplier: 2.0,
        }
    }

    pub fn bot_account() -> Self {
        Self {
            base_delay: 0.3,
            min_delay: 0.1,
            max_delay: 1.0,
            batch_size: 100,
            batch_cooldown: 5.0,
            max_forwards_per_minute: 80,
            backoff_multiplier: 1.5,
        }
    }

    pub fn for_auth_method(auth_method: AuthMethod) -> Self {
        match auth_method {
            AuthMethod::UserAccount => Self::user_account(),
            AuthMethod::BotAccount => Self::bot_account(),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Delivery attempts per message before it is logged and skipped
    pub max_retries: u32,
    /// Forwarded messages between two complete-mode checkpoints
    pub checkpoint_batch: u64,
    /// Seconds a paused engine sleeps between status polls
    pub live_poll_interval_secs: u64,
    /// Maximum age in seconds of the engine's cached task status
    pub status_refresh_secs: u64,
    /// Upper bound of the application-level retry backoff
    pub max_backoff_secs: u64,
    pub user_account: RateLimitProfile,
    pub bot_account: RateLimitProfile,
}

impl Settings {
    pub fn profile(&self, auth_method: AuthMethod) -> &RateLimitProfile {
        match auth_method {
            AuthMethod::UserAccount => &self.user_account,
            AuthMethod::BotAccount => &self.bot_account,
        }
    }

    pub fn live_poll_interval(&self) -> Duration {
        Duration::from_secs(self.live_poll_interval_secs.max(1))
    }

    pub fn status_refresh(&self) -> Duration {
        Duration::from_secs(self.status_refresh_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            checkpoint_batch: 100,
            live_poll_interval_secs: 5,
            status_refresh_secs: 5,
            max_backoff_secs: 300,
            user_account: RateLimitProfile::user_account(),
            bot_account: RateLimitProfile::bot_account(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to front-ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TaskAdded {
        task: Task,
    },
    TaskStatusChanged {
        id: Uuid,
        status: TaskStatus,
    },
    TaskProgress {
        id: Uuid,
        forwarded: u64,
        total: u64,
        last_message_id: MessageId,
    },
    TaskRateLimited {
        id: Uuid,
        wait_seconds: u64,
    },
    TaskMessageFailed {
        id: Uuid,
        message_id: MessageId,
        error: String,
    },
    TaskRemoved {
        id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_only_allow_delete() {
        for terminal in [TaskStatus::Completed, TaskStatus::Error] {
            assert!(terminal.can_transition_to(TaskStatus::Deleted));
            assert!(!terminal.can_transition_to(TaskStatus::Running));
            assert!(!terminal.can_transition_to(TaskStatus::Paused));
        }
        assert!(!TaskStatus::Deleted.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Deleted.can_transition_to(TaskStatus::Deleted));
    }

    #[test]
    fn test_pause_resume_edges() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Stopped.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let auth = serde_json::to_string(&AuthMethod::BotAccount).unwrap();
        assert_eq!(auth, "\"bot_account\"");
    }

    #[test]
    fn test_parse_auth_method_aliases() {
        assert_eq!("bot".parse::<AuthMethod>().unwrap(), AuthMethod::BotAccount);
        assert_eq!(
            "user_account".parse::<AuthMethod>().unwrap(),
            AuthMethod::UserAccount
        );
        assert!("sms".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn test_parse_channel_kind() {
        assert_eq!("destination".parse::<ChannelKind>().unwrap(), ChannelKind::Dest);
        assert_eq!(" Source ".parse::<ChannelKind>().unwrap(), ChannelKind::Source);
        assert!("sink".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_default_settings_profiles() {
        let settings = Settings::default();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.checkpoint_batch, 100);
        assert_eq!(settings.profile(AuthMethod::UserAccount).max_forwards_per_minute, 40);
        assert_eq!(settings.profile(AuthMethod::BotAccount).max_forwards_per_minute, 80);
    }
}
