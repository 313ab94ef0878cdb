//! CLI command implementations

use crate::output::{format_progress_bar, format_time_remaining, print_output, short_id};
use crate::progress::TaskProgress;
use crate::{ChannelAction, ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use console::style;
use relayman_core::{validate_settings, RelaymanCore};
use relayman_types::{AuthMethod, ChannelKind, ForwardMode, Settings, Task, TaskStatus};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

/// How often a serving process looks for RUNNING tasks without an engine
const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Error log entries shown by `status`
const ERROR_LOG_TAIL: usize = 10;

/// Resolve a full task id or a unique prefix of one
async fn resolve_task_id(core: &RelaymanCore, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let prefix = id.trim().to_lowercase();
    let matches: Vec<Uuid> = core
        .list_tasks(None)
        .await?
        .into_iter()
        .map(|t| t.id)
        .filter(|task_id| task_id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [single] => Ok(*single),
        [] => Err(anyhow!("No task matches {}", id)),
        _ => Err(anyhow!("Task id {} is ambiguous, use more characters", id)),
    }
}

/// Acknowledgement of an operator command
#[derive(Serialize)]
struct TaskAck {
    id: Uuid,
    status: TaskStatus,
}

impl fmt::Display for TaskAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Task {} is now {}",
            style("✓").green().bold(),
            short_id(&self.id),
            self.status
        )
    }
}

async fn acknowledge(core: &RelaymanCore, id: Uuid, format: OutputFormat) -> Result<()> {
    let task = core.get_task_status(id).await?;
    print_output(
        &TaskAck {
            id,
            status: task.status,
        },
        format,
    )
}

// ============================================================================
// Serving Commands
// ============================================================================

pub async fn run_daemon(core: &RelaymanCore, format: OutputFormat) -> Result<()> {
    let resumed = core.resume_all_on_startup().await?;
    info!("Resumed {} task(s)", resumed.len());
    serve(core, format).await
}

pub async fn start_task(
    core: &RelaymanCore,
    source: &str,
    dest: &str,
    auth: AuthMethod,
    mode: ForwardMode,
    owner: i64,
    format: OutputFormat,
) -> Result<()> {
    let id = core.start_task(source, dest, auth, mode, owner).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "id": id, "status": TaskStatus::Running }));
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Started {} task {} ({} → {})",
                style("✓").green().bold(),
                mode,
                style(id).cyan(),
                source,
                dest
            );
        }
    }

    serve(core, format).await
}

/// Render events and keep engines alive until Ctrl-C, then pause everything
async fn serve(core: &RelaymanCore, format: OutputFormat) -> Result<()> {
    let mut events = core.subscribe();
    let show_bars = !matches!(format, OutputFormat::Json);
    let progress = TaskProgress::new();

    if show_bars {
        for task in core.list_tasks(None).await? {
            if task.status == TaskStatus::Running && core.task_manager().is_active(task.id).await {
                progress.add_task(&task).await;
            }
        }
    }

    let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
    rescan.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }

            _ = rescan.tick() => {
                for id in core.resume_all_on_startup().await? {
                    info!("Picked up task {}", id);
                    if show_bars {
                        let task = core.get_task_status(id).await?;
                        progress.add_task(&task).await;
                    }
                }
            }

            event = events.recv() => match event {
                Ok(event) => {
                    if show_bars {
                        progress.handle_event(&event).await;
                    } else {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} progress events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let paused = core.pause_all_on_shutdown().await?;
    progress.clear().await;

    if show_bars {
        println!(
            "{} Paused {} task(s). Resume them with `relayman resume <id>`.",
            style("⏸").yellow(),
            paused
        );
    }

    Ok(())
}

// ============================================================================
// Task Commands
// ============================================================================

pub async fn list_tasks(
    core: &RelaymanCore,
    owner: Option<i64>,
    status_filter: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let status_filter: Option<TaskStatus> = status_filter
        .map(|s| s.parse().map_err(|e: String| anyhow!(e)))
        .transpose()?;

    let tasks: Vec<Task> = core
        .list_tasks(owner)
        .await?
        .into_iter()
        .filter(|t| status_filter.map_or(true, |status| t.status == status))
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TaskRow {
                id: String,
                source: String,
                dest: String,
                auth: String,
                mode: String,
                status: String,
                forwarded: String,
            }

            let rows: Vec<TaskRow> = tasks
                .iter()
                .map(|t| TaskRow {
                    id: short_id(&t.id),
                    source: t.source_channel.clone(),
                    dest: t.dest_channel.clone(),
                    auth: t.auth_method.to_string(),
                    mode: t.mode.to_string(),
                    status: t.status.to_string(),
                    forwarded: match t.mode {
                        ForwardMode::Complete => format!(
                            "{}/{}",
                            t.progress.forwarded_count, t.progress.total_messages
                        ),
                        ForwardMode::Live => t.progress.forwarded_count.to_string(),
                    },
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if tasks.is_empty() {
                println!("{}", style("No tasks found").dim());
                return Ok(());
            }

            for task in &tasks {
                print_task_summary(task);
            }
            println!();
            println!("{} task(s) total", style(tasks.len()).bold());
        }
    }

    Ok(())
}

fn status_icon(status: TaskStatus) -> console::StyledObject<&'static str> {
    match status {
        TaskStatus::Running => style("▶").cyan(),
        TaskStatus::Paused => style("⏸").yellow(),
        TaskStatus::Completed => style("✓").green(),
        TaskStatus::Error => style("✗").red(),
        TaskStatus::Stopped => style("■").dim(),
        TaskStatus::Deleted => style("○").dim(),
    }
}

fn print_task_summary(task: &Task) {
    let progress = match task.mode {
        ForwardMode::Complete => format_progress_bar(
            task.progress.forwarded_count,
            task.progress.total_messages,
            10,
        ),
        ForwardMode::Live => format!("{} forwarded", task.progress.forwarded_count),
    };

    println!(
        "{} {} {} → {} {} [{} {}]",
        status_icon(task.status),
        style(short_id(&task.id)).bold(),
        task.source_channel,
        task.dest_channel,
        style(&progress).dim(),
        style(task.mode).dim(),
        style(task.status).dim()
    );
}

pub async fn show_status(core: &RelaymanCore, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = resolve_task_id(core, id).await?;
    let task = core.get_task_status(uuid).await?;

    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    let progress = &task.progress;
    println!("{} Task {}", style("📊").bold(), style(task.id).bold());
    println!(
        "  {} → {} via {}",
        task.source_channel, task.dest_channel, task.auth_method
    );
    println!(
        "  Mode: {} | Status: {} {}",
        task.mode.as_str().to_uppercase(),
        status_icon(task.status),
        task.status
    );

    match task.mode {
        ForwardMode::Complete => {
            let elapsed = (Utc::now() - progress.start_time).num_seconds().max(0) as u64;
            println!(
                "  Progress: {}",
                format_progress_bar(progress.forwarded_count, progress.total_messages, 20)
            );
            println!(
                "  Forwarded: {} / {}",
                progress.forwarded_count, progress.total_messages
            );
            if task.status == TaskStatus::Running {
                println!(
                    "  Est. Time: {}",
                    format_time_remaining(
                        progress.forwarded_count,
                        progress.total_messages,
                        elapsed
                    )
                );
            }
        }
        ForwardMode::Live => {
            println!(
                "  Forwarded: {} of {} seen",
                progress.forwarded_count, progress.total_messages
            );
        }
    }

    println!("  Last message: {}", progress.last_forwarded_message_id);
    if let Some(at) = progress.last_forwarded_at {
        println!("  Last checkpoint: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  Rate limit events: {}", progress.rate_limit_events);

    if !task.error_log.is_empty() {
        println!();
        println!(
            "  {} {} error(s), most recent:",
            style("✗").red(),
            task.error_log.len()
        );
        let skip = task.error_log.len().saturating_sub(ERROR_LOG_TAIL);
        for entry in task.error_log.iter().skip(skip) {
            println!(
                "    {} {}",
                style(entry.timestamp.format("%H:%M:%S")).dim(),
                style(&entry.message).red()
            );
        }
    }

    Ok(())
}

pub async fn pause_task(core: &RelaymanCore, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = resolve_task_id(core, id).await?;
    core.pause_task(uuid).await?;
    acknowledge(core, uuid, format).await
}

pub async fn resume_task(core: &RelaymanCore, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = resolve_task_id(core, id).await?;
    core.resume_task(uuid).await?;
    acknowledge(core, uuid, format).await
}

pub async fn stop_task(core: &RelaymanCore, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = resolve_task_id(core, id).await?;
    core.stop_task(uuid).await?;
    acknowledge(core, uuid, format).await
}

pub async fn delete_task(
    core: &RelaymanCore,
    id: &str,
    purge: bool,
    skip_confirm: bool,
    format: OutputFormat,
) -> Result<()> {
    let uuid = resolve_task_id(core, id).await?;

    if !skip_confirm {
        use dialoguer::Confirm;

        let prompt = if purge {
            format!("Delete task {} and erase its record?", short_id(&uuid))
        } else {
            format!("Delete task {}?", short_id(&uuid))
        };
        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    core.delete_task(uuid, purge).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "id": uuid, "purged": purge }));
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{} Task deleted", style("✓").green().bold());
        }
    }
    Ok(())
}

// ============================================================================
// Channel Commands
// ============================================================================

pub async fn channel_action(
    core: &RelaymanCore,
    action: ChannelAction,
    format: OutputFormat,
) -> Result<()> {
    match action {
        ChannelAction::Add {
            kind,
            channel,
            owner,
        } => {
            let (channel, added) = core.add_channel(owner, kind, &channel).await?;
            if let OutputFormat::Json = format {
                println!(
                    "{}",
                    serde_json::json!({ "kind": kind, "channel": channel, "added": added })
                );
            } else if added {
                println!(
                    "{} Saved {} channel {}",
                    style("✓").green().bold(),
                    kind,
                    channel
                );
            } else {
                println!("{} {} is already saved", style("•").dim(), channel);
            }
        }

        ChannelAction::Remove {
            kind,
            channel,
            owner,
        } => {
            let removed = core.remove_channel(owner, kind, &channel).await?;
            if let OutputFormat::Json = format {
                println!(
                    "{}",
                    serde_json::json!({ "kind": kind, "channel": channel, "removed": removed })
                );
            } else if removed {
                println!("{} Removed {} channel {}", style("✓").green().bold(), kind, channel);
            } else {
                println!("{} {} was not saved", style("•").dim(), channel);
            }
        }

        ChannelAction::List { kind, owner } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => ChannelKind::ALL.to_vec(),
            };

            let mut saved = Vec::new();
            for kind in kinds {
                saved.push((kind, core.list_channels(owner, kind).await?));
            }

            match format {
                OutputFormat::Json => {
                    let listing: serde_json::Map<String, Value> = saved
                        .into_iter()
                        .map(|(kind, channels)| (kind.to_string(), serde_json::json!(channels)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&listing)?);
                }
                OutputFormat::Table => {
                    use tabled::{Table, Tabled};

                    #[derive(Tabled)]
                    struct ChannelRow {
                        kind: String,
                        channel: String,
                    }

                    let rows: Vec<ChannelRow> = saved
                        .iter()
                        .flat_map(|(kind, channels)| {
                            channels.iter().map(move |channel| ChannelRow {
                                kind: kind.to_string(),
                                channel: channel.clone(),
                            })
                        })
                        .collect();
                    println!("{}", Table::new(rows));
                }
                OutputFormat::Human => {
                    for (kind, channels) in &saved {
                        println!("{} channels:", style(kind).bold());
                        if channels.is_empty() {
                            println!("  {}", style("none saved").dim());
                        }
                        for (i, channel) in channels.iter().enumerate() {
                            println!("  {}. {}", i + 1, channel);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    core: &RelaymanCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.get_settings().await;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("Relayman Configuration:");
                    println!();
                    println!("  Max retries: {}", settings.max_retries);
                    println!("  Checkpoint batch: {}", settings.checkpoint_batch);
                    println!("  Live poll interval: {}s", settings.live_poll_interval_secs);
                    println!("  Status refresh: {}s", settings.status_refresh_secs);
                    println!("  Max backoff: {}s", settings.max_backoff_secs);
                    for auth in AuthMethod::ALL {
                        let profile = settings.profile(auth);
                        println!();
                        println!("  {}:", style(auth).bold());
                        println!(
                            "    Delay: {}s (min {}s, max {}s)",
                            profile.base_delay, profile.min_delay, profile.max_delay
                        );
                        println!(
                            "    Batch: {} sends, then {}s cooldown",
                            profile.batch_size, profile.batch_cooldown
                        );
                        println!(
                            "    Max forwards per minute: {}",
                            profile.max_forwards_per_minute
                        );
                        println!("    Backoff multiplier: {}", profile.backoff_multiplier);
                    }
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = core.get_settings().await;
            println!("{}", get_config_value(&settings, &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = set_config_value(&core.get_settings().await, &key, &value)?;
            core.update_settings(settings).await?;
            println!(
                "{} Config updated (applies to processes started from now on)",
                style("✓").green().bold()
            );
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                core.update_settings(Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

/// Read a dotted settings key such as `user_account.base_delay`
fn get_config_value(settings: &Settings, key: &str) -> Result<Value> {
    let value = serde_json::to_value(settings)?;
    key.split('.')
        .try_fold(&value, |node, part| node.get(part))
        .cloned()
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))
}

/// Return a copy of `settings` with a dotted key replaced by `raw`
fn set_config_value(settings: &Settings, key: &str, raw: &str) -> Result<Settings> {
    let mut value = serde_json::to_value(settings)?;
    let slot = key
        .split('.')
        .try_fold(&mut value, |node, part| node.get_mut(part))
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;

    if slot.is_object() {
        bail!("{} is a section, set one of its fields", key);
    }

    *slot = serde_json::from_str(raw).map_err(|_| anyhow!("Invalid value for {}: {}", key, raw))?;
    let settings: Settings =
        serde_json::from_value(value).map_err(|e| anyhow!("Invalid value for {}: {}", key, e))?;
    validate_settings(&settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_nested_config_value() {
        let settings = Settings::default();
        assert_eq!(get_config_value(&settings, "max_retries").unwrap(), 5);
        assert_eq!(
            get_config_value(&settings, "bot_account.max_forwards_per_minute").unwrap(),
            80
        );
        assert!(get_config_value(&settings, "user_account.nope").is_err());
    }

    #[test]
    fn test_set_config_value_checks_types() {
        let settings = Settings::default();

        let updated = set_config_value(&settings, "user_account.base_delay", "1.5").unwrap();
        assert_eq!(updated.user_account.base_delay, 1.5);

        assert!(set_config_value(&settings, "max_retries", "-1").is_err());
        assert!(set_config_value(&settings, "max_retries", "many").is_err());
        assert!(set_config_value(&settings, "bot_account", "3").is_err());
        assert!(set_config_value(&settings, "theme", "dark").is_err());
    }

    #[test]
    fn test_set_config_value_checks_ranges() {
        let settings = Settings::default();

        assert!(set_config_value(&settings, "user_account.batch_cooldown", "1e300").is_err());
        assert!(set_config_value(&settings, "bot_account.max_delay", "-1").is_err());
        assert!(set_config_value(&settings, "max_backoff_secs", "301").is_err());

        let updated = set_config_value(&settings, "max_backoff_secs", "300").unwrap();
        assert_eq!(updated.max_backoff_secs, 300);
    }
}
