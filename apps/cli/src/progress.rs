//! Progress bar utilities for running tasks

use crate::output::short_id;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use relayman_types::{CoreEvent, ForwardMode, Task, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Manages progress bars for multiple tasks
pub struct TaskProgress {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<Uuid, ProgressBar>>>,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a progress bar for a task, unless it already has one
    pub async fn add_task(&self, task: &Task) {
        let mut bars = self.bars.write().await;
        if bars.contains_key(&task.id) {
            return;
        }

        let pb = match task.mode {
            ForwardMode::Complete => {
                let pb = self.multi.add(ProgressBar::new(task.progress.total_messages));
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, {eta}) {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("█▓▒░  "),
                );
                pb
            }
            ForwardMode::Live => {
                let pb = self.multi.add(ProgressBar::new_spinner());
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} {prefix} [{elapsed_precise}] {pos} forwarded {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb.enable_steady_tick(std::time::Duration::from_millis(200));
                pb
            }
        };

        pb.set_prefix(format!(
            "{} {} → {}",
            style(short_id(&task.id)).dim(),
            task.source_channel,
            task.dest_channel
        ));
        pb.set_position(task.progress.forwarded_count);

        bars.insert(task.id, pb);
    }

    /// Update a progress bar from an event
    pub async fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::TaskAdded { task } => self.add_task(task).await,

            CoreEvent::TaskProgress {
                id,
                forwarded,
                total,
                ..
            } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    if pb.length().is_some() {
                        pb.set_length(*total);
                    }
                    pb.set_position(*forwarded);
                }
            }

            CoreEvent::TaskRateLimited { id, wait_seconds } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    pb.set_message(format!(
                        "{} rate limited, waiting {}s",
                        style("⏳").yellow(),
                        wait_seconds
                    ));
                }
            }

            CoreEvent::TaskMessageFailed {
                id,
                message_id,
                error,
            } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    pb.println(format!(
                        "{} message {} skipped: {}",
                        style("✗").red(),
                        message_id,
                        error
                    ));
                }
            }

            CoreEvent::TaskStatusChanged { id, status } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    match status {
                        TaskStatus::Running => pb.set_message(""),
                        TaskStatus::Paused => {
                            pb.set_message(format!("{} Paused", style("⏸").yellow()));
                        }
                        TaskStatus::Completed => {
                            pb.finish_with_message(format!(
                                "{} Completed",
                                style("✓").green().bold()
                            ));
                        }
                        TaskStatus::Error => {
                            pb.abandon_with_message(format!("{} Failed", style("✗").red().bold()));
                        }
                        TaskStatus::Stopped => {
                            pb.abandon_with_message(format!("{} Stopped", style("■").dim()));
                        }
                        TaskStatus::Deleted => {
                            pb.abandon_with_message(format!("{} Deleted", style("○").dim()));
                        }
                    }
                }
            }

            CoreEvent::TaskRemoved { id } => self.remove(*id).await,
        }
    }

    /// Remove a progress bar
    pub async fn remove(&self, id: Uuid) {
        if let Some(pb) = self.bars.write().await.remove(&id) {
            pb.finish_and_clear();
        }
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, pb) in self.bars.write().await.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self::new()
    }
}
