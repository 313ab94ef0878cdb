//! Output formatting utilities

use crate::OutputFormat;
use serde::Serialize;

/// Print output in the specified format
pub fn print_output<T: Serialize + std::fmt::Display>(
    value: &T,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Text progress bar such as `████░░░░░░ 40.0%`
pub fn format_progress_bar(current: u64, total: u64, width: usize) -> String {
    let (percentage, filled) = if total == 0 {
        (0.0, 0)
    } else {
        let ratio = (current as f64 / total as f64).min(1.0);
        (ratio * 100.0, (ratio * width as f64) as usize)
    };

    format!(
        "{}{} {:.1}%",
        "█".repeat(filled),
        "░".repeat(width - filled),
        percentage
    )
}

/// Estimated time left at the average rate so far
pub fn format_time_remaining(current: u64, total: u64, elapsed_seconds: u64) -> String {
    if current == 0 || elapsed_seconds == 0 {
        return "calculating...".to_string();
    }
    if current >= total {
        return "done".to_string();
    }

    let rate = current as f64 / elapsed_seconds as f64;
    let remaining = ((total - current) as f64 / rate) as u64;
    format!("~{}", format_eta(remaining))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "—".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// First eight characters of an id, as shown in listings
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_bar() {
        assert_eq!(format_progress_bar(0, 0, 10), "░░░░░░░░░░ 0.0%");
        assert_eq!(format_progress_bar(4, 10, 10), "████░░░░░░ 40.0%");
        assert_eq!(format_progress_bar(12, 10, 4), "████ 100.0%");
    }

    #[test]
    fn test_time_remaining() {
        assert_eq!(format_time_remaining(0, 100, 60), "calculating...");
        assert_eq!(format_time_remaining(100, 100, 60), "done");
        // 50 messages in 100s leaves 50 more at the same pace
        assert_eq!(format_time_remaining(50, 100, 100), "~1m 40s");
        assert_eq!(format_time_remaining(1, 7201, 1), "~2h 0m");
    }
}
