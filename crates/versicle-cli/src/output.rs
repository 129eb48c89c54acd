//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use std::collections::BTreeMap;

use chrono::{Local, TimeZone};
use serde::Serialize;

use versicle_core::{CheckpointInfo, DiffResult};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print the checkpoint list, newest first
    pub fn print_checkpoints(&self, checkpoints: &[CheckpointInfo]) {
        match self.format {
            OutputFormat::Human => {
                if checkpoints.is_empty() {
                    println!("No checkpoints.");
                    return;
                }
                for cp in checkpoints {
                    println!(
                        "{:>4} | {} | {:<12} | {} KB",
                        cp.id,
                        format_timestamp(cp.timestamp),
                        truncate(&cp.trigger, 12),
                        cp.size
                    );
                }
                println!("\n{} checkpoint(s)", checkpoints.len());
            }
            OutputFormat::Json => self.print_json(checkpoints),
            OutputFormat::Quiet => {
                for cp in checkpoints {
                    println!("{}", cp.id);
                }
            }
        }
    }

    /// Print a per-container diff against a checkpoint
    pub fn print_diff(&self, id: i64, diff: &BTreeMap<String, DiffResult>) {
        match self.format {
            OutputFormat::Human => {
                println!("Changes since checkpoint {}:", id);
                let changed: Vec<_> = diff.iter().filter(|(_, d)| d.has_changes()).collect();
                if changed.is_empty() {
                    println!("  (none)");
                    return;
                }
                for (container, d) in changed {
                    println!();
                    println!(
                        "── {} ({} unchanged) ──",
                        container, d.unchanged_count
                    );
                    // Relative to the checkpoint: keys only in live were added since
                    for key in d.removed.keys() {
                        println!("  + {}", key);
                    }
                    for key in d.added.keys() {
                        println!("  - {}", key);
                    }
                    for key in d.modified.keys() {
                        println!("  ~ {}", key);
                    }
                }
            }
            OutputFormat::Json => self.print_json(diff),
            OutputFormat::Quiet => {
                for (container, d) in diff {
                    if d.has_changes() {
                        println!("{}", container);
                    }
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warning(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Format epoch milliseconds in local time
pub fn format_timestamp(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;

    let b = bytes as f64;
    if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("pré-synchronisé", 6), "pré...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_timestamp_out_of_range() {
        assert_eq!(format_timestamp(i64::MAX), i64::MAX.to_string());
    }
}
