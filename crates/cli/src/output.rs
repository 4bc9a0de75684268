//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print rows as a rounded table, or a warning when there are none
pub fn print_rows<R: Tabled>(rows: Vec<R>, empty_message: &str) {
    if rows.is_empty() {
        print_warning(empty_message);
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}Gi", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Format an optional sample, "-" when the metric was never sampled
pub fn format_optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1}{}", v, unit),
        None => "-".to_string(),
    }
}

pub fn format_optional_bytes(value: Option<f64>) -> String {
    value
        .map(|v| format_bytes(v.max(0.0) as u64))
        .unwrap_or_else(|| "-".to_string())
}

/// Trim an RFC 3339 timestamp to seconds
pub fn format_timestamp(ts: Option<&str>) -> String {
    match ts {
        Some(ts) => ts.get(..19).unwrap_or(ts).replace('T', " "),
        None => "-".to_string(),
    }
}

/// Format confidence as percentage
pub fn format_confidence(confidence: f32) -> String {
    format!("{:.0}%", confidence * 100.0)
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "running" | "healthy" => status.green().to_string(),
        "pending" | "detecting" | "starting" | "unknown" => status.yellow().to_string(),
        "building" | "deploying" | "restarting" | "scaling" => status.blue().to_string(),
        "stopped" | "deleted" => status.dimmed().to_string(),
        "unhealthy" | "error" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Color event severity
pub fn color_severity(severity: &str) -> String {
    match severity {
        "error" => severity.red().to_string(),
        "warning" => severity.yellow().to_string(),
        _ => severity.to_string(),
    }
}

/// Color confidence based on value
pub fn color_confidence(confidence: f32) -> String {
    let formatted = format_confidence(confidence);
    if confidence >= 0.8 {
        formatted.green().to_string()
    } else if confidence >= 0.6 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50Ki");
        assert_eq!(format_bytes(256 * 1024 * 1024), "256.00Mi");
    }

    #[test]
    fn test_unsampled_values_render_as_dash() {
        assert_eq!(format_optional(None, "%"), "-");
        assert_eq!(format_optional(Some(12.345), "%"), "12.3%");
        assert_eq!(format_optional_bytes(None), "-");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(Some("2026-03-01T10:20:30.123456Z")),
            "2026-03-01 10:20:30"
        );
        assert_eq!(format_timestamp(None), "-");
    }
}
