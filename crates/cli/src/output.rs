//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print `items` as JSON, or as a table of `rows` built from them
pub fn print_rows<T, R, F>(
    items: &[T],
    format: OutputFormat,
    empty: &str,
    to_row: F,
) -> anyhow::Result<()>
where
    T: Serialize,
    R: Tabled,
    F: Fn(&T) -> R,
{
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items)?);
        }
        OutputFormat::Table => {
            if items.is_empty() {
                print_warning(empty);
                return Ok(());
            }
            let rows: Vec<R> = items.iter().map(to_row).collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
            println!("\nTotal: {}", items.len());
        }
    }
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
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

/// Percentage colored by how close it is to saturation
pub fn color_percent(value: f64) -> String {
    let formatted = format!("{:.1}%", value);
    if value >= 80.0 {
        formatted.red().to_string()
    } else if value >= 50.0 {
        formatted.yellow().to_string()
    } else {
        formatted.green().to_string()
    }
}

pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" => status.green().to_string(),
        "degraded" => status.yellow().to_string(),
        "unhealthy" => status.red().to_string(),
        _ => status.to_string(),
    }
}

pub fn color_level(level: Option<&str>) -> String {
    match level {
        Some(level @ ("ERROR" | "FATAL")) => level.red().bold().to_string(),
        Some(level @ "WARN") => level.yellow().to_string(),
        Some(level) => level.to_string(),
        None => "-".dimmed().to_string(),
    }
}

/// Short container id, as `docker ps` prints it
pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

/// Trim a message to `max` characters for table display
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}
