//! Daemon status and manual retention

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use tabled::Tabled;

use super::format_timestamp;
use crate::client::{ApiClient, PruneReport, StorageInfo};
use crate::output::{color_status, print_success, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

#[derive(Tabled)]
struct TierRow {
    #[tabled(rename = "Entity")]
    entity: &'static str,
    #[tabled(rename = "Tier 1 (unimportant)")]
    tier1: u64,
    #[tabled(rename = "Tier 2 (expired)")]
    tier2: u64,
}

/// Show component health and stored row counts
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;
    let storage: StorageInfo = client.get("api/v1/storage", &[]).await?;

    match format {
        OutputFormat::Json => {
            let combined = json!({ "health": health, "storage": storage });
            println!("{}", serde_json::to_string_pretty(&combined)?);
        }
        OutputFormat::Table => {
            println!("{}", "Container Monitor Status".bold());
            println!("{}", "=".repeat(50));
            println!("Overall:                {}", color_status(&health.status));
            println!();

            let rows: Vec<ComponentRow> = health
                .components
                .iter()
                .map(|(name, component)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&component.status),
                    message: component.message.clone().unwrap_or_else(|| "-".to_string()),
                    updated_at: format_timestamp(&component.updated_at),
                })
                .collect();
            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            println!();

            println!("{}", "Storage".bold());
            println!("{}", "-".repeat(50));
            println!("Samples:                {}", storage.stats);
            println!("Log records:            {}", storage.logs);
        }
    }

    Ok(())
}

/// Run a retention pass now and print what it deleted
pub async fn prune(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: PruneReport = client.post("api/v1/retention/prune").await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            let rows = vec![
                TierRow {
                    entity: "stats",
                    tier1: report.stats.tier1,
                    tier2: report.stats.tier2,
                },
                TierRow {
                    entity: "logs",
                    tier1: report.logs.tier1,
                    tier2: report.logs.tier2,
                },
            ];
            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);

            let total =
                report.stats.tier1 + report.stats.tier2 + report.logs.tier1 + report.logs.tier2;
            print_success(&format!(
                "Deleted {} rows in {} ms (cutoffs relative to {})",
                total,
                report.elapsed_ms,
                format_timestamp(&report.now)
            ));
        }
    }

    Ok(())
}
