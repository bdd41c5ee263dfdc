//! Resource usage sample queries

use anyhow::Result;
use tabled::Tabled;

use super::{format_timestamp, QueryFilter};
use crate::client::{ApiClient, Sample};
use crate::output::{color_percent, format_bytes, print_rows, short_id, OutputFormat};

#[derive(Tabled)]
struct SampleRow {
    #[tabled(rename = "Collected")]
    collected_at: String,
    #[tabled(rename = "Container")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Net RX/TX")]
    net: String,
    #[tabled(rename = "Block R/W")]
    block: String,
    #[tabled(rename = "PIDs")]
    pids: u64,
}

fn memory_cell(sample: &Sample) -> String {
    if sample.mem_limit_bytes == 0 {
        return format_bytes(sample.mem_usage_bytes);
    }
    format!(
        "{} / {} ({})",
        format_bytes(sample.mem_usage_bytes),
        format_bytes(sample.mem_limit_bytes),
        color_percent(sample.mem_percent)
    )
}

impl From<&Sample> for SampleRow {
    fn from(sample: &Sample) -> Self {
        Self {
            collected_at: format_timestamp(&sample.collected_at),
            id: short_id(&sample.workload_id),
            name: sample.workload_name.clone(),
            cpu: color_percent(sample.cpu_percent),
            memory: memory_cell(sample),
            net: format!(
                "{} / {}",
                format_bytes(sample.net_rx_bytes),
                format_bytes(sample.net_tx_bytes)
            ),
            block: format!(
                "{} / {}",
                format_bytes(sample.block_read_bytes),
                format_bytes(sample.block_write_bytes)
            ),
            pids: sample.process_count,
        }
    }
}

/// List stored samples
pub async fn list_stats(
    client: &ApiClient,
    filter: QueryFilter,
    format: OutputFormat,
) -> Result<()> {
    let query = filter.to_query(chrono::Utc::now())?;
    let samples: Vec<Sample> = client.get("api/v1/stats", &query).await?;

    print_rows(&samples, format, "No samples found", |s| SampleRow::from(s))
}
