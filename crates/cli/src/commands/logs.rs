//! Log record queries

use anyhow::Result;
use tabled::Tabled;

use super::{format_timestamp, QueryFilter};
use crate::client::{ApiClient, LogLine};
use crate::output::{color_level, print_rows, short_id, truncate, OutputFormat};

const MESSAGE_WIDTH: usize = 80;

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Container")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Stream")]
    source: String,
    #[tabled(rename = "Level")]
    level: String,
    #[tabled(rename = "Message")]
    message: String,
}

impl From<&LogLine> for LogRow {
    fn from(line: &LogLine) -> Self {
        Self {
            timestamp: format_timestamp(&line.timestamp),
            id: short_id(&line.workload_id),
            name: line.workload_name.clone(),
            source: line.source.clone(),
            level: color_level(line.level.as_deref()),
            message: truncate(&line.message, MESSAGE_WIDTH),
        }
    }
}

/// Log-only filters on top of the shared ones
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<String>,
    pub source: Option<String>,
    pub contains: Option<String>,
}

/// List stored log records
pub async fn list_logs(
    client: &ApiClient,
    filter: QueryFilter,
    log_filter: LogFilter,
    format: OutputFormat,
) -> Result<()> {
    let mut query = filter.to_query(chrono::Utc::now())?;
    if let Some(level) = log_filter.level {
        query.push(("level", level.to_lowercase()));
    }
    if let Some(source) = log_filter.source {
        query.push(("source", source.to_lowercase()));
    }
    if let Some(contains) = log_filter.contains {
        query.push(("contains", contains));
    }

    let lines: Vec<LogLine> = client.get("api/v1/logs", &query).await?;

    print_rows(&lines, format, "No log records found", |l| LogRow::from(l))
}
