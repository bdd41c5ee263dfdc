pub mod logs;
pub mod stats;
pub mod status;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Filters shared by the stats and logs queries
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub id: Option<String>,
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: usize,
    pub desc: bool,
}

impl QueryFilter {
    /// Query pairs understood by the daemon, relative to `now`
    pub fn to_query(&self, now: DateTime<Utc>) -> Result<Vec<(&'static str, String)>> {
        let mut query = Vec::new();
        if let Some(id) = &self.id {
            query.push(("workload_id", id.clone()));
        }
        if let Some(name) = &self.name {
            query.push(("workload_name", name.clone()));
        }
        if let Some(since) = &self.since {
            query.push(("from", since_to_rfc3339(since, now)?));
        }
        if self.limit > 0 {
            query.push(("limit", self.limit.to_string()));
        }
        if self.desc {
            query.push(("desc", "true".to_string()));
        }
        Ok(query)
    }
}

/// Start of a `--since` window ending at `now`, as RFC 3339
pub fn since_to_rfc3339(since: &str, now: DateTime<Utc>) -> Result<String> {
    let window = humantime::parse_duration(since)
        .with_context(|| format!("Invalid --since value '{}'", since))?;
    let window = chrono::Duration::from_std(window).context("--since is too large")?;
    let from = now
        .checked_sub_signed(window)
        .context("--since is too large")?;
    Ok(from.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// RFC 3339 timestamp as `YYYY-MM-DD HH:MM:SS` UTC
pub fn format_timestamp(timestamp: &str) -> String {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}
