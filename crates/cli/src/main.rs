//! Container Monitor CLI
//!
//! Queries the samples and log records kept by the container monitor
//! daemon, shows its health and triggers retention passes.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{logs, stats, status, QueryFilter};

/// Container Monitor CLI
#[derive(Parser)]
#[command(name = "cmon")]
#[command(author, version, about = "CLI for the Container Monitor daemon", long_about = None)]
pub struct Cli {
    /// Daemon API endpoint (can also be set via CMON_ENDPOINT env var)
    #[arg(long, env = "CMON_ENDPOINT", default_value = "http://localhost:9464", global = true)]
    pub endpoint: String,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub output: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show stored resource usage samples
    Stats {
        /// Filter by container id
        #[arg(long)]
        id: Option<String>,

        /// Filter by container name
        #[arg(long)]
        name: Option<String>,

        /// Only samples newer than this (e.g., 15m, 1h, 7d)
        #[arg(long)]
        since: Option<String>,

        /// Maximum rows to return (daemon default when omitted)
        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// Newest first
        #[arg(long)]
        desc: bool,
    },

    /// Show stored log records
    Logs {
        /// Filter by container id
        #[arg(long)]
        id: Option<String>,

        /// Filter by container name
        #[arg(long)]
        name: Option<String>,

        /// Filter by level (error, warn, info, debug, fatal)
        #[arg(long)]
        level: Option<String>,

        /// Filter by stream (stdout, stderr)
        #[arg(long)]
        source: Option<String>,

        /// Only messages containing this text
        #[arg(long)]
        contains: Option<String>,

        /// Only records newer than this (e.g., 15m, 1h, 7d)
        #[arg(long)]
        since: Option<String>,

        /// Maximum rows to return (daemon default when omitted)
        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// Newest first
        #[arg(long)]
        desc: bool,
    },

    /// Show pipeline health and stored row counts
    Status,

    /// Run a retention pass now
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.endpoint)?;

    match cli.command {
        Commands::Stats {
            id,
            name,
            since,
            limit,
            desc,
        } => {
            let filter = QueryFilter {
                id,
                name,
                since,
                limit,
                desc,
            };
            stats::list_stats(&client, filter, cli.output).await?;
        }
        Commands::Logs {
            id,
            name,
            level,
            source,
            contains,
            since,
            limit,
            desc,
        } => {
            let filter = QueryFilter {
                id,
                name,
                since,
                limit,
                desc,
            };
            let log_filter = logs::LogFilter {
                level,
                source,
                contains,
            };
            logs::list_logs(&client, filter, log_filter, cli.output).await?;
        }
        Commands::Status => {
            status::show_status(&client, cli.output).await?;
        }
        Commands::Prune => {
            status::prune(&client, cli.output).await?;
        }
    }

    Ok(())
}
