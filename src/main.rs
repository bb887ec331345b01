use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use gansauditor_codex::{Config, GanAuditorServer};

/// GansAuditor_Codex MCP server: a synchronous, iterative, adversarial
/// code-audit workflow exposed as a single `audit` tool over stdio.
#[derive(Parser, Debug)]
#[command(name = "gansauditor-codex", version, about)]
struct Cli {
    /// Path to a YAML config file. Falls back to auto-detection
    /// (.gansauditor/config.yaml, gansauditor.yaml, .gansauditor.yaml,
    /// config/default.yaml) then built-in defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging to stderr.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("info") };
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    let server = match &cli.config {
        Some(path) => {
            let config = Config::load_with_env(Some(path))?;
            GanAuditorServer::with_config(config)
        }
        None => GanAuditorServer::new(),
    };

    info!("gansauditor-codex MCP server starting on stdio");

    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
