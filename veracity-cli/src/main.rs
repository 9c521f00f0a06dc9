//! Veracity CLI: run research sessions, inspect stored ones, or serve the HTTP gateway.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;
use veracity_core::ResearchMode;

/// Veracity: multi-agent research with verified, cited reports
#[derive(Parser, Debug)]
#[command(name = "veracity", version, about, long_about = None)]
pub struct Cli {
    /// Workspace directory (reads .veracity/config.toml from here)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Override the session data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Research a question and print the report
    Research {
        query: String,
        /// quick, standard, or deep
        #[arg(short, long, default_value = "standard", value_parser = parse_mode)]
        mode: ResearchMode,
        /// Skip the debate phase even when contradictions are found
        #[arg(long)]
        no_debate: bool,
        /// Print raw events as JSON lines
        #[arg(long)]
        json: bool,
        /// Also write the report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List stored sessions, newest first
    Sessions,
    /// Show a session's state and counters
    Show { id: Uuid },
    /// Print a session's markdown report
    Report { id: Uuid },
    /// Print a session's knowledge graph as JSON
    Graph { id: Uuid },
    /// List a session's curated sources
    Sources { id: Uuid },
    /// List a session's claims
    Claims { id: Uuid },
    /// Delete a stored session
    Delete { id: Uuid },
    /// Serve the HTTP gateway
    Serve {
        /// Bind address (defaults to server.bind)
        #[arg(long)]
        addr: Option<String>,
    },
}

fn parse_mode(value: &str) -> Result<ResearchMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "quick" => Ok(ResearchMode::Quick),
        "standard" => Ok(ResearchMode::Standard),
        "deep" => Ok(ResearchMode::Deep),
        other => Err(format!("unknown mode '{other}' (expected quick, standard, or deep)")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "veracity", "veracity")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "veracity.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = veracity_core::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }

    commands::handle_command(cli.command, config).await
}
