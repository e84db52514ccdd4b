//! Scoreplane CLI: operator interface to the serving and governance control
//! plane.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Scoreplane: model serving, A/B routing and deployment governance
#[derive(Parser, Debug)]
#[command(name = "scoreplane", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or seed the model registry
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Run the validation battery against a Staging version
    Validate {
        /// Model name
        name: String,
        /// Model version
        version: u32,
        /// p95 latency SLA in milliseconds (defaults to the configured SLA)
        #[arg(long)]
        sla_ms: Option<f64>,
    },
    /// Promote a Staging version to Production
    Promote {
        /// Model name
        name: String,
        /// Model version
        version: u32,
        /// Who triggered the promotion
        #[arg(long, default_value = "cli")]
        by: String,
        /// Promote without running validation
        #[arg(long)]
        skip_validation: bool,
    },
    /// Restore the most recent Archived version to Production
    Rollback {
        /// Model name
        name: String,
        /// Who triggered the rollback
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Archive a Staging or Production version
    Archive {
        /// Model name
        name: String,
        /// Model version
        version: u32,
        /// Who triggered the change
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Move a registered version into Staging
    Stage {
        /// Model name
        name: String,
        /// Model version
        version: u32,
        /// Who triggered the change
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Show the deployment audit trail
    History {
        /// Only show records for this model
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Drive synthetic traffic through the control plane
    Simulate {
        /// Number of requests to send
        #[arg(short = 'n', long, default_value = "1000")]
        requests: usize,
        /// Percentage of traffic routed to the challenger
        #[arg(long)]
        challenger_pct: Option<f64>,
        /// Multiply the `amount` feature of live traffic (1.0 = no drift)
        #[arg(long, default_value = "1.0")]
        amount_scale: f64,
        /// Seed for synthetic traffic
        #[arg(long, default_value = "7")]
        seed: u64,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum RegistryAction {
    /// List registered versions
    List {
        /// Model name (defaults to the configured model)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Register demo models (v1 Production, v2 Staging) in an empty workspace
    Seed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "scoreplane", "scoreplane")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "scoreplane.log");
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

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
