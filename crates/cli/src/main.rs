mod config_commands;
mod db_commands;
mod queue_commands;
mod rate_commands;
mod run_command;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Durable ingestion pipeline for chat messages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./switchboard.toml and
    /// ~/.config/switchboard/).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker pool and admit JSON events read from stdin.
    Run(run_command::RunArgs),
    /// Inspect and operate on the work queue.
    Queue {
        #[command(subcommand)]
        action: queue_commands::QueueAction,
    },
    /// Inspect or override outbound rate limits.
    Rate {
        #[command(subcommand)]
        action: rate_commands::RateAction,
    },
    /// Configuration inspection and validation.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Database management.
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output and outbound replies.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Render epoch milliseconds as a UTC timestamp.
pub(crate) fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = switchboard_config::load_or_discover(cli.config.as_deref())?;
    debug!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    match cli.command {
        Commands::Run(args) => run_command::run(&config, args).await,
        Commands::Queue { action } => queue_commands::handle_queue(&config, action).await,
        Commands::Rate { action } => rate_commands::handle_rate(&config, action).await,
        Commands::Config { action } => config_commands::handle_config(&config, action),
        Commands::Db { action } => db_commands::handle_db(&config, action).await,
    }
}
