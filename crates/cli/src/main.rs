mod config_commands;
mod db_commands;
mod jobs_commands;
mod send_commands;
mod worker;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    chatrelay_config::RelayConfig,
    chatrelay_dispatch::{DispatchQueue, RetentionPolicy, SqliteJobStore},
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "chatrelay", about = "Chatrelay: paced outbound delivery for chat gateways")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./chatrelay.toml and ~/.config/chatrelay/).
    #[arg(long, global = true, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch workers (default when no subcommand is provided).
    Worker(worker::WorkerArgs),
    /// Enqueue messages.
    Send {
        #[command(subcommand)]
        action: send_commands::SendAction,
    },
    /// Inspect and manage queued, finished and dead-lettered jobs.
    Jobs {
        #[command(subcommand)]
        action: jobs_commands::JobsAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Database management (migrate, reset).
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// File (explicit or discovered), then `CHATRELAY_*` overrides.
fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let config = match cli.config {
        Some(ref path) => chatrelay_config::load_config(path)?,
        None => chatrelay_config::discover_and_load(),
    };
    Ok(chatrelay_config::apply_env_overrides(config))
}

async fn open_queue(config: &RelayConfig) -> anyhow::Result<DispatchQueue> {
    let url = chatrelay_config::resolve_database_url(config);
    let store = SqliteJobStore::new(&url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open job database {url}"))?;
    Ok(DispatchQueue::new(Arc::new(store)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = load_config(&cli)?;
    info!(version = env!("CARGO_PKG_VERSION"), "chatrelay starting");

    match cli.command {
        None => worker::run(worker::WorkerArgs::default(), &config).await,
        Some(Commands::Worker(args)) => worker::run(args, &config).await,
        Some(Commands::Send { action }) => {
            let queue = open_queue(&config).await?;
            send_commands::handle_send(action, &queue).await
        },
        Some(Commands::Jobs { action }) => {
            let queue = open_queue(&config).await?;
            let retention = RetentionPolicy::from(&config.retention);
            jobs_commands::handle_jobs(action, &queue, &retention).await
        },
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, cli.config.as_deref(), &config)
        },
        Some(Commands::Db { action }) => db_commands::handle_db(action, &config).await,
    }
}
