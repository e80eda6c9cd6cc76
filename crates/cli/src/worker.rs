use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    chatrelay_config::RelayConfig,
    chatrelay_dispatch::{
        DispatchEvent, Dispatcher, DispatcherOptions, EventFn, SqliteJobStore, SqliteLockManager,
        SqliteThrottle,
    },
    chatrelay_metrics::{MetricsRecorderConfig, init_metrics},
    chatrelay_transport::{GatewayConfig, GatewayTransport, MessageTransport, RecordingTransport},
    clap::Args,
    tracing::{debug, info, warn},
};

#[derive(Args, Default)]
pub struct WorkerArgs {
    /// Record sends instead of calling the gateway.
    #[arg(long)]
    dry_run: bool,
    /// Override `dispatch.workers`.
    #[arg(long)]
    workers: Option<usize>,
    /// Write Prometheus metrics to this file on shutdown.
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

/// Run the dispatcher until Ctrl-C.
pub async fn run(args: WorkerArgs, config: &RelayConfig) -> Result<()> {
    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        ..Default::default()
    })?;

    let url = chatrelay_config::resolve_database_url(config);
    let store = SqliteJobStore::new(&url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open job database {url}"))?;
    let pool = store.pool().clone();
    let locks = Arc::new(SqliteLockManager::new(pool.clone()));
    let throttle = Arc::new(SqliteThrottle::new(
        pool,
        config.dispatch.max_concurrent_per_account,
    ));

    let transport: Arc<dyn MessageTransport> = if args.dry_run {
        info!("dry run: sends are recorded, not delivered");
        Arc::new(RecordingTransport::new())
    } else {
        Arc::new(GatewayTransport::new(GatewayConfig {
            base_url: config.gateway.base_url.clone(),
            api_key: config.gateway.api_key.clone(),
            timeout: Duration::from_secs(config.gateway.timeout_secs),
        })?)
    };

    let mut options = DispatcherOptions::from(config);
    if let Some(workers) = args.workers {
        options.workers = workers;
    }

    let dispatcher = Dispatcher::with_events(
        Arc::new(store),
        locks,
        throttle,
        transport,
        options,
        Some(log_events()),
    );
    info!(database = %url, gateway = %config.gateway.base_url, "worker starting");
    dispatcher.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, waiting for in-flight jobs");
    dispatcher.stop().await;

    if let Some(path) = args.metrics_file {
        let rendered = metrics.render();
        if rendered.is_empty() {
            warn!("no metrics recorded; is the prometheus feature enabled?");
        }
        std::fs::write(&path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Progress and activity at debug, outcomes already logged by the dispatcher.
fn log_events() -> EventFn {
    Arc::new(|event: DispatchEvent| match event {
        DispatchEvent::Progress { job_id, percent } => debug!(%job_id, percent, "job progress"),
        other => debug!(job_id = other.job_id(), event = ?other, "dispatch event"),
    })
}
