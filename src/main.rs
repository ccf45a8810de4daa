use std::sync::Arc;

use anyhow::Context;
use mimalloc::MiMalloc;
use scanorch::config::AppConfig;
use scanorch::engine::ZapClient;
use scanorch::ledger::PgLedger;
use scanorch::services::recovery;
use scanorch::{db, Orchestrator};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// M-MIMALLOC-APP: Use mimalloc as global allocator for improved performance.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "scanorch=debug".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let pool = db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let engine = ZapClient::new(
        config.zap_base_url.clone(),
        Some(config.zap_api_key.clone()),
        config.orchestrator.engine_call_timeout,
    )?;
    match engine.version().await {
        Ok(version) => tracing::info!(zap = %config.zap_base_url, version = %version, "Scan engine reachable"),
        Err(e) => tracing::warn!(zap = %config.zap_base_url, error = %e, "Scan engine not reachable yet"),
    }

    let ledger = Arc::new(PgLedger::new(pool));
    let interrupted =
        recovery::reconcile_interrupted(ledger.as_ref(), config.stale_after, |_| false).await?;
    if interrupted > 0 {
        tracing::warn!(interrupted, "Reconciled scans interrupted by a previous run");
    }

    let orchestrator = Orchestrator::start(ledger, Arc::new(engine), config.orchestrator.clone());
    tracing::info!(
        workers = config.orchestrator.worker_count,
        max_active_per_owner = config.orchestrator.max_active_per_owner,
        "Starting scan orchestrator"
    );

    let shutdown = CancellationToken::new();
    let sweep = recovery::spawn_pending_sweep(
        orchestrator.ledger.clone(),
        orchestrator.dispatcher.clone(),
        config.pending_sweep_interval,
        config.stale_after,
        shutdown.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!(grace_secs = config.shutdown_grace.as_secs(), "Shutdown requested");

    shutdown.cancel();
    if let Err(e) = sweep.await {
        tracing::error!(error = %e, "Pending sweep exited abnormally");
    }
    if tokio::time::timeout(config.shutdown_grace, orchestrator.dispatcher.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Grace period elapsed with scans still running; they will be reconciled once stale");
    }

    let metrics = orchestrator.metrics.snapshot();
    tracing::info!(
        completed = metrics.completed,
        failed = metrics.failed,
        cancelled = metrics.cancelled,
        alerts = metrics.total_alerts(),
        avg_duration_secs = metrics.avg_duration_secs(),
        "Scan worker metrics at shutdown"
    );

    Ok(())
}
