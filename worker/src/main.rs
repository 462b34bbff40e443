//! `distribution-projector` - projects `BloqueConsolidadoListo` events into
//! the distribution read model.
//!
//! # Usage
//!
//! ```bash
//! # Continuous consumer (Ctrl+C or SIGTERM stops it after the current batch)
//! distribution-projector consume
//!
//! # Process the pending backlog and what is available now, then exit
//! distribution-projector consume --once
//!
//! # Inspect, then replay, the dead-letter stream
//! distribution-projector replay-dead-letters --dry-run
//! distribution-projector replay-dead-letters --limit 50
//! ```
//!
//! Every option can also be set through the environment (see `--help`); a
//! `.env` file in the working directory is loaded first.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, ConsumeArgs, LogFormat, ReplayArgs};
use distribution_projector_contracts::ContractValidator;
use distribution_projector_core::BlockProjection;
use distribution_projector_postgres::PostgresReadModelStore;
use distribution_projector_redis::{DeadLetterReplayer, RedisStreamConsumer};
use distribution_projector_runtime::metrics::MetricsServer;
use distribution_projector_runtime::{ProjectionWorker, RetryPolicy, retry_with_backoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine; the environment and flags still apply.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format)?;
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "Loaded .env");
    }

    match &cli.command {
        Command::Consume(args) => consume(&cli, args).await,
        Command::ReplayDeadLetters(args) => replay_dead_letters(&cli, args).await,
    }
}

/// `RUST_LOG` wins over `--log-level`.
fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("distribution_projector={level}")))
        .context("Invalid log level")?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .context("Failed to install tracing subscriber")
}

async fn consume(cli: &Cli, args: &ConsumeArgs) -> Result<()> {
    let mut metrics = cli.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start().context("Failed to start metrics server")?;
    }

    let validator = ContractValidator::new(Arc::new(cli.schema_resolver()))
        .with_envelope_schema(&cli.envelope_schema);
    let data_schemas = cli.data_schema_uris();
    let data_schemas: Vec<&str> = data_schemas.iter().map(String::as_str).collect();
    validator
        .warm_up(&data_schemas)
        .context("Contract schemas are not usable")?;
    info!(
        envelope_schema = %validator.envelope_schema_uri(),
        accepted_versions = %cli.accepted_versions,
        "Contracts loaded"
    );

    let store = connect_store(cli).await?;
    if args.skip_migrations {
        info!("Skipping database migrations");
    } else {
        store.migrate().await.context("Failed to run migrations")?;
        info!("Database migrations applied");
    }

    let stream = cli.stream_config();
    let consumer = RedisStreamConsumer::builder()
        .redis_url(&cli.redis_url)
        .stream(&stream.stream)
        .group(&stream.group)
        .consumer(&stream.consumer)
        .dead_letter_stream(&stream.dead_letter_stream)
        .connect()
        .await
        .context("Failed to connect to Redis")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping after the current batch");
        if shutdown_tx.send(true).is_err() {
            debug!("Worker already stopped");
        }
    });

    let policy = cli.projection_policy();
    info!(
        strict_orders = policy.strict_orders,
        once = args.once,
        from_start = args.from_start,
        "Starting projection worker"
    );
    let mut worker = ProjectionWorker::new(
        consumer,
        store,
        BlockProjection::new(policy),
        Arc::new(validator),
        cli.worker_config(args),
        shutdown_rx,
    );

    let summary = if args.once {
        worker.run_once().await
    } else {
        worker.run().await
    }
    .context("Worker stopped on a stream failure")?;

    info!(
        projected = summary.projected,
        duplicates = summary.duplicates,
        skipped = summary.skipped,
        dead_lettered = summary.dead_lettered,
        "Worker stopped"
    );
    Ok(())
}

async fn connect_store(cli: &Cli) -> Result<PostgresReadModelStore> {
    let policy = RetryPolicy::builder()
        .max_retries(5)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(10))
        .build();

    retry_with_backoff(&policy, "connect to postgres", || {
        PostgresReadModelStore::connect(&cli.database_url, cli.database_max_connections)
    })
    .await
    .context("Failed to connect to Postgres")
}

async fn replay_dead_letters(cli: &Cli, args: &ReplayArgs) -> Result<()> {
    let stream = cli.stream_config();
    let mut replayer = DeadLetterReplayer::connect(&cli.redis_url, &stream.stream, &stream.dead_letter_stream)
        .await
        .context("Failed to connect to Redis")?;

    if args.dry_run {
        let entries = replayer
            .pending(args.limit)
            .await
            .context("Failed to list dead letters")?;
        for entry in &entries {
            info!(
                id = %entry.id,
                error = entry.error.as_deref().unwrap_or("<none>"),
                has_data = entry.data.is_some(),
                "Dead letter"
            );
        }
        info!(count = entries.len(), dead_letter_stream = %stream.dead_letter_stream, "Dry run, nothing replayed");
        return Ok(());
    }

    let summary = replayer
        .replay(args.limit)
        .await
        .context("Failed to replay dead letters")?;
    if summary.discarded > 0 {
        warn!(discarded = summary.discarded, "Dead letters without data were deleted");
    }
    info!(
        replayed = summary.replayed,
        stream = %stream.stream,
        "Dead letters replayed"
    );
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
