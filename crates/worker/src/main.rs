use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jokbo_orchestrator::background::BackgroundTasks;
use jokbo_orchestrator::{Orchestrator, OrchestratorConfig};
use jokbo_worker::analyzer::HttpAnalyzer;
use jokbo_worker::documents::{DocumentCache, HttpDocumentSource};
use jokbo_worker::handlers::{HandlerRegistry, WorkerDeps};
use jokbo_worker::runtime::RuntimeSettings;
use jokbo_worker::{WorkerConfig, WorkerRuntime};

/// How long running units get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "jokbo_worker=debug,jokbo_orchestrator=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    let orchestrator_config =
        OrchestratorConfig::from_env().context("Invalid orchestrator configuration")?;
    tracing::info!(
        worker = %config.worker_name,
        concurrency = config.concurrency,
        queues = ?config.queues,
        "Loaded worker configuration"
    );

    // --- Database ---
    let pool = jokbo_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    jokbo_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    jokbo_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Collaborators ---
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;
    let documents = Arc::new(HttpDocumentSource::new(
        client.clone(),
        config.file_store_url.clone(),
    ));
    let analyzer = Arc::new(HttpAnalyzer::new(client, config.analyzer_url.clone()));
    let cache = DocumentCache::new(config.document_cache_capacity);

    let orchestrator = Orchestrator::with_postgres(pool, documents.clone(), orchestrator_config);
    let deps = WorkerDeps::new(&orchestrator, analyzer, documents, cache.clone());

    // --- Runtime ---
    let runtime = WorkerRuntime::new(
        Arc::clone(orchestrator.dispatcher().queue()),
        HandlerRegistry::with_defaults(),
        deps,
        RuntimeSettings::from(&config),
    );
    let cancel = CancellationToken::new();
    let runtime_handle = tokio::spawn(runtime.run(cancel.clone()));
    let background = BackgroundTasks::spawn(&orchestrator);
    tracing::info!(worker = %config.worker_name, "Worker running");

    shutdown_signal().await;

    // --- Graceful shutdown ---
    cancel.cancel();
    match tokio::time::timeout(DRAIN_TIMEOUT, runtime_handle).await {
        Ok(Ok(())) => tracing::info!("Worker runtime drained"),
        Ok(Err(e)) => tracing::error!(error = %e, "Worker runtime panicked"),
        Err(_) => tracing::warn!(
            "Running units did not finish in time; their leases will expire and requeue them"
        ),
    }
    background.shutdown(Duration::from_secs(5)).await;
    cache.clear().await;

    tracing::info!("Worker shut down");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
