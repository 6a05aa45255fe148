use paygate_backend::api::{self, AppState};
use paygate_backend::config::AppConfig;
use paygate_backend::database::merchant_repository::test_merchant;
use paygate_backend::database::Stores;
use paygate_backend::health::HealthChecker;
use paygate_backend::logging::{init_tracing, mask_secret};
use paygate_backend::queue::{QueuePolicy, Queues};
use paygate_backend::workers::simulation::policy_from_config;
use paygate_backend::workers::webhook_delivery::{HttpWebhookTransport, RetrySchedule};
use paygate_backend::workers::Pipeline;

use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        test_mode = config.workers.test_mode,
        skip_externals = config.skip_externals,
        "Starting paygate backend"
    );

    let policy = QueuePolicy::from(&config.queue);
    let mut health_checker = HealthChecker::new();

    let (stores, queues) = if config.skip_externals {
        info!("Using in-memory stores and queues (SKIP_EXTERNALS=true)");
        (Stores::in_memory(), Queues::in_memory(policy))
    } else {
        let db_pool = paygate_backend::database::init_pool_from_config(&config.database)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to initialize database pool");
                e
            })?;
        info!(
            max_connections = db_pool.options().get_max_connections(),
            "Database connection pool initialized"
        );

        let queue_pool = paygate_backend::queue::redis::init_queue_pool(&config.queue)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to initialize queue pool");
                e
            })?;

        health_checker = health_checker
            .with_database(db_pool.clone())
            .with_queue(queue_pool.clone());
        (
            Stores::postgres(db_pool),
            Queues::redis(queue_pool, &config.queue.key_prefix, policy),
        )
    };

    if config.workers.test_mode {
        let merchant = stores.merchants.upsert(test_merchant()).await?;
        info!(
            merchant_id = %merchant.id,
            api_key = %merchant.api_key,
            api_secret = %mask_secret(&merchant.api_secret),
            "Test merchant seeded"
        );
    }

    // Workers
    let transport = Arc::new(HttpWebhookTransport::new(config.workers.webhook_timeout)?);
    let pipeline = Pipeline::new(
        &stores,
        &queues,
        policy_from_config(&config.workers),
        transport,
        RetrySchedule::from_config(&config.workers),
    );

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let pool_handles: Vec<_> = pipeline
        .into_pools(&config.workers)
        .into_iter()
        .map(|pool| tokio::spawn(pool.run(worker_shutdown_rx.clone())))
        .collect();

    let state = AppState::new(stores, queues, health_checker);
    state.workers_running.store(true, Ordering::SeqCst);
    let workers_running = state.workers_running.clone();

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(address = %addr, error = %e, "Failed to bind");
        e
    })?;

    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    workers_running.store(false, Ordering::SeqCst);

    // Pools finish their current job before stopping
    if tokio::time::timeout(Duration::from_secs(30), join_all(pool_handles))
        .await
        .is_err()
    {
        warn!("Timed out waiting for worker pools to stop");
    }

    info!("Server shutdown complete");
    Ok(())
}
