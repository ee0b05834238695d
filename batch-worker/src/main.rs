//! Claim and process batches from the shared PostgreSQL queue.
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use std::future::ready;
use tokio_util::sync::CancellationToken;

use batch_common::claim::ClaimManager;
use batch_common::health::HealthRegistry;
use batch_common::metrics::{serve, setup_metrics_router};
use batch_common::reader::Reader;
use batch_common::store::Store;
use batch_worker::config::Config;
use batch_worker::error::{ErrorPolicy, WorkerError};
use batch_worker::processor::BatchProcessor;
use batch_worker::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register(
            "scheduler".to_string(),
            time::Duration::seconds((config.poll_interval.0.as_secs() as i64 * 3).max(30)),
        )
        .await;

    let store = Store::new(&config.database_url, config.pool_options(), "batch-worker")
        .map_err(WorkerError::Store)?;

    let error_policy = ErrorPolicy::from_str(&config.error_policy)
        .map_err(WorkerError::InvalidConfig)?;

    let claims = ClaimManager::new(store.clone());
    let reader = Reader::new(store.clone());
    let processor = BatchProcessor::new(
        reader,
        claims.clone(),
        PathBuf::from(&config.output_directory),
        config.fetch_size,
        error_policy,
    );

    let scheduler = Scheduler::new(
        claims,
        processor,
        config.worker_name.clone(),
        config.poll_interval.0,
        config.lease_ttl.0,
        config.max_concurrent_masters,
        worker_liveness,
    );

    let cancellation = CancellationToken::new();

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router());
    let bind = config.bind();
    let http_cancellation = cancellation.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = serve(router, &bind) => {
                if let Err(error) = result {
                    tracing::error!(error = %error, "metrics/health server exited");
                }
            }
            _ = http_cancellation.cancelled() => {}
        }
    });

    let scheduler = Arc::new(scheduler);
    let reap_interval = config.reap_interval.0;

    let run_handle = {
        let scheduler = scheduler.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move { scheduler.run(cancellation).await })
    };
    let reaper_handle = {
        let scheduler = scheduler.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move { scheduler.run_reaper(reap_interval, cancellation).await })
    };

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight batches");
    cancellation.cancel();

    let _ = run_handle.await;
    let _ = reaper_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub async fn index() -> &'static str {
    "batch-worker"
}
