//! Periodically reclaim batches whose lease has expired without a
//! corresponding worker shutting them down cleanly (a crashed or killed
//! `batch-worker` process). Runs standalone, independent of any
//! particular worker's own reap cadence, as a second line of defense.
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use futures::future::{select, Either};
use tokio::sync::Semaphore;

use batch_common::claim::ClaimManager;
use batch_common::metrics::setup_metrics_router;
use batch_common::store::Store;

mod config;
mod handlers;

use config::Config;

async fn listen(app: Router, bind: String) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn reap_loop(claims: ClaimManager, lease_ttl: Duration, interval_secs: u64) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        match claims.reap_stale(lease_ttl).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(reaped = n, "janitor reaped stale leases"),
            Err(error) => tracing::error!(error = %error, "janitor failed to reap stale leases"),
        }
        drop(_permit);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = Store::new(&config.database_url, config.pool_options(), "batch-janitor")
        .expect("failed to initialize store");
    let claims = ClaimManager::new(store);

    let lease_ttl = Duration::from_secs(config.lease_ttl_secs);
    let reap_loop = Box::pin(reap_loop(claims, lease_ttl, config.reap_interval_secs));

    let app = handlers::app().merge(setup_metrics_router());
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, reap_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(error) => tracing::error!("failed to start batch-janitor http server, {}", error),
        },
        Either::Right((_, _)) => {
            tracing::error!("batch-janitor reap loop exited")
        }
    };
}
