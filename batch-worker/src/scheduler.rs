//! # Scheduler (component C)
//!
//! The poll loop: repeatedly try to claim a batch, and if one is
//! available, spawn a bounded task to process it. Bounding is a
//! `Semaphore` sized to `max_concurrent_masters`, same shape as the
//! teacher's webhook worker bounding concurrent job processing tasks. A
//! second loop reaps stale leases on its own cadence, and a
//! `CancellationToken` lets both loops drain in response to a shutdown
//! signal instead of being killed mid-batch.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use batch_common::claim::ClaimManager;
use batch_common::health::HealthHandle;

use crate::processor::BatchProcessor;

pub struct Scheduler {
    claims: ClaimManager,
    processor: Arc<BatchProcessor>,
    worker_id: String,
    poll_interval: Duration,
    lease_ttl: Duration,
    max_concurrent_masters: usize,
    liveness: HealthHandle,
}

impl Scheduler {
    pub fn new(
        claims: ClaimManager,
        processor: BatchProcessor,
        worker_id: String,
        poll_interval: Duration,
        lease_ttl: Duration,
        max_concurrent_masters: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            claims,
            processor: Arc::new(processor),
            worker_id,
            poll_interval,
            lease_ttl,
            max_concurrent_masters,
            liveness,
        }
    }

    /// Run until `cancellation` fires, then wait for every in-flight
    /// batch to finish before returning.
    pub async fn run(&self, cancellation: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_masters));
        let mut in_flight = Vec::new();

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            self.liveness.report_healthy().await;

            let saturation = (self.max_concurrent_masters - semaphore.available_permits()) as f64
                / self.max_concurrent_masters as f64
                * 100.0;
            metrics::gauge!("worker_saturation_percent").set(saturation);

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.sleep_with_jitter(cancellation.clone()).await;
                    continue;
                }
            };

            match self.claims.claim_next(&self.worker_id, self.lease_ttl).await {
                Ok(Some(lease)) => {
                    metrics::counter!("batches_claimed_total").increment(1);
                    let processor = self.processor.clone();
                    let cancellation = cancellation.clone();
                    let master_id = lease.master_id;
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(error) = processor.process(lease, &cancellation).await {
                            error!(master_id, error = %error, "batch processing failed");
                        }
                    });
                    in_flight.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());
                    in_flight.push(handle);
                }
                Ok(None) => {
                    drop(permit);
                    self.sleep_with_jitter(cancellation.clone()).await;
                }
                Err(error) => {
                    drop(permit);
                    warn!(error = %error, "failed to claim next batch");
                    self.sleep_with_jitter(cancellation.clone()).await;
                }
            }
        }

        info!("scheduler draining in-flight batches");
        for handle in in_flight {
            let _ = handle.await;
        }
    }

    /// Reap stale leases on `reap_interval` until cancelled. Run as a
    /// separate task from `run` so reaping cadence is independent of how
    /// busy the claim loop is.
    pub async fn run_reaper(&self, reap_interval: Duration, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(reap_interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = interval.tick() => {
                    match self.claims.reap_stale(self.lease_ttl).await {
                        Ok(0) => {}
                        Ok(n) => info!(reaped = n, "reaped stale leases"),
                        Err(error) => warn!(error = %error, "failed to reap stale leases"),
                    }
                }
            }
        }
    }

    /// Sleeps `poll_interval` plus jitter in `[0, poll_interval/2]`, per
    /// spec.md §4.C, to spread load across workers polling in lockstep.
    async fn sleep_with_jitter(&self, cancellation: CancellationToken) {
        let max_jitter_ms = (self.poll_interval.as_millis() / 2) as u64;
        let jitter_ms = if max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter_ms)
        };
        let sleep = self.poll_interval + Duration::from_millis(jitter_ms);
        tokio::select! {
            _ = cancellation.cancelled() => {}
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
