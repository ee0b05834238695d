//! # Batch Processor (component H)
//!
//! Wires reader -> transform -> emitter -> claim manager together to
//! fully process one leased batch: build the output filename, stream
//! every detail row through the flattener into the emitter, and finalize
//! the claim as `COMPLETED` or `FAILED` depending on what happened.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use batch_common::claim::{ClaimManager, Lease, ProcessorMode};
use batch_common::emitter::Emitter;
use batch_common::reader::Reader;
use batch_common::transform::flatten;

use crate::error::{ErrorPolicy, ProcessorError};

/// Disambiguates two batches that would otherwise produce the same
/// filename (same business center, master id, mode, and second).
static FILENAME_COLLISION_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct BatchProcessor {
    reader: Reader,
    claims: ClaimManager,
    output_directory: PathBuf,
    fetch_size: usize,
    error_policy: ErrorPolicy,
}

impl BatchProcessor {
    pub fn new(
        reader: Reader,
        claims: ClaimManager,
        output_directory: PathBuf,
        fetch_size: usize,
        error_policy: ErrorPolicy,
    ) -> Self {
        Self {
            reader,
            claims,
            output_directory,
            fetch_size,
            error_policy,
        }
    }

    /// Process one leased batch end to end. On success the batch is
    /// marked `COMPLETED`; on failure it is marked `FAILED` with a
    /// truncated error message, and any partial output file is removed.
    /// Returns `Err` only when `complete`/`fail` itself could not run
    /// (e.g. the lease was lost out from under us), since that case
    /// leaves the batch's terminal status ambiguous and must propagate.
    pub async fn process(
        &self,
        lease: Lease,
        cancellation: &CancellationToken,
    ) -> Result<(), ProcessorError> {
        let path = self.build_output_path(&lease);
        let path_str = path.to_string_lossy().into_owned();
        let started = Instant::now();

        let outcome = self.run_pipeline(&lease, &path_str, cancellation).await;

        match outcome {
            Ok(skipped) => {
                self.claims.complete(&lease).await?;
                metrics::counter!("batches_completed_total").increment(1);
                metrics::histogram!("batch_processing_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                if skipped > 0 {
                    metrics::counter!("rows_skipped_total").increment(skipped);
                    warn!(master_id = lease.master_id, skipped, "batch completed with skipped rows");
                }
                info!(master_id = lease.master_id, path = %path_str, skipped, "batch completed");
                Ok(())
            }
            Err(error) => {
                let _ = tokio::fs::remove_file(&path_str).await;
                let message = error.to_string();
                metrics::counter!("batches_failed_total").increment(1);
                metrics::histogram!("batch_processing_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                warn!(master_id = lease.master_id, error = %message, "batch failed");
                self.claims.fail(&lease, &message).await?;
                Err(error)
            }
        }
    }

    /// Returns the number of rows skipped under `ErrorPolicy::SkipRow`.
    async fn run_pipeline(
        &self,
        lease: &Lease,
        path: &str,
        cancellation: &CancellationToken,
    ) -> Result<u64, ProcessorError> {
        let mut emitter = Emitter::open(path).await?;
        emitter
            .write_header(lease.master_id, &lease.business_center)
            .await?;

        let mut stream = match lease.mode {
            ProcessorMode::StreamingJsonb => self
                .reader
                .stream_jsonb(lease.master_id, self.fetch_size)
                .boxed(),
            ProcessorMode::Standard | ProcessorMode::Enhanced => self
                .reader
                .stream_relational(lease.master_id, self.fetch_size)
                .boxed(),
        };

        let mut skipped: u64 = 0;

        while let Some(detail) = stream.next().await {
            if cancellation.is_cancelled() {
                emitter.abort(path).await?;
                return Err(ProcessorError::Cancelled);
            }

            let detail = match detail {
                Ok(detail) => detail,
                Err(error) => match self.error_policy {
                    ErrorPolicy::SkipRow => {
                        skipped += 1;
                        warn!(master_id = lease.master_id, error = %error, "skipping unreadable row");
                        continue;
                    }
                    ErrorPolicy::AbortBatch => return Err(error.into()),
                },
            };

            let row = match flatten(&detail) {
                Ok(row) => row,
                Err(error) => match self.error_policy {
                    ErrorPolicy::SkipRow => {
                        skipped += 1;
                        warn!(master_id = lease.master_id, error = %error, "skipping row with transform error");
                        continue;
                    }
                    ErrorPolicy::AbortBatch => return Err(error.into()),
                },
            };

            emitter.write_detail(&row, lease.mode).await?;
        }

        emitter.write_trailer().await?;
        emitter.close().await?;
        Ok(skipped)
    }

    fn build_output_path(&self, lease: &Lease) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = lease.mode.filename_suffix();
        let base = format!(
            "{}_{}{}_{}",
            lease.business_center, lease.master_id, suffix, timestamp
        );

        let mut path = self.output_directory.join(format!("{base}.txt"));
        if path.exists() {
            let n = FILENAME_COLLISION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
            path = self.output_directory.join(format!("{base}_{n}.txt"));
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(mode: ProcessorMode) -> Lease {
        Lease {
            master_id: 99,
            worker_id: "worker-a".to_owned(),
            business_center: "NYC".to_owned(),
            mode,
            priority: 0,
        }
    }

    #[test]
    fn filename_suffix_reflects_mode() {
        assert_eq!(ProcessorMode::Standard.filename_suffix(), "");
        assert_eq!(ProcessorMode::Enhanced.filename_suffix(), "_enhanced");
        assert_eq!(ProcessorMode::StreamingJsonb.filename_suffix(), "_jsonb");
        let _ = lease(ProcessorMode::Standard);
    }
}
