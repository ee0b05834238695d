use thiserror::Error;

use batch_common::error::{ClaimError, EmitterError, ReaderError, StoreError, TransformError};

/// How the processor should react to a row-level failure while working a
/// single batch, configured per-deployment via `ERROR_POLICY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Drop the offending row, log it, and continue with the batch.
    SkipRow,
    /// Abort the whole batch, discard any partial output file, and mark
    /// the batch `FAILED`.
    AbortBatch,
}

impl std::str::FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip_row" => Ok(ErrorPolicy::SkipRow),
            "abort_batch" => Ok(ErrorPolicy::AbortBatch),
            other => Err(format!("{other} is not a valid ErrorPolicy")),
        }
    }
}

/// Errors surfaced while processing a single claimed batch. Distinct from
/// `WorkerError` below: a `ProcessorError` is scoped to one batch and
/// handled by marking that batch `FAILED`, never by crashing the worker.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Emitter(#[from] EmitterError),
    #[error("batch was cancelled before it finished processing")]
    Cancelled,
}

/// Top-level errors that abort the worker process itself.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} is not a valid configuration value")]
    InvalidConfig(String),
}
