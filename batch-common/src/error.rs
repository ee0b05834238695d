//! Tagged error kinds for the engine, one small enum per concern, in the
//! same split-by-concern style as a job queue's own database/parse errors.

use thiserror::Error;

/// Errors from the store gateway (component A). `retryable` drives the
/// bounded backoff before a `STORE_UNAVAILABLE` is allowed to propagate.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

impl StoreError {
    /// Whether this failure is transient (transport/timeout) and worth
    /// retrying with backoff, as opposed to a programming or data error.
    pub fn is_retryable(&self) -> bool {
        let inner = match self {
            StoreError::PoolCreationError { error } => error,
            StoreError::ConnectionError { error } => error,
            StoreError::QueryError { error, .. } => error,
        };
        matches!(
            inner,
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
        )
    }
}

/// Errors from the claim manager (component B).
#[derive(Error, Debug)]
pub enum ClaimError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// `complete`/`fail` found the lease no longer held by the calling
    /// worker. The caller must abort its emitter and discard the file.
    #[error("lease for master {master_id} is no longer held by this worker")]
    LostLease { master_id: i64 },
}

/// Errors from the relational and semi-structured readers (D/E).
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Per-row decode failure of the semi-structured column.
    #[error("detail {detail_id} has malformed transaction_data: {reason}")]
    Decode { detail_id: i64, reason: String },
}

/// Errors from the flattener (component F).
#[derive(Error, Debug)]
pub enum TransformError {
    /// A field contains the pipe delimiter and cannot be safely emitted.
    #[error("detail {detail_id} field {field} contains the delimiter character")]
    DelimiterConflict { detail_id: i64, field: &'static str },
}

/// Errors from the emitter (component G). Always fatal to the batch.
#[derive(Error, Debug)]
pub enum EmitterError {
    #[error("failed to open output file {path}: {error}")]
    Open {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to write to output file: {0}")]
    Write(std::io::Error),
    #[error("failed to flush/close output file: {0}")]
    Close(std::io::Error),
    #[error("called {0} on an emitter in an invalid state")]
    InvalidState(&'static str),
}
