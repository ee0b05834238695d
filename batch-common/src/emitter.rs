//! # Emitter (component G)
//!
//! Writes one HEADER line, one DETAIL line per row, and one TRAILER line
//! to a single output file, tracking a running count and sum so the
//! trailer can be computed without buffering the whole batch. Modeled as
//! a runtime state machine rather than a compile-time typestate, matching
//! the rest of this codebase's preference for plain enums over generic
//! phantom markers.

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::claim::ProcessorMode;
use crate::error::EmitterError;
use crate::transform::OutputRow;

/// 64 KiB, matching the buffer size the rest of this codebase reaches for
/// around file and socket writers.
const WRITE_BUFFER_CAPACITY: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum State {
    Init,
    HeaderWritten,
    Body,
    TrailerWritten,
    Closed,
}

/// Drives one output file through HEADER -> DETAIL* -> TRAILER -> close.
/// Every method checks the current state and returns
/// `EmitterError::InvalidState` if called out of order; callers never
/// need to track the state themselves.
pub struct Emitter {
    writer: Option<BufWriter<File>>,
    state: State,
    detail_count: u64,
    amount_sum: Decimal,
}

impl Emitter {
    /// Open `path` for writing, truncating any existing file of the same
    /// name (collisions are resolved by the caller before this is
    /// reached, via a monotone filename counter).
    pub async fn open(path: &str) -> Result<Self, EmitterError> {
        let file = File::create(path)
            .await
            .map_err(|error| EmitterError::Open {
                path: path.to_owned(),
                error,
            })?;

        Ok(Self {
            writer: Some(BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file)),
            state: State::Init,
            detail_count: 0,
            amount_sum: Decimal::ZERO,
        })
    }

    /// Writes `HEADER|{masterId}|{businessCenter}|{yyyyMMdd}|{recordCount|0}`.
    /// The record count is always `0` here (Open Question 1: placeholder in
    /// HEADER, true count in TRAILER) since the true count isn't known
    /// until the stream is exhausted.
    pub async fn write_header(&mut self, master_id: i64, business_center: &str) -> Result<(), EmitterError> {
        if self.state != State::Init {
            return Err(EmitterError::InvalidState("write_header"));
        }
        let date = Utc::now().format("%Y%m%d");
        let line = format!("HEADER|{master_id}|{business_center}|{date}|0\n");
        self.write_raw(&line).await?;
        self.state = State::HeaderWritten;
        Ok(())
    }

    pub async fn write_detail(&mut self, row: &OutputRow, mode: ProcessorMode) -> Result<(), EmitterError> {
        if self.state != State::HeaderWritten && self.state != State::Body {
            return Err(EmitterError::InvalidState("write_detail"));
        }
        let line = format!("{}\n", row.to_line(mode));
        self.write_raw(&line).await?;
        self.detail_count += 1;
        self.amount_sum += row.amount;
        self.state = State::Body;
        Ok(())
    }

    pub async fn write_trailer(&mut self) -> Result<(), EmitterError> {
        if self.state != State::HeaderWritten && self.state != State::Body {
            return Err(EmitterError::InvalidState("write_trailer"));
        }
        let line = format!(
            "TRAILER|{}|{}\n",
            self.detail_count,
            self.amount_sum.round_dp(2)
        );
        self.write_raw(&line).await?;
        self.state = State::TrailerWritten;
        Ok(())
    }

    /// Flush and close the underlying file. Safe to call more than once;
    /// every call after the first is a no-op, so callers can
    /// unconditionally close on every exit path (including error paths)
    /// without tracking whether they already did.
    pub async fn close(&mut self) -> Result<(), EmitterError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await.map_err(EmitterError::Close)?;
            writer.shutdown().await.map_err(EmitterError::Close)?;
        }
        self.state = State::Closed;
        Ok(())
    }

    /// Abort the batch: close the file (best-effort) and remove it,
    /// since an aborted batch must never leave a partial file behind for
    /// a downstream consumer to pick up (spec.md §4.H, `ErrorPolicy::AbortBatch`).
    pub async fn abort(&mut self, path: &str) -> Result<(), EmitterError> {
        self.close().await?;
        let _ = tokio::fs::remove_file(path).await;
        Ok(())
    }

    pub fn detail_count(&self) -> u64 {
        self.detail_count
    }

    pub fn amount_sum(&self) -> Decimal {
        self.amount_sum
    }

    async fn write_raw(&mut self, line: &str) -> Result<(), EmitterError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(EmitterError::InvalidState("write after close"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(EmitterError::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Detail;

    fn temp_path(name: &str) -> String {
        format!("{}/{name}-{}.txt", std::env::temp_dir().display(), name)
    }

    fn row(detail_id: i64, amount: &str) -> OutputRow {
        crate::transform::flatten(&Detail {
            detail_id,
            master_id: 1,
            record_type: "SALE".to_owned(),
            account_number: "ACC".to_owned(),
            customer_name: "Name".to_owned(),
            amount: amount.parse().unwrap(),
            currency: "USD".to_owned(),
            description: "d".to_owned(),
            transaction_date: chrono::Utc::now(),
            transaction_data: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn full_lifecycle_produces_header_details_trailer() {
        let path = temp_path("lifecycle");
        let mut emitter = Emitter::open(&path).await.unwrap();
        emitter.write_header(7, "ACME").await.unwrap();
        emitter
            .write_detail(&row(1, "10.00"), ProcessorMode::Standard)
            .await
            .unwrap();
        emitter
            .write_detail(&row(2, "5.50"), ProcessorMode::Standard)
            .await
            .unwrap();
        emitter.write_trailer().await.unwrap();
        emitter.close().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("HEADER|7|ACME|"));
        assert!(lines[0].ends_with("|0"));
        assert!(lines[1].starts_with("SALE|1|"));
        assert_eq!(lines[3], "TRAILER|2|15.50");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn detail_before_header_is_rejected() {
        let path = temp_path("order");
        let mut emitter = Emitter::open(&path).await.unwrap();
        let error = emitter
            .write_detail(&row(1, "1.00"), ProcessorMode::Standard)
            .await
            .unwrap_err();
        assert!(matches!(error, EmitterError::InvalidState("write_detail")));
        emitter.close().await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let path = temp_path("idempotent");
        let mut emitter = Emitter::open(&path).await.unwrap();
        emitter.write_header(1, "ACME").await.unwrap();
        emitter.write_trailer().await.unwrap();
        emitter.close().await.unwrap();
        emitter.close().await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn abort_removes_partial_file() {
        let path = temp_path("abort");
        let mut emitter = Emitter::open(&path).await.unwrap();
        emitter.write_header(1, "ACME").await.unwrap();
        emitter
            .write_detail(&row(1, "1.00"), ProcessorMode::Standard)
            .await
            .unwrap();
        emitter.abort(&path).await.unwrap();

        assert!(tokio::fs::metadata(&path).await.is_err());
    }
}
