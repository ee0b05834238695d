//! # Readers (components D and E)
//!
//! Streams detail rows for one batch as a lazy, finite, non-restartable
//! sequence with `O(fetch_size)` memory, ordered by `detail_id` ascending.
//! Built on the `sqlx` `fetch()`/`BoxStream` cursor pattern (the same
//! construct backing `Executor::fetch_many` across the corpus, e.g.
//! `examples/other_examples/...thalo-rs-message-db...database/client.rs`),
//! fed through a bounded channel so `fetch_size` is a real memory knob and
//! not sqlx-internal trivia.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use tokio::sync::mpsc;

use crate::error::{ReaderError, StoreError};
use crate::retry::RetryPolicy;
use crate::store::Store;

/// One detail row belonging to a batch. `transaction_data` is only
/// populated (and only attempted) in `STREAMING_JSONB` mode.
#[derive(Debug, Clone)]
pub struct Detail {
    pub detail_id: i64,
    pub master_id: i64,
    pub record_type: String,
    pub account_number: String,
    pub customer_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub transaction_date: DateTime<Utc>,
    pub transaction_data: Option<TransactionData>,
}

impl FromRow<'_, PgRow> for Detail {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Detail {
            detail_id: row.try_get("detail_id")?,
            master_id: row.try_get("master_id")?,
            record_type: row.try_get("record_type")?,
            account_number: row.try_get("account_number")?,
            customer_name: row.try_get("customer_name")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            description: row.try_get("description")?,
            transaction_date: row.try_get("transaction_date")?,
            transaction_data: None,
        })
    }
}

/// The decoded `transaction_data` sub-document. Every field is
/// `#[serde(default)]` so a partially-populated or legacy document never
/// hard-fails decode — only genuinely malformed JSON produces a
/// `DECODE_ERROR`; unknown fields are silently ignored (`serde`'s default
/// behavior), matching spec.md §9's decoder guidance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    #[serde(default)]
    pub customer: Customer,
    #[serde(default)]
    pub merchant: Merchant,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub risk_score: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub tier: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Merchant {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub country: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub price: Option<Decimal>,
}

const RELATIONAL_QUERY: &str = r#"
SELECT detail_id, master_id, record_type, account_number, customer_name,
       amount, currency, description, transaction_date
FROM details
WHERE master_id = $1
ORDER BY detail_id ASC
"#;

const JSONB_QUERY: &str = r#"
SELECT detail_id, master_id, record_type, account_number, customer_name,
       amount, currency, description, transaction_date,
       transaction_data::text AS transaction_data_raw
FROM details_jsonb
WHERE master_id = $1
ORDER BY detail_id ASC
"#;

pub struct Reader {
    store: Store,
    retry: RetryPolicy,
}

impl Reader {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Open a cursor on the relational detail table for `master_id` and
    /// return a lazy stream of `Detail`s plus a join handle for the
    /// background task driving the underlying transaction. The stream's
    /// internal channel has capacity `fetch_size`: producing faster than
    /// the batch processor consumes blocks the producer task, bounding
    /// memory at `O(fetch_size)` regardless of batch cardinality.
    pub fn stream_relational(
        &self,
        master_id: i64,
        fetch_size: usize,
    ) -> impl Stream<Item = Result<Detail, ReaderError>> + Send + 'static {
        self.stream(master_id, fetch_size, RELATIONAL_QUERY, false)
    }

    /// Same contract, additionally decoding the `transaction_data` jsonb
    /// column per row. A malformed payload yields
    /// `ReaderError::Decode` for that row only; the underlying cursor
    /// keeps advancing so the caller can apply `ErrorPolicy::SkipRow`.
    pub fn stream_jsonb(
        &self,
        master_id: i64,
        fetch_size: usize,
    ) -> impl Stream<Item = Result<Detail, ReaderError>> + Send + 'static {
        self.stream(master_id, fetch_size, JSONB_QUERY, true)
    }

    fn stream(
        &self,
        master_id: i64,
        fetch_size: usize,
        query: &'static str,
        decode_jsonb: bool,
    ) -> impl Stream<Item = Result<Detail, ReaderError>> + Send + 'static {
        let pool = self.store.pool().clone();
        let retry = self.retry;
        let (tx, rx) = mpsc::channel::<Result<Detail, ReaderError>>(fetch_size.max(1));

        tokio::spawn(async move {
            // The transaction is owned exclusively by this task for its
            // entire lifetime; it is rolled back (readers never write) on
            // drop regardless of how the loop below exits, satisfying
            // "callers MUST call close on every exit path" via RAII.
            // Acquiring it is retried with backoff before a
            // `STORE_UNAVAILABLE`-class error is allowed to reach the caller.
            let begin = retry
                .retry(|| async {
                    pool.begin()
                        .await
                        .map_err(|error| StoreError::ConnectionError { error })
                })
                .await;
            let mut tx_conn = match begin {
                Ok(tx_conn) => tx_conn,
                Err(error) => {
                    let _ = tx.send(Err(ReaderError::Store(error))).await;
                    return;
                }
            };

            let mut rows = sqlx::query(query).bind(master_id).fetch(&mut *tx_conn);

            while let Some(row) = rows.next().await {
                let row = match row {
                    Ok(row) => row,
                    Err(error) => {
                        let _ = tx
                            .send(Err(ReaderError::Store(StoreError::QueryError {
                                command: "SELECT".to_owned(),
                                error,
                            })))
                            .await;
                        break;
                    }
                };

                let mut detail = match Detail::from_row(&row) {
                    Ok(detail) => detail,
                    Err(error) => {
                        let _ = tx
                            .send(Err(ReaderError::Store(StoreError::QueryError {
                                command: "SELECT".to_owned(),
                                error,
                            })))
                            .await;
                        break;
                    }
                };

                if decode_jsonb {
                    let raw: Option<String> = row.try_get("transaction_data_raw").ok();
                    if let Some(raw) = raw {
                        match serde_json::from_str::<TransactionData>(&raw) {
                            Ok(decoded) => detail.transaction_data = Some(decoded),
                            Err(error) => {
                                let _ = tx
                                    .send(Err(ReaderError::Decode {
                                        detail_id: detail.detail_id,
                                        reason: error.to_string(),
                                    }))
                                    .await;
                                continue;
                            }
                        }
                    }
                }

                if tx.send(Ok(detail)).await.is_err() {
                    // Receiver dropped (cancellation): stop driving the
                    // cursor and let the transaction roll back on drop.
                    break;
                }
            }
        });

        tokio_stream_from_receiver(rx)
    }
}

fn tokio_stream_from_receiver<T>(
    rx: mpsc::Receiver<T>,
) -> impl Stream<Item = T> + Send + 'static {
    tokio_stream::wrappers::ReceiverStream::new(rx)
}
