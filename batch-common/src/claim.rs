//! # Claim Manager
//!
//! Implements the at-most-one-worker-per-batch guarantee described in
//! spec.md §4.B, grounded in the teacher's `PgQueue::dequeue` SKIP LOCKED
//! CTE (`pgqueue.rs`) generalized from "dequeue a job" to "claim a batch".

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use crate::error::{ClaimError, StoreError};
use crate::retry::RetryPolicy;
use crate::store::Store;

/// The four states a batch moves through. `status = PROCESSING` implies
/// `lease_holder`/`leased_at` are set; every other status implies they
/// are cleared (spec.md §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "batch_status")]
#[sqlx(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("{other} is not a valid BatchStatus")),
        }
    }
}

/// Which pipeline the batch processor should run: relational-only,
/// relational with the enhanced column set, or the semi-structured
/// (JSONB) reader. A per-batch attribute, the strictly more general of
/// the two options spec.md §9 Open Question 4 allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "processor_mode")]
#[sqlx(rename_all = "lowercase")]
pub enum ProcessorMode {
    Standard,
    Enhanced,
    StreamingJsonb,
}

impl ProcessorMode {
    /// The filename suffix this mode contributes, per spec.md §6.
    pub fn filename_suffix(&self) -> &'static str {
        match self {
            ProcessorMode::Standard => "",
            ProcessorMode::Enhanced => "_enhanced",
            ProcessorMode::StreamingJsonb => "_jsonb",
        }
    }
}

impl FromStr for ProcessorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(ProcessorMode::Standard),
            "enhanced" => Ok(ProcessorMode::Enhanced),
            "streaming_jsonb" | "jsonb" => Ok(ProcessorMode::StreamingJsonb),
            other => Err(format!("{other} is not a valid ProcessorMode")),
        }
    }
}

/// A row of the `batches` table, as read back for diagnostics/tests. The
/// hot path (`claim_next`) returns a `Lease`, not a full `Batch`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: i64,
    pub business_center: String,
    pub priority: i32,
    pub status: BatchStatus,
    pub lease_holder: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub mode: ProcessorMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for Batch {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Batch {
            id: row.try_get("id")?,
            business_center: row.try_get("business_center")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            lease_holder: row.try_get("lease_holder")?,
            leased_at: row.try_get("leased_at")?,
            error_message: row.try_get("error_message")?,
            mode: row.try_get("mode")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// An exclusive, time-bounded claim on one batch, returned by
/// `claim_next`. Everything the batch processor needs without a second
/// query.
#[derive(Debug, Clone)]
pub struct Lease {
    pub master_id: i64,
    pub worker_id: String,
    pub business_center: String,
    pub mode: ProcessorMode,
    pub priority: i32,
}

/// The truncation cap documented in spec.md §4.B for stored error
/// messages.
const ERROR_MESSAGE_CAP: usize = 2000;

/// A mapping from business center to a numeric priority, resolved at
/// `enqueue` time (Open Question 3, decided in DESIGN.md: priority is
/// materialized on the row, not derived at selection time).
#[derive(Debug, Clone, Default)]
pub struct BusinessCenterPriorities(HashMap<String, i32>);

impl BusinessCenterPriorities {
    pub fn new(priorities: HashMap<String, i32>) -> Self {
        Self(priorities)
    }

    pub fn priority_for(&self, business_center: &str) -> i32 {
        self.0.get(business_center).copied().unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct ClaimManager {
    store: Store,
    retry: RetryPolicy,
}

impl ClaimManager {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Insert a new `PENDING` batch, resolving `priority` from the
    /// configured business-center map.
    pub async fn enqueue(
        &self,
        business_center: &str,
        mode: ProcessorMode,
        priorities: &BusinessCenterPriorities,
    ) -> Result<i64, ClaimError> {
        let priority = priorities.priority_for(business_center);

        let row = self
            .retry
            .retry(|| async {
                sqlx::query(
                    r#"
INSERT INTO batches (business_center, priority, status, mode, created_at, updated_at)
VALUES ($1, $2, 'pending'::batch_status, $3, NOW(), NOW())
RETURNING id
                    "#,
                )
                .bind(business_center)
                .bind(priority)
                .bind(mode)
                .fetch_one(self.store.pool())
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                })
            })
            .await
            .map_err(ClaimError::Store)?;

        Ok(row.try_get::<i64, _>("id").expect("id is always returned"))
    }

    /// Select the highest-priority eligible batch and atomically transition
    /// it to `PROCESSING`, per spec.md §4.B. A single `FOR UPDATE SKIP
    /// LOCKED` statement folds both "claim a pending batch" and "reclaim a
    /// batch whose lease has expired" into one round trip; `reap_stale`
    /// remains the authoritative bulk operation for observability and for
    /// deployments that want reaping decoupled from claiming.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Lease>, ClaimError> {
        let ttl_seconds = lease_ttl.as_secs() as f64;

        let row = self
            .retry
            .retry(|| async {
                sqlx::query(
                    r#"
WITH candidate AS (
    SELECT id
    FROM batches
    WHERE status = 'pending'::batch_status
       OR (status = 'processing'::batch_status
           AND leased_at < NOW() - make_interval(secs => $1))
    ORDER BY priority DESC, created_at ASC, id ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE batches
SET status = 'processing'::batch_status,
    lease_holder = $2,
    leased_at = NOW(),
    updated_at = NOW(),
    error_message = NULL
FROM candidate
WHERE batches.id = candidate.id
RETURNING batches.id, batches.business_center, batches.mode, batches.priority
                    "#,
                )
                .bind(ttl_seconds)
                .bind(worker_id)
                .fetch_optional(self.store.pool())
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })
            })
            .await
            .map_err(ClaimError::Store)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Lease {
            master_id: row.try_get("id").expect("id is always returned"),
            worker_id: worker_id.to_owned(),
            business_center: row
                .try_get("business_center")
                .expect("business_center is always returned"),
            mode: row.try_get("mode").expect("mode is always returned"),
            priority: row.try_get("priority").expect("priority is always returned"),
        }))
    }

    /// Mark a batch `COMPLETED`, clearing its lease. Conditional on the
    /// lease still being held by `lease.worker_id` (Open Question 2: the
    /// safe choice).
    pub async fn complete(&self, lease: &Lease) -> Result<(), ClaimError> {
        let result = self
            .retry
            .retry(|| async {
                sqlx::query(
                    r#"
UPDATE batches
SET status = 'completed'::batch_status,
    lease_holder = NULL,
    leased_at = NULL,
    updated_at = NOW()
WHERE id = $1 AND lease_holder = $2
                    "#,
                )
                .bind(lease.master_id)
                .bind(&lease.worker_id)
                .execute(self.store.pool())
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })
            })
            .await
            .map_err(ClaimError::Store)?;

        if result.rows_affected() == 0 {
            return Err(ClaimError::LostLease {
                master_id: lease.master_id,
            });
        }

        Ok(())
    }

    /// Mark a batch `FAILED`, clearing its lease and recording a
    /// truncated error message.
    pub async fn fail(&self, lease: &Lease, error_message: &str) -> Result<(), ClaimError> {
        let truncated: String = error_message.chars().take(ERROR_MESSAGE_CAP).collect();

        let result = self
            .retry
            .retry(|| async {
                sqlx::query(
                    r#"
UPDATE batches
SET status = 'failed'::batch_status,
    lease_holder = NULL,
    leased_at = NULL,
    error_message = $3,
    updated_at = NOW()
WHERE id = $1 AND lease_holder = $2
                    "#,
                )
                .bind(lease.master_id)
                .bind(&lease.worker_id)
                .bind(&truncated)
                .execute(self.store.pool())
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })
            })
            .await
            .map_err(ClaimError::Store)?;

        if result.rows_affected() == 0 {
            return Err(ClaimError::LostLease {
                master_id: lease.master_id,
            });
        }

        Ok(())
    }

    /// Return every `PROCESSING` batch whose lease has exceeded
    /// `lease_ttl` to `PENDING`, clearing lease fields. Safe to call from
    /// any worker, any cadence, concurrently; idempotent (a run that finds
    /// nothing left to reap is a no-op).
    pub async fn reap_stale(&self, lease_ttl: Duration) -> Result<u64, ClaimError> {
        let ttl_seconds = lease_ttl.as_secs() as f64;

        let result = self
            .retry
            .retry(|| async {
                sqlx::query(
                    r#"
UPDATE batches
SET status = 'pending'::batch_status,
    lease_holder = NULL,
    leased_at = NULL,
    updated_at = NOW()
WHERE status = 'processing'::batch_status
  AND leased_at < NOW() - make_interval(secs => $1)
                    "#,
                )
                .bind(ttl_seconds)
                .execute(self.store.pool())
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })
            })
            .await
            .map_err(ClaimError::Store)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_suffix_matches_spec() {
        assert_eq!(ProcessorMode::Standard.filename_suffix(), "");
        assert_eq!(ProcessorMode::Enhanced.filename_suffix(), "_enhanced");
        assert_eq!(ProcessorMode::StreamingJsonb.filename_suffix(), "_jsonb");
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!(
            ProcessorMode::from_str("STANDARD").unwrap(),
            ProcessorMode::Standard
        );
        assert_eq!(
            ProcessorMode::from_str("streaming_jsonb").unwrap(),
            ProcessorMode::StreamingJsonb
        );
        assert!(ProcessorMode::from_str("bogus").is_err());
    }

    #[test]
    fn priorities_default_to_zero_for_unknown_centers() {
        let mut map = HashMap::new();
        map.insert("NYC".to_owned(), 100);
        let priorities = BusinessCenterPriorities::new(map);

        assert_eq!(priorities.priority_for("NYC"), 100);
        assert_eq!(priorities.priority_for("LON"), 0);
    }

    // S6 — priority ordering: claim_next returns batches in
    // (priority DESC, created_at ASC, id ASC) order.
    #[sqlx::test(migrations = "../batch-worker/migrations")]
    async fn claim_next_respects_priority_ordering(db: sqlx::PgPool) {
        let manager = ClaimManager::new(Store::from_pool(db));
        let priorities = BusinessCenterPriorities::default();

        let id_10 = manager
            .enqueue("LOW", ProcessorMode::Standard, &priorities)
            .await
            .unwrap();
        sqlx::query("UPDATE batches SET priority = 10 WHERE id = $1")
            .bind(id_10)
            .execute(manager.store.pool())
            .await
            .unwrap();

        let id_11 = manager
            .enqueue("MID", ProcessorMode::Standard, &priorities)
            .await
            .unwrap();
        sqlx::query("UPDATE batches SET priority = 50 WHERE id = $1")
            .bind(id_11)
            .execute(manager.store.pool())
            .await
            .unwrap();

        let id_12 = manager
            .enqueue("MID_EARLIER", ProcessorMode::Standard, &priorities)
            .await
            .unwrap();
        sqlx::query(
            "UPDATE batches SET priority = 50, created_at = NOW() - interval '1 hour' WHERE id = $1",
        )
        .bind(id_12)
        .execute(manager.store.pool())
        .await
        .unwrap();

        let lease_ttl = Duration::from_secs(300);

        let first = manager.claim_next("worker-a", lease_ttl).await.unwrap().unwrap();
        assert_eq!(first.master_id, id_12);

        let second = manager.claim_next("worker-a", lease_ttl).await.unwrap().unwrap();
        assert_eq!(second.master_id, id_11);

        let third = manager.claim_next("worker-a", lease_ttl).await.unwrap().unwrap();
        assert_eq!(third.master_id, id_10);

        assert!(manager
            .claim_next("worker-a", lease_ttl)
            .await
            .unwrap()
            .is_none());
    }

    // S2 — two workers, one pending batch: exactly one claim succeeds.
    #[sqlx::test(migrations = "../batch-worker/migrations")]
    async fn concurrent_claims_never_double_assign(db: sqlx::PgPool) {
        let manager = ClaimManager::new(Store::from_pool(db));
        let priorities = BusinessCenterPriorities::default();

        manager
            .enqueue("NYC", ProcessorMode::Standard, &priorities)
            .await
            .unwrap();

        let lease_ttl = Duration::from_secs(300);
        let a = manager.claim_next("worker-a", lease_ttl).await.unwrap();
        let b = manager.claim_next("worker-b", lease_ttl).await.unwrap();

        assert!(a.is_some());
        assert!(b.is_none());

        manager.complete(&a.unwrap()).await.unwrap();
    }

    // S3 — crash recovery: reap_stale returns an expired lease to PENDING
    // so another worker can claim and complete it.
    #[sqlx::test(migrations = "../batch-worker/migrations")]
    async fn reap_stale_recovers_crashed_worker_lease(db: sqlx::PgPool) {
        let manager = ClaimManager::new(Store::from_pool(db));
        let priorities = BusinessCenterPriorities::default();

        let id = manager
            .enqueue("NYC", ProcessorMode::Standard, &priorities)
            .await
            .unwrap();

        let short_ttl = Duration::from_secs(0);
        let lease = manager
            .claim_next("worker-a", short_ttl)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.master_id, id);

        // worker-a "crashes": nobody ever calls complete/fail.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let reaped = manager.reap_stale(short_ttl).await.unwrap();
        assert_eq!(reaped, 1);

        // reap_stale is idempotent: nothing left to reap.
        assert_eq!(manager.reap_stale(short_ttl).await.unwrap(), 0);

        let recovered = manager
            .claim_next("worker-b", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.master_id, id);
        manager.complete(&recovered).await.unwrap();
    }

    // complete() on a lease that is no longer held surfaces LostLease
    // rather than silently succeeding.
    #[sqlx::test(migrations = "../batch-worker/migrations")]
    async fn complete_after_lease_lost_is_rejected(db: sqlx::PgPool) {
        let manager = ClaimManager::new(Store::from_pool(db));
        let priorities = BusinessCenterPriorities::default();

        manager
            .enqueue("NYC", ProcessorMode::Standard, &priorities)
            .await
            .unwrap();

        let lease_ttl = Duration::from_secs(0);
        let lease = manager
            .claim_next("worker-a", lease_ttl)
            .await
            .unwrap()
            .unwrap();

        // Lease expires immediately (ttl=0) and another worker reclaims it.
        manager.reap_stale(lease_ttl).await.unwrap();
        let stolen = manager
            .claim_next("worker-b", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let result = manager.complete(&lease).await;
        assert!(matches!(result, Err(ClaimError::LostLease { .. })));

        manager.complete(&stolen).await.unwrap();
    }
}
