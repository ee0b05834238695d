//! # Store Gateway
//!
//! A thin wrapper over a PostgreSQL connection pool: connection pool
//! lifecycle and the shared vocabulary (`StoreError`) used by every other
//! component that touches the database. The parametric `exec`/`query_one`
//! operations named in the specification are realized at each call site
//! (`claim.rs`, `reader.rs`) rather than as fully generic methods here,
//! since every real query in this engine has a fixed, known shape.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::error::StoreError;

/// Connection pool tuning, mirroring the configuration surface in §6.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// A handle to the shared PostgreSQL connection pool. Cheaply `Clone`-able;
/// every worker task holds its own `Store` pointing at the same pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect lazily (the first real connection attempt happens on first
    /// use) so that a worker can start its HTTP health server before the
    /// database is necessarily reachable.
    pub fn new(url: &str, options: PoolOptions, app_name: &'static str) -> Result<Self, StoreError> {
        let connect_options = PgConnectOptions::from_str(url)
            .map_err(|error| StoreError::PoolCreationError { error })?
            .application_name(app_name);

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.connect_timeout)
            .idle_timeout(options.idle_timeout)
            .max_lifetime(options.max_lifetime)
            .connect_lazy_with(connect_options);

        Ok(Self { pool })
    }

    /// Build a `Store` around an already-constructed pool, used by
    /// `#[sqlx::test]`-backed integration tests.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A cheap connectivity probe used by the readiness endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;
        Ok(())
    }
}
