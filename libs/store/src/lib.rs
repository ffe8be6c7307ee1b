//! Durable relational state for the reservation manager.
//!
//! This crate owns the three entities of the system — users, machines and
//! leases — and every way the rest of the engine is allowed to touch them:
//! - Connection pool management and idempotent schema setup
//! - Machine eligibility selection with row-level locking
//! - Lease lifecycle operations (insert, expiry joins, release)
//! - The cluster-wide advisory lock used by the maintenance loop
//!
//! All other components hold short-lived read snapshots; nothing outside
//! this crate issues SQL. Every timestamp comparison happens inside SQL
//! against the database's `now()` so that nodes with drifting local clocks
//! cannot disagree about expiry.

mod error;
mod leases;
mod lock;
mod machines;
pub mod models;
mod schema;

pub use error::StoreError;
pub use lock::AdvisoryLock;
pub use models::{
    AuthType, ExpiredLease, Lease, Machine, NewLease, RecoveredReplacement, ReplacementNeed, User,
};

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

/// A transaction against the store. Row locks taken inside live until
/// commit or rollback.
pub type StoreTx = sqlx::Transaction<'static, sqlx::Postgres>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/hostpool".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/hostpool".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Handle to the shared relational store.
///
/// Cloning is cheap; all clones share the underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    database_url: String,
}

impl Store {
    /// Create a new connection pool against the configured database.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self {
            pool,
            database_url: config.database_url.clone(),
        })
    }

    /// Connect, retrying once per second until the database answers or
    /// `max_wait` elapses. Containerized databases routinely come up after
    /// the services that depend on them.
    pub async fn connect_with_retry(
        config: &StoreConfig,
        max_wait: Duration,
    ) -> Result<Self, StoreError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            match Self::connect(config).await {
                Ok(store) => return Ok(store),
                Err(e) if tokio::time::Instant::now() < deadline => {
                    warn!(error = %e, "Database not reachable yet, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the idempotent schema setup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        schema::ensure(&self.pool).await
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<StoreTx, StoreError> {
        self.pool.begin().await.map_err(StoreError::Query)
    }

    pub(crate) fn database_url(&self) -> &str {
        &self.database_url
    }
}
