//! Store error types.

use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A referenced row was not found.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

impl StoreError {
    /// Check if this is a retryable error.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Connect(_) => true,
            StoreError::Query(e) => is_retryable_sqlx_error(e),
            StoreError::NotFound { .. } => false,
        }
    }
}

fn is_retryable_sqlx_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            // Postgres error codes that are retryable
            if let Some(code) = db_err.code() {
                matches!(
                    code.as_ref(),
                    "40001" | // serialization_failure
                    "40P01" | // deadlock_detected
                    "57P01" | // admin_shutdown
                    "57P02" | // crash_shutdown
                    "57P03"   // cannot_connect_now
                )
            } else {
                false
            }
        }
        _ => false,
    }
}
