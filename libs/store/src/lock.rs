//! Cluster-wide named advisory lock.
//!
//! Only one maintenance loop in the cluster may run a tick at a time. The
//! lock is a Postgres session-level advisory lock held on a dedicated
//! connection opened outside the pool: pool connections get recycled
//! between statements, which would silently drop a session lock. Because
//! the lock is bound to the session, the server releases it whenever the
//! connection goes away — so dropping the handle (including during a
//! panic unwind) releases the lock even if `release` is never called.

use std::time::Duration;

use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection};
use tracing::debug;

use crate::{Store, StoreError};

/// A held advisory lock. Release it explicitly with [`AdvisoryLock::release`];
/// dropping the handle also releases it by closing the connection.
pub struct AdvisoryLock {
    conn: PgConnection,
    key: i64,
    name: String,
}

impl Store {
    /// Try to acquire the named advisory lock, polling until `timeout`
    /// elapses. A zero timeout is a single non-blocking attempt. Returns
    /// `Ok(None)` when the lock is held elsewhere.
    pub async fn acquire_advisory(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<AdvisoryLock>, StoreError> {
        let mut conn = PgConnection::connect(self.database_url())
            .await
            .map_err(StoreError::Connect)?;

        let key = advisory_key(name);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut conn)
                .await;

            match acquired {
                Ok(true) => {
                    debug!(lock = name, key, "Advisory lock acquired");
                    return Ok(Some(AdvisoryLock {
                        conn,
                        key,
                        name: name.to_string(),
                    }));
                }
                Ok(false) => {
                    if tokio::time::Instant::now() >= deadline {
                        let _ = conn.close().await;
                        return Ok(None);
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    let _ = conn.close().await;
                    return Err(StoreError::Query(e));
                }
            }
        }
    }
}

impl AdvisoryLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unlock and close the dedicated connection.
    pub async fn release(mut self) {
        let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut self.conn)
            .await;
        debug!(lock = %self.name, "Advisory lock released");
        let _ = self.conn.close().await;
    }
}

/// Derive the 64-bit lock key from the configured lock name. Postgres
/// advisory locks are keyed by bigint, not by name.
fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
