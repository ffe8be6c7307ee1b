//! Lease lifecycle operations.
//!
//! A lease is *active* while its `reserved_until` is NULL or in the future.
//! Deleting a lease and clearing its machine's reservation flags always
//! happen in the same transaction, so `machines.reserved` and the existence
//! of an active lease can never disagree at a committed point.

use crate::models::{ExpiredLease, NewLease, RecoveredReplacement, ReplacementNeed};
use crate::{Store, StoreError, StoreTx};

impl Store {
    /// Resolve a username to its user id.
    pub async fn lookup_user_id(&self, username: &str) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    /// Resolve a username to its user id inside an open transaction.
    pub async fn user_id_by_name(
        &self,
        tx: &mut StoreTx,
        username: &str,
    ) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&mut **tx)
            .await
            .map_err(StoreError::Query)
    }

    /// Insert one lease row per reserved machine, atomically.
    pub async fn insert_leases(&self, rows: &[NewLease]) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        for row in rows {
            insert_lease(&mut tx, row).await?;
        }
        tx.commit().await.map_err(StoreError::Query)
    }

    /// Insert a replacement lease inside an open transaction.
    pub async fn insert_replacement_lease(
        &self,
        tx: &mut StoreTx,
        row: &NewLease,
    ) -> Result<(), StoreError> {
        insert_lease(tx, row).await
    }

    /// Expired leases joined with machine connection details, restricted to
    /// machines that are currently enabled (teardown on a dark host cannot
    /// succeed; health re-admits it first). Ordered by username then lease
    /// id so the expirer can batch per user deterministically.
    pub async fn load_expired(&self) -> Result<Vec<ExpiredLease>, StoreError> {
        sqlx::query_as::<_, ExpiredLease>(&expired_query(false))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    /// Expired leases for a single machine, for opportunistic teardown when
    /// the machine recovers mid-interval.
    pub async fn load_expired_for_machine(
        &self,
        machine_id: i64,
    ) -> Result<Vec<ExpiredLease>, StoreError> {
        sqlx::query_as::<_, ExpiredLease>(&expired_query(true))
            .bind(machine_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    /// Active primary leases whose machine is disabled and that have no
    /// active replacement covering them yet.
    pub async fn load_needing_replacement(&self) -> Result<Vec<ReplacementNeed>, StoreError> {
        sqlx::query_as::<_, ReplacementNeed>(
            r#"
            SELECT pl.username,
                   pl.machine_id AS primary_machine_id,
                   pl.reserved_until,
                   pl.hashed_password
            FROM leases pl
            JOIN machines pm ON pm.id = pl.machine_id
            LEFT JOIN leases rl
                   ON rl.replacement_for_machine_id = pl.machine_id
                  AND rl.username = pl.username
                  AND (rl.reserved_until IS NULL OR rl.reserved_until > now())
            WHERE (pl.reserved_until IS NULL OR pl.reserved_until > now())
              AND pl.replacement_for_machine_id IS NULL
              AND NOT pm.enabled
              AND rl.id IS NULL
            ORDER BY pl.username ASC, pl.machine_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    /// Re-verify, under the transaction's locks, that a primary still needs
    /// a replacement: lease active, machine disabled, no active replacement.
    pub async fn replacement_still_needed(
        &self,
        tx: &mut StoreTx,
        primary_machine_id: i64,
        username: &str,
    ) -> Result<bool, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM leases pl
            JOIN machines pm ON pm.id = pl.machine_id
            LEFT JOIN leases rl
                   ON rl.replacement_for_machine_id = pl.machine_id
                  AND rl.username = pl.username
                  AND (rl.reserved_until IS NULL OR rl.reserved_until > now())
            WHERE (pl.reserved_until IS NULL OR pl.reserved_until > now())
              AND pl.replacement_for_machine_id IS NULL
              AND NOT pm.enabled
              AND pl.machine_id = $1
              AND pl.username = $2
              AND rl.id IS NULL
            "#,
        )
        .bind(primary_machine_id)
        .bind(username)
        .fetch_one(&mut **tx)
        .await
        .map_err(StoreError::Query)?;

        Ok(count > 0)
    }

    /// Active replacement leases whose primary machine (and primary lease)
    /// are back, joined with the replacement machine's connection details.
    pub async fn load_recovered_replacements(
        &self,
    ) -> Result<Vec<RecoveredReplacement>, StoreError> {
        sqlx::query_as::<_, RecoveredReplacement>(
            r#"
            SELECT rl.id AS lease_id,
                   rl.machine_id AS replacement_machine_id,
                   rl.replacement_for_machine_id AS primary_machine_id,
                   rl.username,
                   rm.name, rm.host, rm.port, rm.ssh_user, rm.ssh_secret, rm.auth_type
            FROM leases rl
            JOIN machines pm ON pm.id = rl.replacement_for_machine_id
            JOIN leases pl ON pl.machine_id = rl.replacement_for_machine_id
                          AND pl.username = rl.username
                          AND (pl.reserved_until IS NULL OR pl.reserved_until > now())
            JOIN machines rm ON rm.id = rl.machine_id
            WHERE (rl.reserved_until IS NULL OR rl.reserved_until > now())
              AND pm.enabled
            ORDER BY rl.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    /// Delete a lease and free its machine in one transaction.
    pub async fn release_lease(&self, lease_id: i64, machine_id: i64) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        clear_machine(&mut tx, machine_id).await?;
        sqlx::query("DELETE FROM leases WHERE id = $1")
            .bind(lease_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Query)?;
        tx.commit().await.map_err(StoreError::Query)
    }

    /// Release a replacement lease, but only after rechecking inside the
    /// transaction that the replacement is still active and its primary is
    /// still enabled. Returns whether the release happened.
    pub async fn release_replacement_if_recovered(
        &self,
        lease_id: i64,
        machine_id: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;

        let still = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM leases rl
            JOIN machines pm ON pm.id = rl.replacement_for_machine_id
            WHERE rl.id = $1
              AND (rl.reserved_until IS NULL OR rl.reserved_until > now())
              AND pm.enabled
            "#,
        )
        .bind(lease_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::Query)?;

        if still == 0 {
            let _ = tx.rollback().await;
            return Ok(false);
        }

        sqlx::query("DELETE FROM leases WHERE id = $1")
            .bind(lease_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Query)?;
        clear_machine(&mut tx, machine_id).await?;

        tx.commit().await.map_err(StoreError::Query)?;
        Ok(true)
    }
}

async fn insert_lease(tx: &mut StoreTx, row: &NewLease) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO leases
            (machine_id, user_id, username, reserved_until, hashed_password,
             replacement_for_machine_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(row.machine_id)
    .bind(row.user_id)
    .bind(&row.username)
    .bind(row.reserved_until)
    .bind(&row.hashed_password)
    .bind(row.replacement_for_machine_id)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::Query)?;
    Ok(())
}

async fn clear_machine(tx: &mut StoreTx, machine_id: i64) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE machines
        SET reserved = FALSE, reserved_by = NULL, reserved_until = NULL
        WHERE id = $1
        "#,
    )
    .bind(machine_id)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::Query)?;
    Ok(())
}

fn expired_query(for_machine: bool) -> String {
    let mut q = String::from(
        r#"
        SELECT l.id AS lease_id, l.machine_id, l.username,
               m.name, m.host, m.port, m.ssh_user, m.ssh_secret, m.auth_type
        FROM leases l
        JOIN machines m ON m.id = l.machine_id
        WHERE l.reserved_until IS NOT NULL
          AND l.reserved_until <= now()
          AND m.enabled
        "#,
    );
    if for_machine {
        q.push_str("  AND l.machine_id = $1\n");
    }
    q.push_str("ORDER BY l.username ASC, l.id ASC");
    q
}
