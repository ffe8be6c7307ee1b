//! Machine state operations.
//!
//! The eligibility predicate is the heart of allocation safety: a machine
//! can be handed out only when `enabled AND online AND NOT reserved` and it
//! is not quarantined. `enabled` is written by health and enrollment,
//! `online` only by operators; the predicate always ANDs both.
//!
//! Selection order is `reserve_fail_count ASC, id ASC` everywhere a machine
//! is picked — deterministic under contention, and it concentrates repeated
//! failures on fresh hosts instead of recycling known-bad ones.

use chrono::{DateTime, Utc};

use crate::models::Machine;
use crate::{Store, StoreError, StoreTx};

impl Store {
    /// Lock and return up to `limit` eligible machine ids, best first.
    ///
    /// Rows stay locked until the transaction ends, so concurrent
    /// allocators serialize on the same candidates.
    pub async fn select_eligible_for_update(
        &self,
        tx: &mut StoreTx,
        limit: i64,
    ) -> Result<Vec<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
            FROM machines
            WHERE enabled AND online AND NOT reserved
              AND (quarantine_until IS NULL OR quarantine_until <= now())
            ORDER BY reserve_fail_count ASC, id ASC
            LIMIT $1
            FOR UPDATE
            "#,
        )
        .bind(limit)
        .fetch_all(&mut **tx)
        .await
        .map_err(StoreError::Query)
    }

    /// Lock and return the best eligible spare-pool machine, if any.
    pub async fn select_spare_for_update(
        &self,
        tx: &mut StoreTx,
    ) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
            FROM machines
            WHERE spare_pool AND enabled AND online AND NOT reserved
              AND (quarantine_until IS NULL OR quarantine_until <= now())
            ORDER BY reserve_fail_count ASC, id ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::Query)
    }

    /// Mark the given machines reserved for `username` until `until`.
    ///
    /// Predicated on each row still being free; returns whether every row
    /// was updated. A `false` return means a concurrent writer won.
    pub async fn mark_reserved(
        &self,
        tx: &mut StoreTx,
        ids: &[i64],
        username: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE machines
            SET reserved = TRUE, reserved_by = $1, reserved_until = $2
            WHERE id = ANY($3) AND NOT reserved
            "#,
        )
        .bind(username)
        .bind(until)
        .bind(ids)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::Query)?;

        Ok(result.rows_affected() as usize == ids.len())
    }

    /// Reserve a single spare on behalf of `username`, mirroring the primary
    /// lease's expiration (which may be unbounded).
    pub async fn reserve_spare(
        &self,
        tx: &mut StoreTx,
        id: i64,
        username: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE machines
            SET reserved = TRUE, reserved_by = $1, reserved_until = $2
            WHERE id = $3 AND NOT reserved
            "#,
        )
        .bind(username)
        .bind(until)
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    /// Revert the reservation flags on the given machines.
    pub async fn clear_reservation(&self, ids: &[i64]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE machines
            SET reserved = FALSE, reserved_by = NULL, reserved_until = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Record a failed reservation attempt: bump `reserve_fail_count` and
    /// quarantine the machines for `min(60, (fail_count + 1) * 5)` minutes.
    pub async fn apply_failure_backoff(&self, ids: &[i64]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE machines
            SET reserve_fail_count = reserve_fail_count + 1,
                quarantine_until =
                    now() + make_interval(mins => LEAST(60, (reserve_fail_count + 1) * 5))
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Conditionally re-admit a machine; returns whether the flag flipped.
    pub async fn enable_if_disabled(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE machines SET enabled = TRUE WHERE id = $1 AND NOT enabled")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE machines SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    pub async fn touch_last_seen(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE machines SET last_seen_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Load every registered machine.
    pub async fn load_machines(&self) -> Result<Vec<Machine>, StoreError> {
        sqlx::query_as::<_, Machine>("SELECT * FROM machines ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    /// Load full records for the given ids, ordered by id.
    pub async fn load_machines_by_ids(&self, ids: &[i64]) -> Result<Vec<Machine>, StoreError> {
        sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE id = ANY($1) ORDER BY id ASC")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    /// Load one machine inside an open transaction.
    pub async fn machine_by_id(&self, tx: &mut StoreTx, id: i64) -> Result<Machine, StoreError> {
        sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(StoreError::Query)?
            .ok_or(StoreError::NotFound {
                entity: "machine",
                key: id.to_string(),
            })
    }

    /// Machines awaiting enrollment: still on password auth, not admitted.
    pub async fn load_enroll_targets(&self) -> Result<Vec<Machine>, StoreError> {
        sqlx::query_as::<_, Machine>(
            r#"
            SELECT * FROM machines
            WHERE auth_type = 'password' AND NOT enabled
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    /// Flip a machine to key auth and admit it to the pool. The password
    /// secret is dropped; from here on the controller key is the only way in.
    pub async fn mark_enrolled(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE machines
            SET auth_type = 'key', enabled = TRUE, ssh_secret = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Count machines that are enabled and online (the spare-target basis).
    pub async fn count_eligible_total(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM machines WHERE enabled AND online")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    /// Count free spares: spare-pool members that are eligible and idle.
    pub async fn count_free_spares(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM machines
            WHERE spare_pool AND enabled AND online AND NOT reserved
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    /// Available non-spare machines, lowest-failing first, for promotion.
    pub async fn list_spare_candidates(&self, limit: i64) -> Result<Vec<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM machines
            WHERE NOT spare_pool AND enabled AND online AND NOT reserved
            ORDER BY reserve_fail_count ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    /// Idle spares, highest-failing first, for demotion.
    pub async fn list_demotable_spares(&self, limit: i64) -> Result<Vec<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM machines
            WHERE spare_pool AND NOT reserved
            ORDER BY reserve_fail_count DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    /// Promote a machine into the spare pool, predicated on it still being
    /// free and eligible so a concurrent reservation cannot be stolen.
    pub async fn promote_spare(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE machines SET spare_pool = TRUE
            WHERE id = $1 AND NOT spare_pool AND enabled AND online AND NOT reserved
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(result.rows_affected() == 1)
    }

    /// Demote an idle spare back to the general pool.
    pub async fn demote_spare(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE machines SET spare_pool = FALSE WHERE id = $1 AND spare_pool AND NOT reserved",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(result.rows_affected() == 1)
    }

    /// Compute `now() + duration` on the store's clock. This is the single
    /// authoritative expiration used for both machine rows and lease rows.
    pub async fn reservation_expiry(
        &self,
        tx: &mut StoreTx,
        duration_minutes: i32,
    ) -> Result<DateTime<Utc>, StoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT now() + make_interval(mins => $1)")
            .bind(duration_minutes)
            .fetch_one(&mut **tx)
            .await
            .map_err(StoreError::Query)
    }
}
