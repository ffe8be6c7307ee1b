//! Replacement reconciliation.
//!
//! Three ordered sub-passes per tick:
//!
//! 1. Spare pool sizing toward `total_eligible * SPARE_POOL_PERCENT / 100`
//!    free spares. Promotion and demotion are predicated on current flags
//!    so concurrent reservations cannot have a spare stolen from under
//!    them.
//! 2. Release replacements whose primary machine recovered: best-effort
//!    teardown on the replacement host, then a transactional recheck
//!    before the lease is deleted and the spare freed.
//! 3. Allocate replacements for active primary leases on disabled
//!    machines. The spare is reserved, the replacement lease inserted and
//!    the user provisioned all before the transaction commits; provisioner
//!    failure rolls the whole allocation back.
//!
//! Per-row trouble is logged and skipped; only store faults end the pass.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use hostpool_runner::{KeyAccess, Provisioner};
use hostpool_store::{NewLease, ReplacementNeed, Store};

use crate::hosts::{machine_host, replacement_host};

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub promoted: usize,
    pub demoted: usize,
    pub released: usize,
    pub allocated: usize,
    pub failed: usize,
    /// Needs skipped because the primary lease has no stored credential.
    pub skipped_no_credential: usize,
}

pub struct Reconciler {
    store: Store,
    provisioner: Arc<dyn Provisioner>,
    access: KeyAccess,
    spare_pool_percent: u32,
}

impl Reconciler {
    pub fn new(
        store: Store,
        provisioner: Arc<dyn Provisioner>,
        access: KeyAccess,
        spare_pool_percent: u32,
    ) -> Self {
        Self {
            store,
            provisioner,
            access,
            spare_pool_percent,
        }
    }

    /// Run a single reconciliation pass.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        // Pool sizing is advisory; trouble here must not block replacement
        // handling.
        if let Err(e) = self.enforce_spare_pool(&mut stats).await {
            warn!(error = %e, "Spare pool enforcement failed");
        }

        self.release_recovered(&mut stats, shutdown).await?;
        self.allocate_replacements(&mut stats, shutdown).await?;

        if stats != ReconcileStats::default() {
            info!(
                promoted = stats.promoted,
                demoted = stats.demoted,
                released = stats.released,
                allocated = stats.allocated,
                failed = stats.failed,
                skipped_no_credential = stats.skipped_no_credential,
                "Reconciliation pass complete"
            );
        }
        Ok(stats)
    }

    /// Sub-pass (a): keep `desired` free spares, promoting the healthiest
    /// available machines and demoting the weakest idle spares.
    async fn enforce_spare_pool(&self, stats: &mut ReconcileStats) -> anyhow::Result<()> {
        if self.spare_pool_percent == 0 {
            debug!("Spare pool maintenance disabled");
            return Ok(());
        }

        let total = self.store.count_eligible_total().await?;
        if total == 0 {
            return Ok(());
        }
        let desired = total * i64::from(self.spare_pool_percent) / 100;
        let current = self.store.count_free_spares().await?;
        debug!(total, desired, current, "Spare pool status");

        if current < desired {
            for id in self.store.list_spare_candidates(desired - current).await? {
                if self.store.promote_spare(id).await? {
                    stats.promoted += 1;
                }
            }
        } else if current > desired {
            for id in self.store.list_demotable_spares(current - desired).await? {
                if self.store.demote_spare(id).await? {
                    stats.demoted += 1;
                }
            }
        }
        Ok(())
    }

    /// Sub-pass (b): free replacements whose primary is reachable again.
    async fn release_recovered(
        &self,
        stats: &mut ReconcileStats,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let rows = self.store.load_recovered_replacements().await?;
        for row in rows {
            if *shutdown.borrow() {
                return Ok(());
            }

            // Best-effort teardown before the release; if it fails, the
            // account lingers on a machine about to rejoin the free pool
            // and the next expiry of that host cleans it up.
            let host = replacement_host(&row, &self.access);
            match self.provisioner.deprovision(&[host], &row.username).await {
                Ok(report) if report.host_ok(&row.name) => {
                    debug!(machine = %row.name, user = %row.username, "Replacement account removed");
                }
                Ok(_) | Err(_) => {
                    warn!(
                        machine = %row.name,
                        user = %row.username,
                        "Teardown on replacement failed, releasing anyway"
                    );
                }
            }

            if self
                .store
                .release_replacement_if_recovered(row.lease_id, row.replacement_machine_id)
                .await?
            {
                stats.released += 1;
                info!(
                    machine = %row.name,
                    user = %row.username,
                    primary_machine_id = row.primary_machine_id,
                    "Released replacement, primary recovered"
                );
            }
        }
        Ok(())
    }

    /// Sub-pass (c): cover disabled primaries from the spare pool.
    async fn allocate_replacements(
        &self,
        stats: &mut ReconcileStats,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let needs = self.store.load_needing_replacement().await?;
        if !needs.is_empty() {
            debug!(needs = needs.len(), "Primaries needing replacement");
        }

        for need in needs {
            if *shutdown.borrow() {
                return Ok(());
            }

            let Some(hashed) = need.hashed_password.clone() else {
                warn!(
                    user = %need.username,
                    primary_machine_id = need.primary_machine_id,
                    "No stored credential for primary lease, cannot provision a replacement"
                );
                stats.skipped_no_credential += 1;
                continue;
            };

            match self.allocate_one(&need, &hashed).await {
                Ok(true) => stats.allocated += 1,
                Ok(false) => {}
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        user = %need.username,
                        primary_machine_id = need.primary_machine_id,
                        error = %e,
                        "Replacement allocation failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Reserve one spare as a replacement, mirroring the primary lease's
    /// expiration, and provision the user before committing. Returns false
    /// when the need evaporated or no spare was free.
    async fn allocate_one(&self, need: &ReplacementNeed, hashed: &str) -> anyhow::Result<bool> {
        let mut tx = self.store.begin().await?;

        if !self
            .store
            .replacement_still_needed(&mut tx, need.primary_machine_id, &need.username)
            .await?
        {
            let _ = tx.rollback().await;
            return Ok(false);
        }

        let Some(spare_id) = self.store.select_spare_for_update(&mut tx).await? else {
            let _ = tx.rollback().await;
            warn!(
                user = %need.username,
                primary_machine_id = need.primary_machine_id,
                "No spare machines available"
            );
            return Ok(false);
        };
        let spare = self.store.machine_by_id(&mut tx, spare_id).await?;

        let Some(user_id) = self.store.user_id_by_name(&mut tx, &need.username).await? else {
            let _ = tx.rollback().await;
            anyhow::bail!("lease owner '{}' has no user row", need.username);
        };

        if !self
            .store
            .reserve_spare(&mut tx, spare_id, &need.username, need.reserved_until)
            .await?
        {
            let _ = tx.rollback().await;
            return Ok(false);
        }

        self.store
            .insert_replacement_lease(
                &mut tx,
                &NewLease {
                    machine_id: spare_id,
                    user_id,
                    username: need.username.clone(),
                    reserved_until: need.reserved_until,
                    hashed_password: Some(hashed.to_string()),
                    replacement_for_machine_id: Some(need.primary_machine_id),
                },
            )
            .await?;

        // Provision before committing: a replacement the user cannot log
        // into must not exist.
        let host = machine_host(&spare, &self.access);
        let provisioned = match self.provisioner.provision(&[host], &need.username, hashed).await {
            Ok(report) => report.host_ok(&spare.name),
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e.into());
            }
        };
        if !provisioned {
            let _ = tx.rollback().await;
            anyhow::bail!("provisioning on replacement host {} failed", spare.name);
        }

        tx.commit().await?;
        info!(
            machine = %spare.name,
            user = %need.username,
            primary_machine_id = need.primary_machine_id,
            until = ?need.reserved_until,
            "Allocated replacement from spare pool"
        );
        Ok(true)
    }
}
