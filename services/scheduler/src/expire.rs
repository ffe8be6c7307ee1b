//! Expired lease sweep.
//!
//! Expired leases are grouped per user (one deprovision call per batch
//! keeps provisioner fanout down) and the recap decides each host's fate:
//! a clean teardown releases the lease and machine together; anything else
//! hides the machine behind `enabled = false` so health re-admits it
//! before the next attempt. The database is only ever cleared after a
//! confirmed teardown.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use hostpool_runner::{InventoryHost, KeyAccess, Provisioner};
use hostpool_store::{ExpiredLease, Store};

use crate::hosts::expired_host;

pub struct ExpirySweeper {
    store: Store,
    provisioner: Arc<dyn Provisioner>,
    access: KeyAccess,
    batch_size: usize,
}

impl ExpirySweeper {
    pub fn new(
        store: Store,
        provisioner: Arc<dyn Provisioner>,
        access: KeyAccess,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            provisioner,
            access,
            batch_size: batch_size.max(1),
        }
    }

    /// Sweep every expired lease once; returns how many were cleared.
    ///
    /// Cancellation is honored between batches and between host writes; a
    /// cancelled sweep keeps the work already applied.
    pub async fn expire_once(&self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<usize> {
        let rows = self.store.load_expired().await?;
        if rows.is_empty() {
            debug!("No expired leases to clean up");
            return Ok(0);
        }

        let mut cleared = 0;
        for (username, items) in group_by_username(rows) {
            for chunk in items.chunks(self.batch_size) {
                if *shutdown.borrow() {
                    return Ok(cleared);
                }

                let hosts: Vec<InventoryHost> = chunk
                    .iter()
                    .map(|row| expired_host(row, &self.access))
                    .collect();

                let report = match self.provisioner.deprovision(&hosts, &username).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(user = %username, error = %e, "Deprovision batch failed outright");
                        // No recap to trust; hide every host in the batch
                        // until health confirms it is reachable again.
                        for row in chunk {
                            self.store.set_enabled(row.machine_id, false).await?;
                        }
                        continue;
                    }
                };

                for row in chunk {
                    if *shutdown.borrow() {
                        return Ok(cleared);
                    }
                    if report.host_ok(&row.name) {
                        self.store.release_lease(row.lease_id, row.machine_id).await?;
                        cleared += 1;
                    } else {
                        self.store.set_enabled(row.machine_id, false).await?;
                        warn!(
                            user = %username,
                            machine = %row.name,
                            "Teardown failed, machine disabled until health re-admits it"
                        );
                    }
                }
            }
        }

        if cleared > 0 {
            info!(cleared, "Expiry sweep complete");
        }
        Ok(cleared)
    }
}

/// Group rows by username, preserving the store's (username, lease id)
/// ordering. Rows arrive sorted, so groups are consecutive runs.
fn group_by_username(rows: Vec<ExpiredLease>) -> Vec<(String, Vec<ExpiredLease>)> {
    let mut groups: Vec<(String, Vec<ExpiredLease>)> = Vec::new();
    for row in rows {
        if let Some((username, items)) = groups.last_mut() {
            if *username == row.username {
                items.push(row);
                continue;
            }
        }
        groups.push((row.username.clone(), vec![row]));
    }
    groups
}
