//! Periodic reachability checks.
//!
//! A bounded fan-out probes every registered machine. Reachable machines
//! get `last_seen_at` touched and are re-admitted if health had disabled
//! them; a re-admission immediately attempts an opportunistic expiry sweep
//! for that one machine, so leases that expired while it was dark do not
//! wait for the next periodic pass. Unreachable machines are hidden from
//! allocation with `enabled = false`.
//!
//! Recovery work is best-effort throughout: a failure never escalates
//! beyond the machine it concerns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use hostpool_runner::{KeyAccess, Prober, Provisioner};
use hostpool_store::{Machine, Store, StoreError};

use crate::hosts::{expired_host, machine_probe_target};

/// Summary of one health pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthStats {
    pub total: usize,
    pub reachable: usize,
    pub unreachable: usize,
    /// Machines this pass disabled.
    pub disabled: usize,
    /// Machines this pass re-admitted.
    pub reenabled: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicUsize,
    reachable: AtomicUsize,
    unreachable: AtomicUsize,
    disabled: AtomicUsize,
    reenabled: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> HealthStats {
        HealthStats {
            total: self.total.load(Ordering::Relaxed),
            reachable: self.reachable.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            disabled: self.disabled.load(Ordering::Relaxed),
            reenabled: self.reenabled.load(Ordering::Relaxed),
        }
    }
}

pub struct HealthChecker {
    store: Store,
    prober: Arc<dyn Prober>,
    provisioner: Arc<dyn Provisioner>,
    access: KeyAccess,
    concurrency: usize,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        store: Store,
        prober: Arc<dyn Prober>,
        provisioner: Arc<dyn Provisioner>,
        access: KeyAccess,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            prober,
            provisioner,
            access,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Probe every machine once with bounded concurrency.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<HealthStats> {
        let machines = self.store.load_machines().await?;
        if machines.is_empty() {
            return Ok(HealthStats::default());
        }

        let counters = Counters::default();
        futures_util::stream::iter(machines)
            .for_each_concurrent(self.concurrency, |machine| {
                let counters = &counters;
                async move {
                    if *shutdown.borrow() {
                        return;
                    }
                    self.check_one(machine, counters).await;
                }
            })
            .await;

        Ok(counters.snapshot())
    }

    async fn check_one(&self, machine: Machine, counters: &Counters) {
        counters.total.fetch_add(1, Ordering::Relaxed);

        let target = machine_probe_target(&machine, &self.access);
        if self.prober.probe(&target, self.timeout).await {
            counters.reachable.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.store.touch_last_seen(machine.id).await {
                warn!(machine = %machine.name, error = %e, "Failed to update last_seen_at");
            }
            match self.store.enable_if_disabled(machine.id).await {
                Ok(true) => {
                    counters.reenabled.fetch_add(1, Ordering::Relaxed);
                    debug!(machine = %machine.name, "Machine re-admitted");
                    if let Err(e) = self.opportunistic_expiry(&machine).await {
                        warn!(machine = %machine.name, error = %e, "Opportunistic expiry failed");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(machine = %machine.name, error = %e, "Failed to re-enable machine");
                }
            }
        } else {
            counters.unreachable.fetch_add(1, Ordering::Relaxed);
            if machine.enabled {
                match self.store.set_enabled(machine.id, false).await {
                    Ok(()) => {
                        counters.disabled.fetch_add(1, Ordering::Relaxed);
                        warn!(machine = %machine.name, "Machine unreachable, disabled");
                    }
                    Err(e) => {
                        warn!(machine = %machine.name, error = %e, "Failed to disable machine");
                    }
                }
            }
        }
    }

    /// Tear down leases that expired while this machine was dark. Clean
    /// teardowns release immediately; anything else is left for the
    /// periodic sweep.
    async fn opportunistic_expiry(&self, machine: &Machine) -> Result<(), StoreError> {
        let rows = self.store.load_expired_for_machine(machine.id).await?;
        for row in rows {
            let host = expired_host(&row, &self.access);
            match self.provisioner.deprovision(&[host], &row.username).await {
                Ok(report) if report.host_ok(&row.name) => {
                    if let Err(e) = self.store.release_lease(row.lease_id, row.machine_id).await {
                        warn!(
                            machine = %row.name,
                            user = %row.username,
                            error = %e,
                            "Failed to release expired lease after recovery"
                        );
                    }
                }
                Ok(_) => {
                    debug!(
                        machine = %row.name,
                        user = %row.username,
                        "Recovery teardown not clean, leaving for the periodic sweep"
                    );
                }
                Err(e) => {
                    debug!(machine = %row.name, error = %e, "Recovery teardown invocation failed");
                }
            }
        }
        Ok(())
    }
}
