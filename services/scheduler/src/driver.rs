//! The maintenance loop driver.
//!
//! On each tick the driver takes the cluster-wide advisory lock and runs
//! the phases in a fixed order: Enroller, then Health, then Expirer, then
//! Reconciler. Each phase observes the store after the previous one has
//! committed. A contended lock skips the tick — there is no queueing. A
//! store fault inside a phase ends the tick; work already committed by
//! earlier phases stands.
//!
//! The lock handle is held on a dedicated connection, so even a panic
//! inside a phase releases it when the handle drops.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use hostpool_runner::{PlaybookProvisioner, Prober, Provisioner, SshProber};
use hostpool_store::Store;

use crate::config::Config;
use crate::enroll::Enroller;
use crate::expire::ExpirySweeper;
use crate::health::HealthChecker;
use crate::reconcile::Reconciler;

pub struct MaintenanceLoop {
    store: Store,
    config: Config,
    enroller: Enroller,
    health: HealthChecker,
    expirer: ExpirySweeper,
    reconciler: Reconciler,
}

impl MaintenanceLoop {
    pub fn new(store: Store, config: Config) -> Self {
        let provisioner: Arc<dyn Provisioner> = Arc::new(PlaybookProvisioner::new(
            config.playbook.clone(),
            config.forks,
            config.verbosity,
            config.temp_dir.clone(),
        ));
        let prober: Arc<dyn Prober> = Arc::new(SshProber);
        let access = config.key_access();

        let enroller = Enroller::new(
            store.clone(),
            config.enroll_playbook.clone(),
            config.enroll_private_key.clone(),
            config.enroll_target_user.clone(),
            config.forks,
            config.temp_dir.clone(),
        );
        let health = HealthChecker::new(
            store.clone(),
            prober,
            Arc::clone(&provisioner),
            access.clone(),
            config.health_concurrency,
            config.health_timeout,
        );
        let expirer = ExpirySweeper::new(
            store.clone(),
            Arc::clone(&provisioner),
            access.clone(),
            config.cleanup_batch_size,
        );
        let reconciler = Reconciler::new(
            store.clone(),
            provisioner,
            access,
            config.spare_pool_percent,
        );

        Self {
            store,
            config,
            enroller,
            health,
            expirer,
            reconciler,
        }
    }

    /// Run the loop until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            lock = %self.config.lock_name,
            "Starting maintenance loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        let phase_shutdown = shutdown.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&phase_shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Maintenance loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single tick under the advisory lock.
    pub async fn tick(&self, shutdown: &watch::Receiver<bool>) {
        let lock = match self
            .store
            .acquire_advisory(&self.config.lock_name, self.config.lock_timeout)
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!(lock = %self.config.lock_name, "Tick skipped, lock held elsewhere");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to acquire advisory lock");
                return;
            }
        };

        self.run_phases(shutdown).await;
        lock.release().await;
    }

    async fn run_phases(&self, shutdown: &watch::Receiver<bool>) {
        match self.enroller.run_once(shutdown).await {
            Ok(enrolled) if enrolled > 0 => info!(enrolled, "Enrollment pass complete"),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Enrollment pass failed, ending tick");
                return;
            }
        }
        if *shutdown.borrow() {
            return;
        }

        match self.health.run_once(shutdown).await {
            Ok(stats) => info!(
                total = stats.total,
                reachable = stats.reachable,
                unreachable = stats.unreachable,
                disabled = stats.disabled,
                reenabled = stats.reenabled,
                "Health pass complete"
            ),
            Err(e) => {
                error!(error = %e, "Health pass failed, ending tick");
                return;
            }
        }
        if *shutdown.borrow() {
            return;
        }

        match self.expirer.expire_once(shutdown).await {
            Ok(cleared) if cleared > 0 => info!(cleared, "Cleaned up expired leases"),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Expiry pass failed, ending tick");
                return;
            }
        }
        if *shutdown.borrow() {
            return;
        }

        if let Err(e) = self.reconciler.run_once(shutdown).await {
            error!(error = %e, "Reconciliation pass failed");
        }
    }
}
