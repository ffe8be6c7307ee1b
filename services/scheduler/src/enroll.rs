//! Key enrollment for freshly registered machines.
//!
//! A new machine starts on password auth with `enabled = false`. The
//! enroller installs the controller-managed public key for the fixed
//! target account via the enrollment playbook, then flips the row to key
//! auth and admits it to the pool. Successful enrollment is the only path
//! by which a machine becomes eligible; a failed attempt leaves the row
//! untouched for the next tick.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

use hostpool_runner::{HostAuth, InventoryHost, RunnerError, TempInventory};
use hostpool_store::{Machine, Store};

pub struct Enroller {
    store: Store,
    playbook: PathBuf,
    private_key: PathBuf,
    target_user: String,
    forks: u32,
    temp_dir: PathBuf,
}

impl Enroller {
    pub fn new(
        store: Store,
        playbook: PathBuf,
        private_key: PathBuf,
        target_user: String,
        forks: u32,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            playbook,
            private_key,
            target_user,
            forks,
            temp_dir,
        }
    }

    /// Enroll every pending machine; returns how many were admitted.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<usize> {
        let targets = self.store.load_enroll_targets().await?;
        if targets.is_empty() {
            return Ok(0);
        }

        let mut enrolled = 0;
        for machine in targets {
            if *shutdown.borrow() {
                break;
            }
            match self.enroll_one(&machine).await {
                Ok(true) => {
                    self.store.mark_enrolled(machine.id).await?;
                    enrolled += 1;
                    info!(machine = %machine.name, "Enrolled machine to key auth");
                }
                Ok(false) => {
                    warn!(machine = %machine.name, "Enrollment playbook failed, will retry next tick");
                }
                Err(e) => {
                    warn!(machine = %machine.name, error = %e, "Enrollment invocation failed");
                }
            }
        }
        Ok(enrolled)
    }

    async fn enroll_one(&self, machine: &Machine) -> Result<bool, RunnerError> {
        let ssh_user = if machine.ssh_user.trim().is_empty() {
            "root".to_string()
        } else {
            machine.ssh_user.clone()
        };
        let host = InventoryHost {
            name: machine.name.clone(),
            host: machine.host.clone(),
            port: machine.port,
            user: ssh_user,
            auth: HostAuth::Password(machine.ssh_secret.clone().unwrap_or_default()),
        };
        // The enrollment playbook targets a [targets] group.
        let inventory = TempInventory::write(&self.temp_dir, &[host], Some("targets"))?;

        let key_dir = self
            .private_key
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .display()
            .to_string();
        let extra_vars = format!(
            "target_user={} local_key_dir={} local_private_key_file={}",
            self.target_user,
            key_dir,
            self.private_key.display(),
        );

        let output = Command::new("ansible-playbook")
            .arg("-i")
            .arg(inventory.path())
            .arg(&self.playbook)
            .arg("--forks")
            .arg(self.forks.to_string())
            .arg("--extra-vars")
            .arg(extra_vars)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                command: "ansible-playbook".to_string(),
                source,
            })?;

        Ok(output.status.success())
    }
}
