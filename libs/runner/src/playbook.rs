//! The provisioner: `ansible-playbook` over a one-off inventory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::inventory::{InventoryHost, TempInventory};
use crate::recap::{parse_recap, HostStatus};
use crate::RunnerError;

/// How much of the underlying tool's output to request and surface.
/// Parsed from the `LOG_LEVEL` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Info,
    Debug,
    Trace,
    Trace2,
    Trace3,
}

impl Verbosity {
    pub fn from_level(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "debug" => Verbosity::Debug,
            "trace" | "trace1" | "trace-1" => Verbosity::Trace,
            "trace2" | "trace-2" => Verbosity::Trace2,
            "trace3" | "trace-3" => Verbosity::Trace3,
            _ => Verbosity::Info,
        }
    }

    /// The `-v` flag handed to ansible-playbook, if any.
    pub fn flag(self) -> Option<&'static str> {
        match self {
            Verbosity::Info | Verbosity::Debug => None,
            Verbosity::Trace => Some("-v"),
            Verbosity::Trace2 => Some("-vv"),
            Verbosity::Trace3 => Some("-vvv"),
        }
    }

    /// Whether playbook output and (redacted) inventories go to the log.
    pub fn streams_output(self) -> bool {
        !matches!(self, Verbosity::Info)
    }
}

/// Outcome of one provisioner invocation: a status per requested host plus
/// the stderr tail for error reporting.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub hosts: HashMap<String, HostStatus>,
    pub stderr_tail: String,
}

impl ProvisionReport {
    pub fn all_ok(&self) -> bool {
        self.hosts.values().all(|s| s.is_ok())
    }

    /// Status for a host; requested hosts are always present, so absence
    /// means the caller asked about a host it never submitted.
    pub fn host_ok(&self, name: &str) -> bool {
        self.hosts.get(name).copied().unwrap_or(HostStatus::Unknown).is_ok()
    }

    /// Human-readable summary of the hosts that did not come back ok.
    pub fn failure_details(&self) -> String {
        let mut failing: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, status)| !status.is_ok())
            .map(|(host, status)| format!("{host}={}", status.as_str()))
            .collect();
        failing.sort();
        if self.stderr_tail.is_empty() {
            failing.join(", ")
        } else {
            format!("{}; stderr: {}", failing.join(", "), self.stderr_tail)
        }
    }
}

/// Applies or removes a short-lived user account on a set of hosts.
///
/// Implementations must return a status for every requested host and
/// enforce their own per-host timeout.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create `username` on every host, with the supplied provisioner-ready
    /// (already hashed) credential.
    async fn provision(
        &self,
        hosts: &[InventoryHost],
        username: &str,
        hashed_credential: &str,
    ) -> Result<ProvisionReport, RunnerError>;

    /// Remove `username` from every host.
    async fn deprovision(
        &self,
        hosts: &[InventoryHost],
        username: &str,
    ) -> Result<ProvisionReport, RunnerError>;
}

/// Production provisioner: runs the create/delete playbook.
pub struct PlaybookProvisioner {
    playbook: PathBuf,
    forks: u32,
    verbosity: Verbosity,
    temp_dir: PathBuf,
}

impl PlaybookProvisioner {
    pub fn new(playbook: PathBuf, forks: u32, verbosity: Verbosity, temp_dir: PathBuf) -> Self {
        Self {
            playbook,
            forks,
            verbosity,
            temp_dir,
        }
    }

    fn build_args(&self, inventory: &Path, extra_vars: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(flag) = self.verbosity.flag() {
            args.push(flag.to_string());
        }
        args.push("-f".to_string());
        args.push(self.forks.to_string());
        args.push("-i".to_string());
        args.push(inventory.display().to_string());
        args.push(self.playbook.display().to_string());
        args.push("--extra-vars".to_string());
        args.push(extra_vars.to_string());
        args
    }

    /// Run the playbook and map the recap back onto the requested hosts.
    /// `extra_vars` may carry the hashed credential and must never be
    /// logged.
    async fn run(
        &self,
        hosts: &[InventoryHost],
        extra_vars: String,
    ) -> Result<ProvisionReport, RunnerError> {
        let inventory = TempInventory::write(&self.temp_dir, hosts, None)?;
        if self.verbosity.streams_output() {
            debug!(inventory = %inventory.redacted(), "Invoking playbook");
        }

        let args = self.build_args(inventory.path(), &extra_vars);
        let output = Command::new("ansible-playbook")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                command: "ansible-playbook".to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if self.verbosity.streams_output() {
            for line in stdout.lines() {
                debug!(target: "hostpool_runner::playbook::output", "{line}");
            }
        }

        let combined = format!("{stdout}\n{stderr}");
        let mut statuses = parse_recap(&combined);
        if statuses.is_empty() && !output.status.success() {
            return Err(RunnerError::NoRecap {
                status: output.status.code().unwrap_or(-1),
                stderr_tail: tail(&stderr, 2048),
            });
        }

        for host in hosts {
            statuses
                .entry(host.name.clone())
                .or_insert(HostStatus::Unknown);
        }

        let report = ProvisionReport {
            hosts: statuses,
            stderr_tail: tail(&stderr, 2048),
        };
        if !report.all_ok() {
            warn!(details = %report.failure_details(), "Playbook reported per-host trouble");
        }
        Ok(report)
    }
}

#[async_trait]
impl Provisioner for PlaybookProvisioner {
    async fn provision(
        &self,
        hosts: &[InventoryHost],
        username: &str,
        hashed_credential: &str,
    ) -> Result<ProvisionReport, RunnerError> {
        let extra_vars = format!(
            "username={username} hashed_password={hashed_credential} \
             user_action=create ansible_ssh_timeout=15"
        );
        self.run(hosts, extra_vars).await
    }

    async fn deprovision(
        &self,
        hosts: &[InventoryHost],
        username: &str,
    ) -> Result<ProvisionReport, RunnerError> {
        let extra_vars = format!("username={username} user_action=delete ansible_ssh_timeout=15");
        self.run(hosts, extra_vars).await
    }
}

fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let start = trimmed.len() - max;
    // Stay on a char boundary.
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    trimmed[start..].to_string()
}
