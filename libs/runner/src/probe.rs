//! SSH reachability probe.
//!
//! Connect + authenticate against a single host, bounded by a timeout.
//! Host-key checking is disabled: this is a health probe, not trust
//! establishment. Idempotent, no side effects on the probed host.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::inventory::HostAuth;

/// The host to probe, with whatever credentials it currently has.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub name: String,
    pub host: String,
    pub port: i32,
    pub user: String,
    pub auth: HostAuth,
}

/// Best-effort liveness test. Every failure mode is `false`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> bool;
}

/// Probes through the OpenSSH client: `sshpass`+`ssh` for password-auth
/// machines, `ssh -i` with the controller key once a machine is enrolled.
#[derive(Debug, Default)]
pub struct SshProber;

fn common_ssh_args(target: &ProbeTarget, timeout: Duration) -> Vec<String> {
    vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", timeout.as_secs().max(1)),
        "-p".to_string(),
        target.port.to_string(),
        format!("{}@{}", target.user, target.host),
        "true".to_string(),
    ]
}

/// Build the probe command line for a target. Returns the program and its
/// arguments; split out so the shape is testable without spawning.
fn probe_command(target: &ProbeTarget, timeout: Duration) -> (String, Vec<String>) {
    match &target.auth {
        HostAuth::Password(secret) => {
            let mut args = vec![
                "-p".to_string(),
                secret.clone(),
                "ssh".to_string(),
                "-o".to_string(),
                "BatchMode=no".to_string(),
            ];
            args.extend(common_ssh_args(target, timeout));
            ("sshpass".to_string(), args)
        }
        HostAuth::KeyFile(key) => {
            let mut args = vec![
                "-i".to_string(),
                key.display().to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
            ];
            args.extend(common_ssh_args(target, timeout));
            ("ssh".to_string(), args)
        }
    }
}

#[async_trait]
impl Prober for SshProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> bool {
        let (program, args) = probe_command(target, timeout);

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        // ConnectTimeout bounds the connect; the outer timeout also covers
        // a hung auth exchange. Dropping the future kills the child.
        let reachable = match tokio::time::timeout(timeout + Duration::from_secs(2), child).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) | Err(_) => false,
        };
        trace!(host = %target.name, reachable, "Probe finished");
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target(auth: HostAuth) -> ProbeTarget {
        ProbeTarget {
            name: "vm-01".to_string(),
            host: "10.0.3.1".to_string(),
            port: 2222,
            user: "iac".to_string(),
            auth,
        }
    }

    #[test]
    fn password_probe_uses_sshpass() {
        let (program, args) = probe_command(
            &target(HostAuth::Password("pw".to_string())),
            Duration::from_secs(10),
        );
        assert_eq!(program, "sshpass");
        assert_eq!(args[0..3], ["-p", "pw", "ssh"]);
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"iac@10.0.3.1".to_string()));
        assert_eq!(args.last().unwrap(), "true");
    }

    #[test]
    fn key_probe_uses_batch_mode() {
        let (program, args) = probe_command(
            &target(HostAuth::KeyFile(PathBuf::from("/secrets/key"))),
            Duration::from_secs(10),
        );
        assert_eq!(program, "ssh");
        assert_eq!(args[0..2], ["-i", "/secrets/key"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"2222".to_string()));
    }

    #[test]
    fn connect_timeout_is_at_least_one_second() {
        let (_, args) = probe_command(
            &target(HostAuth::Password("pw".to_string())),
            Duration::from_millis(100),
        );
        assert!(args.contains(&"ConnectTimeout=1".to_string()));
    }
}
