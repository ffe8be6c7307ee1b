//! Scheduler configuration.
//!
//! Every environment variable the engine recognizes is read exactly once
//! here and handed to components as an immutable value; nothing downstream
//! reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use hostpool_runner::{default_temp_dir, KeyAccess, Verbosity};
use hostpool_store::StoreConfig;

/// Immutable scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store connection settings.
    pub store: StoreConfig,

    /// Maintenance loop period.
    pub interval: Duration,

    /// Name of the cluster-wide advisory lock guarding ticks.
    pub lock_name: String,

    /// How long to wait for the lock before skipping a tick; zero means a
    /// single non-blocking attempt.
    pub lock_timeout: Duration,

    /// Path to the create/delete user playbook.
    pub playbook: PathBuf,

    /// Provisioner concurrency per invocation.
    pub forks: u32,

    /// Provisioner verbosity, mapped from LOG_LEVEL.
    pub verbosity: Verbosity,

    /// Directory for one-off inventories.
    pub temp_dir: PathBuf,

    /// Expirer batch size.
    pub cleanup_batch_size: usize,

    /// Target spare fraction of the eligible pool; zero disables spare
    /// pool maintenance.
    pub spare_pool_percent: u32,

    /// Concurrent health probes.
    pub health_concurrency: usize,

    /// Per-probe timeout.
    pub health_timeout: Duration,

    /// Path to the key-enrollment playbook.
    pub enroll_playbook: PathBuf,

    /// Controller private key installed by enrollment and used for all
    /// key-auth access afterwards.
    pub enroll_private_key: PathBuf,

    /// The fixed target account enrollment provisions.
    pub enroll_target_user: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            interval: Duration::from_secs(60),
            lock_name: "reservation-expiry-cleanup".to_string(),
            lock_timeout: Duration::ZERO,
            playbook: PathBuf::from("/app/playbooks/create-users.yml"),
            forks: 5,
            verbosity: Verbosity::Info,
            temp_dir: default_temp_dir(),
            cleanup_batch_size: 20,
            spare_pool_percent: 0,
            health_concurrency: 10,
            health_timeout: Duration::from_secs(10),
            enroll_playbook: PathBuf::from("/app/playbooks/enroll-ssh.yml"),
            enroll_private_key: PathBuf::from("/app/secrets/ssh/scheduler_ed25519"),
            enroll_target_user: "iac".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            store: StoreConfig::from_env(),
            interval: Duration::from_secs(env_u64("SCHEDULER_INTERVAL", 60)),
            lock_name: env_string("SCHEDULER_LOCK_NAME", &defaults.lock_name),
            lock_timeout: Duration::from_secs(env_u64("DB_LOCK_TIMEOUT", 0)),
            playbook: env_path("ANSIBLE_PLAYBOOK", &defaults.playbook),
            forks: env_u64("ANSIBLE_FORKS", 5) as u32,
            verbosity: Verbosity::from_level(&env_string("LOG_LEVEL", "info")),
            temp_dir: default_temp_dir(),
            cleanup_batch_size: env_u64("CLEANUP_BATCH_SIZE", 20).max(1) as usize,
            spare_pool_percent: env_u64("SPARE_POOL_PERCENT", 0) as u32,
            health_concurrency: env_u64("HEALTH_CONCURRENCY", 10).max(1) as usize,
            health_timeout: Duration::from_secs(env_u64("HEALTH_TIMEOUT_SEC", 10).max(1)),
            enroll_playbook: env_path("ENROLL_PLAYBOOK", &defaults.enroll_playbook),
            enroll_private_key: env_path("ENROLL_PRIVATE_KEY", &defaults.enroll_private_key),
            enroll_target_user: env_string("ENROLL_TARGET_USER", &defaults.enroll_target_user),
        }
    }

    /// Key-based access settings for enrolled machines.
    pub fn key_access(&self) -> KeyAccess {
        KeyAccess {
            user: self.enroll_target_user.clone(),
            key_path: self.enroll_private_key.clone(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &PathBuf) -> PathBuf {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => default.clone(),
    }
}
