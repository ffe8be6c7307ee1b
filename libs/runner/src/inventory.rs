//! One-off INI inventory files.
//!
//! One host per line: `<name> ansible_host=<h> ansible_port=<p>
//! ansible_user=<u> ansible_password=<escaped>`, with backslash, space and
//! `=` escaped by a `\` prefix. Key-auth hosts carry
//! `ansible_ssh_private_key_file` instead of a password.
//!
//! Inventories hold host secrets, so they are written to a dedicated temp
//! directory (tmpfs when available) with owner-only permissions and are
//! removed when the handle drops, on every exit path. Logged inventories
//! must always pass through [`redact_inventory`] first.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tempfile::NamedTempFile;

use crate::RunnerError;

/// Credentials for one inventory line.
#[derive(Debug, Clone)]
pub enum HostAuth {
    /// Password auth; the value lands in `ansible_password=`.
    Password(String),
    /// Key auth via the controller-managed private key.
    KeyFile(PathBuf),
}

/// Key-based access settings shared by every enrolled machine: the fixed
/// target account the enrollment playbook provisioned, and the controller's
/// private key.
#[derive(Debug, Clone)]
pub struct KeyAccess {
    pub user: String,
    pub key_path: PathBuf,
}

/// A single target line for an INI-style inventory.
#[derive(Debug, Clone)]
pub struct InventoryHost {
    pub name: String,
    pub host: String,
    pub port: i32,
    pub user: String,
    pub auth: HostAuth,
}

impl InventoryHost {
    fn line(&self) -> String {
        let mut line = String::new();
        let _ = write!(
            line,
            "{} ansible_host={} ansible_port={} ansible_user={}",
            self.name,
            escape_value(&self.host),
            self.port,
            escape_value(&self.user),
        );
        match &self.auth {
            HostAuth::Password(secret) => {
                let _ = write!(line, " ansible_password={}", escape_value(secret));
            }
            HostAuth::KeyFile(path) => {
                let _ = write!(
                    line,
                    " ansible_ssh_private_key_file={}",
                    escape_value(&path.display().to_string()),
                );
            }
        }
        line.push('\n');
        line
    }
}

/// Escape characters that would break the key=value inventory format.
pub(crate) fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

static PASSWORD_RE: OnceLock<Regex> = OnceLock::new();

/// Redact `ansible_password=` values for safe logging.
pub fn redact_inventory(inventory: &str) -> String {
    let re = PASSWORD_RE
        .get_or_init(|| Regex::new(r"(?m)(ansible_password=)(\S+)").expect("static regex"));
    re.replace_all(inventory, "${1}***").into_owned()
}

/// The directory one-off inventories are written to: tmpfs when the host
/// has it, the system temp directory otherwise.
pub fn default_temp_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// A written inventory file, deleted when dropped.
pub struct TempInventory {
    file: NamedTempFile,
    rendered: String,
}

impl TempInventory {
    /// Render and write an inventory for `hosts`, optionally under a group
    /// header (the enrollment playbook targets a `[targets]` group).
    pub fn write(
        dir: &Path,
        hosts: &[InventoryHost],
        group: Option<&str>,
    ) -> Result<Self, RunnerError> {
        let mut rendered = String::new();
        if let Some(group) = group {
            let _ = writeln!(rendered, "[{group}]");
        }
        for host in hosts {
            rendered.push_str(&host.line());
        }

        let file = tempfile::Builder::new()
            .prefix("inv-")
            .suffix(".ini")
            .tempfile_in(dir)
            .map_err(RunnerError::Inventory)?;
        std::fs::write(file.path(), &rendered).map_err(RunnerError::Inventory)?;

        Ok(Self { file, rendered })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The inventory contents with host secrets redacted, for elevated
    /// verbosity logging.
    pub fn redacted(&self) -> String {
        redact_inventory(&self.rendered)
    }
}
