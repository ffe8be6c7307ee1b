//! `PLAY RECAP` parsing.
//!
//! Example line:
//! `vm-07 : ok=3 changed=1 unreachable=0 failed=0 skipped=0 rescued=0 ignored=0`

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Per-host outcome of a playbook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Ok,
    Unreachable,
    Failed,
    /// The host never appeared in the recap. Treated as failed by policy.
    Unknown,
}

impl HostStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, HostStatus::Ok)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Ok => "ok",
            HostStatus::Unreachable => "unreachable",
            HostStatus::Failed => "failed",
            HostStatus::Unknown => "unknown",
        }
    }
}

static RECAP_RE: OnceLock<Regex> = OnceLock::new();

/// Extract per-host status from recap lines anywhere in `output`.
/// `unreachable != 0` wins over `failed != 0`; otherwise the host is ok.
pub fn parse_recap(output: &str) -> HashMap<String, HostStatus> {
    let re = RECAP_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*([^\s:]+)\s*:\s*ok=(\d+)\s+changed=\d+\s+unreachable=(\d+)\s+failed=(\d+)")
            .expect("static regex")
    });

    let mut result = HashMap::new();
    for captures in re.captures_iter(output) {
        let host = captures[1].to_string();
        let unreachable = &captures[3] != "0";
        let failed = &captures[4] != "0";
        let status = if unreachable {
            HostStatus::Unreachable
        } else if failed {
            HostStatus::Failed
        } else {
            HostStatus::Ok
        };
        result.insert(host, status);
    }
    result
}
