//! Conversions from store rows to runner targets.
//!
//! A machine's current `auth_type` decides how the controller reaches it:
//! registered machines still carry a password; enrolled machines are
//! reached as the fixed target account with the controller key.

use hostpool_runner::{HostAuth, InventoryHost, KeyAccess, ProbeTarget};
use hostpool_store::{AuthType, ExpiredLease, Machine, RecoveredReplacement};

fn auth_for(
    auth_type: AuthType,
    ssh_user: &str,
    ssh_secret: Option<&str>,
    access: &KeyAccess,
) -> (String, HostAuth) {
    match auth_type {
        AuthType::Password => (
            ssh_user.to_string(),
            HostAuth::Password(ssh_secret.unwrap_or_default().to_string()),
        ),
        AuthType::Key => (
            access.user.clone(),
            HostAuth::KeyFile(access.key_path.clone()),
        ),
    }
}

pub(crate) fn machine_host(m: &Machine, access: &KeyAccess) -> InventoryHost {
    let (user, auth) = auth_for(m.auth_type, &m.ssh_user, m.ssh_secret.as_deref(), access);
    InventoryHost {
        name: m.name.clone(),
        host: m.host.clone(),
        port: m.port,
        user,
        auth,
    }
}

pub(crate) fn machine_probe_target(m: &Machine, access: &KeyAccess) -> ProbeTarget {
    let (user, auth) = auth_for(m.auth_type, &m.ssh_user, m.ssh_secret.as_deref(), access);
    ProbeTarget {
        name: m.name.clone(),
        host: m.host.clone(),
        port: m.port,
        user,
        auth,
    }
}

pub(crate) fn expired_host(row: &ExpiredLease, access: &KeyAccess) -> InventoryHost {
    let (user, auth) = auth_for(row.auth_type, &row.ssh_user, row.ssh_secret.as_deref(), access);
    InventoryHost {
        name: row.name.clone(),
        host: row.host.clone(),
        port: row.port,
        user,
        auth,
    }
}

pub(crate) fn replacement_host(row: &RecoveredReplacement, access: &KeyAccess) -> InventoryHost {
    let (user, auth) = auth_for(row.auth_type, &row.ssh_user, row.ssh_secret.as_deref(), access);
    InventoryHost {
        name: row.name.clone(),
        host: row.host.clone(),
        port: row.port,
        user,
        auth,
    }
}
