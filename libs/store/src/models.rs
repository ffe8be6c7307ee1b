//! Row types for the three entities and the maintenance joins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;

/// How the controller authenticates against a machine.
///
/// A machine is registered with `password` auth and flips to `key` when the
/// enroller installs the controller's public key. Enrollment is the only
/// admission path into the eligible pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Password,
    Key,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Password => "password",
            AuthType::Key => "key",
        }
    }
}

fn decode_auth_type(row: &PgRow) -> Result<AuthType, sqlx::Error> {
    let value: String = row.try_get("auth_type")?;
    match value.as_str() {
        "password" => Ok(AuthType::Password),
        "key" => Ok(AuthType::Key),
        other => Err(sqlx::Error::ColumnDecode {
            index: "auth_type".to_string(),
            source: format!("unknown auth_type '{other}'").into(),
        }),
    }
}

/// An identity that owns leases. Never created or destroyed by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            is_admin: row.try_get("is_admin")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A managed remote host.
#[derive(Debug, Clone, Serialize)]
pub struct Machine {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub ssh_user: String,
    /// Password secret; absent once the machine is enrolled to key auth.
    #[serde(skip_serializing)]
    pub ssh_secret: Option<String>,
    pub auth_type: AuthType,
    /// Admitted into the eligible pool. Set and cleared by health/enrollment.
    pub enabled: bool,
    /// Operator-controlled up/down flag, distinct from `enabled`.
    pub online: bool,
    pub reserved: bool,
    pub spare_pool: bool,
    pub reserved_by: Option<String>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub reserve_fail_count: i32,
    pub quarantine_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Machine {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            ssh_user: row.try_get("ssh_user")?,
            ssh_secret: row.try_get("ssh_secret")?,
            auth_type: decode_auth_type(row)?,
            enabled: row.try_get("enabled")?,
            online: row.try_get("online")?,
            reserved: row.try_get("reserved")?,
            spare_pool: row.try_get("spare_pool")?,
            reserved_by: row.try_get("reserved_by")?,
            reserved_until: row.try_get("reserved_until")?,
            last_seen_at: row.try_get("last_seen_at")?,
            reserve_fail_count: row.try_get("reserve_fail_count")?,
            quarantine_until: row.try_get("quarantine_until")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A bounded holding of one machine by one user.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub id: i64,
    pub machine_id: i64,
    pub user_id: i64,
    /// Snapshot of the owner's username at insert time; renames do not
    /// propagate.
    pub username: String,
    /// `None` means unbounded. Immutable after creation.
    pub reserved_until: Option<DateTime<Utc>>,
    /// Provisioner-ready credential, kept so a replacement host can be
    /// provisioned for the same user mid-lease.
    #[serde(skip_serializing)]
    pub hashed_password: Option<String>,
    /// When set, this lease covers the named primary machine for the same
    /// user while that machine is down.
    pub replacement_for_machine_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Lease {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            machine_id: row.try_get("machine_id")?,
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            reserved_until: row.try_get("reserved_until")?,
            hashed_password: row.try_get("hashed_password")?,
            replacement_for_machine_id: row.try_get("replacement_for_machine_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Values for a lease row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewLease {
    pub machine_id: i64,
    pub user_id: i64,
    pub username: String,
    pub reserved_until: Option<DateTime<Utc>>,
    pub hashed_password: Option<String>,
    pub replacement_for_machine_id: Option<i64>,
}

/// An expired lease joined with its machine's connection details, as needed
/// to tear the account down.
#[derive(Debug, Clone)]
pub struct ExpiredLease {
    pub lease_id: i64,
    pub machine_id: i64,
    pub username: String,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub ssh_user: String,
    pub ssh_secret: Option<String>,
    pub auth_type: AuthType,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ExpiredLease {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            lease_id: row.try_get("lease_id")?,
            machine_id: row.try_get("machine_id")?,
            username: row.try_get("username")?,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            ssh_user: row.try_get("ssh_user")?,
            ssh_secret: row.try_get("ssh_secret")?,
            auth_type: decode_auth_type(row)?,
        })
    }
}

/// An active primary lease whose machine is down and that has no active
/// replacement yet.
#[derive(Debug, Clone)]
pub struct ReplacementNeed {
    pub username: String,
    pub primary_machine_id: i64,
    pub reserved_until: Option<DateTime<Utc>>,
    pub hashed_password: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ReplacementNeed {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            username: row.try_get("username")?,
            primary_machine_id: row.try_get("primary_machine_id")?,
            reserved_until: row.try_get("reserved_until")?,
            hashed_password: row.try_get("hashed_password")?,
        })
    }
}

/// An active replacement lease whose primary machine is reachable again,
/// joined with the replacement machine's connection details.
#[derive(Debug, Clone)]
pub struct RecoveredReplacement {
    pub lease_id: i64,
    pub replacement_machine_id: i64,
    pub primary_machine_id: i64,
    pub username: String,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub ssh_user: String,
    pub ssh_secret: Option<String>,
    pub auth_type: AuthType,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RecoveredReplacement {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            lease_id: row.try_get("lease_id")?,
            replacement_machine_id: row.try_get("replacement_machine_id")?,
            primary_machine_id: row.try_get("primary_machine_id")?,
            username: row.try_get("username")?,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            ssh_user: row.try_get("ssh_user")?,
            ssh_secret: row.try_get("ssh_secret")?,
            auth_type: decode_auth_type(row)?,
        })
    }
}
