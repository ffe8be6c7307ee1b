//! Atomic N-of-M lease allocation.
//!
//! The allocator runs inline with user requests and follows a strict
//! reserve-first, provision-second protocol:
//!
//! 1. One transaction locks and flags N eligible machines as reserved.
//! 2. The provisioner creates the user account on each machine.
//! 3. On success, lease rows are inserted with the same expiration the
//!    machine rows got.
//!
//! Any failure after the reserve transaction rolls the flags back before
//! the error is returned, so a failed allocation leaves no trace. Failures
//! the hosts likely caused additionally quarantine them
//! (*rollback-with-penalty*); faults of our own — hashing, the store —
//! do not (*rollback-no-penalty*).
//!
//! Cross-request safety comes entirely from row-level locks plus predicated
//! updates; there is no process-local mutex to outgrow a single node.

mod error;
mod hash;

pub use error::AllocationError;
pub use hash::{sha512_crypt, HashError};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use hostpool_runner::{HostAuth, InventoryHost, KeyAccess, Provisioner};
use hostpool_store::{AuthType, Machine, NewLease, Store};

/// A validated allocation request.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    /// Number of machines to reserve. Must be at least 1.
    pub count: usize,
    /// Lease duration in minutes. Must be positive.
    pub duration_minutes: i32,
    /// The credential the short-lived accounts get. Hashed before it
    /// leaves this crate; never logged.
    pub credential: String,
}

/// One successfully leased machine, in caller-facing shape.
#[derive(Debug, Clone, Serialize)]
pub struct LeasedHost {
    pub machine: String,
    pub host: String,
    pub port: i32,
}

/// The outcome of a successful allocation.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseGroup {
    pub machines: Vec<LeasedHost>,
    pub reserved_until: DateTime<Utc>,
    pub duration_minutes: i32,
}

/// The new-lease path of the reservation engine.
///
/// Authorization happens before this layer: the allocator assumes the
/// caller is entitled to act as `username`.
pub struct Allocator {
    store: Store,
    provisioner: Arc<dyn Provisioner>,
    access: KeyAccess,
}

impl Allocator {
    pub fn new(store: Store, provisioner: Arc<dyn Provisioner>, access: KeyAccess) -> Self {
        Self {
            store,
            provisioner,
            access,
        }
    }

    /// Reserve `request.count` machines for `username`, provision the user
    /// account on each, and persist the leases.
    #[instrument(skip(self, request), fields(user = %username, count = request.count))]
    pub async fn allocate(
        &self,
        username: &str,
        request: &AllocationRequest,
    ) -> Result<LeaseGroup, AllocationError> {
        if request.count == 0
            || request.duration_minutes <= 0
            || request.credential.trim().is_empty()
        {
            return Err(AllocationError::InvalidRequest);
        }

        let user_id = self
            .store
            .lookup_user_id(username)
            .await?
            .ok_or_else(|| AllocationError::ServerError("authenticated user has no row".into()))?;

        let (ids, until) = self.reserve(username, request).await?;

        // From here on every early return must clear the reservation flags.
        let machines = match self.store.load_machines_by_ids(&ids).await {
            Ok(machines) => machines,
            Err(e) => {
                self.rollback_no_penalty(&ids).await;
                return Err(e.into());
            }
        };

        let hashed = match hash::sha512_crypt(&request.credential) {
            Ok(hashed) => hashed,
            Err(e) => {
                self.rollback_no_penalty(&ids).await;
                return Err(AllocationError::ServerError(e.to_string()));
            }
        };

        let hosts: Vec<InventoryHost> = machines
            .iter()
            .map(|m| inventory_host(m, &self.access))
            .collect();
        let report = match self.provisioner.provision(&hosts, username, &hashed).await {
            Ok(report) => report,
            Err(e) => {
                self.rollback_with_penalty(&ids).await;
                return Err(AllocationError::ProvisionerFailed {
                    details: e.to_string(),
                });
            }
        };
        if !report.all_ok() {
            self.rollback_with_penalty(&ids).await;
            return Err(AllocationError::ProvisionerFailed {
                details: report.failure_details(),
            });
        }

        let rows: Vec<NewLease> = machines
            .iter()
            .map(|m| NewLease {
                machine_id: m.id,
                user_id,
                username: username.to_string(),
                reserved_until: Some(until),
                hashed_password: Some(hashed.clone()),
                replacement_for_machine_id: None,
            })
            .collect();
        if let Err(e) = self.store.insert_leases(&rows).await {
            self.rollback_no_penalty(&ids).await;
            return Err(e.into());
        }

        info!(
            user = %username,
            machines = machines.len(),
            reserved_until = %until,
            "Allocated lease group"
        );

        Ok(LeaseGroup {
            machines: machines
                .iter()
                .map(|m| LeasedHost {
                    machine: m.name.clone(),
                    host: m.host.clone(),
                    port: m.port,
                })
                .collect(),
            reserved_until: until,
            duration_minutes: request.duration_minutes,
        })
    }

    /// The reserve transaction: lock candidates, check capacity, flag the
    /// rows, commit. Computes the authoritative expiration on the store's
    /// clock while the transaction is open.
    async fn reserve(
        &self,
        username: &str,
        request: &AllocationRequest,
    ) -> Result<(Vec<i64>, DateTime<Utc>), AllocationError> {
        let mut tx = self.store.begin().await?;

        let ids = self
            .store
            .select_eligible_for_update(&mut tx, request.count as i64)
            .await?;
        if ids.len() < request.count {
            let available = ids.len();
            let _ = tx.rollback().await;
            return Err(AllocationError::NotEnoughAvailable { available });
        }

        let until = self
            .store
            .reservation_expiry(&mut tx, request.duration_minutes)
            .await?;

        if !self
            .store
            .mark_reserved(&mut tx, &ids, username, until)
            .await?
        {
            // A concurrent writer took one of the locked rows; the caller
            // may simply retry.
            let _ = tx.rollback().await;
            return Err(AllocationError::ServerError(
                "reservation lost a concurrent update".into(),
            ));
        }

        tx.commit()
            .await
            .map_err(|e| AllocationError::ServerError(e.to_string()))?;

        Ok((ids, until))
    }

    /// Undo the reservation after a fault of our own (store, hashing).
    async fn rollback_no_penalty(&self, ids: &[i64]) {
        if let Err(e) = self.store.clear_reservation(ids).await {
            error!(error = %e, ?ids, "Failed to clear reservation during rollback");
        }
    }

    /// Undo the reservation after provisioner trouble, and quarantine the
    /// machines so retries do not land on the same hosts immediately.
    async fn rollback_with_penalty(&self, ids: &[i64]) {
        self.rollback_no_penalty(ids).await;
        if let Err(e) = self.store.apply_failure_backoff(ids).await {
            warn!(error = %e, ?ids, "Failed to apply failure backoff");
        }
    }
}

/// Build the inventory line for a machine from its current auth state.
fn inventory_host(machine: &Machine, access: &KeyAccess) -> InventoryHost {
    match machine.auth_type {
        AuthType::Password => InventoryHost {
            name: machine.name.clone(),
            host: machine.host.clone(),
            port: machine.port,
            user: machine.ssh_user.clone(),
            auth: HostAuth::Password(machine.ssh_secret.clone().unwrap_or_default()),
        },
        AuthType::Key => InventoryHost {
            name: machine.name.clone(),
            host: machine.host.clone(),
            port: machine.port,
            user: access.user.clone(),
            auth: HostAuth::KeyFile(access.key_path.clone()),
        },
    }
}
