//! hostpool maintenance scheduler.
//!
//! The long-running counterpart to the inline allocator: a periodic loop
//! that enrolls fresh machines into key auth, probes fleet reachability,
//! tears down expired leases, and keeps failed in-lease machines covered
//! from the spare pool. Exactly one instance in the cluster performs a
//! tick at a time, enforced through the store's advisory lock.

pub mod config;
pub mod driver;
pub mod enroll;
pub mod expire;
pub mod health;
mod hosts;
pub mod reconcile;

pub use config::Config;
pub use driver::MaintenanceLoop;
pub use expire::ExpirySweeper;
pub use health::{HealthChecker, HealthStats};
pub use reconcile::{ReconcileStats, Reconciler};
