//! End-to-end engine tests against a live Postgres.
//!
//! Set `TEST_DATABASE_URL` to run these; without it every test skips
//! silently so the suite stays green on machines without a database.
//! Tests share one database and serialize through an advisory lock,
//! truncating the tables at the start of each test.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use hostpool_allocator::{AllocationError, AllocationRequest, Allocator};
use hostpool_runner::{
    HostStatus, InventoryHost, KeyAccess, ProbeTarget, Prober, ProvisionReport, Provisioner,
    RunnerError,
};
use hostpool_scheduler::{ExpirySweeper, HealthChecker, ReconcileStats, Reconciler};
use hostpool_store::{AdvisoryLock, Store, StoreConfig};

// =============================================================================
// Harness
// =============================================================================

struct TestDb {
    store: Store,
    // Held for the duration of the test; serializes DB tests across threads.
    _lock: AdvisoryLock,
}

async fn setup() -> Option<TestDb> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let config = StoreConfig {
        database_url: url,
        ..Default::default()
    };
    let store = Store::connect(&config).await.expect("connect to test db");
    let lock = store
        .acquire_advisory("hostpool-test-mutex", Duration::from_secs(120))
        .await
        .expect("acquire test mutex")
        .expect("test mutex timed out");
    store.ensure_schema().await.expect("ensure schema");
    sqlx::query("TRUNCATE leases, machines, users RESTART IDENTITY")
        .execute(store.pool())
        .await
        .expect("truncate");
    Some(TestDb { store, _lock: lock })
}

fn access() -> KeyAccess {
    KeyAccess {
        user: "iac".to_string(),
        key_path: PathBuf::from("/tmp/hostpool-test-key"),
    }
}

fn idle_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the test's duration.
    std::mem::forget(tx);
    rx
}

async fn create_user(store: &Store, username: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO users (username, password_hash) VALUES ($1, 'x') RETURNING id",
    )
    .bind(username)
    .fetch_one(store.pool())
    .await
    .expect("insert user")
}

/// Insert an enrolled, eligible machine.
async fn create_machine(store: &Store, name: &str, enabled: bool, spare: bool) -> i64 {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO machines (name, host, port, ssh_user, auth_type, enabled, online, spare_pool)
        VALUES ($1, '127.0.0.1', 22, 'root', 'key', $2, TRUE, $3)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(enabled)
    .bind(spare)
    .fetch_one(store.pool())
    .await
    .expect("insert machine")
}

/// Insert a lease and flag its machine reserved, `minutes_from_now` may be
/// negative for an already-expired lease.
async fn create_lease(
    store: &Store,
    machine_id: i64,
    user_id: i64,
    username: &str,
    minutes_from_now: i32,
    hashed_password: Option<&str>,
    replacement_for: Option<i64>,
) -> i64 {
    let lease_id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO leases
            (machine_id, user_id, username, reserved_until, hashed_password,
             replacement_for_machine_id)
        VALUES ($1, $2, $3, now() + make_interval(mins => $4), $5, $6)
        RETURNING id
        "#,
    )
    .bind(machine_id)
    .bind(user_id)
    .bind(username)
    .bind(minutes_from_now)
    .bind(hashed_password)
    .bind(replacement_for)
    .fetch_one(store.pool())
    .await
    .expect("insert lease");

    sqlx::query(
        r#"
        UPDATE machines
        SET reserved = TRUE, reserved_by = $1,
            reserved_until = now() + make_interval(mins => $2)
        WHERE id = $3
        "#,
    )
    .bind(username)
    .bind(minutes_from_now)
    .bind(machine_id)
    .execute(store.pool())
    .await
    .expect("reserve machine");

    lease_id
}

async fn machine_flags(store: &Store, id: i64) -> (bool, bool, Option<String>, i32) {
    sqlx::query_as::<_, (bool, bool, Option<String>, i32)>(
        "SELECT reserved, enabled, reserved_by, reserve_fail_count FROM machines WHERE id = $1",
    )
    .bind(id)
    .fetch_one(store.pool())
    .await
    .expect("machine flags")
}

async fn lease_count(store: &Store) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM leases")
        .fetch_one(store.pool())
        .await
        .expect("lease count")
}

// =============================================================================
// Scripted collaborators
// =============================================================================

#[derive(Debug, Clone)]
struct Call {
    action: &'static str,
    username: String,
    hosts: Vec<String>,
}

/// A provisioner that answers from a script instead of running ansible.
struct ScriptedProvisioner {
    default_status: HostStatus,
    overrides: HashMap<String, HostStatus>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedProvisioner {
    fn ok() -> Self {
        Self::with_default(HostStatus::Ok)
    }

    fn with_default(default_status: HostStatus) -> Self {
        Self {
            default_status,
            overrides: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_override(mut self, host: &str, status: HostStatus) -> Self {
        self.overrides.insert(host.to_string(), status);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn report(&self, action: &'static str, hosts: &[InventoryHost], username: &str) -> ProvisionReport {
        self.calls.lock().unwrap().push(Call {
            action,
            username: username.to_string(),
            hosts: hosts.iter().map(|h| h.name.clone()).collect(),
        });
        let statuses = hosts
            .iter()
            .map(|h| {
                let status = self
                    .overrides
                    .get(&h.name)
                    .copied()
                    .unwrap_or(self.default_status);
                (h.name.clone(), status)
            })
            .collect();
        ProvisionReport {
            hosts: statuses,
            stderr_tail: String::new(),
        }
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn provision(
        &self,
        hosts: &[InventoryHost],
        username: &str,
        _hashed_credential: &str,
    ) -> Result<ProvisionReport, RunnerError> {
        Ok(self.report("create", hosts, username))
    }

    async fn deprovision(
        &self,
        hosts: &[InventoryHost],
        username: &str,
    ) -> Result<ProvisionReport, RunnerError> {
        Ok(self.report("delete", hosts, username))
    }
}

struct ScriptedProber {
    reachable: bool,
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, _target: &ProbeTarget, _timeout: Duration) -> bool {
        self.reachable
    }
}

fn request(count: usize, duration_minutes: i32) -> AllocationRequest {
    AllocationRequest {
        count,
        duration_minutes,
        credential: "s3cret".to_string(),
    }
}

// =============================================================================
// Allocation scenarios
// =============================================================================

#[tokio::test]
async fn happy_path_allocation_takes_lowest_fail_then_lowest_id() {
    let Some(db) = setup().await else { return };
    create_user(&db.store, "alice").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;
    let m2 = create_machine(&db.store, "m2", true, false).await;
    let m3 = create_machine(&db.store, "m3", true, false).await;

    let provisioner = Arc::new(ScriptedProvisioner::ok());
    let allocator = Allocator::new(db.store.clone(), provisioner.clone(), access());

    let group = allocator
        .allocate("alice", &request(2, 30))
        .await
        .expect("allocation succeeds");

    let names: Vec<&str> = group.machines.iter().map(|m| m.machine.as_str()).collect();
    assert_eq!(names, vec!["m1", "m2"]);
    assert_eq!(group.duration_minutes, 30);

    for id in [m1, m2] {
        let (reserved, _, reserved_by, fails) = machine_flags(&db.store, id).await;
        assert!(reserved);
        assert_eq!(reserved_by.as_deref(), Some("alice"));
        assert_eq!(fails, 0);
    }
    let (m3_reserved, _, _, _) = machine_flags(&db.store, m3).await;
    assert!(!m3_reserved);

    // Machine rows and lease rows carry the same expiration.
    let mismatched = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*)
        FROM leases l JOIN machines m ON m.id = l.machine_id
        WHERE l.reserved_until IS DISTINCT FROM m.reserved_until
        "#,
    )
    .fetch_one(db.store.pool())
    .await
    .unwrap();
    assert_eq!(mismatched, 0);
    assert_eq!(lease_count(&db.store).await, 2);

    // The provisioner saw exactly one create for both hosts.
    let calls = provisioner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "create");
    assert_eq!(calls[0].hosts, vec!["m1", "m2"]);
}

#[tokio::test]
async fn insufficient_capacity_mutates_nothing() {
    let Some(db) = setup().await else { return };
    create_user(&db.store, "alice").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;

    let allocator = Allocator::new(db.store.clone(), Arc::new(ScriptedProvisioner::ok()), access());
    let err = allocator.allocate("alice", &request(2, 30)).await.unwrap_err();
    match err {
        AllocationError::NotEnoughAvailable { available } => assert_eq!(available, 1),
        other => panic!("unexpected error: {other:?}"),
    }

    let (reserved, _, reserved_by, fails) = machine_flags(&db.store, m1).await;
    assert!(!reserved);
    assert!(reserved_by.is_none());
    assert_eq!(fails, 0);
    assert_eq!(lease_count(&db.store).await, 0);
}

#[tokio::test]
async fn provisioner_partial_failure_rolls_back_with_penalty() {
    let Some(db) = setup().await else { return };
    create_user(&db.store, "alice").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;
    let m2 = create_machine(&db.store, "m2", true, false).await;

    let provisioner = Arc::new(ScriptedProvisioner::ok().with_override("m2", HostStatus::Failed));
    let allocator = Allocator::new(db.store.clone(), provisioner, access());

    let err = allocator.allocate("alice", &request(2, 30)).await.unwrap_err();
    assert_eq!(err.code(), "provisioner_failed");

    assert_eq!(lease_count(&db.store).await, 0);
    for id in [m1, m2] {
        let (reserved, _, _, fails) = machine_flags(&db.store, id).await;
        assert!(!reserved);
        assert_eq!(fails, 1);
        // First failure quarantines for five minutes.
        let in_window = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT quarantine_until > now() + interval '4 minutes'
               AND quarantine_until <= now() + interval '5 minutes'
            FROM machines WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(db.store.pool())
        .await
        .unwrap();
        assert!(in_window, "quarantine window wrong for machine {id}");
    }

    // Quarantined machines are not eligible for the retry.
    let err = allocator.allocate("alice", &request(1, 30)).await.unwrap_err();
    assert_eq!(err.code(), "not_enough_available");
}

#[tokio::test]
async fn concurrent_allocators_never_share_a_machine() {
    let Some(db) = setup().await else { return };
    create_user(&db.store, "alice").await;
    create_user(&db.store, "bob").await;
    for i in 0..4 {
        create_machine(&db.store, &format!("m{i}"), true, false).await;
    }

    let allocator = Arc::new(Allocator::new(
        db.store.clone(),
        Arc::new(ScriptedProvisioner::ok()),
        access(),
    ));

    let mut handles = Vec::new();
    for i in 0..6 {
        let allocator = Arc::clone(&allocator);
        let user = if i % 2 == 0 { "alice" } else { "bob" };
        handles.push(tokio::spawn(async move {
            allocator.allocate(user, &request(1, 15)).await
        }));
    }

    let mut allocated = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(group) => allocated.extend(group.machines.into_iter().map(|m| m.machine)),
            Err(AllocationError::NotEnoughAvailable { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(allocated.len(), 4);
    assert_eq!(rejected, 2);
    let mut unique = allocated.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), allocated.len(), "a machine was double-allocated");
    assert_eq!(lease_count(&db.store).await, 4);
}

// =============================================================================
// Expiry scenarios
// =============================================================================

#[tokio::test]
async fn expiry_with_host_down_keeps_lease_and_disables_machine() {
    let Some(db) = setup().await else { return };
    let uid = create_user(&db.store, "alice").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;
    create_lease(&db.store, m1, uid, "alice", -5, Some("$6$h"), None).await;

    let down = Arc::new(ScriptedProvisioner::with_default(HostStatus::Unreachable));
    let sweeper = ExpirySweeper::new(db.store.clone(), down, access(), 20);
    let cleared = sweeper.expire_once(&idle_shutdown()).await.unwrap();
    assert_eq!(cleared, 0);

    let (reserved, enabled, _, _) = machine_flags(&db.store, m1).await;
    assert!(reserved, "lease must persist");
    assert!(!enabled, "failed teardown hides the machine");
    assert_eq!(lease_count(&db.store).await, 1);

    // The machine recovers: health re-admits it and clears the lease
    // opportunistically.
    let health = HealthChecker::new(
        db.store.clone(),
        Arc::new(ScriptedProber { reachable: true }),
        Arc::new(ScriptedProvisioner::ok()),
        access(),
        4,
        Duration::from_secs(1),
    );
    let stats = health.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.reenabled, 1);
    assert_eq!(stats.reachable, 1);

    assert_eq!(lease_count(&db.store).await, 0);
    let (reserved, enabled, _, _) = machine_flags(&db.store, m1).await;
    assert!(!reserved);
    assert!(enabled);
}

#[tokio::test]
async fn expiry_sweep_is_idempotent() {
    let Some(db) = setup().await else { return };
    let uid = create_user(&db.store, "alice").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;
    create_lease(&db.store, m1, uid, "alice", -5, None, None).await;

    let provisioner = Arc::new(ScriptedProvisioner::ok());
    let sweeper = ExpirySweeper::new(db.store.clone(), provisioner.clone(), access(), 20);

    assert_eq!(sweeper.expire_once(&idle_shutdown()).await.unwrap(), 1);
    assert_eq!(sweeper.expire_once(&idle_shutdown()).await.unwrap(), 0);
    assert_eq!(provisioner.calls().len(), 1, "second sweep found nothing to do");
    assert_eq!(lease_count(&db.store).await, 0);
    let (reserved, enabled, _, _) = machine_flags(&db.store, m1).await;
    assert!(!reserved);
    assert!(enabled);
}

#[tokio::test]
async fn unreachable_probe_disables_machine() {
    let Some(db) = setup().await else { return };
    let m1 = create_machine(&db.store, "m1", true, false).await;

    let health = HealthChecker::new(
        db.store.clone(),
        Arc::new(ScriptedProber { reachable: false }),
        Arc::new(ScriptedProvisioner::ok()),
        access(),
        4,
        Duration::from_secs(1),
    );
    let stats = health.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.unreachable, 1);
    assert_eq!(stats.disabled, 1);

    let (_, enabled, _, _) = machine_flags(&db.store, m1).await;
    assert!(!enabled);

    // Repeated probes converge without further flips.
    let stats = health.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.disabled, 0);
}

// =============================================================================
// Reconciliation scenarios
// =============================================================================

#[tokio::test]
async fn reconciler_allocates_replacement_from_spare_pool() {
    let Some(db) = setup().await else { return };
    let uid = create_user(&db.store, "bob").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;
    let m9 = create_machine(&db.store, "m9", true, true).await;
    create_lease(&db.store, m1, uid, "bob", 60, Some("$6$bobhash"), None).await;
    // Health saw m1 go dark mid-lease.
    sqlx::query("UPDATE machines SET enabled = FALSE WHERE id = $1")
        .bind(m1)
        .execute(db.store.pool())
        .await
        .unwrap();

    let provisioner = Arc::new(ScriptedProvisioner::ok());
    let reconciler = Reconciler::new(db.store.clone(), provisioner.clone(), access(), 0);
    let stats = reconciler.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.allocated, 1);

    let (reserved, _, reserved_by, _) = machine_flags(&db.store, m9).await;
    assert!(reserved);
    assert_eq!(reserved_by.as_deref(), Some("bob"));

    let (repl_for, hashed, until_matches) = sqlx::query_as::<_, (Option<i64>, Option<String>, bool)>(
        r#"
        SELECT rl.replacement_for_machine_id,
               rl.hashed_password,
               rl.reserved_until = pl.reserved_until
        FROM leases rl
        JOIN leases pl ON pl.machine_id = rl.replacement_for_machine_id
        WHERE rl.replacement_for_machine_id IS NOT NULL
        "#,
    )
    .fetch_one(db.store.pool())
    .await
    .unwrap();
    assert_eq!(repl_for, Some(m1));
    assert_eq!(hashed.as_deref(), Some("$6$bobhash"));
    assert!(until_matches, "replacement must mirror the primary's expiration");

    let calls = provisioner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "create");
    assert_eq!(calls[0].hosts, vec!["m9"]);
    assert_eq!(calls[0].username, "bob");

    // A second pass allocates nothing more (at most one replacement).
    let stats = reconciler.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.allocated, 0);
    assert_eq!(lease_count(&db.store).await, 2);
}

#[tokio::test]
async fn reconciler_releases_replacement_when_primary_recovers() {
    let Some(db) = setup().await else { return };
    let uid = create_user(&db.store, "bob").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;
    let m9 = create_machine(&db.store, "m9", true, true).await;
    create_lease(&db.store, m1, uid, "bob", 55, Some("$6$bobhash"), None).await;
    create_lease(&db.store, m9, uid, "bob", 55, Some("$6$bobhash"), Some(m1)).await;

    let provisioner = Arc::new(ScriptedProvisioner::ok());
    let reconciler = Reconciler::new(db.store.clone(), provisioner.clone(), access(), 0);
    let stats = reconciler.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.released, 1);
    assert_eq!(stats.allocated, 0);

    let calls = provisioner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "delete");
    assert_eq!(calls[0].hosts, vec!["m9"]);

    let (reserved, _, _, _) = machine_flags(&db.store, m9).await;
    assert!(!reserved);
    assert_eq!(lease_count(&db.store).await, 1, "primary lease unaffected");
    let (primary_reserved, _, reserved_by, _) = machine_flags(&db.store, m1).await;
    assert!(primary_reserved);
    assert_eq!(reserved_by.as_deref(), Some("bob"));
}

#[tokio::test]
async fn reconciler_skips_replacement_without_stored_credential() {
    let Some(db) = setup().await else { return };
    let uid = create_user(&db.store, "bob").await;
    let m1 = create_machine(&db.store, "m1", true, false).await;
    create_machine(&db.store, "m9", true, true).await;
    create_lease(&db.store, m1, uid, "bob", 60, None, None).await;
    sqlx::query("UPDATE machines SET enabled = FALSE WHERE id = $1")
        .bind(m1)
        .execute(db.store.pool())
        .await
        .unwrap();

    let reconciler = Reconciler::new(db.store.clone(), Arc::new(ScriptedProvisioner::ok()), access(), 0);
    let stats = reconciler.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.skipped_no_credential, 1);
    assert_eq!(lease_count(&db.store).await, 1);
}

#[tokio::test]
async fn reconciler_is_a_noop_on_a_healthy_pool() {
    let Some(db) = setup().await else { return };
    for i in 0..4 {
        create_machine(&db.store, &format!("m{i}"), true, false).await;
    }
    create_machine(&db.store, "m-spare", true, true).await;

    // 5 eligible machines at 20% → desired exactly the one existing spare.
    let provisioner = Arc::new(ScriptedProvisioner::ok());
    let reconciler = Reconciler::new(db.store.clone(), provisioner.clone(), access(), 20);
    let stats = reconciler.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats, ReconcileStats::default());
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn spare_pool_promotes_and_demotes_toward_target() {
    let Some(db) = setup().await else { return };
    for i in 0..10 {
        create_machine(&db.store, &format!("m{i}"), true, false).await;
    }

    let reconciler = Reconciler::new(db.store.clone(), Arc::new(ScriptedProvisioner::ok()), access(), 20);
    let stats = reconciler.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.promoted, 2);

    let spares = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM machines WHERE spare_pool AND NOT reserved",
    )
    .fetch_one(db.store.pool())
    .await
    .unwrap();
    assert_eq!(spares, 2);

    // Shrinking the pool demotes back down.
    let reconciler = Reconciler::new(db.store.clone(), Arc::new(ScriptedProvisioner::ok()), access(), 10);
    let stats = reconciler.run_once(&idle_shutdown()).await.unwrap();
    assert_eq!(stats.demoted, 1);
}

// =============================================================================
// Enrollment gate
// =============================================================================

#[tokio::test]
async fn unenrolled_machines_are_never_eligible() {
    let Some(db) = setup().await else { return };
    create_user(&db.store, "alice").await;
    // Freshly registered: password auth, disabled.
    sqlx::query(
        r#"
        INSERT INTO machines (name, host, port, ssh_user, ssh_secret, auth_type, enabled, online)
        VALUES ('fresh', '127.0.0.1', 22, 'root', 'pw', 'password', FALSE, TRUE)
        "#,
    )
    .execute(db.store.pool())
    .await
    .unwrap();

    let allocator = Allocator::new(db.store.clone(), Arc::new(ScriptedProvisioner::ok()), access());
    let err = allocator.allocate("alice", &request(1, 30)).await.unwrap_err();
    match err {
        AllocationError::NotEnoughAvailable { available } => assert_eq!(available, 0),
        other => panic!("unexpected error: {other:?}"),
    }

    // No committed state may pair password auth with an enabled flag.
    let violations = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM machines WHERE auth_type = 'password' AND enabled",
    )
    .fetch_one(db.store.pool())
    .await
    .unwrap();
    assert_eq!(violations, 0);
}
