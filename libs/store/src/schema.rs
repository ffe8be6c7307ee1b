//! Idempotent schema setup.
//!
//! Run at startup by every process that opens the store. Every statement is
//! `IF NOT EXISTS` so concurrent starters and restarts are harmless.

use sqlx::PgPool;

use crate::StoreError;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id            BIGSERIAL PRIMARY KEY,
        username      TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        is_admin      BOOLEAN NOT NULL DEFAULT FALSE,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS machines (
        id                 BIGSERIAL PRIMARY KEY,
        name               TEXT NOT NULL UNIQUE,
        host               TEXT NOT NULL,
        port               INT NOT NULL DEFAULT 22,
        ssh_user           TEXT NOT NULL DEFAULT 'root',
        ssh_secret         TEXT NULL,
        auth_type          TEXT NOT NULL DEFAULT 'password',
        enabled            BOOLEAN NOT NULL DEFAULT FALSE,
        online             BOOLEAN NOT NULL DEFAULT TRUE,
        reserved           BOOLEAN NOT NULL DEFAULT FALSE,
        spare_pool         BOOLEAN NOT NULL DEFAULT FALSE,
        reserved_by        TEXT NULL,
        reserved_until     TIMESTAMPTZ NULL,
        last_seen_at       TIMESTAMPTZ NULL,
        reserve_fail_count INT NOT NULL DEFAULT 0,
        quarantine_until   TIMESTAMPTZ NULL,
        created_at         TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leases (
        id                         BIGSERIAL PRIMARY KEY,
        machine_id                 BIGINT NOT NULL,
        user_id                    BIGINT NOT NULL,
        username                   TEXT NOT NULL,
        reserved_until             TIMESTAMPTZ NULL,
        hashed_password            TEXT NULL,
        replacement_for_machine_id BIGINT NULL,
        created_at                 TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_leases_machine_id ON leases (machine_id)",
    "CREATE INDEX IF NOT EXISTS idx_leases_user_id ON leases (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_leases_replacement_for
         ON leases (replacement_for_machine_id)",
    "CREATE INDEX IF NOT EXISTS idx_leases_reserved_until ON leases (reserved_until)",
];

pub(crate) async fn ensure(pool: &PgPool) -> Result<(), StoreError> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(StoreError::Query)?;
    }
    Ok(())
}
