//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: aliases, chunk references, orphans, migration plans
    r#"
    CREATE TABLE IF NOT EXISTS version_aliases (
        alias_id         TEXT PRIMARY KEY,
        original_path    TEXT NOT NULL,
        current_path     TEXT NOT NULL,
        version_history  JSON NOT NULL,
        created_at       DATETIME NOT NULL,
        last_accessed    DATETIME NOT NULL,
        access_count     INTEGER NOT NULL DEFAULT 0,
        metadata         JSON
    );

    CREATE TABLE IF NOT EXISTS chunk_references (
        chunk_id         TEXT PRIMARY KEY,
        file_path        TEXT NOT NULL,
        chunk_hash       TEXT NOT NULL,
        content_hash     TEXT NOT NULL,
        referenced_by    JSON NOT NULL,
        last_referenced  DATETIME NOT NULL,
        reference_count  INTEGER NOT NULL DEFAULT 0,
        size_bytes       INTEGER NOT NULL DEFAULT 0,
        access_count     INTEGER NOT NULL DEFAULT 0,
        status           TEXT NOT NULL DEFAULT 'active',
        metadata         JSON
    );

    CREATE TABLE IF NOT EXISTS orphan_chunks (
        chunk_id         TEXT PRIMARY KEY,
        file_path        TEXT NOT NULL,
        chunk_hash       TEXT NOT NULL,
        content_hash     TEXT NOT NULL,
        orphaned_at      DATETIME NOT NULL,
        last_access      DATETIME NOT NULL,
        access_count     INTEGER NOT NULL DEFAULT 0,
        size_bytes       INTEGER NOT NULL DEFAULT 0,
        potential_owners JSON NOT NULL,
        cleanup_priority REAL NOT NULL,
        metadata         JSON
    );

    CREATE TABLE IF NOT EXISTS migration_plans (
        migration_id       TEXT PRIMARY KEY,
        strategy           TEXT NOT NULL,
        source_chunks      JSON NOT NULL,
        target_chunks      JSON NOT NULL,
        estimated_duration REAL NOT NULL,
        risk_level         TEXT NOT NULL,
        rollback_plan      JSON NOT NULL,
        created_at         DATETIME NOT NULL,
        status             TEXT NOT NULL,
        started_at         DATETIME,
        completed_at       DATETIME,
        error_message      TEXT,
        metadata           JSON
    );

    CREATE INDEX IF NOT EXISTS idx_aliases_original ON version_aliases(original_path);
    CREATE INDEX IF NOT EXISTS idx_aliases_current ON version_aliases(current_path);
    CREATE INDEX IF NOT EXISTS idx_aliases_last_accessed ON version_aliases(last_accessed);
    CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunk_references(chunk_hash);
    CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunk_references(file_path);
    CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunk_references(status);
    CREATE INDEX IF NOT EXISTS idx_orphans_priority ON orphan_chunks(cleanup_priority DESC, orphaned_at ASC);
    CREATE INDEX IF NOT EXISTS idx_plans_status ON migration_plans(status);
    CREATE INDEX IF NOT EXISTS idx_plans_strategy ON migration_plans(strategy);
    "#,
    // Version 2: rollback audit trail
    r#"
    CREATE TABLE IF NOT EXISTS migration_rollbacks (
        rollback_id      TEXT PRIMARY KEY,
        migration_id     TEXT NOT NULL REFERENCES migration_plans(migration_id),
        started_at       DATETIME NOT NULL,
        completed_at     DATETIME NOT NULL,
        success          INTEGER NOT NULL,
        steps_completed  JSON NOT NULL,
        error_message    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_rollbacks_migration ON migration_rollbacks(migration_id, started_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
