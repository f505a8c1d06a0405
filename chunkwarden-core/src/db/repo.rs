//! Database repository layer
//!
//! Provides upserts and queries for aliases, chunk references, orphans,
//! migration plans and rollback records. Every write is one statement or
//! one explicit transaction.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// Fixed-width UTC timestamp so TEXT comparisons order correctly.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn conversion_error(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, msg.into())
}

fn parse_column<T: FromStr<Err = String>>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let s: String = row.get(column)?;
    s.parse::<T>().map_err(conversion_error)
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let s: String = row.get(column)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(format!("{}: {}", column, e)))
}

fn metadata_column(row: &Row) -> rusqlite::Result<Metadata> {
    let s: Option<String> = row.get("metadata")?;
    Ok(s.map(|s| Metadata::from_json(&s)).unwrap_or_default())
}

/// Durable, transactional store shared by every resilience component.
pub struct ResilienceStore {
    conn: Mutex<Connection>,
}

impl ResilienceStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets the CLI read while background workers write
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Alias operations
    // ============================================

    /// Insert or update an alias
    pub fn upsert_alias(&self, alias: &VersionAlias) -> Result<()> {
        let history = serde_json::to_string(&alias.version_history)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO version_aliases (alias_id, original_path, current_path, version_history,
                                         created_at, last_accessed, access_count, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(alias_id) DO UPDATE SET
                original_path = excluded.original_path,
                current_path = excluded.current_path,
                version_history = excluded.version_history,
                last_accessed = excluded.last_accessed,
                access_count = excluded.access_count,
                metadata = excluded.metadata
            "#,
            params![
                alias.alias_id,
                alias.original_path,
                alias.current_path,
                history,
                ts(&alias.created_at),
                ts(&alias.last_accessed),
                alias.access_count as i64,
                alias.metadata.to_json(),
            ],
        )?;
        Ok(())
    }

    /// Get an alias by ID
    pub fn get_alias(&self, alias_id: &str) -> Result<Option<VersionAlias>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM version_aliases WHERE alias_id = ?",
            [alias_id],
            Self::row_to_alias,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Find the alias that knows `path` as its current, original or a prior path.
    ///
    /// Current-path matches win over original-path matches, which win over
    /// history matches; ties go to the most recently accessed alias.
    pub fn find_alias_by_path(&self, path: &str) -> Result<Option<VersionAlias>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT * FROM version_aliases
            WHERE current_path = ?1
               OR original_path = ?1
               OR EXISTS (SELECT 1 FROM json_each(version_history) WHERE value = ?1)
            ORDER BY CASE
                         WHEN current_path = ?1 THEN 0
                         WHEN original_path = ?1 THEN 1
                         ELSE 2
                     END,
                     last_accessed DESC
            LIMIT 1
            "#,
            [path],
            Self::row_to_alias,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Delete one alias
    pub fn delete_alias(&self, alias_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM version_aliases WHERE alias_id = ?", [alias_id])?;
        Ok(n > 0)
    }

    /// Delete aliases not accessed within `older_than_days`
    pub fn delete_expired_aliases(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM version_aliases WHERE last_accessed < ?",
            [ts(&cutoff)],
        )?;
        Ok(n)
    }

    pub fn count_aliases(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM version_aliases", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    fn row_to_alias(row: &Row) -> rusqlite::Result<VersionAlias> {
        let created_at: String = row.get("created_at")?;
        let last_accessed: String = row.get("last_accessed")?;

        Ok(VersionAlias {
            alias_id: row.get("alias_id")?,
            original_path: row.get("original_path")?,
            current_path: row.get("current_path")?,
            version_history: json_column(row, "version_history")?,
            created_at: parse_ts(&created_at),
            last_accessed: parse_ts(&last_accessed),
            access_count: row.get::<_, i64>("access_count")? as u64,
            metadata: metadata_column(row)?,
        })
    }

    // ============================================
    // Chunk reference operations
    // ============================================

    /// Insert or update a chunk reference
    pub fn upsert_chunk_reference(&self, chunk: &ChunkReference) -> Result<()> {
        let referenced_by = serde_json::to_string(&chunk.referenced_by)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO chunk_references (chunk_id, file_path, chunk_hash, content_hash, referenced_by,
                                          last_referenced, reference_count, size_bytes, access_count,
                                          status, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(chunk_id) DO UPDATE SET
                file_path = excluded.file_path,
                chunk_hash = excluded.chunk_hash,
                content_hash = excluded.content_hash,
                referenced_by = excluded.referenced_by,
                last_referenced = excluded.last_referenced,
                reference_count = excluded.reference_count,
                size_bytes = excluded.size_bytes,
                access_count = excluded.access_count,
                status = excluded.status,
                metadata = excluded.metadata
            "#,
            params![
                chunk.chunk_id,
                chunk.file_path,
                chunk.chunk_hash,
                chunk.content_hash,
                referenced_by,
                ts(&chunk.last_referenced),
                chunk.referenced_by.len() as i64,
                chunk.size_bytes as i64,
                chunk.access_count as i64,
                chunk.status.as_str(),
                chunk.metadata.to_json(),
            ],
        )?;
        Ok(())
    }

    /// Get a chunk reference by ID
    pub fn get_chunk_reference(&self, chunk_id: &str) -> Result<Option<ChunkReference>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM chunk_references WHERE chunk_id = ?",
            [chunk_id],
            Self::row_to_chunk_reference,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List chunk references, optionally including archived/deleted ones
    pub fn list_chunk_references(&self, include_terminal: bool) -> Result<Vec<ChunkReference>> {
        let conn = self.conn.lock().unwrap();
        let sql = if include_terminal {
            "SELECT * FROM chunk_references ORDER BY chunk_id"
        } else {
            "SELECT * FROM chunk_references WHERE status NOT IN ('archived', 'deleted') ORDER BY chunk_id"
        };
        let mut stmt = conn.prepare(sql)?;
        let chunks = stmt
            .query_map([], Self::row_to_chunk_reference)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// Move a chunk to `status` if its lifecycle allows it.
    ///
    /// Returns `false` when the chunk is unknown.
    pub fn set_chunk_status(&self, chunk_id: &str, status: ChunkStatus) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM chunk_references WHERE chunk_id = ?",
                [chunk_id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            return Ok(false);
        };
        let current: ChunkStatus = current.parse().map_err(conversion_error)?;

        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                chunk_id: chunk_id.to_string(),
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        if current != status {
            tx.execute(
                "UPDATE chunk_references SET status = ?1 WHERE chunk_id = ?2",
                params![status.as_str(), chunk_id],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Bring an archived chunk back to `active`.
    ///
    /// Only migration rollback uses this; it is the one way out of the
    /// archived state. Returns `false` if the chunk is unknown or not archived.
    pub fn reactivate_archived_chunk(&self, chunk_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE chunk_references SET status = ?1 WHERE chunk_id = ?2 AND status = ?3",
            params![
                ChunkStatus::Active.as_str(),
                chunk_id,
                ChunkStatus::Archived.as_str()
            ],
        )?;
        Ok(updated > 0)
    }

    fn row_to_chunk_reference(row: &Row) -> rusqlite::Result<ChunkReference> {
        let last_referenced: String = row.get("last_referenced")?;
        let referenced_by: Vec<String> = json_column(row, "referenced_by")?;

        Ok(ChunkReference {
            chunk_id: row.get("chunk_id")?,
            file_path: row.get("file_path")?,
            chunk_hash: row.get("chunk_hash")?,
            content_hash: row.get("content_hash")?,
            reference_count: referenced_by.len() as u64,
            referenced_by,
            last_referenced: parse_ts(&last_referenced),
            size_bytes: row.get::<_, i64>("size_bytes")? as u64,
            access_count: row.get::<_, i64>("access_count")? as u64,
            status: parse_column(row, "status")?,
            metadata: metadata_column(row)?,
        })
    }

    // ============================================
    // Orphan operations
    // ============================================

    /// Insert or refresh an orphan; the first `orphaned_at` is kept.
    pub fn upsert_orphan_chunk(&self, orphan: &OrphanChunk) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::write_orphan(&conn, orphan)
    }

    /// Record `orphan` and mark its chunk orphaned in one transaction.
    ///
    /// Returns `false` and writes nothing when the tracked chunk has been
    /// archived, deleted or claimed by a migration in the meantime.
    /// Chunks the store does not track are recorded as is.
    pub fn mark_orphan(&self, orphan: &OrphanChunk) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM chunk_references WHERE chunk_id = ?",
                [&orphan.chunk_id],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(status) = status {
            let status: ChunkStatus = status.parse().map_err(conversion_error)?;
            if status.is_terminal() || status == ChunkStatus::Migrating {
                return Ok(false);
            }
            if status != ChunkStatus::Orphaned {
                tx.execute(
                    "UPDATE chunk_references SET status = ?1 WHERE chunk_id = ?2",
                    params![ChunkStatus::Orphaned.as_str(), orphan.chunk_id],
                )?;
            }
        }

        Self::write_orphan(&tx, orphan)?;
        tx.commit()?;
        Ok(true)
    }

    /// Forget an orphan that is referenced again.
    ///
    /// The chunk goes back to `active` only if it is still `orphaned`.
    /// Returns `false` when there was no orphan record.
    pub fn revalidate_orphan(&self, chunk_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let removed = tx.execute("DELETE FROM orphan_chunks WHERE chunk_id = ?", [chunk_id])?;
        if removed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE chunk_references SET status = ?1 WHERE chunk_id = ?2 AND status = ?3",
            params![
                ChunkStatus::Active.as_str(),
                chunk_id,
                ChunkStatus::Orphaned.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn write_orphan(conn: &Connection, orphan: &OrphanChunk) -> Result<()> {
        let owners = serde_json::to_string(&orphan.potential_owners)?;
        conn.execute(
            r#"
            INSERT INTO orphan_chunks (chunk_id, file_path, chunk_hash, content_hash, orphaned_at,
                                       last_access, access_count, size_bytes, potential_owners,
                                       cleanup_priority, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(chunk_id) DO UPDATE SET
                file_path = excluded.file_path,
                chunk_hash = excluded.chunk_hash,
                content_hash = excluded.content_hash,
                last_access = excluded.last_access,
                access_count = excluded.access_count,
                size_bytes = excluded.size_bytes,
                potential_owners = excluded.potential_owners,
                cleanup_priority = excluded.cleanup_priority,
                metadata = excluded.metadata
            "#,
            params![
                orphan.chunk_id,
                orphan.file_path,
                orphan.chunk_hash,
                orphan.content_hash,
                ts(&orphan.orphaned_at),
                ts(&orphan.last_access),
                orphan.access_count as i64,
                orphan.size_bytes as i64,
                owners,
                orphan.cleanup_priority,
                orphan.metadata.to_json(),
            ],
        )?;
        Ok(())
    }

    /// Get an orphan by chunk ID
    pub fn get_orphan_chunk(&self, chunk_id: &str) -> Result<Option<OrphanChunk>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM orphan_chunks WHERE chunk_id = ?",
            [chunk_id],
            Self::row_to_orphan,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Orphans by priority (highest first), then by age (oldest first)
    pub fn list_orphans(&self, limit: usize) -> Result<Vec<OrphanChunk>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM orphan_chunks
            ORDER BY cleanup_priority DESC, orphaned_at ASC
            LIMIT ?
            "#,
        )?;
        let orphans = stmt
            .query_map([limit as i64], Self::row_to_orphan)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orphans)
    }

    pub fn orphan_summary(&self) -> Result<OrphanSummary> {
        let conn = self.conn.lock().unwrap();
        let (total, bytes, avg, high, oldest): (i64, i64, f64, i64, Option<String>) = conn
            .query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(size_bytes), 0),
                       COALESCE(AVG(cleanup_priority), 0.0),
                       COALESCE(SUM(CASE WHEN cleanup_priority > 0.7 THEN 1 ELSE 0 END), 0),
                       MIN(orphaned_at)
                FROM orphan_chunks
                "#,
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )?;

        Ok(OrphanSummary {
            total_orphans: total as u64,
            total_bytes: bytes as u64,
            average_priority: avg,
            high_priority: high as u64,
            oldest_orphaned_at: oldest.as_deref().map(parse_ts),
        })
    }

    /// Reclaim an orphan: drop its record and mark the chunk deleted.
    ///
    /// Returns the bytes freed, or `None` when there was nothing to reclaim
    /// (already reclaimed, or the chunk has been referenced again).
    pub fn reclaim_orphan(&self, chunk_id: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let size: Option<i64> = tx
            .query_row(
                "SELECT size_bytes FROM orphan_chunks WHERE chunk_id = ?",
                [chunk_id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(size) = size else {
            return Ok(None);
        };

        tx.execute("DELETE FROM orphan_chunks WHERE chunk_id = ?", [chunk_id])?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM chunk_references WHERE chunk_id = ?",
                [chunk_id],
                |r| r.get(0),
            )
            .optional()?;

        let freed = match status {
            Some(s) => {
                let status: ChunkStatus = s.parse().map_err(conversion_error)?;
                if status == ChunkStatus::Orphaned {
                    tx.execute(
                        "UPDATE chunk_references SET status = 'deleted' WHERE chunk_id = ?",
                        [chunk_id],
                    )?;
                    Some(size as u64)
                } else {
                    tracing::debug!(
                        chunk_id,
                        status = %status,
                        "Dropping stale orphan record"
                    );
                    None
                }
            }
            // Chunk is only known to the external universe
            None => Some(size as u64),
        };

        tx.commit()?;
        Ok(freed)
    }

    fn row_to_orphan(row: &Row) -> rusqlite::Result<OrphanChunk> {
        let orphaned_at: String = row.get("orphaned_at")?;
        let last_access: String = row.get("last_access")?;

        Ok(OrphanChunk {
            chunk_id: row.get("chunk_id")?,
            file_path: row.get("file_path")?,
            chunk_hash: row.get("chunk_hash")?,
            content_hash: row.get("content_hash")?,
            orphaned_at: parse_ts(&orphaned_at),
            last_access: parse_ts(&last_access),
            access_count: row.get::<_, i64>("access_count")? as u64,
            size_bytes: row.get::<_, i64>("size_bytes")? as u64,
            potential_owners: json_column(row, "potential_owners")?,
            cleanup_priority: row.get("cleanup_priority")?,
            metadata: metadata_column(row)?,
        })
    }

    // ============================================
    // Migration plan operations
    // ============================================

    /// Insert or update a migration plan
    pub fn upsert_migration_plan(&self, plan: &MigrationPlan) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::write_plan(&conn, plan)
    }

    /// Claim a plan for execution.
    ///
    /// Moves the stored plan from `pending` to `executing` in one
    /// transaction, inserting it first if it was never persisted. Returns
    /// `false` when the stored plan is in any other status, so exactly one
    /// caller runs each plan.
    pub fn begin_migration_plan(
        &self,
        plan: &MigrationPlan,
        started_at: &DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT status FROM migration_plans WHERE migration_id = ?",
                [&plan.migration_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            Self::write_plan(&tx, plan)?;
        }

        let claimed = tx.execute(
            r#"
            UPDATE migration_plans
            SET status = ?1, started_at = ?2, completed_at = NULL, error_message = NULL
            WHERE migration_id = ?3 AND status = ?4
            "#,
            params![
                MigrationStatus::Executing.as_str(),
                ts(started_at),
                plan.migration_id,
                MigrationStatus::Pending.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(claimed == 1)
    }

    fn write_plan(conn: &Connection, plan: &MigrationPlan) -> Result<()> {
        let source = serde_json::to_string(&plan.source_chunks)?;
        let target = serde_json::to_string(&plan.target_chunks)?;
        let rollback = serde_json::to_string(&plan.rollback_plan)?;
        conn.execute(
            r#"
            INSERT INTO migration_plans (migration_id, strategy, source_chunks, target_chunks,
                                         estimated_duration, risk_level, rollback_plan, created_at,
                                         status, started_at, completed_at, error_message, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(migration_id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                error_message = excluded.error_message,
                metadata = excluded.metadata
            "#,
            params![
                plan.migration_id,
                plan.strategy.as_str(),
                source,
                target,
                plan.estimated_duration,
                plan.risk_level.as_str(),
                rollback,
                ts(&plan.created_at),
                plan.status.as_str(),
                plan.started_at.as_ref().map(ts),
                plan.completed_at.as_ref().map(ts),
                plan.error_message,
                plan.metadata.to_json(),
            ],
        )?;
        Ok(())
    }

    /// Get a migration plan by ID
    pub fn get_migration_plan(&self, migration_id: &str) -> Result<Option<MigrationPlan>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM migration_plans WHERE migration_id = ?",
            [migration_id],
            Self::row_to_plan,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List plans oldest first, optionally filtered by status
    pub fn list_migration_plans(
        &self,
        status: Option<MigrationStatus>,
    ) -> Result<Vec<MigrationPlan>> {
        let conn = self.conn.lock().unwrap();
        let plans = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM migration_plans WHERE status = ? ORDER BY created_at, rowid",
                )?;
                let rows = stmt
                    .query_map([status.as_str()], Self::row_to_plan)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM migration_plans ORDER BY created_at, rowid")?;
                let rows = stmt
                    .query_map([], Self::row_to_plan)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(plans)
    }

    fn row_to_plan(row: &Row) -> rusqlite::Result<MigrationPlan> {
        let created_at: String = row.get("created_at")?;
        let started_at: Option<String> = row.get("started_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;

        Ok(MigrationPlan {
            migration_id: row.get("migration_id")?,
            strategy: parse_column(row, "strategy")?,
            source_chunks: json_column(row, "source_chunks")?,
            target_chunks: json_column(row, "target_chunks")?,
            estimated_duration: row.get("estimated_duration")?,
            risk_level: parse_column(row, "risk_level")?,
            rollback_plan: json_column(row, "rollback_plan")?,
            created_at: parse_ts(&created_at),
            status: parse_column(row, "status")?,
            started_at: started_at.as_deref().map(parse_ts),
            completed_at: completed_at.as_deref().map(parse_ts),
            error_message: row.get("error_message")?,
            metadata: metadata_column(row)?,
        })
    }

    // ============================================
    // Rollback audit operations
    // ============================================

    pub fn insert_rollback_record(&self, record: &RollbackRecord) -> Result<()> {
        let steps = serde_json::to_string(&record.steps_completed)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO migration_rollbacks (rollback_id, migration_id, started_at, completed_at,
                                             success, steps_completed, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.rollback_id,
                record.migration_id,
                ts(&record.started_at),
                ts(&record.completed_at),
                record.success,
                steps,
                record.error_message,
            ],
        )?;
        Ok(())
    }

    /// Rollback attempts for a migration, oldest first
    pub fn list_rollback_records(&self, migration_id: &str) -> Result<Vec<RollbackRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM migration_rollbacks WHERE migration_id = ? ORDER BY started_at, rowid",
        )?;
        let records = stmt
            .query_map([migration_id], |row| {
                let started_at: String = row.get("started_at")?;
                let completed_at: String = row.get("completed_at")?;
                Ok(RollbackRecord {
                    rollback_id: row.get("rollback_id")?,
                    migration_id: row.get("migration_id")?,
                    started_at: parse_ts(&started_at),
                    completed_at: parse_ts(&completed_at),
                    success: row.get("success")?,
                    steps_completed: json_column(row, "steps_completed")?,
                    error_message: row.get("error_message")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ResilienceStore {
        let store = ResilienceStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    fn create_test_alias(id: &str, original: &str, current: &str) -> VersionAlias {
        VersionAlias {
            alias_id: id.to_string(),
            original_path: original.to_string(),
            current_path: current.to_string(),
            version_history: vec![original.to_string()],
            created_at: Utc::now(),
            last_accessed: Utc::now(),
            access_count: 1,
            metadata: Metadata::new(),
        }
    }

    fn create_test_orphan(id: &str, priority: f64, orphaned_at: DateTime<Utc>) -> OrphanChunk {
        OrphanChunk {
            chunk_id: id.to_string(),
            file_path: format!("/chunks/{}", id),
            chunk_hash: format!("hash-{}", id),
            content_hash: format!("content-{}", id),
            orphaned_at,
            last_access: orphaned_at,
            access_count: 0,
            size_bytes: 512,
            potential_owners: vec!["doc-1".to_string()],
            cleanup_priority: priority,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_alias_crud_and_path_lookup() {
        let store = store();
        let mut alias = create_test_alias("a1", "/a/v1.md", "/a/v2.md");
        store.upsert_alias(&alias).unwrap();

        let by_original = store.find_alias_by_path("/a/v1.md").unwrap().unwrap();
        assert_eq!(by_original.alias_id, "a1");
        let by_current = store.find_alias_by_path("/a/v2.md").unwrap().unwrap();
        assert_eq!(by_current.alias_id, "a1");
        assert!(store.find_alias_by_path("/elsewhere.md").unwrap().is_none());

        alias.version_history.push("/a/v2.md".to_string());
        alias.current_path = "/a/v3.md".to_string();
        store.upsert_alias(&alias).unwrap();

        let by_history = store.find_alias_by_path("/a/v2.md").unwrap().unwrap();
        assert_eq!(by_history.current_path, "/a/v3.md");
        assert_eq!(store.count_aliases().unwrap(), 1);

        assert!(store.delete_alias("a1").unwrap());
        assert!(!store.delete_alias("a1").unwrap());
        assert!(store.find_alias_by_path("/a/v3.md").unwrap().is_none());
        assert_eq!(store.count_aliases().unwrap(), 0);
    }

    #[test]
    fn test_delete_expired_aliases() {
        let store = store();
        let mut stale = create_test_alias("old", "/x/1", "/x/2");
        stale.last_accessed = Utc::now() - Duration::days(400);
        let mut fresh = create_test_alias("new", "/y/1", "/y/2");
        fresh.last_accessed = Utc::now() - Duration::days(1);
        store.upsert_alias(&stale).unwrap();
        store.upsert_alias(&fresh).unwrap();

        assert_eq!(store.delete_expired_aliases(365).unwrap(), 1);
        assert!(store.get_alias("old").unwrap().is_none());
        assert!(store.get_alias("new").unwrap().is_some());
    }

    #[test]
    fn test_chunk_reference_round_trip_and_status() {
        let store = store();
        let mut chunk = ChunkReference::new("c1", "/docs/a.md", "h", "ch", 2048);
        chunk.add_reference("doc-1");
        store.upsert_chunk_reference(&chunk).unwrap();

        let loaded = store.get_chunk_reference("c1").unwrap().unwrap();
        assert_eq!(loaded.reference_count, 1);
        assert_eq!(loaded.status, ChunkStatus::Active);

        assert!(store.set_chunk_status("c1", ChunkStatus::Orphaned).unwrap());
        assert!(store.set_chunk_status("c1", ChunkStatus::Deleted).unwrap());
        let err = store.set_chunk_status("c1", ChunkStatus::Active).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(!store.set_chunk_status("missing", ChunkStatus::Active).unwrap());

        assert!(store.list_chunk_references(false).unwrap().is_empty());
        assert_eq!(store.list_chunk_references(true).unwrap().len(), 1);
    }

    #[test]
    fn test_reactivate_archived_chunk_only() {
        let store = store();
        store
            .upsert_chunk_reference(&ChunkReference::new("a", "/a", "h", "c", 1))
            .unwrap();
        store
            .upsert_chunk_reference(&ChunkReference::new("b", "/b", "h", "c", 1))
            .unwrap();
        store.set_chunk_status("a", ChunkStatus::Migrating).unwrap();
        store.set_chunk_status("a", ChunkStatus::Archived).unwrap();

        assert!(store.reactivate_archived_chunk("a").unwrap());
        assert!(!store.reactivate_archived_chunk("b").unwrap());
        assert!(!store.reactivate_archived_chunk("missing").unwrap());
        assert_eq!(
            store.get_chunk_reference("a").unwrap().unwrap().status,
            ChunkStatus::Active
        );
    }

    #[test]
    fn test_list_orphans_ordering() {
        let store = store();
        let now = Utc::now();
        store
            .upsert_orphan_chunk(&create_test_orphan("low", 0.2, now - Duration::days(9)))
            .unwrap();
        store
            .upsert_orphan_chunk(&create_test_orphan("high-new", 0.9, now))
            .unwrap();
        store
            .upsert_orphan_chunk(&create_test_orphan("high-old", 0.9, now - Duration::days(3)))
            .unwrap();

        let ids: Vec<String> = store
            .list_orphans(10)
            .unwrap()
            .into_iter()
            .map(|o| o.chunk_id)
            .collect();
        assert_eq!(ids, vec!["high-old", "high-new", "low"]);
        assert_eq!(store.list_orphans(1).unwrap().len(), 1);

        let summary = store.orphan_summary().unwrap();
        assert_eq!(summary.total_orphans, 3);
        assert_eq!(summary.total_bytes, 1536);
        assert_eq!(summary.high_priority, 2);
    }

    #[test]
    fn test_orphan_upsert_keeps_first_orphaned_at() {
        let store = store();
        let first = Utc::now() - Duration::days(5);
        store
            .upsert_orphan_chunk(&create_test_orphan("c1", 0.3, first))
            .unwrap();
        store
            .upsert_orphan_chunk(&create_test_orphan("c1", 0.6, Utc::now()))
            .unwrap();

        let orphan = store.get_orphan_chunk("c1").unwrap().unwrap();
        assert_eq!(ts(&orphan.orphaned_at), ts(&first));
        assert_eq!(orphan.cleanup_priority, 0.6);
    }

    #[test]
    fn test_reclaim_orphan_is_idempotent() {
        let store = store();
        let mut chunk = ChunkReference::new("c1", "/chunks/c1", "h", "ch", 512);
        chunk.status = ChunkStatus::Orphaned;
        store.upsert_chunk_reference(&chunk).unwrap();
        store
            .upsert_orphan_chunk(&create_test_orphan("c1", 0.9, Utc::now()))
            .unwrap();

        assert_eq!(store.reclaim_orphan("c1").unwrap(), Some(512));
        assert_eq!(store.reclaim_orphan("c1").unwrap(), None);
        let chunk = store.get_chunk_reference("c1").unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Deleted);
    }

    #[test]
    fn test_reclaim_skips_rereferenced_chunk() {
        let store = store();
        let chunk = ChunkReference::new("c1", "/chunks/c1", "h", "ch", 512);
        store.upsert_chunk_reference(&chunk).unwrap();
        store
            .upsert_orphan_chunk(&create_test_orphan("c1", 0.9, Utc::now()))
            .unwrap();

        assert_eq!(store.reclaim_orphan("c1").unwrap(), None);
        assert!(store.get_orphan_chunk("c1").unwrap().is_none());
        let chunk = store.get_chunk_reference("c1").unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Active);
    }

    #[test]
    fn test_mark_orphan_skips_reclaimed_chunk() {
        let store = store();
        let chunk = ChunkReference::new("c1", "/chunks/c1", "h", "ch", 512);
        store.upsert_chunk_reference(&chunk).unwrap();
        let orphan = create_test_orphan("c1", 0.9, Utc::now());

        assert!(store.mark_orphan(&orphan).unwrap());
        assert_eq!(
            store.get_chunk_reference("c1").unwrap().unwrap().status,
            ChunkStatus::Orphaned
        );
        assert_eq!(store.reclaim_orphan("c1").unwrap(), Some(512));

        // A scan that read the chunk before the reclaim must not bring it back
        assert!(!store.mark_orphan(&orphan).unwrap());
        assert!(store.get_orphan_chunk("c1").unwrap().is_none());
        assert_eq!(
            store.get_chunk_reference("c1").unwrap().unwrap().status,
            ChunkStatus::Deleted
        );

        // Untracked chunks are recorded as is
        assert!(store
            .mark_orphan(&create_test_orphan("external", 0.5, Utc::now()))
            .unwrap());
        assert!(store.get_orphan_chunk("external").unwrap().is_some());
    }

    #[test]
    fn test_revalidate_orphan() {
        let store = store();
        let chunk = ChunkReference::new("c1", "/chunks/c1", "h", "ch", 512);
        store.upsert_chunk_reference(&chunk).unwrap();
        assert!(!store.revalidate_orphan("c1").unwrap());

        store
            .mark_orphan(&create_test_orphan("c1", 0.9, Utc::now()))
            .unwrap();
        assert!(store.revalidate_orphan("c1").unwrap());
        assert!(store.get_orphan_chunk("c1").unwrap().is_none());
        assert_eq!(
            store.get_chunk_reference("c1").unwrap().unwrap().status,
            ChunkStatus::Active
        );
    }

    fn create_test_plan(id: &str) -> MigrationPlan {
        MigrationPlan {
            migration_id: id.to_string(),
            strategy: MigrationStrategy::Immediate,
            source_chunks: vec!["s1".to_string()],
            target_chunks: vec![],
            estimated_duration: 0.1,
            risk_level: RiskLevel::Low,
            rollback_plan: RollbackPlan {
                backup_source_chunks: vec!["s1".to_string()],
                backup_target_chunks: vec![],
                steps: RollbackStep::PROCEDURE.to_vec(),
                estimated_rollback_duration: 0.05,
            },
            created_at: Utc::now(),
            status: MigrationStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_begin_migration_plan_claims_once() {
        let store = store();
        let plan = create_test_plan("m1");
        store.upsert_migration_plan(&plan).unwrap();

        let now = Utc::now();
        assert!(store.begin_migration_plan(&plan, &now).unwrap());
        // The caller's copy still says pending; the stored row decides
        assert!(!store.begin_migration_plan(&plan, &now).unwrap());

        let stored = store.get_migration_plan("m1").unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Executing);
        assert!(stored.started_at.is_some());

        let mut done = stored;
        done.status = MigrationStatus::Completed;
        store.upsert_migration_plan(&done).unwrap();
        assert!(!store.begin_migration_plan(&plan, &now).unwrap());
        assert_eq!(
            store.get_migration_plan("m1").unwrap().unwrap().status,
            MigrationStatus::Completed
        );
    }

    #[test]
    fn test_begin_migration_plan_persists_unsaved_plan() {
        let store = store();
        let plan = create_test_plan("fresh");

        assert!(store.begin_migration_plan(&plan, &Utc::now()).unwrap());
        let stored = store.get_migration_plan("fresh").unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Executing);
        assert_eq!(stored.source_chunks, vec!["s1".to_string()]);
    }
}
