//! Orphan reclamation
//!
//! A cleanup pass takes the highest-priority orphans (ties broken by age),
//! decides which are worth reclaiming, and hands those to a
//! [`ChunkReclaimer`]. One failed reclamation never aborts the pass, and a
//! pass never attempts more than its `max_operations`.

use crate::db::ResilienceStore;
use crate::error::{Error, Result};
use crate::orphan::MIB;
use crate::types::OrphanChunk;
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Orphans older than this (since last access) are reclaimable
const MIN_AGE_DAYS: f64 = 30.0;

/// Large orphans qualify early when their priority exceeds this
const LARGE_CHUNK_PRIORITY: f64 = 0.7;

/// Removes an orphaned chunk from storage.
///
/// Implementations must be safe to call twice for the same chunk: the
/// second call returns `Ok(None)`.
pub trait ChunkReclaimer: Send + Sync {
    /// Returns the number of bytes freed, or `None` if there was nothing left to reclaim.
    fn reclaim(&self, orphan: &OrphanChunk) -> Result<Option<u64>>;
}

/// Reclaims by dropping the orphan record and marking the chunk deleted.
pub struct StoreReclaimer {
    store: Arc<ResilienceStore>,
}

impl StoreReclaimer {
    pub fn new(store: Arc<ResilienceStore>) -> Self {
        Self { store }
    }
}

impl ChunkReclaimer for StoreReclaimer {
    fn reclaim(&self, orphan: &OrphanChunk) -> Result<Option<u64>> {
        self.store.reclaim_orphan(&orphan.chunk_id)
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    /// Orphans considered
    pub total: usize,
    /// Reclamations attempted (eligible orphans)
    pub attempted: usize,
    /// Reclaimed this pass
    pub cleaned: usize,
    /// Already reclaimed by someone else
    pub skipped: usize,
    pub failed: usize,
    pub bytes_freed: u64,
}

/// Eligibility rule for reclaiming an orphan.
#[derive(Debug, Clone, Copy)]
pub struct CleanupPolicy {
    pub priority_threshold: f64,
    pub aggressive: bool,
}

impl CleanupPolicy {
    /// Whether `orphan` should be reclaimed at `now`.
    ///
    /// Priority must reach the threshold; unless aggressive, the orphan
    /// must also be older than 30 days or be a large, high-priority chunk.
    pub fn should_cleanup(&self, orphan: &OrphanChunk, now: DateTime<Utc>) -> bool {
        if orphan.cleanup_priority < self.priority_threshold {
            return false;
        }
        if self.aggressive {
            return true;
        }

        let age_days = (now - orphan.last_access).num_seconds() as f64 / 86_400.0;
        age_days > MIN_AGE_DAYS
            || (orphan.size_bytes > MIB && orphan.cleanup_priority > LARGE_CHUNK_PRIORITY)
    }
}

/// Lifetime counters for status reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStatus {
    pub active: bool,
    pub passes: u64,
    pub failures: u64,
    pub chunks_cleaned: u64,
    pub bytes_freed: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CleanupTotals {
    passes: AtomicU64,
    failures: AtomicU64,
    chunks_cleaned: AtomicU64,
    bytes_freed: AtomicU64,
    last_pass_at: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
struct CleanupPass {
    store: Arc<ResilienceStore>,
    reclaimer: Arc<dyn ChunkReclaimer>,
    policy: CleanupPolicy,
    totals: Arc<CleanupTotals>,
}

impl CleanupPass {
    fn run(&self, max_operations: usize) -> Result<CleanupStats> {
        let result = self.sweep(max_operations);
        match &result {
            Ok(stats) => {
                self.totals.passes.fetch_add(1, Ordering::Relaxed);
                self.totals
                    .chunks_cleaned
                    .fetch_add(stats.cleaned as u64, Ordering::Relaxed);
                self.totals
                    .bytes_freed
                    .fetch_add(stats.bytes_freed, Ordering::Relaxed);
                *self.totals.last_pass_at.lock().unwrap() = Some(Utc::now());
            }
            Err(_) => {
                self.totals.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn sweep(&self, max_operations: usize) -> Result<CleanupStats> {
        let orphans = self.store.list_orphans(max_operations)?;
        let now = Utc::now();
        let mut stats = CleanupStats {
            total: orphans.len(),
            ..Default::default()
        };

        for orphan in &orphans {
            if stats.attempted >= max_operations {
                break;
            }
            if !self.policy.should_cleanup(orphan, now) {
                continue;
            }

            stats.attempted += 1;
            match self.reclaimer.reclaim(orphan) {
                Ok(Some(bytes)) => {
                    stats.cleaned += 1;
                    stats.bytes_freed += bytes;
                    tracing::debug!(
                        chunk_id = %orphan.chunk_id,
                        bytes,
                        priority = orphan.cleanup_priority,
                        "Orphan reclaimed"
                    );
                }
                Ok(None) => {
                    stats.skipped += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    let err = match e {
                        Error::Cleanup { .. } => e,
                        other => Error::Cleanup {
                            chunk_id: orphan.chunk_id.clone(),
                            message: other.to_string(),
                        },
                    };
                    tracing::warn!(error = %err, "Orphan reclamation failed");
                }
            }
        }

        tracing::info!(
            total = stats.total,
            attempted = stats.attempted,
            cleaned = stats.cleaned,
            failed = stats.failed,
            bytes_freed = stats.bytes_freed,
            "Cleanup pass complete"
        );

        Ok(stats)
    }
}

/// Reclaims low-value orphans, on demand or on a background interval.
pub struct CleanupManager {
    pass: CleanupPass,
    max_cleanup_operations: usize,
    interval: Duration,
    backoff: Duration,
    join_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl CleanupManager {
    pub fn new(
        store: Arc<ResilienceStore>,
        reclaimer: Arc<dyn ChunkReclaimer>,
        policy: CleanupPolicy,
        max_cleanup_operations: usize,
        interval: Duration,
        backoff: Duration,
        join_timeout: Duration,
    ) -> Self {
        Self {
            pass: CleanupPass {
                store,
                reclaimer,
                policy,
                totals: Arc::new(CleanupTotals::default()),
            },
            max_cleanup_operations,
            interval,
            backoff,
            join_timeout,
            worker: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> CleanupPolicy {
        self.pass.policy
    }

    /// Reclaim up to `max_operations` eligible orphans.
    pub fn cleanup_orphans(&self, max_operations: usize) -> Result<CleanupStats> {
        self.pass.run(max_operations)
    }

    /// Start the background loop. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().map(Worker::is_running).unwrap_or(false) {
            return Ok(());
        }

        let pass = self.pass.clone();
        let max_operations = self.max_cleanup_operations;
        *worker = Some(Worker::spawn(
            "orphan-cleanup",
            self.interval,
            self.backoff,
            move |_| pass.run(max_operations).map(|_| ()),
        )?);
        Ok(())
    }

    /// Stop the background loop, waiting a bounded time for it to exit.
    pub fn stop(&self) {
        if let Some(mut worker) = self.worker.lock().unwrap().take() {
            worker.stop(self.join_timeout);
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(Worker::is_running)
            .unwrap_or(false)
    }

    pub fn status(&self) -> CleanupStatus {
        let totals = &self.pass.totals;
        CleanupStatus {
            active: self.is_running(),
            passes: totals.passes.load(Ordering::Relaxed),
            failures: totals.failures.load(Ordering::Relaxed),
            chunks_cleaned: totals.chunks_cleaned.load(Ordering::Relaxed),
            bytes_freed: totals.bytes_freed.load(Ordering::Relaxed),
            last_pass_at: *totals.last_pass_at.lock().unwrap(),
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.stop();
    }
}
