//! Orphan chunk detection
//!
//! The detector walks the chunk universe (an external enumerator of chunks
//! and their live reference counts), records every unreferenced chunk as an
//! [`OrphanChunk`] with a cleanup priority, and returns re-referenced
//! chunks to `Active`.
//!
//! ## Cleanup priority
//!
//! ```text
//! priority = 0.4 * size_factor + 0.4 * age_factor + 0.2 * access_factor
//!
//! size_factor   = min(size_bytes / 1 MiB, 1)
//! age_factor    = min(days since last access / 30, 1)
//! access_factor = max(0, 1 - access_count / 100)
//! ```

use crate::db::ResilienceStore;
use crate::error::{Error, Result};
use crate::types::{ChunkStatus, Metadata, OrphanChunk};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One mebibyte
pub const MIB: u64 = 1024 * 1024;

/// Age at which the age factor saturates
pub const AGE_SATURATION_DAYS: f64 = 30.0;

/// Access count at which the access factor reaches zero
pub const ACCESS_SATURATION: f64 = 100.0;

const SIZE_WEIGHT: f64 = 0.4;
const AGE_WEIGHT: f64 = 0.4;
const ACCESS_WEIGHT: f64 = 0.2;

/// What the chunk universe reports about one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkObservation {
    pub chunk_id: String,
    pub file_path: String,
    pub chunk_hash: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub access_count: u64,
    pub last_access_time: DateTime<Utc>,
    pub live_reference_count: u64,
}

/// Source of truth for which chunks exist and who references them.
pub trait ChunkUniverse: Send + Sync {
    fn enumerate(&self) -> Result<Vec<ChunkObservation>>;
}

/// Chunk universe backed by the store's own chunk references.
pub struct StoreChunkUniverse {
    store: Arc<ResilienceStore>,
}

impl StoreChunkUniverse {
    pub fn new(store: Arc<ResilienceStore>) -> Self {
        Self { store }
    }
}

impl ChunkUniverse for StoreChunkUniverse {
    fn enumerate(&self) -> Result<Vec<ChunkObservation>> {
        let chunks = self.store.list_chunk_references(false)?;
        Ok(chunks
            .into_iter()
            .map(|c| ChunkObservation {
                live_reference_count: c.reference_count,
                chunk_id: c.chunk_id,
                file_path: c.file_path,
                chunk_hash: c.chunk_hash,
                content_hash: c.content_hash,
                size_bytes: c.size_bytes,
                access_count: c.access_count,
                last_access_time: c.last_referenced,
            })
            .collect())
    }
}

/// Score an orphan for reclamation; always within `0.0..=1.0`.
pub fn cleanup_priority(
    size_bytes: u64,
    last_access: DateTime<Utc>,
    access_count: u64,
    now: DateTime<Utc>,
) -> f64 {
    let size_factor = (size_bytes as f64 / MIB as f64).clamp(0.0, 1.0);

    let age_days = (now - last_access).num_seconds() as f64 / 86_400.0;
    let age_factor = (age_days / AGE_SATURATION_DAYS).clamp(0.0, 1.0);

    let access_factor = (1.0 - access_count as f64 / ACCESS_SATURATION).clamp(0.0, 1.0);

    (SIZE_WEIGHT * size_factor + AGE_WEIGHT * age_factor + ACCESS_WEIGHT * access_factor)
        .clamp(0.0, 1.0)
}

/// Counters reported through the orchestrator status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorStatus {
    pub active: bool,
    pub passes: u64,
    pub failures: u64,
    pub last_detected: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct DetectorStats {
    passes: AtomicU64,
    failures: AtomicU64,
    last_detected: AtomicU64,
    last_pass_at: Mutex<Option<DateTime<Utc>>>,
}

/// A single detection pass, shareable with the worker thread.
#[derive(Clone)]
struct DetectionPass {
    store: Arc<ResilienceStore>,
    universe: Arc<dyn ChunkUniverse>,
    stats: Arc<DetectorStats>,
}

impl DetectionPass {
    fn run(&self) -> Result<Vec<OrphanChunk>> {
        let result = self.scan();
        match &result {
            Ok(orphans) => {
                self.stats.passes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .last_detected
                    .store(orphans.len() as u64, Ordering::Relaxed);
                *self.stats.last_pass_at.lock().unwrap() = Some(Utc::now());
            }
            Err(_) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn scan(&self) -> Result<Vec<OrphanChunk>> {
        let observations = self.universe.enumerate().map_err(|e| match e {
            Error::Detection(_) => e,
            other => Error::Detection(other.to_string()),
        })?;

        let now = Utc::now();
        let scanned = observations.len();
        let mut orphans = Vec::new();
        let mut revalidated = 0usize;

        for obs in observations {
            let known = self.store.get_chunk_reference(&obs.chunk_id)?;

            if obs.live_reference_count > 0 {
                if self.store.revalidate_orphan(&obs.chunk_id)? {
                    revalidated += 1;
                }
                continue;
            }

            // Terminal chunks are gone; migrating chunks belong to a running plan
            if let Some(chunk) = &known {
                if chunk.status.is_terminal() || chunk.status == ChunkStatus::Migrating {
                    continue;
                }
            }

            let existing = self.store.get_orphan_chunk(&obs.chunk_id)?;

            // Whoever referenced the chunk last is the likeliest owner
            let potential_owners = known
                .as_ref()
                .map(|c| {
                    if c.referenced_by.is_empty() {
                        c.previous_owners()
                    } else {
                        c.referenced_by.clone()
                    }
                })
                .filter(|owners| !owners.is_empty())
                .or_else(|| existing.as_ref().map(|o| o.potential_owners.clone()))
                .unwrap_or_default();

            let orphan = OrphanChunk {
                cleanup_priority: cleanup_priority(
                    obs.size_bytes,
                    obs.last_access_time,
                    obs.access_count,
                    now,
                ),
                chunk_id: obs.chunk_id,
                file_path: obs.file_path,
                chunk_hash: obs.chunk_hash,
                content_hash: obs.content_hash,
                orphaned_at: existing.as_ref().map(|o| o.orphaned_at).unwrap_or(now),
                last_access: obs.last_access_time,
                access_count: obs.access_count,
                size_bytes: obs.size_bytes,
                potential_owners,
                metadata: existing.map(|o| o.metadata).unwrap_or_else(Metadata::new),
            };

            // Cleanup or a migration may have claimed the chunk since we read it
            if self.store.mark_orphan(&orphan)? {
                orphans.push(orphan);
            }
        }

        tracing::info!(
            scanned,
            orphans = orphans.len(),
            revalidated,
            "Orphan detection pass complete"
        );

        Ok(orphans)
    }
}

/// Finds unreferenced chunks, on demand or on a background interval.
pub struct OrphanDetector {
    pass: DetectionPass,
    interval: Duration,
    backoff: Duration,
    join_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl OrphanDetector {
    pub fn new(
        store: Arc<ResilienceStore>,
        universe: Arc<dyn ChunkUniverse>,
        interval: Duration,
        backoff: Duration,
        join_timeout: Duration,
    ) -> Self {
        Self {
            pass: DetectionPass {
                store,
                universe,
                stats: Arc::new(DetectorStats::default()),
            },
            interval,
            backoff,
            join_timeout,
            worker: Mutex::new(None),
        }
    }

    /// Run one detection pass and persist every orphan found.
    pub fn detect_orphans(&self) -> Result<Vec<OrphanChunk>> {
        self.pass.run()
    }

    /// Start the background loop. No-op if already running.
    pub fn start_detection(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().map(Worker::is_running).unwrap_or(false) {
            return Ok(());
        }

        let pass = self.pass.clone();
        *worker = Some(Worker::spawn(
            "orphan-detector",
            self.interval,
            self.backoff,
            move |_| pass.run().map(|_| ()),
        )?);
        Ok(())
    }

    /// Stop the background loop, waiting a bounded time for it to exit.
    pub fn stop_detection(&self) {
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

    pub fn status(&self) -> DetectorStatus {
        let stats = &self.pass.stats;
        DetectorStatus {
            active: self.is_running(),
            passes: stats.passes.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            last_detected: stats.last_detected.load(Ordering::Relaxed),
            last_pass_at: *stats.last_pass_at.lock().unwrap(),
        }
    }
}

impl Drop for OrphanDetector {
    fn drop(&mut self) {
        self.stop_detection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkReference;
    use chrono::Duration as ChronoDuration;

    struct FailingUniverse;

    impl ChunkUniverse for FailingUniverse {
        fn enumerate(&self) -> Result<Vec<ChunkObservation>> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "chunk index missing",
            )))
        }
    }

    fn store() -> Arc<ResilienceStore> {
        let store = Arc::new(ResilienceStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        store
    }

    fn detector(store: &Arc<ResilienceStore>) -> OrphanDetector {
        OrphanDetector::new(
            Arc::clone(store),
            Arc::new(StoreChunkUniverse::new(Arc::clone(store))),
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_priority_scenario_large_old_untouched() {
        let now = Utc::now();
        let p = cleanup_priority(2 * MIB, now - ChronoDuration::days(40), 0, now);
        assert!((0.8..=1.0).contains(&p), "priority {}", p);
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_priority_always_in_range() {
        let now = Utc::now();
        let sizes = [0, 1, MIB / 2, MIB, 10 * MIB, u64::MAX];
        let ages = [-5i64, 0, 1, 15, 30, 365, 10_000];
        let accesses = [0, 1, 50, 100, 1_000, u64::MAX];
        for &size in &sizes {
            for &age in &ages {
                for &access in &accesses {
                    let p = cleanup_priority(size, now - ChronoDuration::days(age), access, now);
                    assert!((0.0..=1.0).contains(&p), "{} {} {} -> {}", size, age, access, p);
                }
            }
        }
    }

    #[test]
    fn test_priority_fresh_hot_chunk_is_low() {
        let now = Utc::now();
        let p = cleanup_priority(1024, now, 500, now);
        assert!(p < 0.01, "priority {}", p);
    }

    #[test]
    fn test_detect_orphans_marks_unreferenced_chunks() {
        let store = store();
        let mut live = ChunkReference::new("live", "/c/live", "h1", "c1", 100);
        live.add_reference("doc-1");
        let mut dead = ChunkReference::new("dead", "/c/dead", "h2", "c2", 2 * MIB);
        dead.last_referenced = Utc::now() - ChronoDuration::days(40);
        store.upsert_chunk_reference(&live).unwrap();
        store.upsert_chunk_reference(&dead).unwrap();

        let det = detector(&store);
        let orphans = det.detect_orphans().unwrap();

        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].chunk_id, "dead");
        assert!(orphans[0].cleanup_priority > 0.9);
        assert!(store.get_orphan_chunk("dead").unwrap().is_some());
        assert_eq!(
            store.get_chunk_reference("dead").unwrap().unwrap().status,
            ChunkStatus::Orphaned
        );
        assert_eq!(det.status().passes, 1);
        assert_eq!(det.status().last_detected, 1);
    }

    #[test]
    fn test_redetection_keeps_orphaned_at_and_revalidates() {
        let store = store();
        let chunk = ChunkReference::new("c", "/c/c", "h", "ch", 10);
        store.upsert_chunk_reference(&chunk).unwrap();

        let det = detector(&store);
        let first = det.detect_orphans().unwrap().remove(0);
        let second = det.detect_orphans().unwrap().remove(0);
        assert!((first.orphaned_at - second.orphaned_at).num_milliseconds().abs() < 1);

        // Referenced again before cleanup got to it
        let mut chunk = store.get_chunk_reference("c").unwrap().unwrap();
        chunk.add_reference("doc-9");
        store.upsert_chunk_reference(&chunk).unwrap();

        assert!(det.detect_orphans().unwrap().is_empty());
        assert!(store.get_orphan_chunk("c").unwrap().is_none());
    }

    #[test]
    fn test_orphan_lists_entities_that_dropped_it() {
        let store = store();
        let mut chunk = ChunkReference::new("c", "/c/c", "h", "ch", 10);
        chunk.add_reference("doc-1");
        chunk.add_reference("doc-2");
        store.upsert_chunk_reference(&chunk).unwrap();

        let mut chunk = store.get_chunk_reference("c").unwrap().unwrap();
        chunk.remove_reference("doc-1");
        chunk.set_references(vec![]);
        store.upsert_chunk_reference(&chunk).unwrap();

        let det = detector(&store);
        let orphans = det.detect_orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].potential_owners, vec!["doc-1", "doc-2"]);
        assert_eq!(
            store.get_orphan_chunk("c").unwrap().unwrap().potential_owners,
            vec!["doc-1", "doc-2"]
        );
    }

    #[test]
    fn test_enumeration_failure_is_detection_error() {
        let store = store();
        let det = OrphanDetector::new(
            Arc::clone(&store),
            Arc::new(FailingUniverse),
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        assert!(matches!(det.detect_orphans(), Err(Error::Detection(_))));
        assert_eq!(det.status().failures, 1);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let store = store();
        let det = detector(&store);
        det.start_detection().unwrap();
        det.start_detection().unwrap();
        assert!(det.is_running());
        det.stop_detection();
        det.stop_detection();
        assert!(!det.is_running());
    }
}
