//! Migration planning, execution and rollback
//!
//! A migration moves a set of source chunks to a set of target chunks.
//! Plans are persisted as `pending` and queued on a FIFO channel; the
//! background consumer executes them one at a time. Callers may also run a
//! plan synchronously with [`MigrationManager::execute_migration`].
//!
//! Every strategy runs through the same engine. Strategies only differ in
//! how chunks are grouped and whether the engine pauses between groups:
//!
//! | Strategy | Group size | Pause |
//! |----------|------------|-------|
//! | immediate | all chunks | no |
//! | batch | `migration_batch_size` | no |
//! | gradual | 1 | `migration_step_delay_ms` |
//! | intelligent | by risk: low = batch size, medium = half, high = 1 | `migration_step_delay_ms` |
//!
//! Rollback is a separate remediation. It never changes the plan's status;
//! each attempt is recorded in the rollback audit trail.

use crate::alias::VersionAliasManager;
use crate::config::ResilienceConfig;
use crate::db::ResilienceStore;
use crate::error::{Error, Result};
use crate::types::{
    ChunkStatus, Metadata, MetadataKey, MigrationPlan, MigrationStatus, MigrationStrategy,
    RiskLevel, RollbackPlan, RollbackRecord, RollbackStep,
};
use crate::worker::Worker;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Base cost of migrating ten chunks with the immediate strategy
pub const BASE_DURATION: f64 = 1.0;

/// Rollback is estimated at this fraction of the migration estimate
const ROLLBACK_DURATION_FACTOR: f64 = 0.5;

/// How long the consumer blocks on an empty queue before re-checking for stop
const QUEUE_POLL: Duration = Duration::from_secs(1);

/// Estimated duration, in time units, of migrating `chunk_count` chunks.
pub fn estimate_duration(strategy: MigrationStrategy, chunk_count: usize) -> f64 {
    BASE_DURATION * strategy.duration_multiplier() * (chunk_count as f64 / 10.0)
}

/// Chunks per group for a strategy.
fn group_size(
    strategy: MigrationStrategy,
    risk_level: RiskLevel,
    batch_size: usize,
    total: usize,
) -> usize {
    let size = match strategy {
        MigrationStrategy::Immediate => total,
        MigrationStrategy::Batch => batch_size,
        MigrationStrategy::Gradual => 1,
        MigrationStrategy::Intelligent => match risk_level {
            RiskLevel::Low => batch_size,
            RiskLevel::Medium => batch_size / 2,
            RiskLevel::High => 1,
        },
    };
    size.max(1)
}

fn is_paced(strategy: MigrationStrategy) -> bool {
    matches!(
        strategy,
        MigrationStrategy::Gradual | MigrationStrategy::Intelligent
    )
}

/// Performs the chunk moves for one group of a migration.
///
/// Implementations that touch real storage should leave the store's chunk
/// statuses consistent with what they did: sources end `archived`, targets
/// end `active`.
pub trait ChunkMover: Send + Sync {
    fn move_group(&self, migration_id: &str, sources: &[String], targets: &[String]) -> Result<()>;
}

/// Moves chunks by updating their lifecycle status in the store.
pub struct StoreChunkMover {
    store: Arc<ResilienceStore>,
}

impl StoreChunkMover {
    pub fn new(store: Arc<ResilienceStore>) -> Self {
        Self { store }
    }

    fn transition(&self, migration_id: &str, chunk_id: &str, status: ChunkStatus) -> Result<()> {
        if self.store.set_chunk_status(chunk_id, status)? {
            Ok(())
        } else {
            Err(Error::MigrationExecution {
                migration_id: migration_id.to_string(),
                message: format!("chunk {} is not tracked", chunk_id),
            })
        }
    }
}

impl ChunkMover for StoreChunkMover {
    fn move_group(&self, migration_id: &str, sources: &[String], targets: &[String]) -> Result<()> {
        for id in sources {
            self.transition(migration_id, id, ChunkStatus::Migrating)?;
        }
        for id in targets {
            self.transition(migration_id, id, ChunkStatus::Active)?;
        }
        for id in sources {
            self.transition(migration_id, id, ChunkStatus::Archived)?;
        }
        tracing::debug!(
            migration_id,
            sources = sources.len(),
            targets = targets.len(),
            "Migration group moved"
        );
        Ok(())
    }
}

/// Execution tuning, usually taken from [`ResilienceConfig`].
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub step_delay: Duration,
    pub timeout: Duration,
    pub auto_rollback_on_failure: bool,
    pub backoff: Duration,
    pub join_timeout: Duration,
}

impl MigrationSettings {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            batch_size: config.migration_batch_size,
            step_delay: config.migration_step_delay(),
            timeout: config.migration_timeout(),
            auto_rollback_on_failure: config.auto_rollback_on_failure,
            backoff: config.worker_backoff(),
            join_timeout: config.worker_join_timeout(),
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

/// Counters reported through the orchestrator status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationManagerStatus {
    pub active: bool,
    pub queued: usize,
    pub executed: u64,
    pub completed: u64,
    pub failed: u64,
    pub rollbacks: u64,
}

#[derive(Default)]
struct MigrationStats {
    executed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rollbacks: AtomicU64,
}

/// Shared execution state, cloned into the consumer thread.
#[derive(Clone)]
struct MigrationEngine {
    store: Arc<ResilienceStore>,
    aliases: Arc<VersionAliasManager>,
    mover: Arc<dyn ChunkMover>,
    settings: MigrationSettings,
    stats: Arc<MigrationStats>,
    queue: Arc<Mutex<Receiver<String>>>,
    queued: Arc<AtomicUsize>,
}

impl MigrationEngine {
    fn execute(&self, plan: &mut MigrationPlan) -> Result<bool> {
        let started_at = Utc::now();
        if !self.store.begin_migration_plan(plan, &started_at)? {
            // Someone else ran it, or it already finished; show what is stored
            if let Some(stored) = self.store.get_migration_plan(&plan.migration_id)? {
                *plan = stored;
            }
            tracing::warn!(
                migration_id = %plan.migration_id,
                status = %plan.status,
                "Skipping migration that is not pending"
            );
            return Ok(false);
        }

        plan.status = MigrationStatus::Executing;
        plan.started_at = Some(started_at);
        self.stats.executed.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            migration_id = %plan.migration_id,
            strategy = %plan.strategy,
            sources = plan.source_chunks.len(),
            targets = plan.target_chunks.len(),
            "Migration started"
        );

        let outcome = self.run_groups(plan);
        plan.completed_at = Some(Utc::now());

        match outcome {
            Ok(()) => {
                plan.status = MigrationStatus::Completed;
                plan.error_message = None;
                self.store.upsert_migration_plan(plan)?;
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(migration_id = %plan.migration_id, "Migration completed");
                Ok(true)
            }
            Err(e) => {
                let message = match e {
                    Error::MigrationExecution { message, .. } => message,
                    other => other.to_string(),
                };
                plan.status = MigrationStatus::Failed;
                plan.error_message = Some(message.clone());
                plan.metadata.set(MetadataKey::LastError, message.clone());
                self.store.upsert_migration_plan(plan)?;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    migration_id = %plan.migration_id,
                    error = %message,
                    "Migration failed"
                );
                Err(Error::MigrationExecution {
                    migration_id: plan.migration_id.clone(),
                    message,
                })
            }
        }
    }

    fn run_groups(&self, plan: &MigrationPlan) -> Result<()> {
        let total = plan.source_chunks.len().max(plan.target_chunks.len());
        let size = group_size(plan.strategy, plan.risk_level, self.settings.batch_size, total);
        let groups = (total + size - 1) / size;
        let started = Instant::now();

        for index in 0..groups {
            if started.elapsed() >= self.settings.timeout {
                return Err(Error::MigrationExecution {
                    migration_id: plan.migration_id.clone(),
                    message: format!(
                        "timed out after {}s at group {} of {}",
                        self.settings.timeout.as_secs_f64(),
                        index + 1,
                        groups
                    ),
                });
            }

            let sources = window(&plan.source_chunks, index, size);
            let targets = window(&plan.target_chunks, index, size);
            self.mover.move_group(&plan.migration_id, sources, targets)?;

            if is_paced(plan.strategy) && index + 1 < groups && !self.settings.step_delay.is_zero() {
                let remaining = self.settings.timeout.saturating_sub(started.elapsed());
                thread::sleep(self.settings.step_delay.min(remaining));
            }
        }

        Ok(())
    }

    fn rollback(&self, migration_id: &str) -> Result<RollbackRecord> {
        let plan = self
            .store
            .get_migration_plan(migration_id)?
            .ok_or_else(|| Error::PlanNotFound(migration_id.to_string()))?;

        let started_at = Utc::now();
        let mut steps_completed = Vec::new();
        let mut error_message = None;

        for step in &plan.rollback_plan.steps {
            match self.rollback_step(&plan, *step) {
                Ok(()) => steps_completed.push(*step),
                Err(e) => {
                    error_message = Some(format!("{}: {}", step.as_str(), e));
                    break;
                }
            }
        }

        let record = RollbackRecord {
            rollback_id: uuid::Uuid::new_v4().to_string(),
            migration_id: migration_id.to_string(),
            started_at,
            completed_at: Utc::now(),
            success: error_message.is_none(),
            steps_completed,
            error_message,
        };
        self.store.insert_rollback_record(&record)?;
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);

        if record.success {
            tracing::info!(migration_id, rollback_id = %record.rollback_id, "Migration rolled back");
        } else {
            tracing::error!(
                migration_id,
                rollback_id = %record.rollback_id,
                error = record.error_message.as_deref().unwrap_or_default(),
                "Migration rollback failed"
            );
        }

        Ok(record)
    }

    fn rollback_step(&self, plan: &MigrationPlan, step: RollbackStep) -> Result<()> {
        let backup = &plan.rollback_plan;
        match step {
            RollbackStep::RestoreSourceChunks => {
                for id in &backup.backup_source_chunks {
                    self.restore_source(id)?;
                }
            }
            RollbackStep::RemoveTargetChunks => {
                for id in &backup.backup_target_chunks {
                    self.remove_target(id)?;
                }
            }
            RollbackStep::VerifySourceIntegrity => {
                for id in &backup.backup_source_chunks {
                    match self.store.get_chunk_reference(id)? {
                        Some(chunk) if chunk.status == ChunkStatus::Active => {}
                        Some(chunk) => {
                            return Err(Error::MigrationExecution {
                                migration_id: plan.migration_id.clone(),
                                message: format!("source chunk {} is {}", id, chunk.status),
                            })
                        }
                        None => {
                            return Err(Error::MigrationExecution {
                                migration_id: plan.migration_id.clone(),
                                message: format!("source chunk {} is missing", id),
                            })
                        }
                    }
                }
            }
            RollbackStep::UpdateReferences => {
                let mut restored = 0usize;
                for id in &backup.backup_source_chunks {
                    if let Some(chunk) = self.store.get_chunk_reference(id)? {
                        if self.aliases.restore_path(&chunk.file_path, &plan.migration_id)? {
                            restored += 1;
                        }
                    }
                }
                tracing::debug!(
                    migration_id = %plan.migration_id,
                    restored,
                    "Aliases pointed back at source paths"
                );
            }
        }
        Ok(())
    }

    fn restore_source(&self, chunk_id: &str) -> Result<()> {
        let Some(chunk) = self.store.get_chunk_reference(chunk_id)? else {
            return Ok(());
        };
        match chunk.status {
            ChunkStatus::Active => {}
            ChunkStatus::Archived => {
                self.store.reactivate_archived_chunk(chunk_id)?;
            }
            _ => {
                self.store.set_chunk_status(chunk_id, ChunkStatus::Active)?;
            }
        }
        Ok(())
    }

    fn remove_target(&self, chunk_id: &str) -> Result<()> {
        let Some(chunk) = self.store.get_chunk_reference(chunk_id)? else {
            return Ok(());
        };
        if chunk.status == ChunkStatus::Active {
            self.store.set_chunk_status(chunk_id, ChunkStatus::Migrating)?;
        }
        self.store.set_chunk_status(chunk_id, ChunkStatus::Deleted)?;
        Ok(())
    }

    /// Take one plan off the queue and run it.
    fn consume_one(&self) -> Result<()> {
        let next = self.queue.lock().unwrap().recv_timeout(QUEUE_POLL);
        let migration_id = match next {
            Ok(id) => id,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Ok(())
            }
        };
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let Some(mut plan) = self.store.get_migration_plan(&migration_id)? else {
            tracing::warn!(migration_id = %migration_id, "Queued migration no longer exists");
            return Ok(());
        };

        match self.execute(&mut plan) {
            Ok(_) => Ok(()),
            Err(Error::MigrationExecution { .. }) => {
                if self.settings.auto_rollback_on_failure {
                    if let Err(e) = self.rollback(&migration_id) {
                        tracing::error!(
                            migration_id = %migration_id,
                            error = %e,
                            "Automatic rollback could not run"
                        );
                    }
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// The `index`th group of `size` ids, or an empty slice past the end.
fn window(ids: &[String], index: usize, size: usize) -> &[String] {
    let start = (index * size).min(ids.len());
    let end = (start + size).min(ids.len());
    &ids[start..end]
}

/// Plans, queues, executes and rolls back chunk migrations.
pub struct MigrationManager {
    engine: MigrationEngine,
    sender: Mutex<Sender<String>>,
    worker: Mutex<Option<Worker>>,
}

impl MigrationManager {
    pub fn new(
        store: Arc<ResilienceStore>,
        aliases: Arc<VersionAliasManager>,
        mover: Arc<dyn ChunkMover>,
        settings: MigrationSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            engine: MigrationEngine {
                store,
                aliases,
                mover,
                settings,
                stats: Arc::new(MigrationStats::default()),
                queue: Arc::new(Mutex::new(receiver)),
                queued: Arc::new(AtomicUsize::new(0)),
            },
            sender: Mutex::new(sender),
            worker: Mutex::new(None),
        }
    }

    /// Build, persist and enqueue a `pending` plan.
    ///
    /// The rollback plan is part of the persisted record, so it exists
    /// before any execution can start.
    pub fn create_migration_plan(
        &self,
        strategy: MigrationStrategy,
        source_chunks: Vec<String>,
        target_chunks: Vec<String>,
        risk_level: RiskLevel,
        metadata: Option<Metadata>,
    ) -> Result<MigrationPlan> {
        let estimated_duration = estimate_duration(strategy, source_chunks.len());

        let plan = MigrationPlan {
            migration_id: uuid::Uuid::new_v4().to_string(),
            strategy,
            rollback_plan: RollbackPlan {
                backup_source_chunks: source_chunks.clone(),
                backup_target_chunks: target_chunks.clone(),
                steps: RollbackStep::PROCEDURE.to_vec(),
                estimated_rollback_duration: estimated_duration * ROLLBACK_DURATION_FACTOR,
            },
            source_chunks,
            target_chunks,
            estimated_duration,
            risk_level,
            created_at: Utc::now(),
            status: MigrationStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            metadata: metadata.unwrap_or_default(),
        };

        self.engine.store.upsert_migration_plan(&plan)?;
        self.enqueue(&plan.migration_id);

        tracing::info!(
            migration_id = %plan.migration_id,
            strategy = %plan.strategy,
            risk = %plan.risk_level,
            estimated_duration = plan.estimated_duration,
            "Migration planned"
        );

        Ok(plan)
    }

    /// Queue every persisted `pending` plan, oldest first.
    ///
    /// For a fresh process picking up plans created by an earlier one.
    /// Plans already queued in this process would run once; duplicates
    /// are skipped at execution because they are no longer pending.
    pub fn requeue_pending(&self) -> Result<usize> {
        let pending = self
            .engine
            .store
            .list_migration_plans(Some(MigrationStatus::Pending))?;
        for plan in &pending {
            self.enqueue(&plan.migration_id);
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Pending migrations requeued");
        }
        Ok(pending.len())
    }

    fn enqueue(&self, migration_id: &str) {
        self.engine.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .sender
            .lock()
            .unwrap()
            .send(migration_id.to_string())
            .is_err()
        {
            self.engine.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(migration_id, "Migration queue closed");
        }
    }

    /// Run a pending plan now, on the calling thread.
    ///
    /// Returns `Ok(true)` when the plan completed and `Ok(false)` when the
    /// stored plan was not pending, for instance because the background
    /// consumer already claimed it; `plan` is then refreshed from the store. A failing run marks the plan failed and returns
    /// [`Error::MigrationExecution`].
    pub fn execute_migration(&self, plan: &mut MigrationPlan) -> Result<bool> {
        self.engine.execute(plan)
    }

    /// Undo a migration using its stored rollback plan.
    pub fn rollback_migration(&self, migration_id: &str) -> Result<RollbackRecord> {
        self.engine.rollback(migration_id)
    }

    pub fn get_plan(&self, migration_id: &str) -> Result<Option<MigrationPlan>> {
        self.engine.store.get_migration_plan(migration_id)
    }

    pub fn list_plans(&self, status: Option<MigrationStatus>) -> Result<Vec<MigrationPlan>> {
        self.engine.store.list_migration_plans(status)
    }

    pub fn rollback_history(&self, migration_id: &str) -> Result<Vec<RollbackRecord>> {
        self.engine.store.list_rollback_records(migration_id)
    }

    /// Plans queued but not yet picked up by the consumer.
    pub fn queue_len(&self) -> usize {
        self.engine.queued.load(Ordering::SeqCst)
    }

    /// Start the background consumer. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().map(Worker::is_running).unwrap_or(false) {
            return Ok(());
        }

        let engine = self.engine.clone();
        *worker = Some(Worker::spawn(
            "migration-consumer",
            Duration::ZERO,
            self.engine.settings.backoff,
            move |_| engine.consume_one(),
        )?);
        Ok(())
    }

    /// Stop the consumer, waiting a bounded time for it to exit.
    ///
    /// Plans still queued stay queued and persisted as `pending`.
    pub fn stop(&self) {
        if let Some(mut worker) = self.worker.lock().unwrap().take() {
            worker.stop(self.engine.settings.join_timeout);
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

    pub fn status(&self) -> MigrationManagerStatus {
        let stats = &self.engine.stats;
        MigrationManagerStatus {
            active: self.is_running(),
            queued: self.queue_len(),
            executed: stats.executed.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            rollbacks: stats.rollbacks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MigrationManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkReference;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{:02}", prefix, i)).collect()
    }

    fn setup(settings: MigrationSettings) -> (Arc<ResilienceStore>, MigrationManager) {
        crate::logging::init_test();
        let store = Arc::new(ResilienceStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        let aliases = Arc::new(VersionAliasManager::new(Arc::clone(&store), 10, 365));
        let mover = Arc::new(StoreChunkMover::new(Arc::clone(&store)));
        let mgr = MigrationManager::new(Arc::clone(&store), aliases, mover, settings);
        (store, mgr)
    }

    fn track(store: &ResilienceStore, ids: &[String]) {
        for id in ids {
            let chunk = ChunkReference::new(id.clone(), format!("/docs/{}.md", id), "h", "c", 64);
            store.upsert_chunk_reference(&chunk).unwrap();
        }
    }

    fn status_of(store: &ResilienceStore, id: &str) -> ChunkStatus {
        store.get_chunk_reference(id).unwrap().unwrap().status
    }

    /// Records the group shapes it is asked to move.
    #[derive(Default)]
    struct RecordingMover {
        groups: Mutex<Vec<(usize, usize)>>,
    }

    impl ChunkMover for RecordingMover {
        fn move_group(&self, _: &str, sources: &[String], targets: &[String]) -> Result<()> {
            self.groups.lock().unwrap().push((sources.len(), targets.len()));
            Ok(())
        }
    }

    /// Counts calls and takes a while on each group.
    #[derive(Default)]
    struct SlowMover {
        calls: AtomicUsize,
    }

    impl ChunkMover for SlowMover {
        fn move_group(&self, _: &str, _: &[String], _: &[String]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    fn wait_for_completed(mgr: &MigrationManager, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while mgr.status().completed < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_estimate_duration() {
        assert_eq!(estimate_duration(MigrationStrategy::Gradual, 20), 4.0);
        assert_eq!(estimate_duration(MigrationStrategy::Immediate, 10), 1.0);
        assert_eq!(estimate_duration(MigrationStrategy::Batch, 0), 0.0);
        assert!((estimate_duration(MigrationStrategy::Intelligent, 4) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_persisted_with_rollback_before_execution() {
        let (store, mgr) = setup(MigrationSettings::default());
        let plan = mgr
            .create_migration_plan(
                MigrationStrategy::Gradual,
                ids("s", 20),
                ids("t", 20),
                RiskLevel::Medium,
                None,
            )
            .unwrap();

        assert_eq!(plan.estimated_duration, 4.0);
        assert_eq!(plan.rollback_plan.estimated_rollback_duration, 2.0);

        let stored = store.get_migration_plan(&plan.migration_id).unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Pending);
        assert_eq!(stored.rollback_plan.backup_source_chunks, ids("s", 20));
        assert_eq!(stored.rollback_plan.steps, RollbackStep::PROCEDURE.to_vec());
        assert_eq!(mgr.queue_len(), 1);
    }

    #[test]
    fn test_group_sizes_by_strategy() {
        assert_eq!(group_size(MigrationStrategy::Immediate, RiskLevel::High, 50, 120), 120);
        assert_eq!(group_size(MigrationStrategy::Batch, RiskLevel::Low, 50, 120), 50);
        assert_eq!(group_size(MigrationStrategy::Gradual, RiskLevel::Low, 50, 120), 1);
        assert_eq!(group_size(MigrationStrategy::Intelligent, RiskLevel::Low, 50, 120), 50);
        assert_eq!(group_size(MigrationStrategy::Intelligent, RiskLevel::Medium, 50, 120), 25);
        assert_eq!(group_size(MigrationStrategy::Intelligent, RiskLevel::High, 50, 120), 1);
        assert_eq!(group_size(MigrationStrategy::Immediate, RiskLevel::Low, 50, 0), 1);
    }

    #[test]
    fn test_batch_groups_through_mover() {
        let store = Arc::new(ResilienceStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        let aliases = Arc::new(VersionAliasManager::new(Arc::clone(&store), 10, 365));
        let mover = Arc::new(RecordingMover::default());
        let settings = MigrationSettings {
            batch_size: 4,
            ..Default::default()
        };
        let mgr = MigrationManager::new(Arc::clone(&store), aliases, mover.clone(), settings);

        let mut plan = mgr
            .create_migration_plan(
                MigrationStrategy::Batch,
                ids("s", 10),
                ids("t", 3),
                RiskLevel::Low,
                None,
            )
            .unwrap();
        assert!(mgr.execute_migration(&mut plan).unwrap());
        assert_eq!(*mover.groups.lock().unwrap(), vec![(4, 3), (4, 0), (2, 0)]);
    }

    #[test]
    fn test_execute_moves_chunk_statuses() {
        let (store, mgr) = setup(MigrationSettings::default());
        let sources = ids("s", 3);
        let targets = ids("t", 3);
        track(&store, &sources);
        track(&store, &targets);
        for t in &targets {
            store.set_chunk_status(t, ChunkStatus::Orphaned).unwrap();
        }

        let mut plan = mgr
            .create_migration_plan(
                MigrationStrategy::Immediate,
                sources.clone(),
                targets.clone(),
                RiskLevel::Low,
                None,
            )
            .unwrap();
        assert!(mgr.execute_migration(&mut plan).unwrap());

        assert_eq!(plan.status, MigrationStatus::Completed);
        assert!(plan.started_at.is_some() && plan.completed_at.is_some());
        assert_eq!(status_of(&store, "s00"), ChunkStatus::Archived);
        assert_eq!(status_of(&store, "t02"), ChunkStatus::Active);

        // A completed plan does not run twice
        assert!(!mgr.execute_migration(&mut plan).unwrap());
    }

    #[test]
    fn test_failed_execution_marks_plan_failed() {
        let (store, mgr) = setup(MigrationSettings::default());
        track(&store, &ids("s", 2));
        store.set_chunk_status("s01", ChunkStatus::Orphaned).unwrap();
        store.set_chunk_status("s01", ChunkStatus::Deleted).unwrap();

        let mut plan = mgr
            .create_migration_plan(
                MigrationStrategy::Immediate,
                ids("s", 2),
                vec![],
                RiskLevel::High,
                None,
            )
            .unwrap();
        let err = mgr.execute_migration(&mut plan).unwrap_err();
        assert!(matches!(err, Error::MigrationExecution { .. }));

        let stored = store.get_migration_plan(&plan.migration_id).unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Failed);
        assert!(stored
            .metadata
            .get(MetadataKey::LastError)
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("s01"));
        assert!(stored.error_message.unwrap().contains("s01"));
        assert_eq!(mgr.status().failed, 1);
    }

    #[test]
    fn test_stale_plan_copy_does_not_rerun_completed_plan() {
        let (store, mgr) = setup(MigrationSettings::default());
        track(&store, &ids("s", 2));

        let mut plan = mgr
            .create_migration_plan(
                MigrationStrategy::Immediate,
                ids("s", 2),
                vec![],
                RiskLevel::Low,
                None,
            )
            .unwrap();

        mgr.start().unwrap();
        wait_for_completed(&mgr, 1);
        mgr.stop();

        // Our copy still says pending, but the consumer already ran it
        assert_eq!(plan.status, MigrationStatus::Pending);
        assert!(!mgr.execute_migration(&mut plan).unwrap());
        assert_eq!(plan.status, MigrationStatus::Completed);

        let stored = store.get_migration_plan(&plan.migration_id).unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Completed);
        assert_eq!(status_of(&store, "s00"), ChunkStatus::Archived);

        let status = mgr.status();
        assert_eq!(status.executed, 1);
        assert_eq!(status.failed, 0);
    }

    #[test]
    fn test_sync_execute_and_consumer_run_plan_once() {
        let store = Arc::new(ResilienceStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        let aliases = Arc::new(VersionAliasManager::new(Arc::clone(&store), 10, 365));
        let mover = Arc::new(SlowMover::default());
        let mgr = MigrationManager::new(
            Arc::clone(&store),
            aliases,
            mover.clone(),
            MigrationSettings::default(),
        );

        mgr.start().unwrap();
        let mut plan = mgr
            .create_migration_plan(
                MigrationStrategy::Immediate,
                ids("s", 1),
                vec![],
                RiskLevel::Low,
                None,
            )
            .unwrap();
        // Races the consumer for the same plan; either may win
        mgr.execute_migration(&mut plan).unwrap();
        wait_for_completed(&mgr, 1);
        mgr.stop();

        assert_eq!(mover.calls.load(Ordering::SeqCst), 1);
        let status = mgr.status();
        assert_eq!(status.executed, 1);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(
            store
                .get_migration_plan(&plan.migration_id)
                .unwrap()
                .unwrap()
                .status,
            MigrationStatus::Completed
        );
    }

    #[test]
    fn test_timeout_fails_gradual_run() {
        let (store, mgr) = setup(MigrationSettings {
            step_delay: Duration::from_millis(30),
            timeout: Duration::from_millis(50),
            ..Default::default()
        });
        track(&store, &ids("s", 10));

        let mut plan = mgr
            .create_migration_plan(
                MigrationStrategy::Gradual,
                ids("s", 10),
                vec![],
                RiskLevel::Low,
                None,
            )
            .unwrap();
        let err = mgr.execute_migration(&mut plan).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(plan.status, MigrationStatus::Failed);
    }

    #[test]
    fn test_rollback_restores_sources_and_aliases() {
        let (store, mgr) = setup(MigrationSettings::default());
        let sources = ids("s", 2);
        let targets = ids("t", 2);
        track(&store, &sources);
        track(&store, &targets);
        mgr.engine
            .aliases
            .create_alias("/docs/s00.md", "/docs/new/s00.md", None)
            .unwrap();

        let mut plan = mgr
            .create_migration_plan(
                MigrationStrategy::Batch,
                sources,
                targets,
                RiskLevel::Low,
                None,
            )
            .unwrap();
        mgr.execute_migration(&mut plan).unwrap();

        let record = mgr.rollback_migration(&plan.migration_id).unwrap();
        assert!(record.success, "{:?}", record.error_message);
        assert_eq!(record.steps_completed, RollbackStep::PROCEDURE.to_vec());
        assert_eq!(status_of(&store, "s00"), ChunkStatus::Active);
        assert_eq!(status_of(&store, "t01"), ChunkStatus::Deleted);
        assert_eq!(
            mgr.engine
                .aliases
                .resolve_alias("/docs/new/s00.md")
                .unwrap()
                .as_deref(),
            Some("/docs/s00.md")
        );

        // Plan status is left alone; the attempt is audited
        let stored = mgr.get_plan(&plan.migration_id).unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Completed);
        assert_eq!(mgr.rollback_history(&plan.migration_id).unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_verification_failure_is_recorded() {
        let (_, mgr) = setup(MigrationSettings::default());
        let plan = mgr
            .create_migration_plan(
                MigrationStrategy::Immediate,
                vec!["ghost".to_string()],
                vec![],
                RiskLevel::Low,
                None,
            )
            .unwrap();

        let record = mgr.rollback_migration(&plan.migration_id).unwrap();
        assert!(!record.success);
        assert_eq!(
            record.steps_completed,
            vec![
                RollbackStep::RestoreSourceChunks,
                RollbackStep::RemoveTargetChunks
            ]
        );
        assert!(record.error_message.unwrap().contains("ghost"));

        let err = mgr.rollback_migration("nope").unwrap_err();
        assert!(matches!(err, Error::PlanNotFound(_)));
    }

    #[test]
    fn test_consumer_executes_in_fifo_order() {
        let (store, mgr) = setup(MigrationSettings::default());
        let mut created = Vec::new();
        for i in 0..3 {
            let sources = ids(&format!("p{}-", i), 2);
            track(&store, &sources);
            let plan = mgr
                .create_migration_plan(
                    MigrationStrategy::Immediate,
                    sources,
                    vec![],
                    RiskLevel::Low,
                    None,
                )
                .unwrap();
            created.push(plan.migration_id);
        }

        mgr.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while mgr.status().completed < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        mgr.stop();

        let mut started: Vec<(chrono::DateTime<Utc>, String)> = created
            .iter()
            .map(|id| {
                let plan = store.get_migration_plan(id).unwrap().unwrap();
                assert_eq!(plan.status, MigrationStatus::Completed);
                (plan.started_at.unwrap(), plan.migration_id)
            })
            .collect();
        started.sort();
        let order: Vec<String> = started.into_iter().map(|(_, id)| id).collect();
        assert_eq!(order, created);
        assert_eq!(mgr.queue_len(), 0);
    }

    #[test]
    fn test_requeue_pending_from_earlier_process() {
        let (store, first) = setup(MigrationSettings::default());
        track(&store, &ids("s", 1));
        let plan = first
            .create_migration_plan(
                MigrationStrategy::Immediate,
                ids("s", 1),
                vec![],
                RiskLevel::Low,
                None,
            )
            .unwrap();
        drop(first);

        let aliases = Arc::new(VersionAliasManager::new(Arc::clone(&store), 10, 365));
        let mover = Arc::new(StoreChunkMover::new(Arc::clone(&store)));
        let second = MigrationManager::new(
            Arc::clone(&store),
            aliases,
            mover,
            MigrationSettings::default(),
        );
        assert_eq!(second.queue_len(), 0);
        assert_eq!(second.requeue_pending().unwrap(), 1);

        second.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while second.status().completed < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        second.stop();
        assert_eq!(
            second.get_plan(&plan.migration_id).unwrap().unwrap().status,
            MigrationStatus::Completed
        );
    }

    #[test]
    fn test_consumer_auto_rollback_on_failure() {
        let (store, mgr) = setup(MigrationSettings {
            auto_rollback_on_failure: true,
            ..Default::default()
        });
        track(&store, &ids("s", 2));
        store.set_chunk_status("s01", ChunkStatus::Orphaned).unwrap();
        store.set_chunk_status("s01", ChunkStatus::Deleted).unwrap();

        let plan = mgr
            .create_migration_plan(
                MigrationStrategy::Immediate,
                ids("s", 2),
                vec![],
                RiskLevel::Low,
                None,
            )
            .unwrap();

        mgr.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while mgr.status().rollbacks < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        mgr.stop();

        let stored = store.get_migration_plan(&plan.migration_id).unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Failed);
        assert_eq!(status_of(&store, "s00"), ChunkStatus::Active);
        assert_eq!(mgr.rollback_history(&plan.migration_id).unwrap().len(), 1);
    }
}
