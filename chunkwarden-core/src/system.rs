//! The resilience orchestrator
//!
//! [`ResilienceSystem`] wires the store, alias manager, orphan detector,
//! migration manager and cleanup manager together from one
//! [`ResilienceConfig`], and owns their background workers.

use crate::alias::VersionAliasManager;
use crate::cleanup::{
    ChunkReclaimer, CleanupManager, CleanupPolicy, CleanupStats, CleanupStatus, StoreReclaimer,
};
use crate::config::ResilienceConfig;
use crate::db::ResilienceStore;
use crate::error::Result;
use crate::migration::{
    ChunkMover, MigrationManager, MigrationManagerStatus, MigrationSettings, StoreChunkMover,
};
use crate::orphan::{ChunkUniverse, DetectorStatus, OrphanDetector};
use crate::types::OrphanSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub orphan_detector: DetectorStatus,
    pub migration_manager: MigrationManagerStatus,
    pub cleanup_manager: CleanupStatus,
}

/// Point-in-time view of the whole subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStatus {
    pub running: bool,
    pub uptime_seconds: u64,
    /// `false` when the orphan summary could not be read
    pub store_available: bool,
    pub orphan_summary: OrphanSummary,
    pub components: ComponentStatus,
}

/// Result of [`ResilienceSystem::run_resilience_check`].
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceCheckReport {
    pub orphans_detected: usize,
    pub cleanup_stats: CleanupStats,
    pub expired_aliases_cleaned: usize,
    pub status: ResilienceStatus,
    /// One entry per step that failed
    pub errors: Vec<String>,
}

impl ResilienceCheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ResilienceSystem {
    config: ResilienceConfig,
    store: Arc<ResilienceStore>,
    aliases: Arc<VersionAliasManager>,
    detector: OrphanDetector,
    migrations: MigrationManager,
    cleanup: CleanupManager,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl ResilienceSystem {
    /// Build every component from `config`.
    ///
    /// Fails with a configuration error before anything is constructed if
    /// `config` is invalid.
    pub fn new(
        config: ResilienceConfig,
        store: Arc<ResilienceStore>,
        universe: Arc<dyn ChunkUniverse>,
    ) -> Result<Self> {
        config.validate()?;

        let aliases = Arc::new(VersionAliasManager::new(
            Arc::clone(&store),
            config.max_version_history,
            config.alias_expiration_days,
        ));
        let detector = OrphanDetector::new(
            Arc::clone(&store),
            universe,
            config.detection_interval(),
            config.worker_backoff(),
            config.worker_join_timeout(),
        );
        let migrations = Self::build_migrations(&config, &store, &aliases, None);
        let cleanup = Self::build_cleanup(&config, &store, None);

        Ok(Self {
            config,
            store,
            aliases,
            detector,
            migrations,
            cleanup,
            started_at: Mutex::new(None),
        })
    }

    /// Replace the default store-only reclaimer.
    ///
    /// Call before [`start`](Self::start).
    pub fn with_reclaimer(mut self, reclaimer: Arc<dyn ChunkReclaimer>) -> Self {
        self.cleanup.stop();
        self.cleanup = Self::build_cleanup(&self.config, &self.store, Some(reclaimer));
        self
    }

    /// Replace the default store-only chunk mover.
    ///
    /// Call before [`start`](Self::start); plans already queued are dropped
    /// from the in-memory queue but stay persisted as `pending`.
    pub fn with_chunk_mover(mut self, mover: Arc<dyn ChunkMover>) -> Self {
        self.migrations.stop();
        self.migrations =
            Self::build_migrations(&self.config, &self.store, &self.aliases, Some(mover));
        self
    }

    fn build_migrations(
        config: &ResilienceConfig,
        store: &Arc<ResilienceStore>,
        aliases: &Arc<VersionAliasManager>,
        mover: Option<Arc<dyn ChunkMover>>,
    ) -> MigrationManager {
        let mover = mover.unwrap_or_else(|| Arc::new(StoreChunkMover::new(Arc::clone(store))));
        MigrationManager::new(
            Arc::clone(store),
            Arc::clone(aliases),
            mover,
            MigrationSettings::from_config(config),
        )
    }

    fn build_cleanup(
        config: &ResilienceConfig,
        store: &Arc<ResilienceStore>,
        reclaimer: Option<Arc<dyn ChunkReclaimer>>,
    ) -> CleanupManager {
        let reclaimer =
            reclaimer.unwrap_or_else(|| Arc::new(StoreReclaimer::new(Arc::clone(store))));
        CleanupManager::new(
            Arc::clone(store),
            reclaimer,
            CleanupPolicy {
                priority_threshold: config.orphan_priority_threshold,
                aggressive: config.enable_aggressive_cleanup,
            },
            config.max_cleanup_operations,
            config.cleanup_interval(),
            config.worker_backoff(),
            config.worker_join_timeout(),
        )
    }

    /// Start all background workers. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut started_at = self.started_at.lock().unwrap();
        if started_at.is_some() {
            return Ok(());
        }

        self.detector.start_detection()?;
        if let Err(e) = self.migrations.start().and_then(|_| self.cleanup.start()) {
            self.detector.stop_detection();
            self.migrations.stop();
            return Err(e);
        }

        *started_at = Some(Utc::now());
        tracing::info!(
            detection_interval_secs = self.config.orphan_detection_interval_seconds,
            cleanup_interval_secs = self.config.cleanup_interval_seconds,
            "Resilience system started"
        );
        Ok(())
    }

    /// Stop all background workers. Calling it again is a no-op.
    pub fn stop(&self) {
        let mut started_at = self.started_at.lock().unwrap();
        if started_at.take().is_none() {
            return;
        }

        self.detector.stop_detection();
        self.migrations.stop();
        self.cleanup.stop();
        tracing::info!("Resilience system stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started_at.lock().unwrap().is_some()
    }

    /// Snapshot of the system. Never fails; an unreadable store is reported
    /// through `store_available`.
    pub fn get_status(&self) -> ResilienceStatus {
        let started_at = *self.started_at.lock().unwrap();
        let uptime_seconds = started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);

        let (orphan_summary, store_available) = match self.store.orphan_summary() {
            Ok(summary) => (summary, true),
            Err(e) => {
                tracing::warn!(error = %e, "Orphan summary unavailable");
                (OrphanSummary::default(), false)
            }
        };

        ResilienceStatus {
            running: started_at.is_some(),
            uptime_seconds,
            store_available,
            orphan_summary,
            components: ComponentStatus {
                orphan_detector: self.detector.status(),
                migration_manager: self.migrations.status(),
                cleanup_manager: self.cleanup.status(),
            },
        }
    }

    /// Run detection, a bounded cleanup and alias expiry once, in order.
    ///
    /// A failing step is recorded in the report and the remaining steps
    /// still run.
    pub fn run_resilience_check(&self) -> ResilienceCheckReport {
        let mut errors = Vec::new();

        let orphans_detected = match self.detector.detect_orphans() {
            Ok(orphans) => orphans.len(),
            Err(e) => {
                errors.push(format!("orphan detection: {}", e));
                0
            }
        };

        let limit = self
            .config
            .check_cleanup_limit
            .min(self.config.max_cleanup_operations);
        let cleanup_stats = match self.cleanup.cleanup_orphans(limit) {
            Ok(stats) => stats,
            Err(e) => {
                errors.push(format!("orphan cleanup: {}", e));
                CleanupStats::default()
            }
        };

        let expired_aliases_cleaned = match self.aliases.cleanup_expired_aliases() {
            Ok(n) => n,
            Err(e) => {
                errors.push(format!("alias expiry: {}", e));
                0
            }
        };

        for error in &errors {
            tracing::warn!(error = %error, "Resilience check step failed");
        }
        tracing::info!(
            orphans_detected,
            cleaned = cleanup_stats.cleaned,
            expired_aliases_cleaned,
            failed_steps = errors.len(),
            "Resilience check complete"
        );

        ResilienceCheckReport {
            orphans_detected,
            cleanup_stats,
            expired_aliases_cleaned,
            status: self.get_status(),
            errors,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ResilienceStore> {
        &self.store
    }

    pub fn alias_manager(&self) -> &VersionAliasManager {
        &self.aliases
    }

    pub fn orphan_detector(&self) -> &OrphanDetector {
        &self.detector
    }

    pub fn migration_manager(&self) -> &MigrationManager {
        &self.migrations
    }

    pub fn cleanup_manager(&self) -> &CleanupManager {
        &self.cleanup
    }
}

impl Drop for ResilienceSystem {
    fn drop(&mut self) {
        self.stop();
    }
}
