//! # chunkwarden-core
//!
//! Core library for chunkwarden - the resilience layer for a
//! content-addressed chunk store.
//!
//! This library provides:
//! - Version aliases that keep renamed artifacts resolvable
//! - Orphan chunk detection with a cleanup priority score
//! - Migration plans with strategy-paced execution and rollback
//! - Priority-ordered, bounded reclamation of orphaned chunks
//! - A SQLite resilience store, configuration and logging
//!
//! ## Architecture
//!
//! Every component shares one [`ResilienceStore`]. The
//! [`ResilienceSystem`] builds the components from a [`ResilienceConfig`]
//! and runs three background workers:
//! - **Detector:** scans the [`ChunkUniverse`] for unreferenced chunks
//! - **Migration consumer:** executes queued plans in FIFO order
//! - **Cleanup:** reclaims the highest-priority eligible orphans
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunkwarden_core::{Config, ResilienceStore, ResilienceSystem, StoreChunkUniverse};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let store = Arc::new(ResilienceStore::open(&config.store_path()).expect("failed to open store"));
//! store.migrate().expect("failed to run migrations");
//!
//! let universe = Arc::new(StoreChunkUniverse::new(Arc::clone(&store)));
//! let system = ResilienceSystem::new(config.resilience, store, universe).expect("invalid config");
//! let report = system.run_resilience_check();
//! println!("{} orphans detected", report.orphans_detected);
//! ```

// Re-export commonly used items at the crate root
pub use alias::VersionAliasManager;
pub use cleanup::{ChunkReclaimer, CleanupManager, CleanupStats, StoreReclaimer};
pub use config::{Config, ResilienceConfig};
pub use db::ResilienceStore;
pub use error::{Error, Result};
pub use migration::{ChunkMover, MigrationManager, StoreChunkMover};
pub use orphan::{ChunkObservation, ChunkUniverse, OrphanDetector, StoreChunkUniverse};
pub use system::{ResilienceCheckReport, ResilienceStatus, ResilienceSystem};
pub use types::*;

// Public modules
pub mod alias;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod migration;
pub mod orphan;
pub mod system;
pub mod types;
pub mod worker;
