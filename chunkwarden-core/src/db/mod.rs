//! Storage layer for chunkwarden
//!
//! This module provides the resilience store using SQLite with:
//! - Schema migrations
//! - Repository methods for aliases, chunks, orphans and migration plans
//! - A rollback audit trail

pub mod repo;
pub mod schema;

pub use repo::ResilienceStore;
