//! Core domain types for chunkwarden
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Chunk** | A unit of content identified by a hash, independently referenced |
//! | **Orphan** | A chunk with zero live references |
//! | **Alias** | A mapping from an artifact's former location(s) to its current location |
//! | **Cleanup priority** | A [0,1] score from size, age and access signals used to rank orphans |
//! | **Migration plan** | A reorganization of chunks from a source set to a target set, with rollback |
//! | **Strategy** | The pacing/grouping policy used to execute a migration plan |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ============================================
// Metadata
// ============================================

/// Metadata keys the subsystem itself reads or writes.
///
/// Any other string key is accepted as a free-form annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    /// Who or what produced the record (e.g. "fs-watcher")
    Source,
    /// Human-readable reason for a rename or migration
    Reason,
    /// Migration that last touched the record
    MigrationId,
    /// Caller that requested a migration
    RequestedBy,
    /// When a rollback last restored the record
    RolledBackAt,
    /// Last error recorded against the record
    LastError,
    /// Entities whose references to a chunk were dropped
    PreviousOwners,
}

impl MetadataKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKey::Source => "source",
            MetadataKey::Reason => "reason",
            MetadataKey::MigrationId => "migration_id",
            MetadataKey::RequestedBy => "requested_by",
            MetadataKey::RolledBackAt => "rolled_back_at",
            MetadataKey::LastError => "last_error",
            MetadataKey::PreviousOwners => "previous_owners",
        }
    }
}

/// Ordered key-value annotations stored as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, serde_json::Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a recognized key.
    pub fn set(&mut self, key: MetadataKey, value: impl Into<serde_json::Value>) {
        self.0.insert(key.as_str().to_string(), value.into());
    }

    /// Builder form of [`Metadata::set`].
    pub fn with(mut self, key: MetadataKey, value: impl Into<serde_json::Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a free-form key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: MetadataKey) -> Option<&serde_json::Value> {
        self.0.get(key.as_str())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Copy every entry of `other` into `self`, overwriting on conflict.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Serialize for a JSON column.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a JSON column, falling back to empty metadata.
    pub fn from_json(s: &str) -> Self {
        serde_json::from_str(s).unwrap_or_default()
    }
}

// ============================================
// Version Aliases
// ============================================

/// A renamed or migrated artifact.
///
/// `version_history` holds prior paths, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionAlias {
    /// Unique identifier
    pub alias_id: String,
    /// Path the artifact had when the alias was created
    pub original_path: String,
    /// Where the artifact lives now
    pub current_path: String,
    /// Prior paths, bounded by `max_version_history`
    pub version_history: Vec<String>,
    /// When the alias was created
    pub created_at: DateTime<Utc>,
    /// Last create/resolve touching this alias
    pub last_accessed: DateTime<Utc>,
    /// Number of touches
    pub access_count: u64,
    /// Extensible metadata
    pub metadata: Metadata,
}

impl VersionAlias {
    /// Whether `path` is the original, current or a historical path.
    pub fn matches_path(&self, path: &str) -> bool {
        self.original_path == path
            || self.current_path == path
            || self.version_history.iter().any(|p| p == path)
    }
}

// ============================================
// Chunks
// ============================================

/// Lifecycle of a chunk.
///
/// ```text
/// Active ──► Orphaned ──► Migrating ──► Active
///   │           │   └──► Archived (terminal)
///   │           └──────► Deleted  (terminal)
///   └──► Migrating
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Active,
    Orphaned,
    Migrating,
    Archived,
    Deleted,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Active => "active",
            ChunkStatus::Orphaned => "orphaned",
            ChunkStatus::Migrating => "migrating",
            ChunkStatus::Archived => "archived",
            ChunkStatus::Deleted => "deleted",
        }
    }

    /// Archived and deleted chunks never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Archived | ChunkStatus::Deleted)
    }

    /// Whether a chunk in this status may move to `next`.
    ///
    /// Re-entering the current status is always allowed (no-op).
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Active => matches!(next, Orphaned | Migrating),
            Orphaned => matches!(next, Active | Migrating | Archived | Deleted),
            Migrating => matches!(next, Active | Archived | Deleted),
            Archived | Deleted => false,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ChunkStatus::Active),
            "orphaned" => Ok(ChunkStatus::Orphaned),
            "migrating" => Ok(ChunkStatus::Migrating),
            "archived" => Ok(ChunkStatus::Archived),
            "deleted" => Ok(ChunkStatus::Deleted),
            _ => Err(format!("unknown chunk status: {}", s)),
        }
    }
}

/// A content chunk and the entities pointing at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReference {
    pub chunk_id: String,
    pub file_path: String,
    pub chunk_hash: String,
    pub content_hash: String,
    /// Entity ids currently referencing the chunk
    pub referenced_by: Vec<String>,
    pub last_referenced: DateTime<Utc>,
    /// Always `referenced_by.len()`
    pub reference_count: u64,
    pub size_bytes: u64,
    pub access_count: u64,
    pub status: ChunkStatus,
    pub metadata: Metadata,
}

impl ChunkReference {
    /// Build an active chunk reference with no referencing entities yet.
    pub fn new(
        chunk_id: impl Into<String>,
        file_path: impl Into<String>,
        chunk_hash: impl Into<String>,
        content_hash: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            file_path: file_path.into(),
            chunk_hash: chunk_hash.into(),
            content_hash: content_hash.into(),
            referenced_by: Vec::new(),
            last_referenced: Utc::now(),
            reference_count: 0,
            size_bytes,
            access_count: 0,
            status: ChunkStatus::Active,
            metadata: Metadata::new(),
        }
    }

    /// Replace the referencing entities, keeping `reference_count` derived.
    ///
    /// Entities no longer in the list are remembered as previous owners.
    pub fn set_references(&mut self, entities: Vec<String>) {
        let dropped: Vec<String> = self
            .referenced_by
            .iter()
            .filter(|e| !entities.contains(e))
            .cloned()
            .collect();
        self.referenced_by = entities;
        self.reference_count = self.referenced_by.len() as u64;
        self.last_referenced = Utc::now();
        self.remember_owners(dropped);
    }

    /// Add a referencing entity if not already present.
    pub fn add_reference(&mut self, entity_id: impl Into<String>) {
        let entity_id = entity_id.into();
        if !self.referenced_by.contains(&entity_id) {
            self.referenced_by.push(entity_id);
        }
        self.reference_count = self.referenced_by.len() as u64;
        self.last_referenced = Utc::now();
        self.remember_owners(Vec::new());
    }

    /// Remove a referencing entity.
    pub fn remove_reference(&mut self, entity_id: &str) {
        let before = self.referenced_by.len();
        self.referenced_by.retain(|e| e != entity_id);
        self.reference_count = self.referenced_by.len() as u64;
        if self.referenced_by.len() < before {
            self.remember_owners(vec![entity_id.to_string()]);
        }
    }

    /// Entities that referenced this chunk before dropping it, oldest first.
    pub fn previous_owners(&self) -> Vec<String> {
        self.metadata
            .get(MetadataKey::PreviousOwners)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    // Current owners are never listed as previous ones.
    fn remember_owners(&mut self, dropped: Vec<String>) {
        let had_key = self.metadata.get(MetadataKey::PreviousOwners).is_some();
        if dropped.is_empty() && !had_key {
            return;
        }

        let mut owners = self.previous_owners();
        for id in dropped {
            if !owners.contains(&id) {
                owners.push(id);
            }
        }
        owners.retain(|o| !self.referenced_by.contains(o));
        self.metadata.set(MetadataKey::PreviousOwners, owners);
    }
}

/// SHA-256 hex digest of raw chunk content.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A chunk identified as unreferenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanChunk {
    pub chunk_id: String,
    pub file_path: String,
    pub chunk_hash: String,
    pub content_hash: String,
    /// First detection time; kept across re-detections
    pub orphaned_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    pub size_bytes: u64,
    /// Entities that referenced the chunk before it was orphaned
    pub potential_owners: Vec<String>,
    /// 0.0..=1.0, higher means reclaim sooner
    pub cleanup_priority: f64,
    pub metadata: Metadata,
}

/// Aggregate view of the orphan set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrphanSummary {
    pub total_orphans: u64,
    pub total_bytes: u64,
    pub average_priority: f64,
    /// Orphans with priority above 0.7
    pub high_priority: u64,
    pub oldest_orphaned_at: Option<DateTime<Utc>>,
}

// ============================================
// Migrations
// ============================================

/// Pacing/grouping policy for a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    Immediate,
    Gradual,
    Batch,
    Intelligent,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::Immediate => "immediate",
            MigrationStrategy::Gradual => "gradual",
            MigrationStrategy::Batch => "batch",
            MigrationStrategy::Intelligent => "intelligent",
        }
    }

    /// Factor applied to the base duration estimate.
    pub fn duration_multiplier(&self) -> f64 {
        match self {
            MigrationStrategy::Immediate => 1.0,
            MigrationStrategy::Gradual => 2.0,
            MigrationStrategy::Batch => 1.5,
            MigrationStrategy::Intelligent => 2.5,
        }
    }
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MigrationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(MigrationStrategy::Immediate),
            "gradual" => Ok(MigrationStrategy::Gradual),
            "batch" => Ok(MigrationStrategy::Batch),
            "intelligent" => Ok(MigrationStrategy::Intelligent),
            _ => Err(format!("unknown migration strategy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(format!("unknown risk level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Executing => "executing",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "executing" => Ok(MigrationStatus::Executing),
            "completed" => Ok(MigrationStatus::Completed),
            "failed" => Ok(MigrationStatus::Failed),
            _ => Err(format!("unknown migration status: {}", s)),
        }
    }
}

/// One step of the fixed rollback procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStep {
    RestoreSourceChunks,
    RemoveTargetChunks,
    VerifySourceIntegrity,
    UpdateReferences,
}

impl RollbackStep {
    /// The procedure every rollback plan carries, in execution order.
    pub const PROCEDURE: [RollbackStep; 4] = [
        RollbackStep::RestoreSourceChunks,
        RollbackStep::RemoveTargetChunks,
        RollbackStep::VerifySourceIntegrity,
        RollbackStep::UpdateReferences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStep::RestoreSourceChunks => "restore_source_chunks",
            RollbackStep::RemoveTargetChunks => "remove_target_chunks",
            RollbackStep::VerifySourceIntegrity => "verify_source_integrity",
            RollbackStep::UpdateReferences => "update_references",
        }
    }
}

/// How to undo a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    /// Snapshot of the plan's source chunk ids
    pub backup_source_chunks: Vec<String>,
    /// Snapshot of the plan's target chunk ids
    pub backup_target_chunks: Vec<String>,
    pub steps: Vec<RollbackStep>,
    pub estimated_rollback_duration: f64,
}

/// A declared reorganization of chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub migration_id: String,
    pub strategy: MigrationStrategy,
    pub source_chunks: Vec<String>,
    pub target_chunks: Vec<String>,
    /// Time units; see `migration::estimate_duration`
    pub estimated_duration: f64,
    pub risk_level: RiskLevel,
    pub rollback_plan: RollbackPlan,
    pub created_at: DateTime<Utc>,
    pub status: MigrationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: Metadata,
}

/// Audit entry for one rollback attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub rollback_id: String,
    pub migration_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub steps_completed: Vec<RollbackStep>,
    pub error_message: Option<String>,
}
