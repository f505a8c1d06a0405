//! Version aliases: keep old artifact paths resolvable after renames.
//!
//! An alias maps every path an artifact has had to where it lives now.
//! Renames are reported by an external notifier (file watcher, document
//! pipeline) through [`VersionAliasManager::create_alias`]; nothing here
//! discovers renames by itself.
//!
//! The manager keeps a small `path -> alias_id` cache. The store stays the
//! source of truth: every cache hit is re-read from the store and every
//! write goes through to it.

use crate::db::ResilienceStore;
use crate::error::Result;
use crate::types::{Metadata, MetadataKey, VersionAlias};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct VersionAliasManager {
    store: Arc<ResilienceStore>,
    max_version_history: usize,
    alias_expiration_days: u32,
    cache: Mutex<HashMap<String, String>>,
}

impl VersionAliasManager {
    pub fn new(
        store: Arc<ResilienceStore>,
        max_version_history: usize,
        alias_expiration_days: u32,
    ) -> Self {
        Self {
            store,
            max_version_history: max_version_history.max(1),
            alias_expiration_days,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `original_path` now lives at `new_path`.
    ///
    /// An alias already resolving `original_path` is updated in place;
    /// otherwise a new alias is created. Repeating the same rename
    /// converges on the same record.
    pub fn create_alias(
        &self,
        original_path: &str,
        new_path: &str,
        metadata: Option<Metadata>,
    ) -> Result<VersionAlias> {
        let now = Utc::now();

        let alias = match self.lookup(original_path)? {
            Some(mut alias) => {
                if alias.version_history.last().map(String::as_str) != Some(original_path)
                    && original_path != new_path
                {
                    alias.version_history.push(original_path.to_string());
                }
                alias.current_path = new_path.to_string();
                alias.last_accessed = now;
                alias.access_count += 1;
                if let Some(meta) = &metadata {
                    alias.metadata.merge(meta);
                }
                trim_history(&mut alias.version_history, self.max_version_history);
                alias
            }
            None => VersionAlias {
                alias_id: uuid::Uuid::new_v4().to_string(),
                original_path: original_path.to_string(),
                current_path: new_path.to_string(),
                version_history: vec![original_path.to_string()],
                created_at: now,
                last_accessed: now,
                access_count: 1,
                metadata: metadata.unwrap_or_default(),
            },
        };

        self.store.upsert_alias(&alias)?;
        self.remember(&alias);

        tracing::debug!(
            alias_id = %alias.alias_id,
            from = original_path,
            to = new_path,
            history_len = alias.version_history.len(),
            "Alias updated"
        );

        Ok(alias)
    }

    /// Current location for `path`, if any alias knows it.
    ///
    /// A hit counts as an access for expiry purposes.
    pub fn resolve_alias(&self, path: &str) -> Result<Option<String>> {
        let Some(mut alias) = self.lookup(path)? else {
            return Ok(None);
        };

        alias.last_accessed = Utc::now();
        alias.access_count += 1;
        self.store.upsert_alias(&alias)?;

        Ok(Some(alias.current_path))
    }

    /// Prior paths of the artifact `path` belongs to, oldest first.
    pub fn get_alias_history(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .lookup(path)?
            .map(|alias| alias.version_history)
            .unwrap_or_default())
    }

    /// Delete aliases untouched for `alias_expiration_days`.
    pub fn cleanup_expired_aliases(&self) -> Result<usize> {
        let removed = self
            .store
            .delete_expired_aliases(self.alias_expiration_days)?;
        self.cache.lock().unwrap().clear();

        if removed > 0 {
            tracing::info!(
                removed,
                expiration_days = self.alias_expiration_days,
                "Expired aliases removed"
            );
        }
        Ok(removed)
    }

    /// Point the alias that knows `path` back at `path`.
    ///
    /// Used when a migration is rolled back. Returns `false` when no alias
    /// knows the path or it is already current.
    pub fn restore_path(&self, path: &str, migration_id: &str) -> Result<bool> {
        let Some(alias) = self.lookup(path)? else {
            return Ok(false);
        };
        if alias.current_path == path {
            return Ok(false);
        }

        let meta = Metadata::new()
            .with(MetadataKey::MigrationId, migration_id)
            .with(MetadataKey::RolledBackAt, Utc::now().to_rfc3339());
        self.create_alias(&alias.current_path, path, Some(meta))?;
        Ok(true)
    }

    fn lookup(&self, path: &str) -> Result<Option<VersionAlias>> {
        let cached = self.cache.lock().unwrap().get(path).cloned();
        if let Some(alias_id) = cached {
            match self.store.get_alias(&alias_id)? {
                Some(alias) if alias.matches_path(path) => return Ok(Some(alias)),
                _ => {
                    self.cache.lock().unwrap().remove(path);
                }
            }
        }

        let found = self.store.find_alias_by_path(path)?;
        if let Some(alias) = &found {
            self.remember(alias);
        }
        Ok(found)
    }

    fn remember(&self, alias: &VersionAlias) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(alias.current_path.clone(), alias.alias_id.clone());
        cache.insert(alias.original_path.clone(), alias.alias_id.clone());
        for path in &alias.version_history {
            cache.insert(path.clone(), alias.alias_id.clone());
        }
    }
}

/// Drop the oldest entries until `history` fits in `max`.
fn trim_history(history: &mut Vec<String>, max: usize) {
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
}
