//! Path → file identity cache.
//!
//! The root table only stores name hashes, so the paths of files added by
//! earlier builds, and the numeric ids they were given, are remembered
//! here. Reusing a recorded id is what keeps a file's id stable across
//! independent rebuilds.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::key::HashKey;

/// Reserved path under which the current root file is remembered.
pub const ROOT_RECORD:     &str = "__ROOT__";
/// Reserved path under which the current encoding file is remembered.
pub const ENCODING_RECORD: &str = "__ENCODING__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub path:         String,
    /// 0 for records that are not root entries.
    pub file_data_id: u32,
    pub name_hash:    u64,
    pub content_key:  HashKey,
    pub encoded_key:  HashKey,
}

impl IdentityRecord {
    /// Record for a system file that has no root entry.
    pub fn system(path: &str, content_key: HashKey, encoded_key: HashKey) -> Self {
        Self { path: path.to_string(), file_data_id: 0, name_hash: 0, content_key, encoded_key }
    }
}

pub trait IdentityCache: Send {
    fn lookup(&self, path: &str) -> Option<u32>;
    fn get(&self, path: &str) -> Option<&IdentityRecord>;
    /// Replace the record of the same path. A record claiming an id that
    /// another path owns evicts that path.
    fn record_or_update(&mut self, record: IdentityRecord);
    fn has_id(&self, id: u32) -> bool;
    /// Paths whose files disappeared from the source tree and should be
    /// removed on the next save.
    fn purge_list(&self) -> BTreeSet<String>;
    fn mark_for_purge(&mut self, path: &str);
    fn remove(&mut self, path: &str);
    fn max_id(&self) -> u32;
    fn save(&mut self) -> Result<()>;
}

// ── In-memory cache ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityCache {
    records: BTreeMap<String, IdentityRecord>,
    by_id:   BTreeMap<u32, String>,
    purge:   BTreeSet<String>,
}

impl MemoryIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records.values()
    }
}

impl IdentityCache for MemoryIdentityCache {
    fn lookup(&self, path: &str) -> Option<u32> {
        self.records.get(path).map(|r| r.file_data_id).filter(|id| *id > 0)
    }

    fn get(&self, path: &str) -> Option<&IdentityRecord> {
        self.records.get(path)
    }

    fn record_or_update(&mut self, record: IdentityRecord) {
        if let Some(old) = self.records.get(&record.path) {
            if *old == record {
                return;
            }
            if old.file_data_id > 0 {
                self.by_id.remove(&old.file_data_id);
            }
        }

        if record.file_data_id > 0 {
            if let Some(owner) = self.by_id.get(&record.file_data_id).cloned() {
                if owner != record.path {
                    debug!(id = record.file_data_id, "id moves from {owner} to {}", record.path);
                    self.records.remove(&owner);
                }
            }
            self.by_id.insert(record.file_data_id, record.path.clone());
        }
        self.purge.remove(&record.path);
        self.records.insert(record.path.clone(), record);
    }

    fn has_id(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    fn purge_list(&self) -> BTreeSet<String> {
        self.purge.clone()
    }

    fn mark_for_purge(&mut self, path: &str) {
        self.purge.insert(path.to_string());
    }

    fn remove(&mut self, path: &str) {
        if let Some(old) = self.records.remove(path) {
            if old.file_data_id > 0 {
                self.by_id.remove(&old.file_data_id);
            }
        }
        self.purge.remove(path);
    }

    fn max_id(&self) -> u32 {
        self.by_id.keys().next_back().copied().unwrap_or(0)
    }

    fn save(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── JSON file cache ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version:  String,
    saved_at: i64,
    records:  Vec<IdentityRecord>,
    #[serde(default)]
    purge:    Vec<String>,
}

/// [`MemoryIdentityCache`] persisted as one JSON document.
#[derive(Debug)]
pub struct JsonIdentityCache {
    path:    PathBuf,
    /// Build version the cache was written for.
    version: String,
    inner:   MemoryIdentityCache,
}

impl JsonIdentityCache {
    /// Load `path` if it exists, otherwise start empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut cache = Self { path, version: String::new(), inner: MemoryIdentityCache::new() };
        if cache.path.is_file() {
            let snapshot: Snapshot = serde_json::from_slice(&fs::read(&cache.path)?)?;
            cache.version = snapshot.version;
            for record in snapshot.records {
                cache.inner.record_or_update(record);
            }
            for path in snapshot.purge {
                cache.inner.mark_for_purge(&path);
            }
            info!(records = cache.inner.len(), "loaded identity cache {}", cache.path.display());
        }
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.inner.records()
    }
}

impl IdentityCache for JsonIdentityCache {
    fn lookup(&self, path: &str) -> Option<u32>              { self.inner.lookup(path) }
    fn get(&self, path: &str) -> Option<&IdentityRecord>     { self.inner.get(path) }
    fn record_or_update(&mut self, record: IdentityRecord)   { self.inner.record_or_update(record) }
    fn has_id(&self, id: u32) -> bool                        { self.inner.has_id(id) }
    fn purge_list(&self) -> BTreeSet<String>                 { self.inner.purge_list() }
    fn mark_for_purge(&mut self, path: &str)                 { self.inner.mark_for_purge(path) }
    fn remove(&mut self, path: &str)                         { self.inner.remove(path) }
    fn max_id(&self) -> u32                                  { self.inner.max_id() }

    fn save(&mut self) -> Result<()> {
        let snapshot = Snapshot {
            version:  self.version.clone(),
            saved_at: Utc::now().timestamp(),
            records:  self.inner.records().cloned().collect(),
            purge:    self.inner.purge_list().into_iter().collect(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&snapshot)?)?;
        debug!(records = snapshot.records.len(), "saved identity cache");
        Ok(())
    }
}
