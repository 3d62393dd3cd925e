//! Resource cache
//!
//! Caches augmented, pre-filter resource collections keyed by account,
//! region, resource kind and query.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Identity of one cached collection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheKey {
    pub account: String,
    pub region: String,
    pub resource: String,
    pub query: Option<Value>,
}

impl CacheKey {
    /// Canonical storage form (object keys sorted)
    pub fn storage_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{}/{}/{}", self.account, self.region, self.resource)
        })
    }
}

/// Cache boundary used by resource managers
pub trait Cache: Send + Sync {
    /// Whether caching is enabled for this run
    fn load(&self) -> bool;

    fn get(&self, key: &CacheKey) -> Option<Vec<Value>>;

    fn save(&self, key: &CacheKey, resources: &[Value]) -> Result<()>;
}

/// Caching disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

impl Cache for NullCache {
    fn load(&self) -> bool {
        false
    }

    fn get(&self, _key: &CacheKey) -> Option<Vec<Value>> {
        None
    }

    fn save(&self, _key: &CacheKey, _resources: &[Value]) -> Result<()> {
        Ok(())
    }
}

/// Run-scoped in-memory cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn load(&self) -> bool {
        true
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<Value>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key.storage_key())
            .cloned()
    }

    fn save(&self, key: &CacheKey, resources: &[Value]) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.storage_key(), resources.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    saved_at: DateTime<Utc>,
    resources: Vec<Value>,
}

/// Persistent cache backed by a JSON file
///
/// Entries older than `period_minutes` read as misses. A period of zero
/// disables the cache entirely; periods too long to represent never expire.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    period_minutes: u64,
    period: TimeDelta,
    entries: RwLock<Option<HashMap<String, FileEntry>>>,
}

impl FileCache {
    pub fn new(path: PathBuf, period_minutes: u64) -> Self {
        let period = i64::try_from(period_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or_else(|| {
                tracing::debug!("cache period of {} minutes clamped", period_minutes);
                TimeDelta::MAX
            });
        Self {
            path,
            period_minutes,
            period,
            entries: RwLock::new(None),
        }
    }

    /// Default location under the user cache directory
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .map(|p| p.join("custodia").join("cache.json"))
            .unwrap_or_else(|| PathBuf::from("custodia-cache.json"))
    }

    fn read_file(&self) -> HashMap<String, FileEntry> {
        if !self.path.exists() {
            return HashMap::new();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable cache file {:?}: {}", self.path, e);
                HashMap::new()
            }),
            Err(e) => {
                tracing::warn!("failed to read cache file {:?}: {}", self.path, e);
                HashMap::new()
            }
        }
    }

    fn is_fresh(&self, entry: &FileEntry) -> bool {
        Utc::now().signed_duration_since(entry.saved_at) < self.period
    }

    fn write_file(&self, entries: &HashMap<String, FileEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(entries)?)?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Cache(format!("failed to replace {:?}: {}", self.path, e)))
    }
}

impl Cache for FileCache {
    fn load(&self) -> bool {
        if self.period_minutes == 0 {
            return false;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.is_none() {
            let loaded = self.read_file();
            tracing::debug!("loaded {} cache entries from {:?}", loaded.len(), self.path);
            *entries = Some(loaded);
        }
        true
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<Value>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.as_ref()?.get(&key.storage_key())?;
        if self.is_fresh(entry) {
            Some(entry.resources.clone())
        } else {
            None
        }
    }

    fn save(&self, key: &CacheKey, resources: &[Value]) -> Result<()> {
        if self.period_minutes == 0 {
            return Ok(());
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let map = entries.get_or_insert_with(HashMap::new);
        map.insert(
            key.storage_key(),
            FileEntry {
                saved_at: Utc::now(),
                resources: resources.to_vec(),
            },
        );
        map.retain(|_, entry| self.is_fresh(entry));
        self.write_file(map)
    }
}
