use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::config::DEFAULT_CACHE_TTL;

use super::{CacheEntry, Clock, DiskTier, PersistentTier, SystemClock};

/// Process-wide cache shared by every subscriber.
///
/// Reads check the in-memory tier, then the persistent tier (hydrating memory
/// on a hit). Writes are stamped and swapped into memory under the memory
/// lock, then persisted under a separate write lock, so the tiers agree on
/// which write came last and readers never wait on disk writes.
pub struct CacheStore {
    memory: Mutex<HashMap<String, Arc<CacheEntry>>>,
    persistent: Option<Box<dyn PersistentTier>>,
    /// Serializes persistent writes in stamp order.
    writes: Mutex<()>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(persistent: Option<Box<dyn PersistentTier>>) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            persistent,
            writes: Mutex::new(()),
            clock: Arc::new(SystemClock),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Store with no persistent tier.
    pub fn memory_only() -> Self {
        Self::new(None)
    }

    /// Store persisting to `DiskTier` files in `dir`.
    pub fn with_disk(dir: PathBuf) -> Result<Self> {
        Ok(Self::new(Some(Box::new(DiskTier::new(dir)?))))
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.is_fresh(self.now(), self.ttl)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        // Entries are replaced whole, so a poisoned map is still consistent.
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `key`, hydrating the process tier from the persistent tier.
    ///
    /// An unreadable persistent entry is logged and treated as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let mut memory = self.lock();
        if let Some(entry) = memory.get(key) {
            return Some(Arc::clone(entry));
        }

        let persistent = self.persistent.as_ref()?;
        match persistent.load(key) {
            Ok(Some(entry)) => {
                debug!(key, "Hydrated cache entry from persistent tier");
                let entry = Arc::new(entry);
                memory.insert(key.to_string(), Arc::clone(&entry));
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read persistent cache entry");
                None
            }
        }
    }

    /// Write a fresh entry for `key` and return it.
    ///
    /// Timestamps strictly increase per key: a write that lands on or before
    /// the previous timestamp is stamped 1ms after it. Persistent-tier
    /// failures are logged and otherwise ignored.
    pub fn set(&self, key: &str, data: serde_json::Value) -> Arc<CacheEntry> {
        // Taken before the memory lock and held across the save.
        let _writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());

        let entry = {
            let mut memory = self.lock();
            let mut timestamp = self.now().trunc_subsecs(3);
            if let Some(previous) = memory.get(key) {
                if previous.timestamp >= timestamp {
                    timestamp = previous.timestamp + TimeDelta::milliseconds(1);
                }
            }
            let entry = Arc::new(CacheEntry::new(key, data, timestamp));
            memory.insert(key.to_string(), Arc::clone(&entry));
            entry
        };

        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.save(&entry) {
                warn!(key, error = %e, "Failed to persist cache entry");
            }
        }
        entry
    }

    /// Remove one key, or every key when `key` is `None`, from both tiers.
    pub fn clear(&self, key: Option<&str>) {
        let _writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        // Held through removal so a concurrent miss cannot rehydrate a cleared file.
        let mut memory = self.lock();
        match key {
            Some(key) => {
                memory.remove(key);
                if let Some(persistent) = &self.persistent {
                    if let Err(e) = persistent.remove(key) {
                        warn!(key, error = %e, "Failed to remove persistent cache entry");
                    }
                }
            }
            None => {
                memory.clear();
                if let Some(persistent) = &self.persistent {
                    if let Err(e) = persistent.clear() {
                        warn!(error = %e, "Failed to clear persistent cache");
                    }
                }
            }
        }
    }

    /// Number of entries in the process tier.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
