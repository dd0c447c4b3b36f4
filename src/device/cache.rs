//! In-process online-status cache
//!
//! The map itself sits behind a coarse read-write lock that is only taken
//! for writing on structural changes (insert, remove, sweep). Each entry keeps
//! its own mutex around the activity timestamps, so heartbeats for a known
//! device only need the read lock. Nothing here is durable.
//!
//! Entries also remember when their activity was last written to the store,
//! which lets heartbeats arriving in quick succession skip the store write.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Activity {
    last_active_at: DateTime<Utc>,
    persisted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheEntry {
    user_id: i64,
    activity: Mutex<Activity>,
}

impl CacheEntry {
    fn new(user_id: i64, at: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            activity: Mutex::new(Activity {
                last_active_at: at,
                persisted_at: at,
            }),
        })
    }
}

#[derive(Debug, Default)]
struct Entries {
    live: HashMap<String, Arc<CacheEntry>>,
    /// Devices deleted from the store, with the time of removal.
    removed: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct OnlineCache {
    entries: RwLock<Entries>,
}

impl OnlineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity that has just been written to the store.
    ///
    /// Returns false for a device that was removed; a heartbeat that raced
    /// the removal must not bring it back.
    pub fn mark_online(&self, device_id: &str, user_id: i64, at: DateTime<Utc>) -> bool {
        let existing = self.entries.read().live.get(device_id).cloned();
        let entry = match existing {
            Some(entry) if entry.user_id == user_id => entry,
            _ => {
                let mut entries = self.entries.write();
                if entries.removed.contains_key(device_id) {
                    debug!(device_id = %device_id, "ignoring activity for removed device");
                    return false;
                }
                let entry = entries
                    .live
                    .entry(device_id.to_string())
                    .or_insert_with(|| CacheEntry::new(user_id, at));
                if entry.user_id != user_id {
                    *entry = CacheEntry::new(user_id, at);
                }
                entry.clone()
            }
        };

        let mut activity = entry.activity.lock();
        if at > activity.last_active_at {
            activity.last_active_at = at;
        }
        if at > activity.persisted_at {
            activity.persisted_at = at;
        }
        true
    }

    /// Absorbs a heartbeat without a store write when the store was written
    /// less than `write_interval` ago. Returns false when the caller has to
    /// write through.
    pub fn touch(&self, device_id: &str, user_id: i64, at: DateTime<Utc>, write_interval: Duration) -> bool {
        let entry = self.entries.read().live.get(device_id).cloned();
        let Some(entry) = entry.filter(|e| e.user_id == user_id) else {
            return false;
        };

        let mut activity = entry.activity.lock();
        if at - activity.persisted_at >= write_interval {
            return false;
        }
        if at > activity.last_active_at {
            activity.last_active_at = at;
        }
        true
    }

    /// Drops the entry after a logout. The device may come back online.
    pub fn mark_offline(&self, device_id: &str) -> bool {
        self.entries.write().live.remove(device_id).is_some()
    }

    /// Drops the entry of a deleted device and refuses later activity for it.
    pub fn forget(&self, device_id: &str, at: DateTime<Utc>) {
        let mut entries = self.entries.write();
        entries.live.remove(device_id);
        entries.removed.insert(device_id.to_string(), at);
    }

    pub fn last_active_at(&self, device_id: &str) -> Option<DateTime<Utc>> {
        let entry = self.entries.read().live.get(device_id).cloned();
        entry.map(|e| e.activity.lock().last_active_at)
    }

    /// Drops entries and removal markers idle for at least `timeout`.
    /// Returns how many live entries were removed.
    pub fn sweep(&self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.live.len();
        entries.live.retain(|device_id, entry| {
            let fresh = now - entry.activity.lock().last_active_at < timeout;
            if !fresh {
                debug!(device_id = %device_id, "dropping idle device from online cache");
            }
            fresh
        });
        entries.removed.retain(|_, removed_at| now - *removed_at < timeout);
        before - entries.live.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().live.is_empty()
    }
}
