/*!
 * Metadata cache
 *
 * TTL-bounded maps of remote path to attributes and to directory listings.
 * Entries are evicted lazily on lookup and swept from the timer. Listings
 * and stats expire independently; callers that need both coherent must
 * populate one from the other within the same TTL window.
 */

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::RwLock;

use crate::client::{join_path, ObjStat};

struct StatEntry {
    stat: ObjStat,
    stamp: Instant,
}

struct DirEntryList {
    names: Vec<String>,
    stamp: Instant,
}

pub struct MetadataCache {
    ttl: Duration,
    stats: RwLock<HashMap<String, StatEntry>>,
    dirs: RwLock<HashMap<String, DirEntryList>>,
}

impl MetadataCache {
    pub fn new(ttl_sec: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_sec),
            stats: RwLock::new(HashMap::new()),
            dirs: RwLock::new(HashMap::new()),
        }
    }

    fn fresh(&self, stamp: Instant) -> bool {
        stamp.elapsed() <= self.ttl
    }

    pub fn put_stat(&self, path: &str, stat: &ObjStat) {
        self.stats.write().insert(
            path.to_string(),
            StatEntry {
                stat: stat.clone(),
                stamp: Instant::now(),
            },
        );
    }

    /// Insert attributes for a named child of a collection.
    pub fn put_stat_child(&self, dir_path: &str, name: &str, stat: &ObjStat) {
        self.put_stat(&join_path(dir_path, name), stat);
    }

    /// Fresh attributes, or a miss. Stale entries are evicted on the way.
    pub fn get_stat(&self, path: &str) -> Option<ObjStat> {
        {
            let stats = self.stats.read();
            match stats.get(path) {
                Some(entry) if self.fresh(entry.stamp) => return Some(entry.stat.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.stats.write().remove(path);
        None
    }

    /// Replace the listing of a collection.
    pub fn put_dir(&self, path: &str, names: Vec<String>) {
        self.dirs.write().insert(
            path.to_string(),
            DirEntryList {
                names,
                stamp: Instant::now(),
            },
        );
    }

    /// Create or update a listing with one name.
    pub fn add_dir_entry(&self, path: &str, name: &str) {
        let mut dirs = self.dirs.write();
        let entry = dirs.entry(path.to_string()).or_insert_with(|| DirEntryList {
            names: Vec::new(),
            stamp: Instant::now(),
        });
        if !entry.names.iter().any(|n| n == name) {
            entry.names.push(name.to_string());
        }
    }

    /// Update a listing with one name, but only if a fresh listing already
    /// exists; a stale or absent listing is left alone rather than
    /// resurrected half-filled.
    pub fn add_dir_entry_if_fresh(&self, path: &str, name: &str) {
        let mut dirs = self.dirs.write();
        if let Some(entry) = dirs.get_mut(path) {
            if self.fresh(entry.stamp) {
                if !entry.names.iter().any(|n| n == name) {
                    entry.names.push(name.to_string());
                }
            }
        }
    }

    /// Fresh listing of a collection, or a miss.
    pub fn get_dir(&self, path: &str) -> Option<Vec<String>> {
        {
            let dirs = self.dirs.read();
            match dirs.get(path) {
                Some(entry) if self.fresh(entry.stamp) => return Some(entry.names.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.dirs.write().remove(path);
        None
    }

    pub fn remove_stat(&self, path: &str) {
        self.stats.write().remove(path);
    }

    pub fn remove_dir(&self, path: &str) {
        self.dirs.write().remove(path);
    }

    /// Drop one name from a cached listing.
    pub fn remove_dir_entry(&self, path: &str, name: &str) {
        let mut dirs = self.dirs.write();
        if let Some(entry) = dirs.get_mut(path) {
            entry.names.retain(|n| n != name);
        }
    }

    pub fn clear(&self) {
        self.stats.write().clear();
        self.dirs.write().clear();
    }

    /// Drop expired stat entries; `force` drops everything. Returns the
    /// number of entries removed.
    pub fn clear_expired_stat(&self, force: bool) -> usize {
        let mut stats = self.stats.write();
        let before = stats.len();
        if force {
            stats.clear();
        } else {
            stats.retain(|_, entry| self.fresh(entry.stamp));
        }
        before - stats.len()
    }

    /// Drop expired listings; `force` drops everything.
    pub fn clear_expired_dir(&self, force: bool) -> usize {
        let mut dirs = self.dirs.write();
        let before = dirs.len();
        if force {
            dirs.clear();
        } else {
            dirs.retain(|_, entry| self.fresh(entry.stamp));
        }
        before - dirs.len()
    }

    /// Timer handler: sweep expired entries.
    pub fn tick(&self) {
        let stats = self.clear_expired_stat(false);
        let dirs = self.clear_expired_dir(false);
        if stats > 0 || dirs > 0 {
            debug!("metadata cache sweep: {} stats, {} listings expired", stats, dirs);
        }
    }
}
