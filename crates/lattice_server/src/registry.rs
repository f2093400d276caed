//! Region registry: the authoritative record of which regions this server
//! hosts.
//!
//! Two maps under one read-write lock. `online` regions serve requests;
//! `retiring` regions have begun closing (split cutover) but stay findable
//! for scanners that were already running. Every region is in at most one
//! of the two maps. The lock is never held across region IO.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::region::Region;
use crate::wal::Wal;

#[derive(Default)]
struct Maps {
    online: BTreeMap<String, Arc<Region>>,
    retiring: HashMap<String, Arc<Region>>,
}

#[derive(Default)]
pub struct RegionRegistry {
    inner: RwLock<Maps>,
}

impl RegionRegistry {
    /// Install a freshly opened region and advance the WAL sequence floor
    /// past anything the region has already seen, atomically with respect
    /// to other registry mutations.
    pub fn install_online(&self, region: Arc<Region>, wal: &Wal) {
        let mut maps = self.inner.write().expect("registry lock");
        wal.advance_seq(region.min_sequence_id() + 1);
        maps.online.insert(region.name().to_string(), region);
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("registry lock")
            .online
            .contains_key(name)
    }

    /// Remove a region from `online`; the caller closes it outside the lock.
    pub fn remove_online(&self, name: &str) -> Option<Arc<Region>> {
        self.inner
            .write()
            .expect("registry lock")
            .online
            .remove(name)
    }

    /// Move a region from `online` to `retiring` (split cutover start).
    pub fn retire(&self, name: &str) {
        let mut maps = self.inner.write().expect("registry lock");
        if let Some(region) = maps.online.remove(name) {
            tracing::debug!(region = name, "region retiring");
            maps.retiring.insert(name.to_string(), region);
        }
    }

    /// Drop a region from `retiring` (split cutover end).
    pub fn drop_retired(&self, name: &str) {
        self.inner
            .write()
            .expect("registry lock")
            .retiring
            .remove(name);
    }

    /// Look up a serving region; consults `retiring` only when asked.
    pub fn get(&self, name: &str, check_retiring: bool) -> Option<Arc<Region>> {
        let maps = self.inner.read().expect("registry lock");
        maps.online
            .get(name)
            .or_else(|| {
                if check_retiring {
                    maps.retiring.get(name)
                } else {
                    None
                }
            })
            .cloned()
    }

    /// Drain every online region and close each outside the lock, passing
    /// `abort` through so regions skip their final flush on abort.
    pub fn close_all(&self, abort: bool) -> Vec<Arc<Region>> {
        let drained: Vec<Arc<Region>> = {
            let mut maps = self.inner.write().expect("registry lock");
            let drained = maps.online.values().cloned().collect();
            maps.online.clear();
            drained
        };
        for region in &drained {
            if let Err(err) = region.close(abort) {
                tracing::error!(region = region.name(), error = ?err, "error closing region");
            }
        }
        drained
    }

    /// Close user regions only, retaining catalog (root/meta) regions.
    /// Returns the closed regions and the count still online.
    pub fn close_user_regions(&self) -> (Vec<Arc<Region>>, usize) {
        let (drained, remaining) = {
            let mut maps = self.inner.write().expect("registry lock");
            let drained: Vec<Arc<Region>> = maps
                .online
                .values()
                .filter(|r| !r.descriptor().is_meta_table())
                .cloned()
                .collect();
            for region in &drained {
                maps.online.remove(region.name());
            }
            (drained, maps.online.len())
        };
        for region in &drained {
            if let Err(err) = region.close(false) {
                tracing::error!(region = region.name(), error = ?err, "error closing region");
            }
        }
        (drained, remaining)
    }

    /// Online regions that are not already closed; the working set for
    /// periodic flush checks and memory accounting.
    pub fn regions_to_check(&self) -> Vec<Arc<Region>> {
        self.inner
            .read()
            .expect("registry lock")
            .online
            .values()
            .filter(|r| !r.is_closed())
            .cloned()
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.inner.read().expect("registry lock").online.len()
    }

    /// Sum of live memtable bytes across serving regions.
    pub fn global_memtable_bytes(&self) -> u64 {
        self.regions_to_check()
            .iter()
            .map(|r| r.memtable_bytes())
            .sum()
    }
}
