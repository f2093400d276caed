//! Scanner registry: open cursors keyed by their wire ids.
//!
//! Ids are random 64-bit values; a collision with a live scanner is
//! refused rather than overwritten. The map has its own lock; cursor IO
//! happens outside it through the per-scanner mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::leases::LeaseListener;
use crate::region::RegionScanner;

type ScannerMap = Arc<Mutex<HashMap<u64, Arc<Mutex<RegionScanner>>>>>;

#[derive(Default, Clone)]
pub struct ScannerRegistry {
    scanners: ScannerMap,
}

impl ScannerRegistry {
    /// Register a cursor under `id`. False when the id is already live.
    pub fn insert(&self, id: u64, scanner: RegionScanner) -> bool {
        let mut map = self.scanners.lock().expect("scanner map");
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, Arc::new(Mutex::new(scanner)));
        true
    }

    pub fn get(&self, id: u64) -> Option<Arc<Mutex<RegionScanner>>> {
        self.scanners.lock().expect("scanner map").get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Mutex<RegionScanner>>> {
        self.scanners.lock().expect("scanner map").remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.scanners.lock().expect("scanner map").contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.scanners.lock().expect("scanner map").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lease listener that tears the scanner down on expiry.
    pub fn expiry_listener(&self, id: u64) -> Arc<dyn LeaseListener> {
        Arc::new(ScannerExpiry {
            scanners: self.scanners.clone(),
            id,
        })
    }
}

struct ScannerExpiry {
    scanners: ScannerMap,
    id: u64,
}

impl LeaseListener for ScannerExpiry {
    fn lease_expired(&self) {
        let removed = self.scanners.lock().expect("scanner map").remove(&self.id);
        if let Some(scanner) = removed {
            tracing::info!(scanner = self.id, "scanner lease expired");
            scanner.lock().expect("scanner").close();
        }
    }
}
