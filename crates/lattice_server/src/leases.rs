//! Named leases with expiry callbacks.
//!
//! A lease is a timer keyed by a 64-bit id. The checker task sweeps for
//! expired leases and fires each listener exactly once, outside the table
//! lock. Scanner liveness is guarded this way; the master guards this
//! server's session lease the same way on its side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Fired when a lease passes its expiry without renewal.
pub trait LeaseListener: Send + Sync + 'static {
    fn lease_expired(&self);
}

struct LeaseEntry {
    expires: Instant,
    listener: Arc<dyn LeaseListener>,
}

pub struct Leases {
    table: Mutex<HashMap<u64, LeaseEntry>>,
    period: Duration,
    closed: AtomicBool,
}

impl Leases {
    pub fn new(period: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            period,
            closed: AtomicBool::new(false),
        }
    }

    /// Register a lease. Refused while an unexpired lease with the same id
    /// exists.
    pub fn create(&self, id: u64, listener: Arc<dyn LeaseListener>) -> anyhow::Result<()> {
        let mut table = self.table.lock().expect("lease table");
        anyhow::ensure!(!table.contains_key(&id), "lease {id} still held");
        table.insert(
            id,
            LeaseEntry {
                expires: Instant::now() + self.period,
                listener,
            },
        );
        Ok(())
    }

    /// Push the expiry out by one full period. False if the lease is gone.
    pub fn renew(&self, id: u64) -> bool {
        let mut table = self.table.lock().expect("lease table");
        match table.get_mut(&id) {
            Some(entry) => {
                entry.expires = Instant::now() + self.period;
                true
            }
            None => false,
        }
    }

    /// Drop a lease without firing its listener. False if already gone.
    pub fn cancel(&self, id: u64) -> bool {
        self.table.lock().expect("lease table").remove(&id).is_some()
    }

    /// Stop expiring; outstanding leases are abandoned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(u64, Arc<dyn LeaseListener>)> = {
            let mut table = self.table.lock().expect("lease table");
            let ids: Vec<u64> = table
                .iter()
                .filter(|(_, e)| e.expires <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(&id).map(|e| (id, e.listener)))
                .collect()
        };
        for (id, listener) in expired {
            tracing::info!(lease = id, "lease expired");
            listener.lease_expired();
        }
    }
}

/// Spawn the lease-checker task. It polls at a fraction of the lease
/// period (bounded by `wake`) so expiry lag stays small.
pub fn spawn_checker(leases: Arc<Leases>, wake: Duration) -> JoinHandle<()> {
    let interval = wake.min(leases.period / 4).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if leases.closed.load(Ordering::SeqCst) {
                break;
            }
            leases.sweep();
        }
        tracing::info!("lease checker exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingListener(AtomicU32);

    impl LeaseListener for CountingListener {
        fn lease_expired(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_ids_are_refused_until_cancelled() {
        let leases = Leases::new(Duration::from_secs(60));
        let listener = Arc::new(CountingListener(AtomicU32::new(0)));
        leases.create(7, listener.clone()).expect("create");
        assert!(leases.create(7, listener.clone()).is_err());
        assert!(leases.cancel(7));
        leases.create(7, listener).expect("recreate");
    }

    #[test]
    fn sweep_fires_only_expired_leases() {
        let leases = Leases::new(Duration::from_millis(0));
        let fired = Arc::new(CountingListener(AtomicU32::new(0)));
        leases.create(1, fired.clone()).expect("create");
        std::thread::sleep(Duration::from_millis(5));
        leases.sweep();
        assert_eq!(fired.0.load(Ordering::SeqCst), 1);
        // A second sweep must not fire the listener again.
        leases.sweep();
        assert_eq!(fired.0.load(Ordering::SeqCst), 1);
        assert!(!leases.renew(1));
    }
}
