//! Memtable flush scheduling and global memory admission.
//!
//! One task drains a FIFO of flush-due regions; a suppression set keeps a
//! region from being queued twice. Every write runs memory admission
//! first: when the sum of all memtable sizes crosses the configured cap,
//! the writer is held while the largest memtables are flushed down to the
//! low-water mark.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::queue::TaskQueue;
use crate::region::{FlushRequester, Region};
use crate::server::ServerContext;

#[derive(Default)]
pub struct FlusherState {
    queue: TaskQueue<Arc<Region>>,
    in_queue: Mutex<HashSet<String>>,
    /// Held for the duration of one flush so interrupts wait for a safe
    /// point.
    working_lock: tokio::sync::Mutex<()>,
    /// Serializes memory-admission passes so concurrent writers block on
    /// one reclaim instead of stampeding.
    reclaim_lock: tokio::sync::Mutex<()>,
}

impl FlusherState {
    /// Enqueue a region for flushing; duplicate requests are absorbed.
    pub fn enqueue(&self, region: Arc<Region>) {
        let mut in_queue = self.in_queue.lock().expect("flush set");
        if in_queue.insert(region.name().to_string()) {
            self.queue.push(region);
        }
    }

    fn take_from_set(&self, name: &str) -> bool {
        self.in_queue.lock().expect("flush set").remove(name)
    }

    /// Wake the flush task only if it is not mid-flush.
    pub fn interrupt_if_necessary(&self) {
        if let Ok(_guard) = self.working_lock.try_lock() {
            self.queue.wake();
        }
    }

    fn clear(&self) {
        self.queue.clear();
        self.in_queue.lock().expect("flush set").clear();
    }
}

/// Flush capability handed to each region at open time.
pub struct QueueFlushRequester {
    ctx: Arc<ServerContext>,
}

impl QueueFlushRequester {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

impl FlushRequester for QueueFlushRequester {
    fn request(&self, region: Arc<Region>) {
        self.ctx.flusher.enqueue(region);
    }
}

/// Main flush loop.
pub async fn run(ctx: Arc<ServerContext>) {
    let wake = ctx.config().wake_frequency();
    while !ctx.lifecycle.stop_requested() {
        enqueue_optional_flush_regions(&ctx);
        let Some(region) = ctx.flusher.queue.poll(wake).await else {
            continue;
        };
        ctx.flusher.take_from_set(region.name());
        if !flush_region(&ctx, &region, false).await {
            break;
        }
    }
    ctx.flusher.clear();
    tracing::info!("flusher exiting");
}

/// Queue any online region whose last flush is older than the optional
/// flush period.
fn enqueue_optional_flush_regions(ctx: &Arc<ServerContext>) {
    let horizon = ctx.config().optional_flush_interval_ms;
    let now = crate::server::unix_ms();
    for region in ctx.registry.regions_to_check() {
        if now.saturating_sub(region.last_flush_ms()) > horizon {
            ctx.flusher.enqueue(region);
        }
    }
}

/// Flush one region. Returns false when the flusher must stop (dropped
/// snapshot or dead filesystem).
///
/// `remove_from_queue` is set on the memory-admission path, where the
/// region may still be sitting in the queue and flushing it now would
/// otherwise double-flush it later.
async fn flush_region(ctx: &Arc<ServerContext>, region: &Arc<Region>, remove_from_queue: bool) -> bool {
    if remove_from_queue && ctx.flusher.take_from_set(region.name()) {
        let name = region.name().to_string();
        ctx.flusher.queue.retain(|queued| queued.name() != name);
    }
    let _working = ctx.flusher.working_lock.lock().await;
    match region.flushcache() {
        Ok(compaction_due) => {
            if compaction_due {
                ctx.compactor.enqueue(region.clone());
            }
            true
        }
        Err(err) if err.is::<crate::error::DroppedSnapshot>() => {
            tracing::error!(region = region.name(), error = ?err,
                "wal replay required; forcing server restart");
            ctx.abort();
            false
        }
        Err(err) if err.is::<crate::region::RegionClosed>() => true,
        Err(err) => {
            tracing::error!(region = region.name(), error = ?err, "cache flush failed");
            ctx.check_file_system()
        }
    }
}

/// Memory admission, called by every write before it touches a region.
///
/// Blocks the caller while cumulative memtable usage is at or above the
/// hard cap, flushing regions in descending memtable size until usage
/// drops below the low-water mark.
pub async fn reclaim_memcache_memory(ctx: &Arc<ServerContext>) {
    let limit = ctx.config().global_memcache_limit;
    if ctx.registry.global_memtable_bytes() < limit {
        return;
    }
    let _reclaim = ctx.flusher.reclaim_lock.lock().await;
    let low_mark = ctx.config().memcache_low_mark();
    if ctx.registry.global_memtable_bytes() < limit {
        return;
    }
    tracing::info!(
        in_use = ctx.registry.global_memtable_bytes(),
        limit,
        "global memtable usage over the cap; forcing flushes"
    );
    while ctx.registry.global_memtable_bytes() >= low_mark {
        let Some(biggest) = ctx
            .registry
            .regions_to_check()
            .into_iter()
            .max_by_key(|r| r.memtable_bytes())
            .filter(|r| r.memtable_bytes() > 0)
        else {
            break;
        };
        tracing::info!(region = biggest.name(), "forcing flush to relieve memory pressure");
        if !flush_region(ctx, &biggest, true).await {
            break;
        }
    }
}
