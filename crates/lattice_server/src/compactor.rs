//! Compaction scheduling and the region-split protocol.
//!
//! One task drains a FIFO of compaction-due regions. When a compaction
//! reports that the region has outgrown its split threshold, the split
//! runs here: the region produces two children, the catalog is updated
//! (parent marked offline+split with both children recorded, then one
//! fresh row per child), and only then is the master told. The children
//! are not served locally; the master assigns them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::catalog::{encode_descriptor, CatalogTier};
use crate::messages::OutboundMessage;
use crate::queue::TaskQueue;
use crate::region::{
    Region, RegionDescriptor, RegionUnavailableListener, COL_REGIONINFO, COL_SPLIT_A, COL_SPLIT_B,
};
use crate::registry::RegionRegistry;
use crate::server::ServerContext;

#[derive(Default)]
pub struct CompactorState {
    queue: TaskQueue<Arc<Region>>,
    in_queue: Mutex<HashSet<String>>,
    // Held across one compact+split so interrupts wait for a safe point.
    working_lock: tokio::sync::Mutex<()>,
}

impl CompactorState {
    /// Enqueue a region for a compaction check; duplicates are absorbed.
    pub fn enqueue(&self, region: Arc<Region>) {
        let mut in_queue = self.in_queue.lock().expect("compaction set");
        if in_queue.insert(region.name().to_string()) {
            tracing::debug!(region = region.name(), "compaction requested");
            self.queue.push(region);
        }
    }

    fn take_from_set(&self, name: &str) {
        self.in_queue.lock().expect("compaction set").remove(name);
    }

    pub fn interrupt_if_necessary(&self) {
        if let Ok(_guard) = self.working_lock.try_lock() {
            self.queue.wake();
        }
    }

    fn clear(&self) {
        self.queue.clear();
        self.in_queue.lock().expect("compaction set").clear();
    }
}

/// Split cutover callbacks: the parent stays findable for running
/// scanners while its data moves, then disappears entirely.
struct RetiringListener {
    registry: Arc<RegionRegistry>,
}

impl RegionUnavailableListener for RetiringListener {
    fn closing(&self, region_name: &str) {
        self.registry.retire(region_name);
    }

    fn closed(&self, region_name: &str) {
        self.registry.drop_retired(region_name);
    }
}

/// Main compaction loop.
pub async fn run(ctx: Arc<ServerContext>) {
    let frequency = ctx.config().compact_check_frequency();
    while !ctx.lifecycle.stop_requested() {
        let Some(region) = ctx.compactor.queue.poll(frequency).await else {
            continue;
        };
        ctx.compactor.take_from_set(region.name());
        let _working = ctx.compactor.working_lock.lock().await;
        let outcome = match region.compact_stores() {
            Ok(true) => split(&ctx, &region).await,
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            tracing::error!(region = region.name(), error = ?err, "compaction failed");
            if !ctx.check_file_system() {
                break;
            }
        }
    }
    ctx.compactor.clear();
    tracing::info!("compactor exiting");
}

async fn split(ctx: &Arc<ServerContext>, region: &Arc<Region>) -> anyhow::Result<()> {
    let parent_info = region.descriptor().clone();
    let listener = RetiringListener {
        registry: ctx.registry.clone(),
    };
    let Some((child_a, child_b)) = region.split(&listener)? else {
        return Ok(());
    };

    // A split of a catalog region is recorded one tier up.
    let tier = if parent_info.is_meta_table() {
        CatalogTier::Root
    } else {
        CatalogTier::Meta
    };

    let mut offline_parent = parent_info.clone();
    offline_parent.offline = true;
    offline_parent.split = true;

    // One atomic update retires the parent row and records both children;
    // the children then get rows of their own. The master discovers them
    // on its next catalog scan.
    ctx.catalog
        .apply_row(
            tier,
            parent_info.name().into_bytes(),
            vec![
                (COL_REGIONINFO.into(), encode_descriptor(&offline_parent)?),
                (COL_SPLIT_A.into(), encode_descriptor(&child_a)?),
                (COL_SPLIT_B.into(), encode_descriptor(&child_b)?),
            ],
        )
        .await?;
    for child in [&child_a, &child_b] {
        ctx.catalog
            .apply_row(
                tier,
                child.name().into_bytes(),
                vec![(COL_REGIONINFO.into(), encode_descriptor(child)?)],
            )
            .await?;
    }

    report_split(ctx, offline_parent, child_a, child_b);
    Ok(())
}

/// Tell the master about a finished split. The parent's catalog row is
/// already rewritten, so only the children need assignment.
fn report_split(
    ctx: &Arc<ServerContext>,
    parent: RegionDescriptor,
    child_a: RegionDescriptor,
    child_b: RegionDescriptor,
) {
    tracing::info!(
        parent = %parent.name(),
        child_a = %child_a.name(),
        child_b = %child_b.name(),
        "reporting region split to master"
    );
    ctx.outbound.push(OutboundMessage::ReportSplit(parent));
    ctx.outbound.push(OutboundMessage::ReportOpen(child_a));
    ctx.outbound.push(OutboundMessage::ReportOpen(child_b));
}
