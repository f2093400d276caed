//! Worker: serial executor of slow master instructions.
//!
//! The heartbeat loop enqueues region open/close and quiesce instructions
//! here so the dialog with the master never blocks on region IO. Failed
//! IO-bound instructions are requeued with a retry budget.

use std::sync::Arc;

use crate::flusher::QueueFlushRequester;
use crate::messages::{MasterInstruction, OutboundMessage};
use crate::region::{Region, RegionDescriptor, RegionTuning};
use crate::server::ServerContext;

/// One queued instruction plus its retry count.
#[derive(Clone, Debug)]
pub struct ToDoEntry {
    pub tries: u32,
    pub msg: MasterInstruction,
}

impl ToDoEntry {
    pub fn new(msg: MasterInstruction) -> Self {
        Self { tries: 0, msg }
    }
}

pub async fn run(ctx: Arc<ServerContext>) {
    let wake = ctx.config().wake_frequency();
    let retries = ctx.config().retries;
    while !ctx.lifecycle.stop_requested() {
        let Some(entry) = ctx.instructions.poll(wake).await else {
            continue;
        };
        if ctx.lifecycle.stop_requested() {
            break;
        }
        tracing::info!(instruction = ?entry.msg, "processing master instruction");
        let result = match entry.msg.clone() {
            MasterInstruction::Quiesce => close_user_regions(&ctx),
            MasterInstruction::OpenRegion(info) => open_region(&ctx, info),
            MasterInstruction::CloseRegion(info) => close_region(&ctx, &info, true),
            MasterInstruction::CloseRegionWithoutReport(info) => {
                close_region(&ctx, &info, false)
            }
            other => {
                tracing::error!(instruction = ?other, "instruction cannot be processed here");
                Ok(())
            }
        };
        if let Err(err) = result {
            if entry.tries < retries {
                tracing::warn!(tries = entry.tries, error = ?err, "retrying instruction");
                ctx.instructions.push(ToDoEntry {
                    tries: entry.tries + 1,
                    msg: entry.msg,
                });
            } else {
                tracing::error!(instruction = ?entry.msg, error = ?err,
                    "unable to process instruction");
            }
            if !ctx.check_file_system() {
                break;
            }
        }
    }
    tracing::info!("worker exiting");
}

/// Open a region and install it for serving. A second open of an already
/// online region is a no-op and emits nothing.
fn open_region(ctx: &Arc<ServerContext>, info: RegionDescriptor) -> anyhow::Result<()> {
    let name = info.name();
    if ctx.registry.is_online(&name) {
        return Ok(());
    }
    let Some(keyspace) = ctx.current_keyspace() else {
        anyhow::bail!("storage is not initialized");
    };
    let Some(wal) = ctx.current_wal() else {
        anyhow::bail!("wal is not initialized");
    };
    let tuning = RegionTuning::from(&*ctx.config());

    let progress_ctx = ctx.clone();
    let progress_info = info.clone();
    let region = match Region::open(keyspace, wal.clone(), info.clone(), tuning, move || {
        progress_ctx
            .outbound
            .push(OutboundMessage::ReportProcessOpen(progress_info.clone()));
    }) {
        Ok(region) => region,
        Err(err) => {
            // Report a close so the master reassigns the region instead of
            // waiting on this server.
            tracing::error!(region = %name, error = ?err, "error opening region");
            ctx.outbound.push(OutboundMessage::ReportClose(info));
            return Ok(());
        }
    };
    region.attach_flush_requester(Arc::new(QueueFlushRequester::new(ctx.clone())));
    // Check early whether the freshly loaded stores want a compaction.
    ctx.compactor.enqueue(region.clone());

    ctx.registry.install_online(region, &wal);
    ctx.outbound.push(OutboundMessage::ReportOpen(info));
    Ok(())
}

fn close_region(
    ctx: &Arc<ServerContext>,
    info: &RegionDescriptor,
    report: bool,
) -> anyhow::Result<()> {
    let name = info.name();
    if let Some(region) = ctx.registry.remove_online(&name) {
        region.close(false)?;
        if report {
            ctx.outbound.push(OutboundMessage::ReportClose(info.clone()));
        }
    }
    Ok(())
}

/// First stage of cluster shutdown: drop user regions, keep catalog
/// regions until the master has moved them elsewhere.
fn close_user_regions(ctx: &Arc<ServerContext>) -> anyhow::Result<()> {
    let (closed, remaining) = ctx.registry.close_user_regions();
    tracing::info!(closed = closed.len(), remaining, "closed user regions for quiesce");
    ctx.lifecycle.set_quiesced();
    if remaining == 0 {
        ctx.outbound.push(OutboundMessage::ReportExiting);
    } else {
        ctx.outbound.push(OutboundMessage::ReportQuiesced);
    }
    Ok(())
}
