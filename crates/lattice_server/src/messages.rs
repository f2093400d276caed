//! Master-dialog message types and the outbound buffer.

use std::net::SocketAddr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::region::RegionDescriptor;

/// Fixed identity under which the master tracks this server's lease.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub address: SocketAddr,
    /// Process start timestamp (unix ms); regenerated when the master asks
    /// for a full restart.
    pub start_code: u64,
    /// Status page port; negative disables.
    pub info_port: i32,
}

impl ServerIdentity {
    /// Stable string form used in log lines and WAL directory names.
    pub fn label(&self) -> String {
        format!("{}_{}", self.address, self.start_code)
    }
}

/// Load snapshot published with every heartbeat.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ServerLoad {
    pub requests: u64,
    pub regions: usize,
}

/// Events this server reports to the master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OutboundMessage {
    /// Region is installed in the online map and serving.
    ReportOpen(RegionDescriptor),
    /// Region has been closed.
    ReportClose(RegionDescriptor),
    /// Parent region has split; the catalog already records the children.
    ReportSplit(RegionDescriptor),
    /// An open instruction is still in progress; do not reassign.
    ReportProcessOpen(RegionDescriptor),
    /// Final message of a graceful shutdown report.
    ReportExiting,
    /// User regions are closed; catalog regions remain.
    ReportQuiesced,
}

/// Instructions the master may return from a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterInstruction {
    /// The master has lost its state; drop everything and re-report.
    CallServerStartup,
    Stop,
    Quiesce,
    OpenRegion(RegionDescriptor),
    CloseRegion(RegionDescriptor),
    CloseRegionWithoutReport(RegionDescriptor),
}

/// Append-only queue of events drained on each heartbeat.
///
/// Ordering within one heartbeat is append order. There are no per-message
/// sequence ids; after a master-driven restart the same event may be
/// reported twice and the master is expected to tolerate that.
#[derive(Default)]
pub struct OutboundBuffer {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl OutboundBuffer {
    pub fn push(&self, msg: OutboundMessage) {
        self.messages.lock().expect("outbound lock").push(msg);
    }

    /// Atomically take everything queued so far.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.messages.lock().expect("outbound lock"))
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().expect("outbound lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_append_order_and_empties() {
        let buf = OutboundBuffer::default();
        buf.push(OutboundMessage::ReportExiting);
        buf.push(OutboundMessage::ReportQuiesced);
        let drained = buf.drain();
        assert_eq!(
            drained,
            vec![OutboundMessage::ReportExiting, OutboundMessage::ReportQuiesced]
        );
        assert!(buf.is_empty());
    }
}
