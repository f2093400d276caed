//! Master-facing RPC contract and the in-process implementation used by
//! standalone mode and tests.
//!
//! The wire transport is not part of this crate; a networked deployment
//! implements `MasterClient` over its RPC stack of choice.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::{MasterInstruction, OutboundMessage, ServerIdentity, ServerLoad};

/// Errors from talking to the master.
#[derive(Debug, Error)]
pub enum MasterError {
    /// A previous generation of this server identity still holds its lease
    /// on the master; usually a DNS misconfiguration, resolves itself once
    /// the old lease times out.
    #[error("lease still held for {0}")]
    LeaseStillHeld(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Outgoing RPC surface of the master, as seen by a region server.
#[async_trait]
pub trait MasterClient: Send + Sync + 'static {
    /// Announce this server and receive initial configuration overrides.
    async fn startup(
        &self,
        identity: &ServerIdentity,
        load: ServerLoad,
    ) -> Result<HashMap<String, String>, MasterError>;

    /// Heartbeat: deliver queued events and load, receive instructions.
    async fn report(
        &self,
        identity: &ServerIdentity,
        load: ServerLoad,
        outbound: Vec<OutboundMessage>,
    ) -> Result<Vec<MasterInstruction>, MasterError>;
}

/// Scriptable in-process master.
///
/// Standalone mode uses it to hand the server its initial regions; tests
/// use it to drive every end-to-end scenario. Instructions queued with
/// [`InProcessMaster::enqueue`] are delivered on the next report, and all
/// received reports are retained for inspection.
#[derive(Default)]
pub struct InProcessMaster {
    config: HashMap<String, String>,
    state: Mutex<MasterState>,
}

#[derive(Default)]
struct MasterState {
    pending: Vec<MasterInstruction>,
    reports: Vec<Vec<OutboundMessage>>,
    loads: Vec<ServerLoad>,
    startups: u64,
    fail_reports: u32,
}

impl InProcessMaster {
    pub fn new(config: HashMap<String, String>) -> Self {
        Self {
            config,
            state: Mutex::default(),
        }
    }

    /// Queue instructions for delivery on the next heartbeat.
    pub fn enqueue(&self, instructions: Vec<MasterInstruction>) {
        self.state
            .lock()
            .expect("master state")
            .pending
            .extend(instructions);
    }

    /// Fail the next `n` report calls with an IO error.
    pub fn fail_next_reports(&self, n: u32) {
        self.state.lock().expect("master state").fail_reports = n;
    }

    /// All heartbeat payloads received so far, in order.
    pub fn reports(&self) -> Vec<Vec<OutboundMessage>> {
        self.state.lock().expect("master state").reports.clone()
    }

    /// Every non-empty outbound message, flattened across heartbeats.
    pub fn all_messages(&self) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .expect("master state")
            .reports
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn loads(&self) -> Vec<ServerLoad> {
        self.state.lock().expect("master state").loads.clone()
    }

    pub fn startup_count(&self) -> u64 {
        self.state.lock().expect("master state").startups
    }
}

#[async_trait]
impl MasterClient for InProcessMaster {
    async fn startup(
        &self,
        identity: &ServerIdentity,
        _load: ServerLoad,
    ) -> Result<HashMap<String, String>, MasterError> {
        let mut state = self.state.lock().expect("master state");
        state.startups += 1;
        tracing::debug!(server = %identity.label(), "region server reported for duty");
        Ok(self.config.clone())
    }

    async fn report(
        &self,
        _identity: &ServerIdentity,
        load: ServerLoad,
        outbound: Vec<OutboundMessage>,
    ) -> Result<Vec<MasterInstruction>, MasterError> {
        let mut state = self.state.lock().expect("master state");
        if state.fail_reports > 0 {
            state.fail_reports -= 1;
            return Err(MasterError::Io(anyhow::anyhow!("master unreachable")));
        }
        state.loads.push(load);
        state.reports.push(outbound);
        Ok(std::mem::take(&mut state.pending))
    }
}
