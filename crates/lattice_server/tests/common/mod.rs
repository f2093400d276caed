//! Shared helpers for the region-server integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_server::fs::{Dfs, LocalDfs};
use lattice_server::master::InProcessMaster;
use lattice_server::region::{FamilySchema, RegionDescriptor, TableSchema, META_TABLE};
use lattice_server::server::ServerContext;
use lattice_server::{BatchOp, BatchUpdate, RegionServer, RegionService, ServerConfig};

/// Fast cadence for tests: heartbeats and background polls in the tens of
/// milliseconds, everything else far enough away not to interfere.
pub fn test_config(root: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.root_dir = root.to_path_buf();
    config.bind_address = "127.0.0.1:0".parse().expect("addr");
    config.msg_interval_ms = 40;
    config.master_lease_period_ms = 10_000;
    config.scanner_lease_period_ms = 60_000;
    config.compact_check_frequency_ms = 50;
    config.optional_flush_interval_ms = 600_000;
    config.wake_frequency_ms = 25;
    config.region_memcache_flush_size = 1 << 20;
    config.region_split_size = u64::MAX / 2;
    config
}

/// Local filesystem whose availability probe can be failed on demand.
pub struct FaultDfs {
    inner: LocalDfs,
    failed: AtomicBool,
}

impl FaultDfs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalDfs,
            failed: AtomicBool::new(false),
        })
    }

    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

impl Dfs for FaultDfs {
    fn ping(&self) -> anyhow::Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            anyhow::bail!("injected filesystem failure");
        }
        self.inner.ping()
    }

    fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        self.inner.exists(path)
    }

    fn mkdirs(&self, path: &Path) -> anyhow::Result<()> {
        self.inner.mkdirs(path)
    }

    fn delete_all(&self, path: &Path) -> anyhow::Result<()> {
        self.inner.delete_all(path)
    }
}

pub fn user_table() -> TableSchema {
    TableSchema::new("accounts", vec![FamilySchema::new("f")])
}

pub fn user_region() -> RegionDescriptor {
    RegionDescriptor::new(user_table(), Vec::new(), Vec::new())
}

pub fn meta_region() -> RegionDescriptor {
    RegionDescriptor::new(
        TableSchema::new(META_TABLE, vec![FamilySchema::new("info")]),
        Vec::new(),
        Vec::new(),
    )
}

pub fn put(row: &str, column: &str, value: &str) -> BatchUpdate {
    BatchUpdate {
        row: row.as_bytes().to_vec(),
        ops: vec![BatchOp::Put {
            column: column.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }],
    }
}

pub struct TestServer {
    pub server: Arc<RegionServer>,
    pub ctx: Arc<ServerContext>,
    pub service: RegionService,
    pub master: Arc<InProcessMaster>,
    pub run: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a server against an in-process master and wait for it to finish
/// startup (WAL created, service tasks running).
pub async fn start_server(config: ServerConfig, dfs: Arc<dyn Dfs>) -> TestServer {
    start_server_with_master(config, dfs, Arc::new(InProcessMaster::new(HashMap::new()))).await
}

pub async fn start_server_with_master(
    config: ServerConfig,
    dfs: Arc<dyn Dfs>,
    master: Arc<InProcessMaster>,
) -> TestServer {
    let server = Arc::new(RegionServer::new(config, dfs, master.clone()));
    let ctx = server.context();
    let run = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    wait_until(Duration::from_secs(10), || ctx.current_wal().is_some()).await;
    let service = RegionService::new(ctx.clone());
    TestServer {
        server,
        ctx,
        service,
        master,
        run,
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Stop a server and wait for its main loop to finish.
pub async fn stop_and_join(server: TestServer) -> Arc<InProcessMaster> {
    server.ctx.stop();
    let result = tokio::time::timeout(Duration::from_secs(10), server.run)
        .await
        .expect("run loop finished")
        .expect("join");
    result.expect("clean shutdown");
    server.master
}
