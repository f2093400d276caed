//! The region server runtime: shared context, the master-dialog control
//! loop, and orderly shutdown.
//!
//! The server sticks in [`RegionServer::run`] until stopped: it reports
//! for duty, heartbeats the master with its queued events and load, drains
//! the returned instruction stream into the worker, and watches its own
//! liveness (master reachability, filesystem health, quiesce progress).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use fjall::Keyspace;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::catalog::{CatalogAccess, LoopbackCatalog};
use crate::compactor::CompactorState;
use crate::config::ServerConfig;
use crate::error::{RegionServerRunning, RequestError};
use crate::flusher::FlusherState;
use crate::fs::{wal_dir, Dfs};
use crate::master::{MasterClient, MasterError};
use crate::messages::{
    MasterInstruction, OutboundBuffer, OutboundMessage, ServerIdentity, ServerLoad,
};
use crate::leases::Leases;
use crate::queue::TaskQueue;
use crate::region::Region;
use crate::registry::RegionRegistry;
use crate::scanners::ScannerRegistry;
use crate::wal::{RollSignal, Wal};
use crate::worker::ToDoEntry;
use crate::{compactor, flusher, leases, log_roller, worker};

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Process-wide run flags shared by every worker.
#[derive(Default)]
pub struct Lifecycle {
    stop_requested: AtomicBool,
    abort_requested: AtomicBool,
    quiesced: AtomicBool,
    /// Best-effort wake for anything sleeping on the main loop cadence.
    pub wake: Notify,
}

impl Lifecycle {
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn quiesced(&self) -> bool {
        self.quiesced.load(Ordering::SeqCst)
    }

    pub fn set_quiesced(&self) {
        self.quiesced.store(true, Ordering::SeqCst);
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.request_stop();
    }
}

/// Everything the background tasks and the request front end share.
pub struct ServerContext {
    config: RwLock<ServerConfig>,
    pub identity: RwLock<ServerIdentity>,
    pub dfs: Arc<dyn Dfs>,
    pub master: Arc<dyn MasterClient>,
    pub catalog: Arc<dyn CatalogAccess>,
    pub registry: Arc<RegionRegistry>,
    pub outbound: OutboundBuffer,
    pub scanners: ScannerRegistry,
    pub leases: Arc<Leases>,
    pub lifecycle: Lifecycle,
    pub instructions: TaskQueue<ToDoEntry>,
    pub flusher: FlusherState,
    pub compactor: CompactorState,
    pub roll_signal: Arc<RollSignal>,
    /// Shared with the restart sequence: rolling and close-and-recreate
    /// never overlap.
    pub roller_lock: tokio::sync::Mutex<()>,
    pub request_count: AtomicU64,
    fs_ok: AtomicBool,
    wal: RwLock<Option<Arc<Wal>>>,
    keyspace: RwLock<Option<Arc<Keyspace>>>,
}

impl ServerContext {
    pub fn config(&self) -> RwLockReadGuard<'_, ServerConfig> {
        self.config.read().expect("config lock")
    }

    pub fn identity(&self) -> ServerIdentity {
        self.identity.read().expect("identity lock").clone()
    }

    pub fn current_wal(&self) -> Option<Arc<Wal>> {
        self.wal.read().expect("wal slot").clone()
    }

    pub fn current_keyspace(&self) -> Option<Arc<Keyspace>> {
        self.keyspace.read().expect("keyspace slot").clone()
    }

    pub fn fs_ok(&self) -> bool {
        self.fs_ok.load(Ordering::SeqCst)
    }

    /// Orderly stop: finish the current heartbeat, close regions, delete
    /// the WAL, send the final report.
    pub fn stop(&self) {
        self.lifecycle.request_stop();
        self.instructions.wake();
    }

    /// Exit without closing regions or notifying the master.
    pub fn abort(&self) {
        self.lifecycle.request_abort();
        self.instructions.wake();
    }

    /// Verify this server can take requests at all.
    pub fn check_open(&self) -> Result<(), RequestError> {
        if self.lifecycle.stop_requested() || self.lifecycle.abort_requested() {
            return Err(RequestError::ServerNotRunning);
        }
        if !self.fs_ok() {
            return Err(RequestError::FilesystemUnavailable);
        }
        Ok(())
    }

    /// Probe the filesystem after an IO failure. A failed probe aborts the
    /// server and latches `fs_ok` false, which also stops the heartbeat
    /// loop from enqueueing further master instructions.
    pub fn check_file_system(&self) -> bool {
        if self.fs_ok() {
            if let Err(err) = self.dfs.ping() {
                tracing::error!(error = ?err, "file system unavailable; shutting down");
                self.fs_ok.store(false, Ordering::SeqCst);
                self.abort();
            }
        }
        self.fs_ok()
    }

    /// Resolve a serving region or fail with *not-serving-region*.
    pub fn region(
        &self,
        name: &str,
        check_retiring: bool,
    ) -> Result<Arc<Region>, RequestError> {
        self.registry
            .get(name, check_retiring)
            .ok_or_else(|| RequestError::NotServingRegion(name.to_string()))
    }
}

/// The region-server process object.
pub struct RegionServer {
    ctx: Arc<ServerContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegionServer {
    pub fn new(
        config: ServerConfig,
        dfs: Arc<dyn Dfs>,
        master: Arc<dyn MasterClient>,
    ) -> Self {
        let identity = ServerIdentity {
            address: config.bind_address,
            start_code: unix_ms(),
            info_port: config.info_port,
        };
        let registry = Arc::new(RegionRegistry::default());
        let leases = Arc::new(Leases::new(config.scanner_lease_period()));
        let ctx = Arc::new(ServerContext {
            identity: RwLock::new(identity),
            dfs,
            master,
            catalog: Arc::new(LoopbackCatalog::new(registry.clone())),
            registry,
            outbound: OutboundBuffer::default(),
            scanners: ScannerRegistry::default(),
            leases,
            lifecycle: Lifecycle::default(),
            instructions: TaskQueue::default(),
            flusher: FlusherState::default(),
            compactor: CompactorState::default(),
            roll_signal: Arc::new(RollSignal::default()),
            roller_lock: tokio::sync::Mutex::new(()),
            request_count: AtomicU64::new(0),
            fs_ok: AtomicBool::new(true),
            wal: RwLock::new(None),
            keyspace: RwLock::new(None),
            config: RwLock::new(config),
        });
        Self {
            ctx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Run until stopped. Returns an error only for startup failures.
    pub async fn run(&self) -> anyhow::Result<()> {
        let ctx = self.ctx.clone();

        let Some(config_map) = self.report_for_duty().await else {
            // Stopped before the master ever answered.
            return Ok(());
        };
        if let Err(err) = self.init(config_map) {
            ctx.stop();
            tracing::error!(error = ?err, "failed init");
            return Err(err.context("region server startup failed"));
        }

        let mut last_msg: Option<Instant> = None;
        let mut tries = 0u32;
        let mut quiesce_requested = false;

        'main: while !ctx.lifecycle.stop_requested() {
            let msg_interval = ctx.config().msg_interval();
            let lease_timeout = ctx.config().master_lease_period();
            let now = Instant::now();

            if let Some(last) = last_msg {
                if now.duration_since(last) >= lease_timeout {
                    tracing::error!(
                        silent_ms = now.duration_since(last).as_millis() as u64,
                        "unable to report to master; aborting server"
                    );
                    ctx.abort();
                    break;
                }
            }

            if last_msg.map(|l| now.duration_since(l) >= msg_interval).unwrap_or(true) {
                let outbound = ctx.outbound.drain();
                let load = ServerLoad {
                    requests: ctx.request_count.swap(0, Ordering::SeqCst),
                    regions: ctx.registry.online_count(),
                };
                let identity = ctx.identity();
                match ctx.master.report(&identity, load, outbound).await {
                    Ok(instructions) => {
                        last_msg = Some(Instant::now());
                        tries = 0;

                        if ctx.lifecycle.quiesced() && ctx.registry.online_count() == 0 {
                            tracing::info!(
                                "server quiesced and not serving any regions; starting shutdown"
                            );
                            ctx.stop();
                            continue;
                        }

                        let mut restart = false;
                        for instruction in instructions {
                            if ctx.lifecycle.stop_requested() || restart {
                                break;
                            }
                            match instruction {
                                MasterInstruction::CallServerStartup => {
                                    tracing::info!("got call-server-startup message");
                                    if ctx.check_file_system() {
                                        match self.restart_for_master().await {
                                            Some(true) => restart = true,
                                            Some(false) => break 'main,
                                            None => break 'main,
                                        }
                                    } else {
                                        tracing::error!(
                                            "file system check failed; shutting down server"
                                        );
                                    }
                                }
                                MasterInstruction::Stop => {
                                    tracing::info!("got regionserver stop message");
                                    ctx.stop();
                                }
                                MasterInstruction::Quiesce => {
                                    if !quiesce_requested {
                                        tracing::info!("got quiesce server message");
                                        ctx.instructions
                                            .push(ToDoEntry::new(MasterInstruction::Quiesce));
                                        quiesce_requested = true;
                                    }
                                }
                                other => {
                                    if ctx.fs_ok() {
                                        ctx.instructions.push(ToDoEntry::new(other));
                                    }
                                }
                            }
                        }
                        if restart {
                            ctx.instructions.clear();
                            last_msg = None;
                            continue;
                        }
                        if ctx.lifecycle.stop_requested() {
                            ctx.instructions.clear();
                            break;
                        }
                    }
                    Err(err) => {
                        if tries < ctx.config().retries {
                            tracing::warn!(retry = tries, error = ?err,
                                "error processing master report");
                            tries += 1;
                        } else {
                            tracing::error!(max_retries = ctx.config().retries, error = ?err,
                                "exceeded max report retries");
                            if !ctx.check_file_system() {
                                continue;
                            }
                            // Master unreachable but the filesystem is
                            // fine: shut down and let the master reassign.
                            ctx.stop();
                        }
                    }
                }
            }

            self.housekeeping();
            let sleep_anchor = last_msg.unwrap_or(now);
            let deadline = sleep_anchor + msg_interval;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() && !ctx.lifecycle.stop_requested() {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = ctx.lifecycle.wake.notified() => {}
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Tell the master we are up, retrying at the heartbeat cadence until
    /// it answers or we are stopped. Returns the initial config map.
    async fn report_for_duty(&self) -> Option<std::collections::HashMap<String, String>> {
        let ctx = &self.ctx;
        tracing::debug!("telling master that we are up");
        while !ctx.lifecycle.stop_requested() {
            ctx.request_count.store(0, Ordering::SeqCst);
            let load = ServerLoad {
                requests: 0,
                regions: ctx.registry.online_count(),
            };
            let identity = ctx.identity();
            match ctx.master.startup(&identity, load).await {
                Ok(map) => {
                    tracing::debug!("done telling master we are up");
                    return Some(map);
                }
                Err(MasterError::LeaseStillHeld(name)) => {
                    tracing::info!(
                        lease = %name,
                        "lease already held on master; check DNS configuration so \
                         servers report their true addresses, otherwise this resolves \
                         once the old lease expires"
                    );
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "error telling master we are up");
                }
            }
            let interval = ctx.config().msg_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = ctx.lifecycle.wake.notified() => {}
            }
        }
        None
    }

    /// Apply master configuration, set up storage and the WAL, and start
    /// every service task.
    fn init(&self, config_map: std::collections::HashMap<String, String>) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        {
            let mut config = ctx.config.write().expect("config lock");
            config
                .apply_overrides(config_map.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        let root = ctx.config().root_dir.clone();
        ctx.dfs.mkdirs(&root)?;

        let keyspace = fjall::Config::new(root.join("storage"))
            .open()
            .context("open storage keyspace")?;
        *ctx.keyspace.write().expect("keyspace slot") = Some(Arc::new(keyspace));

        self.setup_wal(&root)?;
        self.start_service_tasks();
        tracing::info!(server = %ctx.identity().label(), "region server started");
        Ok(())
    }

    /// Create this instance's WAL. A pre-existing log directory means a
    /// server with this identity is already live.
    fn setup_wal(&self, root: &PathBuf) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let identity = ctx.identity();
        let dir = wal_dir(
            root,
            &identity.address.ip().to_string(),
            identity.start_code,
            identity.address.port(),
        );
        tracing::debug!(dir = %dir.display(), "log dir");
        if ctx.dfs.exists(&dir)? {
            return Err(anyhow::Error::new(RegionServerRunning {
                address: identity.address.to_string(),
                log_dir: dir.display().to_string(),
            }));
        }
        let wal = Wal::create(
            dir,
            ctx.config().wal_max_entries,
            ctx.roll_signal.clone(),
        )?;
        *ctx.wal.write().expect("wal slot") = Some(Arc::new(wal));
        Ok(())
    }

    fn start_service_tasks(&self) {
        let ctx = &self.ctx;
        let mut tasks = self.tasks.lock().expect("task handles");
        tasks.push(spawn_supervised(ctx.clone(), "worker", worker::run(ctx.clone())));
        tasks.push(spawn_supervised(ctx.clone(), "flusher", flusher::run(ctx.clone())));
        tasks.push(spawn_supervised(ctx.clone(), "compactor", compactor::run(ctx.clone())));
        tasks.push(spawn_supervised(ctx.clone(), "log-roller", log_roller::run(ctx.clone())));
        tasks.push(leases::spawn_checker(
            ctx.leases.clone(),
            ctx.config().wake_frequency(),
        ));
    }

    /// The master lost its state: close everything, recreate the WAL under
    /// a fresh start code, and report for duty again.
    ///
    /// `Some(true)` resumes the heartbeat loop; anything else ends it.
    async fn restart_for_master(&self) -> Option<bool> {
        let ctx = &self.ctx;
        ctx.registry.close_all(false);
        {
            let _roller = ctx.roller_lock.lock().await;
            if let Some(wal) = ctx.current_wal() {
                if let Err(err) = wal.close_and_delete() {
                    tracing::error!(error = ?err, "error closing and deleting wal");
                }
            }
            ctx.identity.write().expect("identity lock").start_code = unix_ms();
            let root = ctx.config().root_dir.clone();
            if let Err(err) = self.setup_wal(&root) {
                tracing::error!(error = ?err, "error restarting server");
                ctx.abort();
                return Some(false);
            }
        }
        self.report_for_duty().await.map(|_| true)
    }

    /// Re-announce still-queued region opens so the master does not hand
    /// them to another server while the worker gets to them.
    fn housekeeping(&self) {
        let ctx = &self.ctx;
        if ctx.instructions.is_empty() {
            return;
        }
        for entry in ctx.instructions.snapshot() {
            if let MasterInstruction::OpenRegion(info) = entry.msg {
                ctx.outbound.push(OutboundMessage::ReportProcessOpen(info));
            }
        }
    }

    async fn shutdown(&self) {
        let ctx = &self.ctx;
        ctx.leases.close();
        ctx.flusher.interrupt_if_necessary();
        ctx.compactor.interrupt_if_necessary();
        ctx.roll_signal.request_roll(); // wakes the roller so it sees stop

        if ctx.lifecycle.abort_requested() {
            if ctx.fs_ok() {
                // Only clean up when the filesystem is still usable.
                if let Some(wal) = ctx.current_wal() {
                    match wal.close() {
                        Ok(()) => tracing::info!("on abort, closed wal"),
                        Err(err) => {
                            tracing::error!(error = ?err, "unable to close wal in abort")
                        }
                    }
                }
                ctx.registry.close_all(true);
            }
            tracing::info!(server = %ctx.identity().label(), "aborting server");
        } else {
            let closed = ctx.registry.close_all(false);
            if let Some(wal) = ctx.current_wal() {
                if let Err(err) = wal.close_and_delete() {
                    tracing::error!(error = ?err, "wal close and delete failed");
                }
            }
            let mut report = vec![OutboundMessage::ReportExiting];
            for region in &closed {
                report.push(OutboundMessage::ReportClose(region.descriptor().clone()));
            }
            let load = ServerLoad {
                requests: ctx.request_count.load(Ordering::SeqCst),
                regions: 0,
            };
            tracing::info!(server = %ctx.identity().label(),
                "telling master that region server is shutting down");
            let identity = ctx.identity();
            if let Err(err) = ctx.master.report(&identity, load, report).await {
                tracing::warn!(error = ?err, "failed to send exiting message to master");
            }
            tracing::info!(server = %ctx.identity().label(), "stopping server");
        }

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task handles"));
        let _ = futures_util::future::join_all(handles).await;
        tracing::info!("region server exiting");
    }
}

/// Spawn a service task; if it panics, abort the whole server the way an
/// uncaught-exception handler would.
fn spawn_supervised(
    ctx: Arc<ServerContext>,
    name: &'static str,
    task: impl std::future::Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let inner = tokio::spawn(task);
        if let Err(err) = inner.await {
            if err.is_panic() {
                tracing::error!(task = name, "service task panicked; aborting server");
                ctx.abort();
            }
        }
    })
}
