//! Filesystem-loss behavior: the watchdog aborts the server, cleanup that
//! needs the filesystem is skipped, and no farewell is sent.

mod common;

use std::time::Duration;

use common::{
    put, start_server_with_master, test_config, user_region, wait_until, FaultDfs,
};
use lattice_server::master::InProcessMaster;
use lattice_server::{MasterInstruction, OutboundMessage, RequestError};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn dead_filesystem_aborts_without_cleanup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dfs = FaultDfs::new();
    let master = Arc::new(InProcessMaster::new(HashMap::new()));
    let ts = start_server_with_master(test_config(dir.path()), dfs.clone(), master).await;

    let region = user_region();
    let name = region.name();
    ts.master
        .enqueue(vec![MasterInstruction::OpenRegion(region)]);
    {
        let ctx = ts.ctx.clone();
        let name = name.clone();
        wait_until(Duration::from_secs(10), move || {
            ctx.registry.is_online(&name)
        })
        .await;
    }
    ts.service
        .batch_update(&name, None, put("a", "f:x", "1"))
        .await
        .expect("write");
    let wal_dir = ts.ctx.current_wal().expect("wal").dir().to_path_buf();
    let held_region = ts.ctx.region(&name, false).expect("region handle");

    // The filesystem goes away; the next probe declares it dead.
    dfs.fail();
    assert!(!ts.ctx.check_file_system());

    let result = tokio::time::timeout(Duration::from_secs(10), ts.run)
        .await
        .expect("server exited")
        .expect("join");
    result.expect("abort is not a startup failure");

    // Abort with a dead filesystem: the WAL is not deleted, regions are
    // not re-closed, and the master gets no exiting report.
    assert!(wal_dir.exists());
    assert!(!held_region.is_closed());
    assert!(!ts
        .master
        .all_messages()
        .iter()
        .any(|m| matches!(m, OutboundMessage::ReportExiting)));

    // Requests now fail server-side, before touching any region.
    let err = ts.service.get(&name, b"a", b"f:x").await.unwrap_err();
    assert!(matches!(
        err,
        RequestError::ServerNotRunning | RequestError::FilesystemUnavailable
    ));
}
