//! A flush that dies after the memtable snapshot swap is unrecoverable in
//! process: the flusher must abort the server and stop, and the WAL (the
//! only remaining copy of the lost edits) must be left in place.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{put, start_server, test_config, user_region, wait_until};
use lattice_server::fs::LocalDfs;
use lattice_server::{MasterInstruction, OutboundMessage, RequestError};

#[tokio::test]
async fn failed_snapshot_write_aborts_the_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ts = start_server(test_config(dir.path()), Arc::new(LocalDfs)).await;

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

    // Kill the next snapshot write, then hand the region to the flusher.
    let held_region = ts.ctx.region(&name, false).expect("region handle");
    held_region.inject_snapshot_fault();
    ts.ctx.flusher.enqueue(held_region);

    // Joining the run loop also joins the flusher task, so completion here
    // proves the flusher stopped rather than retrying the dead flush.
    let result = tokio::time::timeout(Duration::from_secs(10), ts.run)
        .await
        .expect("server exited")
        .expect("join");
    result.expect("abort is not a startup failure");
    assert!(ts.ctx.lifecycle.abort_requested());

    // The dropped edits live only in the WAL now; abort must not delete
    // it, and no farewell report goes to the master.
    assert!(wal_dir.exists());
    assert!(!ts
        .master
        .all_messages()
        .iter()
        .any(|m| matches!(m, OutboundMessage::ReportExiting)));

    let err = ts.service.get(&name, b"a", b"f:x").await.unwrap_err();
    assert!(matches!(err, RequestError::ServerNotRunning));
}
