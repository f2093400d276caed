//! Scanner lifecycle: open/next/close bookkeeping and lease-based expiry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{put, start_server, stop_and_join, test_config, user_region, wait_until};
use lattice_server::fs::LocalDfs;
use lattice_server::{MasterInstruction, RequestError};

#[tokio::test]
async fn scan_visits_rows_and_close_clears_all_state() {
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

    for (row, value) in [("a", "1"), ("b", "2"), ("d", "4")] {
        ts.service
            .batch_update(&name, None, put(row, "f:x", value))
            .await
            .expect("write");
    }
    // A deleted row must be skipped, not returned empty.
    ts.service
        .batch_update(&name, None, put("c", "f:x", "3"))
        .await
        .expect("write");
    ts.service
        .delete_all(&name, b"c", None, u64::MAX)
        .await
        .expect("delete row");

    // An empty start row is refused before the region is even looked up.
    let err = ts
        .service
        .open_scanner(&name, vec![b"f:".to_vec()], Vec::new(), u64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::InvalidRequest(_)));

    let scanner = ts
        .service
        .open_scanner(&name, vec![b"f:".to_vec()], b"a".to_vec(), u64::MAX)
        .await
        .expect("open scanner");

    let mut rows = Vec::new();
    while let Some(next) = ts.service.next(scanner).await.expect("next") {
        rows.push(String::from_utf8(next.row).expect("utf8 row"));
    }
    assert_eq!(rows, vec!["a", "b", "d"]);

    ts.service.close_scanner(scanner).await.expect("close");
    assert!(ts.ctx.scanners.is_empty());
    let err = ts.service.next(scanner).await.unwrap_err();
    assert!(matches!(err, RequestError::UnknownScanner(_)));

    stop_and_join(ts).await;
}

#[tokio::test]
async fn idle_scanner_expires_and_next_fails_unknown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.scanner_lease_period_ms = 150;
    let ts = start_server(config, Arc::new(LocalDfs)).await;
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

    let scanner = ts
        .service
        .open_scanner(&name, vec![b"f:x".to_vec()], b"a".to_vec(), u64::MAX)
        .await
        .expect("open scanner");

    // Renewals keep the lease alive across several periods.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ts.service.next(scanner).await.expect("renewing next");
    }

    // Left idle past the lease period, the cursor is torn down.
    {
        let ctx = ts.ctx.clone();
        wait_until(Duration::from_secs(10), move || ctx.scanners.is_empty()).await;
    }
    let err = ts.service.next(scanner).await.unwrap_err();
    assert!(matches!(err, RequestError::UnknownScanner(id) if id == scanner));

    stop_and_join(ts).await;
}
