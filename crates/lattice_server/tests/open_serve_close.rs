//! A region's whole life on one server: the master assigns it, a client
//! reads and writes through it, the master takes it back.

mod common;

use std::time::Duration;

use common::{put, start_server, stop_and_join, test_config, user_region, wait_until};
use lattice_server::fs::LocalDfs;
use lattice_server::{MasterInstruction, OutboundMessage};
use std::sync::Arc;

#[tokio::test]
async fn open_serve_close_reports_exactly_once_each() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ts = start_server(test_config(dir.path()), Arc::new(LocalDfs)).await;
    let region = user_region();
    let name = region.name();

    ts.master
        .enqueue(vec![MasterInstruction::OpenRegion(region.clone())]);
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
    let value = ts
        .service
        .get(&name, b"a", b"f:x")
        .await
        .expect("read")
        .expect("value present");
    assert_eq!(&value[..], b"1");

    // A second open of an online region is a no-op and emits nothing.
    ts.master
        .enqueue(vec![MasterInstruction::OpenRegion(region.clone())]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    ts.master
        .enqueue(vec![MasterInstruction::CloseRegion(region.clone())]);
    {
        let ctx = ts.ctx.clone();
        let name = name.clone();
        wait_until(Duration::from_secs(10), move || {
            !ctx.registry.is_online(&name)
        })
        .await;
    }
    let err = ts.service.get(&name, b"a", b"f:x").await.unwrap_err();
    assert!(matches!(
        err,
        lattice_server::RequestError::NotServingRegion(_)
    ));

    let master = stop_and_join(ts).await;

    // Across every heartbeat, the open/close story is exactly one
    // REPORT_OPEN followed by exactly one REPORT_CLOSE.
    let lifecycle: Vec<OutboundMessage> = master
        .all_messages()
        .into_iter()
        .filter(|m| {
            matches!(
                m,
                OutboundMessage::ReportOpen(_) | OutboundMessage::ReportClose(_)
            )
        })
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            OutboundMessage::ReportOpen(region.clone()),
            OutboundMessage::ReportClose(region)
        ]
    );

    // The graceful shutdown report leads with REPORT_EXITING.
    let reports = master.reports();
    let last = reports.last().expect("final report");
    assert_eq!(last.first(), Some(&OutboundMessage::ReportExiting));
}
