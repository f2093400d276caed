//! Master unreachability: bounded retries, then a graceful stop with the
//! filesystem verified healthy.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{start_server, test_config, user_region, wait_until};
use lattice_server::fs::LocalDfs;
use lattice_server::{MasterInstruction, OutboundMessage};

#[tokio::test]
async fn repeated_report_failures_stop_the_server_gracefully() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    assert_eq!(config.retries, 2);
    let ts = start_server(config, Arc::new(LocalDfs)).await;

    let region = user_region();
    ts.master
        .enqueue(vec![MasterInstruction::OpenRegion(region.clone())]);
    {
        let ctx = ts.ctx.clone();
        let name = region.name();
        wait_until(Duration::from_secs(10), move || {
            ctx.registry.is_online(&name)
        })
        .await;
    }

    // Three consecutive failures exceed the retry budget of two.
    ts.master.fail_next_reports(3);
    let result = tokio::time::timeout(Duration::from_secs(10), ts.run)
        .await
        .expect("server stopped")
        .expect("join");
    result.expect("graceful shutdown");

    // Graceful shutdown: the region was closed and the final report leads
    // with REPORT_EXITING followed by the just-closed region.
    let reports = ts.master.reports();
    let last = reports.last().expect("final report");
    assert_eq!(last.first(), Some(&OutboundMessage::ReportExiting));
    assert!(last
        .iter()
        .any(|m| matches!(m, OutboundMessage::ReportClose(info) if info.region_id == region.region_id)));
}
