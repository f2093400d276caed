//! Cluster shutdown, stage one: quiesce closes user regions while the
//! catalog regions stay up, then the server stops once it serves nothing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{meta_region, start_server, test_config, user_region, wait_until};
use lattice_server::fs::LocalDfs;
use lattice_server::{MasterInstruction, OutboundMessage};

#[tokio::test]
async fn quiesce_keeps_catalog_regions_until_reassigned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ts = start_server(test_config(dir.path()), Arc::new(LocalDfs)).await;

    let meta = meta_region();
    let user = user_region();
    ts.master.enqueue(vec![
        MasterInstruction::OpenRegion(meta.clone()),
        MasterInstruction::OpenRegion(user.clone()),
    ]);
    {
        let ctx = ts.ctx.clone();
        let (meta_name, user_name) = (meta.name(), user.name());
        wait_until(Duration::from_secs(10), move || {
            ctx.registry.is_online(&meta_name) && ctx.registry.is_online(&user_name)
        })
        .await;
    }

    ts.master.enqueue(vec![MasterInstruction::Quiesce]);
    {
        let master = ts.master.clone();
        wait_until(Duration::from_secs(10), move || {
            master
                .all_messages()
                .iter()
                .any(|m| matches!(m, OutboundMessage::ReportQuiesced))
        })
        .await;
    }
    assert!(ts.ctx.registry.is_online(&meta.name()));
    assert!(!ts.ctx.registry.is_online(&user.name()));

    // A second quiesce instruction is not re-enqueued (idempotent per run).
    ts.master.enqueue(vec![MasterInstruction::Quiesce]);

    // The master moves the catalog region elsewhere; once nothing is
    // served, the quiesced server shuts itself down.
    ts.master
        .enqueue(vec![MasterInstruction::CloseRegionWithoutReport(
            meta.clone(),
        )]);
    let result = tokio::time::timeout(Duration::from_secs(10), ts.run)
        .await
        .expect("server stopped on its own")
        .expect("join");
    result.expect("clean shutdown");

    let quiesced_count = ts
        .master
        .all_messages()
        .iter()
        .filter(|m| matches!(m, OutboundMessage::ReportQuiesced))
        .count();
    assert_eq!(quiesced_count, 1);

    let reports = ts.master.reports();
    let last = reports.last().expect("final report");
    assert_eq!(last.first(), Some(&OutboundMessage::ReportExiting));
    // No region was left to close by the time the server exited.
    assert_eq!(last.len(), 1);
}
