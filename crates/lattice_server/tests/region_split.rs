//! Region split end to end: growth past the threshold, catalog updates,
//! and the report ordering the master depends on.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    meta_region, put, start_server, stop_and_join, test_config, user_region, wait_until,
};
use lattice_server::catalog::decode_descriptor;
use lattice_server::fs::LocalDfs;
use lattice_server::region::{COL_REGIONINFO, COL_SPLIT_A, COL_SPLIT_B};
use lattice_server::{MasterInstruction, OutboundMessage};

#[tokio::test]
async fn split_updates_catalog_then_reports_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    // Flush after a few hundred bytes, compact after every flush, split
    // once a kilobyte is on disk.
    config.region_memcache_flush_size = 512;
    config.compaction_threshold = 1;
    config.region_split_size = 1024;
    let ts = start_server(config, Arc::new(LocalDfs)).await;

    let meta = meta_region();
    let parent = user_region();
    let parent_name = parent.name();
    ts.master.enqueue(vec![
        MasterInstruction::OpenRegion(meta.clone()),
        MasterInstruction::OpenRegion(parent.clone()),
    ]);
    {
        let ctx = ts.ctx.clone();
        let meta_name = meta.name();
        let parent_name = parent_name.clone();
        wait_until(Duration::from_secs(10), move || {
            ctx.registry.is_online(&meta_name) && ctx.registry.is_online(&parent_name)
        })
        .await;
    }

    for i in 0..60 {
        let row = format!("row-{i:03}");
        let value = format!("value-{i:03}-padding-padding");
        match ts
            .service
            .batch_update(&parent_name, None, put(&row, "f:x", &value))
            .await
        {
            Ok(()) => {}
            // The split can cut over while we are still loading data.
            Err(lattice_server::RequestError::NotServingRegion(_)) => break,
            Err(err) => panic!("write failed: {err:?}"),
        }
    }

    {
        let master = ts.master.clone();
        wait_until(Duration::from_secs(20), move || {
            master
                .all_messages()
                .iter()
                .any(|m| matches!(m, OutboundMessage::ReportSplit(_)))
        })
        .await;
    }

    // Message order: REPORT_SPLIT(parent), then REPORT_OPEN for each child.
    let messages = ts.master.all_messages();
    let split_at = messages
        .iter()
        .position(|m| matches!(m, OutboundMessage::ReportSplit(_)))
        .expect("split reported");
    let OutboundMessage::ReportSplit(reported_parent) = &messages[split_at] else {
        unreachable!()
    };
    assert_eq!(reported_parent.region_id, parent.region_id);
    assert!(reported_parent.offline && reported_parent.split);
    let OutboundMessage::ReportOpen(child_a) = &messages[split_at + 1] else {
        panic!("expected child A open after split report");
    };
    let OutboundMessage::ReportOpen(child_b) = &messages[split_at + 2] else {
        panic!("expected child B open after split report");
    };

    // The children cover the parent's range in two halves.
    assert_eq!(child_a.start_key, parent.start_key);
    assert_eq!(child_a.end_key, child_b.start_key);
    assert_eq!(child_b.end_key, parent.end_key);
    assert!(!child_a.end_key.is_empty());

    // Catalog rows were durable before the report: the parent row is
    // offline+split and names both children; each child has its own row.
    let meta_name = meta.name();
    let parent_row = ts
        .service
        .get_row(&meta_name, parent_name.as_bytes(), None)
        .await
        .expect("parent catalog row");
    let cell = |col: &str| {
        parent_row
            .iter()
            .find(|(c, _)| c == col.as_bytes())
            .map(|(_, v)| v.clone())
            .expect("catalog cell")
    };
    let stored_parent = decode_descriptor(&cell(COL_REGIONINFO)).expect("parent descriptor");
    assert!(stored_parent.offline && stored_parent.split);
    let stored_a = decode_descriptor(&cell(COL_SPLIT_A)).expect("splitA descriptor");
    let stored_b = decode_descriptor(&cell(COL_SPLIT_B)).expect("splitB descriptor");
    assert_eq!(&stored_a, child_a);
    assert_eq!(&stored_b, child_b);
    for child in [child_a, child_b] {
        let row = ts
            .service
            .get_row(&meta_name, child.name().as_bytes(), None)
            .await
            .expect("child catalog row");
        let info = row
            .iter()
            .find(|(c, _)| c == COL_REGIONINFO.as_bytes())
            .expect("child regioninfo");
        assert_eq!(&decode_descriptor(&info.1).expect("child descriptor"), child);
    }

    // The parent is no longer served, and the children are not served
    // until the master assigns them.
    let err = ts
        .service
        .get(&parent_name, b"row-001", b"f:x")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        lattice_server::RequestError::NotServingRegion(_)
    ));
    assert!(!ts.ctx.registry.is_online(&child_a.name()));
    assert!(!ts.ctx.registry.is_online(&child_b.name()));

    stop_and_join(ts).await;
}
