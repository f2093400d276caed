//! WAL rotation task.
//!
//! The WAL requests a roll when its live segment fills up; this task
//! performs it under the process-wide roller lock, which is also taken by
//! the close-and-recreate sequence of a master-driven restart.

use std::sync::Arc;

use crate::server::ServerContext;

pub async fn run(ctx: Arc<ServerContext>) {
    let wake = ctx.config().wake_frequency();
    while !ctx.lifecycle.stop_requested() {
        tokio::select! {
            _ = ctx.roll_signal.notified() => {}
            _ = tokio::time::sleep(wake) => {}
        }
        if ctx.lifecycle.stop_requested() {
            break;
        }
        if !ctx.roll_signal.is_requested() {
            continue;
        }
        let _roller = ctx.roller_lock.lock().await;
        if let Some(wal) = ctx.current_wal() {
            if let Err(err) = wal.roll() {
                tracing::error!(error = ?err, "log rolling failed");
                ctx.check_file_system();
            }
        }
        ctx.roll_signal.clear();
    }
    tracing::info!("log roller exiting");
}
