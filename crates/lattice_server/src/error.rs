//! Typed errors surfaced to clients and the request front end.
//!
//! Background workers use `anyhow` internally; everything a client can
//! observe over the request surface is one of these variants.

use thiserror::Error;

/// Errors returned by the region-server request surface.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The named region is not hosted by this server.
    #[error("not serving region {0}")]
    NotServingRegion(String),

    /// The scanner id is unknown or its lease has expired.
    #[error("unknown scanner {0}")]
    UnknownScanner(u64),

    /// The server has been stopped or aborted.
    #[error("server not running")]
    ServerNotRunning,

    /// The filesystem watchdog has declared the filesystem dead.
    #[error("file system not available")]
    FilesystemUnavailable,

    /// Malformed request arguments.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An IO error from the region or store layer, already run past the
    /// filesystem watchdog.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Fatal startup condition: the WAL directory for this server identity
/// already exists, so another instance is (or recently was) live.
#[derive(Debug, Error)]
#[error("region server already running at {address}: log dir {log_dir} exists")]
pub struct RegionServerRunning {
    pub address: String,
    pub log_dir: String,
}

/// A flush failed after the memtable snapshot was taken. The snapshot is
/// gone and only a WAL replay can recover it, which requires a restart.
#[derive(Debug, Error)]
#[error("dropped memtable snapshot for region {region}: {cause}")]
pub struct DroppedSnapshot {
    pub region: String,
    pub cause: anyhow::Error,
}
