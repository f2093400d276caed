//! Shared-filesystem seam.
//!
//! The region server only ever touches the distributed filesystem through
//! this trait: existence checks for the WAL directory, directory setup, and
//! the availability probe the watchdog runs after IO failures.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Minimal view of the shared filesystem used by the server core.
pub trait Dfs: Send + Sync + 'static {
    /// Cheap availability probe; an error means the filesystem is unusable.
    fn ping(&self) -> anyhow::Result<()>;
    fn exists(&self, path: &Path) -> anyhow::Result<bool>;
    fn mkdirs(&self, path: &Path) -> anyhow::Result<()>;
    fn delete_all(&self, path: &Path) -> anyhow::Result<()>;
}

/// Local-directory implementation backing tests and single-host deployments.
pub struct LocalDfs;

impl Dfs for LocalDfs {
    fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(path.exists())
    }

    fn mkdirs(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("create dir {}", path.display()))
    }

    fn delete_all(&self, path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("remove dir {}", path.display()))?;
        }
        Ok(())
    }
}

/// Root-relative path of this server instance's WAL directory.
pub fn wal_dir(root: &Path, ip: &str, start_code: u64, port: u16) -> PathBuf {
    root.join(format!("log_{ip}_{start_code}_{port}"))
}
