//! Client request surface.
//!
//! Every method follows the same shape: admit under the handler
//! semaphore, verify the server is open, count the request, resolve the
//! region, and run any IO failure past the filesystem watchdog before
//! surfacing it. Writes additionally pass global memory admission before
//! touching the region. The wire transport sits above this object.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::error::RequestError;
use crate::flusher;
use crate::region::{
    BatchUpdate, RegionClosed, RegionDescriptor, ScanRow, LATEST_TIMESTAMP,
};
use crate::server::ServerContext;

/// Version of the client protocol this server speaks.
pub const PROTOCOL_VERSION: u64 = 3;
/// Protocol name clients ask for in `get_protocol_version`.
pub const PROTOCOL_NAME: &str = "lattice.region";

#[derive(Clone)]
pub struct RegionService {
    ctx: Arc<ServerContext>,
    handlers: Arc<Semaphore>,
}

impl RegionService {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let handlers = Arc::new(Semaphore::new(ctx.config().handler_count.max(1)));
        Self { ctx, handlers }
    }

    async fn admit(&self) -> Result<tokio::sync::OwnedSemaphorePermit, RequestError> {
        self.handlers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RequestError::ServerNotRunning)
    }

    fn enter(&self) -> Result<(), RequestError> {
        self.ctx.check_open()?;
        self.ctx.request_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Probe the filesystem, then hand the error back to the client.
    fn surface(&self, err: anyhow::Error) -> RequestError {
        if err.is::<RegionClosed>() {
            return RequestError::NotServingRegion(err.to_string());
        }
        self.ctx.check_file_system();
        RequestError::Io(err)
    }

    pub async fn get_region_info(
        &self,
        region: &str,
    ) -> Result<RegionDescriptor, RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        Ok(self.ctx.region(region, false)?.descriptor().clone())
    }

    /// Newest visible value of one cell.
    pub async fn get(
        &self,
        region: &str,
        row: &[u8],
        column: &[u8],
    ) -> Result<Option<Bytes>, RequestError> {
        Ok(self
            .get_versions(region, row, column, 1, LATEST_TIMESTAMP)
            .await?
            .into_iter()
            .next())
    }

    /// Up to `versions` visible values of one cell at or below `ts_max`,
    /// newest first.
    pub async fn get_versions(
        &self,
        region: &str,
        row: &[u8],
        column: &[u8],
        versions: u32,
        ts_max: u64,
    ) -> Result<Vec<Bytes>, RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let region = self.ctx.region(region, false)?;
        region
            .get(row, column, versions, ts_max)
            .map_err(|err| self.surface(err))
    }

    /// Newest visible value per column of one row.
    pub async fn get_row(
        &self,
        region: &str,
        row: &[u8],
        ts_max: Option<u64>,
    ) -> Result<Vec<(Vec<u8>, Bytes)>, RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let region = self.ctx.region(region, false)?;
        region
            .get_row(row, ts_max.unwrap_or(LATEST_TIMESTAMP))
            .map_err(|err| self.surface(err))
    }

    /// The greatest row at or before `row` that has visible data.
    pub async fn get_closest_row_before(
        &self,
        region: &str,
        row: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<(Vec<u8>, Bytes)>)>, RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let region = self.ctx.region(region, false)?;
        region
            .get_closest_row_before(row)
            .map_err(|err| self.surface(err))
    }

    /// Row-scoped write batch at the caller's timestamp, or this server's
    /// clock when none is given.
    pub async fn batch_update(
        &self,
        region: &str,
        timestamp: Option<u64>,
        update: BatchUpdate,
    ) -> Result<(), RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let region = self.ctx.region(region, false)?;
        flusher::reclaim_memcache_memory(&self.ctx).await;
        region
            .batch_update(timestamp.unwrap_or(0), update)
            .map_err(|err| self.surface(err))
    }

    /// Delete all versions of a column (or the whole row) at or below `ts`.
    pub async fn delete_all(
        &self,
        region: &str,
        row: &[u8],
        column: Option<&[u8]>,
        ts: u64,
    ) -> Result<(), RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let region = self.ctx.region(region, false)?;
        flusher::reclaim_memcache_memory(&self.ctx).await;
        region
            .delete_all(row.to_vec(), column.map(<[u8]>::to_vec), ts)
            .map_err(|err| self.surface(err))
    }

    /// Delete every column of a family at or below `ts`.
    pub async fn delete_family(
        &self,
        region: &str,
        row: &[u8],
        family: &str,
        ts: u64,
    ) -> Result<(), RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let region = self.ctx.region(region, false)?;
        flusher::reclaim_memcache_memory(&self.ctx).await;
        region
            .delete_family(row.to_vec(), family, ts)
            .map_err(|err| self.surface(err))
    }

    /// Open a cursor and lease it. Returns the scanner's wire id.
    pub async fn open_scanner(
        &self,
        region: &str,
        columns: Vec<Vec<u8>>,
        first_row: Vec<u8>,
        ts_max: u64,
    ) -> Result<u64, RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        if region.is_empty() {
            return Err(RequestError::InvalidRequest("region name is empty".into()));
        }
        if columns.is_empty() {
            return Err(RequestError::InvalidRequest(
                "columns to scan are empty".into(),
            ));
        }
        if first_row.is_empty() {
            return Err(RequestError::InvalidRequest(
                "first row for scanner is empty".into(),
            ));
        }
        let region = self.ctx.region(region, false)?;
        let scanner = region
            .scanner(columns, first_row, ts_max)
            .map_err(|err| self.surface(err))?;

        let id = rand::random::<u64>();
        // A collision with a live scanner is refused, never overwritten.
        if !self.ctx.scanners.insert(id, scanner) {
            return Err(RequestError::Io(anyhow::anyhow!(
                "scanner id collision for {id}"
            )));
        }
        if let Err(err) = self
            .ctx
            .leases
            .create(id, self.ctx.scanners.expiry_listener(id))
        {
            self.ctx.scanners.remove(id);
            return Err(RequestError::Io(err));
        }
        Ok(id)
    }

    /// Next non-empty row of an open scanner; renews its lease.
    pub async fn next(&self, scanner_id: u64) -> Result<Option<ScanRow>, RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let Some(scanner) = self.ctx.scanners.get(scanner_id) else {
            return Err(RequestError::UnknownScanner(scanner_id));
        };
        if !self.ctx.leases.renew(scanner_id) {
            // Lease raced to expiry between lookup and renewal.
            self.ctx.scanners.remove(scanner_id);
            return Err(RequestError::UnknownScanner(scanner_id));
        }
        let mut scanner = scanner.lock().expect("scanner");
        scanner.next().map_err(|err| self.surface(err))
    }

    /// Close a scanner and cancel its lease.
    pub async fn close_scanner(&self, scanner_id: u64) -> Result<(), RequestError> {
        let _permit = self.admit().await?;
        self.enter()?;
        let Some(scanner) = self.ctx.scanners.remove(scanner_id) else {
            return Err(RequestError::UnknownScanner(scanner_id));
        };
        scanner.lock().expect("scanner").close();
        self.ctx.leases.cancel(scanner_id);
        Ok(())
    }

    pub fn get_protocol_version(&self, protocol: &str) -> Result<u64, RequestError> {
        if protocol == PROTOCOL_NAME {
            Ok(PROTOCOL_VERSION)
        } else {
            Err(RequestError::InvalidRequest(format!(
                "unknown protocol {protocol}"
            )))
        }
    }
}
