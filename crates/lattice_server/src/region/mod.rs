//! Region: one contiguous key range of a table, the unit of assignment.
//!
//! A region owns its memtable, one on-disk store per column family, and a
//! slice of the shared WAL's sequence space. The hosting server drives it
//! through the capability surface used here: flush, compact, split, close,
//! plus the read/write request paths.

mod memtable;
mod scanner;
mod store;

pub use memtable::{Cell, CellKind, Memtable};
pub use scanner::{RegionScanner, ScanRow};
pub use store::Store;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use fjall::Keyspace;
use serde::{Deserialize, Serialize};

use crate::wal::{Wal, WalEdit};

/// Catalog table locating the meta regions.
pub const ROOT_TABLE: &str = "__root__";
/// Catalog table mapping user rows to hosting servers.
pub const META_TABLE: &str = "__meta__";

/// Catalog column holding a region's serialized descriptor.
pub const COL_REGIONINFO: &str = "info:regioninfo";
/// Catalog column holding the lower split child of an offline parent.
pub const COL_SPLIT_A: &str = "info:splita";
/// Catalog column holding the upper split child of an offline parent.
pub const COL_SPLIT_B: &str = "info:splitb";

/// Timestamp ceiling meaning "newest visible".
pub const LATEST_TIMESTAMP: u64 = u64::MAX;

static REGION_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Schema of one column family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FamilySchema {
    pub name: String,
    pub max_versions: u32,
}

impl FamilySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_versions: 3,
        }
    }
}

/// Table schema: name plus column families.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub families: Vec<FamilySchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, families: Vec<FamilySchema>) -> Self {
        Self {
            name: name.into(),
            families,
        }
    }

    pub fn has_family(&self, family: &str) -> bool {
        self.families.iter().any(|f| f.name == family)
    }
}

/// Descriptor of one region: schema, key range, and catalog flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub table: TableSchema,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    /// Creation-time id, part of the region name.
    pub region_id: u64,
    pub offline: bool,
    pub split: bool,
}

impl RegionDescriptor {
    pub fn new(table: TableSchema, start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        // Creation time plus a process-local counter keeps ids unique even
        // for children minted in the same millisecond.
        let region_id = unix_ms() * 1_000 + REGION_ID_SEQ.fetch_add(1, Ordering::Relaxed) % 1_000;
        Self::with_id(table, start_key, end_key, region_id)
    }

    pub fn with_id(
        table: TableSchema,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        region_id: u64,
    ) -> Self {
        Self {
            table,
            start_key,
            end_key,
            region_id,
            offline: false,
            split: false,
        }
    }

    /// Unique region name: table, start key, creation id.
    pub fn name(&self) -> String {
        format!(
            "{},{},{}",
            self.table.name,
            hex(&self.start_key),
            self.region_id
        )
    }

    /// Filesystem/partition-safe name for on-disk layout.
    pub fn storage_name(&self) -> String {
        let table: String = self
            .table
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{table}_{}", self.region_id)
    }

    /// True for both catalog tiers (root and meta).
    pub fn is_meta_table(&self) -> bool {
        self.table.name == ROOT_TABLE || self.table.name == META_TABLE
    }

    pub fn is_root(&self) -> bool {
        self.table.name == ROOT_TABLE
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice()
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }
}

fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// One mutation of a batch update.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Put { column: Vec<u8>, value: Vec<u8> },
    Delete { column: Vec<u8> },
}

/// Row-scoped write batch applied at one timestamp.
#[derive(Clone, Debug)]
pub struct BatchUpdate {
    pub row: Vec<u8>,
    pub ops: Vec<BatchOp>,
}

/// Capability handle the region uses to ask for an on-demand flush.
pub trait FlushRequester: Send + Sync + 'static {
    fn request(&self, region: Arc<Region>);
}

/// Capability handle a splitting region drives so pending scanners can
/// finish against the retiring parent.
pub trait RegionUnavailableListener: Send + Sync + 'static {
    fn closing(&self, region_name: &str);
    fn closed(&self, region_name: &str);
}

/// Write rejected because the region is closed (or closing for a split).
#[derive(Debug, thiserror::Error)]
#[error("region {0} is closed")]
pub struct RegionClosed(pub String);

/// Region housekeeping knobs copied out of the server configuration.
#[derive(Clone, Copy, Debug)]
pub struct RegionTuning {
    pub memcache_flush_size: u64,
    pub split_size: u64,
    pub compaction_threshold: u32,
    pub max_versions: u32,
}

impl From<&crate::config::ServerConfig> for RegionTuning {
    fn from(cfg: &crate::config::ServerConfig) -> Self {
        Self {
            memcache_flush_size: cfg.region_memcache_flush_size,
            split_size: cfg.region_split_size,
            compaction_threshold: cfg.compaction_threshold,
            max_versions: cfg.max_versions,
        }
    }
}

pub struct Region {
    desc: RegionDescriptor,
    name: String,
    stores: HashMap<String, Store>,
    memtable: RwLock<Memtable>,
    memtable_bytes: AtomicU64,
    wal: Arc<Wal>,
    keyspace: Arc<Keyspace>,
    tuning: RegionTuning,
    last_flush_ms: AtomicU64,
    min_sequence_id: u64,
    /// Highest WAL sequence id applied to the memtable; the watermark a
    /// flush records so replay never skips an unflushed record.
    max_applied_seq: AtomicU64,
    flushes_since_compaction: AtomicU32,
    closed: AtomicBool,
    /// Fault-injection latch: when set, the next snapshot write fails as
    /// if the store IO had died mid-flush.
    snapshot_fault: AtomicBool,
    // Serializes writes against each other and against the flush snapshot
    // swap; never held across store IO.
    write_lock: Mutex<()>,
    flush_requester: OnceLock<Arc<dyn FlushRequester>>,
    self_ref: OnceLock<std::sync::Weak<Region>>,
}

impl Region {
    /// Open a region: load on-disk store state and replay any WAL records
    /// beyond the flush watermark. `progress` is invoked periodically so
    /// the caller can keep signalling the master during a long replay.
    pub fn open(
        keyspace: Arc<Keyspace>,
        wal: Arc<Wal>,
        desc: RegionDescriptor,
        tuning: RegionTuning,
        progress: impl Fn(),
    ) -> anyhow::Result<Arc<Region>> {
        let name = desc.name();
        let storage_name = desc.storage_name();
        let mut stores = HashMap::new();
        for family in &desc.table.families {
            let store = Store::open(keyspace.clone(), &storage_name, &family.name)?;
            stores.insert(family.name.clone(), store);
        }

        let flushed_floor = stores.values().map(Store::flushed_seq).min().unwrap_or(0);
        let mut max_seq = stores.values().map(Store::flushed_seq).max().unwrap_or(0);

        let mut memtable = Memtable::default();
        let mut memtable_bytes = 0u64;
        let entries = Wal::read_region_edits(wal.dir(), &name, flushed_floor, &progress)?;
        for (idx, entry) in entries.iter().enumerate() {
            for edit in &entry.edits {
                memtable_bytes += memtable.apply(
                    &edit.row,
                    &edit.column,
                    Cell {
                        timestamp: edit.timestamp,
                        kind: edit.kind,
                        value: Bytes::copy_from_slice(&edit.value),
                    },
                );
            }
            max_seq = max_seq.max(entry.seq);
            if idx % 256 == 255 {
                progress();
            }
        }
        if !entries.is_empty() {
            tracing::info!(region = %name, records = entries.len(), "replayed wal records");
        }

        let region = Arc::new(Region {
            name,
            desc,
            stores,
            memtable: RwLock::new(memtable),
            memtable_bytes: AtomicU64::new(memtable_bytes),
            wal,
            keyspace,
            tuning,
            last_flush_ms: AtomicU64::new(unix_ms()),
            min_sequence_id: max_seq,
            max_applied_seq: AtomicU64::new(max_seq),
            flushes_since_compaction: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            snapshot_fault: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            flush_requester: OnceLock::new(),
            self_ref: OnceLock::new(),
        });
        let _ = region.self_ref.set(Arc::downgrade(&region));
        Ok(region)
    }

    /// Wire the flush capability; done once by the hosting server.
    pub fn attach_flush_requester(&self, requester: Arc<dyn FlushRequester>) {
        let _ = self.flush_requester.set(requester);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &RegionDescriptor {
        &self.desc
    }

    /// Highest sequence id reflected in this region's durable state at
    /// open time; the hosting server advances the WAL floor past it.
    pub fn min_sequence_id(&self) -> u64 {
        self.min_sequence_id
    }

    pub fn memtable_bytes(&self) -> u64 {
        self.memtable_bytes.load(Ordering::SeqCst)
    }

    pub fn last_flush_ms(&self) -> u64 {
        self.last_flush_ms.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make the next snapshot write fail after the memtable swap, the
    /// spot where a store IO failure becomes a dropped snapshot.
    pub fn inject_snapshot_fault(&self) {
        self.snapshot_fault.store(true, Ordering::SeqCst);
    }

    fn check_row(&self, row: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.desc.contains_row(row),
            "row out of range for region {}",
            self.name
        );
        Ok(())
    }

    fn check_column(&self, column: &[u8]) -> anyhow::Result<()> {
        let family = family_of(column)?;
        anyhow::ensure!(
            self.desc.table.has_family(family),
            "unknown column family {family} in region {}",
            self.name
        );
        Ok(())
    }

    /// Apply a row-scoped batch at `timestamp`, write-ahead logged.
    pub fn batch_update(&self, timestamp: u64, batch: BatchUpdate) -> anyhow::Result<()> {
        if self.is_closed() {
            return Err(anyhow::Error::new(RegionClosed(self.name.clone())));
        }
        self.check_row(&batch.row)?;
        let ts = effective_ts(timestamp);

        let mut edits = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            match op {
                BatchOp::Put { column, value } => {
                    self.check_column(column)?;
                    edits.push(WalEdit {
                        row: batch.row.clone(),
                        column: column.clone(),
                        timestamp: ts,
                        kind: CellKind::Put,
                        value: value.clone(),
                    });
                }
                BatchOp::Delete { column } => {
                    self.check_column(column)?;
                    edits.push(WalEdit {
                        row: batch.row.clone(),
                        column: column.clone(),
                        timestamp: ts,
                        kind: CellKind::DeleteCell,
                        value: Vec::new(),
                    });
                }
            }
        }
        self.log_and_apply(edits)
    }

    /// Delete all versions of one column, or of the whole row when
    /// `column` is absent, at or below `timestamp`.
    pub fn delete_all(
        &self,
        row: Vec<u8>,
        column: Option<Vec<u8>>,
        timestamp: u64,
    ) -> anyhow::Result<()> {
        if self.is_closed() {
            return Err(anyhow::Error::new(RegionClosed(self.name.clone())));
        }
        self.check_row(&row)?;
        let ts = effective_ts(timestamp);
        let edit = match column {
            Some(column) => {
                self.check_column(&column)?;
                WalEdit {
                    row,
                    column,
                    timestamp: ts,
                    kind: CellKind::DeleteCell,
                    value: Vec::new(),
                }
            }
            None => WalEdit {
                row,
                column: Vec::new(),
                timestamp: ts,
                kind: CellKind::DeleteRow,
                value: Vec::new(),
            },
        };
        self.log_and_apply(vec![edit])
    }

    /// Delete every column of `family` at or below `timestamp`.
    pub fn delete_family(
        &self,
        row: Vec<u8>,
        family: &str,
        timestamp: u64,
    ) -> anyhow::Result<()> {
        if self.is_closed() {
            return Err(anyhow::Error::new(RegionClosed(self.name.clone())));
        }
        self.check_row(&row)?;
        anyhow::ensure!(
            self.desc.table.has_family(family),
            "unknown column family {family} in region {}",
            self.name
        );
        let edit = WalEdit {
            row,
            column: format!("{family}:").into_bytes(),
            timestamp: effective_ts(timestamp),
            kind: CellKind::DeleteFamily,
            value: Vec::new(),
        };
        self.log_and_apply(vec![edit])
    }

    fn log_and_apply(&self, edits: Vec<WalEdit>) -> anyhow::Result<()> {
        let trigger_flush;
        {
            let _write = self.write_lock.lock().expect("region write lock");
            let seq = self.wal.append(&self.name, &edits)?;
            self.max_applied_seq.fetch_max(seq, Ordering::SeqCst);
            let mut memtable = self.memtable.write().expect("memtable lock");
            let mut added = 0u64;
            for edit in &edits {
                added += memtable.apply(
                    &edit.row,
                    &edit.column,
                    Cell {
                        timestamp: edit.timestamp,
                        kind: edit.kind,
                        value: Bytes::from(edit.value.clone()),
                    },
                );
            }
            let total = self.memtable_bytes.fetch_add(added, Ordering::SeqCst) + added;
            trigger_flush = total > self.tuning.memcache_flush_size;
        }
        if trigger_flush {
            if let (Some(requester), Some(me)) = (
                self.flush_requester.get(),
                self.self_ref.get().and_then(std::sync::Weak::upgrade),
            ) {
                requester.request(me);
            }
        }
        Ok(())
    }

    /// Single-cell read: up to `versions` visible values of `column` at or
    /// below `ts_max`, newest first.
    pub fn get(
        &self,
        row: &[u8],
        column: &[u8],
        versions: u32,
        ts_max: u64,
    ) -> anyhow::Result<Vec<Bytes>> {
        self.check_row(row)?;
        self.check_column(column)?;
        let visible = self.visible_row(row, ts_max)?;
        Ok(visible
            .get(column)
            .map(|cells| {
                cells
                    .iter()
                    .take(versions.max(1) as usize)
                    .map(|c| c.value.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Whole-row read: newest visible value per column at or below `ts_max`.
    pub fn get_row(&self, row: &[u8], ts_max: u64) -> anyhow::Result<Vec<(Vec<u8>, Bytes)>> {
        self.check_row(row)?;
        let visible = self.visible_row(row, ts_max)?;
        Ok(visible
            .into_iter()
            .filter_map(|(col, cells)| cells.first().map(|c| (col, c.value.clone())))
            .collect())
    }

    /// Newest-per-column view of the greatest row at or before `row` that
    /// has any visible data.
    pub fn get_closest_row_before(
        &self,
        row: &[u8],
    ) -> anyhow::Result<Option<(Vec<u8>, Vec<(Vec<u8>, Bytes)>)>> {
        self.check_row(row)?;
        let mut candidate = Some(row.to_vec());
        while let Some(current) = candidate {
            let cells = self.get_row(&current, LATEST_TIMESTAMP)?;
            if !cells.is_empty() {
                return Ok(Some((current, cells)));
            }
            candidate = self.last_row_before(&current)?;
        }
        Ok(None)
    }

    /// Smallest row at or after `from` in either the memtable or a store.
    pub(crate) fn next_row_at_or_after(&self, from: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let mut best: Option<Vec<u8>> = None;
        if let Some(row) = self.memtable.read().expect("memtable lock").next_row(from) {
            best = Some(row);
        }
        for store in self.stores.values() {
            if let Some(row) = store.next_row(from)? {
                best = match best {
                    Some(current) if current <= row => Some(current),
                    _ => Some(row),
                };
            }
        }
        if let Some(row) = &best {
            if !self.desc.end_key.is_empty() && row.as_slice() >= self.desc.end_key.as_slice() {
                return Ok(None);
            }
        }
        Ok(best)
    }

    fn last_row_before(&self, row: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let mut best: Option<Vec<u8>> = None;
        if let Some(r) = self
            .memtable
            .read()
            .expect("memtable lock")
            .last_row_before(row)
        {
            best = Some(r);
        }
        for store in self.stores.values() {
            if let Some(r) = store.last_row_before(row)? {
                best = match best {
                    Some(current) if current >= r => Some(current),
                    _ => Some(r),
                };
            }
        }
        Ok(best)
    }

    /// Merged, delete-masked view of one row: visible puts per column,
    /// newest first.
    pub(crate) fn visible_row(
        &self,
        row: &[u8],
        ts_max: u64,
    ) -> anyhow::Result<BTreeMap<Vec<u8>, Vec<Cell>>> {
        let mut cells = self
            .memtable
            .read()
            .expect("memtable lock")
            .row_cells(row, ts_max);
        for store in self.stores.values() {
            cells.extend(store.scan_row(row, ts_max)?);
        }

        let mut row_delete_ts = 0u64;
        let mut family_deletes: HashMap<Vec<u8>, u64> = HashMap::new();
        let mut column_deletes: HashMap<Vec<u8>, u64> = HashMap::new();
        for (column, cell) in &cells {
            match cell.kind {
                CellKind::DeleteRow => row_delete_ts = row_delete_ts.max(cell.timestamp),
                CellKind::DeleteFamily => {
                    let slot = family_deletes.entry(column.clone()).or_default();
                    *slot = (*slot).max(cell.timestamp);
                }
                CellKind::DeleteCell => {
                    let slot = column_deletes.entry(column.clone()).or_default();
                    *slot = (*slot).max(cell.timestamp);
                }
                CellKind::Put => {}
            }
        }

        let mut out: BTreeMap<Vec<u8>, Vec<Cell>> = BTreeMap::new();
        for (column, cell) in cells {
            if cell.kind != CellKind::Put {
                continue;
            }
            let ts = cell.timestamp;
            if ts <= row_delete_ts {
                continue;
            }
            if column_deletes.get(&column).copied().unwrap_or(0) >= ts {
                continue;
            }
            if family_deletes
                .iter()
                .any(|(prefix, del_ts)| column.starts_with(prefix.as_slice()) && ts <= *del_ts)
            {
                continue;
            }
            out.entry(column).or_default().push(cell);
        }
        for versions in out.values_mut() {
            versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            versions.dedup_by_key(|c| c.timestamp);
        }
        out.retain(|_, versions| !versions.is_empty());
        Ok(out)
    }

    /// Open a cursor over `[first_row, end_key)` restricted to `columns`
    /// (exact `family:qualifier` or whole-family `family:` entries).
    pub fn scanner(
        self: &Arc<Self>,
        columns: Vec<Vec<u8>>,
        first_row: Vec<u8>,
        ts_max: u64,
    ) -> anyhow::Result<RegionScanner> {
        for column in &columns {
            let family = family_of(column)?;
            anyhow::ensure!(
                self.desc.table.has_family(family),
                "unknown column family {family} in region {}",
                self.name
            );
        }
        Ok(RegionScanner::new(self.clone(), columns, first_row, ts_max))
    }

    /// Flush the memtable to the stores. Returns true when enough flushes
    /// have accumulated that a compaction is warranted.
    ///
    /// Failure after the snapshot swap surfaces as [`crate::error::DroppedSnapshot`]:
    /// the buffered edits now exist only in the WAL.
    pub fn flushcache(&self) -> anyhow::Result<bool> {
        if self.is_closed() {
            return Err(anyhow::Error::new(RegionClosed(self.name.clone())));
        }
        self.flush_internal()
    }

    fn flush_internal(&self) -> anyhow::Result<bool> {
        let (snapshot, flush_seq) = {
            let _write = self.write_lock.lock().expect("region write lock");
            let mut memtable = self.memtable.write().expect("memtable lock");
            if memtable.is_empty() {
                self.last_flush_ms.store(unix_ms(), Ordering::SeqCst);
                return Ok(false);
            }
            self.memtable_bytes.store(0, Ordering::SeqCst);
            (
                std::mem::take(&mut *memtable),
                self.max_applied_seq.load(Ordering::SeqCst),
            )
        };

        if let Err(err) = self.write_snapshot(&snapshot, flush_seq) {
            return Err(anyhow::Error::new(crate::error::DroppedSnapshot {
                region: self.name.clone(),
                cause: err,
            }));
        }

        self.last_flush_ms.store(unix_ms(), Ordering::SeqCst);
        let flushes = self.flushes_since_compaction.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(region = %self.name, flush_seq, "flushed memtable");
        Ok(flushes >= self.tuning.compaction_threshold.max(1))
    }

    fn write_snapshot(&self, snapshot: &Memtable, flush_seq: u64) -> anyhow::Result<()> {
        if self.snapshot_fault.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected snapshot write failure");
        }
        let mut batch = self.keyspace.batch();
        let mut added: HashMap<String, u64> = HashMap::new();
        let mut stage_err = None;
        snapshot.for_each(|row, column, cell| {
            if stage_err.is_some() {
                return;
            }
            let family = match family_for_cell(column, cell.kind) {
                Ok(family) => family,
                Err(err) => {
                    stage_err = Some(err);
                    return;
                }
            };
            match self.stores.get(family) {
                Some(store) => {
                    store.stage_cell(&mut batch, row, column, cell);
                    *added.entry(family.to_string()).or_default() +=
                        (row.len() + column.len() + cell.value.len()) as u64;
                }
                None if cell.kind == CellKind::DeleteRow => {
                    // Row tombstones have no family; fan out to every store.
                    for store in self.stores.values() {
                        store.stage_cell(&mut batch, row, column, cell);
                    }
                }
                None => {
                    stage_err =
                        Some(anyhow::anyhow!("no store for column {:?}", column));
                }
            }
        });
        if let Some(err) = stage_err {
            return Err(err);
        }
        // Advance every store's watermark, written-to or not, so replay
        // never revisits records below this flush.
        for store in self.stores.values() {
            let bytes = store.disk_bytes() + added.get(store.family()).copied().unwrap_or(0);
            store.stage_flush_meta(&mut batch, flush_seq, bytes);
        }
        batch.commit()?;
        self.keyspace.persist(fjall::PersistMode::SyncData)?;
        for store in self.stores.values() {
            store.note_flush(flush_seq, added.get(store.family()).copied().unwrap_or(0));
        }
        Ok(())
    }

    /// Merge store files and reclaim masked data. Returns true when the
    /// region has grown past the split threshold and should be split.
    pub fn compact_stores(&self) -> anyhow::Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let mut reclaimed = 0u64;
        for store in self.stores.values() {
            reclaimed += store.compact(self.tuning.max_versions)?;
        }
        self.flushes_since_compaction.store(0, Ordering::SeqCst);
        let size: u64 =
            self.stores.values().map(Store::disk_bytes).sum::<u64>() + self.memtable_bytes();
        if reclaimed > 0 {
            tracing::debug!(region = %self.name, reclaimed, size, "compacted stores");
        }
        Ok(size > self.tuning.split_size)
    }

    /// Split into two children around the store midpoint, or return `None`
    /// when there is no usable split point. The parent ends up closed; the
    /// children are not opened for serving.
    pub fn split(
        &self,
        listener: &dyn RegionUnavailableListener,
    ) -> anyhow::Result<Option<(RegionDescriptor, RegionDescriptor)>> {
        if self.is_closed() {
            return Ok(None);
        }
        self.flush_internal()?;
        let Some(split_key) = self.mid_row()? else {
            return Ok(None);
        };
        if split_key.as_slice() <= self.desc.start_key.as_slice()
            || (!self.desc.end_key.is_empty()
                && split_key.as_slice() >= self.desc.end_key.as_slice())
        {
            return Ok(None);
        }

        listener.closing(&self.name);
        // New writes are refused from here on; drain the last ones.
        self.closed.store(true, Ordering::SeqCst);
        self.flush_internal()?;

        let child_a = RegionDescriptor::new(
            self.desc.table.clone(),
            self.desc.start_key.clone(),
            split_key.clone(),
        );
        let child_b = RegionDescriptor::new(
            self.desc.table.clone(),
            split_key.clone(),
            self.desc.end_key.clone(),
        );

        for family in &self.desc.table.families {
            let parent = self
                .stores
                .get(&family.name)
                .context("store missing during split")?;
            let left =
                Store::open(self.keyspace.clone(), &child_a.storage_name(), &family.name)?;
            let right =
                Store::open(self.keyspace.clone(), &child_b.storage_name(), &family.name)?;
            parent.copy_split(&split_key, &left, &right)?;
        }
        self.keyspace.persist(fjall::PersistMode::SyncData)?;

        listener.closed(&self.name);
        tracing::info!(
            parent = %self.name,
            child_a = %child_a.name(),
            child_b = %child_b.name(),
            split_key = %String::from_utf8_lossy(&split_key),
            "region split complete"
        );
        Ok(Some((child_a, child_b)))
    }

    /// Middle row of the largest store, used as the split point.
    fn mid_row(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(store) = self
            .stores
            .values()
            .max_by_key(|s| s.disk_bytes())
        else {
            return Ok(None);
        };
        let mut rows = Vec::new();
        store.for_each_cell(|row, _, _| {
            if rows.last().map(|r: &Vec<u8>| r.as_slice()) != Some(row) {
                rows.push(row.to_vec());
            }
            Ok(())
        })?;
        if rows.len() < 2 {
            return Ok(None);
        }
        Ok(Some(rows[rows.len() / 2].clone()))
    }

    /// Close the region. Unless aborting, buffered edits are flushed first.
    pub fn close(&self, abort: bool) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !abort {
            self.flush_internal()?;
        }
        tracing::debug!(region = %self.name, abort, "closed region");
        Ok(())
    }
}

fn effective_ts(requested: u64) -> u64 {
    if requested == LATEST_TIMESTAMP || requested == 0 {
        unix_ms()
    } else {
        requested
    }
}

/// Family name of a `family:qualifier` column reference.
pub fn family_of(column: &[u8]) -> anyhow::Result<&str> {
    let idx = column
        .iter()
        .position(|&b| b == b':')
        .context("column reference lacks a family delimiter")?;
    std::str::from_utf8(&column[..idx]).context("column family is not utf-8")
}

fn family_for_cell(column: &[u8], kind: CellKind) -> anyhow::Result<&str> {
    if kind == CellKind::DeleteRow {
        // Row tombstones carry an empty column.
        return Ok("");
    }
    family_of(column)
}
