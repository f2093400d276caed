//! On-disk column-family store backed by one fjall partition.
//!
//! Data keys are order-preserving composites of row, column, and inverted
//! timestamp so newer versions of a column scan first. Flush watermarks and
//! the approximate disk footprint are kept in meta keys inside the same
//! partition so they travel with the data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions};

use super::memtable::{Cell, CellKind};

const DATA_PREFIX: u8 = b'd';
const META_FLUSHED_SEQ: &[u8] = b"m:flushed_seq";
const META_FLUSHED_BYTES: &[u8] = b"m:flushed_bytes";

/// How many staged mutations a bulk copy commits per batch.
const COPY_CHUNK: usize = 10_000;

pub struct Store {
    family: String,
    keyspace: Arc<Keyspace>,
    partition: fjall::PartitionHandle,
    flushed_seq: AtomicU64,
    flushed_bytes: AtomicU64,
}

impl Store {
    /// Open (or create) the partition for `family` of the region with the
    /// given storage name.
    pub fn open(
        keyspace: Arc<Keyspace>,
        region_storage_name: &str,
        family: &str,
    ) -> anyhow::Result<Self> {
        let name = format!("cf_{region_storage_name}_{family}");
        let partition = keyspace
            .open_partition(&name, PartitionCreateOptions::default())
            .with_context(|| format!("open store partition {name}"))?;
        let flushed_seq = read_meta_u64(&partition, META_FLUSHED_SEQ)?;
        let flushed_bytes = read_meta_u64(&partition, META_FLUSHED_BYTES)?;
        Ok(Self {
            family: family.to_string(),
            keyspace,
            partition,
            flushed_seq: AtomicU64::new(flushed_seq),
            flushed_bytes: AtomicU64::new(flushed_bytes),
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// Sequence id through which this store's contents are durable.
    pub fn flushed_seq(&self) -> u64 {
        self.flushed_seq.load(Ordering::SeqCst)
    }

    /// Approximate on-disk footprint of flushed data.
    pub fn disk_bytes(&self) -> u64 {
        self.flushed_bytes.load(Ordering::SeqCst)
    }

    /// Stage one cell into `batch`.
    pub fn stage_cell(&self, batch: &mut fjall::Batch, row: &[u8], column: &[u8], cell: &Cell) {
        batch.insert(
            &self.partition,
            encode_data_key(row, column, cell.timestamp, cell.kind),
            cell.value.to_vec(),
        );
    }

    /// Stage the flush watermark and footprint meta keys into `batch`.
    pub fn stage_flush_meta(&self, batch: &mut fjall::Batch, seq: u64, bytes: u64) {
        batch.insert(&self.partition, META_FLUSHED_SEQ.to_vec(), seq.to_be_bytes().to_vec());
        batch.insert(
            &self.partition,
            META_FLUSHED_BYTES.to_vec(),
            bytes.to_be_bytes().to_vec(),
        );
    }

    /// Record a committed flush in the in-memory counters.
    pub fn note_flush(&self, seq: u64, added_bytes: u64) {
        self.flushed_seq.fetch_max(seq, Ordering::SeqCst);
        self.flushed_bytes.fetch_add(added_bytes, Ordering::SeqCst);
    }

    /// Every cell of `row` at or below `ts_max`, newest first per column.
    pub fn scan_row(&self, row: &[u8], ts_max: u64) -> anyhow::Result<Vec<(Vec<u8>, Cell)>> {
        let prefix = encode_row_prefix(row);
        let mut out = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (key, value) = item?;
            let (_, column, timestamp, kind) =
                decode_data_key(&key).context("corrupt store key")?;
            if timestamp <= ts_max {
                out.push((
                    column,
                    Cell {
                        timestamp,
                        kind,
                        value: Bytes::copy_from_slice(&value),
                    },
                ));
            }
        }
        Ok(out)
    }

    /// Smallest stored row at or after `from`.
    pub fn next_row(&self, from: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let start = encode_row_prefix(from);
        for item in self.partition.range(start..) {
            let (key, _) = item?;
            if key.first() != Some(&DATA_PREFIX) {
                return Ok(None);
            }
            let (row, _, _, _) = decode_data_key(&key).context("corrupt store key")?;
            return Ok(Some(row));
        }
        Ok(None)
    }

    /// Greatest stored row strictly before `row`.
    pub fn last_row_before(&self, row: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let end = encode_row_prefix(row);
        for item in self.partition.range(vec![DATA_PREFIX]..end).rev() {
            let (key, _) = item?;
            let (found, _, _, _) = decode_data_key(&key).context("corrupt store key")?;
            return Ok(Some(found));
        }
        Ok(None)
    }

    /// Visit every stored cell in row/column/newest-first order.
    pub fn for_each_cell(
        &self,
        mut visit: impl FnMut(&[u8], &[u8], &Cell) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for item in self.partition.prefix(vec![DATA_PREFIX]) {
            let (key, value) = item?;
            let (row, column, timestamp, kind) =
                decode_data_key(&key).context("corrupt store key")?;
            let cell = Cell {
                timestamp,
                kind,
                value: Bytes::copy_from_slice(&value),
            };
            visit(&row, &column, &cell)?;
        }
        Ok(())
    }

    /// Merge pass: drop versions beyond `max_versions`, apply and then
    /// discard delete markers. Returns the approximate bytes reclaimed.
    pub fn compact(&self, max_versions: u32) -> anyhow::Result<u64> {
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        let mut reclaimed = 0u64;

        let mut current_row: Option<Vec<u8>> = None;
        let mut row_delete_ts = 0u64;
        // Family markers sort at the head of their family's columns (the
        // marker column is the bare `family:` prefix), so tracking them as
        // (prefix, ts) pairs covers every column that follows in this row.
        let mut family_deletes: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut current_column: Option<Vec<u8>> = None;
        let mut column_delete_ts = 0u64;
        let mut kept_versions = 0u32;

        for item in self.partition.prefix(vec![DATA_PREFIX]) {
            let (key, value) = item?;
            let (row, column, timestamp, kind) =
                decode_data_key(&key).context("corrupt store key")?;

            if current_row.as_deref() != Some(row.as_slice()) {
                current_row = Some(row.clone());
                row_delete_ts = 0;
                family_deletes.clear();
                current_column = None;
            }
            if current_column.as_deref() != Some(column.as_slice()) {
                current_column = Some(column.clone());
                column_delete_ts = 0;
                kept_versions = 0;
            }

            let doom = match kind {
                CellKind::DeleteRow => {
                    row_delete_ts = row_delete_ts.max(timestamp);
                    true
                }
                CellKind::DeleteFamily => {
                    family_deletes.push((column.clone(), timestamp));
                    true
                }
                CellKind::DeleteCell => {
                    column_delete_ts = column_delete_ts.max(timestamp);
                    true
                }
                CellKind::Put => {
                    let masked = timestamp <= row_delete_ts
                        || timestamp <= column_delete_ts
                        || family_deletes
                            .iter()
                            .any(|(prefix, ts)| column.starts_with(prefix) && timestamp <= *ts);
                    if masked {
                        true
                    } else {
                        kept_versions += 1;
                        kept_versions > max_versions.max(1)
                    }
                }
            };
            if doom {
                reclaimed += (key.len() + value.len()) as u64;
                doomed.push(key.to_vec());
            }
        }

        let mut batch = self.keyspace.batch();
        let mut staged = 0usize;
        for key in doomed {
            batch.remove(&self.partition, key);
            staged += 1;
            if staged >= COPY_CHUNK {
                batch.commit()?;
                batch = self.keyspace.batch();
                staged = 0;
            }
        }
        let new_bytes = self.flushed_bytes.load(Ordering::SeqCst).saturating_sub(reclaimed);
        batch.insert(
            &self.partition,
            META_FLUSHED_BYTES.to_vec(),
            new_bytes.to_be_bytes().to_vec(),
        );
        batch.commit()?;
        self.flushed_bytes.store(new_bytes, Ordering::SeqCst);
        Ok(reclaimed)
    }

    /// Copy this store's cells into two child stores around `split_key`
    /// (rows below go left, at-or-above go right), carrying the flush
    /// watermark along.
    pub fn copy_split(&self, split_key: &[u8], left: &Store, right: &Store) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        let mut staged = 0usize;
        let mut left_bytes = 0u64;
        let mut right_bytes = 0u64;

        for item in self.partition.prefix(vec![DATA_PREFIX]) {
            let (key, value) = item?;
            let (row, _, _, _) = decode_data_key(&key).context("corrupt store key")?;
            if row.as_slice() < split_key {
                batch.insert(&left.partition, key.to_vec(), value.to_vec());
                left_bytes += (key.len() + value.len()) as u64;
            } else {
                batch.insert(&right.partition, key.to_vec(), value.to_vec());
                right_bytes += (key.len() + value.len()) as u64;
            }
            staged += 1;
            if staged >= COPY_CHUNK {
                batch.commit()?;
                batch = self.keyspace.batch();
                staged = 0;
            }
        }

        let seq = self.flushed_seq();
        left.stage_flush_meta(&mut batch, seq, left_bytes);
        right.stage_flush_meta(&mut batch, seq, right_bytes);
        batch.commit()?;
        left.note_flush(seq, left_bytes);
        right.note_flush(seq, right_bytes);
        Ok(())
    }
}

fn read_meta_u64(partition: &fjall::PartitionHandle, key: &[u8]) -> anyhow::Result<u64> {
    match partition.get(key)? {
        Some(raw) if raw.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw);
            Ok(u64::from_be_bytes(buf))
        }
        Some(_) => anyhow::bail!("corrupt store meta value"),
        None => Ok(0),
    }
}

/// Escape so arbitrary bytes compare correctly under the `\x00\x00`
/// terminator: every 0x00 becomes 0x00 0x01.
fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        out.push(b);
        if b == 0 {
            out.push(1);
        }
    }
    out.push(0);
    out.push(0);
}

fn unescape(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == 0 {
            match data.get(i + 1) {
                Some(1) => {
                    out.push(0);
                    i += 2;
                }
                Some(0) => return Some((out, i + 2)),
                _ => return None,
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    None
}

fn encode_row_prefix(row: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(row.len() + 3);
    out.push(DATA_PREFIX);
    escape_into(&mut out, row);
    out
}

fn encode_data_key(row: &[u8], column: &[u8], timestamp: u64, kind: CellKind) -> Vec<u8> {
    let mut out = Vec::with_capacity(row.len() + column.len() + 14);
    out.push(DATA_PREFIX);
    escape_into(&mut out, row);
    escape_into(&mut out, column);
    out.extend_from_slice(&(!timestamp).to_be_bytes());
    out.push(kind.as_u8());
    out
}

fn decode_data_key(key: &[u8]) -> Option<(Vec<u8>, Vec<u8>, u64, CellKind)> {
    if key.first() != Some(&DATA_PREFIX) {
        return None;
    }
    let rest = &key[1..];
    let (row, used) = unescape(rest)?;
    let rest = &rest[used..];
    let (column, used) = unescape(rest)?;
    let rest = &rest[used..];
    if rest.len() != 9 {
        return None;
    }
    let mut ts_buf = [0u8; 8];
    ts_buf.copy_from_slice(&rest[..8]);
    let timestamp = !u64::from_be_bytes(ts_buf);
    let kind = CellKind::from_u8(rest[8])?;
    Some((row, column, timestamp, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_keys_round_trip_with_embedded_zeroes() {
        let key = encode_data_key(b"ro\x00w", b"f:\x00q", 42, CellKind::Put);
        let (row, column, ts, kind) = decode_data_key(&key).expect("decode");
        assert_eq!(row, b"ro\x00w".to_vec());
        assert_eq!(column, b"f:\x00q".to_vec());
        assert_eq!(ts, 42);
        assert_eq!(kind, CellKind::Put);
    }

    #[test]
    fn newer_timestamps_sort_first_within_a_column() {
        let newer = encode_data_key(b"r", b"f:x", 10, CellKind::Put);
        let older = encode_data_key(b"r", b"f:x", 5, CellKind::Put);
        assert!(newer < older);
    }

    #[test]
    fn rows_sort_lexicographically() {
        let a = encode_data_key(b"a", b"f:x", 1, CellKind::Put);
        let ab = encode_data_key(b"ab", b"f:x", 1, CellKind::Put);
        let b = encode_data_key(b"b", b"f:x", 1, CellKind::Put);
        assert!(a < ab && ab < b);
    }
}
