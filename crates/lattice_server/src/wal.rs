//! Shared write-ahead log.
//!
//! One WAL per server instance, shared by every hosted region. Segment
//! files hold length-prefixed CRC32-framed records; each record is one
//! appended edit batch with a globally ordered sequence id. Rolling is
//! requested through [`RollSignal`] when the live segment accumulates too
//! many entries and performed by the log-roller task.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;
use tokio::sync::Notify;

use crate::region::CellKind;

/// One mutation recorded in (and replayed from) the log.
#[derive(Clone, Debug, PartialEq)]
pub struct WalEdit {
    pub row: Vec<u8>,
    pub column: Vec<u8>,
    pub timestamp: u64,
    pub kind: CellKind,
    pub value: Vec<u8>,
}

/// A replayed record: the owning region, its sequence id, and the edits.
#[derive(Clone, Debug)]
pub struct WalEntry {
    pub region: String,
    pub seq: u64,
    pub edits: Vec<WalEdit>,
}

/// Roll-request handle shared between the WAL and the log-roller task.
#[derive(Default)]
pub struct RollSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl RollSignal {
    pub fn request_roll(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

struct Segment {
    writer: BufWriter<File>,
    index: u64,
}

/// Append-only log shared by all regions of one server instance.
pub struct Wal {
    dir: PathBuf,
    segment: Mutex<Option<Segment>>,
    next_seq: AtomicU64,
    segment_entries: AtomicU64,
    max_entries: u64,
    roll: std::sync::Arc<RollSignal>,
}

impl Wal {
    /// Create the log directory and its first segment. The caller is
    /// responsible for having rejected a pre-existing directory.
    pub fn create(
        dir: PathBuf,
        max_entries: u64,
        roll: std::sync::Arc<RollSignal>,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir).context("create wal dir")?;
        let writer = open_segment(&dir, 1)?;
        Ok(Self {
            dir,
            segment: Mutex::new(Some(Segment { writer, index: 1 })),
            next_seq: AtomicU64::new(1),
            segment_entries: AtomicU64::new(0),
            max_entries: max_entries.max(1),
            roll,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Highest sequence id handed out so far.
    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Raise the sequence floor so ids issued from now on exceed any id a
    /// newly opened region has already seen.
    pub fn advance_seq(&self, floor: u64) {
        self.next_seq.fetch_max(floor, Ordering::SeqCst);
    }

    /// Append one edit batch for `region`, returning its sequence id.
    pub fn append(&self, region: &str, edits: &[WalEdit]) -> anyhow::Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let payload = encode_entry(region, seq, edits);
        {
            let mut guard = self.segment.lock().expect("wal segment lock");
            let segment = guard.as_mut().context("wal is closed")?;
            write_record(&mut segment.writer, &payload)?;
            segment.writer.flush()?;
        }
        let entries = self.segment_entries.fetch_add(1, Ordering::Relaxed) + 1;
        if entries >= self.max_entries {
            self.roll.request_roll();
        }
        Ok(seq)
    }

    /// Rotate to a fresh segment. Called from the log-roller task only.
    pub fn roll(&self) -> anyhow::Result<u64> {
        let mut guard = self.segment.lock().expect("wal segment lock");
        let segment = guard.as_mut().context("wal is closed")?;
        segment.writer.flush()?;
        segment.writer.get_ref().sync_all()?;
        let next = segment.index + 1;
        let entries = self.segment_entries.swap(0, Ordering::Relaxed);
        *segment = Segment {
            writer: open_segment(&self.dir, next)?,
            index: next,
        };
        tracing::info!(segment = next, rotated_entries = entries, "rolled wal segment");
        Ok(next)
    }

    /// Flush, sync, and stop accepting appends.
    pub fn close(&self) -> anyhow::Result<()> {
        let mut guard = self.segment.lock().expect("wal segment lock");
        if let Some(mut segment) = guard.take() {
            segment.writer.flush()?;
            segment.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Close and remove the whole log directory.
    pub fn close_and_delete(&self) -> anyhow::Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir).context("remove wal dir")?;
        Ok(())
    }

    /// Read every record for `region` with a sequence id beyond
    /// `after_seq`, across all segments in order. `progress` is invoked
    /// once per scanned segment so a long replay can keep signalling.
    pub fn read_region_edits(
        dir: &Path,
        region: &str,
        after_seq: u64,
        mut progress: impl FnMut(),
    ) -> anyhow::Result<Vec<WalEntry>> {
        let mut segments: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        segments.sort();

        let mut out = Vec::new();
        for path in segments {
            progress();
            for entry in read_segment(&path)? {
                if entry.region == region && entry.seq > after_seq {
                    out.push(entry);
                }
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("seg_{index:08}.log"))
}

fn open_segment(dir: &Path, index: u64) -> anyhow::Result<BufWriter<File>> {
    let path = segment_path(dir, index);
    let file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open wal segment {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn write_record(writer: &mut BufWriter<File>, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&checksum.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn read_segment(path: &Path) -> anyhow::Result<Vec<WalEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected, "wal checksum mismatch");
        entries.push(decode_entry(&payload)?);
    }
    Ok(entries)
}

fn encode_entry(region: &str, seq: u64, edits: &[WalEdit]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + region.len() + 8 + 4);
    out.extend_from_slice(&(region.len() as u32).to_be_bytes());
    out.extend_from_slice(region.as_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(edits.len() as u32).to_be_bytes());
    for edit in edits {
        put_slice(&mut out, &edit.row);
        put_slice(&mut out, &edit.column);
        out.extend_from_slice(&edit.timestamp.to_be_bytes());
        out.push(edit.kind.as_u8());
        put_slice(&mut out, &edit.value);
    }
    out
}

fn decode_entry(buf: &[u8]) -> anyhow::Result<WalEntry> {
    let mut offset = 0usize;
    let region_len = read_u32_at(buf, &mut offset)? as usize;
    anyhow::ensure!(offset + region_len <= buf.len(), "wal entry short region");
    let region = String::from_utf8(buf[offset..offset + region_len].to_vec())
        .context("wal entry region name")?;
    offset += region_len;
    let seq = read_u64_at(buf, &mut offset)?;
    let edit_count = read_u32_at(buf, &mut offset)? as usize;
    let mut edits = Vec::with_capacity(edit_count);
    for _ in 0..edit_count {
        let row = read_slice_at(buf, &mut offset)?;
        let column = read_slice_at(buf, &mut offset)?;
        let timestamp = read_u64_at(buf, &mut offset)?;
        anyhow::ensure!(offset < buf.len(), "wal entry short kind");
        let kind = CellKind::from_u8(buf[offset]).context("wal entry cell kind")?;
        offset += 1;
        let value = read_slice_at(buf, &mut offset)?;
        edits.push(WalEdit {
            row,
            column,
            timestamp,
            kind,
            value,
        });
    }
    Ok(WalEntry { region, seq, edits })
}

fn put_slice(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

fn read_slice_at(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32_at(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "wal entry short slice");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "wal entry short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "wal entry short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn edit(row: &str, col: &str, value: &str) -> WalEdit {
        WalEdit {
            row: row.as_bytes().to_vec(),
            column: col.as_bytes().to_vec(),
            timestamp: 7,
            kind: CellKind::Put,
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn entries_round_trip_through_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wal_dir = dir.path().join("wal");
        let wal = Wal::create(wal_dir.clone(), 1_000, Arc::new(RollSignal::default()))
            .expect("create wal");

        let s1 = wal.append("r1", &[edit("a", "f:x", "1")]).expect("append");
        let s2 = wal.append("r2", &[edit("b", "f:x", "2")]).expect("append");
        let s3 = wal.append("r1", &[edit("c", "f:y", "3")]).expect("append");
        assert!(s1 < s2 && s2 < s3);
        wal.close().expect("close");

        let mut segments_seen = 0;
        let replayed =
            Wal::read_region_edits(&wal_dir, "r1", s1, || segments_seen += 1).expect("replay");
        assert_eq!(segments_seen, 1);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].seq, s3);
        assert_eq!(replayed[0].edits[0].value, b"3".to_vec());
    }

    #[test]
    fn roll_is_requested_at_the_entry_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signal = Arc::new(RollSignal::default());
        let wal =
            Wal::create(dir.path().join("wal"), 2, signal.clone()).expect("create wal");
        wal.append("r", &[edit("a", "f:x", "1")]).expect("append");
        assert!(!signal.is_requested());
        wal.append("r", &[edit("b", "f:x", "2")]).expect("append");
        assert!(signal.is_requested());

        wal.roll().expect("roll");
        signal.clear();
        wal.append("r", &[edit("c", "f:x", "3")]).expect("append");
        let entries = Wal::read_region_edits(wal.dir(), "r", 0, || {}).expect("replay");
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn append_after_close_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wal = Wal::create(dir.path().join("wal"), 10, Arc::new(RollSignal::default()))
            .expect("create wal");
        wal.close().expect("close");
        assert!(wal.append("r", &[edit("a", "f:x", "1")]).is_err());
    }
}
