//! Row cursor over one region.
//!
//! Scanners see the newest visible version per requested column and skip
//! rows that have nothing to show, so `next` always returns a non-empty
//! row or the end of the region.

use std::sync::Arc;

use bytes::Bytes;

use super::Region;

/// One scanned row: newest visible value per matched column.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanRow {
    pub row: Vec<u8>,
    pub cells: Vec<(Vec<u8>, Bytes)>,
}

pub struct RegionScanner {
    region: Arc<Region>,
    /// Exact `family:qualifier` entries, or whole families as `family:`.
    columns: Vec<Vec<u8>>,
    ts_max: u64,
    cursor: Vec<u8>,
    done: bool,
}

impl RegionScanner {
    pub(crate) fn new(
        region: Arc<Region>,
        columns: Vec<Vec<u8>>,
        first_row: Vec<u8>,
        ts_max: u64,
    ) -> Self {
        Self {
            region,
            columns,
            ts_max,
            cursor: first_row,
            done: false,
        }
    }

    pub fn region_name(&self) -> &str {
        self.region.name()
    }

    /// Advance to the next row with any visible data.
    pub fn next(&mut self) -> anyhow::Result<Option<ScanRow>> {
        while !self.done {
            let Some(row) = self.region.next_row_at_or_after(&self.cursor)? else {
                self.done = true;
                break;
            };
            // Restart after this row regardless of whether it matches.
            self.cursor = successor(&row);

            let visible = self.region.visible_row(&row, self.ts_max)?;
            let mut cells = Vec::new();
            for (column, versions) in visible {
                if !self.matches(&column) {
                    continue;
                }
                if let Some(newest) = versions.first() {
                    cells.push((column, newest.value.clone()));
                }
            }
            if !cells.is_empty() {
                return Ok(Some(ScanRow { row, cells }));
            }
        }
        Ok(None)
    }

    pub fn close(&mut self) {
        self.done = true;
    }

    fn matches(&self, column: &[u8]) -> bool {
        if self.columns.is_empty() {
            return true;
        }
        self.columns.iter().any(|wanted| {
            if wanted.last() == Some(&b':') {
                column.starts_with(wanted)
            } else {
                column == wanted.as_slice()
            }
        })
    }
}

/// Smallest key strictly greater than `row`.
fn successor(row: &[u8]) -> Vec<u8> {
    let mut next = row.to_vec();
    next.push(0);
    next
}
