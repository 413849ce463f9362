//! Ordered range iteration over one table.
//!
//! The iterator walks data blocks through the index, decodes one block
//! at a time, and yields the entries falling inside the requested range.
//! Only a single decoded block is resident at any moment, so scans over
//! large tables stay memory-bounded.

use std::collections::VecDeque;

use crate::engine::KeyRange;

use super::{SsTable, TableEntry, TableError};

/// Streaming cursor over `[range.start, range.end]` of one table.
///
/// Yields raw versioned entries (tombstones included) in key order;
/// cross-table visibility is resolved by the merge layer above. Block
/// decode failures end the iteration after surfacing one `Err` item.
pub struct TableIter<'a> {
    table: &'a SsTable,
    range: KeyRange,
    /// Index positions still to visit.
    next_block: usize,
    end_block: usize,
    /// Entries of the currently decoded block.
    current: VecDeque<TableEntry>,
    failed: bool,
}

impl<'a> TableIter<'a> {
    pub(crate) fn new(table: &'a SsTable, range: KeyRange) -> Result<Self, TableError> {
        let index = table.index()?;

        // First block that can hold range.start; scanning from the
        // previous block is still correct, just wasteful.
        let next_block = match &range.start {
            Some(start) => index
                .partition_point(|e| e.first_key.as_slice() <= start.as_slice())
                .saturating_sub(1),
            None => 0,
        };
        // One past the last block whose first key can be inside the range.
        let end_block = match &range.end {
            Some(end) => index.partition_point(|e| e.first_key.as_slice() <= end.as_slice()),
            None => index.len(),
        };

        Ok(Self {
            table,
            range,
            next_block,
            end_block,
            current: VecDeque::new(),
            failed: false,
        })
    }
}

impl Iterator for TableIter<'_> {
    type Item = Result<TableEntry, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.current.pop_front() {
                if let Some(end) = &self.range.end {
                    match entry.key.as_slice().cmp(end.as_slice()) {
                        std::cmp::Ordering::Greater => return None,
                        std::cmp::Ordering::Equal if !self.range.end_inclusive => return None,
                        _ => {}
                    }
                }
                if self.range.contains(&entry.key) {
                    return Some(Ok(entry));
                }
                continue;
            }

            if self.next_block >= self.end_block {
                return None;
            }
            let index = match self.table.index() {
                Ok(index) => index,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            let block = index[self.next_block].clone();
            self.next_block += 1;
            match self.table.read_data_block(&block) {
                Ok(entries) => self.current = entries.into(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
