//! Bytecode index maps
//!
//! A bytecode index map associates each bytecode instruction that produced
//! stops with the contiguous range of stop indices generated for it. The
//! encoding is a flat integer sequence of `(bci, stop count)` pairs in
//! strictly increasing bci order:
//!
//! ```text
//! [bci0, count0, bci1, count1, ...]
//! ```
//!
//! Stop indices are implicit: entry `i` owns the `count_i` indices that
//! follow those of entry `i - 1`, starting at `first_stop_index`. Stops
//! with no bytecode index (prologue and other synthetic code) occupy
//! `[0, first_stop_index)` and are not described by any entry.

use std::ops::Range;

use serde::Serialize;
use tracing::trace;

use crate::error::{Result, StopsError};

/// A packed bytecode index map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BytecodeIndexMap {
    encoding: Vec<u32>,
    first_stop_index: u32,
}

impl BytecodeIndexMap {
    /// Create a map from its raw encoding, rejecting invalid encodings
    pub fn from_encoding(encoding: Vec<u32>, first_stop_index: u32) -> Result<Self> {
        Self::validate_encoding(&encoding)?;
        checked_stop_end(first_stop_index, &encoding)?;
        Ok(Self {
            encoding,
            first_stop_index,
        })
    }

    /// Create a map from `(bci, stop count)` pairs
    pub fn from_entries(entries: &[(u32, u32)], first_stop_index: u32) -> Result<Self> {
        let mut builder = BytecodeIndexMapBuilder::with_capacity(entries.len());
        for &(bci, count) in entries {
            builder.append_entry(bci, count)?;
        }
        builder.finish(first_stop_index)
    }

    /// Check a raw encoding: even length, strictly increasing bcis and a
    /// stop count total that fits in `u32`
    pub fn is_valid_encoding(encoding: &[u32]) -> bool {
        Self::validate_encoding(encoding).is_ok()
    }

    /// Validate a raw encoding, reporting the first violation
    pub fn validate_encoding(encoding: &[u32]) -> Result<()> {
        if encoding.len() % 2 != 0 {
            return Err(StopsError::OddLength(encoding.len()));
        }
        for i in (2..encoding.len()).step_by(2) {
            let prev = encoding[i - 2];
            let bci = encoding[i];
            if bci <= prev {
                return Err(StopsError::NonIncreasingBci { prev, bci });
            }
        }
        checked_stop_end(0, encoding).map(|_| ())
    }

    /// Check this map's own encoding
    pub fn is_valid(&self) -> bool {
        Self::is_valid_encoding(&self.encoding)
    }

    /// The raw `(bci, count)` encoding
    pub fn encoding(&self) -> &[u32] {
        &self.encoding
    }

    /// Global stop index at which the first entry's stops begin
    pub fn first_stop_index(&self) -> u32 {
        self.first_stop_index
    }

    /// Number of `(bci, count)` entries
    pub fn num_entries(&self) -> usize {
        self.encoding.len() / 2
    }

    /// Check if the map has no entries
    pub fn is_empty(&self) -> bool {
        self.encoding.is_empty()
    }

    /// The `(bci, count)` pair of entry `index`
    pub fn entry(&self, index: usize) -> (u32, u32) {
        (self.encoding[index * 2], self.encoding[index * 2 + 1])
    }

    /// Sum of all entry stop counts
    pub fn mapped_stops(&self) -> usize {
        self.encoding
            .iter()
            .skip(1)
            .step_by(2)
            .map(|&c| c as usize)
            .sum()
    }

    /// Total number of stops the owning table must hold
    pub fn total_stops(&self) -> usize {
        self.first_stop_index as usize + self.mapped_stops()
    }

    /// Iterate over entries as `(bci, stop index range)`
    pub fn entries(&self) -> impl Iterator<Item = (u32, Range<u32>)> + '_ {
        let mut start = self.first_stop_index;
        self.encoding.chunks_exact(2).map(move |pair| {
            let range = start..start + pair[1];
            start = range.end;
            (pair[0], range)
        })
    }

    /// Bytecode index owning stop `stop_index`, if any entry covers it
    pub fn bci_for_stop(&self, stop_index: u32) -> Option<u32> {
        self.entries()
            .find(|(_, range)| range.contains(&stop_index))
            .map(|(bci, _)| bci)
    }

    /// Stop index range of the entry for `bci`, found by binary search
    pub fn stops_for_bci(&self, bci: u32) -> Option<Range<u32>> {
        let (mut lo, mut hi) = (0, self.num_entries());
        let idx = loop {
            if lo >= hi {
                return None;
            }
            let mid = (lo + hi) / 2;
            match self.encoding[mid * 2].cmp(&bci) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => break mid,
            }
        };
        let start = self.first_stop_index
            + self.encoding[..idx * 2]
                .iter()
                .skip(1)
                .step_by(2)
                .sum::<u32>();
        Some(start..start + self.encoding[idx * 2 + 1])
    }

    /// Create a cursor over this map
    pub fn iter(&self) -> BytecodeIndexMapIterator<'_> {
        BytecodeIndexMapIterator::new(self)
    }
}

/// Incremental builder for a `BytecodeIndexMap`
#[derive(Debug, Default)]
pub struct BytecodeIndexMapBuilder {
    encoding: Vec<u32>,
    mapped: u32,
}

impl BytecodeIndexMapBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty builder with room for `entries` entries
    pub fn with_capacity(entries: usize) -> Self {
        Self {
            encoding: Vec::with_capacity(entries * 2),
            mapped: 0,
        }
    }

    /// Append the entry for the next instruction
    ///
    /// `bci` must be strictly greater than every bci appended before it.
    pub fn append_entry(&mut self, bci: u32, stop_count: u32) -> Result<()> {
        if let Some(prev) = self.last_bci() {
            if bci <= prev {
                return Err(StopsError::NonIncreasingBci { prev, bci });
            }
        }
        self.mapped = self
            .mapped
            .checked_add(stop_count)
            .ok_or(StopsError::StopIndexOverflow {
                first: 0,
                mapped: u64::from(self.mapped) + u64::from(stop_count),
            })?;
        trace!(bci, stop_count, "bsm entry");
        self.encoding.push(bci);
        self.encoding.push(stop_count);
        Ok(())
    }

    /// Bci of the most recently appended entry
    pub fn last_bci(&self) -> Option<u32> {
        let len = self.encoding.len();
        if len == 0 {
            None
        } else {
            Some(self.encoding[len - 2])
        }
    }

    /// Number of entries appended so far
    pub fn num_entries(&self) -> usize {
        self.encoding.len() / 2
    }

    /// Sum of stop counts appended so far
    pub fn mapped_stops(&self) -> usize {
        self.mapped as usize
    }

    /// Finish the map; stops `[0, first_stop_index)` are unmapped
    pub fn finish(self, first_stop_index: u32) -> Result<BytecodeIndexMap> {
        if first_stop_index.checked_add(self.mapped).is_none() {
            return Err(StopsError::StopIndexOverflow {
                first: first_stop_index,
                mapped: u64::from(self.mapped),
            });
        }
        debug_assert!(BytecodeIndexMap::is_valid_encoding(&self.encoding));
        Ok(BytecodeIndexMap {
            encoding: self.encoding,
            first_stop_index,
        })
    }
}

/// One past the last stop index of `encoding` starting at `first`
fn checked_stop_end(first: u32, encoding: &[u32]) -> Result<u32> {
    let mapped: u64 = encoding.iter().skip(1).step_by(2).map(|&c| u64::from(c)).sum();
    u32::try_from(u64::from(first) + mapped)
        .map_err(|_| StopsError::StopIndexOverflow { first, mapped })
}

/// A restartable forward cursor over bytecode indices
///
/// This is the view a reference interpreter gets of the bcis it must
/// report frame state for.
pub trait BciCursor {
    /// Move to the first bci
    fn reset(&mut self);
    /// The current bci, or `None` once exhausted
    fn bci(&self) -> Option<u32>;
    /// Move to the next bci and return it
    fn advance(&mut self) -> Option<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Unpositioned,
    AtEntry(usize),
    Exhausted,
}

/// Cursor over a `BytecodeIndexMap`
///
/// Yields the bci sequence and, per bci, the enclosed stop indices.
/// Canonical traversal:
///
/// ```rust,ignore
/// let mut iter = map.iter();
/// iter.reset();
/// while let Some(bci) = iter.bci() {
///     let mut stop = iter.next_stop_index(true);
///     while let Some(index) = stop {
///         // ... stop `index` belongs to `bci`
///         stop = iter.next_stop_index(false);
///     }
///     iter.advance();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct BytecodeIndexMapIterator<'a> {
    map: &'a BytecodeIndexMap,
    cursor: Cursor,
    stop_region_start: u32,
    stop_cursor: u32,
}

impl<'a> BytecodeIndexMapIterator<'a> {
    /// Create an unpositioned cursor; call `reset` before use
    pub fn new(map: &'a BytecodeIndexMap) -> Self {
        Self {
            map,
            cursor: Cursor::Unpositioned,
            stop_region_start: map.first_stop_index,
            stop_cursor: map.first_stop_index,
        }
    }

    /// The map being traversed
    pub fn map(&self) -> &'a BytecodeIndexMap {
        self.map
    }

    /// Move to the first entry
    pub fn reset(&mut self) {
        self.stop_region_start = self.map.first_stop_index;
        self.stop_cursor = self.map.first_stop_index;
        self.cursor = if self.map.is_empty() {
            Cursor::Exhausted
        } else {
            Cursor::AtEntry(0)
        };
    }

    /// Bci of the current entry, `None` when unpositioned or exhausted
    pub fn bci(&self) -> Option<u32> {
        match self.cursor {
            Cursor::AtEntry(i) => Some(self.map.entry(i).0),
            _ => None,
        }
    }

    /// Move past the current entry and return the new bci
    pub fn advance(&mut self) -> Option<u32> {
        if let Cursor::AtEntry(i) = self.cursor {
            self.stop_region_start += self.map.entry(i).1;
            self.stop_cursor = self.stop_region_start;
            self.cursor = if i + 1 < self.map.num_entries() {
                Cursor::AtEntry(i + 1)
            } else {
                Cursor::Exhausted
            };
        }
        self.bci()
    }

    /// Next stop index of the current entry
    ///
    /// With `reset_to_entry_start`, restarts from the entry's first stop.
    pub fn next_stop_index(&mut self, reset_to_entry_start: bool) -> Option<u32> {
        if reset_to_entry_start {
            self.stop_cursor = self.stop_region_start;
        }
        let Cursor::AtEntry(i) = self.cursor else {
            return None;
        };
        if self.stop_cursor < self.stop_region_start + self.map.entry(i).1 {
            let index = self.stop_cursor;
            self.stop_cursor += 1;
            Some(index)
        } else {
            None
        }
    }

    /// Stop index range of the current entry
    pub fn entry_stops(&self) -> Option<Range<u32>> {
        match self.cursor {
            Cursor::AtEntry(i) => {
                Some(self.stop_region_start..self.stop_region_start + self.map.entry(i).1)
            }
            _ => None,
        }
    }

    /// Check if the cursor has moved past the last entry
    pub fn is_exhausted(&self) -> bool {
        self.cursor == Cursor::Exhausted
    }
}

impl BciCursor for BytecodeIndexMapIterator<'_> {
    fn reset(&mut self) {
        BytecodeIndexMapIterator::reset(self)
    }

    fn bci(&self) -> Option<u32> {
        BytecodeIndexMapIterator::bci(self)
    }

    fn advance(&mut self) -> Option<u32> {
        BytecodeIndexMapIterator::advance(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(iter: &mut BytecodeIndexMapIterator<'_>) -> Vec<(u32, Vec<u32>)> {
        let mut out = Vec::new();
        iter.reset();
        while let Some(bci) = iter.bci() {
            let mut stops = Vec::new();
            let mut next = iter.next_stop_index(true);
            while let Some(index) = next {
                stops.push(index);
                next = iter.next_stop_index(false);
            }
            out.push((bci, stops));
            iter.advance();
        }
        out
    }

    #[test]
    fn test_rejects_repeated_bci() {
        let mut builder = BytecodeIndexMapBuilder::new();
        builder.append_entry(3, 1).unwrap();
        builder.append_entry(7, 2).unwrap();
        assert_eq!(
            builder.append_entry(7, 0),
            Err(StopsError::NonIncreasingBci { prev: 7, bci: 7 })
        );
        assert!(BytecodeIndexMap::from_entries(&[(3, 1), (7, 2), (7, 0)], 0).is_err());
    }

    #[test]
    fn test_validity_predicate() {
        assert!(BytecodeIndexMap::is_valid_encoding(&[]));
        assert!(BytecodeIndexMap::is_valid_encoding(&[0, 1, 5, 2, 9, 1]));
        assert!(!BytecodeIndexMap::is_valid_encoding(&[0, 1, 5]));
        assert!(!BytecodeIndexMap::is_valid_encoding(&[5, 1, 2, 1]));
        assert_eq!(
            BytecodeIndexMap::from_encoding(vec![1, 1, 4], 0),
            Err(StopsError::OddLength(3))
        );
    }

    #[test]
    fn test_rejects_stop_index_overflow() {
        assert!(!BytecodeIndexMap::is_valid_encoding(&[0, u32::MAX, 1, 1]));
        assert!(matches!(
            BytecodeIndexMap::from_encoding(vec![0, u32::MAX, 1, 1], 1),
            Err(StopsError::StopIndexOverflow { mapped, .. }) if mapped == u64::from(u32::MAX) + 1
        ));
        assert!(matches!(
            BytecodeIndexMap::from_encoding(vec![0, u32::MAX], 1),
            Err(StopsError::StopIndexOverflow { first: 1, .. })
        ));
        assert!(BytecodeIndexMap::from_encoding(vec![0, u32::MAX], 0).is_ok());

        let mut builder = BytecodeIndexMapBuilder::new();
        builder.append_entry(0, u32::MAX).unwrap();
        assert!(builder.append_entry(1, 1).is_err());
        assert_eq!(builder.num_entries(), 1);
        assert!(builder.finish(1).is_err());
    }

    #[test]
    fn test_canonical_walk() {
        let map = BytecodeIndexMap::from_entries(&[(0, 1), (5, 2), (9, 1)], 0).unwrap();
        let mut iter = map.iter();
        assert_eq!(
            walk(&mut iter),
            vec![(0, vec![0]), (5, vec![1, 2]), (9, vec![3])]
        );
        assert_eq!(iter.bci(), None);
        assert!(iter.is_exhausted());
        assert_eq!(map.total_stops(), 4);
    }

    #[test]
    fn test_bci_sequence() {
        let map = BytecodeIndexMap::from_entries(&[(0, 1), (5, 2), (9, 1)], 0).unwrap();
        let mut iter = map.iter();
        assert_eq!(iter.bci(), None);
        iter.reset();
        assert_eq!(iter.bci(), Some(0));
        assert_eq!(iter.advance(), Some(5));
        assert_eq!(iter.advance(), Some(9));
        assert_eq!(iter.advance(), None);
        assert_eq!(iter.advance(), None);
        assert_eq!(iter.next_stop_index(true), None);
    }

    #[test]
    fn test_first_stop_index_offsets_walk() {
        let map = BytecodeIndexMap::from_entries(&[(2, 2), (4, 0), (6, 1)], 3).unwrap();
        let mut iter = map.iter();
        assert_eq!(
            walk(&mut iter),
            vec![(2, vec![3, 4]), (4, vec![]), (6, vec![5])]
        );
        assert_eq!(map.total_stops(), 6);
    }

    #[test]
    fn test_reset_to_entry_start_repeats() {
        let map = BytecodeIndexMap::from_entries(&[(1, 3)], 0).unwrap();
        let mut iter = map.iter();
        iter.reset();
        assert_eq!(iter.next_stop_index(true), Some(0));
        assert_eq!(iter.next_stop_index(false), Some(1));
        assert_eq!(iter.next_stop_index(true), Some(0));
        assert_eq!(iter.next_stop_index(false), Some(1));
        assert_eq!(iter.next_stop_index(false), Some(2));
        assert_eq!(iter.next_stop_index(false), None);
        assert_eq!(iter.entry_stops(), Some(0..3));
    }

    #[test]
    fn test_restart_is_idempotent() {
        let map = BytecodeIndexMap::from_entries(&[(0, 2), (3, 1), (8, 4)], 1).unwrap();
        let mut iter = map.iter();
        let first = walk(&mut iter);
        let second = walk(&mut iter);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_map() {
        let map = BytecodeIndexMap::from_entries(&[], 2).unwrap();
        let mut iter = map.iter();
        iter.reset();
        assert!(iter.is_exhausted());
        assert_eq!(iter.bci(), None);
        assert_eq!(map.total_stops(), 2);
    }

    #[test]
    fn test_entry_lookups() {
        let map = BytecodeIndexMap::from_entries(&[(0, 1), (5, 2), (9, 1)], 1).unwrap();
        let entries: Vec<_> = map.entries().collect();
        assert_eq!(entries, vec![(0, 1..2), (5, 2..4), (9, 4..5)]);
        assert_eq!(map.bci_for_stop(0), None);
        assert_eq!(map.bci_for_stop(3), Some(5));
        assert_eq!(map.bci_for_stop(5), None);
        assert_eq!(map.stops_for_bci(9), Some(4..5));
        assert_eq!(map.stops_for_bci(5), Some(2..4));
        assert_eq!(map.stops_for_bci(4), None);
    }
}
