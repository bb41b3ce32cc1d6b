//! Ordered, searchable sequence of row pointers spread over compact blocks.
//!
//! `SortedIndex` is the working form of one logical index. It is built
//! from a generation's block table without reading any block, and only
//! decodes the blocks a search or mutation actually touches (block bounds
//! select them).
//!
//! ## Contract
//!
//! - Entries are kept in non-decreasing order; duplicates are allowed and
//!   [`SortedIndex::insert`] places a value after its equals
//! - [`SortedIndex::insert_unique`] refuses a value already present
//! - [`SortedIndex::remove`] removes one occurrence
//! - Every entry must fit in 4 bytes (the widest compact type)
//! - A block holds at most `block_size` entries: a full block is split in
//!   half before an insert lands in it, and emptied blocks are dropped
//!
//! Mutations never touch shared decoded data (see
//! [`CompactBlock::array_mut`]). The area of every persisted block that is
//! changed or dropped is remembered as superseded so that a commit can
//! schedule it for reclamation.
//!
//! An index checked out of a snapshot holds a reference on the generation
//! it was built from, so its unread blocks stay on disk for as long as the
//! index lives, even after the snapshot is gone.

use super::block::{compact_type_for, BlockEntry, BlockSource, CompactBlock};
use super::generation::GenerationRef;
use crate::area::{AreaId, NO_AREA};
use crate::error::{Error, Result};
use std::ops::RangeInclusive;

/// Working copy of one logical index.
///
/// Like [`GenerationRef`], must not be dropped while holding the area
/// store lock.
#[derive(Debug, Clone)]
pub struct SortedIndex {
    source: BlockSource,
    block_size: usize,
    blocks: Vec<CompactBlock>,
    superseded: Vec<AreaId>,
    changed: bool,
    /// Generation the persisted blocks belong to
    pinned: Option<GenerationRef>,
}

/// Checks out a block for mutation, recording the area it leaves behind.
fn mutable_array<'a>(
    block: &'a mut CompactBlock,
    source: &BlockSource,
    superseded: &mut Vec<AreaId>,
) -> Result<&'a mut Vec<i64>> {
    let previous = block.block_pointer();
    let values = block.array_mut(source)?;
    if previous != NO_AREA {
        superseded.push(previous);
    }
    Ok(values)
}

fn check_value(value: i64) -> Result<()> {
    compact_type_for(value).map(|_| ())
}

impl SortedIndex {
    /// Creates an empty index.
    pub fn new(source: BlockSource, block_size: usize) -> Self {
        Self {
            source,
            block_size,
            blocks: Vec::new(),
            superseded: Vec::new(),
            changed: false,
            pinned: None,
        }
    }

    /// Creates an index over persisted blocks; no block is loaded.
    ///
    /// The caller keeps the blocks alive. Indexes taken from a snapshot
    /// pin their generation instead (see [`GenerationRef::create_index`]).
    pub fn from_entries(source: BlockSource, block_size: usize, entries: &[BlockEntry]) -> Self {
        let blocks = entries.iter().map(|e| CompactBlock::from_entry(e, block_size)).collect();
        Self { source, block_size, blocks, superseded: Vec::new(), changed: false, pinned: None }
    }

    /// Creates an index over the blocks of `generation`, holding it until
    /// the index is dropped.
    pub(crate) fn pinned(source: BlockSource, generation: GenerationRef) -> Self {
        let mut index =
            Self::from_entries(source, generation.block_size(), generation.block_entries());
        index.pinned = Some(generation);
        index
    }

    /// The generation this index was checked out from, if any.
    pub fn generation(&self) -> Option<&GenerationRef> {
        self.pinned.as_ref()
    }

    /// Maximum entries per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(CompactBlock::len).sum()
    }

    /// True if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Smallest entry, read from block bounds.
    pub fn first(&self) -> Option<i64> {
        self.blocks.first().map(CompactBlock::first_entry)
    }

    /// Largest entry, read from block bounds.
    pub fn last(&self) -> Option<i64> {
        self.blocks.last().map(CompactBlock::last_entry)
    }

    /// The blocks of the index, in order.
    pub fn blocks(&self) -> &[CompactBlock] {
        &self.blocks
    }

    /// Areas of persisted blocks this working copy replaced or dropped.
    pub fn superseded(&self) -> &[AreaId] {
        &self.superseded
    }

    /// True if the index was mutated since it was loaded.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Position of the only block that can hold `value`.
    fn find_block(&self, value: i64) -> Option<usize> {
        let i = self.blocks.partition_point(|b| b.last_entry() < value);
        (i < self.blocks.len() && self.blocks[i].first_entry() <= value).then_some(i)
    }

    /// Returns true if `value` is present.
    pub fn contains(&self, value: i64) -> Result<bool> {
        match self.find_block(value) {
            Some(i) => Ok(self.blocks[i].array(&self.source)?.binary_search(&value).is_ok()),
            None => Ok(false),
        }
    }

    /// Inserts `value` after any equal entries.
    pub fn insert(&mut self, value: i64) -> Result<()> {
        check_value(value)?;

        if self.blocks.is_empty() {
            self.blocks.push(CompactBlock::from_values(vec![value], self.block_size));
            self.changed = true;
            return Ok(());
        }

        let mut target = self.blocks.partition_point(|b| b.first_entry() <= value).saturating_sub(1);

        if self.blocks[target].len() >= self.block_size {
            if self.block_size == 1 {
                let at = if value < self.blocks[target].first_entry() { target } else { target + 1 };
                self.blocks.insert(at, CompactBlock::from_values(vec![value], self.block_size));
                self.changed = true;
                return Ok(());
            }
            self.split(target)?;
            if value >= self.blocks[target + 1].first_entry() {
                target += 1;
            }
        }

        let values = mutable_array(&mut self.blocks[target], &self.source, &mut self.superseded)?;
        let pos = values.partition_point(|v| *v <= value);
        values.insert(pos, value);
        self.blocks[target].sync_bounds();
        self.changed = true;
        Ok(())
    }

    /// Inserts `value` unless it is already present. Returns true if inserted.
    pub fn insert_unique(&mut self, value: i64) -> Result<bool> {
        if self.contains(value)? {
            return Ok(false);
        }
        self.insert(value)?;
        Ok(true)
    }

    /// Removes one occurrence of `value`. Returns true if it was present.
    pub fn remove(&mut self, value: i64) -> Result<bool> {
        let Some(i) = self.find_block(value) else {
            return Ok(false);
        };
        if self.blocks[i].array(&self.source)?.binary_search(&value).is_err() {
            return Ok(false);
        }

        let values = mutable_array(&mut self.blocks[i], &self.source, &mut self.superseded)?;
        if let Ok(pos) = values.binary_search(&value) {
            values.remove(pos);
        }
        self.blocks[i].sync_bounds();
        if self.blocks[i].is_empty() {
            self.blocks.remove(i);
        }
        self.changed = true;
        Ok(true)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        for block in self.blocks.drain(..) {
            if block.block_pointer() != NO_AREA {
                self.superseded.push(block.block_pointer());
            }
        }
        self.changed = true;
    }

    /// Splits block `i` in half; the upper half becomes a new block.
    fn split(&mut self, i: usize) -> Result<()> {
        let values = mutable_array(&mut self.blocks[i], &self.source, &mut self.superseded)?;
        let upper = values.split_off(values.len() / 2);
        self.blocks[i].sync_bounds();
        self.blocks.insert(i + 1, CompactBlock::from_values(upper, self.block_size));
        log::debug!("Split block {} of index ({} blocks)", i, self.blocks.len());
        Ok(())
    }

    /// Iterates over all entries in order, decoding blocks lazily.
    pub fn iter(&self) -> Iter<'_> {
        Iter { index: self, next_block: 0, current: &[], pos: 0, failed: false }
    }

    /// Collects all entries.
    pub fn to_vec(&self) -> Result<Vec<i64>> {
        let mut out = Vec::with_capacity(self.len());
        for block in &self.blocks {
            out.extend_from_slice(block.array(&self.source)?);
        }
        Ok(out)
    }

    /// Collects the entries within `range`, reading only overlapping blocks.
    pub fn range(&self, range: RangeInclusive<i64>) -> Result<Vec<i64>> {
        let (lo, hi) = (*range.start(), *range.end());
        let mut out = Vec::new();
        if lo > hi {
            return Ok(out);
        }

        let start = self.blocks.partition_point(|b| b.last_entry() < lo);
        for block in self.blocks[start..].iter().take_while(|b| b.first_entry() <= hi) {
            let values = block.array(&self.source)?;
            let from = values.partition_point(|v| *v < lo);
            let to = values.partition_point(|v| *v <= hi);
            out.extend_from_slice(&values[from..to]);
        }
        Ok(out)
    }

    /// Flushes new and changed blocks, appending every area written to
    /// `written`, and returns the block table of the result.
    pub(crate) fn flush_blocks(&mut self, written: &mut Vec<AreaId>) -> Result<Vec<BlockEntry>> {
        let mut entries = Vec::with_capacity(self.blocks.len());
        for block in &mut self.blocks {
            if block.is_changed() {
                written.push(block.flush(&self.source)?);
            }
            entries.push(block.entry()?);
        }
        Ok(entries)
    }
}

/// Iterator over the entries of a [`SortedIndex`].
///
/// Yields an error (and then stops) if a block cannot be read.
pub struct Iter<'a> {
    index: &'a SortedIndex,
    next_block: usize,
    current: &'a [i64],
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(value) = self.current.get(self.pos) {
                self.pos += 1;
                return Some(Ok(*value));
            }

            let block = self.index.blocks.get(self.next_block)?;
            self.next_block += 1;
            match block.array(&self.index.source) {
                Ok(values) => {
                    self.current = values;
                    self.pos = 0;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl SortedIndex {
    /// Checks the ordering and block-size invariants, decoding every block.
    pub fn verify(&self) -> Result<()> {
        let mut previous: Option<i64> = None;
        for (i, block) in self.blocks.iter().enumerate() {
            let values = block.array(&self.source)?;
            if values.is_empty() || values.len() > self.block_size {
                return Err(Error::corruption(format!(
                    "block {} holds {} entries (block size {})",
                    i,
                    values.len(),
                    self.block_size
                )));
            }
            if values.first() != Some(&block.first_entry()) || values.last() != Some(&block.last_entry())
            {
                return Err(Error::corruption(format!("block {} bounds disagree with its entries", i)));
            }
            for value in values {
                if previous.is_some_and(|p| p > *value) {
                    return Err(Error::corruption(format!("block {} breaks the sort order", i)));
                }
                previous = Some(*value);
            }
        }
        Ok(())
    }
}
