//! Compact sorted block.
//!
//! A block is a contiguous, sorted run of row pointers of one index. On
//! disk it is just the packed entries:
//!
//! ```text
//! [entry 0: compact_type bytes]
//! [entry 1: compact_type bytes]
//! ...
//! [entry count-1]
//! ```
//!
//! Each entry is big-endian, truncated to `compact_type` bytes (1-4) and
//! sign extended from its first byte on decode. `compact_type` is the
//! narrowest width that holds every entry of the block, so blocks of
//! small row pointers cost one or two bytes per entry.
//!
//! The block's bounds, count and type live in the generation table
//! ([`BlockEntry`]), which lets searches skip blocks without reading them.

use crate::area::{Area, AreaId, SharedAreaStore, NO_AREA};
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Size of a block descriptor in a generation area
pub const BLOCK_ENTRY_SIZE: usize = 28;

/// Widest compact type (bytes per entry)
pub const MAX_COMPACT_TYPE: u8 = 4;

/// Mask of the entry count in `size_and_type`
const COUNT_MASK: i32 = 0xFFF;

/// Shift of the compact type in `size_and_type`
const TYPE_SHIFT: u32 = 24;

/// Returns the narrowest compact type that can hold `value`.
pub fn compact_type_for(value: i64) -> Result<u8> {
    if i8::try_from(value).is_ok() {
        Ok(1)
    } else if i16::try_from(value).is_ok() {
        Ok(2)
    } else if (-(1i64 << 23)..(1i64 << 23)).contains(&value) {
        Ok(3)
    } else if i32::try_from(value).is_ok() {
        Ok(4)
    } else {
        Err(Error::invalid_argument(format!(
            "row pointer {} does not fit in {} bytes",
            value, MAX_COMPACT_TYPE
        )))
    }
}

/// Appends `value` as a `compact_type`-byte big-endian integer.
pub fn encode_entry(buf: &mut impl BufMut, value: i64, compact_type: u8) {
    buf.put_int(value, compact_type as usize);
}

/// Reads a `compact_type`-byte big-endian integer, sign extended.
pub fn decode_entry(buf: &mut impl Buf, compact_type: u8) -> i64 {
    let mut value = buf.get_i8() as i64;
    for _ in 1..compact_type {
        value = (value << 8) | buf.get_u8() as i64;
    }
    value
}

/// Persistent descriptor of a flushed block.
///
/// Layout (28 bytes): `first:i64`, `last:i64`, `pointer:i64`,
/// `size_and_type:i32` with the count in the low 12 bits and the compact
/// type from bit 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Smallest entry of the block
    pub first_entry: i64,
    /// Largest entry of the block
    pub last_entry: i64,
    /// Area holding the encoded entries
    pub block_pointer: AreaId,
    /// Number of entries
    pub count: usize,
    /// Bytes per encoded entry (1-4)
    pub compact_type: u8,
}

impl BlockEntry {
    /// Packs count and compact type into the on-disk word.
    pub fn size_and_type(&self) -> i32 {
        (self.count as i32 & COUNT_MASK) | ((self.compact_type as i32) << TYPE_SHIFT)
    }

    /// Writes the descriptor at the area cursor.
    pub fn write_to(&self, area: &mut Area) -> Result<()> {
        area.write_i64(self.first_entry)?;
        area.write_i64(self.last_entry)?;
        area.write_i64(self.block_pointer)?;
        area.write_i32(self.size_and_type())
    }

    /// Reads a descriptor at the area cursor.
    pub fn read_from(area: &mut Area) -> Result<Self> {
        let first_entry = area.read_i64()?;
        let last_entry = area.read_i64()?;
        let block_pointer = area.read_i64()?;
        let size_and_type = area.read_i32()?;

        let count = (size_and_type & COUNT_MASK) as usize;
        let compact_type = (size_and_type >> TYPE_SHIFT) as u8;
        if !(1..=MAX_COMPACT_TYPE).contains(&compact_type) {
            return Err(Error::corruption(format!(
                "block {} has invalid compact type {}",
                block_pointer, compact_type
            )));
        }
        if count == 0 || first_entry > last_entry {
            return Err(Error::corruption(format!(
                "block {} has invalid descriptor (count {}, bounds {}..={})",
                block_pointer, count, first_entry, last_entry
            )));
        }

        Ok(Self { first_entry, last_entry, block_pointer, count, compact_type })
    }
}

/// Where blocks are materialized from: the area store plus the shared
/// decoded-block cache.
#[derive(Clone)]
pub struct BlockSource {
    store: SharedAreaStore,
    cache: Arc<BlockCache>,
}

impl BlockSource {
    /// Creates a source over `store` sharing `cache`.
    pub fn new(store: SharedAreaStore, cache: Arc<BlockCache>) -> Self {
        Self { store, cache }
    }

    /// The underlying area store.
    pub fn store(&self) -> &SharedAreaStore {
        &self.store
    }

    /// The decoded-block cache.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Decodes the block stored at `pointer`.
    fn load(&self, pointer: AreaId, count: usize, compact_type: u8) -> Result<Arc<Vec<i64>>> {
        if let Some(values) = self.cache.get(pointer) {
            if values.len() == count {
                return Ok(values);
            }
            log::warn!("Cached block {} has {} entries, expected {}", pointer, values.len(), count);
            self.cache.invalidate(pointer);
        }

        let raw = self.store.read_area(pointer)?;
        if raw.len() != count * compact_type as usize {
            return Err(Error::corruption(format!(
                "block {} is {} bytes, expected {} entries of {} bytes",
                pointer,
                raw.len(),
                count,
                compact_type
            )));
        }

        let mut buf = &raw[..];
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(decode_entry(&mut buf, compact_type));
        }

        let values = Arc::new(values);
        self.cache.insert(pointer, Arc::clone(&values));
        Ok(values)
    }
}

impl fmt::Debug for BlockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSource").field("areas", &self.store.area_count()).finish()
    }
}

/// A lazily materialized, copy-on-write block of sorted row pointers.
#[derive(Debug, Clone)]
pub struct CompactBlock {
    first_entry: i64,
    last_entry: i64,
    block_pointer: AreaId,
    count: usize,
    compact_type: u8,
    block_size: usize,
    materialized: OnceLock<Arc<Vec<i64>>>,
    changed: bool,
}

impl CompactBlock {
    /// A block described by a generation table entry; nothing is loaded.
    pub fn from_entry(entry: &BlockEntry, block_size: usize) -> Self {
        Self {
            first_entry: entry.first_entry,
            last_entry: entry.last_entry,
            block_pointer: entry.block_pointer,
            count: entry.count,
            compact_type: entry.compact_type,
            block_size,
            materialized: OnceLock::new(),
            changed: false,
        }
    }

    /// A new, unflushed block holding `values` (which must be sorted).
    pub fn from_values(mut values: Vec<i64>, block_size: usize) -> Self {
        debug_assert!(values.windows(2).all(|w| w[0] <= w[1]), "block values must be sorted");
        if values.capacity() < block_size {
            values.reserve(block_size - values.len());
        }
        let mut block = Self {
            first_entry: 0,
            last_entry: 0,
            block_pointer: NO_AREA,
            count: 0,
            compact_type: MAX_COMPACT_TYPE,
            block_size,
            materialized: OnceLock::from(Arc::new(values)),
            changed: true,
        };
        block.sync_bounds();
        block
    }

    /// Smallest entry; valid only for a non-empty block.
    pub fn bottom(&self) -> Result<i64> {
        if self.count == 0 {
            return Err(Error::invalid_state("bottom of an empty block"));
        }
        Ok(self.first_entry)
    }

    /// Largest entry; valid only for a non-empty block.
    pub fn top(&self) -> Result<i64> {
        if self.count == 0 {
            return Err(Error::invalid_state("top of an empty block"));
        }
        Ok(self.last_entry)
    }

    pub(crate) fn first_entry(&self) -> i64 {
        self.first_entry
    }

    pub(crate) fn last_entry(&self) -> i64 {
        self.last_entry
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// True if the block holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Area id of the flushed content, [`NO_AREA`] if not flushed.
    pub fn block_pointer(&self) -> AreaId {
        self.block_pointer
    }

    /// Bytes per entry of the flushed content.
    pub fn compact_type(&self) -> u8 {
        self.compact_type
    }

    /// True if the block was mutated since it was last flushed.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// True if the entries are decoded in memory.
    pub fn is_materialized(&self) -> bool {
        self.materialized.get().is_some()
    }

    fn load(&self, source: &BlockSource) -> Result<Arc<Vec<i64>>> {
        if self.block_pointer == NO_AREA {
            if self.count == 0 {
                return Ok(Arc::new(Vec::with_capacity(self.block_size)));
            }
            return Err(Error::invalid_state("unflushed block has no materialized entries"));
        }
        source.load(self.block_pointer, self.count, self.compact_type)
    }

    /// Read-only view of the entries, decoding them on first use.
    pub fn array(&self, source: &BlockSource) -> Result<&[i64]> {
        if let Some(values) = self.materialized.get() {
            return Ok(values.as_slice());
        }
        let loaded = self.load(source)?;
        Ok(self.materialized.get_or_init(|| loaded).as_slice())
    }

    /// Mutable view of the entries.
    ///
    /// The shared decoded array is cloned before the first write, and the
    /// block is detached from its area: it must be flushed to a new area
    /// before it can be persisted again. Callers must call
    /// [`CompactBlock::sync_bounds`] once done mutating.
    pub fn array_mut(&mut self, source: &BlockSource) -> Result<&mut Vec<i64>> {
        if self.materialized.get().is_none() {
            let loaded = self.load(source)?;
            let _ = self.materialized.set(loaded);
        }

        self.block_pointer = NO_AREA;
        self.changed = true;

        let block_size = self.block_size;
        match self.materialized.get_mut() {
            Some(shared) => {
                let values = Arc::make_mut(shared);
                if values.capacity() < block_size {
                    values.reserve(block_size - values.len());
                }
                Ok(values)
            }
            None => Err(Error::invalid_state("block entries failed to materialize")),
        }
    }

    /// Recomputes bounds and count from the materialized entries.
    pub fn sync_bounds(&mut self) {
        if let Some(values) = self.materialized.get() {
            self.count = values.len();
            self.first_entry = values.first().copied().unwrap_or(0);
            self.last_entry = values.last().copied().unwrap_or(0);
        }
    }

    /// Encodes the block into a new area and returns its id.
    ///
    /// A clean block is not rewritten; its current pointer is returned.
    pub fn flush(&mut self, source: &BlockSource) -> Result<AreaId> {
        if !self.changed && self.block_pointer != NO_AREA {
            return Ok(self.block_pointer);
        }

        let values = match self.materialized.get() {
            Some(values) => Arc::clone(values),
            None => return Err(Error::invalid_state("changed block is not materialized")),
        };
        if values.is_empty() {
            return Err(Error::invalid_state("cannot flush an empty block"));
        }

        let mut compact_type = 1;
        for value in values.iter() {
            compact_type = compact_type.max(compact_type_for(*value)?);
        }

        let mut buf = BytesMut::with_capacity(values.len() * compact_type as usize);
        for value in values.iter() {
            encode_entry(&mut buf, *value, compact_type);
        }

        let mut area = Area::create(source.store(), buf.len())?;
        if let Err(e) = area.write_bytes(&buf).and_then(|_| area.flush()) {
            if let Err(cleanup) = source.store().delete_area(area.id()) {
                log::warn!("Failed to delete partial block area {}: {}", area.id(), cleanup);
            }
            return Err(e);
        }

        self.block_pointer = area.id();
        self.compact_type = compact_type;
        self.changed = false;
        self.sync_bounds();
        source.cache().insert(self.block_pointer, values);

        log::debug!(
            "Flushed block {} ({} entries, {} bytes/entry)",
            self.block_pointer,
            self.count,
            compact_type
        );
        Ok(self.block_pointer)
    }

    /// Copies the encoded bytes into a new area of `dest` without decoding.
    pub fn copy_to(&self, source: &BlockSource, dest: &SharedAreaStore) -> Result<AreaId> {
        if self.changed || self.block_pointer == NO_AREA {
            return Err(Error::invalid_state("only flushed blocks can be copied"));
        }
        let raw = source.store().read_area(self.block_pointer)?;
        let id = dest.create_area(raw.len())?;
        dest.write_area(id, &raw)?;
        Ok(id)
    }

    /// The persistent descriptor of a flushed block.
    pub fn entry(&self) -> Result<BlockEntry> {
        if self.changed || self.block_pointer == NO_AREA {
            return Err(Error::invalid_state("block must be flushed before it has a descriptor"));
        }
        Ok(BlockEntry {
            first_entry: self.first_entry,
            last_entry: self.last_entry,
            block_pointer: self.block_pointer,
            count: self.count,
            compact_type: self.compact_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{AreaStore, MemoryAreaStore};

    fn source() -> BlockSource {
        BlockSource::new(Arc::new(MemoryAreaStore::new()), Arc::new(BlockCache::new(0)))
    }

    fn reload(block: &CompactBlock, block_size: usize, source: &BlockSource) -> Vec<i64> {
        let fresh = CompactBlock::from_entry(&block.entry().unwrap(), block_size);
        assert!(!fresh.is_materialized());
        fresh.array(source).unwrap().to_vec()
    }

    #[test]
    fn test_compact_type_boundaries() {
        assert_eq!(compact_type_for(0).unwrap(), 1);
        assert_eq!(compact_type_for(127).unwrap(), 1);
        assert_eq!(compact_type_for(-128).unwrap(), 1);
        assert_eq!(compact_type_for(128).unwrap(), 2);
        assert_eq!(compact_type_for(-32768).unwrap(), 2);
        assert_eq!(compact_type_for(32768).unwrap(), 3);
        assert_eq!(compact_type_for(8_388_607).unwrap(), 3);
        assert_eq!(compact_type_for(-8_388_608).unwrap(), 3);
        assert_eq!(compact_type_for(8_388_608).unwrap(), 4);
        assert_eq!(compact_type_for(i32::MIN as i64).unwrap(), 4);
        assert!(compact_type_for(i32::MAX as i64 + 1).is_err());
    }

    #[test]
    fn test_entry_sign_extension() {
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, -2, 1);
        encode_entry(&mut buf, -300, 2);
        encode_entry(&mut buf, -70_000, 3);
        assert_eq!(&buf[..], &[0xFE, 0xFE, 0xD4, 0xFE, 0xEE, 0x90]);

        let mut reader = &buf[..];
        assert_eq!(decode_entry(&mut reader, 1), -2);
        assert_eq!(decode_entry(&mut reader, 2), -300);
        assert_eq!(decode_entry(&mut reader, 3), -70_000);
    }

    #[test]
    fn test_flush_roundtrip_each_width() {
        let source = source();
        let cases: [(&[i64], u8); 4] = [
            (&[-5, 0, 17, 127], 1),
            (&[1, 200, 32_000], 2),
            (&[-40_000, 5, 8_000_000], 3),
            (&[5, 900_000, 40_000_000], 4),
        ];

        for (values, expected_type) in cases {
            let mut block = CompactBlock::from_values(values.to_vec(), 64);
            let pointer = block.flush(&source).unwrap();

            assert_eq!(block.compact_type(), expected_type);
            assert!(!block.is_changed());
            assert_eq!(
                source.store().area_size(pointer).unwrap(),
                values.len() * expected_type as usize
            );
            assert_eq!(reload(&block, 64, &source), values);
        }
    }

    #[test]
    fn test_bottom_top() {
        let block = CompactBlock::from_values(vec![3, 9, 12], 8);
        assert_eq!(block.bottom().unwrap(), 3);
        assert_eq!(block.top().unwrap(), 12);

        let empty = CompactBlock::from_values(Vec::new(), 8);
        assert!(matches!(empty.bottom(), Err(Error::InvalidState(_))));
        assert!(matches!(empty.top(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_copy_on_write_leaves_shared_array_intact() {
        let source = source();
        let mut block = CompactBlock::from_values(vec![1, 2, 3], 8);
        block.flush(&source).unwrap();
        let pointer = block.block_pointer();

        let reader = block.clone();
        let values = block.array_mut(&source).unwrap();
        values.push(4);
        block.sync_bounds();

        assert!(block.is_changed());
        assert_eq!(block.block_pointer(), NO_AREA);
        assert_eq!(block.top().unwrap(), 4);

        assert_eq!(reader.block_pointer(), pointer);
        assert_eq!(reader.array(&source).unwrap(), &[1, 2, 3]);
        assert!(matches!(block.entry(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_clean_flush_is_noop() {
        let source = source();
        let mut block = CompactBlock::from_values(vec![10, 20], 8);
        let first = block.flush(&source).unwrap();
        let second = block.flush(&source).unwrap();
        assert_eq!(first, second);
        assert_eq!(source.store().area_count(), 1);
    }

    #[test]
    fn test_flush_empty_or_oversized() {
        let source = source();
        let mut empty = CompactBlock::from_values(Vec::new(), 8);
        assert!(matches!(empty.flush(&source), Err(Error::InvalidState(_))));

        let mut wide = CompactBlock::from_values(vec![1, i64::MAX], 8);
        assert!(matches!(wide.flush(&source), Err(Error::InvalidArgument(_))));
        assert_eq!(source.store().area_count(), 0);
    }

    #[test]
    fn test_copy_to_other_store() {
        let source = source();
        let dest: SharedAreaStore = Arc::new(MemoryAreaStore::new());

        let mut block = CompactBlock::from_values(vec![7, 300, 70_000], 8);
        assert!(block.copy_to(&source, &dest).is_err());
        block.flush(&source).unwrap();

        let copied = block.copy_to(&source, &dest).unwrap();
        assert_eq!(
            dest.read_area(copied).unwrap(),
            source.store().read_area(block.block_pointer()).unwrap()
        );
    }

    #[test]
    fn test_block_entry_layout() {
        let store: SharedAreaStore = Arc::new(MemoryAreaStore::new());
        let entry = BlockEntry {
            first_entry: -1,
            last_entry: 99,
            block_pointer: 42,
            count: 4095,
            compact_type: 3,
        };
        assert_eq!(entry.size_and_type(), 0x0300_0FFF);

        let mut area = Area::create(&store, BLOCK_ENTRY_SIZE).unwrap();
        entry.write_to(&mut area).unwrap();
        assert_eq!(area.position(), BLOCK_ENTRY_SIZE);

        area.set_position(0).unwrap();
        assert_eq!(BlockEntry::read_from(&mut area).unwrap(), entry);
    }

    #[test]
    fn test_block_entry_rejects_bad_type() {
        let store: SharedAreaStore = Arc::new(MemoryAreaStore::new());
        let mut area = Area::create(&store, BLOCK_ENTRY_SIZE).unwrap();
        area.write_i64(0).unwrap();
        area.write_i64(1).unwrap();
        area.write_i64(5).unwrap();
        area.write_i32(2 | (7 << 24)).unwrap();

        area.set_position(0).unwrap();
        assert!(matches!(BlockEntry::read_from(&mut area), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_materialization_uses_cache() {
        let store: SharedAreaStore = Arc::new(MemoryAreaStore::new());
        let source = BlockSource::new(store, Arc::new(BlockCache::new(1024)));

        let mut block = CompactBlock::from_values(vec![1, 2, 3], 8);
        block.flush(&source).unwrap();

        let fresh = CompactBlock::from_entry(&block.entry().unwrap(), 8);
        assert_eq!(fresh.array(&source).unwrap(), &[1, 2, 3]);
        assert_eq!(source.cache().stats().hits, 1);
    }
}
