//! Slotted record directory.
//!
//! A growable array of fixed-size record slots spread over a list of
//! blocks whose capacities double: block `i` holds `32 << i` slots. Growth
//! appends a block and never copies or moves existing slots, so the slot
//! of a record number is stable for the life of the directory. The row
//! store relies on this when it keeps raw slot positions as pointers.
//!
//! ## Header Layout (528 bytes, big-endian)
//!
//! ```text
//! Offset  Size   Description
//! ------  -----  ------------------------------------------
//! 0       4      magic (0x087131AA)
//! 4       4      block count
//! 8       8      delete chain head (opaque to the directory)
//! 16      8*64   block area pointers
//! ```
//!
//! ## Addressing
//!
//! For record `n`, let `work = n + 32`. The owning block is
//! `bit_length(work) - 6` and its first record is `(32 << block) - 32`
//! (the sum of the capacities of all earlier blocks), so the lookup is
//! O(1) and does not depend on how many blocks exist.
//!
//! Block areas are never buffered whole: a record access reads or writes
//! just the slot through a window of the block area.

use crate::area::{Area, AreaId, SharedAreaStore, NO_AREA};
use crate::error::{Error, Result};

/// Magic number of a directory header area
pub const DIRECTORY_MAGIC: i32 = 0x0871_31AA;

/// Size of the header area in bytes
pub const DIRECTORY_HEADER_SIZE: usize = 528;

/// Maximum number of blocks the header can address
pub const MAX_BLOCKS: usize = 64;

/// Number of slots in block 0
const FIRST_BLOCK_RECORDS: u128 = 32;

/// Maps a record number to its `(block, offset)` pair.
pub fn locate(record: u64) -> (usize, u64) {
    let work = record as u128 + FIRST_BLOCK_RECORDS;
    let bit_length = 128 - work.leading_zeros() as usize;
    let block = bit_length - 6;
    let first = (FIRST_BLOCK_RECORDS << block) - FIRST_BLOCK_RECORDS;
    (block, (record as u128 - first) as u64)
}

/// First record number held by block `block`.
pub fn block_first_record(block: usize) -> u128 {
    (FIRST_BLOCK_RECORDS << block) - FIRST_BLOCK_RECORDS
}

/// Number of slots in block `block`.
pub fn block_record_count(block: usize) -> u128 {
    FIRST_BLOCK_RECORDS << block
}

/// Fixed-stride record directory over a list of doubling blocks.
#[derive(Debug)]
pub struct RecordDirectory {
    store: SharedAreaStore,
    header: Area,
    element_size: usize,
    blocks: Vec<AreaId>,
    delete_chain_head: i64,
}

impl RecordDirectory {
    /// Creates an empty directory and persists its header.
    pub fn create(store: &SharedAreaStore, element_size: usize) -> Result<Self> {
        if element_size == 0 {
            return Err(Error::invalid_argument("element_size must be > 0"));
        }

        let header = Area::create(store, DIRECTORY_HEADER_SIZE)?;
        let mut directory = Self {
            store: store.clone(),
            header,
            element_size,
            blocks: Vec::new(),
            delete_chain_head: 0,
        };
        directory.write_header()?;

        log::debug!(
            "Created record directory {} (element size {})",
            directory.header.id(),
            element_size
        );
        Ok(directory)
    }

    /// Opens an existing directory by header pointer.
    pub fn open(store: &SharedAreaStore, pointer: AreaId, element_size: usize) -> Result<Self> {
        if element_size == 0 {
            return Err(Error::invalid_argument("element_size must be > 0"));
        }

        let mut header = Area::open(store, pointer)?;
        let magic = header.read_i32()?;
        if magic != DIRECTORY_MAGIC {
            return Err(Error::format(format!(
                "Invalid record directory magic: expected {:#x}, got {:#x}",
                DIRECTORY_MAGIC, magic
            )));
        }

        let block_count = header.read_i32()?;
        if block_count < 0 || block_count as usize > MAX_BLOCKS {
            return Err(Error::corruption(format!("invalid directory block count {}", block_count)));
        }
        let delete_chain_head = header.read_i64()?;

        let mut blocks = Vec::with_capacity(block_count as usize);
        for block in 0..block_count as usize {
            let block_pointer = header.read_i64()?;
            let size = store.area_size(block_pointer)?;
            let expected = block_record_count(block) * element_size as u128;
            if size as u128 != expected {
                return Err(Error::corruption(format!(
                    "directory block {} is {} bytes, expected {}",
                    block, size, expected
                )));
            }
            blocks.push(block_pointer);
        }

        Ok(Self { store: store.clone(), header, element_size, blocks, delete_chain_head })
    }

    /// Pointer of the header area; pass it to [`RecordDirectory::open`].
    pub fn header_pointer(&self) -> AreaId {
        self.header.id()
    }

    /// Size of one record slot in bytes.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of allocated blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of record slots addressable with the current blocks.
    pub fn addressable_records(&self) -> u64 {
        u64::try_from(block_first_record(self.blocks.len())).unwrap_or(u64::MAX)
    }

    /// Area pointer of block `block`.
    pub fn block_pointer(&self, block: usize) -> Option<AreaId> {
        self.blocks.get(block).copied()
    }

    /// Returns a cursor over the slot of `record`, positioned at its start
    /// within the block area. Only the slot is read, and a flush writes
    /// only the slot back.
    pub fn record(&self, record: u64) -> Result<Area> {
        if record >= self.addressable_records() {
            return Err(Error::invalid_argument(format!(
                "record {} out of range (directory addresses {} records)",
                record,
                self.addressable_records()
            )));
        }

        let (block, offset) = locate(record);
        let position = offset as usize * self.element_size;
        Area::open_window(&self.store, self.blocks[block], position, self.element_size)
    }

    /// Writes `data` into the slot of `record` and flushes the block.
    pub fn write_record(&mut self, record: u64, data: &[u8]) -> Result<()> {
        if data.len() > self.element_size {
            return Err(Error::invalid_argument(format!(
                "record of {} bytes exceeds element size {}",
                data.len(),
                self.element_size
            )));
        }
        let mut area = self.record(record)?;
        area.write_bytes(data)?;
        area.flush()
    }

    /// Reads the slot of `record` into a new buffer.
    pub fn read_record(&self, record: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.element_size];
        self.record(record)?.read_bytes(&mut buf)?;
        Ok(buf)
    }

    /// Appends a block of `32 << block_count` slots and returns its ordinal.
    pub fn increase_size(&mut self) -> Result<usize> {
        let block = self.blocks.len();
        if block >= MAX_BLOCKS {
            return Err(Error::invalid_state("record directory is at its maximum block count"));
        }

        let bytes = block_record_count(block) * self.element_size as u128;
        let size = usize::try_from(bytes).map_err(|_| {
            Error::invalid_state(format!("directory block {} would be {} bytes", block, bytes))
        })?;

        let area_id = self.store.create_area(size)?;
        self.blocks.push(area_id);
        if let Err(e) = self.write_header() {
            self.blocks.pop();
            if let Err(delete_err) = self.store.delete_area(area_id) {
                log::warn!("Failed to release directory block {}: {}", area_id, delete_err);
            }
            return Err(e);
        }

        log::debug!("Directory {} grew to {} blocks", self.header.id(), self.blocks.len());
        Ok(block)
    }

    /// Removes the last block and deletes its area.
    ///
    /// The caller is responsible for the block holding no live records.
    pub fn decrease_size(&mut self) -> Result<()> {
        let Some(area_id) = self.blocks.pop() else {
            return Err(Error::invalid_state("record directory has no blocks"));
        };
        if let Err(e) = self.write_header() {
            self.blocks.push(area_id);
            return Err(e);
        }

        // The header no longer references the block.
        self.store.delete_area(area_id)?;
        log::debug!("Directory {} shrank to {} blocks", self.header.id(), self.blocks.len());
        Ok(())
    }

    /// Head of the caller's free-slot chain.
    pub fn delete_chain_head(&self) -> i64 {
        self.delete_chain_head
    }

    /// Stores and persists the head of the caller's free-slot chain.
    pub fn set_delete_chain_head(&mut self, head: i64) -> Result<()> {
        let previous = self.delete_chain_head;
        self.delete_chain_head = head;
        if let Err(e) = self.write_header() {
            self.delete_chain_head = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Releases the in-memory header handle. Persistent areas are untouched.
    pub fn close(self) {
        log::debug!("Closed record directory {}", self.header.id());
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.set_position(0)?;
        self.header.write_i32(DIRECTORY_MAGIC)?;
        self.header.write_i32(self.blocks.len() as i32)?;
        self.header.write_i64(self.delete_chain_head)?;
        for slot in 0..MAX_BLOCKS {
            let pointer = self.blocks.get(slot).copied().unwrap_or(NO_AREA);
            self.header.write_i64(pointer)?;
        }
        self.header.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{AreaStore, MemoryAreaStore};
    use std::sync::Arc;

    fn memory_store() -> SharedAreaStore {
        Arc::new(MemoryAreaStore::new())
    }

    #[test]
    fn test_locate_block_boundaries() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));
        assert_eq!(locate(223), (2, 127));
        assert_eq!(locate(224), (3, 0));
    }

    #[test]
    fn test_locate_matches_linear_scan() {
        for record in 0..5000u64 {
            let mut block = 0;
            let mut first = 0u64;
            while record >= first + (32u64 << block) {
                first += 32u64 << block;
                block += 1;
            }
            assert_eq!(locate(record), (block, record - first), "record {}", record);
        }
    }

    #[test]
    fn test_locate_extreme_record() {
        let (block, offset) = locate(u64::MAX);
        assert_eq!(block, 59);
        assert!((offset as u128) < block_record_count(block));
    }

    #[test]
    fn test_create_is_empty() {
        let store = memory_store();
        let directory = RecordDirectory::create(&store, 8).unwrap();
        assert_eq!(directory.block_count(), 0);
        assert_eq!(directory.addressable_records(), 0);

        let raw = store.read_area(directory.header_pointer()).unwrap();
        assert_eq!(raw.len(), DIRECTORY_HEADER_SIZE);
        assert_eq!(&raw[0..4], &DIRECTORY_MAGIC.to_be_bytes());
    }

    #[test]
    fn test_record_out_of_range() {
        let store = memory_store();
        let mut directory = RecordDirectory::create(&store, 8).unwrap();
        assert!(matches!(directory.record(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(directory.read_record(0), Err(Error::InvalidArgument(_))));

        directory.increase_size().unwrap();
        assert!(directory.record(31).is_ok());
        assert!(directory.record(32).is_err());
    }

    #[test]
    fn test_increase_size_doubles() {
        let store = memory_store();
        let mut directory = RecordDirectory::create(&store, 4).unwrap();
        for expected in 0..4 {
            assert_eq!(directory.increase_size().unwrap(), expected);
        }
        assert_eq!(directory.addressable_records(), 32 + 64 + 128 + 256);
        let last = directory.block_pointer(3).unwrap();
        assert_eq!(store.area_size(last).unwrap(), 256 * 4);
    }

    #[test]
    fn test_write_and_reopen() {
        let store = memory_store();
        let pointer = {
            let mut directory = RecordDirectory::create(&store, 8).unwrap();
            directory.increase_size().unwrap();
            directory.increase_size().unwrap();
            directory.write_record(5, &5u64.to_be_bytes()).unwrap();
            directory.write_record(70, &70u64.to_be_bytes()).unwrap();
            directory.set_delete_chain_head(1234).unwrap();
            let pointer = directory.header_pointer();
            directory.close();
            pointer
        };

        let directory = RecordDirectory::open(&store, pointer, 8).unwrap();
        assert_eq!(directory.block_count(), 2);
        assert_eq!(directory.delete_chain_head(), 1234);
        assert_eq!(directory.read_record(5).unwrap(), 5u64.to_be_bytes());
        assert_eq!(directory.read_record(70).unwrap(), 70u64.to_be_bytes());
        assert_eq!(directory.read_record(6).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn test_decrease_size() {
        let store = memory_store();
        let mut directory = RecordDirectory::create(&store, 8).unwrap();
        directory.increase_size().unwrap();
        directory.increase_size().unwrap();
        let top = directory.block_pointer(1).unwrap();

        directory.decrease_size().unwrap();
        assert_eq!(directory.block_count(), 1);
        assert!(!store.contains(top));

        directory.decrease_size().unwrap();
        assert!(matches!(directory.decrease_size(), Err(Error::InvalidState(_))));

        let reopened = RecordDirectory::open(&store, directory.header_pointer(), 8).unwrap();
        assert_eq!(reopened.block_count(), 0);
    }

    #[test]
    fn test_open_bad_magic() {
        let store = memory_store();
        let mut area = Area::create(&store, DIRECTORY_HEADER_SIZE).unwrap();
        area.write_i32(0x1234).unwrap();
        area.flush().unwrap();

        let result = RecordDirectory::open(&store, area.id(), 8);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_write_record_too_large() {
        let store = memory_store();
        let mut directory = RecordDirectory::create(&store, 4).unwrap();
        directory.increase_size().unwrap();
        assert!(directory.write_record(0, &[0u8; 5]).is_err());
    }
}
