//! Area allocator contract.
//!
//! An area is an independently addressable, fixed-size persistent byte
//! region identified by a stable [`AreaId`]. Everything the engine stores
//! (record directory blocks, compact index blocks, generation tables and
//! headers) lives in areas.
//!
//! ## Layers
//!
//! - [`AreaStore`]: the allocator itself (create / read / write / delete
//!   regions, ranged reads and writes, plus the store-wide structural lock)
//! - [`Area`]: a buffered cursor over one region, or a window of it, with
//!   big-endian primitive reads and writes; [`Area::flush`] persists it
//!
//! Two backends ship with the crate: [`MemoryAreaStore`] for tests and
//! embedded use, and [`FileAreaStore`] which keeps one checksummed file
//! per area.

mod file;
mod memory;

pub use file::FileAreaStore;
pub use memory::MemoryAreaStore;

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::MutexGuard;
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a persistent area.
pub type AreaId = i64;

/// Sentinel id for "no area" (e.g. a block that was never flushed).
pub const NO_AREA: AreaId = -1;

/// A shareable handle to an area allocator.
pub type SharedAreaStore = Arc<dyn AreaStore>;

/// The area allocator consumed by the index engine.
///
/// Implementations must be safe to call from many threads. Structural
/// changes made by the engine (creating index sets, committing, freeing
/// generations) are serialized through [`AreaStore::lock`].
pub trait AreaStore: Send + Sync + fmt::Debug {
    /// Allocates a zero-filled area of `size` bytes.
    fn create_area(&self, size: usize) -> Result<AreaId>;

    /// Reads the full content of an area.
    fn read_area(&self, id: AreaId) -> Result<Bytes>;

    /// Replaces the content of an area. `data` must match the area size.
    fn write_area(&self, id: AreaId, data: &[u8]) -> Result<()>;

    /// Reads `len` bytes starting at `offset`.
    fn read_at(&self, id: AreaId, offset: usize, len: usize) -> Result<Bytes> {
        let content = self.read_area(id)?;
        check_range(id, content.len(), offset, len)?;
        Ok(content.slice(offset..offset + len))
    }

    /// Overwrites `data.len()` bytes starting at `offset`.
    fn write_at(&self, id: AreaId, offset: usize, data: &[u8]) -> Result<()> {
        let content = self.read_area(id)?;
        check_range(id, content.len(), offset, data.len())?;
        let mut patched = BytesMut::from(&content[..]);
        patched[offset..offset + data.len()].copy_from_slice(data);
        self.write_area(id, &patched)
    }

    /// Irreversibly deletes an area.
    fn delete_area(&self, id: AreaId) -> Result<()>;

    /// Returns the size of an area in bytes.
    fn area_size(&self, id: AreaId) -> Result<usize>;

    /// Returns true if the area exists.
    fn contains(&self, id: AreaId) -> bool;

    /// Number of live areas.
    fn area_count(&self) -> usize;

    /// Acquires the store-wide structural lock.
    fn lock(&self) -> MutexGuard<'_, ()>;
}

/// Checks that `len` bytes at `offset` lie inside an area of `size` bytes.
pub(crate) fn check_range(id: AreaId, size: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::invalid_argument(format!(
            "range of {} bytes at {} is outside area {} ({} bytes)",
            len, offset, id, size
        ))),
    }
}

/// A buffered read/write cursor over a single area.
///
/// Reads and writes operate on an in-memory copy of the area, or of a
/// window of it (see [`Area::open_window`]); nothing reaches the store
/// until [`Area::flush`]. Positions are always relative to the start of
/// the area.
pub struct Area {
    store: SharedAreaStore,
    id: AreaId,
    size: usize,
    /// Offset of the buffered window within the area
    base: usize,
    data: BytesMut,
    position: usize,
    dirty: bool,
}

impl Area {
    /// Allocates a new area of `size` bytes and returns a cursor at 0.
    pub fn create(store: &SharedAreaStore, size: usize) -> Result<Self> {
        let id = store.create_area(size)?;
        Ok(Self {
            store: Arc::clone(store),
            id,
            size,
            base: 0,
            data: BytesMut::zeroed(size),
            position: 0,
            dirty: false,
        })
    }

    /// Opens an existing area by id.
    pub fn open(store: &SharedAreaStore, id: AreaId) -> Result<Self> {
        if id == NO_AREA {
            return Err(Error::invalid_argument("cannot open the null area pointer"));
        }
        let content = store.read_area(id)?;
        Ok(Self {
            store: Arc::clone(store),
            id,
            size: content.len(),
            base: 0,
            data: BytesMut::from(&content[..]),
            position: 0,
            dirty: false,
        })
    }

    /// Opens `len` bytes of an existing area starting at `offset`, with
    /// the cursor at `offset`. Only that window is read, and a flush
    /// writes only that window back.
    pub fn open_window(store: &SharedAreaStore, id: AreaId, offset: usize, len: usize) -> Result<Self> {
        if id == NO_AREA {
            return Err(Error::invalid_argument("cannot open the null area pointer"));
        }
        let size = store.area_size(id)?;
        check_range(id, size, offset, len)?;
        let content = store.read_at(id, offset, len)?;
        Ok(Self {
            store: Arc::clone(store),
            id,
            size,
            base: offset,
            data: BytesMut::from(&content[..]),
            position: offset,
            dirty: false,
        })
    }

    /// Returns the area id.
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// Returns the area size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor. Positions past the end are rejected.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.size {
            return Err(Error::invalid_argument(format!(
                "position {} beyond end of area {} ({} bytes)",
                position, self.id, self.size
            )));
        }
        self.position = position;
        Ok(())
    }

    /// Buffer range of `len` bytes at the cursor, if inside the window.
    fn window(&self, len: usize) -> Option<std::ops::Range<usize>> {
        let start = self.position.checked_sub(self.base)?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    fn overrun(&self, op: &str, len: usize) -> String {
        format!(
            "{} of {} bytes at {} overruns area {} (bytes {}..{} buffered)",
            op,
            len,
            self.position,
            self.id,
            self.base,
            self.base + self.data.len()
        )
    }

    fn readable(&self, len: usize) -> Result<&[u8]> {
        match self.window(len) {
            Some(range) => Ok(&self.data[range]),
            None => Err(Error::corruption(self.overrun("read", len))),
        }
    }

    fn writable(&mut self, len: usize) -> Result<&mut [u8]> {
        let Some(range) = self.window(len) else {
            return Err(Error::invalid_argument(self.overrun("write", len)));
        };
        self.dirty = true;
        Ok(&mut self.data[range])
    }

    /// Reads a big-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        let value = self.readable(4)?.get_i32();
        self.position += 4;
        Ok(value)
    }

    /// Reads a big-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        let value = self.readable(8)?.get_i64();
        self.position += 8;
        Ok(value)
    }

    /// Fills `buf` from the cursor.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.readable(buf.len())?);
        self.position += buf.len();
        Ok(())
    }

    /// Writes a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.writable(4)?.put_i32(value);
        self.position += 4;
        Ok(())
    }

    /// Writes a big-endian `i64`.
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.writable(8)?.put_i64(value);
        self.position += 8;
        Ok(())
    }

    /// Writes raw bytes at the cursor.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writable(bytes.len())?.copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    /// Persists buffered writes to the store.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            if self.base == 0 && self.data.len() == self.size {
                self.store.write_area(self.id, &self.data)?;
            } else {
                self.store.write_at(self.id, self.base, &self.data)?;
            }
            self.dirty = false;
        }
        Ok(())
    }
}

impl fmt::Debug for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Area")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("window", &(self.base..self.base + self.data.len()))
            .field("position", &self.position)
            .field("dirty", &self.dirty)
            .finish()
    }
}
