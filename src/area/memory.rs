//! In-memory area backend.

use super::{check_range, AreaId, AreaStore};
use crate::error::{Error, Result};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Content of one area. Writes go through the region, never through the
/// map, so a write racing a delete cannot bring the area back.
type Region = Arc<RwLock<Vec<u8>>>;

/// Area allocator backed by a concurrent skip list.
///
/// Areas vanish with the store; use [`super::FileAreaStore`] for
/// durability. Area ids start at 1 and are never reused.
#[derive(Debug)]
pub struct MemoryAreaStore {
    areas: SkipMap<AreaId, Region>,
    next_id: AtomicI64,
    deleted: AtomicU64,
    structure: Mutex<()>,
}

impl MemoryAreaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            areas: SkipMap::new(),
            next_id: AtomicI64::new(1),
            deleted: AtomicU64::new(0),
            structure: Mutex::new(()),
        }
    }

    /// Number of areas deleted over the lifetime of the store.
    pub fn deleted_count(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Ids of all live areas, ascending.
    pub fn area_ids(&self) -> Vec<AreaId> {
        self.areas.iter().map(|entry| *entry.key()).collect()
    }

    fn region(&self, id: AreaId) -> Result<Region> {
        self.areas
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::not_found(format!("area {}", id)))
    }
}

impl Default for MemoryAreaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AreaStore for MemoryAreaStore {
    fn create_area(&self, size: usize) -> Result<AreaId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        assert!(!self.areas.contains_key(&id), "area id {} allocated twice", id);
        self.areas.insert(id, Arc::new(RwLock::new(vec![0u8; size])));
        Ok(id)
    }

    fn read_area(&self, id: AreaId) -> Result<Bytes> {
        let region = self.region(id)?;
        let content = region.read();
        Ok(Bytes::copy_from_slice(&content))
    }

    fn write_area(&self, id: AreaId, data: &[u8]) -> Result<()> {
        let region = self.region(id)?;
        let mut content = region.write();
        if data.len() != content.len() {
            return Err(Error::invalid_argument(format!(
                "area {} is {} bytes, write of {} bytes",
                id,
                content.len(),
                data.len()
            )));
        }
        content.copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, id: AreaId, offset: usize, len: usize) -> Result<Bytes> {
        let region = self.region(id)?;
        let content = region.read();
        check_range(id, content.len(), offset, len)?;
        Ok(Bytes::copy_from_slice(&content[offset..offset + len]))
    }

    fn write_at(&self, id: AreaId, offset: usize, data: &[u8]) -> Result<()> {
        let region = self.region(id)?;
        let mut content = region.write();
        check_range(id, content.len(), offset, data.len())?;
        content[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn delete_area(&self, id: AreaId) -> Result<()> {
        match self.areas.remove(&id) {
            Some(_) => {
                self.deleted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::not_found(format!("area {}", id))),
        }
    }

    fn area_size(&self, id: AreaId) -> Result<usize> {
        Ok(self.region(id)?.read().len())
    }

    fn contains(&self, id: AreaId) -> bool {
        self.areas.contains_key(&id)
    }

    fn area_count(&self) -> usize {
        self.areas.len()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.structure.lock()
    }
}
