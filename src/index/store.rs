//! Index set store.
//!
//! Owns the persistent root of a set of indexes and the generation chain
//! of each one.
//!
//! ## Persistent layout
//!
//! ```text
//! Start area (16 bytes, fixed id for the life of the store):
//! +-------------+--------------+---------------------------+
//! | magic: i32  | version: i32 | index header pointer: i64 |
//! +-------------+--------------+---------------------------+
//!
//! Index header area (rewritten to a new area on every change):
//! +--------------+---------------+------------------+
//! | version: i32 | reserved: i32 | index count: i64 |
//! +--------------+---------------+------------------+
//! | type: i32 | block size: i32 | generation: i64  |  x index count
//! +-----------+-----------------+------------------+
//! ```
//!
//! Every structural change writes new areas first and repoints the start
//! area last, so a crash leaves either the old or the new root reachable.
//! Areas orphaned that way are garbage, never corruption.
//!
//! ## Locking
//!
//! Structural changes hold the area store lock. The in-memory generation
//! table sits behind a `RwLock` that snapshot issuance only reads, so
//! readers never wait on commit I/O.

use super::block::BlockSource;
use super::generation::{Generation, GenerationRef, IndexChain};
use super::snapshot::IndexSnapshot;
use super::sorted::SortedIndex;
use crate::area::{Area, AreaId, SharedAreaStore};
use crate::cache::{BlockCache, CacheStats};
use crate::config::{Options, MAX_BLOCK_SIZE};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// Magic number of the start area
pub const START_MAGIC: i32 = 0x0CA9_0291;

/// Version of the start and index header areas
pub const STORE_VERSION: i32 = 1;

/// The only supported index type: sorted compact blocks
pub const INDEX_TYPE_SORTED: i32 = 1;

const START_AREA_SIZE: usize = 16;
const HEADER_PREFIX_SIZE: usize = 16;
const HEADER_ENTRY_SIZE: usize = 16;

/// Point-in-time counters of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Generations not yet freed, per index (the current one included)
    pub live_generations: Vec<usize>,
    /// Superseded areas waiting for their generation to be freed
    pub pending_deleted_areas: usize,
}

#[derive(Debug)]
struct StoreState {
    header_pointer: AreaId,
    chains: Vec<Arc<IndexChain>>,
}

/// A persistent, versioned set of sorted indexes.
///
/// # Thread Safety
///
/// `IndexSetStore` is `Send + Sync`. Any number of threads may take
/// snapshots and read through them while another commits.
#[derive(Debug)]
pub struct IndexSetStore {
    areas: SharedAreaStore,
    source: BlockSource,
    options: Options,
    start_pointer: AreaId,
    state: RwLock<StoreState>,
}

impl IndexSetStore {
    /// Creates an empty index set in `areas`.
    pub fn create(areas: SharedAreaStore, options: Options) -> Result<Self> {
        options.validate()?;
        let guard = areas.lock();

        let header_pointer = write_header(&areas, &[])?;
        let start_pointer = match write_new_start(&areas, header_pointer) {
            Ok(pointer) => pointer,
            Err(e) => {
                discard_areas(&areas, None, &[header_pointer]);
                return Err(e);
            }
        };
        drop(guard);

        log::info!("Created index set (start area {})", start_pointer);
        Ok(Self::assemble(areas, options, start_pointer, header_pointer, Vec::new()))
    }

    /// Opens the index set whose start area is `start_pointer`.
    pub fn open(areas: SharedAreaStore, start_pointer: AreaId, options: Options) -> Result<Self> {
        options.validate()?;
        let guard = areas.lock();

        let mut start = Area::open(&areas, start_pointer)?;
        let magic = start.read_i32()?;
        if magic != START_MAGIC {
            return Err(Error::format(format!(
                "start area {} has magic {:#010x}, expected {:#010x}",
                start_pointer, magic, START_MAGIC
            )));
        }
        let version = start.read_i32()?;
        if version != STORE_VERSION {
            return Err(Error::format(format!(
                "start area {} has version {}, expected {}",
                start_pointer, version, STORE_VERSION
            )));
        }
        let header_pointer = start.read_i64()?;

        let slots = read_header(&areas, header_pointer)?;
        let mut generations = Vec::with_capacity(slots.len());
        for (index, (block_size, pointer)) in slots.into_iter().enumerate() {
            generations.push(Generation::load(&areas, index, pointer, block_size)?);
        }
        drop(guard);

        log::info!(
            "Opened index set (start area {}, {} indexes)",
            start_pointer,
            generations.len()
        );
        Ok(Self::assemble(areas, options, start_pointer, header_pointer, generations))
    }

    fn assemble(
        areas: SharedAreaStore,
        options: Options,
        start_pointer: AreaId,
        header_pointer: AreaId,
        generations: Vec<Generation>,
    ) -> Self {
        let source =
            BlockSource::new(Arc::clone(&areas), Arc::new(BlockCache::new(options.block_cache_size)));
        let chains = generations.into_iter().map(|g| IndexChain::new(source.clone(), g)).collect();
        Self {
            areas,
            source,
            options,
            start_pointer,
            state: RwLock::new(StoreState { header_pointer, chains }),
        }
    }

    /// Id of the start area; pass it to [`IndexSetStore::open`].
    pub fn start_pointer(&self) -> AreaId {
        self.start_pointer
    }

    /// The options the store was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The underlying area store.
    pub fn areas(&self) -> &SharedAreaStore {
        &self.areas
    }

    /// Number of indexes.
    pub fn index_count(&self) -> usize {
        self.state.read().chains.len()
    }

    /// Block size of index `n`.
    pub fn block_size(&self, n: usize) -> Result<usize> {
        Ok(self.chain(n)?.block_size())
    }

    /// The current generation of index `n`.
    pub fn generation(&self, n: usize) -> Result<Arc<Generation>> {
        Ok(self.chain(n)?.current())
    }

    fn chain(&self, n: usize) -> Result<Arc<IndexChain>> {
        let state = self.state.read();
        state
            .chains
            .get(n)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("index {} (store has {})", n, state.chains.len())))
    }

    /// Appends `count` empty indexes and returns their ordinals.
    pub fn prepare_indexes(
        &self,
        count: usize,
        index_type: i32,
        block_size: usize,
    ) -> Result<Range<usize>> {
        if index_type != INDEX_TYPE_SORTED {
            return Err(Error::invalid_argument(format!("unsupported index type {}", index_type)));
        }
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(Error::invalid_argument(format!(
                "block size {} outside 1..={}",
                block_size, MAX_BLOCK_SIZE
            )));
        }

        let _guard = self.areas.lock();
        let first = self.index_count();
        if count == 0 {
            return Ok(first..first);
        }

        let mut written = Vec::with_capacity(count + 1);
        let prepared = (|| -> Result<(AreaId, Vec<Generation>)> {
            let mut slots = self.header_slots();
            let mut generations = Vec::with_capacity(count);
            for index in first..first + count {
                let pointer = Generation::write(&self.areas, &[])?;
                written.push(pointer);
                slots.push((block_size, pointer));
                generations.push(Generation::new(index, pointer, block_size, Vec::new()));
            }
            let header = write_header(&self.areas, &slots)?;
            written.push(header);
            self.repoint_start(header)?;
            Ok((header, generations))
        })();

        let (header, generations) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                discard_areas(&self.areas, Some(&self.source), &written);
                return Err(e);
            }
        };

        let old_header = {
            let mut state = self.state.write();
            state.chains.extend(generations.into_iter().map(|g| IndexChain::new(self.source.clone(), g)));
            std::mem::replace(&mut state.header_pointer, header)
        };
        discard_areas(&self.areas, None, &[old_header]);

        log::info!("Prepared indexes {}..{} (block size {})", first, first + count, block_size);
        Ok(first..first + count)
    }

    /// Prepares `count` indexes with the configured default block size.
    pub fn prepare_default_indexes(&self, count: usize) -> Result<Range<usize>> {
        self.prepare_indexes(count, INDEX_TYPE_SORTED, self.options.default_block_size)
    }

    /// Takes a snapshot of the current generation of every index.
    pub fn snapshot(&self) -> IndexSnapshot {
        let generations = {
            let state = self.state.read();
            state.chains.iter().map(IndexChain::acquire).collect()
        };
        IndexSnapshot::new(self.source.clone(), generations)
    }

    /// Persists the changes of `snapshot` as new generations.
    ///
    /// Fails with [`Error::CommitConflict`] if another commit replaced a
    /// changed index since the snapshot was taken. Any other failure is
    /// reported as [`Error::Commit`]; in both cases the store is unchanged.
    pub fn commit(&self, snapshot: IndexSnapshot) -> Result<()> {
        // Declared first so the references drop after the store lock.
        let (generations, mut working) = snapshot.into_parts();
        working.retain(|_, index| index.is_changed());
        if working.is_empty() {
            return Ok(());
        }

        let replaced = {
            let _guard = self.areas.lock();
            let mut written = Vec::new();
            match self.commit_locked(&generations, &mut working, &mut written) {
                Ok(replaced) => replaced,
                Err(e) => {
                    discard_areas(&self.areas, Some(&self.source), &written);
                    return Err(Error::commit(e));
                }
            }
        };

        for chain in &replaced {
            chain.reclaim();
        }
        log::info!("Committed {} indexes", replaced.len());
        Ok(())
    }

    fn commit_locked(
        &self,
        snapshot: &[GenerationRef],
        working: &mut BTreeMap<usize, SortedIndex>,
        written: &mut Vec<AreaId>,
    ) -> Result<Vec<Arc<IndexChain>>> {
        let chains = self.state.read().chains.clone();

        for &n in working.keys() {
            let pinned = snapshot
                .get(n)
                .ok_or_else(|| Error::invalid_state(format!("snapshot has no index {}", n)))?;
            let current = chains[n].current();
            if current.id() != pinned.id() {
                return Err(Error::CommitConflict { index: n, snapshot: pinned.id(), current: current.id() });
            }
        }

        let mut slots = self.header_slots();
        let mut staged = Vec::with_capacity(working.len());
        for (&n, index) in working.iter_mut() {
            let entries = index.flush_blocks(written)?;
            let pointer = Generation::write(&self.areas, &entries)?;
            written.push(pointer);
            slots[n].1 = pointer;
            staged.push((n, Generation::new(n, pointer, index.block_size(), entries)));
        }

        let header = write_header(&self.areas, &slots)?;
        written.push(header);
        self.repoint_start(header)?;

        // Visible from here on; nothing below can fail.
        let mut replaced = Vec::with_capacity(staged.len());
        let old_header = {
            let mut state = self.state.write();
            for (n, generation) in staged {
                let superseded = working.get(&n).map(SortedIndex::superseded).unwrap_or(&[]);
                state.chains[n].install(generation, superseded);
                replaced.push(Arc::clone(&state.chains[n]));
            }
            std::mem::replace(&mut state.header_pointer, header)
        };
        discard_areas(&self.areas, None, &[old_header]);
        Ok(replaced)
    }

    /// Replaces index `n` with an empty generation. Its blocks are deleted
    /// once no snapshot references them.
    ///
    /// Like [`IndexSetStore::commit`], a failure is reported as
    /// [`Error::Commit`] and leaves the store unchanged.
    pub fn drop_index(&self, n: usize) -> Result<()> {
        let chain = self.chain(n)?;
        {
            let _guard = self.areas.lock();
            let current = chain.current();

            let mut written = Vec::with_capacity(2);
            let staged = (|| -> Result<(AreaId, AreaId)> {
                let pointer = Generation::write(&self.areas, &[])?;
                written.push(pointer);
                let mut slots = self.header_slots();
                slots[n].1 = pointer;

                let header = write_header(&self.areas, &slots)?;
                written.push(header);
                self.repoint_start(header)?;
                Ok((pointer, header))
            })();

            let (pointer, header) = match staged {
                Ok(staged) => staged,
                Err(e) => {
                    discard_areas(&self.areas, None, &written);
                    return Err(Error::commit(e));
                }
            };

            let old_header = {
                let mut state = self.state.write();
                let generation = Generation::new(n, pointer, chain.block_size(), Vec::new());
                chain.install(generation, &current.block_pointers());
                std::mem::replace(&mut state.header_pointer, header)
            };
            discard_areas(&self.areas, None, &[old_header]);
            log::info!("Dropped index {} ({} blocks released)", n, current.block_entries().len());
        }
        chain.reclaim();
        Ok(())
    }

    /// Statistics of the decoded block cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.source.cache().stats()
    }

    /// Generation and reclamation counters.
    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            live_generations: state.chains.iter().map(|c| c.live_generations()).collect(),
            pending_deleted_areas: state.chains.iter().map(|c| c.pending_deleted_areas()).sum(),
        }
    }

    /// Closes the store. Generations still pinned by snapshots stay
    /// readable until those snapshots are dropped.
    pub fn close(self) {
        log::info!("Closed index set (start area {})", self.start_pointer);
    }

    /// `(block size, generation pointer)` of every index.
    fn header_slots(&self) -> Vec<(usize, AreaId)> {
        self.state.read().chains.iter().map(|c| (c.block_size(), c.current().pointer())).collect()
    }

    fn repoint_start(&self, header_pointer: AreaId) -> Result<()> {
        let mut start = Area::open(&self.areas, self.start_pointer)?;
        write_start(&mut start, header_pointer)
    }
}

fn write_start(area: &mut Area, header_pointer: AreaId) -> Result<()> {
    area.set_position(0)?;
    area.write_i32(START_MAGIC)?;
    area.write_i32(STORE_VERSION)?;
    area.write_i64(header_pointer)?;
    area.flush()
}

fn write_new_start(areas: &SharedAreaStore, header_pointer: AreaId) -> Result<AreaId> {
    let mut start = Area::create(areas, START_AREA_SIZE)?;
    if let Err(e) = write_start(&mut start, header_pointer) {
        discard_areas(areas, None, &[start.id()]);
        return Err(e);
    }
    Ok(start.id())
}

fn write_header(areas: &SharedAreaStore, slots: &[(usize, AreaId)]) -> Result<AreaId> {
    let mut area = Area::create(areas, HEADER_PREFIX_SIZE + slots.len() * HEADER_ENTRY_SIZE)?;
    let written = (|| -> Result<()> {
        area.write_i32(STORE_VERSION)?;
        area.write_i32(0)?;
        area.write_i64(slots.len() as i64)?;
        for (block_size, pointer) in slots {
            area.write_i32(INDEX_TYPE_SORTED)?;
            area.write_i32(*block_size as i32)?;
            area.write_i64(*pointer)?;
        }
        area.flush()
    })();

    match written {
        Ok(()) => Ok(area.id()),
        Err(e) => {
            discard_areas(areas, None, &[area.id()]);
            Err(e)
        }
    }
}

fn read_header(areas: &SharedAreaStore, pointer: AreaId) -> Result<Vec<(usize, AreaId)>> {
    let mut area = Area::open(areas, pointer)?;
    let version = area.read_i32()?;
    if version != STORE_VERSION {
        return Err(Error::format(format!(
            "index header {} has version {}, expected {}",
            pointer, version, STORE_VERSION
        )));
    }
    let _reserved = area.read_i32()?;
    let count = area.read_i64()?;
    let expected = usize::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(HEADER_ENTRY_SIZE))
        .and_then(|n| n.checked_add(HEADER_PREFIX_SIZE));
    if expected != Some(area.size()) {
        return Err(Error::corruption(format!(
            "index header {} is {} bytes for {} indexes",
            pointer,
            area.size(),
            count
        )));
    }

    let mut slots = Vec::with_capacity(count as usize);
    for n in 0..count {
        let index_type = area.read_i32()?;
        if index_type != INDEX_TYPE_SORTED {
            return Err(Error::format(format!("index {} has unsupported type {}", n, index_type)));
        }
        let block_size = area.read_i32()?;
        if block_size < 1 || block_size as usize > MAX_BLOCK_SIZE {
            return Err(Error::corruption(format!("index {} has block size {}", n, block_size)));
        }
        slots.push((block_size as usize, area.read_i64()?));
    }
    Ok(slots)
}

/// Best-effort deletion of areas that never became (or stopped being)
/// reachable.
fn discard_areas(areas: &SharedAreaStore, source: Option<&BlockSource>, ids: &[AreaId]) {
    for &id in ids {
        if let Some(source) = source {
            source.cache().invalidate(id);
        }
        if let Err(e) = areas.delete_area(id) {
            log::warn!("Failed to delete area {}: {}", id, e);
        }
    }
}
