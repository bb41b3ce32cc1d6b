//! Index generations and their reclamation chain.
//!
//! Every commit of an index produces a new [`Generation`]: an immutable
//! table of block descriptors persisted in its own area.
//!
//! ```text
//! Generation area:
//! +--------------+---------------+-------------------+
//! | version: i32 | reserved: i32 | entry count: i64  |
//! +--------------+---------------+-------------------+
//! | BlockEntry 0 (28 bytes) ...                      |
//! +--------------------------------------------------+
//! ```
//!
//! Generations of one index form an [`IndexChain`], oldest first. When a
//! commit replaces the current generation, the old one is marked
//! [`GenerationState::Deleted`] and carries the areas that the commit
//! superseded. A deleted generation is freed (its areas deleted) once
//! nothing references it and every older generation has been freed, so
//! a snapshot never loses an area it can still reach.
//!
//! References are counted by [`GenerationRef`] handles: cloning one adds a
//! reference, dropping one removes it and triggers reclamation when it was
//! the last.

use super::block::{BlockEntry, BlockSource, BLOCK_ENTRY_SIZE};
use super::sorted::SortedIndex;
use crate::area::{Area, AreaId, SharedAreaStore};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Version tag of generation areas
pub const GENERATION_VERSION: i32 = 1;

/// Size of the generation area header
const GENERATION_HEADER_SIZE: usize = 16;

static NEXT_GENERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Installed as the current generation of its index
    Active,
    /// Replaced by a newer generation; freed once unreferenced
    Deleted,
    /// Areas released; the generation must not be used again
    Freed,
}

#[derive(Debug)]
struct GenerationInner {
    state: GenerationState,
    ref_count: usize,
    deleted_areas: Vec<AreaId>,
}

/// One committed version of one index.
pub struct Generation {
    id: u64,
    index: usize,
    pointer: AreaId,
    block_size: usize,
    entries: Vec<BlockEntry>,
    inner: Mutex<GenerationInner>,
}

impl Generation {
    /// Writes a generation area holding `entries` and returns its id.
    pub fn write(store: &SharedAreaStore, entries: &[BlockEntry]) -> Result<AreaId> {
        let size = GENERATION_HEADER_SIZE + entries.len() * BLOCK_ENTRY_SIZE;
        let mut area = Area::create(store, size)?;

        let written = (|| -> Result<()> {
            area.write_i32(GENERATION_VERSION)?;
            area.write_i32(0)?;
            area.write_i64(entries.len() as i64)?;
            for entry in entries {
                entry.write_to(&mut area)?;
            }
            area.flush()
        })();

        if let Err(e) = written {
            if let Err(cleanup) = store.delete_area(area.id()) {
                log::warn!("Failed to delete partial generation area {}: {}", area.id(), cleanup);
            }
            return Err(e);
        }
        Ok(area.id())
    }

    /// Reads and validates the block table of a generation area.
    pub fn read_entries(store: &SharedAreaStore, pointer: AreaId) -> Result<Vec<BlockEntry>> {
        let mut area = Area::open(store, pointer)?;

        let version = area.read_i32()?;
        if version != GENERATION_VERSION {
            return Err(Error::format(format!(
                "generation area {} has version {}, expected {}",
                pointer, version, GENERATION_VERSION
            )));
        }
        let _reserved = area.read_i32()?;
        let count = area.read_i64()?;

        let expected = (count >= 0)
            .then(|| (count as usize).checked_mul(BLOCK_ENTRY_SIZE))
            .flatten()
            .and_then(|n| n.checked_add(GENERATION_HEADER_SIZE));
        if expected != Some(area.size()) {
            return Err(Error::corruption(format!(
                "generation area {} is {} bytes for {} entries",
                pointer,
                area.size(),
                count
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(BlockEntry::read_from(&mut area)?);
        }
        if entries.windows(2).any(|w| w[0].last_entry > w[1].first_entry) {
            return Err(Error::corruption(format!(
                "generation area {} has overlapping blocks",
                pointer
            )));
        }
        Ok(entries)
    }

    /// Builds an active generation over a persisted block table.
    pub(crate) fn new(index: usize, pointer: AreaId, block_size: usize, entries: Vec<BlockEntry>) -> Self {
        Self {
            id: NEXT_GENERATION_ID.fetch_add(1, Ordering::Relaxed),
            index,
            pointer,
            block_size,
            entries,
            inner: Mutex::new(GenerationInner {
                state: GenerationState::Active,
                ref_count: 0,
                deleted_areas: Vec::new(),
            }),
        }
    }

    /// Loads the generation stored at `pointer`.
    pub(crate) fn load(
        store: &SharedAreaStore,
        index: usize,
        pointer: AreaId,
        block_size: usize,
    ) -> Result<Self> {
        let entries = Self::read_entries(store, pointer)?;
        if let Some(entry) = entries.iter().find(|e| e.count > block_size) {
            return Err(Error::corruption(format!(
                "block {} holds {} entries, index {} block size is {}",
                entry.block_pointer, entry.count, index, block_size
            )));
        }
        Ok(Self::new(index, pointer, block_size, entries))
    }

    /// Process-unique, increasing id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ordinal of the index this generation belongs to.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Area holding the block table.
    pub fn pointer(&self) -> AreaId {
        self.pointer
    }

    /// Maximum entries per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Block descriptors, in order.
    pub fn block_entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// Area ids of every block.
    pub fn block_pointers(&self) -> Vec<AreaId> {
        self.entries.iter().map(|e| e.block_pointer).collect()
    }

    /// Total number of index entries.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.count).sum()
    }

    /// True if the generation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GenerationState {
        self.inner.lock().state
    }

    /// Number of live [`GenerationRef`] handles.
    pub fn ref_count(&self) -> usize {
        self.inner.lock().ref_count
    }

    /// Number of superseded areas waiting for this generation to be freed.
    pub fn deleted_area_count(&self) -> usize {
        self.inner.lock().deleted_areas.len()
    }

    fn add_reference(&self) {
        let mut inner = self.inner.lock();
        assert!(
            inner.state != GenerationState::Freed,
            "reference taken on freed generation {}",
            self.id
        );
        inner.ref_count += 1;
    }

    /// Returns true if the generation became reclaimable.
    fn remove_reference(&self) -> bool {
        let mut inner = self.inner.lock();
        assert!(inner.ref_count > 0, "generation {} released more often than referenced", self.id);
        inner.ref_count -= 1;
        inner.ref_count == 0 && inner.state == GenerationState::Deleted
    }

    /// Schedules `area` for deletion when this generation is freed.
    pub(crate) fn add_deleted_area(&self, area: AreaId) {
        self.inner.lock().deleted_areas.push(area);
    }

    fn mark_deleted(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, GenerationState::Active, "generation {} retired twice", self.id);
        inner.state = GenerationState::Deleted;
    }

    /// Moves a deleted, unreferenced generation to `Freed` and hands back
    /// the areas to release.
    fn begin_free(&self) -> Option<Vec<AreaId>> {
        let mut inner = self.inner.lock();
        if inner.state != GenerationState::Deleted || inner.ref_count > 0 {
            return None;
        }
        inner.state = GenerationState::Freed;
        Some(std::mem::take(&mut inner.deleted_areas))
    }

    /// Deletes the superseded areas and the generation's own area.
    fn release_areas(&self, areas: Vec<AreaId>, source: &BlockSource) {
        for id in areas.into_iter().chain(std::iter::once(self.pointer)) {
            source.cache().invalidate(id);
            if let Err(e) = source.store().delete_area(id) {
                log::warn!("Failed to delete area {} of generation {}: {}", id, self.id, e);
            }
        }
        log::debug!("Freed generation {} of index {}", self.id, self.index);
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("pointer", &self.pointer)
            .field("blocks", &self.entries.len())
            .field("state", &inner.state)
            .field("ref_count", &inner.ref_count)
            .finish()
    }
}

#[derive(Debug)]
struct ChainState {
    current: Arc<Generation>,
    /// Replaced generations not yet freed, oldest first
    retired: VecDeque<Arc<Generation>>,
}

/// The generations of one index, oldest first.
#[derive(Debug)]
pub struct IndexChain {
    index: usize,
    block_size: usize,
    source: BlockSource,
    state: Mutex<ChainState>,
}

impl IndexChain {
    /// Creates a chain whose current generation is `generation`.
    pub(crate) fn new(source: BlockSource, generation: Generation) -> Arc<Self> {
        Arc::new(Self {
            index: generation.index(),
            block_size: generation.block_size(),
            source,
            state: Mutex::new(ChainState { current: Arc::new(generation), retired: VecDeque::new() }),
        })
    }

    /// Ordinal of the index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Maximum entries per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The current generation.
    pub fn current(&self) -> Arc<Generation> {
        Arc::clone(&self.state.lock().current)
    }

    /// Takes a reference to the current generation.
    pub fn acquire(self: &Arc<Self>) -> GenerationRef {
        let generation = self.current();
        generation.add_reference();
        GenerationRef { chain: Arc::clone(self), generation }
    }

    /// Installs `generation` as current. The replaced generation is marked
    /// deleted and takes ownership of the `superseded` areas.
    ///
    /// Callers hold the area store lock.
    pub(crate) fn install(&self, generation: Generation, superseded: &[AreaId]) -> Arc<Generation> {
        assert_eq!(generation.index(), self.index, "generation installed on the wrong index");
        let generation = Arc::new(generation);

        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.current, Arc::clone(&generation));
        for area in superseded {
            previous.add_deleted_area(*area);
        }
        previous.mark_deleted();
        log::debug!(
            "Index {}: generation {} replaces {} ({} areas superseded)",
            self.index,
            generation.id(),
            previous.id(),
            superseded.len()
        );
        state.retired.push_back(previous);
        generation
    }

    /// Frees every leading retired generation that is no longer
    /// referenced. Returns the number freed.
    pub fn reclaim(&self) -> usize {
        let _guard = self.source.store().lock();
        self.reclaim_locked()
    }

    /// [`IndexChain::reclaim`] for callers already holding the store lock.
    pub(crate) fn reclaim_locked(&self) -> usize {
        let mut freed = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(oldest) = state.retired.front() {
                let Some(areas) = oldest.begin_free() else {
                    break;
                };
                if let Some(generation) = state.retired.pop_front() {
                    freed.push((generation, areas));
                }
            }
        }

        let count = freed.len();
        for (generation, areas) in freed {
            generation.release_areas(areas, &self.source);
        }
        count
    }

    /// Number of generations not yet freed, the current one included.
    pub fn live_generations(&self) -> usize {
        1 + self.state.lock().retired.len()
    }

    /// Number of superseded areas waiting on retired generations.
    pub fn pending_deleted_areas(&self) -> usize {
        self.state.lock().retired.iter().map(|g| g.deleted_area_count()).sum()
    }
}

/// A counted reference to a generation.
///
/// Must not be dropped while holding the area store lock: dropping the
/// last reference to a deleted generation takes that lock to reclaim it.
pub struct GenerationRef {
    chain: Arc<IndexChain>,
    generation: Arc<Generation>,
}

impl GenerationRef {
    /// A working copy of the index; blocks load on demand. The copy holds
    /// its own reference, so the blocks stay readable after `self` drops.
    pub fn create_index(&self, source: &BlockSource) -> SortedIndex {
        SortedIndex::pinned(source.clone(), self.clone())
    }

    /// True if this is still the current generation of its index.
    pub fn is_current(&self) -> bool {
        Arc::ptr_eq(&self.generation, &self.chain.state.lock().current)
    }
}

impl Clone for GenerationRef {
    fn clone(&self) -> Self {
        self.generation.add_reference();
        Self { chain: Arc::clone(&self.chain), generation: Arc::clone(&self.generation) }
    }
}

impl Drop for GenerationRef {
    fn drop(&mut self) {
        if self.generation.remove_reference() {
            self.chain.reclaim();
        }
    }
}

impl Deref for GenerationRef {
    type Target = Generation;

    fn deref(&self) -> &Generation {
        &self.generation
    }
}

impl fmt::Debug for GenerationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GenerationRef").field(&self.generation).finish()
    }
}
