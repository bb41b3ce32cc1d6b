//! Point-in-time view of an index set.
//!
//! A snapshot pins one generation of every index that existed when it was
//! taken. Reads through it are unaffected by later commits. Indexes
//! checked out with [`IndexSnapshot::index_mut`] accumulate changes that
//! [`crate::IndexSetStore::commit`] turns into new generations.
//!
//! # Example
//!
//! ```rust
//! use blockdex::{IndexSetStore, MemoryAreaStore, Options};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), blockdex::Error> {
//! let store = IndexSetStore::create(Arc::new(MemoryAreaStore::new()), Options::default())?;
//! store.prepare_indexes(1, 1, 64)?;
//!
//! let mut writer = store.snapshot();
//! writer.index_mut(0)?.insert(42)?;
//!
//! let reader = store.snapshot();
//! store.commit(writer)?;
//!
//! // The reader still sees the index as it was.
//! assert!(reader.index(0)?.is_empty());
//! assert!(store.snapshot().index(0)?.contains(42)?);
//! # Ok(())
//! # }
//! ```

use super::block::BlockSource;
use super::generation::{Generation, GenerationRef};
use super::sorted::SortedIndex;
use crate::error::{Error, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

/// Generations pinned by a snapshot, plus its uncommitted changes.
pub struct IndexSnapshot {
    source: BlockSource,
    generations: Vec<GenerationRef>,
    working: BTreeMap<usize, SortedIndex>,
}

impl IndexSnapshot {
    pub(crate) fn new(source: BlockSource, generations: Vec<GenerationRef>) -> Self {
        Self { source, generations, working: BTreeMap::new() }
    }

    /// Number of indexes visible to the snapshot.
    pub fn index_count(&self) -> usize {
        self.generations.len()
    }

    fn pinned(&self, n: usize) -> Result<&GenerationRef> {
        self.generations
            .get(n)
            .ok_or_else(|| Error::not_found(format!("index {} (snapshot has {})", n, self.generations.len())))
    }

    /// The pinned generation of index `n`.
    pub fn generation(&self, n: usize) -> Result<&Generation> {
        Ok(&**self.pinned(n)?)
    }

    /// A copy of index `n` as this snapshot sees it, pending changes
    /// included. The copy pins the generation itself and stays readable
    /// after the snapshot is dropped.
    pub fn index(&self, n: usize) -> Result<SortedIndex> {
        match self.working.get(&n) {
            Some(index) => Ok(index.clone()),
            None => Ok(self.pinned(n)?.create_index(&self.source)),
        }
    }

    /// Checks out index `n` for modification.
    pub fn index_mut(&mut self, n: usize) -> Result<&mut SortedIndex> {
        let generation = self.generations.get(n).ok_or_else(|| {
            Error::not_found(format!("index {} (snapshot has {})", n, self.generations.len()))
        })?;
        Ok(match self.working.entry(n) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(generation.create_index(&self.source)),
        })
    }

    /// True if any checked out index was changed.
    pub fn is_modified(&self) -> bool {
        self.working.values().any(SortedIndex::is_changed)
    }

    /// Throws away uncommitted changes.
    pub fn discard_changes(&mut self) {
        self.working.clear();
    }

    pub(crate) fn into_parts(self) -> (Vec<GenerationRef>, BTreeMap<usize, SortedIndex>) {
        (self.generations, self.working)
    }
}

impl fmt::Debug for IndexSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSnapshot")
            .field("generations", &self.generations.iter().map(|g| g.id()).collect::<Vec<_>>())
            .field("checked_out", &self.working.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::area::MemoryAreaStore;
    use crate::{Error, IndexSetStore, Options};
    use std::sync::Arc;

    fn store_with(indexes: usize) -> IndexSetStore {
        let store =
            IndexSetStore::create(Arc::new(MemoryAreaStore::new()), Options::default()).unwrap();
        store.prepare_indexes(indexes, 1, 16).unwrap();
        store
    }

    #[test]
    fn test_snapshot_holds_references() {
        let store = store_with(2);
        let first = store.snapshot();
        let second = store.snapshot();
        assert_eq!(first.index_count(), 2);
        assert_eq!(first.generation(0).unwrap().ref_count(), 2);

        drop(second);
        assert_eq!(first.generation(1).unwrap().ref_count(), 1);
    }

    #[test]
    fn test_pending_changes_are_private() {
        let store = store_with(1);
        let mut snapshot = store.snapshot();
        assert!(!snapshot.is_modified());

        snapshot.index_mut(0).unwrap().insert(3).unwrap();
        snapshot.index_mut(0).unwrap().insert(1).unwrap();
        assert!(snapshot.is_modified());
        assert_eq!(snapshot.index(0).unwrap().to_vec().unwrap(), vec![1, 3]);
        assert!(store.snapshot().index(0).unwrap().is_empty());

        snapshot.discard_changes();
        assert!(!snapshot.is_modified());
        assert!(snapshot.index(0).unwrap().is_empty());
    }

    #[test]
    fn test_index_outlives_snapshot() {
        let store = IndexSetStore::create(
            Arc::new(MemoryAreaStore::new()),
            Options::default().block_cache_size(0),
        )
        .unwrap();
        store.prepare_indexes(1, 1, 4).unwrap();
        let mut writer = store.snapshot();
        for value in 0..8 {
            writer.index_mut(0).unwrap().insert(value).unwrap();
        }
        store.commit(writer).unwrap();

        let index = store.snapshot().index(0).unwrap();
        assert_eq!(store.generation(0).unwrap().ref_count(), 1);

        let mut writer = store.snapshot();
        writer.index_mut(0).unwrap().remove(0).unwrap();
        store.commit(writer).unwrap();
        assert_eq!(store.stats().live_generations, vec![2]);

        assert_eq!(index.to_vec().unwrap(), (0..8).collect::<Vec<_>>());
        assert!(index.contains(0).unwrap());
        drop(index);
        assert_eq!(store.stats().live_generations, vec![1]);
    }

    #[test]
    fn test_unknown_index() {
        let store = store_with(1);
        let mut snapshot = store.snapshot();
        assert!(matches!(snapshot.index(1), Err(Error::NotFound(_))));
        assert!(matches!(snapshot.index_mut(5), Err(Error::NotFound(_))));
        assert!(snapshot.generation(1).is_err());
    }

    #[test]
    fn test_snapshot_does_not_see_later_indexes() {
        let store = store_with(1);
        let snapshot = store.snapshot();
        store.prepare_indexes(2, 1, 16).unwrap();
        assert_eq!(snapshot.index_count(), 1);
        assert_eq!(store.snapshot().index_count(), 3);
    }
}
