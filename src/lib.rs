//! # Blockdex - A Versioned Block Index Storage Engine
//!
//! Blockdex stores sorted secondary indexes (ordered sequences of row
//! pointers) on durable area storage and lets readers take isolated
//! snapshots while writers mutate and commit.
//!
//! ## Architecture
//!
//! The engine consists of several key components:
//!
//! - **Areas**: Fixed-size persistent byte regions behind the [`AreaStore`] trait
//! - **Record Directory**: Growable slot directory that never relocates a record
//! - **Compact Blocks**: Sorted runs of row pointers stored in 1 to 4 bytes each
//! - **Generations**: Copy-on-write versions of each index, freed when unreferenced
//! - **Block Cache**: Caches decoded blocks by area id
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use blockdex::{FileAreaStore, IndexSetStore, Options};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), blockdex::Error> {
//! let options = Options::default();
//! let areas = Arc::new(FileAreaStore::open("./data", &options)?);
//! let store = IndexSetStore::create(areas, options)?;
//!
//! // Two sorted indexes holding up to 128 entries per block
//! let indexes = store.prepare_indexes(2, 1, 128)?;
//!
//! // Write through a snapshot, then commit
//! let mut snapshot = store.snapshot();
//! let index = snapshot.index_mut(indexes.start)?;
//! index.insert(42)?;
//! index.insert(7)?;
//! store.commit(snapshot)?;
//!
//! // Read
//! let reader = store.snapshot();
//! assert_eq!(reader.index(0)?.to_vec()?, vec![7, 42]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod area;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod index;

// Re-exports
pub use area::{Area, AreaId, AreaStore, FileAreaStore, MemoryAreaStore, SharedAreaStore, NO_AREA};
pub use cache::{BlockCache, CacheStats};
pub use config::Options;
pub use directory::RecordDirectory;
pub use error::{Error, Result};
pub use index::{
    GenerationState, IndexSetStore, IndexSnapshot, SortedIndex, StoreStats, INDEX_TYPE_SORTED,
};
