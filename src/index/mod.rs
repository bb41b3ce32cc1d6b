//! Versioned sorted indexes.
//!
//! ## Structure
//!
//! - [`block`]: compact sorted blocks and their persistent descriptors
//! - [`sorted`]: [`SortedIndex`], the mutable working form of one index
//! - [`generation`]: committed versions of an index and their reclamation
//! - [`snapshot`]: [`IndexSnapshot`], a reader view pinning generations
//! - [`store`]: [`IndexSetStore`], the persistent root
//!
//! ## Write path
//!
//! 1. [`IndexSetStore::snapshot`] pins the current generation of every index
//! 2. [`IndexSnapshot::index_mut`] checks out a [`SortedIndex`]; mutated
//!    blocks are copied before the first write
//! 3. [`IndexSetStore::commit`] flushes changed blocks, writes a new
//!    generation per changed index and atomically repoints the start area
//! 4. Replaced generations are freed once no snapshot pins them

pub mod block;
pub mod generation;
pub mod snapshot;
pub mod sorted;
pub mod store;

pub use block::{BlockEntry, BlockSource, CompactBlock};
pub use generation::{Generation, GenerationRef, GenerationState, IndexChain};
pub use snapshot::IndexSnapshot;
pub use sorted::SortedIndex;
pub use store::{IndexSetStore, StoreStats, INDEX_TYPE_SORTED};
