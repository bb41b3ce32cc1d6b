//! Cache of decoded index blocks.
//!
//! Flushed compact blocks are immutable under their area id, so a decoded
//! block can be shared by every reader that materializes the same area.
//! The cache keeps the most recently used decoded arrays in memory.

mod lru;

pub use lru::{BlockCache, CacheStats};
