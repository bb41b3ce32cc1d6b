//! Configuration options for the blockdex storage engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest entry count a single block can hold (12-bit count field).
pub const MAX_BLOCK_SIZE: usize = 0xFFF;

/// Configuration options for opening area stores and index sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Create the area directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the area directory already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// fsync every area write in the file backend.
    /// Default: true
    pub sync_writes: bool,

    /// Block size used by `prepare_indexes` callers that don't pick one.
    /// Default: 512 entries
    pub default_block_size: usize,

    /// Decoded block cache size (in bytes).
    /// Set to 0 to disable caching.
    /// Default: 8MB
    pub block_cache_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            sync_writes: true,
            default_block_size: 512,
            block_cache_size: 8 * 1024 * 1024, // 8MB
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a JSON document. Missing fields take their
    /// default values.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let options: Options = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serializes the options to pretty-printed JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Sets whether to create the area directory if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether an existing area directory is an error.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets whether area writes are synced to disk.
    pub fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Sets the default block size.
    pub fn default_block_size(mut self, size: usize) -> Self {
        self.default_block_size = size;
        self
    }

    /// Sets the decoded block cache size.
    pub fn block_cache_size(mut self, size: usize) -> Self {
        self.block_cache_size = size;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.default_block_size == 0 || self.default_block_size > MAX_BLOCK_SIZE {
            return Err(crate::Error::invalid_argument(format!(
                "default_block_size must be between 1 and {}",
                MAX_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}
