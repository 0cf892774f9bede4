//! verslog - a versioned append-only persistent log engine
//!
//! Many named logs are multiplexed over one shared raw block device.
//! Each log is an ordered sequence of fixed-size entries keyed by an
//! application-supplied monotonic version and a hybrid logical clock,
//! with variable-length payloads stored in a separate data space.
//!
//! The engine provides:
//! - Durable appends with crash-consistent metadata commit (data, then
//!   entry, then a double-buffered root record)
//! - Binary-searchable lookup by version, clock, or index
//! - Head/tail lifecycle: trim, truncate, zeroout
//! - Serialized log tails for state transfer between replicas
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use verslog::{Hlc, PersistLog, PersistPool};
//!
//! let pool = PersistPool::open(device, PoolOptions::default())?;
//! let log = PersistLog::open(pool, "members")?;
//!
//! log.append(b"payload", 1, Hlc::new(100, 0))?;
//! let data = log.entry(1)?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod error;
pub mod hlc;
pub mod log;
pub mod meta;
pub mod pool;
pub mod segment;
mod utility;

// Re-exports for convenience
pub use error::{LogError, Result};
pub use hlc::Hlc;
pub use log::{LogEntry, PersistLog};
pub use pool::{PersistPool, PoolOptions};

/// Constants fixed by the on-device layout
pub mod constants {
    /// Device block (LBA) size in bytes
    pub const BLOCK_SIZE: usize = 4096;

    /// log2 of the block size
    pub const BLOCK_BITS: u32 = 12;

    /// Maximum number of logs a device can host
    pub const MAX_LOGS: usize = 64;

    /// Blocks reserved for root records (two alternating copies per log)
    pub const ROOT_REGION_BLOCKS: u64 = (MAX_LOGS as u64) * 2;

    /// Block holding the free-segment bitmap
    pub const BITMAP_LBA: u64 = ROOT_REGION_BLOCKS;

    /// First block of the segment pool
    pub const SEGMENT_POOL_LBA: u64 = BITMAP_LBA + 1;

    /// Sentinel index meaning "no such entry"
    pub const INVALID_INDEX: i64 = -1;

    /// Version of a log that has never accepted an append
    pub const INVALID_VERSION: i64 = -1;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::constants::{INVALID_INDEX, INVALID_VERSION};
    pub use crate::error::{LogError, Result};
    pub use crate::hlc::Hlc;
    pub use crate::log::{LogEntry, PersistLog};
    pub use crate::pool::{PersistPool, PoolOptions};
}
