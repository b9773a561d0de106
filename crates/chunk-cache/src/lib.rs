//! Lock-free bounded object cache
//!
//! A fixed ring of slots shared by any number of threads that claim and
//! return pre-allocated chunks, plus a periodic `upkeep` pass that keeps
//! the supply inside a hysteresis band instead of allocating on demand.
//!
//! COMPLIANCE:
//! - No locks anywhere: claim and publish are compare-and-swap retry loops
//! - A chunk has exactly one holder at a time; the slot swap is the handover
//! - Steady-state traffic never touches the heap, only `upkeep` does
//!
//! # Examples
//!
//! ```
//! use chunk_cache::ChunkCache;
//!
//! let cache = ChunkCache::<u8>::new(64, 8).expect("valid configuration");
//! cache.upkeep();
//!
//! let mut chunk = cache.alloc();
//! chunk.fill(7);
//! cache.free(chunk);
//! ```

mod cache;
mod error;

pub use cache::{ChunkCache, DEFAULT_FACTOR};
pub use error::CacheError;
