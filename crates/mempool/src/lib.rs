//! Checkpointed arena allocator
//!
//! Bump-pointer allocation from growable chunks, with O(1) checkpoints that
//! roll the pool back to an earlier cursor in one call.
//!
//! COMPLIANCE:
//! - Hot allocation path is a pure pointer bump: no locks, no heap calls
//! - Requests above the pool threshold get dedicated exact-size chunks
//! - Rollback retires pooled chunks for reuse instead of freeing them
//! - Heap exhaustion aborts the process; there is no error path to handle
//!
//! # Examples
//!
//! ```
//! use mempool::MemPool;
//!
//! let mut pool = MemPool::new(4096);
//! let greeting = pool.strdup("hello");
//! assert_eq!(greeting, "hello");
//!
//! let before = pool.stats();
//! let mark = pool.push();
//! let joined = pool.join(&["alpha", "beta"], Some('-'));
//! assert_eq!(joined, "alpha-beta");
//! pool.restore(mark);
//! assert_eq!(pool.stats(), before);
//! ```

mod pool;
mod string;

pub use pool::{Checkpoint, MemPool, POOL_SIZE_MAX, PoolStats};
