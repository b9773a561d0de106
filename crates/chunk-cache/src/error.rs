//! Cache configuration errors

use thiserror::Error;

/// Errors reported by cache construction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The hysteresis factor must leave room between the grow band and the
    /// shrink band.
    #[error("hysteresis factor must be at least 3, got {factor}")]
    FactorTooSmall {
        /// Rejected factor value.
        factor: u64,
    },
    /// Chunks must hold at least one element.
    #[error("chunk length must be non-zero")]
    ZeroChunkLen,
    /// The ring must be able to hold at least one chunk.
    #[error("minimum chunk count must be non-zero")]
    ZeroMinChunks,
    /// `factor * min_chunks` slots do not fit in the address space.
    #[error("ring capacity overflows the address space")]
    CapacityOverflow,
}
