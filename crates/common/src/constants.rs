//! Platform and sizing constants shared across the workspace

/// Strictest alignment the allocators guarantee.
///
/// Matches the platform's maximum fundamental alignment, so memory returned
/// at a multiple of this can hold a value of any primitive type.
pub const MAX_ALIGN: usize = align_of::<u128>();

/// Page size assumed when reserving slack below the address-space limit.
pub const CPU_PAGE_SIZE: usize = 4096;

/// Pooled-chunk size used by arena pools created with `Default`.
pub const DEFAULT_CHUNK_SIZE: usize = CPU_PAGE_SIZE;

/// Cache line size used when padding shared atomic counters.
pub const CACHE_LINE_SIZE: usize = 64;
