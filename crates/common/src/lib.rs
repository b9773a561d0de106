//! Shared foundation for the allocator crates
//!
//! Platform constants, alignment arithmetic and a thin heap layer whose
//! failure mode is process termination rather than a recoverable error.
//! Everything else in the workspace builds on this crate.

pub mod constants;
pub mod heap;

pub use constants::{CACHE_LINE_SIZE, CPU_PAGE_SIZE, DEFAULT_CHUNK_SIZE, MAX_ALIGN};

/// Round `size` up to the next multiple of `align`.
///
/// `align` must be a power of two. Callers guarantee the sum does not
/// overflow; allocation entry points enforce this through their size caps.
#[inline(always)]
#[must_use]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 16, 0)]
    #[case(1, 16, 16)]
    #[case(15, 16, 16)]
    #[case(16, 16, 16)]
    #[case(17, 16, 32)]
    #[case(4096, 16, 4096)]
    #[case(5, 8, 8)]
    #[case(1, 1, 1)]
    fn align_up_rounds_to_multiple(
        #[case] size: usize,
        #[case] align: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(align_up(size, align), expected);
    }

    #[test]
    fn max_align_is_power_of_two() {
        assert!(MAX_ALIGN.is_power_of_two());
        assert_eq!(DEFAULT_CHUNK_SIZE % MAX_ALIGN, 0);
    }
}
