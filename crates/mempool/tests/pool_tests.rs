//! Pool behavior: bump placement, the open-region protocol, checkpoints
//! and chunk reuse accounting

use std::ptr::NonNull;
use std::slice;

use mempool::MemPool;
use proptest::collection::vec as prop_vec;
use proptest::prelude::*;
use rstest::{fixture, rstest};
use test_utils::init_test_logging;

#[fixture]
fn pool() -> MemPool {
    init_test_logging();
    MemPool::new(4096)
}

proptest! {
    /// Every region handed out stays disjoint from every other live one:
    /// each keeps the fill pattern it was given, whatever the size mix.
    #[test]
    fn bump_regions_never_overlap(sizes in prop_vec(1usize..600, 1..40)) {
        let pool = MemPool::new(1024);
        let mut regions: Vec<(&mut [u8], u8)> = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let fill = (i % 251) as u8 + 1;
            let region = pool.alloc_zero(size);
            region.fill(fill);
            regions.push((region, fill));
        }
        for (region, fill) in &regions {
            prop_assert!(region.iter().all(|byte| byte == fill));
        }
    }
}

#[rstest]
fn pop_restores_the_pre_push_footprint(mut pool: MemPool) {
    let _ = pool.alloc(100);
    pool.push();
    let before = pool.stats();
    let first_after = pool.alloc(40);
    for _ in 0..64 {
        let _ = pool.alloc(1800);
    }
    let _ = pool.alloc(20_000);
    pool.pop();

    let after = pool.stats();
    assert_eq!(after.small_chunks, before.small_chunks);
    assert_eq!(after.small_bytes, before.small_bytes);
    assert_eq!(after.big_chunks, before.big_chunks);
    assert_eq!(after.big_bytes, before.big_bytes);
    // rolled-back small chunks stay with the pool
    assert!(after.unused_chunks > before.unused_chunks);

    // and the bump cursor is back where the checkpoint left it
    let replayed = pool.alloc(40);
    assert_eq!(replayed, first_after);
}

#[rstest]
fn restore_unwinds_nested_checkpoints(mut pool: MemPool) {
    let outer = pool.push();
    let _ = pool.alloc(3000);
    let _inner = pool.push();
    let _ = pool.alloc(8192);

    pool.restore(outer);
    let stats = pool.stats();
    assert_eq!(stats.big_chunks, 0);
    assert_eq!(stats.small_chunks, 1);
}

#[rstest]
#[cfg_attr(debug_assertions, should_panic(expected = "restore of a stale checkpoint"))]
fn restore_of_a_consumed_checkpoint_is_rejected(mut pool: MemPool) {
    let outer = pool.push();
    let inner = pool.push();
    pool.restore(outer);
    pool.restore(inner);
    // release builds report the misuse and leave the pool untouched
    assert_eq!(pool.stats().small_chunks, 1);
}

#[rstest]
#[cfg_attr(debug_assertions, should_panic(expected = "pop without a matching push"))]
fn pop_without_push_is_rejected(mut pool: MemPool) {
    pool.pop();
    assert_eq!(pool.stats().small_chunks, 1);
}

#[rstest]
#[case::stays_in_place(96)]
#[case::grows_within_the_chunk(1500)]
#[case::migrates_to_a_big_chunk(6000)]
fn open_region_round_trips_across_growth(pool: MemPool, #[case] total: usize) {
    let mut base = pool.start(8);
    let mut len = 0usize;
    let mut step = 1usize;
    while len < total {
        let take = step.min(total - len);
        base = pool.grow(len + take);
        // SAFETY: grow reserved at least len + take bytes from base.
        unsafe {
            for i in 0..take {
                base.as_ptr().add(len + i).write(((len + i) % 251) as u8);
            }
        }
        len += take;
        step *= 2;
    }
    let committed = pool.end(len);
    assert_eq!(committed, base);

    // SAFETY: the committed region spans len initialized bytes.
    let bytes = unsafe { slice::from_raw_parts(committed.as_ptr(), len) };
    for (i, &byte) in bytes.iter().enumerate() {
        assert_eq!(byte, (i % 251) as u8, "byte {i} after growing to {total}");
    }
}

#[rstest]
fn dedicated_region_doubles_in_place_on_regrowth(pool: MemPool) {
    let mut base = pool.start(8);
    base = pool.grow(5000);
    // SAFETY: grow reserved at least 5000 bytes from base.
    unsafe {
        for i in 0..5000 {
            base.as_ptr().add(i).write((i % 251) as u8);
        }
    }
    assert_eq!(pool.stats().big_chunks, 1);
    let exact_fit = pool.stats().big_bytes;

    base = pool.grow(9000);
    // SAFETY: grow reserved at least 9000 bytes from base and carried the
    // written prefix along.
    unsafe {
        for i in 5000..9000 {
            base.as_ptr().add(i).write((i % 251) as u8);
        }
    }
    let committed = pool.end(9000);
    assert_eq!(committed, base);

    let stats = pool.stats();
    // still the one dedicated chunk, resized to double rather than to fit
    assert_eq!(stats.big_chunks, 1);
    assert!(stats.big_bytes >= 2 * 5000);
    assert!(stats.big_bytes > exact_fit);

    // SAFETY: the committed region spans 9000 initialized bytes.
    let bytes = unsafe { slice::from_raw_parts(committed.as_ptr(), 9000) };
    for (i, &byte) in bytes.iter().enumerate() {
        assert_eq!(byte, (i % 251) as u8, "byte {i} after the in-place regrowth");
    }
}

#[rstest]
fn spread_tracks_an_interior_pointer(pool: MemPool) {
    let base = pool.start(64);
    // SAFETY: 64 bytes of headroom were just reserved.
    unsafe { base.as_ptr().write_bytes(0x5A, 64) };

    let interior = base.as_ptr().wrapping_add(48);
    let interior = NonNull::new(interior).expect("pool pointers are never null");
    let moved = pool.spread(interior, 8192);
    // SAFETY: spread guarantees 8192 bytes after the returned pointer and
    // carried the written prefix along with the region.
    unsafe {
        assert_eq!(*moved.as_ptr().sub(1), 0x5A);
        moved.as_ptr().write_bytes(0xA5, 8192);
    }

    let committed = pool.end(48 + 8192);
    // SAFETY: the region was committed at 48 + 8192 bytes.
    let prefix = unsafe { slice::from_raw_parts(committed.as_ptr(), 48) };
    assert!(prefix.iter().all(|&byte| byte == 0x5A));
}

#[rstest]
fn realloc_adjusts_the_most_recent_allocation(pool: MemPool) {
    let region = pool.alloc_zero(128);
    region.fill(9);
    let ptr = NonNull::new(region.as_mut_ptr()).expect("pool pointers are never null");

    // SAFETY: `region` is not touched again; `ptr` is the only live handle.
    let shrunk = unsafe { pool.realloc(ptr, 32) };
    assert_eq!(shrunk, ptr);

    // SAFETY: as above.
    let regrown = unsafe { pool.realloc_zero(ptr, 256) };
    // SAFETY: 256 bytes are committed at the returned base.
    let bytes = unsafe { slice::from_raw_parts(regrown.as_ptr(), 256) };
    assert!(bytes[..32].iter().all(|&byte| byte == 9));
    assert!(bytes[32..].iter().all(|&byte| byte == 0));
}

#[rstest]
fn shrunk_region_tail_feeds_the_next_allocation(pool: MemPool) {
    let region = pool.strdup("abcdef");
    let ptr = NonNull::from(&mut *region).cast::<u8>();

    // SAFETY: the reference was given up for the raw pointer above and is
    // not used again.
    let kept = unsafe { pool.realloc(ptr, 2) };
    assert_eq!(kept, ptr);

    // the tail handed back by the shrink is where the next bytes land
    let next = pool.strdup("XY");
    assert_eq!(next.as_ptr() as usize, ptr.as_ptr() as usize + 2);
    assert_eq!(next, "XY");

    // SAFETY: the shrunk region still holds its first two bytes.
    let prefix = unsafe { slice::from_raw_parts(kept.as_ptr(), 2) };
    assert_eq!(prefix, b"ab");
}

#[rstest]
#[cfg_attr(
    debug_assertions,
    should_panic(expected = "not the most recent allocation")
)]
fn realloc_of_a_stale_pointer_is_rejected(pool: MemPool) {
    let first = pool.alloc(16);
    let _second = pool.alloc(16);
    // SAFETY: both allocations are raw; no references exist.
    let out = unsafe { pool.realloc(first, 64) };
    // release builds report the misuse and hand the pointer back unchanged
    assert_eq!(out, first);
}

#[rstest]
fn flushed_pool_refills_from_retired_chunks(mut pool: MemPool) {
    for _ in 0..6 {
        let _ = pool.alloc(2000);
    }
    let grown = pool.stats();

    pool.flush();
    let flushed = pool.stats();
    assert_eq!(flushed.total_bytes, grown.total_bytes);
    assert_eq!(flushed.small_chunks, 1);

    for _ in 0..6 {
        let _ = pool.alloc(2000);
    }
    let refilled = pool.stats();
    assert_eq!(refilled.total_bytes, grown.total_bytes);
    assert_eq!(refilled.small_chunks, grown.small_chunks);
    assert_eq!(refilled.unused_chunks, 0);
}

#[rstest]
fn alloc_zero_scrubs_recycled_bytes(mut pool: MemPool) {
    pool.alloc_zero(512).fill(0xFF);
    pool.flush();
    let recycled = pool.alloc_zero(512);
    assert!(recycled.iter().all(|&byte| byte == 0));
}

#[test]
fn default_pool_uses_the_page_sized_chunk() {
    init_test_logging();
    assert_eq!(MemPool::default().chunk_size(), common::DEFAULT_CHUNK_SIZE);
}
