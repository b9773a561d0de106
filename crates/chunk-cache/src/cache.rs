//! Ring core: slot scans, counter advancement and supply upkeep

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam::utils::{Backoff, CachePadded};
use tracing::{debug, error};

use crate::error::CacheError;

/// Default hysteresis factor `M`: the ring holds `M` times the guaranteed
/// chunk count, and upkeep targets occupancy between `1/M` and `(M-1)/M`
/// of capacity.
pub const DEFAULT_FACTOR: u64 = 4;

/// Lock-free bounded cache of equally sized chunks.
///
/// The cache is a ring of `factor * min_chunks` slots framed by two
/// monotonic counters. Claimers scan the window `[begin, end)` for a
/// published chunk and take it over with a compare-and-swap; returners scan
/// `[end, begin + capacity)` for a vacant slot the same way. Both sides
/// advance their counter lazily, to the slot they acted on, so the newest
/// returned chunk becomes claimable only when the next return moves the
/// window past it.
///
/// Claiming from an empty cache and returning to a full one spin until the
/// situation changes. A separate periodic [`upkeep`](Self::upkeep) call is
/// expected to keep the supply inside the hysteresis band so neither spin
/// lasts.
pub struct ChunkCache<T> {
    slots: Box<[AtomicPtr<T>]>,
    begin: CachePadded<AtomicU64>,
    end: CachePadded<AtomicU64>,
    capacity: u64,
    factor: u64,
    chunk_len: usize,
}

// SAFETY: chunks cross threads as whole owned boxes through the atomic
// slots, and the counters and slots are only touched atomically. The
// explicit impls gate on `T: Send` because the cache owns resident chunks.
unsafe impl<T: Send> Send for ChunkCache<T> {}
unsafe impl<T: Send> Sync for ChunkCache<T> {}

impl<T> ChunkCache<T> {
    /// Ring capacity in chunks: `factor * min_chunks`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Elements in each chunk.
    #[must_use]
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Chunks currently visible to claimers.
    ///
    /// An instantaneous reading; under traffic it is stale by the time it
    /// returns.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        let beg = self.begin.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);
        end.saturating_sub(beg) as usize
    }

    #[inline(always)]
    fn slot(&self, index: u64) -> &AtomicPtr<T> {
        &self.slots[(index % self.capacity) as usize]
    }
}

impl<T: Default + Clone> ChunkCache<T> {
    /// Create an empty cache of `factor * min_chunks` slots for chunks of
    /// `chunk_len` elements, with the default hysteresis factor.
    ///
    /// The cache starts with no chunks; run [`upkeep`](Self::upkeep) once
    /// before the first claim.
    pub fn new(chunk_len: usize, min_chunks: usize) -> Result<Self, CacheError> {
        Self::with_factor(chunk_len, min_chunks, DEFAULT_FACTOR)
    }

    /// [`new`](Self::new) with an explicit hysteresis factor.
    ///
    /// `factor` must be at least 3 so the shrink bound `(M-1)/M` stays
    /// clear of the grow bound `1/M`.
    pub fn with_factor(
        chunk_len: usize,
        min_chunks: usize,
        factor: u64,
    ) -> Result<Self, CacheError> {
        if factor < 3 {
            return Err(CacheError::FactorTooSmall { factor });
        }
        if chunk_len == 0 {
            return Err(CacheError::ZeroChunkLen);
        }
        if min_chunks == 0 {
            return Err(CacheError::ZeroMinChunks);
        }
        let capacity = factor
            .checked_mul(min_chunks as u64)
            .ok_or(CacheError::CapacityOverflow)?;
        let slot_count = usize::try_from(capacity).map_err(|_| CacheError::CapacityOverflow)?;
        let slots: Box<[AtomicPtr<T>]> = (0..slot_count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        debug!(capacity, chunk_len, factor, "chunk cache created");
        Ok(Self {
            slots,
            begin: CachePadded::new(AtomicU64::new(0)),
            end: CachePadded::new(AtomicU64::new(0)),
            capacity,
            factor,
            chunk_len,
        })
    }

    /// Claim a chunk, spinning until one is claimable.
    ///
    /// The caller owns the returned chunk outright and normally hands it
    /// back with [`free`](Self::free); dropping it instead is allowed and
    /// simply shrinks the supply.
    #[must_use]
    pub fn alloc(&self) -> Box<[T]> {
        let backoff = Backoff::new();
        let mut beg = self.begin.load(Ordering::Relaxed);
        let mut end = self.end.load(Ordering::Relaxed);
        loop {
            let mut x = beg;
            let mut found = ptr::null_mut();
            while x < end {
                found = self.slot(x).load(Ordering::Relaxed);
                if !found.is_null() {
                    break;
                }
                x += 1;
            }
            if found.is_null() {
                // Window exhausted: the cache is out of chunks, or racing
                // claimers emptied the slots we scanned.
                backoff.snooze();
                beg = self.begin.load(Ordering::Relaxed);
                end = self.end.load(Ordering::Relaxed);
                continue;
            }
            if x > beg {
                if let Err(current) =
                    self.begin
                        .compare_exchange(beg, x, Ordering::SeqCst, Ordering::SeqCst)
                {
                    beg = current;
                    end = self.end.load(Ordering::Relaxed);
                    continue;
                }
            }
            if self
                .slot(x)
                .compare_exchange(found, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // SAFETY: the swap took the published pointer out of the
                // ring, transferring sole ownership to this thread; it was
                // created by `Box::into_raw` on a `chunk_len` slice.
                return unsafe {
                    Box::from_raw(ptr::slice_from_raw_parts_mut(found, self.chunk_len))
                };
            }
            beg = self.begin.load(Ordering::Relaxed);
            end = self.end.load(Ordering::Relaxed);
        }
    }

    /// Return a chunk to the cache, spinning while the ring is full.
    pub fn free(&self, chunk: Box<[T]>) {
        if chunk.len() != self.chunk_len {
            debug_assert!(false, "returned chunk has the wrong length");
            error!(
                len = chunk.len(),
                expected = self.chunk_len,
                "chunk-cache: dropping a chunk of the wrong length"
            );
            return;
        }
        let raw = Box::into_raw(chunk).cast::<T>();
        let backoff = Backoff::new();
        let mut beg = self.begin.load(Ordering::Relaxed);
        let mut end = self.end.load(Ordering::Relaxed);
        loop {
            let mut y = end;
            let mut vacant = false;
            while y < beg + self.capacity {
                if self.slot(y).load(Ordering::Relaxed).is_null() {
                    vacant = true;
                    break;
                }
                y += 1;
            }
            if !vacant {
                // Every slot in the window is occupied; wait for a claimer.
                backoff.snooze();
                beg = self.begin.load(Ordering::Relaxed);
                end = self.end.load(Ordering::Relaxed);
                continue;
            }
            if y > end {
                if let Err(current) =
                    self.end
                        .compare_exchange(end, y, Ordering::SeqCst, Ordering::SeqCst)
                {
                    end = current;
                    beg = self.begin.load(Ordering::Relaxed);
                    continue;
                }
            }
            if self
                .slot(y)
                .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
            beg = self.begin.load(Ordering::Relaxed);
            end = self.end.load(Ordering::Relaxed);
        }
    }

    /// Walk the supply back into the occupancy band.
    ///
    /// Frees claimable chunks while more than `(M-1)/M` of the ring is
    /// occupied, allocates fresh ones while at most `1/M` is, then returns.
    /// Meant for one periodic maintenance caller; safe to run while other
    /// threads claim and return chunks.
    pub fn upkeep(&self) {
        let mut grown = 0u64;
        let mut shrunk = 0u64;
        loop {
            let beg = self.begin.load(Ordering::Relaxed);
            let end = self.end.load(Ordering::Relaxed);
            if end > beg + (self.factor - 1) * self.capacity / self.factor {
                drop(self.alloc());
                shrunk += 1;
            } else if end <= beg + self.capacity / self.factor {
                self.free(self.new_chunk());
                grown += 1;
            } else {
                break;
            }
        }
        if grown > 0 || shrunk > 0 {
            debug!(grown, shrunk, "cache upkeep adjusted the supply");
        }
    }

    fn new_chunk(&self) -> Box<[T]> {
        vec![T::default(); self.chunk_len].into_boxed_slice()
    }
}

impl<T> Drop for ChunkCache<T> {
    fn drop(&mut self) {
        for slot in &self.slots {
            let raw = slot.swap(ptr::null_mut(), Ordering::Relaxed);
            if !raw.is_null() {
                // SAFETY: resident pointers were published by `free` via
                // `Box::into_raw` on `chunk_len` slices, and `&mut self`
                // means no other thread can still reach the cache.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(raw, self.chunk_len)) });
            }
        }
    }
}

impl<T> fmt::Debug for ChunkCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCache")
            .field("capacity", &self.capacity)
            .field("chunk_len", &self.chunk_len)
            .field("occupancy", &self.occupancy())
            .finish_non_exhaustive()
    }
}
