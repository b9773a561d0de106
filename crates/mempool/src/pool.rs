//! Pool core: chunk chains, the bump path, the open-region protocol and
//! checkpoint rollback

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};

use common::heap;
use common::{CPU_PAGE_SIZE, DEFAULT_CHUNK_SIZE, MAX_ALIGN, align_up};
use tracing::error;

/// Largest single request a pool will attempt to satisfy.
///
/// Requests above this abort the process: a size in this range is a sign of
/// corrupted arithmetic at the call site, not a real allocation. The cap
/// leaves a page of headroom under the global allocator's `isize::MAX`
/// layout limit, so every size that passes it can be rounded and handed to
/// the heap as is.
pub const POOL_SIZE_MAX: usize = (isize::MAX as usize) - CPU_PAGE_SIZE;

/// Chunk class. Small chunks are pooled and serve bump allocations up to
/// the pool threshold; big chunks back exactly one oversized allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Class {
    Small,
    Big,
}

/// One heap block backing pool allocations.
///
/// `used` is the committed cursor. Bytes past it are free, except while a
/// region is open in the head chunk, in which case they are reserved but
/// not yet committed.
struct Chunk {
    data: NonNull<u8>,
    capacity: usize,
    used: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        Self {
            data: heap::alloc_bytes(capacity, MAX_ALIGN),
            capacity,
            used: 0,
        }
    }

    /// Resize the backing block in place to `capacity` bytes.
    fn grow_to(&mut self, capacity: usize) {
        // SAFETY: `data` was allocated with layout (self.capacity, MAX_ALIGN)
        // and is exclusively owned by this chunk.
        self.data = unsafe { heap::realloc_bytes(self.data, self.capacity, MAX_ALIGN, capacity) };
        self.capacity = capacity;
    }

    /// Pointer `off` bytes into the chunk. Callers keep `off <= capacity`.
    #[inline(always)]
    fn at(&self, off: usize) -> NonNull<u8> {
        // SAFETY: the offset stays inside the allocated block.
        unsafe { NonNull::new_unchecked(self.data.as_ptr().add(off)) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `data` was allocated with layout (capacity, MAX_ALIGN).
        unsafe { heap::free_bytes(self.data, self.capacity, MAX_ALIGN) };
    }
}

/// Snapshot of the allocation cursor: chain lengths plus the committed
/// cursor of each head chunk.
#[derive(Clone, Copy)]
struct State {
    small_len: usize,
    big_len: usize,
    small_used: usize,
    big_used: usize,
}

/// Record of the most recent allocation. `open` marks a started region
/// that has not been committed by `end` yet.
#[derive(Clone, Copy)]
struct LastAlloc {
    class: Class,
    base: usize,
    open: bool,
}

/// Handle returned by [`MemPool::push`], identifying a rollback point by
/// its depth on the checkpoint stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    depth: usize,
}

/// Memory reserved by a pool, reported per chunk class.
///
/// Byte figures count chunk capacity plus per-chunk bookkeeping, so they
/// reflect what the pool actually holds from the heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes reserved by live small chunks.
    pub small_bytes: usize,
    /// Live small chunk count.
    pub small_chunks: usize,
    /// Bytes reserved by live big chunks.
    pub big_bytes: usize,
    /// Live big chunk count.
    pub big_chunks: usize,
    /// Bytes held by retired chunks awaiting reuse.
    pub unused_bytes: usize,
    /// Retired chunk count.
    pub unused_chunks: usize,
    /// Grand total across all three chains.
    pub total_bytes: usize,
}

struct Inner {
    chunk_size: usize,
    threshold: usize,
    /// Small chain; never empty, the last element is the bump target.
    small: Vec<Chunk>,
    /// Big chain; the last element backs the most recent big allocation.
    big: Vec<Chunk>,
    /// Retired small chunks kept for reuse instead of being freed.
    unused: Vec<Chunk>,
    checkpoints: Vec<State>,
    last: Option<LastAlloc>,
}

/// Checkpointed arena allocator.
///
/// A pool hands out regions from a chain of pooled chunks, bumping a cursor
/// on the hot path. Requests the slow path classifies above half the chunk
/// size get a dedicated chunk of their own. Nothing is freed individually:
/// memory comes back wholesale through [`pop`](Self::pop),
/// [`restore`](Self::restore), [`flush`](Self::flush) or by dropping the
/// pool.
///
/// A pool is single-owner. It can move between threads but cannot be
/// shared. Allocation takes `&self` so outstanding regions stay usable
/// while further allocations happen; wholesale rollback takes `&mut self`
/// and therefore requires all borrowed regions to be released first, while
/// the unsafe resize calls ([`open`](Self::open), [`realloc`](Self::realloc))
/// put the same no-live-references obligation on their caller. Raw pointers
/// obtained from the pool are the caller's responsibility to drop at
/// rollback.
pub struct MemPool {
    inner: UnsafeCell<Inner>,
}

// SAFETY: the pool exclusively owns its chunks; moving the pool moves them
// with it. `UnsafeCell` keeps it !Sync, so access stays single-threaded.
unsafe impl Send for MemPool {}

impl MemPool {
    /// Create a pool whose small chunks hold `chunk_size` bytes.
    ///
    /// The size is rounded up to [`MAX_ALIGN`] and floored at the size of
    /// the pool header. Slow-path requests larger than half the rounded
    /// size bypass the small chunks entirely.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = align_up(chunk_size.max(size_of::<Self>()), MAX_ALIGN);
        Self {
            inner: UnsafeCell::new(Inner {
                chunk_size,
                threshold: chunk_size >> 1,
                small: vec![Chunk::new(chunk_size)],
                big: Vec::new(),
                unused: Vec::new(),
                checkpoints: Vec::new(),
                last: None,
            }),
        }
    }

    /// Rounded small-chunk size this pool was created with.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.inner().chunk_size
    }

    /// Reserve `size` bytes at full alignment.
    ///
    /// The region stays valid until the pool is rolled back past it,
    /// flushed or dropped. The memory is uninitialized; writing more than
    /// `size` bytes is undefined behavior.
    ///
    /// Aborts the process if the heap cannot satisfy the request or if
    /// `size` exceeds [`POOL_SIZE_MAX`].
    #[inline(always)]
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        self.inner().alloc(size, true)
    }

    /// Reserve `size` bytes directly after the previous allocation, with no
    /// alignment padding.
    #[inline(always)]
    pub fn alloc_noalign(&self, size: usize) -> NonNull<u8> {
        self.inner().alloc(size, false)
    }

    /// Reserve `size` zeroed bytes and return them as a slice.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_zero(&self, size: usize) -> &mut [u8] {
        let ptr = self.inner().alloc_zero(size);
        // SAFETY: the region is freshly reserved, zero-initialized and
        // disjoint from every other live region.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) }
    }

    /// Open a variable-length region with at least `size` bytes of headroom.
    ///
    /// While a region is open, [`grow`](Self::grow) and
    /// [`spread`](Self::spread) extend it and [`end`](Self::end) commits it
    /// at its final length. Only one region can be open at a time; other
    /// allocation calls must wait until it is committed.
    #[inline(always)]
    pub fn start(&self, size: usize) -> NonNull<u8> {
        self.inner().start(size, true)
    }

    /// [`start`](Self::start) without alignment padding.
    #[inline(always)]
    pub fn start_noalign(&self, size: usize) -> NonNull<u8> {
        self.inner().start(size, false)
    }

    /// Extend the open region to at least `size` bytes and return its base.
    ///
    /// The base changes when the region migrates to a larger chunk; bytes
    /// written so far move with it.
    #[inline]
    pub fn grow(&self, size: usize) -> NonNull<u8> {
        self.inner().grow(size)
    }

    /// Extend the open region so at least `size` bytes follow `ptr`, which
    /// must point inside it. Returns `ptr` relocated along with the region.
    pub fn spread(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        self.inner().spread(ptr, size)
    }

    /// Commit the open region at `len` bytes and return its base pointer.
    ///
    /// `len` must not exceed the headroom the region reached. The committed
    /// tail returns to the pool for subsequent allocations.
    pub fn end(&self, len: usize) -> NonNull<u8> {
        self.inner().end(len)
    }

    /// Reopen the most recent allocation and return its committed length.
    ///
    /// `ptr` must be the base pointer of the most recent allocation. The
    /// region then behaves as if freshly started: extend it with
    /// [`grow`](Self::grow), commit it with [`end`](Self::end).
    ///
    /// # Safety
    ///
    /// No references into the allocation may be live. Growing may relocate
    /// the region, and committing it shorter hands the tail to the next
    /// allocation, so a reference kept across this call would alias
    /// memory the pool reuses.
    pub unsafe fn open(&self, ptr: NonNull<u8>) -> usize {
        self.inner().open(ptr)
    }

    /// Resize the most recent allocation, returning its possibly relocated
    /// base pointer. Shrinking returns the tail to the pool.
    ///
    /// # Safety
    ///
    /// No references into the allocation may be live; the shrunk tail is
    /// reused by the next allocation and growth may relocate the region.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        self.inner().realloc(ptr, size, false)
    }

    /// [`realloc`](Self::realloc) that zero-fills any bytes past the old
    /// length.
    ///
    /// # Safety
    ///
    /// Same contract as [`realloc`](Self::realloc).
    pub unsafe fn realloc_zero(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        self.inner().realloc(ptr, size, true)
    }

    /// Save the current allocation cursor on the checkpoint stack.
    pub fn push(&self) -> Checkpoint {
        self.inner().push()
    }

    /// Roll back to the most recent checkpoint and remove it.
    ///
    /// Every region allocated after the matching [`push`](Self::push) is
    /// invalidated; small chunks emptied by the rollback are retired for
    /// reuse. Popping with no checkpoint on the stack is a logic error:
    /// debug builds panic, release builds log and leave the pool untouched.
    pub fn pop(&mut self) {
        self.inner.get_mut().pop()
    }

    /// Roll back to `mark`, consuming it and every checkpoint pushed after
    /// it.
    pub fn restore(&mut self, mark: Checkpoint) {
        self.inner.get_mut().restore(mark)
    }

    /// Invalidate everything allocated from the pool.
    ///
    /// Big chunks are freed; small chunks are retired, so a flushed pool
    /// refills without touching the heap. The checkpoint stack is cleared.
    pub fn flush(&mut self) {
        self.inner.get_mut().flush()
    }

    /// Memory currently reserved by the pool, broken down by chunk class.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner().stats()
    }

    pub(crate) fn region_open(&self) -> bool {
        self.inner().is_open()
    }

    /// Exclusive view of the pool internals.
    ///
    /// Sound because the pool is !Sync and every public method finishes
    /// with the reference before returning; no method calls another public
    /// method while holding it.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    fn inner(&self) -> &mut Inner {
        // SAFETY: see above; single-threaded access, no reentrant borrows.
        unsafe { &mut *self.inner.get() }
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl fmt::Debug for MemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("chunk_size", &self.chunk_size())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Bump the head small chunk when the request fits its tail, whatever
    /// the request size; everything else takes the slow path.
    #[inline(always)]
    fn alloc(&mut self, size: usize, aligned: bool) -> NonNull<u8> {
        debug_assert!(!self.is_open(), "allocation while a region is open");
        if let Some(head) = self.small.last_mut() {
            let base = if aligned {
                align_up(head.used, MAX_ALIGN)
            } else {
                head.used
            };
            if size <= head.capacity - base {
                head.used = base + size;
                let ptr = head.at(base);
                self.last = Some(LastAlloc {
                    class: Class::Small,
                    base,
                    open: false,
                });
                return ptr;
            }
        }
        self.alloc_slow(size)
    }

    #[cold]
    fn alloc_slow(&mut self, size: usize) -> NonNull<u8> {
        let ptr = self.start_slow(size);
        self.commit(size);
        ptr
    }

    fn alloc_zero(&mut self, size: usize) -> NonNull<u8> {
        let ptr = self.alloc(size, true);
        // SAFETY: `ptr` addresses `size` writable bytes reserved above.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        ptr
    }

    /// Open a region at the bump cursor when `size` fits the head chunk.
    #[inline(always)]
    fn start(&mut self, size: usize, aligned: bool) -> NonNull<u8> {
        debug_assert!(!self.is_open(), "start while a region is already open");
        if let Some(head) = self.small.last_mut() {
            let base = if aligned {
                align_up(head.used, MAX_ALIGN)
            } else {
                head.used
            };
            if size <= head.capacity - base {
                let ptr = head.at(base);
                self.last = Some(LastAlloc {
                    class: Class::Small,
                    base,
                    open: true,
                });
                return ptr;
            }
        }
        self.start_slow(size)
    }

    /// Open a region in a fresh chunk: a pooled one for requests up to the
    /// threshold, a dedicated one above it.
    #[cold]
    fn start_slow(&mut self, size: usize) -> NonNull<u8> {
        if size <= self.threshold {
            let chunk = match self.unused.pop() {
                Some(chunk) => {
                    debug_assert_eq!(chunk.capacity, self.chunk_size);
                    chunk
                }
                None => Chunk::new(self.chunk_size),
            };
            let ptr = chunk.at(0);
            self.small.push(chunk);
            self.last = Some(LastAlloc {
                class: Class::Small,
                base: 0,
                open: true,
            });
            ptr
        } else if size <= POOL_SIZE_MAX {
            let chunk = Chunk::new(align_up(size, MAX_ALIGN));
            let ptr = chunk.at(0);
            self.big.push(chunk);
            self.last = Some(LastAlloc {
                class: Class::Big,
                base: 0,
                open: true,
            });
            ptr
        } else {
            heap::die("mempool", size)
        }
    }

    /// Extend the open region, in place when the current chunk has room.
    #[inline]
    fn grow(&mut self, size: usize) -> NonNull<u8> {
        debug_assert!(self.is_open(), "grow without an open region");
        if size <= self.open_capacity() {
            return self.region_ptr();
        }
        self.grow_slow(size)
    }

    #[cold]
    fn grow_slow(&mut self, size: usize) -> NonNull<u8> {
        if size > POOL_SIZE_MAX {
            heap::die("mempool", size);
        }
        let Some(last) = self.last else {
            error!("mempool: grow without an open region");
            return NonNull::dangling();
        };
        if !last.open {
            error!("mempool: grow without an open region");
            return self.region_ptr();
        }
        match last.class {
            Class::Big => {
                debug_assert_eq!(last.base, 0);
                match self.big.last_mut() {
                    Some(head) => {
                        // Amortized doubling; the dedicated chunk backs
                        // exactly this region, so it can grow in place.
                        let avail = head.capacity;
                        let doubled = if avail <= POOL_SIZE_MAX / 2 {
                            avail * 2
                        } else {
                            POOL_SIZE_MAX
                        };
                        head.grow_to(align_up(doubled.max(size), MAX_ALIGN));
                        head.at(0)
                    }
                    None => {
                        error!("mempool: open big region has no chunk");
                        NonNull::dangling()
                    }
                }
            }
            Class::Small => {
                // Move the region to a fresh chunk, re-dispatching on size:
                // it may graduate to the big class. The written prefix is
                // carried over; the old chunk's tail is abandoned until
                // rollback reclaims it.
                let old = self.region_ptr();
                let old_avail = self.open_capacity();
                let ptr = self.start_slow(size);
                // SAFETY: source and destination are distinct chunks and
                // the source stays mapped until rollback or flush.
                unsafe { ptr::copy_nonoverlapping(old.as_ptr(), ptr.as_ptr(), old_avail) };
                ptr
            }
        }
    }

    /// Extend the open region so at least `size` bytes follow `ptr`.
    fn spread(&mut self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        debug_assert!(self.is_open(), "spread without an open region");
        let base = self.region_ptr();
        let delta = (ptr.as_ptr() as usize).wrapping_sub(base.as_ptr() as usize);
        debug_assert!(
            delta <= self.open_capacity(),
            "pointer outside the open region"
        );
        let need = match delta.checked_add(size) {
            Some(need) => need,
            None => heap::die("mempool", size),
        };
        let moved = self.grow(need);
        // SAFETY: `grow` reserved at least `delta + size` bytes from the
        // (possibly relocated) base.
        unsafe { NonNull::new_unchecked(moved.as_ptr().add(delta)) }
    }

    /// Commit the open region at `len` bytes.
    fn end(&mut self, len: usize) -> NonNull<u8> {
        if !self.is_open() {
            debug_assert!(false, "end without an open region");
            error!("mempool: end without an open region");
            return self.region_ptr();
        }
        debug_assert!(
            len <= self.open_capacity(),
            "committed length exceeds region headroom"
        );
        self.commit(len);
        self.region_ptr()
    }

    /// Reopen the most recent allocation; returns its committed length.
    fn open(&mut self, ptr: NonNull<u8>) -> usize {
        let Some(mut last) = self.last else {
            debug_assert!(false, "open with no completed allocation");
            error!("mempool: open with no completed allocation");
            return 0;
        };
        debug_assert!(!last.open, "open while a region is already open");
        let Some(head) = self.head(last.class) else {
            error!("mempool: last allocation has no chunk");
            return 0;
        };
        if ptr != head.at(last.base) {
            debug_assert!(false, "open of a pointer that is not the most recent allocation");
            error!("mempool: open of a stale pointer");
            return 0;
        }
        let len = head.used - last.base;
        last.open = true;
        self.last = Some(last);
        len
    }

    fn realloc(&mut self, ptr: NonNull<u8>, size: usize, zero: bool) -> NonNull<u8> {
        let old_len = self.open(ptr);
        if !self.is_open() {
            // Misuse was already reported; leave the pool untouched.
            return ptr;
        }
        let moved = self.grow(size);
        if zero && size > old_len {
            // SAFETY: `grow` reserved at least `size` bytes from `moved`.
            unsafe { ptr::write_bytes(moved.as_ptr().add(old_len), 0, size - old_len) };
        }
        self.end(size)
    }

    fn push(&mut self) -> Checkpoint {
        debug_assert!(!self.is_open(), "checkpoint while a region is open");
        let state = self.capture();
        self.checkpoints.push(state);
        Checkpoint {
            depth: self.checkpoints.len(),
        }
    }

    fn pop(&mut self) {
        match self.checkpoints.pop() {
            Some(state) => self.rewind(state),
            None => {
                debug_assert!(false, "pop without a matching push");
                error!("mempool: pop without a matching push");
            }
        }
    }

    fn restore(&mut self, mark: Checkpoint) {
        if mark.depth == 0 || mark.depth > self.checkpoints.len() {
            debug_assert!(false, "restore of a stale checkpoint");
            error!(depth = mark.depth, "mempool: restore of a stale checkpoint");
            return;
        }
        self.checkpoints.truncate(mark.depth);
        self.pop();
    }

    fn flush(&mut self) {
        self.big.clear();
        for mut chunk in self.small.drain(1..) {
            chunk.used = 0;
            self.unused.push(chunk);
        }
        if let Some(first) = self.small.first_mut() {
            first.used = 0;
        }
        self.checkpoints.clear();
        self.last = None;
    }

    fn stats(&self) -> PoolStats {
        fn chain(chunks: &[Chunk]) -> (usize, usize) {
            let bytes = chunks
                .iter()
                .map(|chunk| chunk.capacity + size_of::<Chunk>())
                .sum();
            (bytes, chunks.len())
        }
        let (small_bytes, small_chunks) = chain(&self.small);
        let (big_bytes, big_chunks) = chain(&self.big);
        let (unused_bytes, unused_chunks) = chain(&self.unused);
        PoolStats {
            small_bytes,
            small_chunks,
            big_bytes,
            big_chunks,
            unused_bytes,
            unused_chunks,
            total_bytes: small_bytes + big_bytes + unused_bytes,
        }
    }

    fn capture(&self) -> State {
        State {
            small_len: self.small.len(),
            big_len: self.big.len(),
            small_used: self.small.last().map_or(0, |chunk| chunk.used),
            big_used: self.big.last().map_or(0, |chunk| chunk.used),
        }
    }

    /// Retire small chunks past the snapshot, free big chunks past it and
    /// rewind both head cursors.
    fn rewind(&mut self, state: State) {
        for mut chunk in self.small.drain(state.small_len..) {
            chunk.used = 0;
            self.unused.push(chunk);
        }
        self.big.truncate(state.big_len);
        if let Some(head) = self.small.last_mut() {
            head.used = state.small_used;
        }
        if let Some(head) = self.big.last_mut() {
            head.used = state.big_used;
        }
        self.last = None;
    }

    fn is_open(&self) -> bool {
        matches!(self.last, Some(last) if last.open)
    }

    /// Headroom of the open region: bytes from its base to the end of its
    /// chunk. Zero when no region is open.
    fn open_capacity(&self) -> usize {
        match self.last {
            Some(last) if last.open => self
                .head(last.class)
                .map_or(0, |head| head.capacity - last.base),
            _ => 0,
        }
    }

    /// Base pointer of the open or most recently committed region.
    fn region_ptr(&self) -> NonNull<u8> {
        if let Some(last) = self.last {
            if let Some(head) = self.head(last.class) {
                return head.at(last.base);
            }
        }
        error!("mempool: no current region");
        NonNull::dangling()
    }

    /// Close the open region at logical length `len`.
    fn commit(&mut self, len: usize) {
        let Some(mut last) = self.last else { return };
        last.open = false;
        if let Some(head) = self.head_mut(last.class) {
            head.used = last.base + len;
        }
        self.last = Some(last);
    }

    fn head(&self, class: Class) -> Option<&Chunk> {
        match class {
            Class::Small => self.small.last(),
            Class::Big => self.big.last(),
        }
    }

    fn head_mut(&mut self, class: Class) -> Option<&mut Chunk> {
        match class {
            Class::Small => self.small.last_mut(),
            Class::Big => self.big.last_mut(),
        }
    }
}
