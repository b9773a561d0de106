//! Raw heap access with abort-on-failure semantics
//!
//! Allocation failure is not recoverable at this level. Every function here
//! either returns usable memory or terminates the process with a diagnostic
//! naming the component and the requested size.

use std::alloc::{self, Layout, handle_alloc_error};
use std::process;
use std::ptr::NonNull;

/// Terminate the process with a diagnostic for an unsatisfiable request.
///
/// Used for requests whose size exceeds a component's hard cap. Heap
/// exhaustion inside the allocation functions goes through
/// [`handle_alloc_error`] instead.
#[cold]
pub fn die(component: &str, size: usize) -> ! {
    eprintln!("{component}: cannot allocate {size} bytes of memory");
    process::abort();
}

/// Allocate `size` bytes aligned to `align`, aborting on failure.
///
/// `size` must be non-zero and `align` a power of two.
#[must_use]
pub fn alloc_bytes(size: usize, align: usize) -> NonNull<u8> {
    let layout = layout_of(size, align);
    // SAFETY: `layout` has a non-zero size.
    let raw = unsafe { alloc::alloc(layout) };
    match NonNull::new(raw) {
        Some(ptr) => ptr,
        None => handle_alloc_error(layout),
    }
}

/// Resize the block at `ptr` to `new_size` bytes, aborting on failure.
///
/// The first `min(old_size, new_size)` bytes are preserved; the block may
/// move.
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc_bytes`] or [`realloc_bytes`]
/// with layout `(old_size, align)` and not released since. `new_size` must
/// be non-zero.
#[must_use]
pub unsafe fn realloc_bytes(
    ptr: NonNull<u8>,
    old_size: usize,
    align: usize,
    new_size: usize,
) -> NonNull<u8> {
    let old_layout = layout_of(old_size, align);
    // SAFETY: the caller upholds the layout contract.
    let raw = unsafe { alloc::realloc(ptr.as_ptr(), old_layout, new_size) };
    match NonNull::new(raw) {
        Some(ptr) => ptr,
        None => handle_alloc_error(layout_of(new_size, align)),
    }
}

/// Return the block at `ptr` to the heap.
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc_bytes`] or [`realloc_bytes`]
/// with layout `(size, align)` and not released since.
pub unsafe fn free_bytes(ptr: NonNull<u8>, size: usize, align: usize) {
    let layout = layout_of(size, align);
    // SAFETY: the caller upholds the layout contract.
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
}

#[inline]
fn layout_of(size: usize, align: usize) -> Layout {
    match Layout::from_size_align(size, align) {
        Ok(layout) => layout,
        Err(_) => die("heap", size),
    }
}
