//! String builders that place their results in pool memory

use std::fmt::{self, Write};
use std::ptr::{self, NonNull};
use std::slice;
use std::str;

use tracing::warn;

use crate::pool::MemPool;

impl MemPool {
    /// Copy `s` into the pool.
    #[allow(clippy::mut_from_ref)]
    pub fn strdup(&self, s: &str) -> &mut str {
        let bytes = self.copy_in(s.as_bytes(), false);
        // SAFETY: a verbatim copy of valid UTF-8.
        unsafe { str::from_utf8_unchecked_mut(bytes) }
    }

    /// Copy `bytes` into the pool at full alignment.
    #[allow(clippy::mut_from_ref)]
    pub fn memdup(&self, bytes: &[u8]) -> &mut [u8] {
        self.copy_in(bytes, true)
    }

    /// Concatenate `parts` into one pool-allocated string.
    #[allow(clippy::mut_from_ref)]
    pub fn multicat(&self, parts: &[&str]) -> &mut str {
        self.join(parts, None)
    }

    /// Concatenate `parts` with `sep` between consecutive elements.
    #[allow(clippy::mut_from_ref)]
    pub fn join(&self, parts: &[&str], sep: Option<char>) -> &mut str {
        let mut sep_buf = [0u8; 4];
        let sep_bytes: &[u8] = match sep {
            Some(sep) => sep.encode_utf8(&mut sep_buf).as_bytes(),
            None => &[],
        };
        let len = parts.iter().map(|part| part.len()).sum::<usize>()
            + sep_bytes.len() * parts.len().saturating_sub(1);
        let base = self.alloc_noalign(len);
        let mut off = 0;
        // SAFETY: the region spans exactly `len` bytes; the copies below
        // fill all of them with UTF-8 fragments on character boundaries.
        unsafe {
            for (i, part) in parts.iter().enumerate() {
                if i > 0 && !sep_bytes.is_empty() {
                    ptr::copy_nonoverlapping(
                        sep_bytes.as_ptr(),
                        base.as_ptr().add(off),
                        sep_bytes.len(),
                    );
                    off += sep_bytes.len();
                }
                ptr::copy_nonoverlapping(part.as_ptr(), base.as_ptr().add(off), part.len());
                off += part.len();
            }
            debug_assert_eq!(off, len);
            str::from_utf8_unchecked_mut(slice::from_raw_parts_mut(base.as_ptr(), len))
        }
    }

    /// Format `args` into pool memory, growing the region as the output
    /// demands, and return the finished string.
    ///
    /// Build the argument pack with `format_args!`:
    ///
    /// ```
    /// use mempool::MemPool;
    ///
    /// let pool = MemPool::new(4096);
    /// let s = pool.printf(format_args!("x={:04}", 7));
    /// assert_eq!(s, "x=0007");
    /// ```
    ///
    /// The region stays open for the duration of the call, so `Display`
    /// implementations of the arguments must not allocate from this pool.
    #[allow(clippy::mut_from_ref)]
    pub fn printf(&self, args: fmt::Arguments<'_>) -> &mut str {
        self.start(1);
        self.format_open(0, args)
    }

    /// Extend `prev`, the pool's most recent allocation, with formatted
    /// output.
    ///
    /// Consumes `prev` because growth may relocate it; the returned string
    /// covers the old content plus the appended output.
    #[allow(clippy::mut_from_ref)]
    pub fn printf_append<'a>(
        &'a self,
        prev: &'a mut str,
        args: fmt::Arguments<'_>,
    ) -> &'a mut str {
        let len = prev.len();
        let base = NonNull::from(prev).cast::<u8>();
        // SAFETY: `prev` was taken by value, so the reference consumed above
        // was the only live way into the region.
        let reopened = unsafe { self.open(base) };
        if !self.region_open() {
            // Stale pointer, already reported; hand the string back as is.
            // SAFETY: `base` and `len` come from the `&mut str` consumed
            // above and the pool was left untouched.
            return unsafe {
                str::from_utf8_unchecked_mut(slice::from_raw_parts_mut(base.as_ptr(), len))
            };
        }
        debug_assert_eq!(reopened, len);
        self.format_open(reopened, args)
    }

    /// Stream `args` into the open region starting at `ofs`, commit it and
    /// return the whole committed string.
    #[allow(clippy::mut_from_ref)]
    fn format_open(&self, ofs: usize, args: fmt::Arguments<'_>) -> &mut str {
        let mut writer = RegionWriter {
            pool: self,
            len: ofs,
        };
        if fmt::write(&mut writer, args).is_err() {
            // A Display impl reported failure; keep what was written.
            warn!("mempool: formatting reported an error, output truncated");
        }
        let len = writer.len;
        let base = self.end(len);
        // SAFETY: exactly `len` bytes were written from `base`, all of them
        // whole `&str` fragments.
        unsafe { str::from_utf8_unchecked_mut(slice::from_raw_parts_mut(base.as_ptr(), len)) }
    }

    #[allow(clippy::mut_from_ref)]
    fn copy_in(&self, bytes: &[u8], aligned: bool) -> &mut [u8] {
        let base = if aligned {
            self.alloc(bytes.len())
        } else {
            self.alloc_noalign(bytes.len())
        };
        // SAFETY: the region spans `bytes.len()` fresh writable bytes.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.as_ptr(), bytes.len());
            slice::from_raw_parts_mut(base.as_ptr(), bytes.len())
        }
    }
}

/// `fmt::Write` sink that appends to the pool's open region, growing the
/// region ahead of each fragment.
struct RegionWriter<'a> {
    pool: &'a MemPool,
    len: usize,
}

impl Write for RegionWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let Some(need) = self.len.checked_add(s.len()) else {
            return Err(fmt::Error);
        };
        let base = self.pool.grow(need);
        // SAFETY: `grow` reserved at least `need` bytes from `base`.
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), base.as_ptr().add(self.len), s.len());
        }
        self.len = need;
        Ok(())
    }
}
