/*!

`segalloc`: a segregated-fit, boundary-tag heap allocator.

`segalloc` manages one contiguous, grow-only region of memory. It keeps its
metadata in-band, inside the blocks themselves, and indexes free blocks by size
so that finding a fit does not require walking the whole heap.

- **Boundary tags:** every block starts with a one-word header carrying its size
  and status. Free blocks repeat the header in a footer so that their successor
  can find them; allocated blocks do not, because every header also records
  whether the block *before* it is allocated.

- **Mini blocks:** 16-byte blocks have no room for a size and two links, so they
  use a compressed encoding and live in a dedicated mini list.

- **Segregated fits:** fifteen free lists, one per power-of-two size range. A
  request is served by the best of the first few fits in the smallest bucket
  that has any.

- **Immediate coalescing:** two address-adjacent blocks are never both free.

- [Using `segalloc` as the Global Allocator](#using-segalloc-as-the-global-allocator)
- [Using a `SegAlloc` directly](#using-a-segalloc-directly)
- [`cargo` Features](#cargo-features)
- [Implementation Notes and Constraints](#implementation-notes-and-constraints)
- [License](#license)

## Using `segalloc` as the Global Allocator

```
use segalloc::{LockedSegAlloc, MmapMemory};

#[global_allocator]
static ALLOC: LockedSegAlloc<MmapMemory> = LockedSegAlloc::INIT;

fn main() {
    let v: Vec<u32> = (0..1000).collect();
    assert_eq!(v.iter().sum::<u32>(), 499500);
}
```

## Using a `SegAlloc` directly

A `SegAlloc` is a plain, single-owner value. Every operation takes `&mut self`;
wrap it in a lock (or use `LockedSegAlloc`) to share it.

```
use segalloc::{MmapMemory, SegAlloc};

let mut heap = SegAlloc::new(MmapMemory::with_capacity(1 << 20));
let p = heap.allocate(24).unwrap();
let q = heap.allocate(24).unwrap();
assert_ne!(p, q);

unsafe { heap.release(p.as_ptr()) };
// The freed block is reused first.
assert_eq!(heap.allocate(24).unwrap(), p);
assert!(heap.validate().is_ok());
```

## `cargo` Features

- **extra_assertions**: Enable various extra, expensive integrity assertions,
  including a full heap validation before and after every public operation.
  This incurs a large runtime overhead. It is useful when debugging a
  use-after-free or `segalloc` itself.

- **static_array_backend**: Make `DefaultMemory` a fixed-size static array
  instead of an `mmap`ed region. The array's size is taken from the
  `SEGALLOC_STATIC_ARRAY_BACKEND_BYTES` environment variable at build time
  (32 MiB by default). Useful on targets without an operating system, and
  always the case on `wasm32`.

## Implementation Notes and Constraints

- Each allocated block costs one word of overhead. The smallest block is 16
  bytes, with 8 usable.

- Payloads are 16-byte aligned. `LockedSegAlloc` serves larger alignments
  by over-allocating, at a cost of up to `align` extra bytes.

- Release is *O(1)*, coalescing included.

- Allocation scans at most a handful of candidates per bucket, and at most
  fifteen buckets, before growing the heap.

- `segalloc` never returns memory to its backing store. Freed blocks stay in
  the free lists for future allocations.

- A `SegAlloc` itself is not thread safe. `LockedSegAlloc` serializes every
  operation behind a spin lock.

## License

Licensed under the [Mozilla Public License 2.0](https://www.mozilla.org/en-US/MPL/2.0/).

 */

#![deny(missing_docs)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod extra_assert;

mod block;
mod check;
mod coalesce;
mod const_init;
mod error;
mod free_lists;
mod imp_static_array;
mod memory;

#[cfg(all(unix, not(target_arch = "wasm32")))]
mod imp_unix;

#[cfg(all(
    not(unix),
    not(target_arch = "wasm32"),
    not(feature = "static_array_backend")
))]
compile_error! {
    "There is no `segalloc` memory for this target; enable the \"static_array_backend\" feature"
}

use block::{RawHeap, WSIZE};
use coalesce::{coalesce, place};
use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::ptr::{self, NonNull};
use free_lists::FreeLists;
use memory_units::Bytes;

pub use block::{ALIGNMENT, MIN_BLOCK_SIZE};
pub use check::HeapStats;
pub use const_init::ConstInit;
pub use error::{AllocError, HeapError};
pub use free_lists::NUM_BUCKETS;
pub use imp_static_array::{StaticArrayBackend, StaticArrayMemory, STATIC_ARRAY_BACKEND_BYTES};
pub use memory::Memory;

#[cfg(all(unix, not(target_arch = "wasm32")))]
pub use imp_unix::MmapMemory;

cfg_if::cfg_if! {
    if #[cfg(any(feature = "static_array_backend", target_arch = "wasm32"))] {
        /// The backing memory for this build: a static array.
        pub type DefaultMemory = StaticArrayBackend;
    } else if #[cfg(all(unix, not(target_arch = "wasm32")))] {
        /// The backing memory for this build: an `mmap`ed region.
        pub type DefaultMemory = MmapMemory;
    }
}

/// How many bytes the heap grows by, at least, when no free block fits.
pub const CHUNK_SIZE: usize = 4096;

/// How many fitting blocks a bucket scan considers before settling on the
/// smallest of them.
pub const FIT_CANDIDATES: usize = 5;

/// Tunables for a `SegAlloc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    chunk_size: usize,
    fit_candidates: usize,
}

impl Config {
    /// `CHUNK_SIZE` and `FIT_CANDIDATES`.
    pub const DEFAULT: Config = Config {
        chunk_size: CHUNK_SIZE,
        fit_candidates: FIT_CANDIDATES,
    };

    /// A configuration that grows the heap by at least `chunk_size` bytes at a
    /// time and considers up to `fit_candidates` fits per bucket.
    ///
    /// `chunk_size` is rounded up to a whole number of `ALIGNMENT` units and is
    /// at least `MIN_BLOCK_SIZE`. `fit_candidates` is at least one.
    pub const fn new(chunk_size: usize, fit_candidates: usize) -> Config {
        let chunk_size = match chunk_size.checked_add(ALIGNMENT - 1) {
            Some(c) => c & !(ALIGNMENT - 1),
            None => usize::MAX & !(ALIGNMENT - 1),
        };
        Config {
            chunk_size: if chunk_size < MIN_BLOCK_SIZE {
                MIN_BLOCK_SIZE
            } else {
                chunk_size
            },
            fit_candidates: if fit_candidates == 0 { 1 } else { fit_candidates },
        }
    }

    /// The minimum heap growth, in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The per-bucket candidate bound of the fit search.
    pub fn fit_candidates(&self) -> usize {
        self.fit_candidates
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::DEFAULT
    }
}

/// Round a request up to the size of the block that holds it: one header word
/// plus the payload, in whole `ALIGNMENT` units, and never below
/// `MIN_BLOCK_SIZE`. `None` if that overflows.
#[inline]
fn adjusted_size(size: usize) -> Option<usize> {
    let padded = size.checked_add(WSIZE + ALIGNMENT - 1)?;
    Some(cmp::max(padded & !(ALIGNMENT - 1), MIN_BLOCK_SIZE))
}

/// A segregated-fit allocator over one `Memory`.
///
/// # Safety
///
/// Pointers handed out by a `SegAlloc` point into its `Memory`. If that memory
/// stores its bytes inline (like `StaticArrayMemory`), moving the `SegAlloc`
/// moves the heap, and outstanding pointers dangle.
pub struct SegAlloc<M> {
    memory: M,
    lists: FreeLists,
    config: Config,
    initialized: bool,
}

impl<M: Memory + ConstInit> ConstInit for SegAlloc<M> {
    const INIT: SegAlloc<M> = SegAlloc::new(M::INIT);
}

impl<M: Memory + ConstInit> SegAlloc<M> {
    /// An initial `const` default construction of a `SegAlloc`.
    pub const INIT: Self = <Self as ConstInit>::INIT;
}

impl<M: Memory> SegAlloc<M> {
    /// An allocator over `memory` with the default `Config`. Nothing is touched
    /// until the first allocation.
    ///
    /// `memory` must not have been grown yet: the heap starts at its base.
    pub const fn new(memory: M) -> SegAlloc<M> {
        SegAlloc::with_config(memory, Config::DEFAULT)
    }

    /// An allocator over `memory` with the given tunables.
    pub const fn with_config(memory: M, config: Config) -> SegAlloc<M> {
        SegAlloc {
            memory,
            lists: <FreeLists as ConstInit>::INIT,
            config,
            initialized: false,
        }
    }

    /// The backing memory.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// The tunables this allocator was built with.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Total bytes obtained from the backing memory so far, sentinels
    /// included.
    pub fn heap_size(&self) -> usize {
        self.memory.size().0
    }

    /// Lay out the empty heap (prologue and epilogue) and grow it by one
    /// chunk. The first `allocate` does this implicitly; calling it again is a
    /// no-op.
    pub fn init(&mut self) -> Result<(), AllocError> {
        if self.initialized {
            return Ok(());
        }
        extra_assert_eq!(self.memory.size().0, 0, "heap memory was already in use");

        self.memory.sbrk(Bytes(2 * WSIZE))?;
        let heap = RawHeap::new(&self.memory);
        heap.set_word(0, block::Header::sentinel(false).encode());
        heap.set_header(heap.epilogue(), block::Header::sentinel(true));
        self.initialized = true;
        log::debug!(
            "initialized heap at {:p} with chunk size {}",
            self.memory.base(),
            self.config.chunk_size
        );

        self.extend_heap(self.config.chunk_size)?;
        extra_check_heap!(self);
        Ok(())
    }

    /// Grow the heap by `size` bytes (rounded up to the alignment unit) and
    /// file the new space as a free block, merged with a trailing free block
    /// if there is one.
    fn extend_heap(&mut self, size: usize) -> Result<block::Block, AllocError> {
        let size = match size.checked_add(ALIGNMENT - 1) {
            Some(s) => s & !(ALIGNMENT - 1),
            None => return Err(AllocError::OutOfMemory { requested: size }),
        };

        // The old epilogue becomes the new block's header.
        let block = RawHeap::new(&self.memory).epilogue();
        if let Err(e) = self.memory.sbrk(Bytes(size)) {
            log::warn!("failed to grow heap of {} bytes by {}", self.heap_size(), size);
            return Err(e);
        }

        let heap = RawHeap::new(&self.memory);
        let prev_allocated = heap.header(block).prev_allocated();
        heap.set_header(heap.epilogue(), block::Header::sentinel(false));
        heap.write_block(block, size, false, prev_allocated);
        let block = coalesce(heap, &mut self.lists, block);
        self.lists.insert(heap, block);

        log::debug!("grew heap by {} bytes to {}", size, heap.len());
        Ok(block)
    }

    /// Allocate a block with at least `size` usable bytes, aligned to
    /// `ALIGNMENT`.
    ///
    /// A zero-byte request fails with `AllocError::ZeroSize` and leaves the
    /// heap untouched.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        log::trace!("allocate({})", size);
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let asize = adjusted_size(size).ok_or(AllocError::OutOfMemory { requested: size })?;

        self.init()?;
        extra_check_heap!(self);

        let fit = self.lists.find_fit(
            RawHeap::new(&self.memory),
            asize,
            self.config.fit_candidates,
        );
        let block = match fit {
            Some(block) => block,
            None => self.extend_heap(cmp::max(asize, self.config.chunk_size))?,
        };

        let heap = RawHeap::new(&self.memory);
        place(heap, &mut self.lists, block, asize);
        let payload = heap.payload(block);

        extra_check_heap!(self);
        log::trace!("allocate({}) -> {:p}", size, payload);
        Ok(payload)
    }

    /// Return an allocated block to the heap. A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator that has not
    /// been released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        log::trace!("release({:p})", ptr);
        if ptr.is_null() {
            return;
        }
        extra_assert!(self.initialized);
        extra_check_heap!(self);

        let heap = RawHeap::new(&self.memory);
        let block = heap.block_of(ptr);
        let header = heap.header(block);
        extra_assert!(header.is_allocated(), "{:p} is not allocated", ptr);

        heap.write_block(block, header.size(), false, header.prev_allocated());
        let block = coalesce(heap, &mut self.lists, block);
        self.lists.insert(heap, block);

        extra_check_heap!(self);
    }

    /// Move an allocation into a block of at least `size` usable bytes,
    /// keeping its contents up to the smaller of the two sizes.
    ///
    /// A null `ptr` makes this `allocate(size)`. A zero `size` makes this
    /// `release(ptr)` and returns `Ok(None)`. If the new block cannot be
    /// allocated, the old one is left as it was.
    ///
    /// # Safety
    ///
    /// Same as `release`.
    pub unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        log::trace!("resize({:p}, {})", ptr, size);
        if size == 0 {
            self.release(ptr);
            return Ok(None);
        }
        let old = match NonNull::new(ptr) {
            Some(old) => old,
            None => return self.allocate(size).map(Some),
        };

        let new = self.allocate(size)?;
        let keep = cmp::min(self.usable_size(old.as_ptr()), size);
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), keep);
        self.release(old.as_ptr());
        Ok(Some(new))
    }

    /// Allocate zeroed space for `count` elements of `size` bytes each.
    pub fn allocate_array(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        log::trace!("allocate_array({}, {})", count, size);
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::Overflow { count, size })?;
        let payload = self.allocate(total)?;
        unsafe {
            ptr::write_bytes(payload.as_ptr(), 0, total);
        }
        Ok(payload)
    }

    /// How many bytes the allocation at `ptr` may actually use. At least what
    /// was asked for.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let heap = RawHeap::new(&self.memory);
        let block = heap.block_of(ptr);
        extra_assert!(heap.header(block).is_allocated());
        heap.payload_size(block)
    }

    /// Check every heap invariant, reporting the first violation found.
    ///
    /// Walks the entire heap and every free list; this is a debugging aid,
    /// not something to call on a hot path. An allocator that has not
    /// allocated anything yet is trivially valid.
    pub fn validate(&self) -> Result<(), HeapError> {
        self.stats().map(|_| ())
    }

    /// Like `validate`, but logs the violation together with the caller's
    /// `context` (typically a line number) and returns whether the heap is
    /// consistent.
    pub fn check_heap(&self, context: u32) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                log::error!("heap check failed (context {}): {}", context, e);
                false
            }
        }
    }

    /// Validate the heap and summarize its occupancy.
    pub fn stats(&self) -> Result<HeapStats, HeapError> {
        if !self.initialized {
            return Ok(HeapStats {
                heap_bytes: self.heap_size(),
                ..HeapStats::default()
            });
        }
        check::validate(RawHeap::new(&self.memory), &self.lists)
    }
}

/// A `SegAlloc` behind a spin lock, usable as a `#[global_allocator]`.
pub struct LockedSegAlloc<M> {
    inner: spin::Mutex<SegAlloc<M>>,
}

impl<M: Memory + ConstInit> ConstInit for LockedSegAlloc<M> {
    const INIT: LockedSegAlloc<M> = LockedSegAlloc::new(SegAlloc::INIT);
}

impl<M: Memory + ConstInit> LockedSegAlloc<M> {
    /// An initial `const` default construction of a `LockedSegAlloc`.
    ///
    /// This is usable for initializing `static`s that get set as the global
    /// allocator.
    pub const INIT: Self = <Self as ConstInit>::INIT;
}

impl<M: Memory> LockedSegAlloc<M> {
    /// Wrap `alloc` in a lock.
    pub const fn new(alloc: SegAlloc<M>) -> LockedSegAlloc<M> {
        LockedSegAlloc {
            inner: spin::Mutex::new(alloc),
        }
    }

    /// Take exclusive access to the underlying allocator.
    pub fn lock(&self) -> spin::MutexGuard<'_, SegAlloc<M>> {
        self.inner.lock()
    }
}

impl<M: Memory> SegAlloc<M> {
    /// Allocate `size` bytes aligned to `align`, which may exceed `ALIGNMENT`.
    ///
    /// An over-aligned allocation is carved out of a block with `align` spare
    /// bytes. The word just below the returned pointer records where that
    /// block's payload starts, for `release_aligned`.
    fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if align <= ALIGNMENT {
            return self.allocate(size);
        }
        let padded = size
            .checked_add(align)
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        let payload = self.allocate(padded)?;

        // Both are multiples of `ALIGNMENT`, so there is always room for the
        // word below the aligned pointer.
        let offset = align - (payload.as_ptr() as usize & (align - 1));
        unsafe {
            let aligned = payload.as_ptr().add(offset);
            ptr::write((aligned as *mut usize).sub(1), payload.as_ptr() as usize);
            log::trace!("allocate_aligned({}, {}) -> {:p}", size, align, aligned);
            Ok(NonNull::new_unchecked(aligned))
        }
    }

    /// Release a pointer returned by `allocate_aligned` with the same `align`.
    unsafe fn release_aligned(&mut self, ptr: *mut u8, align: usize) {
        if align <= ALIGNMENT || ptr.is_null() {
            return self.release(ptr);
        }
        let payload = ptr::read((ptr as *const usize).sub(1)) as *mut u8;
        extra_assert!(payload < ptr);
        self.release(payload)
    }
}

unsafe impl<M: Memory + Send> GlobalAlloc for LockedSegAlloc<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = cmp::max(layout.size(), 1);
        match self.lock().allocate_aligned(size, layout.align()) {
            Ok(p) => p.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.lock().release_aligned(ptr, layout.align())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = cmp::max(layout.size(), 1);
        if layout.align() <= ALIGNMENT {
            return match self.lock().allocate_array(1, size) {
                Ok(p) => p.as_ptr(),
                Err(_) => ptr::null_mut(),
            };
        }
        let p = self.alloc(layout);
        if !p.is_null() {
            ptr::write_bytes(p, 0, layout.size());
        }
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_size = cmp::max(new_size, 1);
        if layout.align() <= ALIGNMENT {
            return match self.lock().resize(ptr, new_size) {
                Ok(Some(p)) => p.as_ptr(),
                Ok(None) | Err(_) => ptr::null_mut(),
            };
        }

        let mut alloc = self.lock();
        let new = match alloc.allocate_aligned(new_size, layout.align()) {
            Ok(new) => new.as_ptr(),
            Err(_) => return ptr::null_mut(),
        };
        ptr::copy_nonoverlapping(ptr, new, cmp::min(layout.size(), new_size));
        alloc.release_aligned(ptr, layout.align());
        new
    }
}
