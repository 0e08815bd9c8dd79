use crate::const_init::ConstInit;
use crate::memory::Memory;
use crate::AllocError;
use core::ptr::{self, NonNull};
use memory_units::{Bytes, Pages, RoundUpTo};

/// How much address space an `MmapMemory` reserves by default.
#[cfg(target_pointer_width = "64")]
const DEFAULT_RESERVE: Bytes = Bytes(1 << 36);

#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_RESERVE: Bytes = Bytes(1 << 28);

/// `mmap`-backed heap memory.
///
/// The whole capacity is reserved as inaccessible address space on the first
/// `sbrk`, and then committed with `mprotect` one `Pages` unit at a time as the
/// break moves up. Touching memory past the committed break faults, just like
/// a real `sbrk` heap.
pub struct MmapMemory {
    base: *mut u8,
    brk: usize,
    committed: usize,
    capacity: usize,
}

// The mapping is owned by this value alone.
unsafe impl Send for MmapMemory {}

impl ConstInit for MmapMemory {
    const INIT: Self = MmapMemory::with_capacity(DEFAULT_RESERVE.0);
}

impl Default for MmapMemory {
    fn default() -> Self {
        Self::INIT
    }
}

impl MmapMemory {
    /// A memory that will refuse to grow beyond `capacity` bytes (rounded up
    /// to whole `Pages`). Nothing is mapped until the first `sbrk`.
    pub const fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity > isize::MAX as usize {
            isize::MAX as usize
        } else {
            capacity
        };
        MmapMemory {
            base: ptr::null_mut(),
            brk: 0,
            committed: 0,
            capacity,
        }
    }

    /// The most bytes this memory can ever hand out.
    pub fn capacity(&self) -> Bytes {
        let pages: Pages = Bytes(self.capacity).round_up_to();
        pages.into()
    }

    fn reserve(&mut self) -> Result<(), AllocError> {
        extra_assert!(self.base.is_null());
        self.capacity = self.capacity().0;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.capacity,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::warn!("mmap of {} reserved bytes failed", self.capacity);
            return Err(AllocError::OutOfMemory {
                requested: self.capacity,
            });
        }
        log::debug!("reserved {} bytes at {:p}", self.capacity, addr);
        self.base = addr as *mut u8;
        Ok(())
    }

    fn commit(&mut self, end: usize) -> Result<(), AllocError> {
        let pages: Pages = Bytes(end).round_up_to();
        let target: Bytes = pages.into();
        let target = target.0.min(self.capacity);
        extra_assert!(target > self.committed);

        let code = unsafe {
            libc::mprotect(
                self.base.add(self.committed) as *mut libc::c_void,
                target - self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if code != 0 {
            log::warn!("mprotect of {} bytes failed", target - self.committed);
            return Err(AllocError::OutOfMemory {
                requested: target - self.committed,
            });
        }
        self.committed = target;
        Ok(())
    }
}

unsafe impl Memory for MmapMemory {
    fn sbrk(&mut self, increment: Bytes) -> Result<NonNull<u8>, AllocError> {
        let new_brk = match self.brk.checked_add(increment.0) {
            Some(n) if n <= self.capacity().0 => n,
            _ => {
                return Err(AllocError::OutOfMemory {
                    requested: increment.0,
                })
            }
        };

        if self.base.is_null() {
            self.reserve()?;
        }
        extra_assert!(new_brk <= self.capacity);
        if new_brk > self.committed {
            self.commit(new_brk)?;
        }

        let old_brk = unsafe { self.base.add(self.brk) };
        self.brk = new_brk;
        NonNull::new(old_brk).ok_or(AllocError::OutOfMemory {
            requested: increment.0,
        })
    }

    fn base(&self) -> *mut u8 {
        self.base
    }

    fn size(&self) -> Bytes {
        Bytes(self.brk)
    }
}

impl Drop for MmapMemory {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.capacity);
            }
        }
    }
}
