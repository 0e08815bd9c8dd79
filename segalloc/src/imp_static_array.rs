use crate::const_init::ConstInit;
use crate::memory::Memory;
use crate::AllocError;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use memory_units::Bytes;

/// Size of the default static heap, configured at build time through the
/// `SEGALLOC_STATIC_ARRAY_BACKEND_BYTES` environment variable.
pub const STATIC_ARRAY_BACKEND_BYTES: usize =
    include!(concat!(env!("OUT_DIR"), "/segalloc_static_array_backend_size_bytes.txt"));

/// The static array memory sized by `SEGALLOC_STATIC_ARRAY_BACKEND_BYTES`.
pub type StaticArrayBackend = StaticArrayMemory<STATIC_ARRAY_BACKEND_BYTES>;

#[repr(C, align(16))]
struct Scratch<const N: usize>([u8; N]);

/// Fixed-size, OS-independent heap memory: `N` bytes stored inline.
///
/// Because the bytes live inside the value, moving a `StaticArrayMemory`
/// moves the heap with it. The allocator only ever stores offsets, so that is
/// fine for its own bookkeeping, but pointers previously handed out to callers
/// dangle after a move. Keep it in a `static` (or otherwise pinned in place)
/// while allocations are live.
pub struct StaticArrayMemory<const N: usize> {
    scratch: UnsafeCell<Scratch<N>>,
    brk: usize,
}

impl<const N: usize> ConstInit for StaticArrayMemory<N> {
    const INIT: Self = StaticArrayMemory {
        scratch: UnsafeCell::new(Scratch([0; N])),
        brk: 0,
    };
}

impl<const N: usize> StaticArrayMemory<N> {
    /// The number of bytes this memory can ever hand out.
    pub const CAPACITY: usize = N;
}

unsafe impl<const N: usize> Memory for StaticArrayMemory<N> {
    fn sbrk(&mut self, increment: Bytes) -> Result<NonNull<u8>, AllocError> {
        let end = match self.brk.checked_add(increment.0) {
            Some(end) if end <= N => end,
            _ => {
                return Err(AllocError::OutOfMemory {
                    requested: increment.0,
                })
            }
        };
        let ptr = unsafe { self.base().add(self.brk) };
        self.brk = end;
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            requested: increment.0,
        })
    }

    fn base(&self) -> *mut u8 {
        self.scratch.get() as *mut u8
    }

    fn size(&self) -> Bytes {
        Bytes(self.brk)
    }
}
