use thiserror::Error;

/// Why an allocation request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// A zero-byte request. Nothing is allocated and the heap is untouched.
    #[error("zero-sized allocation request")]
    ZeroSize,

    /// The backing memory refused to grow the heap far enough.
    #[error("out of memory while requesting {requested} bytes")]
    OutOfMemory {
        /// The number of bytes the heap would have had to grow by (or the
        /// caller's request, when that could not even be adjusted).
        requested: usize,
    },

    /// `count * size` does not fit in a `usize`.
    #[error("array of {count} elements of {size} bytes overflows usize")]
    Overflow {
        /// Requested element count.
        count: usize,
        /// Requested element size.
        size: usize,
    },
}

/// A violated heap invariant, as discovered by the heap validator.
///
/// Every offset is a byte offset from the base of the heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The prologue sentinel is not a zero-sized allocated tag.
    #[error("bad prologue word {word:#x}")]
    Prologue {
        /// The raw prologue word.
        word: u64,
    },

    /// The epilogue sentinel is not a zero-sized allocated, non-mini header.
    #[error("bad epilogue header {word:#x} at offset {offset:#x}")]
    Epilogue {
        /// Offset of the epilogue header.
        offset: usize,
        /// The raw epilogue header.
        word: u64,
    },

    /// A block, footer, or link points outside of the heap region.
    #[error("offset {offset:#x} is outside of the heap")]
    OutOfBounds {
        /// The offending offset.
        offset: usize,
    },

    /// A block's payload or size is not a multiple of the alignment unit.
    #[error("block at {offset:#x} of size {size} is misaligned")]
    Misaligned {
        /// Offset of the block header.
        offset: usize,
        /// The block's size.
        size: usize,
    },

    /// A non-sentinel block claims to be zero-sized.
    #[error("block at {offset:#x} has size zero")]
    ZeroSized {
        /// Offset of the block header.
        offset: usize,
    },

    /// A free, non-mini block's header and footer disagree.
    #[error("block at {offset:#x} has header {header:#x} but footer {footer:#x}")]
    FooterMismatch {
        /// Offset of the block header.
        offset: usize,
        /// The raw header word.
        header: u64,
        /// The raw footer word.
        footer: u64,
    },

    /// Two address-adjacent blocks are both free.
    #[error("free block at {offset:#x} is adjacent to another free block")]
    AdjacentFree {
        /// Offset of the second of the two free blocks.
        offset: usize,
    },

    /// A block's allocated bit disagrees with its successor's
    /// previous-allocated bit.
    #[error("block at {offset:#x} disagrees with its successor's prev_allocated bit")]
    PrevAllocatedMismatch {
        /// Offset of the predecessor block.
        offset: usize,
    },

    /// A free list link is not mirrored by the linked block.
    #[error("free list link from {offset:#x} to {link:#x} is not mirrored")]
    BrokenLink {
        /// Offset of the block holding the link.
        offset: usize,
        /// Offset the link points at.
        link: usize,
    },

    /// A free mini block's payload word does not carry the mini marker.
    #[error("free mini block at {offset:#x} is missing its back-link marker")]
    MiniMarker {
        /// Offset of the mini block.
        offset: usize,
    },

    /// An allocated block is reachable from a free list.
    #[error("allocated block at {offset:#x} is in free list bucket {bucket}")]
    AllocatedInFreeList {
        /// Offset of the allocated block.
        offset: usize,
        /// Bucket whose list contains it.
        bucket: usize,
    },

    /// A free block sits in a bucket that does not match its size.
    #[error("block at {offset:#x} of size {size} is in bucket {bucket}, expected {expected}")]
    WrongBucket {
        /// Offset of the free block.
        offset: usize,
        /// The block's size.
        size: usize,
        /// Bucket whose list contains it.
        bucket: usize,
        /// Bucket its size maps to.
        expected: usize,
    },

    /// A free list does not terminate.
    #[error("free list bucket {bucket} contains a cycle")]
    Cycle {
        /// The cyclic bucket.
        bucket: usize,
    },

    /// The heap walk and the free list walk found different numbers of free
    /// blocks.
    #[error("{heap} free blocks in the heap but {lists} in the free lists")]
    FreeCountMismatch {
        /// Free blocks found walking the heap in address order.
        heap: usize,
        /// Free blocks found walking every bucket.
        lists: usize,
    },
}
