//! Merging freed blocks with their neighbors, and carving allocations out of
//! larger free blocks.

use crate::block::{Block, RawHeap, MIN_BLOCK_SIZE};
use crate::free_lists::FreeLists;

/// Merge a just-freed block with whichever of its address-order neighbors are
/// free, and return the merged block.
///
/// `block` must already be written as free and must not be in a free list.
/// Free neighbors are taken out of their lists; the caller inserts the result.
/// The merged block always starts at the lowest address involved, so it
/// inherits that block's previous-allocated bit.
pub(crate) fn coalesce(heap: RawHeap, lists: &mut FreeLists, block: Block) -> Block {
    let header = heap.header(block);
    extra_assert!(!header.is_allocated());

    let next = heap.next_block(block);
    let next_header = heap.header(next);
    let prev = if header.prev_allocated() {
        None
    } else {
        heap.prev_block(block)
    };
    let next_free = !next_header.is_allocated();

    let (start, size) = match (prev, next_free) {
        (None, false) => return block,
        (None, true) => {
            lists.remove(heap, next);
            (block, header.size() + next_header.size())
        }
        (Some(prev), false) => {
            lists.remove(heap, prev);
            (prev, heap.header(prev).size() + header.size())
        }
        (Some(prev), true) => {
            lists.remove(heap, prev);
            lists.remove(heap, next);
            (
                prev,
                heap.header(prev).size() + header.size() + next_header.size(),
            )
        }
    };

    let prev_allocated = heap.header(start).prev_allocated();
    heap.write_block(start, size, false, prev_allocated);
    start
}

/// Turn the free block `block` into an allocated block of `asize` bytes.
///
/// The block is taken out of its free list first. If what is left over is big
/// enough to be a block of its own, it is split off and put back as a free
/// block.
pub(crate) fn place(heap: RawHeap, lists: &mut FreeLists, block: Block, asize: usize) {
    let header = heap.header(block);
    let size = header.size();
    extra_assert!(!header.is_allocated());
    extra_assert!(size >= asize);

    lists.remove(heap, block);

    let remainder = size - asize;
    if remainder >= MIN_BLOCK_SIZE {
        // The remainder's header must exist before the allocated part's
        // successor patch reads it; until then that word is stale payload.
        let rest = block.plus(asize);
        heap.write_block(rest, remainder, false, true);
        heap.write_block(block, asize, true, header.prev_allocated());
        lists.insert(heap, rest);
    } else {
        heap.write_block(block, size, true, header.prev_allocated());
    }
}
