//! The heap validator.
//!
//! Walks the whole heap in address order and then every free list, checking
//! that the two views agree. Every read goes through `RawHeap::try_word`, so a
//! corrupt heap produces a `HeapError` rather than a wild read.

use crate::block::{Block, Header, RawHeap, Word, ALIGNMENT, MIN_BLOCK_SIZE, WSIZE};
use crate::free_lists::{bucket_for, FreeLists, NUM_BUCKETS};
use crate::HeapError;

/// A summary of heap occupancy, gathered by the same walk that validates it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total bytes obtained from the backing memory, sentinels included.
    pub heap_bytes: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Bytes in allocated blocks, headers included.
    pub allocated_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Bytes in free blocks.
    pub free_bytes: usize,
    /// Size of the largest free block, or zero if there is none.
    pub largest_free: usize,
    /// Number of free mini blocks.
    pub mini_free_blocks: usize,
}

fn header_at(heap: RawHeap, offset: usize) -> Result<(Word, Header), HeapError> {
    let word = heap.try_word(offset)?;
    Ok((word, Header::decode(word)))
}

/// Check every heap invariant, returning occupancy stats on success.
pub(crate) fn validate(heap: RawHeap, lists: &FreeLists) -> Result<HeapStats, HeapError> {
    let mut stats = HeapStats {
        heap_bytes: heap.len(),
        ..HeapStats::default()
    };

    if heap.len() < 2 * WSIZE || heap.len() % ALIGNMENT != 0 {
        return Err(HeapError::OutOfBounds { offset: heap.len() });
    }

    let prologue = heap.try_word(0)?;
    if prologue != Header::sentinel(false).encode() {
        return Err(HeapError::Prologue { word: prologue });
    }

    let epilogue = heap.epilogue().offset();
    let mut offset = heap.first_block().offset();
    let mut prev_offset = 0;
    let mut prev_allocated = true;

    while offset != epilogue {
        let (word, header) = header_at(heap, offset)?;
        let size = header.size();

        if size == 0 {
            return Err(HeapError::ZeroSized { offset });
        }
        if size % ALIGNMENT != 0 || (offset + WSIZE) % ALIGNMENT != 0 {
            return Err(HeapError::Misaligned { offset, size });
        }
        match offset.checked_add(size) {
            Some(end) if end <= epilogue => {}
            _ => return Err(HeapError::OutOfBounds { offset }),
        }
        if header.prev_allocated() != prev_allocated {
            return Err(HeapError::PrevAllocatedMismatch {
                offset: prev_offset,
            });
        }

        if header.is_allocated() {
            stats.allocated_blocks += 1;
            stats.allocated_bytes += size;
        } else {
            if !prev_allocated {
                return Err(HeapError::AdjacentFree { offset });
            }
            if header.is_mini() {
                let back = heap.try_word(offset + WSIZE)?;
                if !crate::block::is_mini_word(back) {
                    return Err(HeapError::MiniMarker { offset });
                }
                stats.mini_free_blocks += 1;
            } else {
                let footer = heap.try_word(offset + size - WSIZE)?;
                if footer != word {
                    return Err(HeapError::FooterMismatch {
                        offset,
                        header: word,
                        footer,
                    });
                }
            }
            stats.free_blocks += 1;
            stats.free_bytes += size;
            stats.largest_free = stats.largest_free.max(size);
        }

        prev_allocated = header.is_allocated();
        prev_offset = offset;
        offset += size;
    }

    let (word, header) = header_at(heap, epilogue)?;
    if header.is_mini() || header.size() != 0 || !header.is_allocated() {
        return Err(HeapError::Epilogue {
            offset: epilogue,
            word,
        });
    }
    if header.prev_allocated() != prev_allocated {
        return Err(HeapError::PrevAllocatedMismatch {
            offset: prev_offset,
        });
    }

    let listed = check_free_lists(heap, lists, stats.free_blocks)?;
    if listed != stats.free_blocks {
        return Err(HeapError::FreeCountMismatch {
            heap: stats.free_blocks,
            lists: listed,
        });
    }

    Ok(stats)
}

/// A block named by a free list link must lie inside the heap on a block
/// boundary, with room for its links.
fn check_link(heap: RawHeap, from: usize, link: Block) -> Result<(), HeapError> {
    let offset = link.offset();
    let in_heap = offset >= heap.first_block().offset()
        && offset.checked_add(MIN_BLOCK_SIZE).map_or(false, |end| end <= heap.epilogue().offset())
        && (offset + WSIZE) % ALIGNMENT == 0;
    if in_heap {
        Ok(())
    } else {
        Err(HeapError::BrokenLink { offset: from, link: offset })
    }
}

/// The `(next, prev)` links of a free block, read defensively.
fn links(heap: RawHeap, block: Block, header: Header) -> Result<(Option<Block>, Option<Block>), HeapError> {
    match header {
        Header::Mini { next, .. } => {
            let back = heap.try_word(block.payload_offset())?;
            Ok((next, Block::decode_link(back)))
        }
        Header::Full { size, .. } => {
            if size < MIN_BLOCK_SIZE + ALIGNMENT {
                return Err(HeapError::Misaligned {
                    offset: block.offset(),
                    size,
                });
            }
            let next = heap.try_word(block.payload_offset())?;
            let prev = heap.try_word(block.payload_offset() + WSIZE)?;
            Ok((Block::decode_link(next), Block::decode_link(prev)))
        }
    }
}

/// Walk every bucket, returning how many blocks they hold in total.
fn check_free_lists(heap: RawHeap, lists: &FreeLists, heap_free: usize) -> Result<usize, HeapError> {
    let mut total = 0;

    for bucket in 0..NUM_BUCKETS {
        let mut prev: Option<Block> = None;
        let mut cursor = lists.head(bucket);
        let mut steps = 0;

        while let Some(block) = cursor {
            check_link(heap, prev.map_or(0, Block::offset), block)?;

            steps += 1;
            if steps > heap_free {
                return Err(HeapError::Cycle { bucket });
            }

            let (_, header) = header_at(heap, block.offset())?;
            if header.size() == 0 {
                return Err(HeapError::ZeroSized {
                    offset: block.offset(),
                });
            }
            if header.is_allocated() {
                return Err(HeapError::AllocatedInFreeList {
                    offset: block.offset(),
                    bucket,
                });
            }
            let expected = bucket_for(header.size());
            if expected != bucket {
                return Err(HeapError::WrongBucket {
                    offset: block.offset(),
                    size: header.size(),
                    bucket,
                    expected,
                });
            }

            let (next, back) = links(heap, block, header)?;
            if back != prev {
                return Err(HeapError::BrokenLink {
                    offset: block.offset(),
                    link: Block::encode_link(back) as usize,
                });
            }

            prev = Some(block);
            cursor = next;
        }

        total += steps;
    }

    Ok(total)
}
