//! Segregated free lists.
//!
//! Free blocks are kept in `NUM_BUCKETS` LIFO lists. Bucket zero is reserved
//! for mini blocks; every other bucket covers one power-of-two size range:
//!
//! ```text
//! bucket   0      1       2       3             13                14
//! sizes   16   17..32  33..64  65..128  ...  65537..131072   131073..
//! ```
//!
//! Full free blocks link through the first two words of their payload
//! (`next`, then `prev`). Mini blocks only have one payload word, so their
//! `next` link lives in the upper bits of the header and their `prev` link in
//! the payload word. Either way both directions are available, so insertion
//! and removal are O(1).

use crate::block::{encode_mini_back_link, Block, Header, RawHeap, MIN_BLOCK_SIZE, WSIZE};
use crate::const_init::ConstInit;
use core::cmp;

/// Number of size classes, the mini list included.
pub const NUM_BUCKETS: usize = 15;

/// The bucket that holds every free mini block.
pub(crate) const MINI_BUCKET: usize = 0;

/// The bucket a free block of `size` bytes belongs in.
#[inline]
pub(crate) fn bucket_for(size: usize) -> usize {
    extra_assert!(size > 0);
    if size <= MIN_BLOCK_SIZE {
        return MINI_BUCKET;
    }
    // ceil(log2(size)) - 4, so that 17..=32 lands in bucket 1.
    let ceil_log2 = (usize::BITS - (size - 1).leading_zeros()) as usize;
    cmp::min(ceil_log2 - 4, NUM_BUCKETS - 1)
}

/// The next block in `block`'s free list.
pub(crate) fn next_free(heap: RawHeap, block: Block) -> Option<Block> {
    match heap.header(block) {
        Header::Mini { next, .. } => next,
        Header::Full { .. } => Block::decode_link(heap.word(block.payload_offset())),
    }
}

/// The previous block in `block`'s free list.
pub(crate) fn prev_free(heap: RawHeap, block: Block) -> Option<Block> {
    let offset = match heap.header(block) {
        Header::Mini { .. } => block.payload_offset(),
        Header::Full { .. } => block.payload_offset() + WSIZE,
    };
    Block::decode_link(heap.word(offset))
}

fn set_next_free(heap: RawHeap, block: Block, link: Option<Block>) {
    match heap.header(block) {
        Header::Mini {
            allocated,
            prev_allocated,
            ..
        } => heap.set_header(
            block,
            Header::Mini {
                allocated,
                prev_allocated,
                next: link,
            },
        ),
        Header::Full { .. } => heap.set_word(block.payload_offset(), Block::encode_link(link)),
    }
}

fn set_prev_free(heap: RawHeap, block: Block, link: Option<Block>) {
    if heap.header(block).is_mini() {
        heap.set_word(block.payload_offset(), encode_mini_back_link(link));
    } else {
        heap.set_word(block.payload_offset() + WSIZE, Block::encode_link(link));
    }
}

/// The heads of every bucket's list.
pub(crate) struct FreeLists {
    heads: [Option<Block>; NUM_BUCKETS],
}

impl ConstInit for FreeLists {
    const INIT: FreeLists = FreeLists {
        heads: [None; NUM_BUCKETS],
    };
}

impl FreeLists {
    #[inline]
    pub(crate) fn head(&self, bucket: usize) -> Option<Block> {
        self.heads[bucket]
    }

    /// Push a free block onto the front of its bucket.
    pub(crate) fn insert(&mut self, heap: RawHeap, block: Block) {
        let header = heap.header(block);
        extra_assert!(!header.is_allocated(), "inserting an allocated block");
        let bucket = bucket_for(header.size());

        let head = self.heads[bucket];
        extra_assert!(head != Some(block), "double insert of {:?}", block);
        set_next_free(heap, block, head);
        set_prev_free(heap, block, None);
        if let Some(head) = head {
            set_prev_free(heap, head, Some(block));
        }
        self.heads[bucket] = Some(block);
    }

    /// Unlink a block from whichever bucket it is in.
    pub(crate) fn remove(&mut self, heap: RawHeap, block: Block) {
        let header = heap.header(block);
        extra_assert!(!header.is_allocated(), "removing an allocated block");
        let bucket = bucket_for(header.size());

        let next = next_free(heap, block);
        let prev = prev_free(heap, block);
        match prev {
            Some(prev) => set_next_free(heap, prev, next),
            None => {
                extra_assert_eq!(self.heads[bucket], Some(block));
                self.heads[bucket] = next;
            }
        }
        if let Some(next) = next {
            set_prev_free(heap, next, prev);
        }
    }

    /// Find a free block of at least `asize` bytes.
    ///
    /// A minimum-sized request takes the head of the mini list if there is
    /// one. Otherwise buckets are searched from the one `asize` maps to
    /// upwards. Within a bucket, the smallest of the first `candidates`
    /// blocks that fit wins, and the search stops at the first bucket that
    /// has any fit at all. An exact fit ends the search immediately.
    pub(crate) fn find_fit(&self, heap: RawHeap, asize: usize, candidates: usize) -> Option<Block> {
        extra_assert!(asize >= MIN_BLOCK_SIZE);
        extra_assert!(candidates > 0);

        if asize == MIN_BLOCK_SIZE {
            if let Some(mini) = self.heads[MINI_BUCKET] {
                return Some(mini);
            }
        }

        let first = cmp::max(bucket_for(asize), MINI_BUCKET + 1);
        for bucket in first..NUM_BUCKETS {
            let mut best: Option<(Block, usize)> = None;
            let mut seen = 0;
            let mut cursor = self.heads[bucket];

            while let Some(block) = cursor {
                let size = heap.header(block).size();
                if size >= asize {
                    if size == asize {
                        return Some(block);
                    }
                    if best.map_or(true, |(_, best_size)| size < best_size) {
                        best = Some((block, size));
                    }
                    seen += 1;
                    if seen == candidates {
                        break;
                    }
                }
                cursor = next_free(heap, block);
            }

            if let Some((block, _)) = best {
                return Some(block);
            }
        }

        None
    }
}
