//! Block layout: how a block describes itself with in-band words.
//!
//! Every block starts with a one-word header. Sizes are multiples of the
//! 16-byte alignment unit, which leaves the low four bits of a header free for
//! tags:
//!
//! ```text
//!  63                                         4   3   2   1   0
//! +---------------------------------------------+---+---+---+---+
//! | size                                        | - | M | P | A |   full block
//! +---------------------------------------------+---+---+---+---+
//! | offset of next free mini block          |  -    | M | P | A |   mini block
//! +-----------------------------------------+-------+---+---+---+
//!
//! A = this block is allocated
//! P = the block immediately before this one is allocated
//! M = this is a mini block (exactly `MIN_BLOCK_SIZE` bytes)
//! ```
//!
//! A free full block repeats its header as a footer in its last word, so the
//! block after it can find its start. An allocated block has no footer at all:
//! its successor's `P` bit says it is allocated, and nobody ever needs to walk
//! backwards into it.
//!
//! A mini block has no room for a footer. When free, its payload word holds
//! its back link in the free mini list, tagged with `M`, and that tag is how
//! its successor knows to step back exactly `MIN_BLOCK_SIZE` bytes.

use crate::memory::Memory;
use crate::HeapError;
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};

/// A heap word.
pub(crate) type Word = u64;

/// Size of a header, a footer, or a free list link.
pub(crate) const WSIZE: usize = 8;

/// Every payload address and every block size is a multiple of this.
pub const ALIGNMENT: usize = 2 * WSIZE;

/// The smallest block: a header plus one payload word.
pub const MIN_BLOCK_SIZE: usize = 2 * WSIZE;

const ALLOCATED: Word = 0b001;
const PREV_ALLOCATED: Word = 0b010;
const MINI: Word = 0b100;
const SIZE_MASK: Word = !0xf;
const LINK_MASK: Word = !0x7;

extra_only! {
    fn assert_is_block_aligned(offset: usize) {
        assert_eq!(
            (offset + WSIZE) % ALIGNMENT,
            0,
            "block at {:#x} does not have an aligned payload",
            offset
        );
    }
}

/// A block, named by the byte offset of its header from the heap base.
///
/// Offset zero is the prologue word, which is never a block, so `Option<Block>`
/// doubles as a nullable free list link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(NonZeroUsize);

impl Block {
    /// The first real block sits right after the prologue word.
    pub(crate) const FIRST: Block = match NonZeroUsize::new(WSIZE) {
        Some(offset) => Block(offset),
        None => panic!("the prologue word has a size"),
    };

    #[inline]
    pub(crate) fn at(offset: usize) -> Option<Block> {
        NonZeroUsize::new(offset).map(Block)
    }

    #[inline]
    pub(crate) fn offset(self) -> usize {
        self.0.get()
    }

    /// The block starting `size` bytes after this one.
    #[inline]
    pub(crate) fn plus(self, size: usize) -> Block {
        Block(self.0.saturating_add(size))
    }

    #[inline]
    pub(crate) fn payload_offset(self) -> usize {
        self.offset() + WSIZE
    }

    /// Encode a free list link. `None` is zero.
    #[inline]
    pub(crate) fn encode_link(link: Option<Block>) -> Word {
        link.map_or(0, |b| b.offset() as Word)
    }

    /// Decode a free list link, ignoring any tag bits.
    #[inline]
    pub(crate) fn decode_link(word: Word) -> Option<Block> {
        Block::at((word & LINK_MASK) as usize)
    }
}

/// The payload word of a free mini block: its back link plus the mini tag.
#[inline]
pub(crate) fn encode_mini_back_link(link: Option<Block>) -> Word {
    Block::encode_link(link) | MINI
}

/// Whether `word` carries the mini tag. Works on headers and on the payload
/// word of a free mini block alike.
#[inline]
pub(crate) fn is_mini_word(word: Word) -> bool {
    word & MINI != 0
}

/// A decoded header (or footer) word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Header {
    Full {
        size: usize,
        allocated: bool,
        prev_allocated: bool,
    },
    Mini {
        allocated: bool,
        prev_allocated: bool,
        next: Option<Block>,
    },
}

impl Header {
    /// The zero-sized, allocated tag used for the prologue and epilogue.
    pub(crate) const fn sentinel(prev_allocated: bool) -> Header {
        Header::Full {
            size: 0,
            allocated: true,
            prev_allocated,
        }
    }

    /// The header of a block of `size` bytes that is in no free list. Picks the
    /// mini encoding for minimum-sized blocks.
    pub(crate) fn new(size: usize, allocated: bool, prev_allocated: bool) -> Header {
        extra_assert!(size >= MIN_BLOCK_SIZE);
        extra_assert_eq!(size % ALIGNMENT, 0);
        if size == MIN_BLOCK_SIZE {
            Header::Mini {
                allocated,
                prev_allocated,
                next: None,
            }
        } else {
            Header::Full {
                size,
                allocated,
                prev_allocated,
            }
        }
    }

    pub(crate) fn encode(self) -> Word {
        let (word, allocated, prev_allocated) = match self {
            Header::Full {
                size,
                allocated,
                prev_allocated,
            } => {
                extra_assert_eq!(size as Word & !SIZE_MASK, 0);
                (size as Word, allocated, prev_allocated)
            }
            Header::Mini {
                allocated,
                prev_allocated,
                next,
            } => (Block::encode_link(next) | MINI, allocated, prev_allocated),
        };
        let word = if allocated { word | ALLOCATED } else { word };
        if prev_allocated {
            word | PREV_ALLOCATED
        } else {
            word
        }
    }

    pub(crate) fn decode(word: Word) -> Header {
        let allocated = word & ALLOCATED != 0;
        let prev_allocated = word & PREV_ALLOCATED != 0;
        if is_mini_word(word) {
            Header::Mini {
                allocated,
                prev_allocated,
                next: Block::decode_link(word),
            }
        } else {
            Header::Full {
                size: (word & SIZE_MASK) as usize,
                allocated,
                prev_allocated,
            }
        }
    }

    #[inline]
    pub(crate) fn size(self) -> usize {
        match self {
            Header::Full { size, .. } => size,
            Header::Mini { .. } => MIN_BLOCK_SIZE,
        }
    }

    #[inline]
    pub(crate) fn is_allocated(self) -> bool {
        match self {
            Header::Full { allocated, .. } | Header::Mini { allocated, .. } => allocated,
        }
    }

    #[inline]
    pub(crate) fn prev_allocated(self) -> bool {
        match self {
            Header::Full { prev_allocated, .. } | Header::Mini { prev_allocated, .. } => {
                prev_allocated
            }
        }
    }

    #[inline]
    pub(crate) fn is_mini(self) -> bool {
        matches!(self, Header::Mini { .. })
    }

    pub(crate) fn with_prev_allocated(self, prev_allocated: bool) -> Header {
        match self {
            Header::Full {
                size, allocated, ..
            } => Header::Full {
                size,
                allocated,
                prev_allocated,
            },
            Header::Mini {
                allocated, next, ..
            } => Header::Mini {
                allocated,
                prev_allocated,
                next,
            },
        }
    }

    /// Does this header need a matching footer?
    #[inline]
    pub(crate) fn has_footer(self) -> bool {
        matches!(
            self,
            Header::Full {
                size,
                allocated: false,
                ..
            } if size != 0
        )
    }
}

/// A view of the heap as an array of words, addressed by offset.
///
/// This is the only place that dereferences heap memory. Callers are trusted
/// to pass offsets of words inside the heap; that is only checked when the
/// "extra_assertions" feature is on. The validator uses the checked
/// `try_word` instead, since it has to survive a corrupt heap.
#[derive(Clone, Copy)]
pub(crate) struct RawHeap<'m> {
    base: *mut u8,
    len: usize,
    _memory: PhantomData<&'m ()>,
}

impl<'m> RawHeap<'m> {
    pub(crate) fn new<M: Memory>(memory: &'m M) -> RawHeap<'m> {
        let base = memory.base();
        extra_assert!(!base.is_null());
        extra_assert_eq!(base as usize % ALIGNMENT, 0);
        RawHeap {
            base,
            len: memory.size().0,
            _memory: PhantomData,
        }
    }

    /// Total bytes in the heap, sentinels included.
    #[inline]
    pub(crate) fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn first_block(self) -> Block {
        Block::FIRST
    }

    /// The epilogue header is always the last word of the heap.
    #[inline]
    pub(crate) fn epilogue(self) -> Block {
        extra_assert!(self.len >= 2 * WSIZE);
        Block::FIRST.plus(self.len - 2 * WSIZE)
    }

    #[inline]
    pub(crate) fn word(self, offset: usize) -> Word {
        extra_assert!(offset + WSIZE <= self.len, "{:#x} is past the heap", offset);
        extra_assert_eq!(offset % WSIZE, 0);
        unsafe { ptr::read(self.base.add(offset) as *const Word) }
    }

    #[inline]
    pub(crate) fn set_word(self, offset: usize, word: Word) {
        extra_assert!(offset + WSIZE <= self.len, "{:#x} is past the heap", offset);
        extra_assert_eq!(offset % WSIZE, 0);
        unsafe { ptr::write(self.base.add(offset) as *mut Word, word) }
    }

    /// Read a word, reporting instead of trusting a bad offset.
    pub(crate) fn try_word(self, offset: usize) -> Result<Word, HeapError> {
        match offset.checked_add(WSIZE) {
            Some(end) if end <= self.len && offset % WSIZE == 0 => Ok(self.word(offset)),
            _ => Err(HeapError::OutOfBounds { offset }),
        }
    }

    #[inline]
    pub(crate) fn header(self, block: Block) -> Header {
        Header::decode(self.word(block.offset()))
    }

    #[inline]
    pub(crate) fn set_header(self, block: Block, header: Header) {
        self.set_word(block.offset(), header.encode());
    }

    /// Offset of the footer of a block that is `size` bytes long.
    #[inline]
    pub(crate) fn footer_offset(block: Block, size: usize) -> usize {
        extra_assert!(size >= MIN_BLOCK_SIZE);
        block.offset() + size - WSIZE
    }

    /// The block immediately after `block` in address order. Must not be
    /// called on the epilogue.
    #[inline]
    pub(crate) fn next_block(self, block: Block) -> Block {
        let size = self.header(block).size();
        extra_assert!(size != 0, "next_block called on the epilogue");
        block.plus(size)
    }

    /// The block immediately before `block` in address order, or `None` for
    /// the first block.
    ///
    /// Only meaningful when that block is free: allocated blocks have no
    /// footer to read.
    pub(crate) fn prev_block(self, block: Block) -> Option<Block> {
        extra_assert!(!self.header(block).prev_allocated());
        let before = self.word(block.offset() - WSIZE);
        if is_mini_word(before) {
            return Block::at(block.offset() - MIN_BLOCK_SIZE);
        }
        match Header::decode(before).size() {
            0 => None,
            size => Block::at(block.offset() - size),
        }
    }

    /// Write the header (and, if free, the footer or mini back link) of a block
    /// that is in no free list, and tell the following block about the new
    /// allocation status.
    pub(crate) fn write_block(self, block: Block, size: usize, allocated: bool, prev_allocated: bool) {
        assert_is_block_aligned(block.offset());
        extra_assert!(block.offset() + size < self.len);

        let header = Header::new(size, allocated, prev_allocated);
        self.set_header(block, header);
        if header.has_footer() {
            self.set_word(Self::footer_offset(block, size), header.encode());
        } else if header.is_mini() && !allocated {
            self.set_word(block.payload_offset(), encode_mini_back_link(None));
        }

        let next = self.next_block(block);
        self.set_prev_allocated(next, allocated);
    }

    /// Patch the previous-allocated bit of `block`, keeping everything else
    /// (including a mini block's list link) intact.
    pub(crate) fn set_prev_allocated(self, block: Block, prev_allocated: bool) {
        let header = self.header(block).with_prev_allocated(prev_allocated);
        self.set_header(block, header);
        if header.has_footer() {
            self.set_word(Self::footer_offset(block, header.size()), header.encode());
        }
    }

    #[inline]
    pub(crate) fn payload(self, block: Block) -> NonNull<u8> {
        let ptr = unsafe { self.base.add(block.payload_offset()) };
        extra_assert_eq!(ptr as usize % ALIGNMENT, 0);
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// The block owning the payload at `ptr`.
    #[inline]
    pub(crate) fn block_of(self, ptr: *mut u8) -> Block {
        let offset = (ptr as usize).wrapping_sub(self.base as usize);
        extra_assert!(offset > WSIZE && offset < self.len, "{:p} is not in the heap", ptr);
        match Block::at(offset - WSIZE) {
            Some(block) => block,
            None => unreachable!("payload pointer {:p} precedes the first block", ptr),
        }
    }

    /// Bytes the owner of an allocated block may use.
    #[inline]
    pub(crate) fn payload_size(self, block: Block) -> usize {
        // An allocated block has no footer; everything but the header is
        // payload.
        self.header(block).size() - WSIZE
    }
}
