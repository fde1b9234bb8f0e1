//! Boundary-tag block layout.
//!
//! This is the only module that reads or writes heap memory. The heap is
//! treated as a flat byte arena ([`Arena`]) and blocks are addressed by their
//! byte offset from the arena base ([`Block`]). Everything above this module
//! works with offsets and never touches raw pointers.
//!
//! ```text
//! Allocated block:
//! ┌────────────────────┬────────────────────────────────────────┐
//! │ header (8 bytes)   │ payload                                │
//! └────────────────────┴────────────────────────────────────────┘
//!
//! Free block:
//! ┌────────────────────┬───────────┬───────────┬─────┬──────────┐
//! │ header (8 bytes)   │ next_free │ prev_free │ ... │ footer   │
//! └────────────────────┴───────────┴───────────┴─────┴──────────┘
//! ```
//!
//! The header packs the block size together with two flags: `FREE` and
//! `PREV_FREE` (the physically preceding block is free, so its footer can be
//! read right before this header).

use core::{fmt, ptr::NonNull};

use bitflags::bitflags;

/// Width of every metadata slot (header, free-list links, footer).
const SLOT_SIZE: usize = 8;
const _: () = assert!(size_of::<usize>() <= SLOT_SIZE);

/// Size of the block header preceding every payload.
pub const HEADER_SIZE: usize = SLOT_SIZE;

/// Size of the footer stored at the end of every free block.
pub const FOOTER_SIZE: usize = SLOT_SIZE;

/// Alignment of every block and every payload.
pub const MIN_ALIGN: usize = 8;

/// Smallest block that can hold a header, two free-list links and a footer.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 2 * SLOT_SIZE + FOOTER_SIZE;

const NEXT_LINK_OFFSET: usize = HEADER_SIZE;
const PREV_LINK_OFFSET: usize = HEADER_SIZE + SLOT_SIZE;

/// Encoded "no block" value of a free-list link.
const NIL: usize = usize::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HeaderFlags: usize {
        /// The block is free and linked into a size-class bucket.
        const FREE = 1 << 0;
        /// The physically preceding block is free.
        const PREV_FREE = 1 << 1;
    }
}

/// A block header word: the block size with two flags packed in the low bits.
///
/// The size is always a multiple of [`MIN_ALIGN`], so the low bits are never
/// part of it. All accessors keep the other field intact.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader(usize);

impl BlockHeader {
    const FLAGS_MASK: usize = HeaderFlags::all().bits();

    fn new(size: usize, flags: HeaderFlags) -> Self {
        debug_assert!(size.is_multiple_of(MIN_ALIGN), "unaligned block size");
        Self(size | flags.bits())
    }

    fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.0)
    }

    pub(crate) fn size(self) -> usize {
        self.0 & !Self::FLAGS_MASK
    }

    fn with_size(self, size: usize) -> Self {
        Self::new(size, self.flags())
    }

    pub(crate) fn is_free(self) -> bool {
        self.flags().contains(HeaderFlags::FREE)
    }

    pub(crate) fn is_prev_free(self) -> bool {
        self.flags().contains(HeaderFlags::PREV_FREE)
    }

    fn with_flag(self, flag: HeaderFlags, value: bool) -> Self {
        let mut flags = self.flags();
        flags.set(flag, value);
        Self::new(self.size(), flags)
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("size", &self.size())
            .field("free", &self.is_free())
            .field("prev_free", &self.is_prev_free())
            .finish()
    }
}

/// A block, identified by the offset of its header from the arena base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(usize);

impl Block {
    pub(crate) const fn offset(self) -> usize {
        self.0
    }

    /// Returns the block starting `bytes` after this one.
    pub(crate) const fn offset_by(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

/// The heap region, owned exclusively by the allocator.
#[derive(Debug)]
pub(crate) struct Arena {
    base: NonNull<u8>,
    len: usize,
}

impl Arena {
    /// Takes ownership of `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base` is aligned to [`MIN_ALIGN`] and `len` is a multiple of it
    /// - `len` is at least [`MIN_BLOCK_SIZE`]
    /// - `base..base + len` is valid for reads and writes, is not used by
    ///   anything else, and stays valid for the lifetime of the arena
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        assert!(base.as_ptr().addr().is_multiple_of(MIN_ALIGN));
        assert!(len.is_multiple_of(MIN_ALIGN));
        assert!(len >= MIN_BLOCK_SIZE);
        Self { base, len }
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr().addr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn first(&self) -> Block {
        Block(0)
    }

    /// Returns `true` if `block` could start a block inside this arena.
    pub(crate) fn contains(&self, block: Block) -> bool {
        block.0.is_multiple_of(MIN_ALIGN) && block.0 <= self.len - MIN_BLOCK_SIZE
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn slot(&self, offset: usize) -> *mut usize {
        debug_assert!(offset.is_multiple_of(SLOT_SIZE), "unaligned slot {offset:#x}");
        debug_assert!(
            offset + SLOT_SIZE <= self.len,
            "slot {offset:#x} outside heap of {:#x} bytes",
            self.len
        );
        unsafe { self.base.as_ptr().add(offset).cast::<usize>() }
    }

    fn read_slot(&self, offset: usize) -> usize {
        unsafe { self.slot(offset).read() }
    }

    fn write_slot(&mut self, offset: usize, value: usize) {
        unsafe { self.slot(offset).write(value) }
    }

    pub(crate) fn header(&self, block: Block) -> BlockHeader {
        BlockHeader(self.read_slot(block.0))
    }

    fn set_header(&mut self, block: Block, header: BlockHeader) {
        self.write_slot(block.0, header.0);
    }

    pub(crate) fn size(&self, block: Block) -> usize {
        self.header(block).size()
    }

    pub(crate) fn set_size(&mut self, block: Block, size: usize) {
        debug_assert!(size >= MIN_BLOCK_SIZE, "block size {size} below minimum");
        debug_assert!(block.0 + size <= self.len, "block overruns heap end");
        let header = self.header(block).with_size(size);
        self.set_header(block, header);
    }

    pub(crate) fn is_free(&self, block: Block) -> bool {
        self.header(block).is_free()
    }

    pub(crate) fn set_free(&mut self, block: Block, free: bool) {
        let header = self.header(block).with_flag(HeaderFlags::FREE, free);
        self.set_header(block, header);
    }

    pub(crate) fn is_prev_free(&self, block: Block) -> bool {
        self.header(block).is_prev_free()
    }

    pub(crate) fn set_prev_free(&mut self, block: Block, prev_free: bool) {
        let header = self.header(block).with_flag(HeaderFlags::PREV_FREE, prev_free);
        self.set_header(block, header);
    }

    /// Writes a fresh free block of `size` bytes at `block`, footer included.
    ///
    /// The free-list links are cleared; the block is not yet in any bucket.
    pub(crate) fn init_free_block(&mut self, block: Block, size: usize, prev_free: bool) {
        let mut flags = HeaderFlags::FREE;
        flags.set(HeaderFlags::PREV_FREE, prev_free);
        debug_assert!(size >= MIN_BLOCK_SIZE && block.0 + size <= self.len);
        self.set_header(block, BlockHeader::new(size, flags));
        self.set_next_link(block, None);
        self.set_prev_link(block, None);
        self.write_footer(block);
    }

    /// Returns the physically following block, or `None` at the heap end.
    pub(crate) fn next(&self, block: Block) -> Option<Block> {
        let next = block.0 + self.size(block);
        (next < self.len).then_some(Block(next))
    }

    /// Returns the physically preceding block by reading its footer.
    ///
    /// Only meaningful while `block` has `PREV_FREE` set; allocated blocks
    /// carry no footer.
    pub(crate) fn prev(&self, block: Block) -> Block {
        debug_assert!(self.is_prev_free(block), "previous block is not free");
        debug_assert!(block.0 >= MIN_BLOCK_SIZE, "first block has no predecessor");
        let prev_size = self.read_slot(block.0 - FOOTER_SIZE);
        debug_assert!(
            prev_size >= MIN_BLOCK_SIZE
                && prev_size.is_multiple_of(MIN_ALIGN)
                && prev_size <= block.0,
            "corrupted footer before block {:#x}: {prev_size:#x}",
            block.0
        );
        let prev = Block(block.0 - prev_size);
        debug_assert_eq!(
            self.size(prev),
            prev_size,
            "footer disagrees with header of block {:#x}",
            prev.0
        );
        prev
    }

    /// Copies the block size into the last slot of the block.
    pub(crate) fn write_footer(&mut self, block: Block) {
        let size = self.size(block);
        self.write_slot(block.0 + size - FOOTER_SIZE, size);
    }

    /// Returns `true` if the footer of `block` matches its header size.
    pub(crate) fn footer_matches(&self, block: Block) -> bool {
        let size = self.size(block);
        self.read_slot(block.0 + size - FOOTER_SIZE) == size
    }

    pub(crate) fn next_link(&self, block: Block) -> Option<Block> {
        decode_link(self.read_slot(block.0 + NEXT_LINK_OFFSET))
    }

    pub(crate) fn set_next_link(&mut self, block: Block, next: Option<Block>) {
        self.write_slot(block.0 + NEXT_LINK_OFFSET, encode_link(next));
    }

    pub(crate) fn prev_link(&self, block: Block) -> Option<Block> {
        decode_link(self.read_slot(block.0 + PREV_LINK_OFFSET))
    }

    pub(crate) fn set_prev_link(&mut self, block: Block, prev: Option<Block>) {
        self.write_slot(block.0 + PREV_LINK_OFFSET, encode_link(prev));
    }

    pub(crate) fn payload(&self, block: Block) -> NonNull<u8> {
        debug_assert!(block.0 + HEADER_SIZE < self.len);
        unsafe { self.base.add(block.0 + HEADER_SIZE) }
    }

    /// Number of bytes the caller may use in an allocated block.
    pub(crate) fn payload_capacity(&self, block: Block) -> usize {
        self.size(block) - HEADER_SIZE
    }

    /// Resolves a payload pointer back to its block.
    ///
    /// Debug builds validate the header behind `ptr` and panic on pointers
    /// that do not belong to a live allocation of this arena.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned for a block of this arena that is still
    /// allocated.
    pub(crate) unsafe fn from_payload(&self, ptr: NonNull<u8>) -> Block {
        let block = Block(
            ptr.as_ptr()
                .addr()
                .wrapping_sub(self.base_addr())
                .wrapping_sub(HEADER_SIZE),
        );
        if cfg!(debug_assertions) {
            self.validate_allocated(block);
        }
        block
    }

    fn validate_allocated(&self, block: Block) {
        assert!(
            self.contains(block),
            "pointer {:#x} does not belong to this heap",
            self.base_addr().wrapping_add(block.0 + HEADER_SIZE)
        );
        let header = self.header(block);
        let size = header.size();
        assert!(
            size >= MIN_BLOCK_SIZE && size <= self.len - block.0,
            "corrupted header at {:#x}: {header:?}",
            self.base_addr() + block.0
        );
        assert!(
            !header.is_free(),
            "double free of {:#x}",
            self.base_addr() + block.0 + HEADER_SIZE
        );
    }

    /// Copies `len` payload bytes from `src` to `dst`.
    pub(crate) fn copy_payload(&mut self, src: Block, dst: Block, len: usize) {
        debug_assert_ne!(src, dst);
        debug_assert!(len <= self.payload_capacity(src));
        debug_assert!(len <= self.payload_capacity(dst));
        let src = self.payload(src);
        let dst = self.payload(dst);
        // distinct blocks never overlap
        unsafe { src.copy_to_nonoverlapping(dst, len) }
    }

    /// Fills the first `len` payload bytes of `block` with zeros.
    pub(crate) fn zero_payload(&mut self, block: Block, len: usize) {
        debug_assert!(len <= self.payload_capacity(block));
        let payload = self.payload(block);
        unsafe { payload.write_bytes(0, len) }
    }
}

fn encode_link(link: Option<Block>) -> usize {
    link.map_or(NIL, Block::offset)
}

fn decode_link(raw: usize) -> Option<Block> {
    (raw != NIL).then_some(Block(raw))
}
