//! Heap walking and consistency checking.

use snafu::{Snafu, ensure};

use crate::{
    block::{Arena, Block, HEADER_SIZE, MIN_ALIGN, MIN_BLOCK_SIZE},
    size_class::{NUM_SIZE_CLASSES, size_class},
    tlsf::{HeapStats, TlsfAllocator},
};

/// One block of the heap, as seen by [`TlsfAllocator::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub addr: usize,
    /// Block size, header included.
    pub size: usize,
    /// The block is free.
    pub is_free: bool,
    /// The block before this one is free.
    pub prev_free: bool,
}

impl BlockInfo {
    /// Address of the payload that was (or would be) handed out.
    #[must_use]
    pub fn payload_addr(&self) -> usize {
        self.addr + HEADER_SIZE
    }
}

/// Iterator over the physical blocks of a heap in address order.
///
/// Stops early at a header whose size would leave the heap.
pub struct Blocks<'a> {
    arena: Option<&'a Arena>,
    cursor: Option<Block>,
}

impl<'a> Blocks<'a> {
    pub(crate) fn new(arena: Option<&'a Arena>) -> Self {
        Self {
            cursor: arena.map(Arena::first),
            arena,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let arena = self.arena?;
        let block = self.cursor.take()?;
        let header = arena.header(block);
        let size = header.size();
        if size < MIN_BLOCK_SIZE || size > arena.len() - block.offset() {
            return None;
        }
        self.cursor = arena.next(block);
        Some(BlockInfo {
            addr: arena.base_addr() + block.offset(),
            size,
            is_free: header.is_free(),
            prev_free: header.is_prev_free(),
        })
    }
}

/// Broken heap invariants found by [`TlsfAllocator::check`].
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum CorruptionError {
    #[snafu(display("block at {addr:#x} has invalid size {size:#x}"))]
    InvalidBlockSize { addr: usize, size: usize },
    #[snafu(display("blocks cover {covered:#x} of {len:#x} heap bytes"))]
    Coverage { covered: usize, len: usize },
    #[snafu(display("adjacent free blocks at {addr:#x}"))]
    AdjacentFree { addr: usize },
    #[snafu(display("PREV_FREE flag of block at {addr:#x} disagrees with its predecessor"))]
    PrevFreeMismatch { addr: usize },
    #[snafu(display("footer of free block at {addr:#x} disagrees with its header"))]
    FooterMismatch { addr: usize },
    #[snafu(display("free list {class} links to invalid block at offset {offset:#x}"))]
    InvalidLink { class: usize, offset: usize },
    #[snafu(display("block at {addr:#x} is linked into free list {class} but is not free"))]
    NotFree { addr: usize, class: usize },
    #[snafu(display("block at {addr:#x} of size {size:#x} is in free list {class}"))]
    WrongBucket {
        addr: usize,
        size: usize,
        class: usize,
    },
    #[snafu(display("back link of block at {addr:#x} is broken"))]
    BrokenBackLink { addr: usize },
    #[snafu(display("free lists hold {listed} blocks but the heap has {free} free blocks"))]
    UnlistedFreeBlock { listed: usize, free: usize },
    #[snafu(display("bitmap bit {class} disagrees with its free list"))]
    BitmapMismatch { class: usize },
    #[snafu(display("counters report {recorded} but the heap holds {actual}"))]
    CounterMismatch {
        recorded: HeapStats,
        actual: HeapStats,
    },
}

impl TlsfAllocator {
    /// Verifies every heap invariant and returns the byte counts found.
    ///
    /// Checks that the blocks tile the heap exactly, that no two adjacent
    /// blocks are free, that `PREV_FREE` flags and footers agree with their
    /// neighbours, that every free block sits in the bucket for its size, that
    /// the bitmap matches the buckets and that the counters match the blocks.
    ///
    /// Runs in time linear in the number of blocks.
    pub fn check(&self) -> Result<HeapStats, CorruptionError> {
        let Some(arena) = self.arena() else {
            return Ok(HeapStats::default());
        };

        let (actual, free_blocks) = check_blocks(arena)?;
        let listed = check_free_lists(self, arena, free_blocks)?;
        ensure!(
            listed == free_blocks,
            UnlistedFreeBlockSnafu {
                listed,
                free: free_blocks,
            }
        );

        let recorded = self.stats();
        ensure!(recorded == actual, CounterMismatchSnafu { recorded, actual });
        Ok(actual)
    }
}

/// Walks the physical block sequence; returns the byte counts and the number
/// of free blocks.
fn check_blocks(arena: &Arena) -> Result<(HeapStats, usize), CorruptionError> {
    let mut stats = HeapStats::default();
    let mut free_blocks = 0;
    let mut prev_free = false;
    let mut offset = 0;

    while offset < arena.len() {
        let block = arena.first().offset_by(offset);
        let addr = arena.base_addr() + offset;
        let header = arena.header(block);
        let size = header.size();
        ensure!(
            size >= MIN_BLOCK_SIZE
                && size.is_multiple_of(MIN_ALIGN)
                && size <= arena.len() - offset,
            InvalidBlockSizeSnafu { addr, size }
        );
        ensure!(header.is_prev_free() == prev_free, PrevFreeMismatchSnafu { addr });

        if header.is_free() {
            ensure!(!prev_free, AdjacentFreeSnafu { addr });
            ensure!(arena.footer_matches(block), FooterMismatchSnafu { addr });
            stats.free += size;
            free_blocks += 1;
        } else {
            stats.allocated += size;
        }

        prev_free = header.is_free();
        offset += size;
    }

    ensure!(
        offset == arena.len(),
        CoverageSnafu {
            covered: offset,
            len: arena.len(),
        }
    );
    Ok((stats, free_blocks))
}

/// Walks every bucket; returns the number of listed blocks.
///
/// `free_blocks` bounds each walk so that a cyclic list is reported instead of
/// looping forever.
fn check_free_lists(
    allocator: &TlsfAllocator,
    arena: &Arena,
    free_blocks: usize,
) -> Result<usize, CorruptionError> {
    let free_lists = allocator.free_lists();
    let mut listed = 0;

    for class in 0..NUM_SIZE_CLASSES {
        let head = free_lists.head(class);
        ensure!(
            free_lists.bitmap().is_set(class) == head.is_some(),
            BitmapMismatchSnafu { class }
        );
        if let Some(head) = head {
            ensure!(
                arena.contains(head) && arena.prev_link(head).is_none(),
                InvalidLinkSnafu {
                    class,
                    offset: head.offset(),
                }
            );
        }

        let mut cursor = head;
        while let Some(block) = cursor {
            let addr = arena.base_addr() + block.offset();
            ensure!(arena.header(block).is_free(), NotFreeSnafu { addr, class });
            let size = arena.size(block);
            ensure!(
                size_class(size) == class,
                WrongBucketSnafu { addr, size, class }
            );

            listed += 1;
            ensure!(
                listed <= free_blocks,
                UnlistedFreeBlockSnafu {
                    listed,
                    free: free_blocks,
                }
            );

            cursor = arena.next_link(block);
            if let Some(next) = cursor {
                ensure!(
                    arena.contains(next),
                    InvalidLinkSnafu {
                        class,
                        offset: next.offset(),
                    }
                );
                ensure!(
                    arena.prev_link(next) == Some(block),
                    BrokenBackLinkSnafu {
                        addr: arena.base_addr() + next.offset(),
                    }
                );
            }
        }
    }

    Ok(listed)
}
