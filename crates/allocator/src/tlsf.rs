//! Segregated-fit allocator with boundary tags.
//!
//! This module provides [`TlsfAllocator`], a single-level member of the TLSF
//! (Two-Level Segregated Fit) family. Free blocks are kept in
//! [`NUM_SIZE_CLASSES`](crate::NUM_SIZE_CLASSES) power-of-two buckets and a
//! bitmap records which buckets are non-empty, so both allocation and
//! deallocation run in constant time.
//!
//! # Algorithm
//!
//! - **Allocation**: rounds the request up to a block size, picks a bucket
//!   through the bitmap, unlinks its head and splits off the unused tail as a
//!   new free block.
//! - **Deallocation**: marks the block free and merges it with a free
//!   successor and a free predecessor. The predecessor is found through the
//!   footer it left right before the freed header, which is only read when
//!   the `PREV_FREE` flag says it exists.
//!
//! After every public operation no two physically adjacent blocks are free.
//!
//! # Thread Safety
//!
//! The allocator is `Send` but not `Sync`. Callers that share it between
//! threads or with interrupt handlers must serialize access themselves.

use core::{ops::Range, ptr::NonNull};

use derive_more::{Display, IsVariant};
use snafu::{OptionExt as _, Snafu, ensure};

use crate::{
    block::{Arena, Block, HEADER_SIZE, MIN_ALIGN, MIN_BLOCK_SIZE},
    check::Blocks,
    free_list::FreeLists,
    size_class::size_class,
};

/// Size of the region at the top of RAM that [`TlsfAllocator::init_from_ram`]
/// leaves out of the heap.
pub const RESERVED_TOP_SIZE: usize = 4 * 1024 * 1024;

/// Errors reported by allocation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant, Snafu)]
pub enum AllocError {
    #[snafu(display("out of memory while allocating {size} bytes"))]
    OutOfMemory { size: usize },
    #[snafu(display("heap is not initialized"))]
    NotInitialized,
    #[snafu(display("zero-sized allocation requested"))]
    InvalidRequest,
    #[snafu(display("alignment {align} is not supported (maximum is {MIN_ALIGN})"))]
    UnsupportedAlignment { align: usize },
}

/// Errors reported while setting up the heap region.
#[derive(Debug, Clone, PartialEq, Eq, IsVariant, Snafu)]
pub enum InitError {
    #[snafu(display("heap is already initialized"))]
    AlreadyInitialized,
    #[snafu(display("invalid heap bounds {start:#x}..{end:#x}"))]
    InvalidBounds { start: usize, end: usize },
    #[snafu(display("heap region {start:#x}..{end:#x} is smaller than one block"))]
    RegionTooSmall { start: usize, end: usize },
    #[snafu(display(
        "RAM of {ram_size:#x} bytes cannot hold the reserved region of {RESERVED_TOP_SIZE:#x} bytes"
    ))]
    RamTooSmall { ram_size: usize },
    #[snafu(display("heap start {heap_start:#x} lies outside usable RAM {ram:#x?}"))]
    HeapSymbolOutOfRange {
        heap_start: usize,
        ram: Range<usize>,
    },
}

/// Byte counters kept by the allocator.
///
/// Both counters include block headers and padding; together they always add
/// up to the heap size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[display("{allocated} bytes allocated, {free} bytes free")]
pub struct HeapStats {
    /// Bytes held by allocated blocks.
    pub allocated: usize,
    /// Bytes held by free blocks.
    pub free: usize,
}

/// Computes the heap range left after reserving the top of RAM.
///
/// The heap runs from `heap_start` (usually the end of the kernel image) up to
/// [`RESERVED_TOP_SIZE`] bytes below the end of RAM.
pub fn ram_heap_range(
    ram_base: usize,
    ram_size: usize,
    heap_start: usize,
) -> Result<Range<usize>, InitError> {
    let ram_end = ram_base
        .checked_add(ram_size)
        .context(InvalidBoundsSnafu {
            start: ram_base,
            end: usize::MAX,
        })?;
    ensure!(ram_size >= RESERVED_TOP_SIZE, RamTooSmallSnafu { ram_size });
    let heap_end = ram_end - RESERVED_TOP_SIZE;
    ensure!(
        ram_base <= heap_start && heap_start < heap_end,
        HeapSymbolOutOfRangeSnafu {
            heap_start,
            ram: ram_base..heap_end,
        }
    );
    Ok(heap_start..heap_end)
}

/// Block size needed to serve a `size`-byte payload, or `None` on overflow.
fn block_size_for(size: usize) -> Option<usize> {
    let needed = size
        .max(2 * size_of::<usize>())
        .checked_add(HEADER_SIZE)?
        .checked_next_multiple_of(MIN_ALIGN)?;
    Some(needed.max(MIN_BLOCK_SIZE))
}

/// A constant-time segregated-fit heap allocator.
///
/// Create it with [`new`](Self::new), hand it a region with
/// [`init`](Self::init), then serve requests with [`alloc`](Self::alloc),
/// [`free`](Self::free) and [`realloc`](Self::realloc).
#[derive(Debug)]
pub struct TlsfAllocator {
    arena: Option<Arena>,
    free_lists: FreeLists,
    allocated: usize,
    free: usize,
}

unsafe impl Send for TlsfAllocator {}

impl Default for TlsfAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsfAllocator {
    /// Creates an allocator that owns no memory yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arena: None,
            free_lists: FreeLists::new(),
            allocated: 0,
            free: 0,
        }
    }

    /// Hands the region `heap_start..heap_end` to the allocator.
    ///
    /// Both bounds are shrunk to [`MIN_ALIGN`] boundaries and the whole region
    /// becomes one free block.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The range `heap_start..heap_end` is valid for reads and writes
    /// - The memory region is not used by any other allocator or code
    /// - The memory region stays valid for the lifetime of this allocator
    pub unsafe fn init(&mut self, heap_start: *mut u8, heap_end: *mut u8) -> Result<(), InitError> {
        ensure!(self.arena.is_none(), AlreadyInitializedSnafu);

        let start = heap_start.addr();
        let end = heap_end.addr();
        ensure!(start <= end, InvalidBoundsSnafu { start, end });

        let aligned_start = start
            .checked_next_multiple_of(MIN_ALIGN)
            .context(RegionTooSmallSnafu { start, end })?;
        let aligned_end = end / MIN_ALIGN * MIN_ALIGN;
        let len = aligned_end.saturating_sub(aligned_start);
        ensure!(len >= MIN_BLOCK_SIZE, RegionTooSmallSnafu { start, end });

        let base = NonNull::new(heap_start.with_addr(aligned_start))
            .context(InvalidBoundsSnafu { start, end })?;
        let mut arena = unsafe { Arena::new(base, len) };
        let block = arena.first();
        arena.init_free_block(block, len, false);
        self.free_lists.insert(&mut arena, block);

        self.allocated = 0;
        self.free = len;
        self.arena = Some(arena);
        Ok(())
    }

    /// Initializes the heap from a RAM description.
    ///
    /// The heap starts at `heap_start` and ends [`RESERVED_TOP_SIZE`] bytes
    /// below `ram_base + ram_size`; see [`ram_heap_range`].
    ///
    /// # Safety
    ///
    /// Same as [`init`](Self::init), for the computed heap range.
    pub unsafe fn init_from_ram(
        &mut self,
        ram_base: usize,
        ram_size: usize,
        heap_start: *mut u8,
    ) -> Result<(), InitError> {
        let heap = ram_heap_range(ram_base, ram_size, heap_start.addr())?;
        unsafe { self.init(heap_start, heap_start.with_addr(heap.end)) }
    }

    /// Returns `true` once [`init`](Self::init) has succeeded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.arena.is_some()
    }

    /// Returns the aligned heap address range, if initialized.
    #[must_use]
    pub fn bounds(&self) -> Option<Range<usize>> {
        self.arena.as_ref().map(|arena| {
            let start = arena.base_addr();
            start..start + arena.len()
        })
    }

    /// Returns the allocated and free byte counters.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocated: self.allocated,
            free: self.free,
        }
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Returns `None` if the request cannot be served; see
    /// [`try_alloc`](Self::try_alloc) for the reason.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.try_alloc(size, align).ok()
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Alignments below [`MIN_ALIGN`] are raised to it; larger alignments
    /// are rejected. The returned memory has at least `size` usable bytes and
    /// stays valid until it is passed to [`free`](Self::free) or
    /// [`realloc`](Self::realloc).
    pub fn try_alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let block = self.allocate_block(size, align)?;
        let arena = self.arena.as_ref().context(NotInitializedSnafu)?;
        Ok(arena.payload(block))
    }

    /// Allocates `size` zeroed bytes aligned to `align`.
    pub fn alloc_zeroed(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let block = self.allocate_block(size, align).ok()?;
        let arena = self.arena.as_mut()?;
        arena.zero_payload(block, size);
        Some(arena.payload(block))
    }

    /// Releases an allocation.
    ///
    /// `None` and calls on an uninitialized allocator do nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and must not have
    /// been freed since.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        let Some(arena) = self.arena.as_mut() else {
            return;
        };

        let block = unsafe { arena.from_payload(ptr) };
        let size = arena.size(block);
        self.allocated -= size;
        self.free += size;

        arena.set_free(block, true);
        let block = coalesce(&mut self.free_lists, arena, block);
        self.free_lists.insert(arena, block);
    }

    /// Resizes an allocation.
    ///
    /// Returns `None` if the request fails (the original allocation is left
    /// untouched) or if `new_size` is zero (the allocation is freed).
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free).
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        unsafe { self.try_realloc(ptr, new_size) }.ok().flatten()
    }

    /// Resizes an allocation.
    ///
    /// - `ptr == None` behaves like [`try_alloc`](Self::try_alloc).
    /// - `new_size == 0` frees `ptr` and returns `Ok(None)`.
    /// - If `new_size` fits in the current block, `ptr` is returned as is.
    ///   The block is never shrunk.
    /// - Otherwise the contents move to a new block and the old one is freed.
    ///   On failure the old block is kept.
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free).
    pub unsafe fn try_realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.try_alloc(new_size, MIN_ALIGN).map(Some);
        };
        if new_size == 0 {
            unsafe { self.free(Some(ptr)) };
            return Ok(None);
        }

        let arena = self.arena.as_ref().context(NotInitializedSnafu)?;
        let old_block = unsafe { arena.from_payload(ptr) };
        let capacity = arena.payload_capacity(old_block);
        if new_size <= capacity {
            return Ok(Some(ptr));
        }

        let new_block = self.allocate_block(new_size, MIN_ALIGN)?;
        let arena = self.arena.as_mut().context(NotInitializedSnafu)?;
        arena.copy_payload(old_block, new_block, capacity.min(new_size));
        let new_ptr = arena.payload(new_block);
        unsafe { self.free(Some(ptr)) };
        Ok(Some(new_ptr))
    }

    /// Returns the number of bytes usable through `ptr`.
    ///
    /// This can be larger than the size that was requested.
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free).
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let Some(arena) = self.arena.as_ref() else {
            return 0;
        };
        let block = unsafe { arena.from_payload(ptr) };
        arena.payload_capacity(block)
    }

    /// Iterates over every block of the heap in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.arena.as_ref())
    }

    pub(crate) fn arena(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    pub(crate) fn free_lists(&self) -> &FreeLists {
        &self.free_lists
    }

    fn allocate_block(&mut self, size: usize, align: usize) -> Result<Block, AllocError> {
        let arena = self.arena.as_mut().context(NotInitializedSnafu)?;
        ensure!(size > 0, InvalidRequestSnafu);
        ensure!(align <= MIN_ALIGN, UnsupportedAlignmentSnafu { align });

        let needed = block_size_for(size).context(OutOfMemorySnafu { size })?;
        let block =
            find_free_block(&self.free_lists, arena, needed).context(OutOfMemorySnafu { size })?;

        self.free_lists.remove(arena, block);
        split(&mut self.free_lists, arena, block, needed);
        arena.set_free(block, false);
        if let Some(next) = arena.next(block) {
            arena.set_prev_free(next, false);
        }

        let size = arena.size(block);
        self.allocated += size;
        self.free -= size;
        Ok(block)
    }
}

/// Finds a free block of at least `needed` bytes.
///
/// A bucket covers a whole power-of-two range, so the bucket `needed` maps to
/// may only hold smaller blocks. Its head is taken only if it is large enough;
/// otherwise the search continues in the next non-empty bucket, where every
/// block is larger than `needed`. Only when no such bucket exists is the
/// bucket itself searched block by block, which also covers the last bucket.
fn find_free_block(free_lists: &FreeLists, arena: &Arena, needed: usize) -> Option<Block> {
    let class = size_class(needed);
    if let Some(head) = free_lists
        .head(class)
        .filter(|&head| arena.size(head) >= needed)
    {
        return Some(head);
    }

    if let Some(larger) = free_lists.bitmap().lowest_set_from(class + 1) {
        return free_lists.head(larger);
    }

    free_lists
        .iter(arena, class)
        .find(|&block| arena.size(block) >= needed)
}

/// Shrinks `block` to `needed` bytes and frees the remainder.
///
/// Remainders smaller than [`MIN_BLOCK_SIZE`] stay inside `block`.
fn split(free_lists: &mut FreeLists, arena: &mut Arena, block: Block, needed: usize) {
    let remainder = arena.size(block) - needed;
    if remainder < MIN_BLOCK_SIZE {
        return;
    }

    arena.set_size(block, needed);
    let rest = block.offset_by(needed);
    arena.init_free_block(rest, remainder, false);
    free_lists.insert(arena, rest);
    if let Some(next) = arena.next(rest) {
        arena.set_prev_free(next, true);
    }
}

/// Merges a just-freed block with its free neighbours.
///
/// Returns the merged block, which starts at the predecessor if that one was
/// free. The result is not linked into any bucket.
fn coalesce(free_lists: &mut FreeLists, arena: &mut Arena, block: Block) -> Block {
    let mut block = block;

    if let Some(next) = arena.next(block).filter(|&next| arena.is_free(next)) {
        free_lists.remove(arena, next);
        let merged = arena.size(block) + arena.size(next);
        arena.set_size(block, merged);
    }

    if arena.is_prev_free(block) {
        let prev = arena.prev(block);
        free_lists.remove(arena, prev);
        let merged = arena.size(prev) + arena.size(block);
        arena.set_size(prev, merged);
        block = prev;
    }

    arena.write_footer(block);
    if let Some(next) = arena.next(block) {
        arena.set_prev_free(next, true);
    }
    block
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::alloc::Layout;

    use super::*;
    use crate::check::BlockInfo;

    const PATTERN: u8 = 0x33;
    const POISON: u8 = 0x55;

    struct TestAllocator {
        allocator: TlsfAllocator,
        live: Vec<(NonNull<u8>, usize)>,
    }

    impl TestAllocator {
        fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
            let ptr = self.allocator.alloc(size, 8)?;
            unsafe {
                ptr.write_bytes(PATTERN, size);
            }
            self.live.push((ptr, size));
            self.allocator.check().unwrap();
            Some(ptr)
        }

        unsafe fn free(&mut self, ptr: NonNull<u8>) {
            let index = self.live.iter().position(|&(p, _)| p == ptr).unwrap();
            let (_, size) = self.live.swap_remove(index);
            unsafe {
                for i in 0..size {
                    assert_eq!(ptr.add(i).read(), PATTERN);
                }
                ptr.write_bytes(POISON, size);
                self.allocator.free(Some(ptr));
            }
            self.allocator.check().unwrap();
        }

        fn stats(&self) -> HeapStats {
            self.allocator.stats()
        }

        fn blocks(&self) -> Vec<BlockInfo> {
            self.allocator.blocks().collect()
        }
    }

    fn with_test_heap<F>(heap_size: usize, test_fn: F)
    where
        F: FnOnce(*mut u8, *mut u8),
    {
        unsafe {
            let layout = Layout::from_size_align(heap_size, 16).unwrap();
            let heap_start = std::alloc::alloc(layout);
            heap_start.write_bytes(0x11, heap_size);
            test_fn(heap_start, heap_start.add(heap_size));
            std::alloc::dealloc(heap_start, layout);
        }
    }

    fn with_test_allocator<F>(heap_size: usize, test_fn: F)
    where
        F: FnOnce(&mut TestAllocator),
    {
        with_test_heap(heap_size, |heap_start, heap_end| unsafe {
            let mut allocator = TlsfAllocator::new();
            allocator.init(heap_start, heap_end).unwrap();
            allocator.check().unwrap();
            test_fn(&mut TestAllocator {
                allocator,
                live: Vec::new(),
            });
        });
    }

    /// Deterministic xorshift sequence for shuffling test operations.
    struct XorShift(u64);

    impl XorShift {
        fn next_u64(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, bound: usize) -> usize {
            usize::try_from(self.next_u64() % bound as u64).unwrap()
        }
    }

    #[test]
    fn test_init_whole_region_is_free() {
        with_test_allocator(4096, |allocator| {
            assert_eq!(
                allocator.stats(),
                HeapStats {
                    allocated: 0,
                    free: 4096
                }
            );
            let blocks = allocator.blocks();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].size, 4096);
            assert!(blocks[0].is_free);
        });
    }

    #[test]
    fn test_init_aligns_bounds() {
        with_test_heap(4096, |heap_start, heap_end| unsafe {
            let mut allocator = TlsfAllocator::new();
            allocator
                .init(heap_start.add(3), heap_end.sub(5))
                .unwrap();
            let bounds = allocator.bounds().unwrap();
            assert_eq!(bounds.start, heap_start.addr() + 8);
            assert_eq!(bounds.end, heap_end.addr() - 8);
            assert_eq!(allocator.stats().free, 4096 - 16);
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_init_twice_fails() {
        with_test_heap(4096, |heap_start, heap_end| unsafe {
            let mut allocator = TlsfAllocator::new();
            allocator.init(heap_start, heap_end).unwrap();
            let err = allocator.init(heap_start, heap_end).unwrap_err();
            assert_eq!(err, InitError::AlreadyInitialized);
            assert_eq!(allocator.stats().free, 4096);
        });
    }

    #[test]
    fn test_init_rejects_bad_regions() {
        with_test_heap(4096, |heap_start, heap_end| unsafe {
            let mut allocator = TlsfAllocator::new();
            assert!(allocator.init(heap_end, heap_start).unwrap_err().is_invalid_bounds());
            assert!(
                allocator
                    .init(heap_start, heap_start.add(24))
                    .unwrap_err()
                    .is_region_too_small()
            );
            assert!(
                allocator
                    .init(heap_start.add(1), heap_start.add(32))
                    .unwrap_err()
                    .is_region_too_small()
            );
            assert!(!allocator.is_initialized());
            assert_eq!(allocator.bounds(), None);
        });
    }

    #[test]
    fn test_init_minimum_region() {
        with_test_heap(4096, |heap_start, _heap_end| unsafe {
            let mut allocator = TlsfAllocator::new();
            allocator.init(heap_start, heap_start.add(32)).unwrap();
            let ptr = allocator.alloc(8, 8).unwrap();
            assert_eq!(allocator.stats().allocated, 32);
            assert!(allocator.alloc(8, 8).is_none());
            allocator.free(Some(ptr));
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_ram_heap_range() {
        let mib = 1024 * 1024;
        let range = ram_heap_range(0x4000_0000, 64 * mib, 0x4010_0000).unwrap();
        assert_eq!(range, 0x4010_0000..0x4000_0000 + 60 * mib);

        assert!(ram_heap_range(0x4000_0000, 2 * mib, 0x4000_1000)
            .unwrap_err()
            .is_ram_too_small());
        assert!(ram_heap_range(0x4000_0000, 8 * mib, 0x3fff_0000)
            .unwrap_err()
            .is_heap_symbol_out_of_range());
        assert!(ram_heap_range(0x4000_0000, 8 * mib, 0x4000_0000 + 4 * mib)
            .unwrap_err()
            .is_heap_symbol_out_of_range());
        assert!(ram_heap_range(usize::MAX - 16, 8 * mib, usize::MAX - 8)
            .unwrap_err()
            .is_invalid_bounds());
    }

    #[test]
    fn test_init_from_ram() {
        let ram_size = RESERVED_TOP_SIZE + 64 * 1024;
        with_test_heap(ram_size, |ram_start, _ram_end| unsafe {
            let mut allocator = TlsfAllocator::new();
            let heap_start = ram_start.add(4096);
            allocator
                .init_from_ram(ram_start.addr(), ram_size, heap_start)
                .unwrap();
            assert_eq!(
                allocator.bounds(),
                Some(heap_start.addr()..ram_start.addr() + 64 * 1024)
            );
            assert_eq!(allocator.stats().free, 60 * 1024);

            let ptr = allocator.alloc(1024, 8).unwrap();
            assert!(ptr.as_ptr().addr() < ram_start.addr() + 64 * 1024);
            allocator.free(Some(ptr));
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_uninitialized_allocator() {
        let mut allocator = TlsfAllocator::new();
        assert!(!allocator.is_initialized());
        assert_eq!(allocator.alloc(64, 8), None);
        assert_eq!(allocator.try_alloc(64, 8), Err(AllocError::NotInitialized));
        assert_eq!(allocator.stats(), HeapStats::default());
        assert_eq!(allocator.bounds(), None);
        assert_eq!(allocator.blocks().count(), 0);
        unsafe {
            allocator.free(Some(NonNull::dangling()));
            assert_eq!(allocator.realloc(None, 16), None);
        }
        assert_eq!(allocator.stats(), HeapStats::default());
    }

    #[test]
    fn test_basic_allocation() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr = allocator.alloc(64).unwrap();
            let stats = allocator.stats();
            assert!(stats.allocated >= 64 + HEADER_SIZE);
            assert!(stats.allocated < 4096);
            assert_eq!(stats.allocated + stats.free, 4096);

            allocator.free(ptr);
        });
    }

    #[test]
    fn test_invalid_requests() {
        with_test_allocator(4096, |allocator| {
            let allocator = &mut allocator.allocator;
            assert_eq!(allocator.try_alloc(0, 8), Err(AllocError::InvalidRequest));
            assert_eq!(
                allocator.try_alloc(64, 16),
                Err(AllocError::UnsupportedAlignment { align: 16 })
            );
            assert_eq!(allocator.stats().allocated, 0);
        });
    }

    #[test]
    fn test_small_alignment_is_raised() {
        with_test_allocator(4096, |allocator| unsafe {
            let allocator = &mut allocator.allocator;
            let ptr1 = allocator.alloc(3, 1).unwrap();
            let ptr2 = allocator.alloc(5, 2).unwrap();
            assert!(ptr1.as_ptr().addr().is_multiple_of(MIN_ALIGN));
            assert!(ptr2.as_ptr().addr().is_multiple_of(MIN_ALIGN));
            allocator.free(Some(ptr1));
            allocator.free(Some(ptr2));
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_multiple_allocations() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr1 = allocator.alloc(64).unwrap();
            let ptr2 = allocator.alloc(64).unwrap();
            let ptr3 = allocator.alloc(64).unwrap();

            assert_ne!(ptr1, ptr2);
            assert_ne!(ptr2, ptr3);
            assert_ne!(ptr1, ptr3);
            assert!(ptr1 < ptr2 && ptr2 < ptr3);

            allocator.free(ptr1);
            allocator.free(ptr2);
            allocator.free(ptr3);
            assert_eq!(allocator.blocks().len(), 1);
        });
    }

    #[test]
    fn test_forward_coalescing() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr1 = allocator.alloc(64).unwrap();
            let ptr2 = allocator.alloc(64).unwrap();
            let _ptr3 = allocator.alloc(64).unwrap();

            allocator.free(ptr2);
            allocator.free(ptr1);

            let blocks = allocator.blocks();
            assert!(blocks[0].is_free);
            assert!(blocks[0].size >= 128 + HEADER_SIZE);
            assert_eq!(blocks[0].payload_addr(), ptr1.as_ptr().addr());
            assert!(!blocks[1].is_free);
        });
    }

    #[test]
    fn test_backward_coalescing() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr1 = allocator.alloc(64).unwrap();
            let ptr2 = allocator.alloc(64).unwrap();
            let _ptr3 = allocator.alloc(64).unwrap();

            allocator.free(ptr1);
            allocator.free(ptr2);

            let blocks = allocator.blocks();
            assert!(blocks[0].is_free);
            assert!(blocks[0].size >= 128 + HEADER_SIZE);
            assert_eq!(blocks[0].payload_addr(), ptr1.as_ptr().addr());
            assert!(!blocks[1].is_free);
            assert!(blocks[1].prev_free);
        });
    }

    #[test]
    fn test_coalescing_both_sides() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr1 = allocator.alloc(64).unwrap();
            let ptr2 = allocator.alloc(64).unwrap();
            let ptr3 = allocator.alloc(64).unwrap();
            let guard = allocator.alloc(64).unwrap();

            allocator.free(ptr1);
            allocator.free(ptr3);
            assert_eq!(allocator.blocks().iter().filter(|b| b.is_free).count(), 3);

            allocator.free(ptr2);
            let blocks = allocator.blocks();
            assert_eq!(blocks.len(), 3);
            assert!(blocks[0].is_free);
            assert_eq!(blocks[0].size, 3 * 72);
            assert!(!blocks[1].is_free);

            allocator.free(guard);
            assert_eq!(allocator.blocks().len(), 1);
        });
    }

    #[test]
    fn test_round_trip_restores_stats() {
        with_test_allocator(4096, |allocator| unsafe {
            let keep = allocator.alloc(100).unwrap();
            let before = allocator.stats();
            let blocks_before = allocator.blocks();

            let ptr = allocator.alloc(200).unwrap();
            assert_ne!(allocator.stats(), before);
            allocator.free(ptr);

            assert_eq!(allocator.stats(), before);
            assert_eq!(allocator.blocks(), blocks_before);
            allocator.free(keep);
        });
    }

    #[test]
    fn test_free_none_is_noop() {
        with_test_allocator(4096, |allocator| unsafe {
            let _ptr = allocator.alloc(64).unwrap();
            let before = allocator.stats();
            allocator.allocator.free(None);
            assert_eq!(allocator.stats(), before);
            allocator.allocator.check().unwrap();
        });
    }

    #[test]
    fn test_out_of_memory() {
        with_test_allocator(4096, |allocator| {
            let before = allocator.stats();
            assert!(allocator.alloc(4096).is_none());
            assert_eq!(
                allocator.allocator.try_alloc(8192, 8),
                Err(AllocError::OutOfMemory { size: 8192 })
            );
            assert_eq!(
                allocator.allocator.try_alloc(usize::MAX, 8),
                Err(AllocError::OutOfMemory { size: usize::MAX })
            );
            assert_eq!(allocator.stats(), before);
        });
    }

    #[test]
    fn test_allocate_entire_heap() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr = allocator.alloc(4096 - HEADER_SIZE).unwrap();
            assert_eq!(allocator.stats().free, 0);
            assert!(allocator.alloc(8).is_none());

            allocator.free(ptr);
            let ptr = allocator.alloc(4096 - HEADER_SIZE).unwrap();
            allocator.free(ptr);
        });
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        with_test_allocator(4096, |allocator| unsafe {
            // leaves a 24-byte tail, which cannot form a block
            let ptr = allocator.alloc(4096 - HEADER_SIZE - 24).unwrap();
            assert_eq!(allocator.stats().allocated, 4096);
            assert_eq!(allocator.allocator.usable_size(ptr), 4096 - HEADER_SIZE);
            allocator.free(ptr);
        });
    }

    #[test]
    fn test_undersized_bucket_head_is_skipped() {
        with_test_allocator(4096, |allocator| unsafe {
            // a 72-byte free block in the [64, 128) bucket, fenced by an allocation
            let small = allocator.alloc(64).unwrap();
            let _fence = allocator.alloc(8).unwrap();
            allocator.free(small);

            // needs a 112-byte block, which maps to the same bucket
            let ptr = allocator.alloc(100).unwrap();
            assert_ne!(ptr, small);
            assert!(allocator.allocator.usable_size(ptr) >= 100);
            assert!(allocator.blocks()[0].is_free);
            assert_eq!(allocator.blocks()[0].size, 72);

            // a request that fits takes the bucket head
            let reuse = allocator.alloc(56).unwrap();
            assert_eq!(reuse, small);
        });
    }

    #[test]
    fn test_fitting_block_behind_bucket_head_is_found() {
        with_test_allocator(4096, |allocator| unsafe {
            let small = allocator.alloc(64).unwrap();
            let _fence1 = allocator.alloc(8).unwrap();
            let large = allocator.alloc(112).unwrap();
            let _fence2 = allocator.alloc(8).unwrap();
            let _rest = allocator.alloc(4096 - 72 - 32 - 120 - 32 - 8).unwrap();
            assert_eq!(allocator.stats().free, 0);

            // bucket [64, 128) now holds 72 (head) and 120; no larger bucket is set
            allocator.free(large);
            allocator.free(small);

            let ptr = allocator.alloc(100).unwrap();
            assert_eq!(ptr, large);
        });
    }

    #[test]
    fn test_realloc_shrink_keeps_pointer() {
        with_test_allocator(4096, |allocator| unsafe {
            let allocator = &mut allocator.allocator;
            let ptr = allocator.alloc(256, 8).unwrap();
            let stats = allocator.stats();
            assert_eq!(allocator.realloc(Some(ptr), 16), Some(ptr));
            assert_eq!(allocator.stats(), stats);
            // growing back within the block keeps it too
            assert_eq!(allocator.realloc(Some(ptr), 256), Some(ptr));
            allocator.free(Some(ptr));
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_realloc_grow_moves_contents() {
        with_test_allocator(4096, |allocator| unsafe {
            let allocator = &mut allocator.allocator;
            let ptr = allocator.alloc(64, 8).unwrap();
            let _fence = allocator.alloc(8, 8).unwrap();
            for i in 0..64 {
                ptr.add(i).write(u8::try_from(i).unwrap());
            }

            let moved = allocator.realloc(Some(ptr), 512).unwrap();
            assert_ne!(moved, ptr);
            for i in 0..64 {
                assert_eq!(moved.add(i).read(), u8::try_from(i).unwrap());
            }
            assert!(allocator.usable_size(moved) >= 512);
            assert!(allocator.blocks().next().unwrap().is_free);

            allocator.free(Some(moved));
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_realloc_null_and_zero() {
        with_test_allocator(4096, |allocator| unsafe {
            let allocator = &mut allocator.allocator;
            let ptr = allocator.realloc(None, 32).unwrap();
            assert!(allocator.stats().allocated > 0);

            assert_eq!(allocator.try_realloc(Some(ptr), 0), Ok(None));
            assert_eq!(allocator.stats().allocated, 0);
            assert_eq!(allocator.realloc(None, 0), None);
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_realloc_failure_keeps_original() {
        with_test_allocator(1024, |allocator| unsafe {
            let allocator = &mut allocator.allocator;
            let ptr = allocator.alloc(64, 8).unwrap();
            ptr.write_bytes(0x42, 64);
            let stats = allocator.stats();

            assert_eq!(
                allocator.try_realloc(Some(ptr), 2048),
                Err(AllocError::OutOfMemory { size: 2048 })
            );
            assert_eq!(allocator.stats(), stats);
            for i in 0..64 {
                assert_eq!(ptr.add(i).read(), 0x42);
            }
            allocator.free(Some(ptr));
            allocator.check().unwrap();
        });
    }

    #[test]
    fn test_alloc_zeroed() {
        with_test_allocator(4096, |allocator| unsafe {
            let allocator = &mut allocator.allocator;
            let ptr = allocator.alloc(128, 8).unwrap();
            ptr.write_bytes(0xff, 128);
            allocator.free(Some(ptr));

            let zeroed = allocator.alloc_zeroed(128, 8).unwrap();
            assert_eq!(zeroed, ptr);
            for i in 0..128 {
                assert_eq!(zeroed.add(i).read(), 0);
            }
            allocator.free(Some(zeroed));
            assert_eq!(allocator.alloc_zeroed(0, 8), None);
        });
    }

    #[test]
    fn test_exhaust_and_release_in_any_order() {
        with_test_allocator(4096, |allocator| unsafe {
            let mut ptrs = Vec::new();
            while let Some(ptr) = allocator.alloc(24) {
                ptrs.push(ptr);
            }
            assert_eq!(ptrs.len(), 4096 / 32);
            assert_eq!(allocator.stats().free, 0);

            let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
            while !ptrs.is_empty() {
                let ptr = ptrs.swap_remove(rng.below(ptrs.len()));
                allocator.free(ptr);
            }

            let blocks = allocator.blocks();
            assert_eq!(blocks.len(), 1);
            assert!(blocks[0].is_free);
            assert_eq!(blocks[0].size, 4096);
            assert_eq!(
                allocator.stats(),
                HeapStats {
                    allocated: 0,
                    free: 4096
                }
            );
        });
    }

    #[test]
    fn test_mixed_sizes_until_exhaustion() {
        with_test_allocator(16384, |allocator| unsafe {
            let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
            loop {
                let size = 1 + rng.below(300);
                if allocator.alloc(size).is_none() && allocator.alloc(1).is_none() {
                    break;
                }
            }
            assert_eq!(allocator.stats().free, 0);
            let ptrs = allocator.live.iter().map(|&(p, _)| p).collect::<Vec<_>>();
            for ptr in ptrs {
                allocator.free(ptr);
            }
            assert_eq!(allocator.blocks().len(), 1);
            assert_eq!(allocator.stats().free, 16384);
        });
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        with_test_allocator(32768, |allocator| unsafe {
            let mut rng = XorShift(0xdead_beef_cafe_f00d);
            for _ in 0..2000 {
                match rng.below(3) {
                    0 | 1 => {
                        let size = 1 + rng.below(1500);
                        let _ = allocator.alloc(size);
                    }
                    _ if !allocator.live.is_empty() => {
                        let (ptr, _) = allocator.live[rng.below(allocator.live.len())];
                        allocator.free(ptr);
                    }
                    _ => {}
                }
            }
            while let Some(&(ptr, _)) = allocator.live.last() {
                allocator.free(ptr);
            }
            assert_eq!(allocator.blocks().len(), 1);
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "does not belong to this heap")]
    fn test_free_foreign_pointer_panics() {
        with_test_allocator(4096, |allocator| unsafe {
            let _ptr = allocator.alloc(64).unwrap();
            let mut foreign = [0_u64; 8];
            let ptr = NonNull::from(&mut foreign[4]).cast::<u8>();
            allocator.allocator.free(Some(ptr));
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "corrupted footer")]
    fn test_free_after_clobbered_footer_panics() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr1 = allocator.allocator.alloc(64, 8).unwrap();
            let ptr2 = allocator.allocator.alloc(64, 8).unwrap();
            let _fence = allocator.allocator.alloc(64, 8).unwrap();
            allocator.allocator.free(Some(ptr1));
            // footer of the freed block sits right below the header of ptr2
            ptr2.as_ptr().sub(HEADER_SIZE + 8).cast::<usize>().write(0);
            allocator.allocator.free(Some(ptr2));
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        with_test_allocator(4096, |allocator| unsafe {
            let ptr = allocator.allocator.alloc(64, 8).unwrap();
            let _fence = allocator.allocator.alloc(64, 8).unwrap();
            allocator.allocator.free(Some(ptr));
            allocator.allocator.free(Some(ptr));
        });
    }
}
