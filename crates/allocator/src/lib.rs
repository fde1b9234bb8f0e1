//! Constant-time heap allocator for the Onix kernel.
//!
//! This crate provides [`TlsfAllocator`], a segregated-fit allocator with
//! boundary tags. It manages one contiguous heap region handed over at boot
//! and serves variable-sized requests from it without any runtime support.
//! The crate is `no_std` compatible and designed to work in bare-metal
//! environments.
//!
//! # Heap Layout
//!
//! The heap is always exactly partitioned into blocks. Every block starts
//! with a one-word header holding its size, a `FREE` flag and a `PREV_FREE`
//! flag. Free blocks additionally carry free-list links and a footer, which
//! lets a freed block find and merge with its free predecessor.
//!
//! Free blocks are linked into one of [`NUM_SIZE_CLASSES`] power-of-two
//! buckets, chosen by [`size_class`], and a bitmap tracks the non-empty
//! buckets.
//!
//! # Usage Examples
//!
//! ```rust
//! use allocator::TlsfAllocator;
//!
//! let mut allocator = TlsfAllocator::new();
//! let mut heap = vec![0u64; 512]; // In kernel, this would be actual heap memory
//! let range = heap.as_mut_ptr_range();
//! unsafe {
//!     allocator.init(range.start.cast(), range.end.cast()).unwrap();
//! }
//!
//! let ptr = allocator.alloc(64, 8).unwrap();
//! let ptr = unsafe { allocator.realloc(Some(ptr), 256) }.unwrap();
//! unsafe {
//!     allocator.free(Some(ptr));
//! }
//!
//! let stats = allocator.check().unwrap();
//! assert_eq!(stats.allocated, 0);
//! assert_eq!(stats.free, 4096);
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Handing memory to the allocator and releasing allocations are `unsafe`.
//! Users must ensure:
//!
//! - The heap region is valid and exclusive to the allocator
//! - Only pointers returned by the same allocator are freed, each once
//! - No allocation is used after it was freed
//!
//! Debug builds check the header behind every freed pointer and panic on
//! double frees and foreign pointers.
//!
//! ## Thread Safety
//!
//! [`TlsfAllocator`] is `Send` but not `Sync`. Wrap it in a lock to use it as
//! a `GlobalAlloc`, as the `kernel-heap` crate does.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod block;
mod check;
mod free_list;
mod size_class;
mod tlsf;

pub use self::{
    block::{FOOTER_SIZE, HEADER_SIZE, MIN_ALIGN, MIN_BLOCK_SIZE},
    check::{BlockInfo, Blocks, CorruptionError},
    size_class::{NUM_SIZE_CLASSES, class_lower_bound, size_class},
    tlsf::{AllocError, HeapStats, InitError, RESERVED_TOP_SIZE, TlsfAllocator, ram_heap_range},
};
