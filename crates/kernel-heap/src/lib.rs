//! Kernel-side glue for the Onix heap allocator.
//!
//! [`KernelHeap`] puts a [`TlsfAllocator`](allocator::TlsfAllocator) behind a
//! spin lock and implements `GlobalAlloc` on top of it. [`HeapLayout`] derives
//! the heap region from the RAM description found at boot, and the [`log`]
//! module routes the heap's diagnostics to the boot console.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[macro_use]
pub mod log;

pub mod error;
mod heap;
mod layout;

pub use self::{error::HeapInitError, heap::KernelHeap, layout::HeapLayout};
