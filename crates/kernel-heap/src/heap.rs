use core::{
    alloc::{GlobalAlloc, Layout},
    ops::Range,
    ptr::{self, NonNull},
};

use allocator::{CorruptionError, HeapStats, TlsfAllocator};
use snafu::ResultExt as _;
use spin::Mutex;

use crate::{
    error::{self, AllocatorSnafu, HeapInitError, LayoutSnafu},
    layout::HeapLayout,
};

/// The kernel heap, shareable between CPUs.
///
/// Wraps a [`TlsfAllocator`] in a spin lock so it can serve as the
/// `#[global_allocator]`:
///
/// ```rust,ignore
/// #[global_allocator]
/// static HEAP: KernelHeap = KernelHeap::new();
/// ```
///
/// The lock does not mask interrupts. Interrupt handlers that allocate must
/// be kept from preempting a CPU that holds it.
pub struct KernelHeap {
    allocator: Mutex<TlsfAllocator>,
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocator: Mutex::new(TlsfAllocator::new()),
        }
    }

    /// Hands the region `heap_start..heap_end` to the heap.
    ///
    /// # Safety
    ///
    /// See [`TlsfAllocator::init`].
    pub unsafe fn init(&self, heap_start: *mut u8, heap_end: *mut u8) -> Result<(), HeapInitError> {
        unsafe { self.allocator.lock().init(heap_start, heap_end) }.context(AllocatorSnafu)?;
        if let Some(bounds) = self.bounds() {
            info!("kernel heap: {:#x}..{:#x}", bounds.start, bounds.end);
        }
        debug!("kernel heap: {}", self.stats());
        Ok(())
    }

    /// Places the heap between `heap_symbol` and the reserved top of RAM and
    /// initializes it.
    ///
    /// # Safety
    ///
    /// See [`TlsfAllocator::init`]. The whole computed heap range must be
    /// usable RAM.
    pub unsafe fn init_from_ram(
        &self,
        ram_base: usize,
        ram_size: usize,
        heap_symbol: *mut u8,
    ) -> Result<HeapLayout, HeapInitError> {
        let layout =
            HeapLayout::from_ram(ram_base, ram_size, heap_symbol.addr()).context(LayoutSnafu)?;
        info!("{layout}");
        unsafe { self.init(heap_symbol, heap_symbol.with_addr(layout.heap.end)) }?;
        Ok(layout)
    }

    /// Same as [`init_from_ram`](Self::init_from_ram), for boot code that
    /// cannot continue without a heap.
    ///
    /// # Panics
    ///
    /// Panics with an error report if the heap cannot be initialized.
    ///
    /// # Safety
    ///
    /// See [`init_from_ram`](Self::init_from_ram).
    #[track_caller]
    pub unsafe fn init_from_ram_or_halt(
        &self,
        ram_base: usize,
        ram_size: usize,
        heap_symbol: *mut u8,
    ) -> HeapLayout {
        match unsafe { self.init_from_ram(ram_base, ram_size, heap_symbol) } {
            Ok(layout) => layout,
            Err(err) => {
                error!("failed to initialize kernel heap: {err}");
                error::report(err)
            }
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.allocator.lock().is_initialized()
    }

    #[must_use]
    pub fn bounds(&self) -> Option<Range<usize>> {
        self.allocator.lock().bounds()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.allocator.lock().stats()
    }

    /// Runs the heap consistency check, logging any corruption found.
    pub fn check(&self) -> Result<HeapStats, CorruptionError> {
        let result = self.allocator.lock().check();
        if let Err(err) = &result {
            error!("kernel heap corrupted: {err}");
        }
        result
    }

    /// Runs `f` with exclusive access to the allocator.
    pub fn with_allocator<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut TlsfAllocator) -> T,
    {
        f(&mut self.allocator.lock())
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = self
            .allocator
            .lock()
            .try_alloc(layout.size(), layout.align());
        match result {
            Ok(ptr) => {
                trace!("kernel heap: allocated {layout:?} at {ptr:p}");
                ptr.as_ptr()
            }
            Err(err) => {
                warn!("kernel heap: cannot allocate {layout:?}: {err}");
                ptr::null_mut()
            }
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self
            .allocator
            .lock()
            .alloc_zeroed(layout.size(), layout.align());
        if ptr.is_none() {
            warn!("kernel heap: cannot allocate zeroed {layout:?}");
        }
        ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.allocator.lock().free(NonNull::new(ptr)) };
        trace!("kernel heap: freed {layout:?} at {ptr:p}");
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let result = unsafe {
            self.allocator
                .lock()
                .try_realloc(NonNull::new(ptr), new_size)
        };
        match result {
            Ok(ptr) => ptr.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(err) => {
                warn!(
                    "kernel heap: cannot grow {layout:?} to {new_size} bytes: {err}"
                );
                ptr::null_mut()
            }
        }
    }
}
