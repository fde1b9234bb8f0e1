use core::{fmt, ops::Range};

use allocator::{InitError, ram_heap_range};

/// Placement of the kernel heap inside RAM.
///
/// ```text
/// ram.start          heap.start                 heap.end          ram.end
/// | kernel image ... | heap                     | reserved (4 MiB) |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLayout {
    pub ram: Range<usize>,
    pub heap: Range<usize>,
    pub reserved: Range<usize>,
}

impl HeapLayout {
    /// Places the heap between the heap symbol (the end of the kernel image)
    /// and the reserved region at the top of RAM.
    pub fn from_ram(ram_base: usize, ram_size: usize, heap_start: usize) -> Result<Self, InitError> {
        let heap = ram_heap_range(ram_base, ram_size, heap_start)?;
        // `ram_heap_range` has checked that the end of RAM does not overflow.
        let ram = ram_base..ram_base + ram_size;
        let reserved = heap.end..ram.end;
        Ok(Self {
            ram,
            heap,
            reserved,
        })
    }

    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap.end - self.heap.start
    }
}

impl fmt::Display for HeapLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            ram,
            heap,
            reserved,
        } = self;
        write!(
            f,
            "RAM {:#x}..{:#x}, heap {:#x}..{:#x} ({} KiB), reserved {:#x}..{:#x}",
            ram.start,
            ram.end,
            heap.start,
            heap.end,
            self.heap_size() / 1024,
            reserved.start,
            reserved.end,
        )
    }
}
