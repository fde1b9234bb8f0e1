//! Power-of-two size classes and the bitmap of non-empty classes.
//!
//! Size class `k` holds free blocks whose size lies in `[2^(k+5), 2^(k+6))`.
//! Class 0 starts at [`MIN_BLOCK_SIZE`] and the last class also takes every
//! block above its lower bound.

use crate::block::MIN_BLOCK_SIZE;

/// Number of segregated free lists.
pub const NUM_SIZE_CLASSES: usize = 26;

const MIN_CLASS_SHIFT: u32 = MIN_BLOCK_SIZE.trailing_zeros();
const _: () = assert!(1 << MIN_CLASS_SHIFT == MIN_BLOCK_SIZE);
const _: () = assert!(NUM_SIZE_CLASSES <= u32::BITS as usize);

/// Maps a block size to the index of the bucket that holds it.
#[must_use]
pub const fn size_class(size: usize) -> usize {
    if size <= MIN_BLOCK_SIZE {
        return 0;
    }
    let msb = usize::BITS - 1 - size.leading_zeros();
    let class = (msb - MIN_CLASS_SHIFT) as usize;
    if class < NUM_SIZE_CLASSES {
        class
    } else {
        NUM_SIZE_CLASSES - 1
    }
}

/// Smallest block size stored in bucket `class`.
///
/// # Panics
///
/// Panics if `class >= NUM_SIZE_CLASSES`.
#[must_use]
pub const fn class_lower_bound(class: usize) -> usize {
    assert!(class < NUM_SIZE_CLASSES);
    1 << (class + MIN_CLASS_SHIFT as usize)
}

/// One bit per size class; bit `k` is set iff bucket `k` is non-empty.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SizeClassBitmap(u32);

impl SizeClassBitmap {
    pub(crate) const fn new() -> Self {
        Self(0)
    }

    pub(crate) fn set(&mut self, class: usize) {
        debug_assert!(class < NUM_SIZE_CLASSES);
        self.0 |= 1 << class;
    }

    pub(crate) fn clear(&mut self, class: usize) {
        debug_assert!(class < NUM_SIZE_CLASSES);
        self.0 &= !(1 << class);
    }

    pub(crate) fn is_set(self, class: usize) -> bool {
        debug_assert!(class < NUM_SIZE_CLASSES);
        self.0 & (1 << class) != 0
    }

    /// Returns the lowest non-empty class that is `>= class`.
    pub(crate) fn lowest_set_from(self, class: usize) -> Option<usize> {
        if class >= NUM_SIZE_CLASSES {
            return None;
        }
        let masked = self.0 & (u32::MAX << class);
        (masked != 0).then(|| masked.trailing_zeros() as usize)
    }
}
