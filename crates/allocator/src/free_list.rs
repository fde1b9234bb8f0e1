//! Segregated free lists.
//!
//! Each size class owns an intrusive doubly linked list threaded through the
//! free blocks themselves. The bitmap mirrors which lists are non-empty and is
//! updated in the same call as every insertion and removal.

use crate::{
    block::{Arena, Block},
    size_class::{NUM_SIZE_CLASSES, SizeClassBitmap, size_class},
};

#[derive(Debug)]
pub(crate) struct FreeLists {
    heads: [Option<Block>; NUM_SIZE_CLASSES],
    bitmap: SizeClassBitmap,
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; NUM_SIZE_CLASSES],
            bitmap: SizeClassBitmap::new(),
        }
    }

    pub(crate) fn head(&self, class: usize) -> Option<Block> {
        self.heads[class]
    }

    pub(crate) fn bitmap(&self) -> SizeClassBitmap {
        self.bitmap
    }

    /// Pushes a free block onto the bucket for its current size.
    ///
    /// The block must already be marked free and must not be linked into any
    /// bucket.
    pub(crate) fn insert(&mut self, arena: &mut Arena, block: Block) {
        debug_assert!(arena.is_free(block), "inserting an allocated block");
        let class = size_class(arena.size(block));
        let head = self.heads[class];

        arena.set_prev_link(block, None);
        arena.set_next_link(block, head);
        if let Some(head) = head {
            arena.set_prev_link(head, Some(block));
        }
        self.heads[class] = Some(block);
        self.bitmap.set(class);
    }

    /// Unlinks a block from the bucket for its current size.
    ///
    /// The block size must not have changed since it was inserted.
    pub(crate) fn remove(&mut self, arena: &mut Arena, block: Block) {
        let class = size_class(arena.size(block));
        let next = arena.next_link(block);
        let prev = arena.prev_link(block);

        match prev {
            Some(prev) => arena.set_next_link(prev, next),
            None => {
                debug_assert_eq!(self.heads[class], Some(block), "block is not in its bucket");
                self.heads[class] = next;
            }
        }
        if let Some(next) = next {
            arena.set_prev_link(next, prev);
        }

        if self.heads[class].is_none() {
            self.bitmap.clear(class);
        }
    }

    /// Iterates over the blocks of one bucket, head first.
    pub(crate) fn iter<'a>(&self, arena: &'a Arena, class: usize) -> Iter<'a> {
        Iter {
            arena,
            cursor: self.heads[class],
        }
    }
}

pub(crate) struct Iter<'a> {
    arena: &'a Arena,
    cursor: Option<Block>,
}

impl Iterator for Iter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.cursor?;
        self.cursor = self.arena.next_link(block);
        Some(block)
    }
}
