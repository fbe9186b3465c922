//! Quick lists: bounded LIFO stacks of recently freed blocks, one per exact
//! small size. Entries stay marked allocated (plus the in-quick-list bit), so
//! they never coalesce until a flush hands them back to the free-list index.

use crate::{
  ALIGNMENT, MIN_BLOCK_SIZE, NUM_QUICK_LISTS,
  block::{Blocks, Chain, NIL},
};

/// Largest block size served by a quick list.
pub const MAX_QUICK_BLOCK_SIZE: usize = MIN_BLOCK_SIZE + (NUM_QUICK_LISTS - 1) * ALIGNMENT;

/// Quick list serving blocks of exactly `size` bytes, if any.
#[inline]
pub const fn index_for(size: usize) -> Option<usize> {
  if size < MIN_BLOCK_SIZE || size > MAX_QUICK_BLOCK_SIZE || (size - MIN_BLOCK_SIZE) % ALIGNMENT != 0 {
    return None;
  }
  Some((size - MIN_BLOCK_SIZE) / ALIGNMENT)
}

/// Block size held by quick list `index`.
#[inline]
pub const fn size_of_index(index: usize) -> usize {
  MIN_BLOCK_SIZE + index * ALIGNMENT
}

#[derive(Clone, Copy)]
struct Stack {
  head: u64,
  len: usize,
}

pub(crate) struct QuickLists {
  stacks: [Stack; NUM_QUICK_LISTS],
  capacity: usize,
}

impl QuickLists {
  pub(crate) const fn new(capacity: usize) -> Self {
    Self {
      stacks: [Stack { head: NIL, len: 0 }; NUM_QUICK_LISTS],
      capacity,
    }
  }

  #[inline]
  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub(crate) fn head(&self, index: usize) -> u64 {
    self.stacks[index].head
  }

  #[inline]
  pub(crate) fn len(&self, index: usize) -> usize {
    self.stacks[index].len
  }

  #[inline]
  pub(crate) fn is_full(&self, index: usize) -> bool {
    self.stacks[index].len >= self.capacity
  }

  /// Push without checking capacity; the caller flushes a full stack first.
  pub(crate) fn push(&mut self, blocks: &Blocks, index: usize, block: usize) {
    debug_assert!(!self.is_full(index));
    let stack = &mut self.stacks[index];
    blocks.set_next(block, stack.head);
    stack.head = block as u64;
    stack.len += 1;
  }

  pub(crate) fn pop(&mut self, blocks: &Blocks, index: usize) -> Option<usize> {
    let stack = &mut self.stacks[index];
    if stack.head == NIL {
      return None;
    }
    let block = stack.head as usize;
    stack.head = blocks.next(block);
    stack.len -= 1;
    Some(block)
  }

  pub(crate) fn iter(&self, blocks: Blocks, index: usize) -> Chain {
    Chain::new(blocks, self.stacks[index].head)
  }
}
