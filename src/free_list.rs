//! Segregated free-list index.
//!
//! One doubly linked list per power-of-two size class, threaded through the
//! payload of each free block. Links are arena offsets. The `prev` link of a
//! list head holds [`HEAD_MARK`] tagged with its class, so unlinking never
//! needs to re-derive the class from a header that may already be rewritten.

use crate::{
  MIN_BLOCK_SIZE, NUM_FREE_LISTS,
  block::{Blocks, Chain, NIL},
  validate::{Violation, fatal},
};

/// Marks a `prev` link that points at a list head rather than a block.
const HEAD_MARK: u64 = 1 << 63;

/// Class to start searching from for a block of `size` bytes.
///
/// Class 0 holds exactly-minimum blocks, class `i` holds sizes in
/// `(32 << (i - 1), 32 << i]`, and the last class takes everything larger.
#[inline]
pub const fn class_for(size: usize) -> usize {
  let mut class = 0;
  let mut bound = MIN_BLOCK_SIZE;
  while size > bound && class < NUM_FREE_LISTS - 1 {
    bound *= 2;
    class += 1;
  }
  class
}

pub(crate) struct FreeLists {
  heads: [u64; NUM_FREE_LISTS],
}

impl FreeLists {
  pub(crate) const fn new() -> Self {
    Self {
      heads: [NIL; NUM_FREE_LISTS],
    }
  }

  #[inline]
  pub(crate) fn head(&self, class: usize) -> u64 {
    self.heads[class]
  }

  /// Push `block` (of `size` bytes) at the head of its class.
  pub(crate) fn insert(&mut self, blocks: &Blocks, block: usize, size: usize) {
    let class = class_for(size);
    let head = self.heads[class];
    blocks.set_next(block, head);
    blocks.set_prev(block, HEAD_MARK | class as u64);
    if head != NIL {
      blocks.set_prev(head as usize, block as u64);
    }
    self.heads[class] = block as u64;
  }

  /// Unlink `block`, which must currently be in some list.
  pub(crate) fn remove(&mut self, blocks: &Blocks, block: usize) {
    let next = blocks.next(block);
    let prev = blocks.prev(block);

    if prev & HEAD_MARK != 0 {
      let class = (prev & !HEAD_MARK) as usize;
      if class >= NUM_FREE_LISTS || self.heads[class] != block as u64 {
        fatal(Violation::FreeListMismatch { offset: block });
      }
      self.heads[class] = next;
    } else {
      blocks.set_next(prev as usize, next);
    }

    if next != NIL {
      blocks.set_prev(next as usize, prev);
    }
  }

  /// First block of at least `size` bytes, scanning classes upward from
  /// `class_for(size)` and each list head to tail.
  pub(crate) fn find_fit(&self, blocks: &Blocks, size: usize) -> Option<usize> {
    (class_for(size)..NUM_FREE_LISTS)
      .flat_map(|class| self.iter(*blocks, class))
      .find(|&block| blocks.header(block).size >= size)
  }

  pub(crate) fn iter(&self, blocks: Blocks, class: usize) -> Chain {
    Chain::new(blocks, self.heads[class])
  }

  /// `prev` link value expected on the head of `class`.
  #[inline]
  pub(crate) const fn head_link(class: usize) -> u64 {
    HEAD_MARK | class as u64
  }
}
