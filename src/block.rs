use core::ptr::{self, NonNull};

use crate::{
  WORD,
  tag::{Tag, TagCodec},
  validate::{Violation, fatal},
};

/// Offset of the `next` link inside a free block.
const NEXT_LINK: usize = WORD;
/// Offset of the `prev` link inside a free block.
const PREV_LINK: usize = 2 * WORD;

/// Link value for "no block".
pub(crate) const NIL: u64 = u64::MAX;

// =============================================================================
// Region
// =============================================================================

/// Raw view of the managed arena, `[base, base + len)`.
///
/// All offsets are arena-relative. Every word access is bounds checked; an
/// access that would leave the arena can only come from a corrupted tag and
/// ends the process.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Region {
  base: *mut u8,
  len: usize,
}

impl Region {
  pub(crate) fn new(start: *mut u8, end: *mut u8) -> Self {
    Self {
      base: start,
      len: (end as usize).saturating_sub(start as usize),
    }
  }

  #[inline]
  pub(crate) fn len(self) -> usize {
    self.len
  }

  /// Arena offset of `addr`, if it lies inside the region.
  #[inline]
  pub(crate) fn offset_of(self, addr: usize) -> Option<usize> {
    let base = self.base as usize;
    (addr >= base && addr < base + self.len).then(|| addr - base)
  }

  #[inline]
  fn check(self, off: usize) {
    if off % WORD != 0 || off.checked_add(WORD).is_none_or(|end| end > self.len) {
      fatal(Violation::Access { offset: off });
    }
  }

  #[inline]
  pub(crate) fn word(self, off: usize) -> u64 {
    self.check(off);
    // SAFETY: `check` keeps the aligned word inside the arena.
    unsafe { self.base.add(off).cast::<u64>().read() }
  }

  #[inline]
  pub(crate) fn set_word(self, off: usize, value: u64) {
    self.check(off);
    // SAFETY: `check` keeps the aligned word inside the arena.
    unsafe { self.base.add(off).cast::<u64>().write(value) }
  }

  /// Copy `len` bytes between two disjoint spans of the arena.
  pub(crate) fn copy(self, src: usize, dst: usize, len: usize) {
    let fits = |off: usize| off.checked_add(len).is_some_and(|end| end <= self.len);
    if !fits(src) {
      fatal(Violation::Access { offset: src });
    }
    if !fits(dst) {
      fatal(Violation::Access { offset: dst });
    }
    debug_assert!(src + len <= dst || dst + len <= src);
    // SAFETY: both spans are inside the arena and belong to distinct blocks.
    unsafe { ptr::copy_nonoverlapping(self.base.add(src), self.base.add(dst), len) };
  }

  /// Address of `off`; `off` must be inside the region.
  #[inline]
  pub(crate) fn addr(self, off: usize) -> NonNull<u8> {
    debug_assert!(off < self.len);
    // SAFETY: the base of a non-empty region is non-null and `off` is in bounds.
    unsafe { NonNull::new_unchecked(self.base.add(off)) }
  }
}

// =============================================================================
// Blocks
// =============================================================================

/// Block-level accessors over a [`Region`].
///
/// A block is named by the offset of its header. Its payload starts one word
/// later, and a free block keeps a copy of its header in its last word.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Blocks {
  pub(crate) region: Region,
  pub(crate) codec: TagCodec,
}

impl Blocks {
  pub(crate) fn new(region: Region, codec: TagCodec) -> Self {
    Self { region, codec }
  }

  #[inline]
  pub(crate) fn header_word(&self, block: usize) -> u64 {
    self.region.word(block)
  }

  #[inline]
  pub(crate) fn header(&self, block: usize) -> Tag {
    self.codec.decode(self.region.word(block))
  }

  #[inline]
  pub(crate) fn set_header(&self, block: usize, tag: Tag) {
    self.region.set_word(block, self.codec.encode(tag));
  }

  /// Offset of the footer word of a block spanning `size` bytes.
  #[inline]
  pub(crate) const fn footer_offset(block: usize, size: usize) -> usize {
    block + size - WORD
  }

  #[inline]
  pub(crate) fn footer_word(&self, block: usize, size: usize) -> u64 {
    self.region.word(Self::footer_offset(block, size))
  }

  /// Write `tag` as both header and footer.
  #[inline]
  pub(crate) fn set_boundary(&self, block: usize, tag: Tag) {
    let word = self.codec.encode(tag);
    self.region.set_word(block, word);
    self.region.set_word(Self::footer_offset(block, tag.size), word);
  }

  /// Rewrite the `prev_allocated` bit of `block`, keeping the footer of a
  /// free block in step.
  pub(crate) fn set_prev_allocated(&self, block: usize, prev_allocated: bool) {
    let tag = self.header(block).with_prev_allocated(prev_allocated);
    if tag.allocated {
      self.set_header(block, tag);
    } else {
      self.set_boundary(block, tag);
    }
  }

  #[inline]
  pub(crate) fn next(&self, block: usize) -> u64 {
    self.region.word(block + NEXT_LINK)
  }

  #[inline]
  pub(crate) fn set_next(&self, block: usize, next: u64) {
    self.region.set_word(block + NEXT_LINK, next);
  }

  #[inline]
  pub(crate) fn prev(&self, block: usize) -> u64 {
    self.region.word(block + PREV_LINK)
  }

  #[inline]
  pub(crate) fn set_prev(&self, block: usize, prev: u64) {
    self.region.set_word(block + PREV_LINK, prev);
  }

  #[inline]
  pub(crate) fn payload(&self, block: usize) -> NonNull<u8> {
    self.region.addr(block + WORD)
  }
}

/// Walks a singly linked chain through the `next` link, head first.
pub(crate) struct Chain {
  blocks: Blocks,
  cursor: u64,
}

impl Chain {
  pub(crate) fn new(blocks: Blocks, head: u64) -> Self {
    Self {
      blocks,
      cursor: head,
    }
  }
}

impl Iterator for Chain {
  type Item = usize;

  fn next(&mut self) -> Option<usize> {
    if self.cursor == NIL {
      return None;
    }
    let block = self.cursor as usize;
    self.cursor = self.blocks.next(block);
    Some(block)
  }
}
