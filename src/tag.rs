//! Boundary tags: the header/footer word carried by every block.
//!
//! A tag packs the block size (always a multiple of 16, so its low four bits
//! are free) with three status bits, then XORs the whole word with a magic
//! constant. The XOR is not a security feature: it only makes a zeroed or
//! stray-written word decode to something [`TagCodec::validate`] rejects.

use crate::{ALIGNMENT, MIN_BLOCK_SIZE};

/// Previous block (by address) is allocated.
pub const PREV_ALLOCATED: u64 = 0x1;
/// This block is allocated.
pub const THIS_ALLOCATED: u64 = 0x2;
/// This block sits in a quick list.
pub const IN_QUICK_LIST: u64 = 0x4;

const STATUS_MASK: u64 = 0xf;

/// Default magic used when none is configured.
pub const DEFAULT_MAGIC: u64 = 0x5E6F_A110_C0DE_B10C;

/// Decoded boundary tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag {
  pub size: usize,
  pub prev_allocated: bool,
  pub allocated: bool,
  pub in_quick_list: bool,
}

impl Tag {
  #[inline]
  pub const fn allocated(size: usize, prev_allocated: bool) -> Self {
    Self {
      size,
      prev_allocated,
      allocated: true,
      in_quick_list: false,
    }
  }

  #[inline]
  pub const fn free(size: usize, prev_allocated: bool) -> Self {
    Self {
      size,
      prev_allocated,
      allocated: false,
      in_quick_list: false,
    }
  }

  /// Zero-sized, allocated terminator at the top of the arena.
  #[inline]
  pub const fn epilogue(prev_allocated: bool) -> Self {
    Self::allocated(0, prev_allocated)
  }

  #[inline]
  pub const fn with_prev_allocated(self, prev_allocated: bool) -> Self {
    Self {
      prev_allocated,
      ..self
    }
  }

  #[inline]
  pub const fn with_quick_list(self, in_quick_list: bool) -> Self {
    Self {
      in_quick_list,
      ..self
    }
  }

  /// Size is at least the minimum block and 16-aligned.
  #[inline]
  pub const fn is_well_formed(&self) -> bool {
    self.size >= MIN_BLOCK_SIZE && self.size % ALIGNMENT == 0
  }

  #[inline]
  const fn bits(&self) -> u64 {
    let mut bits = 0;
    if self.prev_allocated {
      bits |= PREV_ALLOCATED;
    }
    if self.allocated {
      bits |= THIS_ALLOCATED;
    }
    if self.in_quick_list {
      bits |= IN_QUICK_LIST;
    }
    bits
  }
}

/// Encodes and decodes tags against one magic value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagCodec {
  magic: u64,
}

impl TagCodec {
  pub const fn new(magic: u64) -> Self {
    Self { magic }
  }

  #[inline]
  pub const fn magic(&self) -> u64 {
    self.magic
  }

  #[inline]
  pub const fn encode(&self, tag: Tag) -> u64 {
    debug_assert!(tag.size % ALIGNMENT == 0);
    ((tag.size as u64 & !STATUS_MASK) | tag.bits()) ^ self.magic
  }

  #[inline]
  pub const fn decode(&self, word: u64) -> Tag {
    let raw = word ^ self.magic;
    Tag {
      size: (raw & !STATUS_MASK) as usize,
      prev_allocated: raw & PREV_ALLOCATED != 0,
      allocated: raw & THIS_ALLOCATED != 0,
      in_quick_list: raw & IN_QUICK_LIST != 0,
    }
  }

  /// Whether `word` decodes to a tag that could describe a real block.
  #[inline]
  pub const fn validate(&self, word: u64) -> bool {
    self.decode(word).is_well_formed()
  }
}

impl Default for TagCodec {
  fn default() -> Self {
    Self::new(DEFAULT_MAGIC)
  }
}
