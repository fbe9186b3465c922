//! Pointer validation and the fatal path.
//!
//! Misuse by the client (freeing something that was never handed out, double
//! frees, scribbling over a header) is not an error the heap can recover from.
//! [`check_pointer`] classifies it as a [`Violation`]; `free`/`resize` hand
//! that to [`fatal`], which prints one line to stderr and aborts.

use core::fmt::{self, Write};

use crate::{ALIGNMENT, FIRST_BLOCK_OFFSET, MIN_BLOCK_SIZE, WORD, block::Blocks};

/// Why a pointer or the heap as a whole failed validation.
///
/// `offset` fields are arena-relative block offsets; `addr` fields are the
/// raw pointer the client passed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
  /// Null pointer.
  Null,
  /// Pointer is outside the block area of the arena.
  OutOfBounds { addr: usize },
  /// Pointer is not 16-byte aligned.
  Misaligned { addr: usize },
  /// Header does not decode to a plausible block size.
  MalformedHeader { offset: usize },
  /// Header size runs past the epilogue.
  Overrun { offset: usize, size: usize },
  /// Block is not allocated.
  NotAllocated { offset: usize },
  /// Block is parked in a quick list.
  InQuickList { offset: usize },
  /// Header says the previous block is free, but its footer disagrees.
  PrevFooterMismatch { offset: usize },
  /// Two free blocks sit next to each other.
  AdjacentFree { offset: usize },
  /// `prev_allocated` bit does not match the preceding block.
  PrevBitMismatch { offset: usize },
  /// Free block's footer differs from its header.
  FooterMismatch { offset: usize },
  /// Prologue or epilogue is damaged.
  Sentinel { offset: usize },
  /// Free-list links or membership are inconsistent.
  FreeListMismatch { offset: usize },
  /// Quick-list entry has the wrong size or status bits.
  QuickListMismatch { offset: usize },
  /// Raw access outside the arena.
  Access { offset: usize },
  /// The heap was re-entered while already in use on this thread.
  Reentrant,
}

impl fmt::Display for Violation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Violation::Null => write!(f, "null pointer"),
      Violation::OutOfBounds { addr } => write!(f, "pointer {addr:#x} is outside the heap"),
      Violation::Misaligned { addr } => write!(f, "pointer {addr:#x} is not {ALIGNMENT}-byte aligned"),
      Violation::MalformedHeader { offset } => write!(f, "malformed header at offset {offset:#x}"),
      Violation::Overrun { offset, size } => {
        write!(f, "block at offset {offset:#x} of size {size} overruns the heap")
      }
      Violation::NotAllocated { offset } => write!(f, "block at offset {offset:#x} is not allocated"),
      Violation::InQuickList { offset } => write!(f, "block at offset {offset:#x} is already in a quick list"),
      Violation::PrevFooterMismatch { offset } => {
        write!(f, "block at offset {offset:#x} has an inconsistent previous footer")
      }
      Violation::AdjacentFree { offset } => write!(f, "uncoalesced free blocks at offset {offset:#x}"),
      Violation::PrevBitMismatch { offset } => {
        write!(f, "block at offset {offset:#x} has a stale prev_allocated bit")
      }
      Violation::FooterMismatch { offset } => {
        write!(f, "free block at offset {offset:#x} has a mismatched footer")
      }
      Violation::Sentinel { offset } => write!(f, "damaged sentinel at offset {offset:#x}"),
      Violation::FreeListMismatch { offset } => {
        write!(f, "free list is inconsistent at offset {offset:#x}")
      }
      Violation::QuickListMismatch { offset } => {
        write!(f, "quick list is inconsistent at offset {offset:#x}")
      }
      Violation::Access { offset } => write!(f, "arena access out of bounds at offset {offset:#x}"),
      Violation::Reentrant => write!(f, "heap re-entered while in use"),
    }
  }
}

impl std::error::Error for Violation {}

// =============================================================================
// Fatal path
// =============================================================================

/// Fixed buffer so the fatal path never touches an allocator.
struct Line {
  buf: [u8; 192],
  len: usize,
}

impl Write for Line {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let take = s.len().min(self.buf.len() - self.len);
    self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
    self.len += take;
    Ok(())
  }
}

/// Report `violation` and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(violation: Violation) -> ! {
  log::error!("heap violation: {violation}");

  let mut line = Line { buf: [0; 192], len: 0 };
  let _ = write!(line, "segmalloc: fatal: {violation}");
  if line.len == line.buf.len() {
    line.len -= 1;
  }
  line.buf[line.len] = b'\n';
  line.len += 1;

  unsafe {
    libc::write(2, line.buf.as_ptr().cast(), line.len);
    libc::abort();
  }
}

// =============================================================================
// Pointer validation
// =============================================================================

/// Validate a payload pointer and return the offset of its block.
///
/// Accepts only payloads of blocks that are currently allocated, not parked in
/// a quick list, and whose neighbour below is consistent with their
/// `prev_allocated` bit.
pub(crate) fn check_pointer(blocks: &Blocks, addr: usize) -> Result<usize, Violation> {
  if addr == 0 {
    return Err(Violation::Null);
  }

  let region = blocks.region;
  let payload = region.offset_of(addr).ok_or(Violation::OutOfBounds { addr })?;
  let block = payload.checked_sub(WORD).ok_or(Violation::OutOfBounds { addr })?;
  // The last real block ends at the epilogue header.
  let last = region.len().saturating_sub(WORD + MIN_BLOCK_SIZE);
  if block < FIRST_BLOCK_OFFSET || block > last {
    return Err(Violation::OutOfBounds { addr });
  }
  if addr % ALIGNMENT != 0 {
    return Err(Violation::Misaligned { addr });
  }

  let tag = blocks.header(block);
  if !tag.is_well_formed() {
    return Err(Violation::MalformedHeader { offset: block });
  }
  if block
    .checked_add(tag.size)
    .is_none_or(|end| end > region.len() - WORD)
  {
    return Err(Violation::Overrun {
      offset: block,
      size: tag.size,
    });
  }
  if !tag.allocated {
    return Err(Violation::NotAllocated { offset: block });
  }
  if tag.in_quick_list {
    return Err(Violation::InQuickList { offset: block });
  }

  if !tag.prev_allocated {
    let footer = blocks.region.word(block - WORD);
    let prev_tag = blocks.codec.decode(footer);
    let mismatch = Err(Violation::PrevFooterMismatch { offset: block });
    if !prev_tag.is_well_formed() || prev_tag.allocated {
      return mismatch;
    }
    let Some(prev) = block.checked_sub(prev_tag.size).filter(|&prev| prev >= FIRST_BLOCK_OFFSET) else {
      return mismatch;
    };
    if blocks.header_word(prev) != footer {
      return mismatch;
    }
  }

  Ok(block)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{block::tests::Scratch, tag::Tag};

  /// Prologue, two blocks `[40, 40 + a)`, `[40 + a, 40 + a + b)`, epilogue.
  fn layout(scratch: &mut Scratch, a: Tag, b: Tag) -> Blocks {
    let blocks = scratch.blocks();
    let len = blocks.region.len();
    blocks.set_header(8, Tag::allocated(MIN_BLOCK_SIZE, true));
    for (block, tag) in [(FIRST_BLOCK_OFFSET, a), (FIRST_BLOCK_OFFSET + a.size, b)] {
      if tag.allocated {
        blocks.set_header(block, tag);
      } else {
        blocks.set_boundary(block, tag);
      }
    }
    assert_eq!(FIRST_BLOCK_OFFSET + a.size + b.size, len - WORD);
    blocks.set_header(len - WORD, Tag::epilogue(b.allocated));
    blocks
  }

  fn payload(blocks: &Blocks, block: usize) -> usize {
    blocks.payload(block).as_ptr() as usize
  }

  #[test]
  fn test_accepts_allocated_block() {
    let mut scratch = Scratch::new(256);
    let blocks = layout(&mut scratch, Tag::allocated(96, true), Tag::free(112, true));
    assert_eq!(check_pointer(&blocks, payload(&blocks, 40)), Ok(40));
  }

  #[test]
  fn test_rejects_null_and_foreign_pointers() {
    let mut scratch = Scratch::new(256);
    let blocks = layout(&mut scratch, Tag::allocated(96, true), Tag::free(112, true));
    let base = blocks.region.addr(0).as_ptr() as usize;

    assert_eq!(check_pointer(&blocks, 0), Err(Violation::Null));
    // Prologue payload.
    assert_eq!(
      check_pointer(&blocks, base + 16),
      Err(Violation::OutOfBounds { addr: base + 16 })
    );
    assert_eq!(
      check_pointer(&blocks, base + 4096),
      Err(Violation::OutOfBounds { addr: base + 4096 })
    );
    assert_eq!(
      check_pointer(&blocks, base + 56),
      Err(Violation::Misaligned { addr: base + 56 })
    );
  }

  #[test]
  fn test_rejects_free_and_quick_blocks() {
    let mut scratch = Scratch::new(256);
    let blocks = layout(&mut scratch, Tag::allocated(96, true), Tag::free(112, true));
    assert_eq!(
      check_pointer(&blocks, payload(&blocks, 136)),
      Err(Violation::NotAllocated { offset: 136 })
    );

    blocks.set_header(40, Tag::allocated(96, true).with_quick_list(true));
    assert_eq!(
      check_pointer(&blocks, payload(&blocks, 40)),
      Err(Violation::InQuickList { offset: 40 })
    );
  }

  #[test]
  fn test_rejects_damaged_header() {
    let mut scratch = Scratch::new(256);
    let blocks = layout(&mut scratch, Tag::allocated(96, true), Tag::allocated(112, true));

    // 24 is not a multiple of the alignment; written raw, bypassing `encode`.
    blocks.region.set_word(136, blocks.codec.magic() ^ (24 | 0x3));
    assert_eq!(
      check_pointer(&blocks, payload(&blocks, 136)),
      Err(Violation::MalformedHeader { offset: 136 })
    );

    blocks.set_header(136, Tag::allocated(4096, true));
    assert_eq!(
      check_pointer(&blocks, payload(&blocks, 136)),
      Err(Violation::Overrun { offset: 136, size: 4096 })
    );
  }

  #[test]
  fn test_checks_previous_footer() {
    let mut scratch = Scratch::new(256);
    let blocks = layout(&mut scratch, Tag::free(96, true), Tag::allocated(112, false));
    assert_eq!(check_pointer(&blocks, payload(&blocks, 136)), Ok(136));

    // Footer no longer matches its header.
    blocks.region.set_word(128, blocks.codec.encode(Tag::free(96, false)));
    assert_eq!(
      check_pointer(&blocks, payload(&blocks, 136)),
      Err(Violation::PrevFooterMismatch { offset: 136 })
    );

    // Previous block is actually allocated.
    blocks.set_header(40, Tag::allocated(96, true));
    blocks.region.set_word(128, blocks.codec.encode(Tag::allocated(96, true)));
    assert_eq!(
      check_pointer(&blocks, payload(&blocks, 136)),
      Err(Violation::PrevFooterMismatch { offset: 136 })
    );
  }

  #[test]
  fn test_display_names_the_offset() {
    let text = Violation::NotAllocated { offset: 0x28 }.to_string();
    assert_eq!(text, "block at offset 0x28 is not allocated");
    assert_eq!(Violation::Reentrant.to_string(), "heap re-entered while in use");
  }
}
