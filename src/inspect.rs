//! Read-only views over a heap: block walks, list contents and a full
//! integrity check.

use crate::{
  FIRST_BLOCK_OFFSET, MIN_BLOCK_SIZE, NUM_FREE_LISTS, NUM_QUICK_LISTS, PROLOGUE_OFFSET, WORD,
  arena::PageSource,
  block::{Blocks, NIL},
  free_list::{FreeLists, class_for},
  heap::Heap,
  quick_list::size_of_index,
  tag::Tag,
  validate::Violation,
};

/// Decoded view of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Offset of the header from the arena start.
  pub offset: usize,
  pub size: usize,
  pub allocated: bool,
  pub prev_allocated: bool,
  pub in_quick_list: bool,
}

impl BlockInfo {
  fn new(offset: usize, tag: Tag) -> Self {
    Self {
      offset,
      size: tag.size,
      allocated: tag.allocated,
      prev_allocated: tag.prev_allocated,
      in_quick_list: tag.in_quick_list,
    }
  }

  /// Offset of the payload from the arena start.
  pub fn payload_offset(&self) -> usize {
    self.offset + WORD
  }
}

/// Walks blocks by address, from the first block up to the epilogue.
pub struct BlockIter {
  blocks: Blocks,
  cursor: usize,
  epilogue: usize,
}

impl Iterator for BlockIter {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    if self.cursor >= self.epilogue {
      return None;
    }
    let tag = self.blocks.header(self.cursor);
    let info = BlockInfo::new(self.cursor, tag);
    // A zero size would loop forever; stop at the first malformed tag.
    self.cursor = if tag.is_well_formed() {
      self.cursor.saturating_add(tag.size)
    } else {
      self.epilogue
    };
    Some(info)
  }
}

impl<A: PageSource> Heap<A> {
  /// Every block between the prologue and the epilogue, in address order.
  pub fn blocks(&self) -> BlockIter {
    let blocks = self.layout();
    let epilogue = if self.is_initialized() {
      blocks.region.len() - WORD
    } else {
      0
    };
    BlockIter {
      blocks,
      cursor: FIRST_BLOCK_OFFSET,
      epilogue,
    }
  }

  /// Contents of free-list `class`, head first.
  pub fn free_list(&self, class: usize) -> impl Iterator<Item = BlockInfo> {
    let blocks = self.layout();
    self
      .free_lists
      .iter(blocks, class)
      .map(move |block| BlockInfo::new(block, blocks.header(block)))
  }

  /// Contents of quick list `index`, most recently pushed first.
  pub fn quick_list(&self, index: usize) -> impl Iterator<Item = BlockInfo> {
    let blocks = self.layout();
    self
      .quick_lists
      .iter(blocks, index)
      .map(move |block| BlockInfo::new(block, blocks.header(block)))
  }

  /// Free-list blocks of exactly `size` bytes, or all of them for `None`.
  pub fn free_block_count(&self, size: Option<usize>) -> usize {
    (0..NUM_FREE_LISTS)
      .flat_map(|class| self.free_list(class))
      .filter(|info| size.is_none_or(|size| info.size == size))
      .count()
  }

  /// Quick-list blocks of exactly `size` bytes, or all of them for `None`.
  pub fn quick_block_count(&self, size: Option<usize>) -> usize {
    (0..NUM_QUICK_LISTS)
      .flat_map(|index| self.quick_list(index))
      .filter(|info| size.is_none_or(|size| info.size == size))
      .count()
  }

  /// Decode the header behind any payload pointer inside the block area,
  /// whatever its state.
  pub fn block_info(&self, ptr: *const u8) -> Option<BlockInfo> {
    let blocks = self.layout();
    let block = blocks.region.offset_of(ptr as usize)?.checked_sub(WORD)?;
    if block < FIRST_BLOCK_OFFSET || block % WORD != 0 || block >= blocks.region.len() - WORD {
      return None;
    }
    Some(BlockInfo::new(block, blocks.header(block)))
  }

  /// Check every structural invariant of the heap.
  ///
  /// Walks the arena block by block, then each free list and quick list, and
  /// reports the first inconsistency. Never aborts: suspicious offsets are
  /// range-checked before they are dereferenced.
  pub fn verify(&self) -> Result<(), Violation> {
    if !self.is_initialized() {
      return Ok(());
    }
    let blocks = self.layout();
    let len = blocks.region.len();
    let epilogue = len - WORD;

    let prologue = blocks.header(PROLOGUE_OFFSET);
    if prologue.size != MIN_BLOCK_SIZE || !prologue.allocated {
      return Err(Violation::Sentinel {
        offset: PROLOGUE_OFFSET,
      });
    }

    // Heap walk.
    let mut free_blocks = 0;
    let mut quick_blocks = 0;
    let mut prev_allocated = true;
    let mut block = FIRST_BLOCK_OFFSET;
    while block < epilogue {
      let tag = blocks.header(block);
      if !tag.is_well_formed() {
        return Err(Violation::MalformedHeader { offset: block });
      }
      if block.checked_add(tag.size).is_none_or(|end| end > epilogue) {
        return Err(Violation::Overrun {
          offset: block,
          size: tag.size,
        });
      }
      if tag.prev_allocated != prev_allocated {
        return Err(Violation::PrevBitMismatch { offset: block });
      }
      if tag.allocated {
        quick_blocks += tag.in_quick_list as usize;
      } else {
        if tag.in_quick_list {
          return Err(Violation::QuickListMismatch { offset: block });
        }
        if !prev_allocated {
          return Err(Violation::AdjacentFree { offset: block });
        }
        if blocks.footer_word(block, tag.size) != blocks.header_word(block) {
          return Err(Violation::FooterMismatch { offset: block });
        }
        free_blocks += 1;
      }
      prev_allocated = tag.allocated;
      block += tag.size;
    }

    let tail = blocks.header(epilogue);
    if block != epilogue || tail.size != 0 || !tail.allocated {
      return Err(Violation::Sentinel { offset: epilogue });
    }
    if tail.prev_allocated != prev_allocated {
      return Err(Violation::PrevBitMismatch { offset: epilogue });
    }

    let in_range = |link: u64| {
      let block = link as usize;
      link != NIL
        && block >= FIRST_BLOCK_OFFSET
        && block <= epilogue - MIN_BLOCK_SIZE
        && block % WORD == 0
    };

    // Free lists.
    let mut listed = 0;
    for class in 0..NUM_FREE_LISTS {
      let mut expected_prev = FreeLists::head_link(class);
      let mut link = self.free_lists.head(class);
      while link != NIL {
        let block = link as usize;
        if !in_range(link) || listed >= free_blocks {
          return Err(Violation::FreeListMismatch { offset: block });
        }
        let tag = blocks.header(block);
        if tag.allocated || !tag.is_well_formed() || class_for(tag.size) != class {
          return Err(Violation::FreeListMismatch { offset: block });
        }
        if blocks.prev(block) != expected_prev {
          return Err(Violation::FreeListMismatch { offset: block });
        }
        listed += 1;
        expected_prev = link;
        link = blocks.next(block);
      }
    }
    if listed != free_blocks {
      return Err(Violation::FreeListMismatch { offset: 0 });
    }

    // Quick lists.
    let mut parked = 0;
    for index in 0..NUM_QUICK_LISTS {
      let mut count = 0;
      let mut link = self.quick_lists.head(index);
      while link != NIL {
        let block = link as usize;
        if !in_range(link) || count >= self.quick_lists.capacity() {
          return Err(Violation::QuickListMismatch { offset: block });
        }
        let tag = blocks.header(block);
        if !tag.allocated || !tag.in_quick_list || tag.size != size_of_index(index) {
          return Err(Violation::QuickListMismatch { offset: block });
        }
        count += 1;
        link = blocks.next(block);
      }
      if count != self.quick_lists.len(index) {
        return Err(Violation::QuickListMismatch { offset: 0 });
      }
      parked += count;
    }
    if parked != quick_blocks {
      return Err(Violation::QuickListMismatch { offset: 0 });
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{HeapConfig, PAGE_SIZE, arena::BufferArena};

  fn heap() -> Heap<BufferArena> {
    Heap::with_arena(BufferArena::new(4), HeapConfig::default())
  }

  #[test]
  fn test_empty_heap() {
    let heap = heap();
    assert_eq!(heap.blocks().count(), 0);
    assert_eq!(heap.free_block_count(None), 0);
    assert_eq!(heap.verify(), Ok(()));
  }

  #[test]
  fn test_walk_after_allocations() {
    let mut heap = heap();
    let a = heap.allocate(200).unwrap().unwrap();
    heap.allocate(300).unwrap().unwrap();

    let walk: Vec<_> = heap.blocks().map(|b| (b.offset, b.size, b.allocated)).collect();
    assert_eq!(
      walk,
      vec![
        (40, 208, true),
        (248, 320, true),
        (568, PAGE_SIZE - 48 - 528, false)
      ]
    );

    let info = heap.block_info(a.as_ptr()).unwrap();
    assert_eq!(info.offset, 40);
    assert_eq!(info.payload_offset(), 48);
    assert!(info.prev_allocated);
    assert_eq!(heap.verify(), Ok(()));
  }

  #[test]
  fn test_counts() {
    let mut heap = heap();
    let small = heap.allocate(10).unwrap().unwrap();
    let large = heap.allocate(1000).unwrap().unwrap();
    heap.allocate(10).unwrap().unwrap();
    heap.free(small.as_ptr());
    heap.free(large.as_ptr());

    assert_eq!(heap.quick_block_count(None), 1);
    assert_eq!(heap.quick_block_count(Some(32)), 1);
    assert_eq!(heap.quick_block_count(Some(48)), 0);
    assert_eq!(heap.free_block_count(None), 2);
    assert_eq!(heap.free_block_count(Some(1008)), 1);
    assert_eq!(heap.verify(), Ok(()));
  }

  #[test]
  fn test_verify_catches_stale_prev_bit() {
    let mut heap = heap();
    heap.allocate(100).unwrap().unwrap();
    let b = heap.allocate(100).unwrap().unwrap();
    let blocks = heap.layout();
    let block = heap.block_info(b.as_ptr()).unwrap().offset;
    blocks.set_header(block, Tag::allocated(112, false));
    assert_eq!(heap.verify(), Err(Violation::PrevBitMismatch { offset: block }));
  }

  #[test]
  fn test_verify_catches_broken_footer() {
    let mut heap = heap();
    let a = heap.allocate(500).unwrap().unwrap();
    heap.allocate(500).unwrap().unwrap();
    heap.free(a.as_ptr());

    let blocks = heap.layout();
    blocks.region.set_word(Blocks::footer_offset(40, 512), 0);
    assert_eq!(heap.verify(), Err(Violation::FooterMismatch { offset: 40 }));
  }

  #[test]
  fn test_verify_catches_unlisted_free_block() {
    let mut heap = heap();
    heap.allocate(500).unwrap().unwrap();
    heap.allocate(500).unwrap().unwrap();

    // Mark the block free by hand without linking it anywhere.
    let blocks = heap.layout();
    blocks.set_boundary(40, Tag::free(512, true));
    blocks.set_prev_allocated(552, false);
    assert_eq!(heap.verify(), Err(Violation::FreeListMismatch { offset: 0 }));
  }
}
