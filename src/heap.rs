use core::{fmt, ptr::NonNull};

use crate::{
  ALIGNMENT, FIRST_BLOCK_OFFSET, MIN_BLOCK_SIZE, PROLOGUE_OFFSET, SENTINEL_OVERHEAD, WORD,
  arena::{PageSource, SystemArena},
  block::{Blocks, Region},
  config::HeapConfig,
  free_list::FreeLists,
  quick_list::{self, QuickLists},
  tag::{Tag, TagCodec},
  validate::{Violation, check_pointer, fatal},
};

/// Recoverable allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// The arena cannot grow far enough to satisfy the request.
  OutOfMemory,
}

impl AllocError {
  /// The `errno` value a C caller would see.
  pub const fn errno(self) -> i32 {
    match self {
      AllocError::OutOfMemory => libc::ENOMEM,
    }
  }
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AllocError::OutOfMemory => write!(f, "out of memory"),
    }
  }
}

impl std::error::Error for AllocError {}

/// Block size needed to serve a payload of `size` bytes, or `None` when the
/// computation overflows.
#[inline]
pub const fn block_size_for(size: usize) -> Option<usize> {
  let Some(padded) = size.checked_add(WORD + ALIGNMENT - 1) else {
    return None;
  };
  let block = padded & !(ALIGNMENT - 1);
  Some(if block < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { block })
}

// =============================================================================
// Heap
// =============================================================================

/// A segregated free-list heap over a page-granular arena.
///
/// Blocks carry boundary tags; free blocks are indexed by size class and
/// coalesced eagerly, while small blocks cycle through per-size quick lists.
///
/// A `Heap` is not safe for concurrent use. It holds raw arena pointers and
/// is therefore neither `Send` nor `Sync`; wrap it in a mutex to share it.
pub struct Heap<A: PageSource = SystemArena> {
  pub(crate) arena: A,
  pub(crate) codec: TagCodec,
  pub(crate) free_lists: FreeLists,
  pub(crate) quick_lists: QuickLists,
  resident: usize,
  peak_resident: usize,
}

impl Heap {
  /// Heap over the platform's default page source.
  pub fn new(config: HeapConfig) -> Self {
    Self::with_arena(SystemArena::new(config.max_pages), config)
  }
}

impl Default for Heap {
  fn default() -> Self {
    Self::new(HeapConfig::default())
  }
}

impl<A: PageSource> Heap<A> {
  /// Heap over a caller-supplied page source. The arena stays untouched until
  /// the first non-zero allocation.
  pub fn with_arena(arena: A, config: HeapConfig) -> Self {
    let config = config.normalized();
    Self {
      arena,
      codec: TagCodec::new(config.magic),
      free_lists: FreeLists::new(),
      quick_lists: QuickLists::new(config.quick_list_capacity),
      resident: 0,
      peak_resident: 0,
    }
  }

  #[inline]
  pub(crate) fn layout(&self) -> Blocks {
    Blocks::new(Region::new(self.arena.start(), self.arena.end()), self.codec)
  }

  /// Whether the first page has been installed.
  #[inline]
  pub fn is_initialized(&self) -> bool {
    self.arena.start() != self.arena.end()
  }

  // ===========================================================================
  // Allocate
  // ===========================================================================

  /// Allocate at least `size` bytes, 16-byte aligned.
  ///
  /// Returns `Ok(None)` for a zero-size request. On out-of-memory, pages grown
  /// while searching stay in the heap as one free block.
  pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    if size == 0 {
      return Ok(None);
    }
    let Some(required) = block_size_for(size) else {
      log::warn!("allocation of {size} bytes overflows the block size");
      return Err(AllocError::OutOfMemory);
    };
    if !self.is_initialized() && !self.initialize() {
      log::warn!("cannot grow arena for the first page");
      return Err(AllocError::OutOfMemory);
    }

    if let Some(block) = self.take_quick(required) {
      log::trace!("allocate({size}) -> quick block {block:#x} [{required}]");
      return Ok(Some(self.layout().payload(block)));
    }

    loop {
      let blocks = self.layout();
      if let Some(block) = self.free_lists.find_fit(&blocks, required) {
        self.free_lists.remove(&blocks, block);
        let placed = self.place(block, required);
        log::trace!("allocate({size}) -> block {block:#x} [{placed}]");
        return Ok(Some(blocks.payload(block)));
      }
      if !self.grow() {
        log::warn!(
          "out of memory: {size} bytes requested, arena at {} bytes",
          self.arena_bytes()
        );
        return Err(AllocError::OutOfMemory);
      }
    }
  }

  /// Install the prologue, the first free block and the epilogue on a fresh
  /// page.
  fn initialize(&mut self) -> bool {
    if self.arena.grow().is_none() {
      return false;
    }
    let blocks = self.layout();
    let len = blocks.region.len();
    let size = self.arena.page_size() - SENTINEL_OVERHEAD;
    debug_assert_eq!(len, self.arena.page_size());

    blocks.set_header(PROLOGUE_OFFSET, Tag::allocated(MIN_BLOCK_SIZE, true));
    blocks.set_boundary(FIRST_BLOCK_OFFSET, Tag::free(size, true));
    blocks.set_header(len - WORD, Tag::epilogue(false));
    self.free_lists.insert(&blocks, FIRST_BLOCK_OFFSET, size);

    log::debug!("heap initialized: {len} byte arena, first block {size}");
    true
  }

  fn take_quick(&mut self, required: usize) -> Option<usize> {
    let index = quick_list::index_for(required)?;
    let blocks = self.layout();
    let block = self.quick_lists.pop(&blocks, index)?;
    let tag = blocks.header(block);
    if !tag.allocated || !tag.in_quick_list || tag.size != required {
      fatal(Violation::QuickListMismatch { offset: block });
    }
    blocks.set_header(block, tag.with_quick_list(false));
    self.record_allocation(tag.size);
    Some(block)
  }

  /// Turn the free `block` (already unlinked) into an allocated block of at
  /// least `required` bytes. Returns the final block size.
  fn place(&mut self, block: usize, required: usize) -> usize {
    let blocks = self.layout();
    let tag = blocks.header(block);

    let size = if tag.size - required >= MIN_BLOCK_SIZE {
      let rest = block + required;
      let rest_size = tag.size - required;
      blocks.set_header(block, Tag::allocated(required, tag.prev_allocated));
      blocks.set_boundary(rest, Tag::free(rest_size, true));
      self.free_lists.insert(&blocks, rest, rest_size);
      required
    } else {
      blocks.set_header(block, Tag::allocated(tag.size, tag.prev_allocated));
      blocks.set_prev_allocated(block + tag.size, true);
      tag.size
    };

    self.record_allocation(size);
    size
  }

  /// Extend the arena by one page. The old epilogue becomes the header of the
  /// new free block, which merges with a free block below it.
  fn grow(&mut self) -> bool {
    let epilogue = self.layout().region.len() - WORD;
    if self.arena.grow().is_none() {
      return false;
    }
    let page = self.arena.page_size();
    let blocks = self.layout();
    let len = blocks.region.len();
    debug_assert_eq!(len, epilogue + WORD + page);

    let old = blocks.header(epilogue);
    if old.size != 0 || !old.allocated {
      fatal(Violation::Sentinel { offset: epilogue });
    }
    blocks.set_header(len - WORD, Tag::epilogue(false));

    let mut block = epilogue;
    let mut size = page;
    let mut prev_allocated = old.prev_allocated;
    if !prev_allocated {
      let (prev, prev_tag) = self.free_block_below(&blocks, epilogue);
      self.free_lists.remove(&blocks, prev);
      block = prev;
      size += prev_tag.size;
      prev_allocated = prev_tag.prev_allocated;
    }
    blocks.set_boundary(block, Tag::free(size, prev_allocated));
    self.free_lists.insert(&blocks, block, size);

    log::debug!("arena grown to {len} bytes, free block {block:#x} [{size}]");
    true
  }

  // ===========================================================================
  // Free
  // ===========================================================================

  /// Release the block behind `ptr`.
  ///
  /// `ptr` must be a live payload pointer returned by this heap. Anything else
  /// (null, foreign, already freed, damaged header) aborts the process.
  pub fn free(&mut self, ptr: *mut u8) {
    let block = self.validated(ptr);
    log::trace!("free({ptr:p}) block {block:#x}");
    self.release(block);
  }

  /// Diagnose `ptr` without aborting.
  pub fn check(&self, ptr: *const u8) -> Result<(), Violation> {
    check_pointer(&self.layout(), ptr as usize).map(|_| ())
  }

  fn validated(&self, ptr: *const u8) -> usize {
    match check_pointer(&self.layout(), ptr as usize) {
      Ok(block) => block,
      Err(violation) => fatal(violation),
    }
  }

  /// Hand a validated allocated block back: to its quick list when the size
  /// qualifies, otherwise to the free-list index.
  fn release(&mut self, block: usize) {
    let blocks = self.layout();
    let tag = blocks.header(block);
    self.resident -= tag.size - WORD;

    if let Some(index) = quick_list::index_for(tag.size) {
      if self.quick_lists.is_full(index) {
        self.flush(index);
      }
      // The flush may have freed the block below and cleared our prev bit.
      let tag = blocks.header(block);
      self.quick_lists.push(&blocks, index, block);
      blocks.set_header(block, tag.with_quick_list(true));
      return;
    }

    self.release_free(block, tag.size, tag.prev_allocated);
  }

  /// Empty quick list `index` into the free-list index, coalescing each entry.
  fn flush(&mut self, index: usize) {
    let blocks = self.layout();
    log::debug!(
      "flushing quick list {index} ({} blocks of {})",
      self.quick_lists.len(index),
      quick_list::size_of_index(index)
    );
    while let Some(block) = self.quick_lists.pop(&blocks, index) {
      let tag = blocks.header(block);
      self.release_free(block, tag.size, tag.prev_allocated);
    }
  }

  /// Mark `block` free, tell its successor, then merge with free neighbours.
  fn release_free(&mut self, block: usize, size: usize, prev_allocated: bool) {
    let blocks = self.layout();
    blocks.set_boundary(block, Tag::free(size, prev_allocated));
    blocks.set_prev_allocated(block + size, false);
    self.coalesce(block);
  }

  /// Merge the free, unlinked `block` with its free neighbours and insert the
  /// result.
  fn coalesce(&mut self, block: usize) {
    let blocks = self.layout();
    let tag = blocks.header(block);
    let mut start = block;
    let mut size = tag.size;
    let mut prev_allocated = tag.prev_allocated;

    let next = block + tag.size;
    let next_tag = blocks.header(next);
    if !next_tag.allocated {
      self.free_lists.remove(&blocks, next);
      size += next_tag.size;
    }

    if !prev_allocated && block > FIRST_BLOCK_OFFSET {
      let (prev, prev_tag) = self.free_block_below(&blocks, block);
      self.free_lists.remove(&blocks, prev);
      start = prev;
      size += prev_tag.size;
      prev_allocated = prev_tag.prev_allocated;
    }

    blocks.set_boundary(start, Tag::free(size, prev_allocated));
    self.free_lists.insert(&blocks, start, size);
  }

  /// The free block ending right below `block`, located through its footer.
  fn free_block_below(&self, blocks: &Blocks, block: usize) -> (usize, Tag) {
    let footer = blocks.region.word(block - WORD);
    let tag = blocks.codec.decode(footer);
    let prev = block
      .checked_sub(tag.size)
      .filter(|&prev| tag.is_well_formed() && !tag.allocated && prev >= FIRST_BLOCK_OFFSET);
    match prev {
      Some(prev) if blocks.header_word(prev) == footer => (prev, tag),
      _ => fatal(Violation::PrevFooterMismatch { offset: block }),
    }
  }

  // ===========================================================================
  // Resize
  // ===========================================================================

  /// Resize the allocation behind `ptr` to hold `size` bytes.
  ///
  /// Shrinking and same-size requests keep the pointer; growth moves the data
  /// to a new block. `size == 0` frees and returns `Ok(None)`. If growth
  /// fails the original block is left untouched. An invalid `ptr` aborts.
  pub fn resize(&mut self, ptr: *mut u8, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    let block = self.validated(ptr);
    if size == 0 {
      log::trace!("resize({ptr:p}, 0) -> free");
      self.release(block);
      return Ok(None);
    }

    let tag = self.layout().header(block);
    let required = block_size_for(size).ok_or(AllocError::OutOfMemory)?;

    if required > tag.size {
      let Some(moved) = self.allocate(size)? else {
        return Ok(None);
      };
      let region = self.layout().region;
      let Some(dst) = region.offset_of(moved.as_ptr() as usize) else {
        fatal(Violation::Access { offset: usize::MAX });
      };
      region.copy(block + WORD, dst, tag.size - WORD);
      self.release(block);
      log::trace!("resize({ptr:p}, {size}) -> moved to {moved:p}");
      return Ok(Some(moved));
    }

    let blocks = self.layout();
    if tag.size - required >= MIN_BLOCK_SIZE {
      let rest = block + required;
      let rest_size = tag.size - required;
      blocks.set_header(block, Tag::allocated(required, tag.prev_allocated));
      self.resident -= rest_size;
      self.release_free(rest, rest_size, true);
      log::trace!("resize({ptr:p}, {size}) -> shrunk to {required}, released {rest_size}");
    } else {
      log::trace!("resize({ptr:p}, {size}) -> kept {}", tag.size);
    }
    Ok(Some(blocks.payload(block)))
  }

  // ===========================================================================
  // Statistics
  // ===========================================================================

  fn record_allocation(&mut self, size: usize) {
    self.resident += size - WORD;
    self.peak_resident = self.peak_resident.max(self.resident);
  }

  /// Payload bytes currently handed out.
  pub fn resident_bytes(&self) -> usize {
    self.resident
  }

  /// Highest value [`resident_bytes`](Self::resident_bytes) ever reached.
  pub fn peak_resident_bytes(&self) -> usize {
    self.peak_resident
  }

  /// Current arena size in bytes.
  pub fn arena_bytes(&self) -> usize {
    self.arena.end() as usize - self.arena.start() as usize
  }

  /// Peak resident payload over the current arena size; `0.0` before the
  /// arena is first grown.
  pub fn peak_utilization(&self) -> f64 {
    match self.arena_bytes() {
      0 => 0.0,
      arena => self.peak_resident as f64 / arena as f64,
    }
  }

  /// Usable bytes behind a live payload pointer.
  pub fn payload_size(&self, ptr: *const u8) -> Option<usize> {
    let block = check_pointer(&self.layout(), ptr as usize).ok()?;
    Some(self.layout().header(block).size - WORD)
  }
}
