//! Page providers backing a [`Heap`](crate::Heap).
//!
//! The heap only ever asks for one more page at the top of its arena. Both
//! providers reserve the whole `max_pages` range up front (lazily, on the
//! first grow) so the arena stays contiguous, then hand it out page by page.

use core::ptr::{NonNull, null_mut};
use std::alloc::{self, Layout};

use crate::{ALIGNMENT, PAGE_SIZE};

/// Source of arena pages.
pub trait PageSource {
  /// Extend the arena by exactly one page. Returns the bounds of the new page,
  /// or `None` once no more memory can be handed out. A failed grow leaves
  /// `start`/`end` unchanged.
  fn grow(&mut self) -> Option<(*mut u8, *mut u8)>;

  /// Lowest arena address.
  fn start(&self) -> *mut u8;

  /// One past the highest arena address. Equal to `start` before the first grow.
  fn end(&self) -> *mut u8;

  /// Bytes added by each successful grow.
  fn page_size(&self) -> usize {
    PAGE_SIZE
  }
}

/// Platform default page provider.
#[cfg(unix)]
pub type SystemArena = MmapArena;
#[cfg(not(unix))]
pub type SystemArena = BufferArena;

// =============================================================================
// mmap
// =============================================================================

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Arena carved out of one anonymous `mmap` reservation.
#[cfg(unix)]
pub struct MmapArena {
  base: *mut u8,
  max_pages: usize,
  pages: usize,
}

#[cfg(unix)]
impl MmapArena {
  pub const fn new(max_pages: usize) -> Self {
    Self {
      base: null_mut(),
      max_pages,
      pages: 0,
    }
  }

  pub const fn max_pages(&self) -> usize {
    self.max_pages
  }

  fn reserve(&mut self) -> bool {
    let Some(size) = self.max_pages.checked_mul(PAGE_SIZE).filter(|&size| size > 0) else {
      return false;
    };
    let base = unsafe { os_mmap(size) };
    if base.is_null() {
      log::warn!("mmap of {size} bytes failed");
      return false;
    }
    self.base = base;
    true
  }
}

#[cfg(unix)]
impl PageSource for MmapArena {
  fn grow(&mut self) -> Option<(*mut u8, *mut u8)> {
    if self.pages >= self.max_pages {
      return None;
    }
    if self.base.is_null() && !self.reserve() {
      return None;
    }
    let start = self.end();
    self.pages += 1;
    Some((start, self.end()))
  }

  fn start(&self) -> *mut u8 {
    self.base
  }

  fn end(&self) -> *mut u8 {
    self.base.wrapping_add(self.pages * PAGE_SIZE)
  }
}

#[cfg(unix)]
impl Drop for MmapArena {
  fn drop(&mut self) {
    if !self.base.is_null() {
      unsafe { os_munmap(self.base, self.max_pages * PAGE_SIZE) };
    }
  }
}

// =============================================================================
// Buffer
// =============================================================================

/// Arena backed by a single buffer from the global allocator.
pub struct BufferArena {
  buffer: Option<NonNull<u8>>,
  max_pages: usize,
  pages: usize,
}

impl BufferArena {
  pub const fn new(max_pages: usize) -> Self {
    Self {
      buffer: None,
      max_pages,
      pages: 0,
    }
  }

  pub const fn max_pages(&self) -> usize {
    self.max_pages
  }

  fn layout(&self) -> Option<Layout> {
    let size = self.max_pages.checked_mul(PAGE_SIZE)?;
    Layout::from_size_align(size, ALIGNMENT).ok()
  }

  fn base(&self) -> *mut u8 {
    self.buffer.map_or(null_mut(), NonNull::as_ptr)
  }
}

impl PageSource for BufferArena {
  fn grow(&mut self) -> Option<(*mut u8, *mut u8)> {
    if self.pages >= self.max_pages {
      return None;
    }
    if self.buffer.is_none() {
      let layout = self.layout()?;
      // SAFETY: `max_pages > pages >= 0`, so the layout is non-zero sized.
      self.buffer = Some(NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?);
    }
    let start = self.end();
    self.pages += 1;
    Some((start, self.end()))
  }

  fn start(&self) -> *mut u8 {
    self.base()
  }

  fn end(&self) -> *mut u8 {
    self.base().wrapping_add(self.pages * PAGE_SIZE)
  }
}

impl Drop for BufferArena {
  fn drop(&mut self) {
    if let (Some(buffer), Some(layout)) = (self.buffer, self.layout()) {
      unsafe { alloc::dealloc(buffer.as_ptr(), layout) };
    }
  }
}
