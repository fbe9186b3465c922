//! Per-thread heap behind a C-style `malloc`/`free`/`realloc` interface, with
//! an `errno`-like side channel for out-of-memory.

use core::{
  cell::{Cell, RefCell},
  ptr::{NonNull, null_mut},
};

use crate::{
  Heap, HeapConfig,
  validate::{Violation, fatal},
};

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static HEAP: RefCell<Heap> = RefCell::new(Heap::new(HeapConfig::from_env()));
  static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Run `f` against this thread's heap.
///
/// # Panics
///
/// Panics if called re-entrantly from inside `f`.
pub fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
  HEAP.with_borrow_mut(f)
}

/// Like [`with_heap`], but yields `R::default()` instead of panicking when
/// the heap is already borrowed or thread-local storage is being torn down.
fn try_with_heap<R: Default>(f: impl FnOnce(&mut Heap) -> R) -> R {
  HEAP
    .try_with(|heap| match heap.try_borrow_mut() {
      Ok(mut heap) => f(&mut *heap),
      Err(_) => R::default(),
    })
    .unwrap_or_default()
}

/// Error code of the last failed call on this thread. `0` when none failed.
pub fn errno() -> i32 {
  ERRNO.try_with(Cell::get).unwrap_or(0)
}

pub fn set_errno(value: i32) {
  let _ = ERRNO.try_with(|errno| errno.set(value));
}

// =============================================================================
// Public API
// =============================================================================

/// Allocate `size` bytes. Null for `size == 0` (errno untouched) or on
/// out-of-memory (errno set to `ENOMEM`).
pub fn malloc(size: usize) -> *mut u8 {
  try_with_heap(|heap| match heap.allocate(size) {
    Ok(ptr) => ptr,
    Err(err) => {
      set_errno(err.errno());
      None
    }
  })
  .map_or(null_mut(), NonNull::as_ptr)
}

/// Release a block returned by [`malloc`] or [`realloc`]. Aborts on an invalid
/// pointer, or when called while the heap is already borrowed.
pub fn free(ptr: *mut u8) {
  let _ = HEAP.try_with(|heap| match heap.try_borrow_mut() {
    Ok(mut heap) => heap.free(ptr),
    Err(_) => fatal(Violation::Reentrant),
  });
}

/// Resize a block. Aborts on an invalid pointer; null for `size == 0` (the
/// block is freed) or on out-of-memory (the block is kept, errno set).
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  try_with_heap(|heap| match heap.resize(ptr, size) {
    Ok(ptr) => ptr,
    Err(err) => {
      set_errno(err.errno());
      None
    }
  })
  .map_or(null_mut(), NonNull::as_ptr)
}

/// Peak utilization of this thread's heap.
pub fn utilization() -> f64 {
  try_with_heap(|heap| heap.peak_utilization())
}

// =============================================================================
// C API
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn segmalloc_malloc(size: usize) -> *mut u8 {
  malloc(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn segmalloc_free(ptr: *mut u8) {
  free(ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn segmalloc_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  realloc(ptr, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn segmalloc_utilization() -> f64 {
  utilization()
}
