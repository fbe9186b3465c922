//! A segregated free-list allocator with boundary-tag coalescing.
//!
//! The heap manages one contiguous arena that grows a page at a time. Every
//! block starts with an 8-byte tag (size plus status bits, XOR-ed with a
//! magic word); free blocks repeat the tag in their last word so neighbours
//! can be merged in both directions.
//!
//! ```text
//!  start                                                          end
//!  | pad | prologue |  block  |  block  | ... |  block  | epilogue |
//!    8       32        >=32      >=32             >=32       8
//! ```
//!
//! Free blocks live in ten size-class lists (LIFO, first fit). Small blocks
//! of exactly 32, 48, ..., 176 bytes are parked in bounded LIFO quick lists
//! on free and handed straight back on the next request of that size.
//!
//! Misuse of `free`/`resize` (foreign pointers, double frees, damaged
//! headers) aborts the process after printing a diagnostic.

pub mod arena;
mod block;
pub mod config;
mod free_list;
mod global;
mod heap;
mod inspect;
pub mod quick_list;
pub mod tag;
mod validate;

pub use config::HeapConfig;
pub use free_list::class_for;
pub use global::{errno, free, malloc, realloc, set_errno, utilization, with_heap};
#[cfg(feature = "c_api")]
pub use global::{segmalloc_free, segmalloc_malloc, segmalloc_realloc, segmalloc_utilization};
pub use heap::{AllocError, Heap, block_size_for};
pub use inspect::{BlockInfo, BlockIter};
pub use validate::Violation;

// =============================================================================
// Constants
// =============================================================================

/// Boundary tag and link size.
pub const WORD: usize = 8;
/// Payload alignment; every block size is a multiple of it.
pub const ALIGNMENT: usize = 16;
/// Smallest block: header, two links, footer.
pub const MIN_BLOCK_SIZE: usize = 32;
/// Arena growth granule.
pub const PAGE_SIZE: usize = 8192;
/// Default arena limit, in pages.
pub const DEFAULT_MAX_PAGES: usize = 20;

pub const NUM_FREE_LISTS: usize = 10;
pub const NUM_QUICK_LISTS: usize = 10;
/// Default entries per quick list before it is flushed.
pub const QUICK_LIST_CAPACITY: usize = 5;

/// Prologue header, after the 8-byte alignment pad.
pub const PROLOGUE_OFFSET: usize = WORD;
/// Header of the first real block.
pub const FIRST_BLOCK_OFFSET: usize = PROLOGUE_OFFSET + MIN_BLOCK_SIZE;
/// Bytes of each arena taken by the pad, the prologue and the epilogue.
pub const SENTINEL_OVERHEAD: usize = FIRST_BLOCK_OFFSET + WORD;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(WORD == size_of::<u64>());
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const _: () = assert!(MIN_BLOCK_SIZE >= 4 * WORD);
const _: () = assert!(PAGE_SIZE % ALIGNMENT == 0);
const _: () = assert!((FIRST_BLOCK_OFFSET + WORD) % ALIGNMENT == 0);
const _: () = assert!(SENTINEL_OVERHEAD == 48);
const _: () = assert!(PAGE_SIZE - SENTINEL_OVERHEAD >= MIN_BLOCK_SIZE);
const _: () = assert!(quick_list::MAX_QUICK_BLOCK_SIZE == 176);
const _: () = assert!(class_for(PAGE_SIZE - SENTINEL_OVERHEAD) < NUM_FREE_LISTS);
const _: () = assert!(QUICK_LIST_CAPACITY >= 1);
