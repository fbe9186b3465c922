use core::ffi::CStr;

use crate::{DEFAULT_MAX_PAGES, QUICK_LIST_CAPACITY, tag::DEFAULT_MAGIC};

const MAX_PAGES_VAR: &CStr = c"SEGMALLOC_MAX_PAGES";
const MAGIC_VAR: &CStr = c"SEGMALLOC_MAGIC";
const QUICK_LIST_CAPACITY_VAR: &CStr = c"SEGMALLOC_QUICK_LIST_CAPACITY";

/// Tunables for a [`Heap`](crate::Heap).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Upper bound on arena growth, in pages.
  pub max_pages: usize,
  /// XOR key applied to every boundary tag.
  pub magic: u64,
  /// Entries per quick list before a flush. Never below 1.
  pub quick_list_capacity: usize,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      max_pages: DEFAULT_MAX_PAGES,
      magic: DEFAULT_MAGIC,
      quick_list_capacity: QUICK_LIST_CAPACITY,
    }
  }
}

impl HeapConfig {
  /// Defaults overridden by `SEGMALLOC_MAX_PAGES`, `SEGMALLOC_MAGIC` and
  /// `SEGMALLOC_QUICK_LIST_CAPACITY`.
  ///
  /// Reads the environment through `getenv` without allocating, so it is safe
  /// to call while the heap itself serves as the process allocator.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| {
      // SAFETY: the key is NUL-terminated; the value is copied out before any
      // further environment access on this path.
      let value = unsafe { libc::getenv(key.as_ptr()) };
      (!value.is_null()).then(|| unsafe { CStr::from_ptr(value) }.to_bytes())
    })
  }

  fn from_lookup<'a>(lookup: impl Fn(&CStr) -> Option<&'a [u8]>) -> Self {
    let mut config = Self::default();
    let read = |key: &CStr| {
      let raw = lookup(key)?;
      let parsed = parse_number(raw);
      if parsed.is_none() {
        log::warn!(
          "ignoring malformed {}={}",
          key.to_string_lossy(),
          String::from_utf8_lossy(raw)
        );
      }
      parsed
    };

    if let Some(pages) = read(MAX_PAGES_VAR) {
      config.max_pages = usize::try_from(pages).unwrap_or(usize::MAX);
    }
    if let Some(magic) = read(MAGIC_VAR) {
      config.magic = magic;
    }
    if let Some(capacity) = read(QUICK_LIST_CAPACITY_VAR) {
      config.quick_list_capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
    }
    config.normalized()
  }

  /// Clamp fields into their accepted ranges.
  pub fn normalized(self) -> Self {
    Self {
      quick_list_capacity: self.quick_list_capacity.max(1),
      ..self
    }
  }
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_number(raw: &[u8]) -> Option<u64> {
  let (digits, radix) = match raw {
    [b'0', b'x' | b'X', rest @ ..] => (rest, 16),
    _ => (raw, 10),
  };
  if digits.is_empty() {
    return None;
  }
  digits.iter().try_fold(0u64, |acc, &byte| {
    let digit = (byte as char).to_digit(radix)?;
    acc.checked_mul(radix as u64)?.checked_add(digit as u64)
  })
}
