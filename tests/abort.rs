//! Misuse must abort the process. Each scenario runs in a child copy of this
//! test binary, selected through `SEGMALLOC_ABORT_SCENARIO`.
#![cfg(unix)]

use std::{os::unix::process::ExitStatusExt, process::Command};

use segmalloc::{
  Heap, HeapConfig,
  tag::{DEFAULT_MAGIC, Tag, TagCodec},
};

const SCENARIO_VAR: &str = "SEGMALLOC_ABORT_SCENARIO";
const CODEC: TagCodec = TagCodec::new(DEFAULT_MAGIC);

fn alloc(heap: &mut Heap, size: usize) -> *mut u8 {
  heap.allocate(size).unwrap().unwrap().as_ptr()
}

fn header(ptr: *mut u8) -> *mut u64 {
  unsafe { ptr.sub(8).cast::<u64>() }
}

fn run_scenario(name: &str) {
  let mut heap = Heap::new(HeapConfig::default());
  match name {
    "null" => {
      alloc(&mut heap, 8);
      heap.free(core::ptr::null_mut());
    }
    "arena_start" => {
      let ptr = alloc(&mut heap, 8);
      let info = heap.block_info(ptr).unwrap();
      heap.free(unsafe { ptr.sub(info.payload_offset()) });
    }
    "arena_end" => {
      let ptr = alloc(&mut heap, 8);
      let info = heap.block_info(ptr).unwrap();
      let start = unsafe { ptr.sub(info.payload_offset()) };
      heap.free(unsafe { start.add(heap.arena_bytes()) });
    }
    "zeroed_header" => {
      let ptr = alloc(&mut heap, 8);
      unsafe { header(ptr).write(DEFAULT_MAGIC) };
      heap.free(ptr);
    }
    "zeroed_word" => {
      let ptr = alloc(&mut heap, 8);
      unsafe { header(ptr).write(0) };
      heap.free(ptr);
    }
    "reentrant_free" => {
      let ptr = segmalloc::malloc(64);
      segmalloc::with_heap(|_| segmalloc::free(ptr));
    }
    "cleared_alloc_bit" => {
      let ptr = alloc(&mut heap, 8);
      let tag = CODEC.decode(unsafe { header(ptr).read() });
      unsafe { header(ptr).write(CODEC.encode(Tag::free(tag.size, tag.prev_allocated))) };
      heap.free(ptr);
    }
    "cleared_prev_bit" => {
      let ptr = alloc(&mut heap, 8);
      let tag = CODEC.decode(unsafe { header(ptr).read() });
      unsafe {
        header(ptr).write(CODEC.encode(tag.with_prev_allocated(false)));
        // The word below the header now poses as an allocated footer.
        ptr.sub(16).cast::<u64>().write(CODEC.encode(Tag::allocated(32, true)));
      }
      heap.free(ptr);
    }
    "double_free" => {
      let ptr = alloc(&mut heap, 200);
      alloc(&mut heap, 200);
      heap.free(ptr);
      heap.free(ptr);
    }
    "quick_double_free" => {
      let ptr = alloc(&mut heap, 8);
      heap.free(ptr);
      heap.free(ptr);
    }
    "resize_misaligned" => {
      let ptr = alloc(&mut heap, 64);
      let _ = heap.resize(unsafe { ptr.add(1) }, 128);
    }
    "resize_freed" => {
      let ptr = alloc(&mut heap, 300);
      heap.free(ptr);
      let _ = heap.resize(ptr, 10);
    }
    other => panic!("unknown scenario {other}"),
  }
}

/// Entry point for the child process; a no-op in a normal test run.
#[test]
fn scenario_driver() {
  let Ok(name) = std::env::var(SCENARIO_VAR) else {
    return;
  };
  run_scenario(&name);
  panic!("scenario {name} returned instead of aborting");
}

#[track_caller]
fn assert_aborts(scenario: &str, message: &str) {
  let output = Command::new(std::env::current_exe().unwrap())
    .args(["--exact", "scenario_driver", "--nocapture", "--test-threads=1"])
    .env(SCENARIO_VAR, scenario)
    .output()
    .expect("failed to spawn test binary");

  let stderr = String::from_utf8_lossy(&output.stderr);
  assert_eq!(
    output.status.signal(),
    Some(libc::SIGABRT),
    "{scenario} did not abort: {stderr}"
  );
  assert!(stderr.contains("segmalloc: fatal:"), "{scenario}: {stderr}");
  assert!(stderr.contains(message), "{scenario}: {stderr}");
}

#[test]
fn test_free_null() {
  assert_aborts("null", "null pointer");
}

#[test]
fn test_free_arena_start() {
  assert_aborts("arena_start", "is outside the heap");
}

#[test]
fn test_free_arena_end() {
  assert_aborts("arena_end", "is outside the heap");
}

#[test]
fn test_free_zeroed_header() {
  assert_aborts("zeroed_header", "malformed header at offset 0x28");
}

#[test]
fn test_free_zeroed_header_word() {
  // A literal zero decodes to the magic's size bits, far past the epilogue.
  assert_aborts("zeroed_word", "overruns the heap");
}

#[test]
fn test_reentrant_free() {
  assert_aborts("reentrant_free", "heap re-entered while in use");
}

#[test]
fn test_free_cleared_alloc_bit() {
  assert_aborts("cleared_alloc_bit", "block at offset 0x28 is not allocated");
}

#[test]
fn test_free_cleared_prev_bit() {
  assert_aborts("cleared_prev_bit", "inconsistent previous footer");
}

#[test]
fn test_double_free() {
  assert_aborts("double_free", "block at offset 0x28 is not allocated");
}

#[test]
fn test_double_free_quick_block() {
  assert_aborts("quick_double_free", "already in a quick list");
}

#[test]
fn test_resize_misaligned() {
  assert_aborts("resize_misaligned", "is not 16-byte aligned");
}

#[test]
fn test_resize_freed() {
  assert_aborts("resize_freed", "is not allocated");
}
