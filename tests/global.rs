//! The program break is process-wide, so everything touching the global heap
//! lives in a single test.

use std::alloc::{GlobalAlloc, Layout};
use std::mem::size_of;
use std::ptr;

use firstfit::{Allocator, MMAP_THRESHOLD, allocate, global_stats, release};

const WORD: usize = size_of::<usize>();

#[test]
fn process_wide_heap() {
  assert!(allocate(0).is_null());
  unsafe { release(ptr::null_mut()) };

  // Heap path.
  let small = allocate(100);
  assert!(!small.is_null());
  assert_eq!(small as usize % WORD, 0);
  unsafe { ptr::write_bytes(small, 0x42, 100) };

  // Mapping path.
  let mapped_before = global_stats().mapped_blocks;
  let large = allocate(MMAP_THRESHOLD);
  assert!(!large.is_null());
  assert_eq!(large as usize % WORD, 0);
  assert_eq!(global_stats().mapped_blocks, mapped_before + 1);
  unsafe {
    ptr::write_bytes(large, 0x24, MMAP_THRESHOLD);
    assert_eq!(large.add(MMAP_THRESHOLD - 1).read(), 0x24);
    release(large);
  }
  assert_eq!(global_stats().mapped_blocks, mapped_before);

  assert_eq!(unsafe { small.add(99).read() }, 0x42);
  unsafe { release(small) };

  let reused = allocate(64);
  assert_eq!(reused, small);
  unsafe { release(reused) };

  // GlobalAlloc facade.
  let a = Allocator;
  let layout = Layout::from_size_align(48, 8).unwrap();
  unsafe {
    let p = a.alloc(layout);
    assert!(!p.is_null());
    for i in 0..48 {
      p.add(i).write(i as u8);
    }

    let grown = a.realloc(p, layout, 4096);
    assert!(!grown.is_null());
    for i in 0..48 {
      assert_eq!(grown.add(i).read(), i as u8);
    }
    a.dealloc(grown, Layout::from_size_align(4096, 8).unwrap());

    let z = a.alloc_zeroed(layout);
    assert!(!z.is_null());
    assert!((0..48).all(|i| z.add(i).read() == 0));
    a.dealloc(z, layout);

    assert!(a.alloc(Layout::from_size_align(64, 64).unwrap()).is_null());
  }

  let stats = global_stats();
  assert!(stats.allocations >= stats.releases);
  assert!(stats.heap_extensions >= 1);
}
