//! # firstfit
//!
//! A first-fit free-list allocator over the program break, with direct
//! anonymous mappings for large requests.
//!
//! ```text
//!   Heap blocks (sbrk), linked in address order:
//!
//!   ┌────────┬──────────────┬────────┬─────────┬────────┬──────────────┐
//!   │ header │ payload (64) │ header │ free(8) │ header │ payload (64) │ ← break
//!   └────────┴──────────────┴────────┴─────────┴────────┴──────────────┘
//!             ▲
//!             └── pointer returned to the caller
//!
//!   Large blocks (mmap), never linked:
//!
//!   ┌────────┬─────────────────────────────────────────┐
//!   │ header │ payload (>= MMAP_THRESHOLD)             │
//!   └────────┴─────────────────────────────────────────┘
//! ```
//!
//! A [`Heap`] owns its free list and is single-threaded. The free functions
//! [`allocate`] / [`release`] and the [`Allocator`] global allocator share
//! one process-wide heap behind a spinlock.

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  fmt::{self, Write},
  hint,
  iter::FusedIterator,
  marker::PhantomData,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Machine word. Every payload size and payload address is a multiple of it.
const WORD: usize = size_of::<usize>();

/// Requests of at least this many bytes are served by `mmap` instead of the
/// free list.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// Bytes of metadata in front of every payload.
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest remainder worth carving off: a header plus one word of payload.
const MIN_SPLIT_REMAINDER: usize = BLOCK_HEADER_SIZE + WORD;

/// Header tag of a block handed out to a caller.
const TAG_LIVE: u32 = 0x4C49_5645; // "LIVE"
/// Header tag of a block owned by the free list.
const TAG_FREE: u32 = 0x4652_4545; // "FREE"

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(WORD.is_power_of_two());
const _: () = assert!(BLOCK_HEADER_SIZE % WORD == 0);
const _: () = assert!(MMAP_THRESHOLD % WORD == 0);
const _: () = assert!(MMAP_THRESHOLD > MIN_SPLIT_REMAINDER);
const _: () = assert!(TAG_LIVE != TAG_FREE);

// =============================================================================
// Errors
// =============================================================================

/// Why an allocation request produced no memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("zero-size allocation request")]
  ZeroSize,
  #[error("request of {requested} bytes overflows the address space")]
  SizeOverflow { requested: usize },
  #[error("heap growth of {requested} bytes refused")]
  HeapExhausted { requested: usize },
  #[error("anonymous mapping of {requested} bytes refused")]
  MapFailed { requested: usize },
}

/// Why a pointer could not be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
  #[error("release(): {addr:#x} was not returned by allocate")]
  ForeignPointer { addr: usize },
  #[error("release(): double release of {addr:#x}")]
  DoubleRelease { addr: usize },
}

/// A broken free-list invariant, reported by [`Heap::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityError {
  #[error("block {addr:#x} is out of address order")]
  Unordered { addr: usize },
  #[error("block {addr:#x} overlaps its successor")]
  Overlap { addr: usize },
  #[error("block {addr:#x} carries tag {tag:#x} with free={free}")]
  BadTag { addr: usize, tag: u32, free: bool },
  #[error("mapped block {addr:#x} is linked into the free list")]
  MappedInList { addr: usize },
  #[error("block {addr:#x} is not word aligned")]
  Misaligned { addr: usize },
}

// =============================================================================
// Types
// =============================================================================

/// Block metadata. Sits immediately before the payload it describes.
#[repr(C)]
struct BlockHeader {
  /// Payload capacity in bytes, header excluded.
  size: usize,
  /// Next heap block in address order. Always null for mapped blocks.
  next: *mut BlockHeader,
  /// `TAG_LIVE` or `TAG_FREE`, mirrors `free`.
  tag: u32,
  free: bool,
  /// Obtained from `mmap`; released with `munmap`, never listed.
  mapped: bool,
}

impl BlockHeader {
  /// Writes a fresh unlinked header at `at`.
  #[inline]
  unsafe fn init(at: *mut u8, size: usize, free: bool, mapped: bool) -> *mut BlockHeader {
    let block = at.cast::<BlockHeader>();
    unsafe {
      block.write(BlockHeader {
        size,
        next: null_mut(),
        tag: if free { TAG_FREE } else { TAG_LIVE },
        free,
        mapped,
      });
    }
    block
  }

  #[inline]
  fn payload(block: *mut BlockHeader) -> *mut u8 {
    block.cast::<u8>().wrapping_add(BLOCK_HEADER_SIZE)
  }

  #[inline]
  fn from_payload(ptr: *mut u8) -> *mut BlockHeader {
    ptr.wrapping_sub(BLOCK_HEADER_SIZE).cast()
  }

  /// One past the last payload byte.
  #[inline]
  unsafe fn end(block: *mut BlockHeader) -> *mut u8 {
    Self::payload(block).wrapping_add(unsafe { (*block).size })
  }

  /// Whether `right` starts exactly where `left` ends.
  #[inline]
  unsafe fn adjacent(left: *mut BlockHeader, right: *mut BlockHeader) -> bool {
    unsafe { Self::end(left) == right.cast::<u8>() }
  }

  #[inline]
  unsafe fn set_free(block: *mut BlockHeader, free: bool) {
    unsafe {
      (*block).free = free;
      (*block).tag = if free { TAG_FREE } else { TAG_LIVE };
    }
  }
}

/// Snapshot of one heap block, yielded by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Address right after the header.
  pub payload: *mut u8,
  /// Payload capacity in bytes.
  pub size: usize,
  pub free: bool,
}

/// Counters kept by every [`Heap`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
  /// Successful allocations, both paths.
  pub allocations: u64,
  /// Successful non-null releases, both paths.
  pub releases: u64,
  /// Times the heap was grown through the backend.
  pub heap_extensions: u64,
  /// Free blocks carved in two.
  pub splits: u64,
  /// Neighbour merges performed on release.
  pub merges: u64,
  /// Bytes obtained by heap growth, headers included. Never shrinks.
  pub heap_bytes: usize,
  /// Mapped blocks currently live.
  pub mapped_blocks: usize,
  /// Bytes currently mapped, headers included.
  pub mapped_bytes: usize,
}

impl HeapStats {
  const fn new() -> Self {
    Self {
      allocations: 0,
      releases: 0,
      heap_extensions: 0,
      splits: 0,
      merges: 0,
      heap_bytes: 0,
      mapped_blocks: 0,
      mapped_bytes: 0,
    }
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
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

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Moves the program break by `increment` bytes and returns the old break.
unsafe fn os_sbrk(increment: libc::intptr_t) -> *mut u8 {
  let old = unsafe { libc::sbrk(increment) };
  if old == usize::MAX as *mut libc::c_void {
    null_mut()
  } else {
    old as *mut u8
  }
}

// =============================================================================
// Backends
// =============================================================================

/// Memory source of a [`Heap`].
///
/// # Safety
///
/// `grow` must return memory valid for reads and writes of `increment` bytes,
/// word aligned whenever `increment` is a multiple of the word, and owned by
/// the backend for as long as it lives. `map` must return such memory for
/// `len` bytes, valid until it is passed back to `unmap` with the same `len`.
pub unsafe trait Backend {
  /// Extends the heap by `increment` bytes. `None` when growth is refused.
  fn grow(&mut self, increment: usize) -> Option<NonNull<u8>>;

  /// Obtains a standalone region of `len` bytes.
  fn map(&mut self, len: usize) -> Option<NonNull<u8>>;

  /// Returns a region obtained from [`Backend::map`].
  unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize);
}

/// The process program break (`sbrk`) and anonymous mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct Os;

unsafe impl Backend for Os {
  fn grow(&mut self, increment: usize) -> Option<NonNull<u8>> {
    grow_aligned(|delta| unsafe { os_sbrk(delta) }, increment)
  }

  fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { os_mmap(len) })
  }

  unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) {
    unsafe { os_munmap(ptr.as_ptr(), len) };
  }
}

/// Moves a break through `sbrk` by `increment` bytes and returns the start of
/// the new, word-aligned bytes.
///
/// Other code may leave the break unaligned, so it is padded once and later
/// growth starts aligned again. If the pad is refused the increment is handed
/// back and the break ends where it started.
fn grow_aligned(
  mut sbrk: impl FnMut(libc::intptr_t) -> *mut u8,
  increment: usize,
) -> Option<NonNull<u8>> {
  let delta = libc::intptr_t::try_from(increment).ok()?;
  let raw = NonNull::new(sbrk(delta))?;

  let addr = raw.as_ptr() as usize;
  let pad = align_up(addr, WORD) - addr;
  if pad != 0 && sbrk(pad as libc::intptr_t).is_null() {
    sbrk(-delta);
    return None;
  }

  NonNull::new(raw.as_ptr().wrapping_add(pad))
}

/// A fixed-size private mapping that stands in for the program break.
///
/// Growth bumps a cursor through the reservation and fails once it is used
/// up. Large requests still go to `mmap`.
pub struct Region {
  base: NonNull<u8>,
  capacity: usize,
  brk: usize,
}

impl Region {
  /// Reserves `capacity` bytes. `None` if the mapping is refused.
  pub fn new(capacity: usize) -> Option<Self> {
    if capacity == 0 {
      return None;
    }

    let base = NonNull::new(unsafe { os_mmap(capacity) })?;
    Some(Self {
      base,
      capacity,
      brk: 0,
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes handed out by growth so far.
  pub fn used(&self) -> usize {
    self.brk
  }

  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.capacity
  }
}

unsafe impl Backend for Region {
  fn grow(&mut self, increment: usize) -> Option<NonNull<u8>> {
    if increment > self.capacity - self.brk {
      return None;
    }

    let ptr = unsafe { self.base.add(self.brk) };
    self.brk += increment;
    Some(ptr)
  }

  fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { os_mmap(len) })
  }

  unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) {
    unsafe { os_munmap(ptr.as_ptr(), len) };
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.capacity) };
  }
}

// =============================================================================
// Heap
// =============================================================================

/// A first-fit allocator instance.
///
/// Owns the head of an address-ordered list of heap blocks. The heap
/// boundary lives in the backend. Nothing is returned to the backend except
/// mapped blocks.
pub struct Heap<B: Backend = Os> {
  backend: B,
  head: *mut BlockHeader,
  stats: HeapStats,
}

impl Heap<Os> {
  /// A heap over the process break.
  pub const fn new() -> Self {
    Self::with_backend(Os)
  }
}

impl Default for Heap<Os> {
  fn default() -> Self {
    Self::new()
  }
}

impl<B: Backend> Heap<B> {
  pub const fn with_backend(backend: B) -> Self {
    Self {
      backend,
      head: null_mut(),
      stats: HeapStats::new(),
    }
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  pub fn stats(&self) -> HeapStats {
    self.stats
  }

  /// Walks the heap blocks in address order. Mapped blocks are not listed.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      current: self.head,
      _heap: PhantomData,
    }
  }

  /// Allocates `size` bytes, word aligned. Null on a zero-size request or
  /// when the backend refuses memory.
  #[must_use]
  pub fn allocate(&mut self, size: usize) -> *mut u8 {
    self
      .try_allocate(size)
      .map_or(null_mut(), NonNull::as_ptr)
  }

  pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }

    let rounded = checked_align_up(size, WORD).ok_or(AllocError::SizeOverflow { requested: size })?;

    // Routed on the requested size so that anything below the threshold
    // stays on the heap even when rounding reaches it.
    let block = if size >= MMAP_THRESHOLD {
      self.map_block(rounded)?
    } else {
      self.heap_block(rounded)?
    };

    self.stats.allocations += 1;
    self.tripwire();

    Ok(unsafe { NonNull::new_unchecked(BlockHeader::payload(block)) })
  }

  /// Like [`Heap::allocate`], with the payload zero-filled.
  #[must_use]
  pub fn allocate_zeroed(&mut self, size: usize) -> *mut u8 {
    let ptr = self.allocate(size);
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, size) };
    }
    ptr
  }

  /// Releases `ptr`. Null is a no-op. A pointer whose header does not carry a
  /// live tag aborts the process with a message on stderr.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or come from `allocate` on this heap, unmodified.
  pub unsafe fn release(&mut self, ptr: *mut u8) {
    if let Err(err) = unsafe { self.try_release(ptr) } {
      fatal(&err);
    }
  }

  /// Releases `ptr`, reporting invalid and repeated releases instead of
  /// aborting.
  ///
  /// Detection reads the header in front of `ptr`, so it is best effort: a
  /// released mapped block is gone, and a released heap header may have been
  /// reused since.
  ///
  /// # Safety
  ///
  /// The header bytes in front of `ptr` must be readable.
  pub unsafe fn try_release(&mut self, ptr: *mut u8) -> Result<(), ReleaseError> {
    if ptr.is_null() {
      return Ok(());
    }

    if cfg!(not(feature = "trusted-free")) {
      unsafe { check_live(ptr)? };
    }

    let block = BlockHeader::from_payload(ptr);
    unsafe {
      if (*block).mapped {
        let len = (*block).size + BLOCK_HEADER_SIZE;
        self.stats.mapped_blocks = self.stats.mapped_blocks.saturating_sub(1);
        self.stats.mapped_bytes = self.stats.mapped_bytes.saturating_sub(len);
        self.backend.unmap(NonNull::new_unchecked(block.cast()), len);
      } else {
        BlockHeader::set_free(block, true);
        self.coalesce(block);
      }
    }

    self.stats.releases += 1;
    self.tripwire();
    Ok(())
  }

  /// Resizes the allocation at `ptr`, C `realloc` style.
  ///
  /// Null allocates, zero releases and returns null. The same pointer comes
  /// back when the block already holds `new_size` bytes and the request
  /// belongs to the same path; otherwise the contents move to a new block.
  ///
  /// # Safety
  ///
  /// Same contract as [`Heap::release`].
  #[must_use]
  pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.allocate(new_size);
    }

    if new_size == 0 {
      unsafe { self.release(ptr) };
      return null_mut();
    }

    let block = BlockHeader::from_payload(ptr);
    let (old_size, mapped) = unsafe { ((*block).size, (*block).mapped) };
    if new_size <= old_size && mapped == (new_size >= MMAP_THRESHOLD) {
      return ptr;
    }

    let new_ptr = self.allocate(new_size);
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        self.release(ptr);
      }
    }

    new_ptr
  }

  /// Payload capacity of the live allocation at `ptr`; 0 for null.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer from this heap.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    unsafe { (*BlockHeader::from_payload(ptr)).size }
  }

  /// Checks the free-list invariants: address order, no overlap, word
  /// alignment, tags matching the free flag, no mapped block linked.
  pub fn verify(&self) -> Result<(), IntegrityError> {
    let mut prev: *mut BlockHeader = null_mut();
    let mut current = self.head;

    while !current.is_null() {
      let addr = current as usize;
      unsafe {
        if addr % WORD != 0 || (*current).size % WORD != 0 {
          return Err(IntegrityError::Misaligned { addr });
        }
        if (*current).mapped {
          return Err(IntegrityError::MappedInList { addr });
        }

        let free = (*current).free;
        let tag = (*current).tag;
        let expected = if free { TAG_FREE } else { TAG_LIVE };
        if tag != expected {
          return Err(IntegrityError::BadTag { addr, tag, free });
        }

        if !prev.is_null() {
          if addr <= prev as usize {
            return Err(IntegrityError::Unordered { addr });
          }
          if BlockHeader::end(prev) as usize > addr {
            return Err(IntegrityError::Overlap {
              addr: prev as usize,
            });
          }
        }

        prev = current;
        current = (*current).next;
      }
    }

    Ok(())
  }

  fn map_block(&mut self, size: usize) -> Result<*mut BlockHeader, AllocError> {
    let len = size
      .checked_add(BLOCK_HEADER_SIZE)
      .ok_or(AllocError::SizeOverflow { requested: size })?;
    let raw = self
      .backend
      .map(len)
      .ok_or(AllocError::MapFailed { requested: len })?;

    self.stats.mapped_blocks += 1;
    self.stats.mapped_bytes += len;

    Ok(unsafe { BlockHeader::init(raw.as_ptr(), size, false, true) })
  }

  fn heap_block(&mut self, size: usize) -> Result<*mut BlockHeader, AllocError> {
    if self.head.is_null() {
      let block = self.extend_heap(null_mut(), size)?;
      self.head = block;
      return Ok(block);
    }

    match self.find_free(size) {
      (Some(block), _) => unsafe {
        self.split(block, size);
        BlockHeader::set_free(block, false);
        Ok(block)
      },
      (None, last) => self.extend_heap(last, size),
    }
  }

  /// Grows the heap by one block of `size` payload bytes and links it after
  /// `last`, if any.
  fn extend_heap(
    &mut self,
    last: *mut BlockHeader,
    size: usize,
  ) -> Result<*mut BlockHeader, AllocError> {
    let total = size + BLOCK_HEADER_SIZE;
    let raw = self
      .backend
      .grow(total)
      .ok_or(AllocError::HeapExhausted { requested: total })?;

    debug_assert!(
      raw.as_ptr() as usize % WORD == 0,
      "extend_heap: backend returned misaligned {:p} for {} bytes",
      raw,
      total
    );

    let block = unsafe { BlockHeader::init(raw.as_ptr(), size, false, false) };
    if !last.is_null() {
      unsafe { (*last).next = block };
    }

    self.stats.heap_extensions += 1;
    self.stats.heap_bytes += total;
    Ok(block)
  }

  /// First free block holding at least `size` bytes, and the last block
  /// visited before it (the tail on a miss).
  fn find_free(&self, size: usize) -> (Option<*mut BlockHeader>, *mut BlockHeader) {
    let mut last = null_mut();
    let mut current = self.head;

    while !current.is_null() {
      unsafe {
        if (*current).free && (*current).size >= size {
          return (Some(current), last);
        }
        last = current;
        current = (*current).next;
      }
    }

    (None, last)
  }

  /// Shrinks `block` to `size` and lists the rest as a free block right
  /// after it, when the rest can hold a header and one word.
  unsafe fn split(&mut self, block: *mut BlockHeader, size: usize) {
    unsafe {
      if (*block).size < size + MIN_SPLIT_REMAINDER {
        return;
      }

      let rest = BlockHeader::init(
        BlockHeader::payload(block).add(size),
        (*block).size - size - BLOCK_HEADER_SIZE,
        true,
        false,
      );
      (*rest).next = (*block).next;

      (*block).size = size;
      (*block).next = rest;
    }

    self.stats.splits += 1;
  }

  /// Merges a just-freed block into a free successor, then into a free
  /// predecessor. Only physically adjacent blocks merge: the break is shared
  /// with the rest of the process.
  unsafe fn coalesce(&mut self, block: *mut BlockHeader) {
    unsafe {
      let next = (*block).next;
      if !next.is_null() && (*next).free && BlockHeader::adjacent(block, next) {
        (*block).size += (*next).size + BLOCK_HEADER_SIZE;
        (*block).next = (*next).next;
        self.stats.merges += 1;
      }

      let mut prev = self.head;
      while !prev.is_null() && (*prev).next != block {
        prev = (*prev).next;
      }

      if !prev.is_null() && (*prev).free && BlockHeader::adjacent(prev, block) {
        (*prev).size += (*block).size + BLOCK_HEADER_SIZE;
        (*prev).next = (*block).next;
        self.stats.merges += 1;
      }
    }
  }

  #[inline]
  fn tripwire(&self) {
    if cfg!(feature = "debug-tripwire")
      && let Err(err) = self.verify()
    {
      fatal(&err);
    }
  }
}

/// Iterator over the heap blocks of a [`Heap`], in address order.
pub struct Blocks<'a> {
  current: *mut BlockHeader,
  _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    if self.current.is_null() {
      return None;
    }

    let block = self.current;
    unsafe {
      self.current = (*block).next;
      Some(BlockInfo {
        payload: BlockHeader::payload(block),
        size: (*block).size,
        free: (*block).free,
      })
    }
  }
}

impl FusedIterator for Blocks<'_> {}

// =============================================================================
// Diagnostics
// =============================================================================

unsafe fn check_live(ptr: *mut u8) -> Result<(), ReleaseError> {
  let addr = ptr as usize;
  if addr % WORD != 0 || addr < BLOCK_HEADER_SIZE {
    return Err(ReleaseError::ForeignPointer { addr });
  }

  match unsafe { (*BlockHeader::from_payload(ptr)).tag } {
    TAG_LIVE => Ok(()),
    TAG_FREE => Err(ReleaseError::DoubleRelease { addr }),
    _ => Err(ReleaseError::ForeignPointer { addr }),
  }
}

/// Fixed-capacity line for reports. Output past the end is dropped.
struct LineBuffer {
  bytes: [u8; 192],
  len: usize,
}

impl Write for LineBuffer {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let n = s.len().min(self.bytes.len() - self.len);
    self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
    self.len += n;
    Ok(())
  }
}

/// Reports `err` on stderr and aborts. Never allocates.
#[cold]
#[inline(never)]
fn fatal(err: &dyn fmt::Display) -> ! {
  let mut line = LineBuffer {
    bytes: [0; 192],
    len: 0,
  };
  let _ = writeln!(line, "firstfit: {err}");
  unsafe { libc::write(libc::STDERR_FILENO, line.bytes.as_ptr().cast(), line.len) };
  std::process::abort()
}

// =============================================================================
// Process-wide heap
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard(self)
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Holds a [`SpinLock`]; unlocks on drop, unwinding included.
struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.0.unlock();
  }
}

/// The heap behind [`allocate`], [`release`] and [`Allocator`].
struct GlobalHeap {
  lock: SpinLock,
  heap: UnsafeCell<Heap<Os>>,
}

unsafe impl Sync for GlobalHeap {}

static GLOBAL: GlobalHeap = GlobalHeap {
  lock: SpinLock::new(),
  heap: UnsafeCell::new(Heap::new()),
};

fn with_global<R, F: FnOnce(&mut Heap<Os>) -> R>(f: F) -> R {
  let _guard = GLOBAL.lock.lock();
  f(unsafe { &mut *GLOBAL.heap.get() })
}

/// Allocates from the process-wide heap. See [`Heap::allocate`].
#[must_use]
pub fn allocate(size: usize) -> *mut u8 {
  if size == 0 {
    return null_mut();
  }
  with_global(|heap| heap.allocate(size))
}

/// Releases a pointer from [`allocate`]. See [`Heap::release`].
pub unsafe fn release(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  with_global(|heap| unsafe { heap.release(ptr) })
}

/// Counters of the process-wide heap.
pub fn global_stats() -> HeapStats {
  with_global(|heap| heap.stats())
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `GlobalAlloc` over the process-wide heap.
///
/// Payloads are only word aligned. Layouts aligned beyond the machine word
/// are refused with null, so installed as `#[global_allocator]` any type
/// that needs more (`u128` and 16-byte SIMD types on x86_64) ends in
/// `handle_alloc_error`.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > WORD {
      return null_mut();
    }
    allocate(layout.size().max(1))
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { release(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > WORD {
      return null_mut();
    }
    with_global(|heap| unsafe { heap.reallocate(ptr, new_size.max(1)) })
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > WORD {
      return null_mut();
    }
    with_global(|heap| heap.allocate_zeroed(layout.size().max(1)))
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// [`align_up`], or `None` when the result does not fit in a `usize`.
#[inline(always)]
const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(v) => Some(v & !mask),
    None => None,
  }
}

// =============================================================================
// Tests
// =============================================================================
