//! Buddy page allocator.
//!
//! One contiguous arena of `2^BUDDY_ORDERS` pages is handed out in
//! power-of-two page blocks ("orders"; order 0 is a single page). The split
//! state of the arena is a conceptual complete binary tree of depth
//! `BUDDY_ORDERS + 1`, encoded in a single `u64`: one bit per tree node,
//! addressed as `2^level - 1 + index`. A set bit at the page level means the
//! page is allocated; for larger blocks a set bit marks the exact block that
//! was returned to a caller. A node is "split" when any bit in its subtree
//! is set; that state is always derived, never stored.
//!
//! Free blocks of each order are kept on an intrusive list written into the
//! blocks' own first bytes.

use core::cmp;
use core::fmt::Write;
use core::ptr::NonNull;

use crate::list::{List, ListNode};
use crate::{BUDDY_MEM, BUDDY_ORDERS, Error, PAGE_SIZE, Result, align_up, os};

/// Arena mapping size: `2^BUDDY_ORDERS` pages plus one page of slack so a
/// page-aligned sub-region can always be carved out.
const ARENA_MAP_SIZE: usize = BUDDY_MEM + PAGE_SIZE;

/// Bytes covered by one block of `order`.
#[inline(always)]
const fn order_size(order: usize) -> usize {
  (1 << order) * PAGE_SIZE
}

/// Bytes covered by one tree node at `level` (level 0 is the root).
#[inline(always)]
const fn level_size(level: usize) -> usize {
  BUDDY_MEM >> level
}

/// Tree depth of a block of `order`.
#[inline(always)]
const fn order_to_level(order: usize) -> usize {
  BUDDY_ORDERS - order
}

/// Minimal order able to hold `bytes`: page-count round-up, then
/// power-of-two round-up. One byte yields order 0; a request exactly
/// filling a page count does not round up an extra page.
fn size_to_order(bytes: u32) -> Option<usize> {
  if bytes == 0 {
    return None;
  }
  let pages = (bytes as usize).div_ceil(PAGE_SIZE);
  Some(pages.next_power_of_two().trailing_zeros() as usize)
}

/// Derived state of one tree node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BlockStatus {
  Free,
  Split,
  Allocated,
}

/// Returns true if `bit` or any bit in its subtree is set.
///
/// Recursion depth is bounded by `BUDDY_ORDERS`. This is the pure read
/// derivation behind the "split" state; it is never cached.
fn subtree_marked(mask: u64, bit: u32, level: usize) -> bool {
  if mask & (1u64 << bit) != 0 {
    return true;
  }
  if level == BUDDY_ORDERS {
    return false;
  }
  subtree_marked(mask, 2 * bit + 1, level + 1) || subtree_marked(mask, 2 * bit + 2, level + 1)
}

/// The buddy allocator: owns the arena mapping exclusively.
pub struct BuddyAllocator {
  /// Raw mapping base (unaligned).
  raw: *mut u8,
  /// Page-aligned arena start.
  base: *mut u8,
  /// One free list per order.
  free_lists: [List; BUDDY_ORDERS + 1],
  /// One bit per tree node; see module docs.
  tree_mask: u64,
}

// The arena is owned exclusively by this instance; no other reference to
// the mapping exists.
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
  /// Maps the arena and places the single max-order block on its free list.
  pub fn new() -> Result<Self> {
    // Over-allocate for alignment padding.
    let raw = os::map_pages(ARENA_MAP_SIZE);
    if raw.is_null() {
      log::error!("buddy: arena mapping of {ARENA_MAP_SIZE} bytes failed");
      return Err(Error::OutOfMemory);
    }

    let base = align_up(raw as usize, PAGE_SIZE) as *mut u8;

    let mut buddy = Self {
      raw,
      base,
      free_lists: [const { List::new() }; BUDDY_ORDERS + 1],
      tree_mask: 0,
    };
    unsafe { buddy.free_lists[BUDDY_ORDERS].push(base as *mut ListNode) };
    Ok(buddy)
  }

  /// Allocates a page-aligned block of at least `bytes` bytes.
  ///
  /// Fails with [`Error::InvalidSize`] for zero bytes or a request larger
  /// than the arena, and with [`Error::OutOfMemory`] when no free block of
  /// a sufficient order exists.
  pub fn alloc(&mut self, bytes: u32) -> Result<NonNull<u8>> {
    let Some(order) = size_to_order(bytes) else {
      log::error!("buddy: rejected zero-byte allocation");
      return Err(Error::InvalidSize);
    };
    if order > BUDDY_ORDERS {
      log::error!("buddy: {bytes} bytes exceeds arena capacity");
      return Err(Error::InvalidSize);
    }

    loop {
      if let Some(node) = self.free_lists[order].pop() {
        let addr = node.as_ptr() as *mut u8;
        self.set_allocated(addr, order_to_level(order));
        log::debug!("buddy: alloc {addr:p} order {order}");
        return Ok(node.cast());
      }

      // Split the smallest free block above the requested order. One level
      // per iteration; retry the exact order afterwards.
      let mut split = None;
      for o in (order + 1)..=BUDDY_ORDERS {
        if let Some(node) = self.free_lists[o].pop() {
          split = Some((node.as_ptr() as *mut u8, o));
          break;
        }
      }
      let Some((block, o)) = split else {
        log::error!("buddy: no free block for order {order}");
        return Err(Error::OutOfMemory);
      };

      let half = self.buddy_of(block, o - 1);
      // Push the upper half first so the lower address is handed out next.
      unsafe {
        self.free_lists[o - 1].push(half as *mut ListNode);
        self.free_lists[o - 1].push(block as *mut ListNode);
      }
      log::trace!("buddy: split {block:p} order {o} -> {block:p}|{half:p}");
    }
  }

  /// Frees a block previously returned by [`alloc`](Self::alloc).
  ///
  /// Null, out-of-arena or non-page-aligned addresses fail with
  /// [`Error::InvalidAddress`]; an address not currently allocated at any
  /// level is a double free and fails with [`Error::Corruption`]. Neither
  /// failure mutates any state.
  ///
  /// # Safety
  ///
  /// A successfully freed block must not be accessed again; its memory is
  /// immediately reused for free-list bookkeeping.
  pub unsafe fn free(&mut self, addr: *mut u8) -> Result<()> {
    let off = (addr as usize).wrapping_sub(self.base as usize);
    if addr.is_null() || off >= BUDDY_MEM || off % PAGE_SIZE != 0 {
      log::error!("buddy: invalid free address {addr:p}");
      return Err(Error::InvalidAddress);
    }

    // The block's order is not stored anywhere: probe levels deepest
    // (smallest block) first and take the first one where the address is
    // level-aligned and marked allocated.
    for level in (0..=BUDDY_ORDERS).rev() {
      if off % level_size(level) != 0 {
        continue;
      }
      if self.is_allocated(addr, level) {
        self.free_at(addr, level);
        return Ok(());
      }
    }

    log::error!("buddy: double free or corruption at {addr:p}");
    Err(Error::Corruption)
  }

  /// Number of free blocks currently on `order`'s list. Diagnostic.
  pub fn free_blocks(&self, order: usize) -> usize {
    self.free_lists[order].len()
  }

  /// Renders every free list and the derived state of every tree node.
  /// Purely diagnostic; never mutates and never fails.
  pub fn dump(&self) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Arena base {:p}:", self.base);
    for order in 0..=BUDDY_ORDERS {
      let _ = write!(out, "ORDER {order} ({} page(s)):", 1 << order);
      if self.free_lists[order].is_empty() {
        let _ = writeln!(out, " EMPTY");
        continue;
      }
      for node in self.free_lists[order].iter() {
        let _ = write!(out, " {:p} ->", node.as_ptr());
      }
      let _ = writeln!(out);
    }

    let _ = writeln!(out, "mask: {:#x}", self.tree_mask);
    for level in 0..=BUDDY_ORDERS {
      let _ = writeln!(out, "LEVEL {level}");
      for idx in 0..(1usize << level) {
        let bit = (1u32 << level) - 1 + idx as u32;
        let addr = unsafe { self.base.add(idx * level_size(level)) };
        let tag = match self.status(addr, level) {
          BlockStatus::Allocated => 'A',
          BlockStatus::Split => 'S',
          BlockStatus::Free => 'F',
        };
        let _ = write!(out, "{tag}({bit})|");
      }
      let _ = writeln!(out);
    }

    out
  }

  // ===========================================================================
  // Tree mask bookkeeping
  // ===========================================================================

  /// Mask bit of the block starting at `addr`, viewed at `level`.
  fn level_bit(&self, addr: *mut u8, level: usize) -> u32 {
    let idx = (addr as usize - self.base as usize) / level_size(level);
    (1u32 << level) - 1 + idx as u32
  }

  fn is_allocated(&self, addr: *mut u8, level: usize) -> bool {
    self.tree_mask & (1u64 << self.level_bit(addr, level)) != 0
  }

  fn set_allocated(&mut self, addr: *mut u8, level: usize) {
    self.tree_mask |= 1u64 << self.level_bit(addr, level);
  }

  fn clear_allocated(&mut self, addr: *mut u8, level: usize) {
    self.tree_mask &= !(1u64 << self.level_bit(addr, level));
  }

  fn status(&self, addr: *mut u8, level: usize) -> BlockStatus {
    if self.is_allocated(addr, level) {
      return BlockStatus::Allocated;
    }
    if subtree_marked(self.tree_mask, self.level_bit(addr, level), level) {
      return BlockStatus::Split;
    }
    BlockStatus::Free
  }

  /// Sibling of the `order`-sized block at `addr`: XOR of the
  /// arena-relative offset with the block size keeps the result inside
  /// the arena.
  fn buddy_of(&self, addr: *mut u8, order: usize) -> *mut u8 {
    let off = addr as usize - self.base as usize;
    unsafe { self.base.add(off ^ order_size(order)) }
  }

  /// Clears the allocated bit, returns the block to its free list, then
  /// coalesces upward while the buddy is exactly free.
  fn free_at(&mut self, addr: *mut u8, mut level: usize) {
    self.clear_allocated(addr, level);
    // Level and order mirror each other: order = BUDDY_ORDERS - level.
    unsafe { self.free_lists[BUDDY_ORDERS - level].push(addr as *mut ListNode) };

    let mut blk = addr;
    while level > 0 {
      let order = BUDDY_ORDERS - level;
      let buddy = self.buddy_of(blk, order);
      if self.status(buddy, level) != BlockStatus::Free {
        break;
      }

      unsafe {
        self.free_lists[order].remove(blk as *mut ListNode);
        self.free_lists[order].remove(buddy as *mut ListNode);
      }
      blk = cmp::min(blk, buddy);
      unsafe { self.free_lists[order + 1].push(blk as *mut ListNode) };
      log::trace!("buddy: merge {blk:p} into order {}", order + 1);

      level -= 1;
    }
  }
}

impl Drop for BuddyAllocator {
  fn drop(&mut self) {
    // Releases all pages regardless of outstanding allocations.
    unsafe { os::unmap_pages(self.raw, ARENA_MAP_SIZE) };
  }
}
