//! Slab object cache.
//!
//! A cache hands out fixed-size objects carved from page-sized "slabs".
//! Each slab is one page-aligned page: a small header (magic number,
//! occupancy bitmap pointer, object count, list node), padding up to the
//! object alignment, then the payload of fixed-stride slots. Slot occupancy
//! lives in a separately allocated bitmap; the slot address is recovered
//! from the bit position and vice versa.
//!
//! Slabs are tracked per caller-supplied shard on three lists: full,
//! partial and free. Allocation greedily prefers partial slabs, then free
//! slabs, and only then maps a new page; frees migrate slabs back as their
//! occupancy crosses a boundary. Shards never share slabs: an object must
//! be freed on the shard that allocated it.
//!
//! With the `red-zone` feature (default), every object is followed by an
//! 8-byte guard word that is written on allocation and validated on free,
//! catching buffer overruns at the moment the object dies.

use core::fmt::Write;
use core::mem::{offset_of, size_of};
use core::ptr::NonNull;

use crate::list::{List, ListNode};
use crate::{
  Error, MAX_SHARDS, OBJ_ALIGN, PAGE_SIZE, Result, SLAB_NAME_MAX, SLAB_OBJ_MIN_SIZE, align_up, os,
};

/// Identity magic written into every live slab header.
const SLAB_MAGIC: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Guard word written after each object when `red-zone` is enabled.
#[cfg(feature = "red-zone")]
const RED_ZONE_MAGIC: u64 = 0xDEDE_DEDE_DEDE_DEDE;

/// Bytes the guard word adds to every object slot.
#[cfg(feature = "red-zone")]
const RED_ZONE_SIZE: usize = size_of::<u64>();
#[cfg(not(feature = "red-zone"))]
const RED_ZONE_SIZE: usize = 0;

/// Header at offset 0 of every slab page.
#[repr(C)]
struct Slab {
  magic: u64,
  /// Occupancy bitmap, one bit per slot; separately heap-allocated.
  bitmap: *mut u64,
  /// Number of live objects in this slab.
  count: usize,
  /// Membership in exactly one of the shard's three lists.
  node: ListNode,
}

/// Payload start inside a slab page; also the per-slab metadata cost.
const SLAB_MEM_OFFSET: usize = align_up(size_of::<Slab>(), OBJ_ALIGN);

/// Usable payload bytes per slab.
const SLAB_MEM_SIZE: usize = PAGE_SIZE - SLAB_MEM_OFFSET;

/// Largest accepted object size.
pub const SLAB_OBJ_MAX_SIZE: usize = SLAB_MEM_SIZE;

const _: () = assert!(SLAB_MEM_OFFSET % OBJ_ALIGN == 0);
const _: () = assert!(SLAB_MEM_OFFSET < PAGE_SIZE);

/// The three slab lists of one shard.
struct Shard {
  full: List,
  partial: List,
  free: List,
}

impl Shard {
  const fn new() -> Self {
    Self {
      full: List::new(),
      partial: List::new(),
      free: List::new(),
    }
  }
}

/// Slab counts of one shard's lists. Diagnostic.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ShardStats {
  pub full: usize,
  pub partial: usize,
  pub free: usize,
}

/// A slab cache for one object size.
pub struct SlabCache {
  name: String,
  /// Caller-visible object size.
  obj_size: usize,
  /// Slot stride: object plus guard word, rounded up to `OBJ_ALIGN`.
  obj_stride: usize,
  obj_per_slab: usize,
  /// Bitmap words that are fully used by slots.
  full_words: usize,
  /// Slot bits in the last, partially used bitmap word.
  tail_bits: usize,
  shards: [Shard; MAX_SHARDS],
}

// Every slab page and bitmap is owned exclusively by this cache.
unsafe impl Send for SlabCache {}

// Manual impl: the shard lists hold raw pointers; the configuration is
// the useful part.
impl core::fmt::Debug for SlabCache {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("SlabCache")
      .field("name", &self.name)
      .field("obj_size", &self.obj_size)
      .field("obj_per_slab", &self.obj_per_slab)
      .finish_non_exhaustive()
  }
}

impl SlabCache {
  /// Creates a cache for objects of `obj_size` bytes.
  ///
  /// `obj_size` must lie in `[SLAB_OBJ_MIN_SIZE, SLAB_OBJ_MAX_SIZE]` and
  /// still leave room for at least one slot per slab once the guard word
  /// and alignment are applied; `name` must be non-empty and shorter than
  /// [`SLAB_NAME_MAX`] bytes. No allocation happens here; slabs are
  /// created lazily on first demand per shard.
  pub fn new(obj_size: usize, name: &str) -> Result<Self> {
    if !(SLAB_OBJ_MIN_SIZE..=SLAB_OBJ_MAX_SIZE).contains(&obj_size) {
      log::error!("slab: invalid object size {obj_size}");
      return Err(Error::InvalidSize);
    }
    if name.is_empty() || name.len() >= SLAB_NAME_MAX {
      log::error!("slab: invalid cache name {name:?}");
      return Err(Error::InvalidName);
    }

    let obj_stride = align_up(obj_size + RED_ZONE_SIZE, OBJ_ALIGN);
    let obj_per_slab = SLAB_MEM_SIZE / obj_stride;
    if obj_per_slab == 0 {
      log::error!("slab: object size {obj_size} leaves no room in a slab");
      return Err(Error::InvalidSize);
    }

    Ok(Self {
      name: name.to_owned(),
      obj_size,
      obj_stride,
      obj_per_slab,
      full_words: obj_per_slab / 64,
      tail_bits: obj_per_slab % 64,
      shards: [const { Shard::new() }; MAX_SHARDS],
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn obj_size(&self) -> usize {
    self.obj_size
  }

  /// Number of object slots per slab for this cache.
  pub fn obj_per_slab(&self) -> usize {
    self.obj_per_slab
  }

  /// Allocates one object on `shard`.
  ///
  /// Partial slabs are searched first, then free slabs; only when neither
  /// exists is a new slab mapped. Running out of existing slabs is not an
  /// error; only a failed page mapping reports [`Error::OutOfMemory`].
  pub fn alloc(&mut self, shard: usize) -> Result<NonNull<u8>> {
    if shard >= MAX_SHARDS {
      log::error!("slab {}: shard {shard} out of range", self.name);
      return Err(Error::InvalidShard);
    }

    // A partial slab always has a slot; take the first one.
    if let Some(node) = self.shards[shard].partial.front() {
      let slab = Self::slab_of(node);
      let ptr = unsafe { self.slab_alloc(slab.as_ptr()) };
      if unsafe { (*slab.as_ptr()).count } == self.obj_per_slab {
        unsafe {
          self.shards[shard].partial.remove(node.as_ptr());
          self.shards[shard].full.push(node.as_ptr());
        }
        log::debug!("slab {}: {:p} partial -> full", self.name, slab.as_ptr());
      }
      return Ok(unsafe { NonNull::new_unchecked(ptr) });
    }

    // Then a fully free slab; it migrates to partial (or full, for a
    // capacity-1 cache).
    if let Some(node) = self.shards[shard].free.pop() {
      let slab = Self::slab_of(node);
      let ptr = unsafe { self.slab_alloc(slab.as_ptr()) };
      if unsafe { (*slab.as_ptr()).count } == self.obj_per_slab {
        unsafe { self.shards[shard].full.push(node.as_ptr()) };
      } else {
        unsafe { self.shards[shard].partial.push(node.as_ptr()) };
      }
      return Ok(unsafe { NonNull::new_unchecked(ptr) });
    }

    // Shard exhausted: map a new slab and allocate from it immediately.
    let slab = self.create_slab()?;
    log::debug!("slab {}: new slab {:p} on shard {shard}", self.name, slab.as_ptr());
    let ptr = unsafe { self.slab_alloc(slab.as_ptr()) };
    let node = unsafe { &raw mut (*slab.as_ptr()).node };
    if unsafe { (*slab.as_ptr()).count } == self.obj_per_slab {
      unsafe { self.shards[shard].full.push(node) };
    } else {
      unsafe { self.shards[shard].partial.push(node) };
    }
    Ok(unsafe { NonNull::new_unchecked(ptr) })
  }

  /// Frees the object at `ptr`, previously returned by
  /// [`alloc`](Self::alloc) on the same `shard`.
  ///
  /// The owning slab is recovered by masking `ptr` down to its page. A bad
  /// magic number, a pointer outside the slab payload or off the slot
  /// stride, a clear occupancy bit (double free) or a clobbered guard word
  /// all fail with [`Error::Corruption`] before any state changes.
  ///
  /// # Safety
  ///
  /// `ptr` must point into memory mapped by this process; the page it
  /// belongs to is read to validate the slab identity. Freeing an object
  /// on a different shard than the one that allocated it is a usage error
  /// this cache cannot always detect.
  pub unsafe fn free(&mut self, ptr: *mut u8, shard: usize) -> Result<()> {
    if ptr.is_null() {
      log::error!("slab {}: null free", self.name);
      return Err(Error::InvalidAddress);
    }
    if shard >= MAX_SHARDS {
      log::error!("slab {}: shard {shard} out of range", self.name);
      return Err(Error::InvalidShard);
    }

    // Address-to-owner recovery: slabs are exactly one page, page-aligned.
    let slab = ((ptr as usize) & !(PAGE_SIZE - 1)) as *mut Slab;

    unsafe {
      if (*slab).magic != SLAB_MAGIC {
        log::error!("slab {}: bad magic freeing {ptr:p}", self.name);
        return Err(Error::Corruption);
      }

      let payload = (slab as *mut u8).add(SLAB_MEM_OFFSET);
      let off = (ptr as usize).wrapping_sub(payload as usize);
      if off >= self.obj_per_slab * self.obj_stride || off % self.obj_stride != 0 {
        log::error!("slab {}: {ptr:p} is not a slot of this cache", self.name);
        return Err(Error::Corruption);
      }

      let idx = off / self.obj_stride;
      let bitmap = (*slab).bitmap.add(idx / 64);
      let bit = 1u64 << (idx % 64);
      if *bitmap & bit == 0 {
        log::error!("slab {}: double free of {ptr:p}", self.name);
        return Err(Error::Corruption);
      }

      #[cfg(feature = "red-zone")]
      {
        let guard = (ptr.add(self.obj_size) as *const u64).read_unaligned();
        if guard != RED_ZONE_MAGIC {
          log::error!("slab {}: red zone clobbered after {ptr:p}", self.name);
          return Err(Error::Corruption);
        }
      }

      let was_full = (*slab).count == self.obj_per_slab;
      *bitmap &= !bit;
      (*slab).count -= 1;

      // An empty slab always ends on the free list; a previously full
      // slab that still holds objects goes back to partial.
      let node = &raw mut (*slab).node;
      let lists = &mut self.shards[shard];
      if was_full {
        lists.full.remove(node);
        if (*slab).count == 0 {
          lists.free.push(node);
        } else {
          lists.partial.push(node);
        }
      } else if (*slab).count == 0 {
        lists.partial.remove(node);
        lists.free.push(node);
      }
    }

    Ok(())
  }

  /// Destroys every slab on `shard`'s free list. Partial and full slabs
  /// are never touched.
  pub fn shrink(&mut self, shard: usize) -> Result<()> {
    if shard >= MAX_SHARDS {
      return Err(Error::InvalidShard);
    }
    while let Some(node) = self.shards[shard].free.pop() {
      self.destroy_slab(Self::slab_of(node).as_ptr());
    }
    Ok(())
  }

  /// Slab counts per list for `shard`; empty stats for an out-of-range
  /// shard (diagnostics never fail).
  pub fn stats(&self, shard: usize) -> ShardStats {
    let Some(shard) = self.shards.get(shard) else {
      return ShardStats::default();
    };
    ShardStats {
      full: shard.full.len(),
      partial: shard.partial.len(),
      free: shard.free.len(),
    }
  }

  /// Renders the cache configuration and every shard's slabs with their
  /// occupancy. Purely diagnostic; never mutates and never fails.
  pub fn dump(&self) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "============ SLAB CACHE {:?} ============", self.name);
    let _ = writeln!(out, "object size       : {}", self.obj_size);
    let _ = writeln!(out, "aligned stride    : {}", self.obj_stride);
    let _ = writeln!(out, "objects per slab  : {}", self.obj_per_slab);

    for (i, shard) in self.shards.iter().enumerate() {
      if shard.full.is_empty() && shard.partial.is_empty() && shard.free.is_empty() {
        let _ = writeln!(out, "[shard {i}] EMPTY");
        continue;
      }
      for (label, list) in [
        ("full", &shard.full),
        ("partial", &shard.partial),
        ("free", &shard.free),
      ] {
        let _ = writeln!(out, "[shard {i}] {label} slabs:");
        for node in list.iter() {
          let slab = Self::slab_of(node).as_ptr();
          let _ = write!(out, "    SLAB [{slab:p}] count: {}, bitmap:", unsafe {
            (*slab).count
          });
          for w in 0..self.bitmap_words() {
            let _ = write!(out, " {:#018x}", unsafe { *(*slab).bitmap.add(w) });
          }
          let _ = writeln!(out);
        }
      }
    }

    out
  }

  // ===========================================================================
  // Slab internals
  // ===========================================================================

  fn bitmap_words(&self) -> usize {
    self.obj_per_slab.div_ceil(64)
  }

  /// Recovers the slab header from its embedded list node.
  fn slab_of(node: NonNull<ListNode>) -> NonNull<Slab> {
    let addr = node.as_ptr() as usize - offset_of!(Slab, node);
    unsafe { NonNull::new_unchecked(addr as *mut Slab) }
  }

  /// Maps one page-aligned page and installs an empty header into it.
  fn create_slab(&self) -> Result<NonNull<Slab>> {
    let page = os::map_pages(PAGE_SIZE);
    if page.is_null() {
      log::error!("slab {}: page mapping failed", self.name);
      return Err(Error::OutOfMemory);
    }

    let bitmap = Box::into_raw(vec![0u64; self.bitmap_words()].into_boxed_slice()) as *mut u64;
    let slab = page as *mut Slab;
    unsafe {
      slab.write(Slab {
        magic: SLAB_MAGIC,
        bitmap,
        count: 0,
        node: ListNode::new(),
      });
      Ok(NonNull::new_unchecked(slab))
    }
  }

  /// Releases a slab's bitmap and page. The slab must be unlinked.
  fn destroy_slab(&self, slab: *mut Slab) {
    unsafe {
      let bitmap = core::ptr::slice_from_raw_parts_mut((*slab).bitmap, self.bitmap_words());
      drop(Box::from_raw(bitmap));
      // Poison the magic so a stale pointer into a recycled page cannot
      // pass the identity check.
      (*slab).magic = 0;
      os::unmap_pages(slab as *mut u8, PAGE_SIZE);
    }
  }

  /// Takes the first free slot of a non-full slab: scan the fully used
  /// bitmap words, then the tail word; set the bit, bump the count, stamp
  /// the guard word.
  unsafe fn slab_alloc(&self, slab: *mut Slab) -> *mut u8 {
    let bitmap = unsafe { (*slab).bitmap };
    let mut slot = None;

    for w in 0..self.full_words {
      let word = unsafe { *bitmap.add(w) };
      if word != u64::MAX {
        let bit = (!word).trailing_zeros() as usize;
        unsafe { *bitmap.add(w) = word | (1u64 << bit) };
        slot = Some(w * 64 + bit);
        break;
      }
    }

    if slot.is_none() {
      // Every full word is taken, so the free slot is in the tail word.
      debug_assert!(self.tail_bits > 0, "slab_alloc on a full slab");
      let w = self.full_words;
      let word = unsafe { *bitmap.add(w) };
      let tail_mask = (1u64 << self.tail_bits) - 1;
      debug_assert_ne!(word & tail_mask, tail_mask, "slab_alloc on a full slab");
      let bit = (!(word | !tail_mask)).trailing_zeros() as usize;
      unsafe { *bitmap.add(w) = word | (1u64 << bit) };
      slot = Some(w * 64 + bit);
    }

    let idx = slot.expect("non-full slab must have a free slot");
    unsafe {
      (*slab).count += 1;
      let ptr = (slab as *mut u8).add(SLAB_MEM_OFFSET + idx * self.obj_stride);
      #[cfg(feature = "red-zone")]
      (ptr.add(self.obj_size) as *mut u64).write_unaligned(RED_ZONE_MAGIC);
      ptr
    }
  }
}

impl Drop for SlabCache {
  fn drop(&mut self) {
    for i in 0..MAX_SHARDS {
      let shard = &mut self.shards[i];
      let mut doomed = Vec::new();
      for list in [&mut shard.full, &mut shard.partial, &mut shard.free] {
        while let Some(node) = list.pop() {
          doomed.push(Self::slab_of(node).as_ptr());
        }
      }
      for slab in doomed {
        self.destroy_slab(slab);
      }
    }
  }
}
