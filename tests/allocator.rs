//! End-to-end scenarios exercising both allocator tiers through the
//! public API.

use tieralloc::{
  BUDDY_MEM, BUDDY_ORDERS, BuddyAllocator, Error, ErrorKind, MAX_SHARDS, PAGE_SIZE, ShardStats,
  SlabCache,
};

/// Fill the arena page by page, fail the next request, free everything in
/// an arbitrary order, then allocate the whole arena as one block.
#[test]
fn buddy_fill_drain_recoalesce() {
  let mut buddy = BuddyAllocator::new().unwrap();
  let pages = 1 << BUDDY_ORDERS;

  let mut ptrs: Vec<_> = (0..pages)
    .map(|_| buddy.alloc(1).unwrap().as_ptr())
    .collect();
  assert_eq!(buddy.alloc(1).unwrap_err(), Error::OutOfMemory);
  assert_eq!(
    buddy.alloc(1).unwrap_err().kind(),
    ErrorKind::ResourceExhausted
  );

  // Interleave the order so coalescing has to work across the arena.
  ptrs.sort_by_key(|&p| {
    let page = (p as usize / PAGE_SIZE) % pages;
    (page % 4, page)
  });
  for ptr in ptrs {
    unsafe { buddy.free(ptr).unwrap() };
  }

  // Complete coalescence: one max-order block, allocatable as a whole.
  for order in 0..BUDDY_ORDERS {
    assert_eq!(buddy.free_blocks(order), 0);
  }
  assert_eq!(buddy.free_blocks(BUDDY_ORDERS), 1);
  let whole = buddy.alloc(BUDDY_MEM as u32).unwrap();
  unsafe { buddy.free(whole.as_ptr()).unwrap() };
}

#[test]
fn buddy_mixed_orders_round_trip() {
  let mut buddy = BuddyAllocator::new().unwrap();

  let a = buddy.alloc(PAGE_SIZE as u32 * 4).unwrap();
  let b = buddy.alloc(1).unwrap();
  let c = buddy.alloc(PAGE_SIZE as u32 * 8).unwrap();
  let d = buddy.alloc(PAGE_SIZE as u32 * 2 + 1).unwrap(); // rounds to order 2

  unsafe {
    buddy.free(b.as_ptr()).unwrap();
    buddy.free(d.as_ptr()).unwrap();
    buddy.free(a.as_ptr()).unwrap();
    buddy.free(c.as_ptr()).unwrap();
  }
  assert_eq!(buddy.free_blocks(BUDDY_ORDERS), 1);
}

#[test]
fn buddy_error_taxonomy() {
  let mut buddy = BuddyAllocator::new().unwrap();

  assert_eq!(
    buddy.alloc(0).unwrap_err().kind(),
    ErrorKind::InvalidArgument
  );
  assert_eq!(
    unsafe { buddy.free(std::ptr::null_mut()) }.unwrap_err().kind(),
    ErrorKind::InvalidArgument
  );

  let ptr = buddy.alloc(1).unwrap();
  unsafe { buddy.free(ptr.as_ptr()).unwrap() };
  assert_eq!(
    unsafe { buddy.free(ptr.as_ptr()) }.unwrap_err().kind(),
    ErrorKind::Corruption
  );
}

/// Two caches never hand out overlapping objects, and each slab belongs to
/// exactly one cache.
#[test]
fn slab_caches_are_disjoint() {
  let mut inodes = SlabCache::new(128, "inode").unwrap();
  let mut dentries = SlabCache::new(192, "dentry").unwrap();

  let i: Vec<_> = (0..8).map(|_| inodes.alloc(0).unwrap().as_ptr()).collect();
  let d: Vec<_> = (0..8).map(|_| dentries.alloc(0).unwrap().as_ptr()).collect();

  for &a in &i {
    for &b in &d {
      assert_ne!(
        a as usize & !(PAGE_SIZE - 1),
        b as usize & !(PAGE_SIZE - 1),
        "caches must not share slab pages"
      );
    }
  }

  for ptr in i {
    unsafe { inodes.free(ptr, 0).unwrap() };
  }
  for ptr in d {
    unsafe { dentries.free(ptr, 0).unwrap() };
  }
  assert_eq!(inodes.stats(0).free, 1);
  assert_eq!(dentries.stats(0).free, 1);
}

/// Allocate and free across several shards, checking the per-shard lists
/// stay consistent with occupancy at every boundary.
#[test]
fn slab_shard_lifecycle() {
  let mut cache = SlabCache::new(56, "session").unwrap();
  let cap = cache.obj_per_slab();

  let mut per_shard: Vec<Vec<*mut u8>> = Vec::new();
  for shard in 0..4 {
    let ptrs: Vec<_> = (0..cap + 1)
      .map(|_| cache.alloc(shard).unwrap().as_ptr())
      .collect();
    assert_eq!(
      cache.stats(shard),
      ShardStats { full: 1, partial: 1, free: 0 }
    );
    per_shard.push(ptrs);
  }

  for (shard, ptrs) in per_shard.into_iter().enumerate() {
    for ptr in ptrs {
      unsafe { cache.free(ptr, shard).unwrap() };
    }
    assert_eq!(
      cache.stats(shard),
      ShardStats { full: 0, partial: 0, free: 2 }
    );
    cache.shrink(shard).unwrap();
    assert_eq!(cache.stats(shard), ShardStats::default());
  }
}

#[test]
fn slab_error_taxonomy() {
  assert_eq!(
    SlabCache::new(1, "x").unwrap_err().kind(),
    ErrorKind::InvalidArgument
  );
  assert_eq!(
    SlabCache::new(64, "").unwrap_err().kind(),
    ErrorKind::InvalidArgument
  );

  let mut cache = SlabCache::new(64, "tax").unwrap();
  assert_eq!(
    cache.alloc(MAX_SHARDS).unwrap_err().kind(),
    ErrorKind::InvalidArgument
  );

  let ptr = cache.alloc(0).unwrap().as_ptr();
  unsafe { cache.free(ptr, 0).unwrap() };
  assert_eq!(
    unsafe { cache.free(ptr, 0) }.unwrap_err().kind(),
    ErrorKind::Corruption
  );
}

/// The intended end-to-end picture: buddy pages for bulk storage, a slab
/// cache for small objects, fully drained and verified via dumps.
#[test]
fn two_tier_session() {
  let mut buddy = BuddyAllocator::new().unwrap();
  let mut cache = SlabCache::new(40, "request").unwrap();

  let bulk = buddy.alloc(PAGE_SIZE as u32 * 3).unwrap();
  let objs: Vec<_> = (0..100).map(|_| cache.alloc(2).unwrap().as_ptr()).collect();

  let bdump = buddy.dump();
  assert!(bdump.contains("mask:"));
  let sdump = cache.dump();
  assert!(sdump.contains("SLAB CACHE \"request\""));

  for ptr in objs {
    unsafe { cache.free(ptr, 2).unwrap() };
  }
  unsafe { buddy.free(bulk.as_ptr()).unwrap() };

  assert_eq!(buddy.free_blocks(BUDDY_ORDERS), 1);
  assert_eq!(cache.stats(2).full + cache.stats(2).partial, 0);
}
