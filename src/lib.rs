//! Two-tier fixed-capacity memory allocator.
//!
//! The crate provides two independent allocation strategies over disjoint
//! memory, modeled on the classic kernel pair:
//!
//! - [`BuddyAllocator`]: one contiguous arena of `2^BUDDY_ORDERS` pages,
//!   handed out as power-of-two page blocks. Split state lives in a single
//!   64-bit tree mask; free blocks are linked through their own memory.
//! - [`SlabCache`]: page-sized slabs carved into fixed-size, cache-line
//!   aligned objects, tracked per caller-supplied shard in full/partial/free
//!   lists for lock-free per-worker use.
//!
//! Both structures are single-threaded by design: every mutating operation
//! takes `&mut self` and no call ever blocks. Concurrent use requires
//! external mutual exclusion per allocator (buddy) or per shard (slab).

pub mod buddy;
pub mod list;
mod os;
pub mod slab;

pub use buddy::BuddyAllocator;
pub use slab::{ShardStats, SlabCache};

// =============================================================================
// Constants
// =============================================================================

/// Page granularity of both tiers.
pub const PAGE_SIZE: usize = 4096;

/// Largest buddy order; the arena spans `2^BUDDY_ORDERS` pages.
pub const BUDDY_ORDERS: usize = 5;

/// Total arena memory managed by the buddy allocator.
pub const BUDDY_MEM: usize = (1 << BUDDY_ORDERS) * PAGE_SIZE;

/// Slab object alignment (one cache line).
pub const OBJ_ALIGN: usize = 64;

/// Number of independent slab-cache shards (logical CPUs).
pub const MAX_SHARDS: usize = 16;

/// Smallest slab object size accepted by [`SlabCache::new`].
pub const SLAB_OBJ_MIN_SIZE: usize = 4;

/// Longest accepted slab cache name, in bytes.
pub const SLAB_NAME_MAX: usize = 64;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(OBJ_ALIGN.is_power_of_two());
// One bit per tree node must fit the u64 mask.
const _: () = assert!((1 << (BUDDY_ORDERS + 1)) - 1 <= 64);

// =============================================================================
// Errors
// =============================================================================

/// Coarse error taxonomy: what the caller can do about a failure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
  /// Malformed request, rejected before any mutation.
  InvalidArgument,
  /// No room for the request; free memory and retry.
  ResourceExhausted,
  /// Caller bug or memory corruption; never transient.
  Corruption,
}

/// Failures reported by both allocator tiers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
pub enum Error {
  #[error("size is zero or exceeds capacity")]
  InvalidSize,
  #[error("cache name is empty or too long")]
  InvalidName,
  #[error("shard id out of range")]
  InvalidShard,
  #[error("address is null, out of range or misaligned")]
  InvalidAddress,
  #[error("out of memory")]
  OutOfMemory,
  #[error("double free or corrupted allocator state")]
  Corruption,
}

impl Error {
  /// The recovery class this error belongs to.
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::InvalidSize | Error::InvalidName | Error::InvalidShard | Error::InvalidAddress => {
        ErrorKind::InvalidArgument
      }
      Error::OutOfMemory => ErrorKind::ResourceExhausted,
      Error::Corruption => ErrorKind::Corruption,
    }
  }
}

pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
