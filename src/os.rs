//! Platform layer: page-granular anonymous mappings.

use core::ptr::null_mut;

/// Maps `size` bytes of zeroed, page-aligned anonymous memory.
/// Returns null on failure.
pub(crate) fn map_pages(size: usize) -> *mut u8 {
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

/// Releases a mapping obtained from [`map_pages`].
///
/// # Safety
///
/// `ptr`/`size` must describe exactly one live mapping returned by
/// [`map_pages`]; no reference into it may survive the call.
pub(crate) unsafe fn unmap_pages(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}
