//! Intrusive doubly-linked free list.
//!
//! The node is written directly into the memory it tracks: the first bytes
//! of a free buddy block, or a field of a slab header. The list itself is a
//! null-terminated head pointer (no sentinel), so the owning structure stays
//! freely movable while nodes only ever point at each other.

use core::marker::PhantomData;
use core::ptr::{NonNull, null_mut};

/// Link embedded into the tracked memory.
#[repr(C)]
pub struct ListNode {
  prev: *mut ListNode,
  next: *mut ListNode,
}

impl ListNode {
  /// A detached node.
  pub const fn new() -> Self {
    Self {
      prev: null_mut(),
      next: null_mut(),
    }
  }
}

impl Default for ListNode {
  fn default() -> Self {
    Self::new()
  }
}

/// Intrusive list head with O(1) push, pop and remove.
pub struct List {
  head: *mut ListNode,
  len: usize,
}

impl List {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  /// First node of the list, if any.
  pub fn front(&self) -> Option<NonNull<ListNode>> {
    NonNull::new(self.head)
  }

  /// Pushes `node` to the front of the list.
  ///
  /// # Safety
  ///
  /// `node` must be valid for writes, not null, and not a member of any
  /// list. It stays linked until popped or removed.
  pub unsafe fn push(&mut self, node: *mut ListNode) {
    unsafe {
      (*node).prev = null_mut();
      (*node).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = node;
      }
    }
    self.head = node;
    self.len += 1;
  }

  /// Pops the front node, if any.
  pub fn pop(&mut self) -> Option<NonNull<ListNode>> {
    let node = NonNull::new(self.head)?;
    unsafe {
      self.head = (*node.as_ptr()).next;
      if !self.head.is_null() {
        (*self.head).prev = null_mut();
      }
    }
    self.len -= 1;
    Some(node)
  }

  /// Unlinks `node` from the list.
  ///
  /// # Safety
  ///
  /// `node` must be a member of exactly this list.
  pub unsafe fn remove(&mut self, node: *mut ListNode) {
    unsafe {
      let prev = (*node).prev;
      let next = (*node).next;
      if prev.is_null() {
        debug_assert_eq!(self.head, node);
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*node).prev = null_mut();
      (*node).next = null_mut();
    }
    self.len -= 1;
  }

  /// Iterates the nodes front to back.
  pub fn iter(&self) -> Iter<'_> {
    Iter {
      node: self.head,
      _list: PhantomData,
    }
  }
}

impl Default for List {
  fn default() -> Self {
    Self::new()
  }
}

pub struct Iter<'list> {
  node: *mut ListNode,
  _list: PhantomData<&'list List>,
}

impl Iterator for Iter<'_> {
  type Item = NonNull<ListNode>;

  fn next(&mut self) -> Option<Self::Item> {
    let node = NonNull::new(self.node)?;
    self.node = unsafe { (*node.as_ptr()).next };
    Some(node)
  }
}
