//! Host-backed test doubles shared by this core's crates.
//!
//! Gated behind the `test-util` feature (distinct from this crate's own
//! `#[cfg(test)]`) so `talos-vmm` and `talos-heap` can enable it on their
//! `talos-mem` dev-dependency and exercise backend/heap logic against host
//! memory instead of physical frames, the same workaround the teacher's
//! `oro-mem` crate documents for its own global-allocator feature conflict.

use core::cell::RefCell;

use crate::{config::PAGE_SIZE, error::MemError, pfa::FrameAllocator};

/// A bump-then-freelist [`FrameAllocator`] over a host buffer, standing in
/// for physical memory in hosted tests.
pub struct BumpFrameAllocator {
	next: RefCell<u64>,
	limit: u64,
	freed: RefCell<std::vec::Vec<u64>>,
}

impl BumpFrameAllocator {
	/// Creates an allocator over `len` bytes of fake "physical memory",
	/// reserving frame 0 the same way the real [`crate::pfa::Pfa`] does.
	#[must_use]
	pub fn new(len: u64) -> Self {
		Self {
			next: RefCell::new(PAGE_SIZE),
			limit: len,
			freed: RefCell::new(std::vec::Vec::new()),
		}
	}

	/// The frames currently on the free list, most recently freed last.
	#[must_use]
	pub fn freed_frames(&self) -> std::vec::Vec<u64> {
		self.freed.borrow().clone()
	}
}

// SAFETY: every frame comes from either the untouched bump region or the
// SAFETY: free list, and `free` only ever pushes a frame once per call.
unsafe impl FrameAllocator for BumpFrameAllocator {
	fn allocate(&self) -> crate::Result<u64> {
		if let Some(frame) = self.freed.borrow_mut().pop() {
			return Ok(frame);
		}
		let mut next = self.next.borrow_mut();
		if *next + PAGE_SIZE > self.limit {
			return Err(MemError::OutOfMemory);
		}
		let frame = *next;
		*next += PAGE_SIZE;
		Ok(frame)
	}

	unsafe fn free(&self, frame: u64) -> crate::Result<()> {
		self.freed.borrow_mut().push(frame);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn freed_frames_are_reused() {
		let allocator = BumpFrameAllocator::new(1024 * 1024);
		let a = allocator.allocate().unwrap();
		// SAFETY: `a` was just allocated and not freed elsewhere.
		unsafe { allocator.free(a).unwrap() };
		let b = allocator.allocate().unwrap();
		assert_eq!(a, b);
	}
}
