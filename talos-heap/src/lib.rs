//! The kernel heap: general-purpose dynamic allocation layered over the
//! physical frame allocator, built from a slab allocator for small,
//! frequently-recycled objects and a buddy allocator for everything else.
#![cfg_attr(not(any(test, feature = "test-util")), no_std)]

pub mod buddy;
pub mod list;
pub mod slab;

use core::ptr;

use talos_mem::{
	error::{MemError, Result},
	pfa::{FrameAllocator, Pfa},
	translate,
};
use talos_sync::Mutex;

pub use buddy::{Buddy, BuddyStats};
pub use slab::{SlabCache, SlabCacheStats, SlabTable};

/// Allocation requests at or below this many bytes are served by a slab
/// cache; larger requests go straight to the buddy allocator.
pub const SLAB_THRESHOLD: usize = 2048;

/// The kernel-wide heap, drawing slab pages from [`talos_mem::pfa::GLOBAL`].
///
/// Production code reaches it through this singleton; tests construct
/// their own [`Heap`] over a host-backed frame allocator so fabricated
/// regions never collide across parallel test threads.
pub static GLOBAL: Heap<'static, Pfa> = Heap::new(&talos_mem::pfa::GLOBAL);

struct State {
	initialized: bool,
	offset: u64,
}

/// The kernel heap facade: routes an allocation to the slab or buddy layer
/// by size and presents one `allocate`/`free` surface over both.
///
/// Generic over the [`FrameAllocator`] the slab layer grows from, so this
/// facade's routing and bookkeeping logic runs in hosted unit tests against
/// a host-backed double instead of the real physical frame allocator.
pub struct Heap<'f, F: FrameAllocator> {
	frames: &'f F,
	slabs: SlabTable,
	buddy: Buddy,
	state: Mutex<State>,
}

impl<'f, F: FrameAllocator> Heap<'f, F> {
	/// An uninitialized heap over `frames`. Every operation other than
	/// `init` returns [`MemError::NotInitialized`] until `init` succeeds.
	#[must_use]
	pub const fn new(frames: &'f F) -> Self {
		Self {
			frames,
			slabs: SlabTable::new(),
			buddy: Buddy::new(),
			state: Mutex::new(State { initialized: false, offset: 0 }),
		}
	}

	/// Initializes the heap over `[region_base, region_base + region_size)`
	/// of physical memory, reached through `offset` (`virt = phys +
	/// offset`), and registers the standard slab caches.
	///
	/// # Errors
	///
	/// Returns whatever [`Buddy::init`] or [`SlabTable::init_standard_caches`]
	/// returns, or [`MemError::AlreadyMapped`] if called more than once.
	pub fn init(&self, region_base: u64, region_size: u64, offset: u64) -> Result<()> {
		let mut state = self.state.lock();
		if state.initialized {
			return Err(MemError::AlreadyMapped);
		}
		self.buddy.init(region_base, region_size, offset)?;
		self.slabs.init_standard_caches()?;
		state.offset = offset;
		state.initialized = true;
		Ok(())
	}

	fn ensure_initialized(&self) -> Result<u64> {
		let state = self.state.lock();
		if state.initialized { Ok(state.offset) } else { Err(MemError::NotInitialized) }
	}

	/// Allocates `size` bytes, routed to a slab cache if `size <=
	/// [SLAB_THRESHOLD]` or to the buddy allocator otherwise.
	///
	/// # Errors
	///
	/// Returns [`MemError::InvalidArgument`] if `size` is zero, or
	/// [`MemError::OutOfMemory`] if neither layer can satisfy the request.
	pub fn allocate(&self, size: usize) -> Result<*mut u8> {
		let offset = self.ensure_initialized()?;
		if size == 0 {
			return Err(MemError::InvalidArgument);
		}
		if size <= SLAB_THRESHOLD {
			let cache = self.slabs.find_for_size(size).ok_or(MemError::OutOfMemory)?;
			Ok(cache.alloc(self.frames, offset)?.as_ptr())
		} else {
			let phys = self.buddy.alloc(size)?;
			Ok((phys + offset) as *mut u8)
		}
	}

	/// Allocates `n * size` bytes, zeroed.
	///
	/// # Errors
	///
	/// As [`Heap::allocate`], plus [`MemError::InvalidArgument`] if `n *
	/// size` overflows.
	pub fn allocate_zeroed(&self, n: usize, size: usize) -> Result<*mut u8> {
		let total = n.checked_mul(size).ok_or(MemError::InvalidArgument)?;
		let ptr = self.allocate(total)?;
		// SAFETY: `allocate` just returned a fresh block of at least
		// `total` bytes, exclusively owned by this call's caller.
		unsafe { ptr::write_bytes(ptr, 0, total) };
		Ok(ptr)
	}

	/// Frees a pointer previously returned by [`Heap::allocate`] or
	/// [`Heap::allocate_zeroed`]. A null pointer is a no-op.
	///
	/// # Safety
	///
	/// `ptr` must either be null or have come from a prior `allocate[_zeroed]`
	/// call on this heap, not freed since.
	///
	/// # Errors
	///
	/// Returns [`MemError::Corrupted`] if `ptr` does not name memory this
	/// heap recognizes as currently allocated.
	pub unsafe fn free(&self, ptr: *mut u8) -> Result<()> {
		if ptr.is_null() {
			return Ok(());
		}
		let offset = self.ensure_initialized()?;
		let addr = ptr as u64;
		if let Some(cache) = self.slabs.find_cache_for_ptr(addr) {
			// SAFETY: forwarded from this method's own safety contract.
			return unsafe { cache.free(core::ptr::NonNull::new_unchecked(ptr)) };
		}
		let phys = addr - offset;
		self.buddy.free(phys)
	}

	/// Logs one line per slab cache and buddy order with bookkeeping worth
	/// seeing.
	pub fn dump_info(&self) {
		for cache in self.slabs.caches() {
			let s = cache.stats();
			log::debug!(
				"heap: slab[{}B] partial={} full={} empty={} allocs={} frees={}",
				s.object_size,
				s.partial_slabs,
				s.full_slabs,
				s.empty_slabs,
				s.alloc_count,
				s.free_count,
			);
		}
		self.buddy.dump_info();
	}

	/// Validates every slab cache and the buddy allocator.
	///
	/// # Errors
	///
	/// Returns [`MemError::Corrupted`] on the first violation found.
	pub fn check_integrity(&self) -> Result<()> {
		for cache in self.slabs.caches() {
			cache.check_integrity()?;
		}
		self.buddy.check_integrity()
	}
}

impl<'f> Heap<'f, Pfa> {
	/// Initializes the heap by claiming the PFA's single largest free run
	/// of physical memory, reached through the global direct-map offset.
	///
	/// # Errors
	///
	/// Returns [`MemError::OutOfMemory`] if the PFA has no free frames, or
	/// whatever [`Heap::init`] returns otherwise.
	pub fn init_from_pfa(&self) -> Result<()> {
		let run = self.frames.largest_free_run()?;
		if run == 0 {
			return Err(MemError::OutOfMemory);
		}
		let base = self.frames.alloc_contiguous(run)?;
		let size = run as u64 * talos_mem::config::PAGE_SIZE;
		self.init(base, size, translate::global_map_offset())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use talos_mem::testutil::BumpFrameAllocator;

	fn fixture(mib: u64) -> (std::vec::Vec<u8>, BumpFrameAllocator, u64, u64) {
		let len = mib * 1024 * 1024;
		let buf = std::vec![0u8; len as usize];
		let offset = buf.as_ptr() as u64;
		(buf, BumpFrameAllocator::new(len), len, offset)
	}

	#[test]
	fn ops_before_init_are_rejected() {
		let (_buf, frames, _len, _offset) = fixture(1);
		let heap = Heap::new(&frames);
		assert_eq!(heap.allocate(16), Err(MemError::NotInitialized));
	}

	#[test]
	fn small_allocation_goes_through_a_slab() {
		let (_buf, frames, len, offset) = fixture(4);
		let heap = Heap::new(&frames);
		heap.init(0, len, offset).unwrap();
		let ptr = heap.allocate(24).unwrap();
		assert!(!ptr.is_null());
		// SAFETY: `ptr` just came from `allocate` on this heap.
		unsafe { heap.free(ptr).unwrap() };
	}

	#[test]
	fn large_allocation_goes_through_the_buddy_allocator_and_can_be_reused() {
		let (_buf, frames, len, offset) = fixture(4);
		let heap = Heap::new(&frames);
		heap.init(0, len, offset).unwrap();
		let a = heap.allocate(16 * 1024).unwrap();
		// SAFETY: `a` just came from `allocate` on this heap.
		unsafe { heap.free(a).unwrap() };
		let b = heap.allocate(16 * 1024).unwrap();
		assert_eq!(a, b);
		// SAFETY: `b` just came from `allocate` on this heap.
		unsafe { heap.free(b).unwrap() };
	}

	#[test]
	fn allocate_zeroed_clears_memory() {
		let (_buf, frames, len, offset) = fixture(4);
		let heap = Heap::new(&frames);
		heap.init(0, len, offset).unwrap();
		let ptr = heap.allocate(64).unwrap();
		// SAFETY: fresh allocation, scribble before freeing to prove the
		// next allocation really was zeroed rather than coincidentally so.
		unsafe {
			ptr::write_bytes(ptr, 0xAA, 64);
			heap.free(ptr).unwrap();
		}
		let ptr = heap.allocate_zeroed(16, 4).unwrap();
		// SAFETY: fresh zeroed allocation of 64 bytes.
		let bytes = unsafe { core::slice::from_raw_parts(ptr, 64) };
		assert!(bytes.iter().all(|&b| b == 0));
	}

	#[test]
	fn free_of_null_is_a_no_op() {
		let (_buf, frames, len, offset) = fixture(1);
		let heap = Heap::new(&frames);
		heap.init(0, len, offset).unwrap();
		// SAFETY: null is explicitly allowed by this method's contract.
		unsafe { heap.free(core::ptr::null_mut()).unwrap() };
	}

	#[test]
	fn check_integrity_passes_after_mixed_traffic() {
		let (_buf, frames, len, offset) = fixture(4);
		let heap = Heap::new(&frames);
		heap.init(0, len, offset).unwrap();
		let mut ptrs = std::vec::Vec::new();
		for size in [16, 64, 256, 4096, 16384] {
			ptrs.push(heap.allocate(size).unwrap());
		}
		for (i, ptr) in ptrs.into_iter().enumerate() {
			if i % 2 == 0 {
				// SAFETY: each `ptr` came from `allocate` above, freed once.
				unsafe { heap.free(ptr).unwrap() };
			}
		}
		heap.check_integrity().unwrap();
	}
}
