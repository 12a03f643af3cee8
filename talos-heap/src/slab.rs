//! Fixed-size object caches: the slab side of the kernel heap.
//!
//! Each [`SlabCache`] serves one object size out of whole pages carved from
//! the frame allocator. A page's free objects are threaded into a singly
//! linked list through their own first word (a [`FreeNode`]); the page
//! itself carries a [`SlabHeader`] at its very start so a freed pointer can
//! find its way back to the cache that owns it by masking to the page
//! boundary, the same address trick `LevitateOS`'s slab cache uses.

use core::{cell::UnsafeCell, mem::MaybeUninit, ptr::NonNull, sync::atomic::{AtomicUsize, Ordering}};

use talos_mem::{config::PAGE_SIZE, error::{MemError, Result}, pfa::FrameAllocator};
use talos_sync::Mutex;

use crate::list::{IntrusiveList, Link, Linked};

/// Maximum number of caches this table can register.
pub const MAX_CACHES: usize = 32;

/// Object sizes the heap facade registers a standard cache for at init.
pub const STANDARD_SIZES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

const HEADER_MAGIC: u32 = 0x5A1B_CACE;

static_assertions::const_assert!(core::mem::size_of::<SlabHeader>() < PAGE_SIZE as usize);

#[repr(C)]
struct FreeNode {
	next: Option<NonNull<FreeNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabListKind {
	Partial,
	Full,
	Empty,
}

#[repr(C)]
struct SlabHeader {
	link: Link<SlabHeader>,
	magic: u32,
	cache: *const SlabCache,
	frame: u64,
	total_objects: u32,
	free_objects: u32,
	free_list: Option<NonNull<FreeNode>>,
	state: SlabListKind,
}

// SAFETY: `link` is this type's only list membership state.
unsafe impl Linked for SlabHeader {
	fn link(&mut self) -> &mut Link<Self> {
		&mut self.link
	}
}

struct CacheLists {
	partial: IntrusiveList<SlabHeader>,
	full: IntrusiveList<SlabHeader>,
	empty: IntrusiveList<SlabHeader>,
	alloc_count: u64,
	free_count: u64,
}

/// A snapshot of one cache's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabCacheStats {
	/// The object size this cache serves, rounded up to its alignment.
	pub object_size: usize,
	/// Slabs with at least one object free and at least one in use.
	pub partial_slabs: usize,
	/// Slabs with every object in use.
	pub full_slabs: usize,
	/// Slabs with every object free, pending release back to the PFA.
	pub empty_slabs: usize,
	/// Successful `alloc` calls since creation.
	pub alloc_count: u64,
	/// Successful `free` calls since creation.
	pub free_count: u64,
}

/// A cache of fixed-size objects, backed by whole pages from a
/// [`FrameAllocator`].
pub struct SlabCache {
	name: &'static str,
	object_size: usize,
	data_offset: usize,
	objects_per_slab: usize,
	ctor: Option<fn(*mut u8)>,
	dtor: Option<fn(*mut u8)>,
	lists: Mutex<CacheLists>,
}

impl SlabCache {
	fn new(
		name: &'static str,
		size: usize,
		align: usize,
		ctor: Option<fn(*mut u8)>,
		dtor: Option<fn(*mut u8)>,
	) -> Result<Self> {
		if align == 0 || !align.is_power_of_two() || align > PAGE_SIZE as usize {
			return Err(MemError::InvalidArgument);
		}
		let min_size = core::mem::size_of::<FreeNode>();
		let object_size = size.max(min_size).div_ceil(align) * align;
		let header_size = core::mem::size_of::<SlabHeader>();
		let data_offset = header_size.div_ceil(align) * align;
		let available = (PAGE_SIZE as usize)
			.checked_sub(data_offset)
			.ok_or(MemError::InvalidArgument)?;
		let objects_per_slab = available / object_size;
		if objects_per_slab == 0 {
			return Err(MemError::InvalidArgument);
		}
		Ok(Self {
			name,
			object_size,
			data_offset,
			objects_per_slab,
			ctor,
			dtor,
			lists: Mutex::new(CacheLists {
				partial: IntrusiveList::new(),
				full: IntrusiveList::new(),
				empty: IntrusiveList::new(),
				alloc_count: 0,
				free_count: 0,
			}),
		})
	}

	/// The cache's diagnostic name.
	#[must_use]
	pub fn name(&self) -> &'static str {
		self.name
	}

	/// The object size this cache serves (rounded up to its alignment).
	#[must_use]
	pub fn object_size(&self) -> usize {
		self.object_size
	}

	fn data_start(&self, header_phys_or_virt: usize) -> usize {
		header_phys_or_virt + self.data_offset
	}

	fn init_slab(&self, frames: &dyn FrameAllocator, offset: u64) -> Result<NonNull<SlabHeader>> {
		let frame = frames.allocate()?;
		let virt = (frame + offset) as usize;
		let header_ptr = virt as *mut SlabHeader;
		let data_start = self.data_start(virt);

		let mut free_list = None;
		for i in (0..self.objects_per_slab).rev() {
			let obj_addr = data_start + i * self.object_size;
			let node = obj_addr as *mut FreeNode;
			// SAFETY: `obj_addr` lies inside the freshly allocated slab's
			// object area and is not referenced anywhere else yet.
			unsafe { node.write(FreeNode { next: free_list }) };
			free_list = NonNull::new(node);
		}

		// SAFETY: `header_ptr` points at the start of a freshly allocated
		// frame this cache now exclusively owns.
		unsafe {
			header_ptr.write(SlabHeader {
				link: Link::new(),
				magic: HEADER_MAGIC,
				cache: self,
				frame,
				total_objects: self.objects_per_slab as u32,
				free_objects: self.objects_per_slab as u32,
				free_list,
				state: SlabListKind::Empty,
			});
		}
		// SAFETY: just written above and non-null.
		Ok(unsafe { NonNull::new_unchecked(header_ptr) })
	}

	/// Allocates one object from this cache, growing it by one slab page if
	/// every existing slab is full.
	///
	/// `offset` is the direct-map offset (`virt = phys + offset`) used to
	/// reach a freshly allocated slab page; callers pass the same value
	/// [`talos_mem::translate::global_map_offset`] would give, captured
	/// locally so hosted tests can each use their own isolated offset.
	///
	/// # Errors
	///
	/// Returns [`MemError::OutOfMemory`] if a new slab is needed and the
	/// frame allocator has none to give.
	pub fn alloc(&self, frames: &dyn FrameAllocator, offset: u64) -> Result<NonNull<u8>> {
		let mut lists = self.lists.lock();
		let header_ptr = if let Some(h) = lists.partial.pop_front() {
			h
		} else if let Some(h) = lists.empty.pop_front() {
			h
		} else {
			drop(lists);
			let header_ptr = self.init_slab(frames, offset)?;
			lists = self.lists.lock();
			header_ptr
		};

		// SAFETY: `header_ptr` is a live slab header owned by this cache,
		// just unlinked from (or freshly built outside) its list.
		let header = unsafe { &mut *header_ptr.as_ptr() };
		debug_assert_eq!(header.magic, HEADER_MAGIC);
		let obj = header
			.free_list
			.take()
			.expect("a slab picked for allocation always has a free object");
		// SAFETY: `obj` sits inside this slab's object area and was just
		// unlinked from the free list.
		header.free_list = unsafe { (*obj.as_ptr()).next };
		header.free_objects -= 1;

		header.state = if header.free_objects == 0 {
			SlabListKind::Full
		} else {
			SlabListKind::Partial
		};
		// SAFETY: `header_ptr` is not currently linked into any list.
		unsafe {
			match header.state {
				SlabListKind::Full => lists.full.push_front(header_ptr),
				_ => lists.partial.push_front(header_ptr),
			}
		}
		lists.alloc_count += 1;
		drop(lists);

		let ptr = obj.as_ptr().cast::<u8>();
		if let Some(ctor) = self.ctor {
			ctor(ptr);
		}
		// SAFETY: `obj` was a `NonNull` originally.
		Ok(unsafe { NonNull::new_unchecked(ptr) })
	}

	/// Frees an object previously returned by [`SlabCache::alloc`] on this
	/// exact cache.
	///
	/// # Safety
	///
	/// `ptr` must have come from a prior `alloc` call on this cache and not
	/// have been freed since.
	///
	/// # Errors
	///
	/// Returns [`MemError::Corrupted`] if the slab header recovered from
	/// `ptr`'s page does not belong to this cache.
	pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
		let page_addr = (ptr.as_ptr() as usize) & !(PAGE_SIZE as usize - 1);
		let header_ptr = page_addr as *mut SlabHeader;
		// SAFETY: forwarded from this method's own safety contract: `ptr`
		// came from a slab page this cache previously initialized.
		let header = unsafe { &mut *header_ptr };
		if header.magic != HEADER_MAGIC || !core::ptr::eq(header.cache, self) {
			return Err(MemError::Corrupted);
		}

		let node = ptr.cast::<FreeNode>();
		let mut lists = self.lists.lock();
		// SAFETY: `node` lies inside this slab's object area and is not
		// currently on the free list.
		unsafe { node.as_ptr().write(FreeNode { next: header.free_list }) };
		header.free_list = Some(node);
		header.free_objects += 1;
		lists.free_count += 1;

		let was = header.state;
		let now = if header.free_objects as usize == header.total_objects as usize {
			SlabListKind::Empty
		} else {
			SlabListKind::Partial
		};
		if was != now {
			// SAFETY: `header_ptr` is currently linked into the `was` list.
			let header_node = unsafe { NonNull::new_unchecked(header_ptr) };
			unsafe {
				match was {
					SlabListKind::Partial => lists.partial.remove(header_node),
					SlabListKind::Full => lists.full.remove(header_node),
					SlabListKind::Empty => unreachable!("empty slabs never shrink by freeing"),
				}
			}
			header.state = now;
			// SAFETY: `header_node` was just unlinked above.
			unsafe {
				match now {
					SlabListKind::Partial => lists.partial.push_front(header_node),
					SlabListKind::Empty => lists.empty.push_front(header_node),
					SlabListKind::Full => unreachable!("freeing never increases use"),
				}
			}
		}
		drop(lists);

		if let Some(dtor) = self.dtor {
			dtor(ptr.as_ptr());
		}
		Ok(())
	}

	/// Releases every empty slab page in this cache back to `frames`,
	/// returning the number of pages released.
	///
	/// # Errors
	///
	/// Returns an error if releasing a frame fails; any pages already
	/// released before the failing one stay released.
	pub fn shrink(&self, frames: &dyn FrameAllocator) -> Result<usize> {
		let mut lists = self.lists.lock();
		let mut released = 0usize;
		while let Some(header_ptr) = lists.empty.pop_front() {
			// SAFETY: `header_ptr` was just unlinked from `empty`; once
			// unlinked from every list nothing else references this page.
			let frame = unsafe { (*header_ptr.as_ptr()).frame };
			// SAFETY: `frame` was obtained from this same frame allocator
			// by an earlier `init_slab` call and now has no live objects.
			unsafe { frames.free(frame)? };
			released += 1;
		}
		Ok(released)
	}

	/// Whether the slab page containing the virtual address `ptr` belongs
	/// to this cache.
	#[must_use]
	pub fn owns_ptr(&self, ptr: u64) -> bool {
		let page = ptr & !(PAGE_SIZE - 1);
		let lists = self.lists.lock();
		lists
			.partial
			.iter()
			.chain(lists.full.iter())
			.chain(lists.empty.iter())
			.any(|h| h.as_ptr() as u64 == page)
	}

	/// A snapshot of this cache's bookkeeping counters.
	#[must_use]
	pub fn stats(&self) -> SlabCacheStats {
		let lists = self.lists.lock();
		SlabCacheStats {
			object_size: self.object_size,
			partial_slabs: lists.partial.len(),
			full_slabs: lists.full.len(),
			empty_slabs: lists.empty.len(),
			alloc_count: lists.alloc_count,
			free_count: lists.free_count,
		}
	}

	/// Validates every slab's bookkeeping: magic, cache back-pointer,
	/// free-object count against the actual free list length, and that
	/// every free-list node lies inside the slab's object area.
	///
	/// # Errors
	///
	/// Returns [`MemError::Corrupted`] on the first violation found.
	pub fn check_integrity(&self) -> Result<()> {
		let lists = self.lists.lock();
		for list in [&lists.partial, &lists.full, &lists.empty] {
			for header_ptr in list.iter() {
				// SAFETY: `header_ptr` is linked into one of this cache's
				// own lists.
				let header = unsafe { &*header_ptr.as_ptr() };
				if header.magic != HEADER_MAGIC || !core::ptr::eq(header.cache, self) {
					return Err(MemError::Corrupted);
				}
				if header.free_objects > header.total_objects {
					return Err(MemError::Corrupted);
				}
				let data_start = self.data_start(header_ptr.as_ptr() as usize);
				let data_end = data_start + self.objects_per_slab * self.object_size;
				let mut count = 0u32;
				let mut node = header.free_list;
				while let Some(n) = node {
					let addr = n.as_ptr() as usize;
					if addr < data_start || addr >= data_end {
						return Err(MemError::Corrupted);
					}
					count += 1;
					// SAFETY: `n` was just validated to lie inside this
					// slab's object area.
					node = unsafe { (*n.as_ptr()).next };
				}
				if count != header.free_objects {
					return Err(MemError::Corrupted);
				}
			}
		}
		Ok(())
	}
}

struct CacheSlot {
	cache: UnsafeCell<MaybeUninit<SlabCache>>,
}

// SAFETY: a slot is written exactly once, under `SlabTable::creation_lock`,
// SAFETY: before `len` makes it visible to readers; after that it is only
// SAFETY: mutated through `SlabCache`'s own interior `Mutex`.
unsafe impl Sync for CacheSlot {}

/// A fixed table of up to [`MAX_CACHES`] slab caches.
///
/// Caches are never removed once created, so a `&SlabCache` handed out by
/// [`SlabTable::caches`] or [`SlabTable::find_for_size`] stays valid for the
/// table's whole lifetime without needing its own separate allocation: the
/// table itself owns fixed, never-moved storage for every slot.
pub struct SlabTable {
	slots: [CacheSlot; MAX_CACHES],
	len: AtomicUsize,
	creation_lock: Mutex<()>,
}

impl SlabTable {
	/// An empty table.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			slots: [const { CacheSlot { cache: UnsafeCell::new(MaybeUninit::uninit()) } }; MAX_CACHES],
			len: AtomicUsize::new(0),
			creation_lock: Mutex::new(()),
		}
	}

	/// Registers the standard power-of-two caches from [`STANDARD_SIZES`],
	/// each naturally aligned to its own size.
	///
	/// # Errors
	///
	/// Returns [`MemError::OutOfMemory`] if the table is already full.
	pub fn init_standard_caches(&self) -> Result<()> {
		for &size in &STANDARD_SIZES {
			self.cache_create("slab", size, size, None, None)?;
		}
		Ok(())
	}

	/// Registers a new cache serving `size`-byte objects aligned to `align`.
	///
	/// # Errors
	///
	/// Returns [`MemError::OutOfMemory`] if the table is already full, or
	/// [`MemError::InvalidArgument`] if `align` is not a power of two or no
	/// object fits a page at that size and alignment.
	pub fn cache_create(
		&self,
		name: &'static str,
		size: usize,
		align: usize,
		ctor: Option<fn(*mut u8)>,
		dtor: Option<fn(*mut u8)>,
	) -> Result<&SlabCache> {
		let _guard = self.creation_lock.lock();
		let idx = self.len.load(Ordering::Acquire);
		if idx >= MAX_CACHES {
			return Err(MemError::OutOfMemory);
		}
		let cache = SlabCache::new(name, size, align, ctor, dtor)?;
		// SAFETY: slot `idx` is reachable only here: `creation_lock`
		// serializes every writer, and no reader observes index `idx` until
		// `len` is advanced past it below.
		unsafe { (*self.slots[idx].cache.get()).write(cache) };
		self.len.store(idx + 1, Ordering::Release);
		Ok(self.slot(idx))
	}

	fn slot(&self, i: usize) -> &SlabCache {
		// SAFETY: every caller in this file only passes `i < self.len.load
		// (Acquire)`, and a slot below `len` was written exactly once
		// before `len` advanced past it.
		unsafe { (*self.slots[i].cache.get()).assume_init_ref() }
	}

	/// Every registered cache, in creation order.
	pub fn caches(&self) -> impl Iterator<Item = &SlabCache> {
		let len = self.len.load(Ordering::Acquire);
		(0..len).map(move |i| self.slot(i))
	}

	/// The smallest registered cache whose object size is at least `size`.
	#[must_use]
	pub fn find_for_size(&self, size: usize) -> Option<&SlabCache> {
		self.caches().filter(|c| c.object_size() >= size).min_by_key(|c| c.object_size())
	}

	/// Locates the cache owning the slab page containing the virtual
	/// address `ptr`, if any.
	#[must_use]
	pub fn find_cache_for_ptr(&self, ptr: u64) -> Option<&SlabCache> {
		self.caches().find(|c| c.owns_ptr(ptr))
	}
}

impl Default for SlabTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use talos_mem::testutil::BumpFrameAllocator;

	/// A fake "physical memory" buffer plus the frame allocator and direct
	/// map offset needed to dereference frames it hands out.
	fn fixture(mib: u64) -> (std::vec::Vec<u8>, BumpFrameAllocator, u64) {
		let len = mib * 1024 * 1024;
		let buf = std::vec![0u8; len as usize];
		let offset = buf.as_ptr() as u64;
		(buf, BumpFrameAllocator::new(len), offset)
	}

	#[test]
	fn alloc_free_round_trip() {
		let (_buf, frames, offset) = fixture(1);
		let cache = SlabCache::new("test16", 16, 16, None, None).unwrap();
		let a = cache.alloc(&frames, offset).unwrap();
		let stats = cache.stats();
		assert_eq!(stats.partial_slabs + stats.full_slabs, 1);
		unsafe { cache.free(a).unwrap() };
		let stats = cache.stats();
		assert_eq!(stats.empty_slabs, 1);
		assert_eq!(stats.alloc_count, 1);
		assert_eq!(stats.free_count, 1);
	}

	#[test]
	fn slab_moves_to_full_and_back_to_partial() {
		let (_buf, frames, offset) = fixture(1);
		let cache = SlabCache::new("test2048", 2048, 2048, None, None).unwrap();
		let mut objs = std::vec::Vec::new();
		loop {
			if cache.stats().full_slabs == 1 {
				break;
			}
			objs.push(cache.alloc(&frames, offset).unwrap());
		}
		assert_eq!(cache.stats().partial_slabs, 0);
		let first = objs.pop().unwrap();
		unsafe { cache.free(first).unwrap() };
		assert_eq!(cache.stats().partial_slabs, 1);
		assert_eq!(cache.stats().full_slabs, 0);
	}

	#[test]
	fn shrink_releases_empty_slabs() {
		let (_buf, frames, offset) = fixture(1);
		let cache = SlabCache::new("test16", 16, 16, None, None).unwrap();
		let a = cache.alloc(&frames, offset).unwrap();
		unsafe { cache.free(a).unwrap() };
		assert_eq!(cache.stats().empty_slabs, 1);
		let released = cache.shrink(&frames).unwrap();
		assert_eq!(released, 1);
		assert_eq!(cache.stats().empty_slabs, 0);
	}

	#[test]
	fn find_for_size_picks_smallest_fit() {
		let table = SlabTable::new();
		table.init_standard_caches().unwrap();
		let cache = table.find_for_size(100).unwrap();
		assert_eq!(cache.object_size(), 128);
	}

	#[test]
	fn check_integrity_detects_nothing_wrong_on_healthy_cache() {
		let (_buf, frames, offset) = fixture(1);
		let cache = SlabCache::new("test32", 32, 32, None, None).unwrap();
		let _a = cache.alloc(&frames, offset).unwrap();
		let _b = cache.alloc(&frames, offset).unwrap();
		cache.check_integrity().unwrap();
	}
}
