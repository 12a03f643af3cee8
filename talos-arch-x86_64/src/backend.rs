//! The `x86_64` four-level page-table walker: the concrete implementation
//! of [`talos_mem::PageTableBackend`] for this architecture.
//!
//! Every physical address this backend dereferences -- a table it just
//! allocated, a table it's about to free -- is reached through the direct
//! map offset captured at construction, never through a per-use mapping
//! call, per the direct-map invariant this whole core is built around.

use talos_mem::{
	FrameAllocator, MemError, PageFlags, PageSize, PteInfo, Result,
	config::{PAGE_SIZE, is_aligned},
};
use talos_sync::Mutex;

use crate::{
	cpu::Cpu,
	table::{PageTable, PageTableEntry, is_canonical, split_virt},
};

/// A fixed, kernel-reserved virtual address used as a short-lived window
/// onto an arbitrary physical frame. Sits at the very top of canonical
/// address space, one page below the non-canonical hole's upper boundary.
pub const KMAP_TEMP_VA: u64 = 0xFFFF_FFFF_FFFF_F000;

/// An opaque handle to one address space's root (L4) page table.
///
/// Carries only the architecture-specific interior this backend needs;
/// `talos-vmm` attaches the rest of the data-model metadata (`is_kernel`,
/// `id`, mapped-page count) on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceHandle {
	/// The physical address of the root (L4) table.
	pub root_phys: u64,
}

struct State {
	/// The kernel address space's root table, set once by
	/// [`Backend::init_kernel_space`].
	kernel_root: Option<u64>,
	/// Whether the single `kmap_temp` window is currently checked out.
	temp_in_use: bool,
}

/// The `x86_64` page-table backend.
///
/// Generic over the [`Cpu`] it drives and the [`FrameAllocator`] it draws
/// page-table frames from, so the page-walk logic below is exercised in
/// unit tests against [`crate::cpu::soft::SoftCpu`] and a host-backed
/// allocator instead of real hardware.
pub struct Backend<'a, C: Cpu, F: FrameAllocator> {
	cpu: &'a C,
	frames: &'a F,
	/// `virt = phys + offset` for every physical address this backend
	/// touches; mirrors [`talos_mem::translate`] but captured locally so
	/// hosted tests can each use their own isolated "physical memory"
	/// buffer instead of contending over one process-wide offset.
	offset: u64,
	state: Mutex<State>,
}

impl<'a, C: Cpu, F: FrameAllocator> Backend<'a, C, F> {
	/// Creates a backend that reaches physical memory through `offset`
	/// (`virt = phys + offset`), driving `cpu` and drawing table frames
	/// from `frames`.
	#[must_use]
	pub const fn new(cpu: &'a C, frames: &'a F, offset: u64) -> Self {
		Self {
			cpu,
			frames,
			offset,
			state: Mutex::new(State {
				kernel_root: None,
				temp_in_use: false,
			}),
		}
	}

	fn to_virt(&self, phys: u64) -> u64 {
		phys + self.offset
	}

	fn table_ptr(&self, phys: u64) -> *mut PageTable {
		self.to_virt(phys) as *mut PageTable
	}

	/// Allocates the one true kernel address space. Must be called exactly
	/// once, before any [`Backend::create_space`] call (user spaces copy
	/// this space's upper half).
	///
	/// # Errors
	///
	/// [`MemError::OutOfMemory`] if the root frame cannot be allocated.
	pub fn init_kernel_space(&self) -> Result<SpaceHandle> {
		let root_phys = self.frames.allocate()?;
		// SAFETY: `root_phys` was just allocated and is page-sized, so the
		// SAFETY: direct-mapped pointer is valid for a `PageTable` write.
		unsafe { (*self.table_ptr(root_phys)).reset() };
		self.state.lock().kernel_root = Some(root_phys);
		Ok(SpaceHandle { root_phys })
	}

	fn kernel_root(&self) -> Result<u64> {
		self.state.lock().kernel_root.ok_or(MemError::NotInitialized)
	}

	/// Walks to (allocating if needed) the next-level table pointed to by
	/// `table[index]`, OR-ing in the user-accessible bit on intermediates
	/// along a user-accessible path. Returns the child table's physical
	/// address. On allocation failure, reverts every entry this call itself
	/// wrote and frees every frame this call itself allocated, in that
	/// order, before propagating the error.
	fn ensure_child(
		&self,
		table: *mut PageTable,
		index: usize,
		user: bool,
		allocated: &mut heapless::Vec<(*mut PageTable, usize, u64), 3>,
	) -> Result<u64> {
		// SAFETY: `table` is a direct-mapped pointer to a live page table
		// SAFETY: for the duration of this call.
		unsafe {
			let entry = (*table)[index];
			if entry.present() {
				if user && !(*table)[index].flags().contains(PageFlags::USER) {
					(*table)[index] = PageTableEntry::table(entry.address(), true);
				}
				return Ok(entry.address());
			}

			let frame = match self.frames.allocate() {
				Ok(f) => f,
				Err(e) => {
					self.rollback(allocated);
					return Err(e);
				}
			};
			(*self.table_ptr(frame)).reset();
			(*table)[index] = PageTableEntry::table(frame, user);
			let _ = allocated.push((table, index, frame));
			Ok(frame)
		}
	}

	fn rollback(&self, allocated: &heapless::Vec<(*mut PageTable, usize, u64), 3>) {
		for &(table, index, frame) in allocated.iter().rev() {
			// SAFETY: `table` is a direct-mapped pointer to a live page table
			// SAFETY: still reachable from the root this call is walking,
			// SAFETY: and `index` names the entry `ensure_child` just wrote
			// SAFETY: to point at `frame`. Clearing it before freeing `frame`
			// SAFETY: is what makes the revert real: no table entry is left
			// SAFETY: pointing at a frame this call is about to hand back.
			unsafe {
				(*table)[index] = PageTableEntry::new();
				let _ = self.frames.free(frame);
			}
		}
	}

	/// Walks the four levels for `virt`, invoking `at_leaf` with the L1
	/// table and index if every intermediate level is present (honoring
	/// huge pages by invoking `on_huge` instead when a huge leaf is found
	/// en route).
	fn walk_leaf(&self, root_phys: u64, virt: u64) -> Result<(*mut PageTable, usize)> {
		let parts = split_virt(virt);
		// SAFETY: each table pointer below is direct-mapped from a
		// SAFETY: physical address read out of the previous, present-table
		// SAFETY: entry, so it names a live page table for as long as this
		// SAFETY: space is not concurrently destroyed (caller's
		// SAFETY: responsibility).
		unsafe {
			let l4 = self.table_ptr(root_phys);
			let e4 = (*l4)[parts.l4];
			if !e4.present() {
				return Err(MemError::NotMapped);
			}
			let l3 = self.table_ptr(e4.address());
			let e3 = (*l3)[parts.l3];
			if !e3.present() {
				return Err(MemError::NotMapped);
			}
			if e3.huge() {
				return Err(MemError::Unsupported);
			}
			let l2 = self.table_ptr(e3.address());
			let e2 = (*l2)[parts.l2];
			if !e2.present() {
				return Err(MemError::NotMapped);
			}
			if e2.huge() {
				return Err(MemError::Unsupported);
			}
			let l1 = self.table_ptr(e2.address());
			Ok((l1, parts.l1))
		}
	}

	/// As [`Backend::walk_leaf`], but tolerates huge leaves at L3/L2,
	/// returning the physical base and the [`PageSize`] of whichever leaf
	/// terminated the walk. Used by `resolve`/`query`, which must still be
	/// able to read huge-page mappings the bootloader installed even
	/// though this backend never creates one itself.
	fn resolve_any(&self, root_phys: u64, virt: u64) -> Result<(PageTableEntry, PageSize, u64)> {
		let parts = split_virt(virt);
		// SAFETY: as `walk_leaf`.
		unsafe {
			let l4 = self.table_ptr(root_phys);
			let e4 = (*l4)[parts.l4];
			if !e4.present() {
				return Err(MemError::NotMapped);
			}
			let l3 = self.table_ptr(e4.address());
			let e3 = (*l3)[parts.l3];
			if !e3.present() {
				return Err(MemError::NotMapped);
			}
			if e3.huge() {
				return Ok((e3, PageSize::Size1G, virt & (PageSize::Size1G.len() - 1)));
			}
			let l2 = self.table_ptr(e3.address());
			let e2 = (*l2)[parts.l2];
			if !e2.present() {
				return Err(MemError::NotMapped);
			}
			if e2.huge() {
				return Ok((e2, PageSize::Size2M, virt & (PageSize::Size2M.len() - 1)));
			}
			let l1 = self.table_ptr(e2.address());
			let e1 = (*l1)[parts.l1];
			if !e1.present() {
				return Err(MemError::NotMapped);
			}
			Ok((e1, PageSize::Size4K, parts.offset))
		}
	}

	fn map_one(&self, root_phys: u64, virt: u64, phys: u64, flags: PageFlags) -> Result<()> {
		let parts = split_virt(virt);
		let user = flags.contains(PageFlags::USER);
		let mut allocated: heapless::Vec<(*mut PageTable, usize, u64), 3> = heapless::Vec::new();

		// SAFETY: `root_phys` names a live root table for the duration of
		// SAFETY: this call.
		unsafe {
			let l4 = self.table_ptr(root_phys);
			let l3_phys = self.ensure_child(l4, parts.l4, user, &mut allocated)?;
			let l3 = self.table_ptr(l3_phys);
			let l2_phys = self.ensure_child(l3, parts.l3, user, &mut allocated)?;
			let l2 = self.table_ptr(l2_phys);
			let l1_phys = self.ensure_child(l2, parts.l2, user, &mut allocated)?;
			let l1 = self.table_ptr(l1_phys);

			if (*l1)[parts.l1].present() {
				self.rollback(&allocated);
				return Err(MemError::AlreadyMapped);
			}
			(*l1)[parts.l1] = PageTableEntry::leaf(phys, flags, false);
		}
		self.cpu.invlpg(virt);
		Ok(())
	}

	fn unmap_one(&self, root_phys: u64, virt: u64) -> Result<u64> {
		let (l1, index) = self.walk_leaf(root_phys, virt)?;
		// SAFETY: `l1` was produced by `walk_leaf`, which only returns a
		// SAFETY: pointer to a live table.
		let phys = unsafe {
			let entry = (*l1)[index];
			if !entry.present() {
				return Err(MemError::NotMapped);
			}
			let phys = entry.address();
			(*l1)[index] = PageTableEntry::new();
			phys
		};
		self.cpu.invlpg(virt);
		Ok(phys)
	}

	fn protect_one(&self, root_phys: u64, virt: u64, flags: PageFlags) -> Result<()> {
		let (l1, index) = self.walk_leaf(root_phys, virt)?;
		// SAFETY: as `unmap_one`.
		unsafe {
			let entry = (*l1)[index];
			if !entry.present() {
				return Err(MemError::NotMapped);
			}
			(*l1)[index] = PageTableEntry::leaf(entry.address(), flags, false);
		}
		self.cpu.invlpg(virt);
		Ok(())
	}

	/// Recursively frees every page-table frame in the subtree rooted at
	/// `table_phys`, `depth` levels above the leaves (3 at L4, 0 at L1).
	/// Never touches a leaf-mapped frame: at `depth == 0`, the table
	/// itself is freed but its entries (leaves) are left alone.
	fn free_subtree(&self, table_phys: u64, depth: u32, only_lower_half: bool) {
		let table = self.table_ptr(table_phys);
		if depth > 0 {
			let range = if only_lower_half { 0..256 } else { 0..512 };
			for i in range {
				// SAFETY: `table` is direct-mapped from a frame this
				// SAFETY: backend itself allocated as a page table.
				let entry = unsafe { (*table)[i] };
				if entry.present() && !entry.huge() {
					self.free_subtree(entry.address(), depth - 1, false);
				}
			}
		}
		// SAFETY: every frame freed here was allocated by `ensure_child`
		// SAFETY: or `init_kernel_space`/`create_space` as a page-table
		// SAFETY: frame, and is unreachable the instant its parent entry
		// SAFETY: is cleared by the caller.
		unsafe {
			let _ = self.frames.free(table_phys);
		}
	}
}

// SAFETY: `destroy_space` frees exactly the page-table frames it walks
// SAFETY: (never a leaf), and every leaf mutation this backend performs is
// SAFETY: followed by a local `invlpg` before returning.
unsafe impl<'a, C: Cpu, F: FrameAllocator> talos_mem::PageTableBackend for Backend<'a, C, F> {
	type Handle = SpaceHandle;

	fn create_space(&self) -> Result<Self::Handle> {
		let kernel_root = self.kernel_root()?;
		let root_phys = self.frames.allocate()?;
		// SAFETY: `root_phys` was just allocated; `kernel_root` is a live
		// SAFETY: table maintained for the process lifetime.
		unsafe {
			let root = self.table_ptr(root_phys);
			(*root).reset();
			let kroot = self.table_ptr(kernel_root);
			for i in 256..512 {
				(*root)[i] = (*kroot)[i];
			}
		}
		Ok(SpaceHandle { root_phys })
	}

	unsafe fn destroy_space(&self, handle: Self::Handle) -> Result<()> {
		self.free_subtree(handle.root_phys, 3, true);
		Ok(())
	}

	fn switch_space(&self, handle: Self::Handle) -> Result<()> {
		// SAFETY: `handle.root_phys` names a live root table; callers
		// SAFETY: uphold the trait's requirement that handles outlive
		// SAFETY: their use.
		unsafe { self.cpu.write_cr3(handle.root_phys) };
		Ok(())
	}

	fn map(&self, handle: Self::Handle, virt: u64, phys: u64, flags: PageFlags) -> Result<()> {
		if !is_aligned(virt, PAGE_SIZE) || !is_aligned(phys, PAGE_SIZE) || !is_canonical(virt) {
			return Err(MemError::InvalidArgument);
		}
		self.map_one(handle.root_phys, virt, phys, flags)
	}

	fn map_range(
		&self,
		handle: Self::Handle,
		virt: u64,
		phys: u64,
		count: usize,
		flags: PageFlags,
	) -> Result<()> {
		if count == 0 {
			return Err(MemError::InvalidArgument);
		}
		for i in 0..count {
			let off = i as u64 * PAGE_SIZE;
			if let Err(e) = self.map(handle, virt + off, phys + off, flags) {
				for j in 0..i {
					let off = j as u64 * PAGE_SIZE;
					let _ = self.unmap(handle, virt + off);
				}
				return Err(e);
			}
		}
		Ok(())
	}

	fn unmap(&self, handle: Self::Handle, virt: u64) -> Result<u64> {
		if !is_aligned(virt, PAGE_SIZE) {
			return Err(MemError::InvalidArgument);
		}
		self.unmap_one(handle.root_phys, virt)
	}

	fn unmap_range(&self, handle: Self::Handle, virt: u64, count: usize) -> Result<()> {
		if count == 0 {
			return Err(MemError::InvalidArgument);
		}
		for i in 0..count {
			self.unmap(handle, virt + i as u64 * PAGE_SIZE)?;
		}
		Ok(())
	}

	fn protect(&self, handle: Self::Handle, virt: u64, flags: PageFlags) -> Result<()> {
		if !is_aligned(virt, PAGE_SIZE) {
			return Err(MemError::InvalidArgument);
		}
		self.protect_one(handle.root_phys, virt, flags)
	}

	fn protect_range(
		&self,
		handle: Self::Handle,
		virt: u64,
		count: usize,
		flags: PageFlags,
	) -> Result<()> {
		if count == 0 {
			return Err(MemError::InvalidArgument);
		}
		for i in 0..count {
			self.protect(handle, virt + i as u64 * PAGE_SIZE, flags)?;
		}
		Ok(())
	}

	fn resolve(&self, handle: Self::Handle, virt: u64) -> Result<u64> {
		let (entry, _size, offset) = self.resolve_any(handle.root_phys, virt)?;
		Ok(entry.address() + offset)
	}

	fn query(&self, handle: Self::Handle, virt: u64) -> Result<PteInfo> {
		let (entry, size, offset) = self.resolve_any(handle.root_phys, virt)?;
		Ok(PteInfo {
			phys: entry.address() + offset,
			flags: entry.flags(),
			size,
			accessed: entry.accessed(),
			dirty: entry.dirty(),
		})
	}

	fn flush_tlb_page(&self, virt: u64) {
		self.cpu.invlpg(virt);
	}

	fn flush_tlb_range(&self, virt: u64, count: usize) {
		for i in 0..count {
			self.cpu.invlpg(virt + i as u64 * PAGE_SIZE);
		}
	}

	fn flush_tlb_space(&self) {
		let cr3 = self.cpu.read_cr3();
		// SAFETY: reloading CR3 with the value already active changes no
		// SAFETY: mapping; it only forces a full non-global TLB flush.
		unsafe { self.cpu.write_cr3(cr3) };
	}

	fn kmap_temp(&self, phys: u64) -> Result<u64> {
		let kernel_root = self.kernel_root()?;
		let mut st = self.state.lock();
		if st.temp_in_use {
			return Err(MemError::Unsupported);
		}
		let handle = SpaceHandle { root_phys: kernel_root };
		match self.unmap(handle, KMAP_TEMP_VA) {
			Ok(_) | Err(MemError::NotMapped) => {}
			Err(e) => return Err(e),
		}
		self.map_one(kernel_root, KMAP_TEMP_VA, phys, PageFlags::READ | PageFlags::WRITE)?;
		st.temp_in_use = true;
		Ok(KMAP_TEMP_VA)
	}

	fn kunmap_temp(&self, virt: u64) -> Result<()> {
		if virt != KMAP_TEMP_VA {
			return Err(MemError::InvalidArgument);
		}
		let kernel_root = self.kernel_root()?;
		let mut st = self.state.lock();
		if !st.temp_in_use {
			return Err(MemError::NotMapped);
		}
		self.unmap(SpaceHandle { root_phys: kernel_root }, KMAP_TEMP_VA)?;
		st.temp_in_use = false;
		Ok(())
	}

	fn phys_to_virt(&self, phys: u64) -> u64 {
		self.to_virt(phys)
	}

	fn virt_to_phys(&self, virt: u64) -> Result<u64> {
		virt.checked_sub(self.offset).ok_or(MemError::InvalidArgument)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cpu::soft::SoftCpu;
	use std::cell::RefCell;
	use talos_mem::PageTableBackend;

	/// A bump-then-freelist [`FrameAllocator`] over a host buffer, standing
	/// in for physical memory the same way [`talos_mem::pfa::Pfa`]'s own
	/// tests stand in for it, without reaching into that crate's private
	/// test-only constructors.
	struct TestFrames {
		next: RefCell<u64>,
		limit: u64,
		freed: RefCell<std::vec::Vec<u64>>,
	}

	impl TestFrames {
		fn new(len: u64) -> Self {
			Self {
				next: RefCell::new(PAGE_SIZE),
				limit: len,
				freed: RefCell::new(std::vec::Vec::new()),
			}
		}
	}

	// SAFETY: every frame comes from either the untouched bump region or the
	// SAFETY: free list, and `free` only ever pushes a frame once per call.
	unsafe impl FrameAllocator for TestFrames {
		fn allocate(&self) -> Result<u64> {
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

		unsafe fn free(&self, frame: u64) -> Result<()> {
			self.freed.borrow_mut().push(frame);
			Ok(())
		}
	}

	fn fixture(mib: u64) -> (std::vec::Vec<u8>, TestFrames, u64) {
		let len = mib * 1024 * 1024;
		let buf = std::vec![0u8; len as usize];
		let base = buf.as_ptr() as u64;
		(buf, TestFrames::new(len), base)
	}

	/// As [`fixture`], but sized to exactly `pages` page-sized frames rather
	/// than a whole-megabyte region, so a test can pin down precisely how
	/// many allocations succeed before the allocator returns `OutOfMemory`.
	fn fixture_frames(pages: u64) -> (std::vec::Vec<u8>, TestFrames, u64) {
		let len = pages * PAGE_SIZE;
		let buf = std::vec![0u8; len as usize];
		let base = buf.as_ptr() as u64;
		(buf, TestFrames::new(len), base)
	}

	#[test]
	fn map_resolve_unmap_round_trip() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let handle = backend.init_kernel_space().unwrap();

		backend
			.map(handle, 0xFFFF_8000_0000_0000, 0x20_0000, PageFlags::READ | PageFlags::WRITE)
			.unwrap();
		assert_eq!(backend.resolve(handle, 0xFFFF_8000_0000_0000).unwrap(), 0x20_0000);
		backend.unmap(handle, 0xFFFF_8000_0000_0000).unwrap();
		assert_eq!(
			backend.resolve(handle, 0xFFFF_8000_0000_0000),
			Err(MemError::NotMapped)
		);
	}

	#[test]
	fn mapping_over_present_leaf_fails() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let handle = backend.init_kernel_space().unwrap();

		backend.map(handle, 0xFFFF_8000_0000_0000, 0x1000, PageFlags::READ).unwrap();
		assert_eq!(
			backend.map(handle, 0xFFFF_8000_0000_0000, 0x2000, PageFlags::READ),
			Err(MemError::AlreadyMapped)
		);
	}

	#[test]
	fn failed_map_reverts_partial_table_entries() {
		// Exactly enough frames for the kernel root plus two intermediate
		// levels; the third `ensure_child` call this `map` needs (for the L1
		// table) finds the allocator empty, so the whole call must fail and
		// undo the two table entries it already wrote rather than leaving
		// them pointing at frames it's about to hand back.
		let (_buf, frames, base) = fixture_frames(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let handle = backend.init_kernel_space().unwrap();
		let freed_before = frames.freed.borrow().len();

		assert_eq!(
			backend.map(handle, 0xFFFF_8000_0000_0000, 0x20_0000, PageFlags::READ),
			Err(MemError::OutOfMemory)
		);
		assert_eq!(
			backend.resolve(handle, 0xFFFF_8000_0000_0000),
			Err(MemError::NotMapped)
		);
		assert_eq!(frames.freed.borrow().len(), freed_before + 2);
	}

	#[test]
	fn non_canonical_address_is_rejected() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let handle = backend.init_kernel_space().unwrap();

		assert_eq!(
			backend.map(handle, 0x0000_8000_0000_0000, 0x1000, PageFlags::READ),
			Err(MemError::InvalidArgument)
		);
	}

	#[test]
	fn create_space_shares_upper_half() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let kernel = backend.init_kernel_space().unwrap();

		backend
			.map(kernel, 0xFFFF_8000_0000_0000, 0x20_0000, PageFlags::READ | PageFlags::WRITE)
			.unwrap();
		let user = backend.create_space().unwrap();
		assert_eq!(backend.resolve(user, 0xFFFF_8000_0000_0000).unwrap(), 0x20_0000);
	}

	#[test]
	fn destroy_space_frees_only_page_tables() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let _kernel = backend.init_kernel_space().unwrap();

		let user = backend.create_space().unwrap();
		let leaf_phys = frames.allocate().unwrap();
		backend.map(user, 0x0, leaf_phys, PageFlags::READ | PageFlags::WRITE).unwrap();
		let freed_before = frames.freed.borrow().len();

		// SAFETY: `user` is not the active space and is not used again.
		unsafe { backend.destroy_space(user).unwrap() };

		// Only the two page-table frames created for this single leaf (L3,
		// L2, L1 minus the ones shared with the kernel's upper half -- here
		// none, since the mapping is in the lower half) should come back,
		// never the leaf itself.
		assert!(frames.freed.borrow().len() > freed_before);
		assert!(!frames.freed.borrow().contains(&leaf_phys));
	}

	#[test]
	fn kmap_temp_allows_one_window_at_a_time() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let kernel = backend.init_kernel_space().unwrap();

		let target = frames.allocate().unwrap();
		let virt = backend.kmap_temp(target).unwrap();
		assert_eq!(backend.resolve(kernel, virt).unwrap(), target);
		assert_eq!(backend.kmap_temp(target), Err(MemError::Unsupported));
		backend.kunmap_temp(virt).unwrap();
		let virt2 = backend.kmap_temp(target).unwrap();
		assert_eq!(virt2, virt);
	}
}
