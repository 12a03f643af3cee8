//! The virtual memory manager: a thin, lock-guarded facade above an
//! architecture [`PageTableBackend`], responsible for address-space
//! bookkeeping (statistics, the kernel-space handle, the initialized flag)
//! and precondition validation. The backend itself is called with this
//! facade's lock released, so a page-table walk that allocates an
//! intermediate frame never holds the VMM lock while it acquires the PFA's.
#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicUsize, Ordering};

use talos_mem::{
	MemError, PageFlags, PageTableBackend, PteInfo, Result,
	config::{PAGE_SIZE, is_aligned},
};
use talos_sync::Mutex;

/// One address space: an opaque backend handle plus the metadata
/// `talos-vmm` tracks on top of it.
pub struct AddressSpace<H> {
	handle: H,
	is_kernel: bool,
	id: u64,
	mapped_pages: AtomicUsize,
}

impl<H: Copy> AddressSpace<H> {
	/// The backend-opaque handle underlying this address space.
	#[must_use]
	pub fn handle(&self) -> H {
		self.handle
	}

	/// Whether this is the one kernel address space singleton.
	#[must_use]
	pub const fn is_kernel(&self) -> bool {
		self.is_kernel
	}

	/// This address space's identifier, unique for the lifetime of the
	/// owning [`Vmm`]. The kernel space always has id `0`.
	#[must_use]
	pub const fn id(&self) -> u64 {
		self.id
	}

	/// The number of pages currently mapped through this address space, as
	/// tracked by the owning [`Vmm`]. Best-effort: it reflects calls made
	/// through that `Vmm`, not direct backend use.
	#[must_use]
	pub fn mapped_page_count(&self) -> usize {
		self.mapped_pages.load(Ordering::Relaxed)
	}
}

/// A snapshot of the VMM's bookkeeping counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmmStats {
	/// Address spaces created since `init()` (the kernel space is not
	/// counted).
	pub spaces_created: u64,
	/// Address spaces destroyed since `init()`.
	pub spaces_destroyed: u64,
	/// Successful `map`/`map_range` calls.
	pub maps_installed: u64,
	/// Successful `unmap`/`unmap_range` calls.
	pub unmaps: u64,
}

struct State<H> {
	initialized: bool,
	kernel_handle: Option<H>,
	next_id: u64,
	stats: VmmStats,
}

/// The virtual memory manager, generic over the architecture backend it
/// drives.
pub struct Vmm<B: PageTableBackend> {
	backend: B,
	state: Mutex<State<B::Handle>>,
}

impl<B: PageTableBackend> Vmm<B> {
	/// Wraps `backend`, uninitialized.
	#[must_use]
	pub const fn new(backend: B) -> Self {
		Self {
			backend,
			state: Mutex::new(State {
				initialized: false,
				kernel_handle: None,
				next_id: 1,
				stats: VmmStats {
					spaces_created: 0,
					spaces_destroyed: 0,
					maps_installed: 0,
					unmaps: 0,
				},
			}),
		}
	}

	/// Adopts `kernel_handle` (produced by an architecture-specific
	/// bootstrap step, e.g. `talos-arch-x86_64`'s
	/// `Backend::init_kernel_space`) as the kernel address space and marks
	/// this VMM ready for use.
	///
	/// # Errors
	///
	/// Returns [`MemError::InvalidArgument`] if already initialized.
	pub fn init(&self, kernel_handle: B::Handle) -> Result<AddressSpace<B::Handle>> {
		let mut st = self.state.lock();
		if st.initialized {
			return Err(MemError::InvalidArgument);
		}
		st.initialized = true;
		st.kernel_handle = Some(kernel_handle);
		log::info!("vmm: initialized with kernel address space");
		Ok(AddressSpace {
			handle: kernel_handle,
			is_kernel: true,
			id: 0,
			mapped_pages: AtomicUsize::new(0),
		})
	}

	fn ensure_initialized(&self) -> Result<()> {
		if self.state.lock().initialized {
			Ok(())
		} else {
			Err(MemError::NotInitialized)
		}
	}

	fn resolve_handle(&self, space: Option<&AddressSpace<B::Handle>>) -> Result<B::Handle> {
		match space {
			Some(s) => Ok(s.handle),
			None => self.state.lock().kernel_handle.ok_or(MemError::NotInitialized),
		}
	}

	/// A snapshot of this VMM's bookkeeping counters.
	#[must_use]
	pub fn stats(&self) -> VmmStats {
		self.state.lock().stats
	}

	/// Creates a new address space whose upper half mirrors the kernel
	/// space at the moment of the call.
	///
	/// # Errors
	///
	/// [`MemError::NotInitialized`] before [`Vmm::init`];
	/// [`MemError::OutOfMemory`] if the backend cannot allocate a root
	/// frame.
	pub fn create_space(&self) -> Result<AddressSpace<B::Handle>> {
		self.ensure_initialized()?;
		let handle = self.backend.create_space()?;
		let mut st = self.state.lock();
		let id = st.next_id;
		st.next_id += 1;
		st.stats.spaces_created += 1;
		Ok(AddressSpace {
			handle,
			is_kernel: false,
			id,
			mapped_pages: AtomicUsize::new(0),
		})
	}

	/// Destroys `space`, freeing every page-table frame it owns.
	///
	/// # Safety
	///
	/// `space` must not be the active address space on any core.
	///
	/// # Errors
	///
	/// [`MemError::InvalidArgument`] if `space` is the kernel space.
	pub unsafe fn destroy_space(&self, space: AddressSpace<B::Handle>) -> Result<()> {
		if space.is_kernel {
			return Err(MemError::InvalidArgument);
		}
		self.ensure_initialized()?;
		// SAFETY: forwarded from this method's own safety contract.
		unsafe { self.backend.destroy_space(space.handle)? };
		self.state.lock().stats.spaces_destroyed += 1;
		Ok(())
	}

	/// Makes `space` the active address space.
	///
	/// # Errors
	///
	/// [`MemError::NotInitialized`] before [`Vmm::init`].
	pub fn switch_space(&self, space: &AddressSpace<B::Handle>) -> Result<()> {
		self.ensure_initialized()?;
		self.backend.switch_space(space.handle)
	}

	/// Installs `count` consecutive mappings starting at `virt`/`phys` in
	/// `space` (the kernel space, if `None`). An empty `flags` defaults to
	/// [`PageFlags::READ`].
	///
	/// # Errors
	///
	/// [`MemError::NotInitialized`] before [`Vmm::init`];
	/// [`MemError::InvalidArgument`] on misaligned input or zero `count`;
	/// otherwise as [`PageTableBackend::map`]/[`PageTableBackend::map_range`].
	pub fn map(
		&self,
		space: Option<&AddressSpace<B::Handle>>,
		virt: u64,
		phys: u64,
		count: usize,
		flags: PageFlags,
	) -> Result<()> {
		self.ensure_initialized()?;
		if count == 0 || !is_aligned(virt, PAGE_SIZE) || !is_aligned(phys, PAGE_SIZE) {
			return Err(MemError::InvalidArgument);
		}
		let flags = if flags.is_empty() { PageFlags::default_if_empty() } else { flags };
		let handle = self.resolve_handle(space)?;
		if count == 1 {
			self.backend.map(handle, virt, phys, flags)?;
		} else {
			self.backend.map_range(handle, virt, phys, count, flags)?;
		}
		if let Some(s) = space {
			s.mapped_pages.fetch_add(count, Ordering::Relaxed);
		}
		self.state.lock().stats.maps_installed += 1;
		Ok(())
	}

	/// Removes `count` consecutive mappings starting at `virt` in `space`
	/// (the kernel space, if `None`).
	///
	/// # Errors
	///
	/// As [`Vmm::map`]; [`MemError::NotMapped`] if any page in the range is
	/// absent.
	pub fn unmap(&self, space: Option<&AddressSpace<B::Handle>>, virt: u64, count: usize) -> Result<()> {
		self.ensure_initialized()?;
		if count == 0 || !is_aligned(virt, PAGE_SIZE) {
			return Err(MemError::InvalidArgument);
		}
		let handle = self.resolve_handle(space)?;
		if count == 1 {
			self.backend.unmap(handle, virt)?;
		} else {
			self.backend.unmap_range(handle, virt, count)?;
		}
		if let Some(s) = space {
			s.mapped_pages.fetch_sub(count, Ordering::Relaxed);
		}
		self.state.lock().stats.unmaps += 1;
		Ok(())
	}

	/// Rewrites the flags of `count` consecutive present leaves starting at
	/// `virt` in `space` (the kernel space, if `None`).
	///
	/// # Errors
	///
	/// As [`Vmm::map`]; [`MemError::NotMapped`] if any page in the range is
	/// absent.
	pub fn protect(
		&self,
		space: Option<&AddressSpace<B::Handle>>,
		virt: u64,
		count: usize,
		flags: PageFlags,
	) -> Result<()> {
		self.ensure_initialized()?;
		if count == 0 || !is_aligned(virt, PAGE_SIZE) {
			return Err(MemError::InvalidArgument);
		}
		let flags = if flags.is_empty() { PageFlags::default_if_empty() } else { flags };
		let handle = self.resolve_handle(space)?;
		if count == 1 {
			self.backend.protect(handle, virt, flags)
		} else {
			self.backend.protect_range(handle, virt, count, flags)
		}
	}

	/// Resolves `virt` to its mapped physical address in `space` (the
	/// kernel space, if `None`).
	///
	/// # Errors
	///
	/// [`MemError::NotMapped`] if `virt` has no mapping.
	pub fn resolve(&self, space: Option<&AddressSpace<B::Handle>>, virt: u64) -> Result<u64> {
		self.ensure_initialized()?;
		let handle = self.resolve_handle(space)?;
		self.backend.resolve(handle, virt)
	}

	/// As [`Vmm::resolve`], but also returns flags, granularity, and
	/// hardware accessed/dirty bits.
	///
	/// # Errors
	///
	/// As [`Vmm::resolve`].
	pub fn query(&self, space: Option<&AddressSpace<B::Handle>>, virt: u64) -> Result<PteInfo> {
		self.ensure_initialized()?;
		let handle = self.resolve_handle(space)?;
		self.backend.query(handle, virt)
	}

	/// Invalidates the local TLB entry for a single virtual page.
	pub fn flush_tlb_page(&self, virt: u64) {
		self.backend.flush_tlb_page(virt);
	}

	/// Invalidates the local TLB entries for `count` consecutive pages
	/// starting at `virt`.
	pub fn flush_tlb_range(&self, virt: u64, count: usize) {
		self.backend.flush_tlb_range(virt, count);
	}

	/// Invalidates the entire local non-global TLB.
	pub fn flush_tlb_space(&self) {
		self.backend.flush_tlb_space();
	}

	/// Opens a short-lived kernel window onto `phys`.
	///
	/// # Errors
	///
	/// As [`PageTableBackend::kmap_temp`].
	pub fn kmap_temp(&self, phys: u64) -> Result<u64> {
		self.ensure_initialized()?;
		self.backend.kmap_temp(phys)
	}

	/// Closes a window opened by [`Vmm::kmap_temp`].
	///
	/// # Errors
	///
	/// As [`PageTableBackend::kunmap_temp`].
	pub fn kunmap_temp(&self, virt: u64) -> Result<()> {
		self.ensure_initialized()?;
		self.backend.kunmap_temp(virt)
	}

	/// Translates a physical address to its direct-map virtual address.
	#[must_use]
	pub fn phys_to_virt(&self, phys: u64) -> u64 {
		self.backend.phys_to_virt(phys)
	}

	/// Translates a direct-map virtual address back to its physical
	/// address.
	///
	/// # Errors
	///
	/// [`MemError::InvalidArgument`] if `virt` does not lie within the
	/// direct map.
	pub fn virt_to_phys(&self, virt: u64) -> Result<u64> {
		self.backend.virt_to_phys(virt)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use talos_arch_x86_64::{Backend, cpu::soft::SoftCpu};
	use talos_mem::testutil::BumpFrameAllocator;

	fn fixture(mib: u64) -> (std::vec::Vec<u8>, BumpFrameAllocator, u64) {
		let len = mib * 1024 * 1024;
		let buf = std::vec![0u8; len as usize];
		let base = buf.as_ptr() as u64;
		(buf, BumpFrameAllocator::new(len), base)
	}

	#[test]
	fn ops_before_init_are_rejected() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let vmm = Vmm::new(backend);
		assert_eq!(vmm.create_space(), Err(MemError::NotInitialized));
	}

	#[test]
	fn map_defaults_empty_flags_to_read_only() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let kernel_handle = backend.init_kernel_space().unwrap();
		let vmm = Vmm::new(backend);
		let kernel = vmm.init(kernel_handle).unwrap();

		vmm.map(Some(&kernel), 0xFFFF_8000_0000_0000, 0x20_0000, 1, PageFlags::empty()).unwrap();
		let info = vmm.query(Some(&kernel), 0xFFFF_8000_0000_0000).unwrap();
		assert_eq!(info.flags, PageFlags::READ);
		assert_eq!(kernel.mapped_page_count(), 1);
	}

	#[test]
	fn null_space_substitutes_kernel_space() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let kernel_handle = backend.init_kernel_space().unwrap();
		let vmm = Vmm::new(backend);
		let _kernel = vmm.init(kernel_handle).unwrap();

		vmm.map(None, 0xFFFF_8000_0000_0000, 0x20_0000, 1, PageFlags::READ | PageFlags::WRITE).unwrap();
		assert_eq!(vmm.resolve(None, 0xFFFF_8000_0000_0000).unwrap(), 0x20_0000);
	}

	#[test]
	fn map_range_counts_as_one_call_covering_many_pages() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let kernel_handle = backend.init_kernel_space().unwrap();
		let vmm = Vmm::new(backend);
		let kernel = vmm.init(kernel_handle).unwrap();

		vmm.map(Some(&kernel), 0xFFFF_8000_0000_0000, 0x20_0000, 4, PageFlags::READ | PageFlags::WRITE)
			.unwrap();
		assert_eq!(kernel.mapped_page_count(), 4);
		assert_eq!(vmm.stats().maps_installed, 1);

		vmm.unmap(Some(&kernel), 0xFFFF_8000_0000_0000, 4).unwrap();
		assert_eq!(kernel.mapped_page_count(), 0);
		assert_eq!(vmm.stats().unmaps, 1);
	}

	#[test]
	fn create_and_destroy_user_space() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let kernel_handle = backend.init_kernel_space().unwrap();
		let vmm = Vmm::new(backend);
		let _kernel = vmm.init(kernel_handle).unwrap();

		let user = vmm.create_space().unwrap();
		assert_eq!(user.id(), 1);
		assert!(!user.is_kernel());
		// SAFETY: `user` is not the active space and is not used again.
		unsafe { vmm.destroy_space(user).unwrap() };
		assert_eq!(vmm.stats().spaces_destroyed, 1);
	}

	#[test]
	fn destroying_kernel_space_is_rejected() {
		let (_buf, frames, base) = fixture(4);
		let cpu = SoftCpu::new();
		let backend = Backend::new(&cpu, &frames, base);
		let kernel_handle = backend.init_kernel_space().unwrap();
		let vmm = Vmm::new(backend);
		let kernel = vmm.init(kernel_handle).unwrap();
		// SAFETY: rejected before any backend call is made.
		assert_eq!(unsafe { vmm.destroy_space(kernel) }, Err(MemError::InvalidArgument));
	}
}
