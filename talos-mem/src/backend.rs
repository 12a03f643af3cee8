//! The architecture-sealed contract a page-table backend implements and the
//! VMM consumes.
//!
//! Exactly one implementation exists in this workspace (`talos-arch-x86_64`),
//! but the trait -- not the concrete type -- is what `talos-vmm` is written
//! against, the same way [`crate::pfa::FrameAllocator`] lets the PFA be
//! substituted in tests without the VMM or heap caring which allocator is on
//! the other end.

use crate::{
	error::Result,
	flags::{PageFlags, PteInfo},
};

/// Four-level page-walk operations an architecture backend must provide.
///
/// # Safety
///
/// Implementors must ensure [`PageTableBackend::Handle`] values are only
/// ever used with the backend instance that created them, that
/// [`PageTableBackend::destroy_space`] frees page-table frames exclusively
/// (never a leaf-mapped frame), and that every mutation of a present leaf in
/// the currently active space is followed by a local TLB invalidation of the
/// affected virtual page(s) before returning.
pub unsafe trait PageTableBackend {
	/// An opaque handle to one address space's root page table.
	///
	/// Its interior is architecture-specific; callers above this trait
	/// treat it as inert data to pass back into later calls.
	type Handle: Copy + Eq + Send + 'static;

	/// Allocates a new address space whose upper half is an exact copy of
	/// the kernel space's upper-half entries at the time of the call.
	///
	/// # Errors
	///
	/// Returns [`crate::error::MemError::OutOfMemory`] if the root frame
	/// cannot be allocated.
	fn create_space(&self) -> Result<Self::Handle>;

	/// Frees every page-table frame owned by `handle`, including its root.
	/// Leaf-mapped frames are left untouched; their ownership lies with
	/// whoever mapped them.
	///
	/// # Safety
	///
	/// `handle` must not be the active space on any core and must not be
	/// used again after this call.
	unsafe fn destroy_space(&self, handle: Self::Handle) -> Result<()>;

	/// Makes `handle` the active address space.
	fn switch_space(&self, handle: Self::Handle) -> Result<()>;

	/// Installs a single page mapping.
	///
	/// # Errors
	///
	/// [`crate::error::MemError::InvalidArgument`] on misaligned or
	/// non-canonical `virt`; [`crate::error::MemError::AlreadyMapped`] if a
	/// leaf is already present; [`crate::error::MemError::OutOfMemory`] if
	/// an intermediate table could not be allocated (any tables allocated
	/// during this call are rolled back first).
	fn map(&self, handle: Self::Handle, virt: u64, phys: u64, flags: PageFlags) -> Result<()>;

	/// Installs `count` consecutive page mappings starting at `virt`/`phys`.
	/// Equivalent to calling [`PageTableBackend::map`] once per page; on
	/// partial failure, every leaf inserted by this call is rolled back so
	/// the whole range either lands or none of it does.
	fn map_range(
		&self,
		handle: Self::Handle,
		virt: u64,
		phys: u64,
		count: usize,
		flags: PageFlags,
	) -> Result<()>;

	/// Removes a single page mapping, returning the physical address that
	/// was mapped. Intermediate tables are left in place.
	///
	/// # Errors
	///
	/// [`crate::error::MemError::NotMapped`] if no leaf is present.
	fn unmap(&self, handle: Self::Handle, virt: u64) -> Result<u64>;

	/// Removes `count` consecutive page mappings starting at `virt`.
	fn unmap_range(&self, handle: Self::Handle, virt: u64, count: usize) -> Result<()>;

	/// Rewrites the flag bits of a present leaf in place, preserving its
	/// physical address.
	///
	/// # Errors
	///
	/// [`crate::error::MemError::NotMapped`] if no leaf is present.
	fn protect(&self, handle: Self::Handle, virt: u64, flags: PageFlags) -> Result<()>;

	/// Rewrites the flag bits of `count` consecutive present leaves.
	fn protect_range(
		&self,
		handle: Self::Handle,
		virt: u64,
		count: usize,
		flags: PageFlags,
	) -> Result<()>;

	/// Walks the tables, returning the physical address `virt` currently
	/// maps to, honoring any huge-page leaf along the way.
	///
	/// # Errors
	///
	/// [`crate::error::MemError::NotMapped`] if no leaf is present.
	fn resolve(&self, handle: Self::Handle, virt: u64) -> Result<u64>;

	/// As [`PageTableBackend::resolve`], but also reports the effective
	/// flags, leaf granularity, and hardware accessed/dirty bits.
	fn query(&self, handle: Self::Handle, virt: u64) -> Result<PteInfo>;

	/// Invalidates the local translation cache for a single virtual page.
	fn flush_tlb_page(&self, virt: u64);

	/// Invalidates the local translation cache for `count` consecutive
	/// pages starting at `virt`.
	fn flush_tlb_range(&self, virt: u64, count: usize);

	/// Invalidates the entire local translation cache for non-global
	/// entries (an implicit effect of reloading the root table pointer).
	fn flush_tlb_space(&self);

	/// Opens a short-lived kernel window onto an arbitrary physical frame,
	/// for use before the direct map covers it or when mapping memory
	/// outside physical RAM (e.g. device MMIO).
	///
	/// # Errors
	///
	/// [`crate::error::MemError::Unsupported`] if another [`kmap_temp`]
	/// window is already open; callers must [`PageTableBackend::kunmap_temp`]
	/// before opening another.
	///
	/// [`kmap_temp`]: PageTableBackend::kmap_temp
	fn kmap_temp(&self, phys: u64) -> Result<u64>;

	/// Closes the window opened by [`PageTableBackend::kmap_temp`].
	fn kunmap_temp(&self, virt: u64) -> Result<()>;

	/// Translates a physical address to its direct-map virtual address.
	fn phys_to_virt(&self, phys: u64) -> u64;

	/// Translates a direct-map virtual address back to its physical
	/// address.
	///
	/// # Errors
	///
	/// [`crate::error::MemError::InvalidArgument`] if `virt` does not lie
	/// within the direct map.
	fn virt_to_phys(&self, virt: u64) -> Result<u64>;
}
