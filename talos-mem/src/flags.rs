//! Architecture-independent currency passed between the VMM and the
//! per-architecture page-table backend.
//!
//! Neither `talos-vmm` nor `talos-arch-x86_64` own this type: it sits here,
//! alongside [`crate::error::MemError`], so both sides of that boundary speak
//! the same vocabulary without either crate depending on the other just to
//! share a flags type.

use bitflags::bitflags;

bitflags! {
	/// Permission and caching flags for a single mapping.
	///
	/// The backend translates these into its native PTE bit layout; an
	/// explicit [`PageFlags::EXECUTE`] is required to leave a page
	/// executable; every mapping is non-executable unless asked otherwise.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PageFlags: u32 {
		/// Readable. Every present mapping is implicitly readable on
		/// `x86_64`; this bit exists so callers can express "no access"
		/// semantics on architectures that distinguish it.
		const READ = 1 << 0;
		/// Writable.
		const WRITE = 1 << 1;
		/// Executable. Absent by default: the backend sets the no-execute
		/// bit unless this flag is present.
		const EXECUTE = 1 << 2;
		/// Accessible from user (ring 3) code.
		const USER = 1 << 3;
		/// Not flushed from the TLB on an address-space switch.
		const GLOBAL = 1 << 4;
		/// Disables caching for this mapping.
		const NO_CACHE = 1 << 5;
		/// Write-combining. Requires a configured page-attribute table;
		/// the backend returns [`crate::error::MemError::Unsupported`]
		/// until one is.
		const WRITE_COMBINE = 1 << 6;
	}
}

impl PageFlags {
	/// The default flag set the VMM substitutes when a caller passes an
	/// empty flag set: read-only, supervisor-only, non-executable.
	#[must_use]
	pub const fn default_if_empty() -> Self {
		Self::READ
	}
}

/// A mapping granularity hint.
///
/// The reference backend described by this core only installs 4 KiB leaves
/// (see the "2 MiB / 1 GiB mapping paths" open question); `resolve`/`query`
/// must still be able to report huge-page leaves the bootloader itself
/// installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
	/// A single 4 KiB leaf at the lowest page-table level.
	Size4K,
	/// A 2 MiB leaf at the second-from-lowest level.
	Size2M,
	/// A 1 GiB leaf at the third-from-lowest level.
	Size1G,
}

impl PageSize {
	/// The `log2` of this page size, i.e. the number of low address bits it
	/// covers.
	#[must_use]
	pub const fn shift(self) -> u32 {
		match self {
			Self::Size4K => 12,
			Self::Size2M => 21,
			Self::Size1G => 30,
		}
	}

	/// The size, in bytes, of a mapping at this granularity.
	#[must_use]
	pub const fn len(self) -> u64 {
		1 << self.shift()
	}
}

/// The full result of a [`crate::backend::PageTableBackend::query`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteInfo {
	/// The physical address the queried virtual address translates to.
	pub phys: u64,
	/// The effective flags in force for this mapping.
	pub flags: PageFlags,
	/// The granularity of the leaf that serves this address.
	pub size: PageSize,
	/// Whether the hardware accessed bit is set.
	pub accessed: bool,
	/// Whether the hardware dirty bit is set.
	pub dirty: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_flags_default_to_read_only() {
		assert_eq!(PageFlags::default_if_empty(), PageFlags::READ);
	}

	#[test]
	fn page_size_shifts_match_architecture() {
		assert_eq!(PageSize::Size4K.shift(), 12);
		assert_eq!(PageSize::Size2M.shift(), 21);
		assert_eq!(PageSize::Size1G.shift(), 30);
		assert_eq!(PageSize::Size4K.len(), 0x1000);
		assert_eq!(PageSize::Size2M.len(), 0x20_0000);
		assert_eq!(PageSize::Size1G.len(), 0x4000_0000);
	}
}
