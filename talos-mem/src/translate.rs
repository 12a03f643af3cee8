//! The direct map: a single global offset translating any physical address
//! to a kernel-readable virtual one.
//!
//! The bootloader identity-maps (offsets, really) the whole of physical
//! memory somewhere in the higher half before the kernel gets control. Every
//! layer in this core that needs to touch physical memory by address --the
//! frame allocator writing its own bitmap, the VMM walking page tables it
//! just allocated-- goes through [`to_virtual`] rather than assuming physical
//! and virtual addresses coincide.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static OFFSET: AtomicU64 = AtomicU64::new(0);
static OFFSET_SET: AtomicBool = AtomicBool::new(false);

/// Records the direct map offset handed back by the bootloader.
///
/// # Panics
///
/// Panics (in debug builds) if called more than once; the offset is fixed
/// for the lifetime of the kernel and every caller of [`to_virtual`] relies
/// on it never moving underneath them.
pub fn set_global_map_offset(offset: u64) {
	debug_assert!(
		!OFFSET_SET.swap(true, Ordering::SeqCst),
		"direct map offset set more than once"
	);
	OFFSET.store(offset, Ordering::SeqCst);
}

/// Returns the direct map offset set by [`set_global_map_offset`].
///
/// # Panics
///
/// Panics (in debug builds) if the offset has not yet been set.
#[must_use]
pub fn global_map_offset() -> u64 {
	debug_assert!(OFFSET_SET.load(Ordering::SeqCst), "direct map offset not set");
	OFFSET.load(Ordering::SeqCst)
}

/// Translates a physical address to the corresponding direct-mapped virtual
/// address.
#[must_use]
pub fn to_virtual(phys: u64) -> usize {
	(phys + global_map_offset()) as usize
}

/// Translates a direct-mapped virtual address back to its physical address.
///
/// The inverse of [`to_virtual`]; only meaningful for addresses that came
/// from the direct map in the first place.
#[must_use]
pub fn to_physical(virt: u64) -> u64 {
	virt - global_map_offset()
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::sync::atomic::Ordering as O;

	#[test]
	fn translates_with_offset() {
		// Tests in this module run serially (the crate's test binary is
		// single-threaded by default for this suite); reset the statics by
		// hand rather than relying on process-wide ordering.
		OFFSET_SET.store(false, O::SeqCst);
		set_global_map_offset(0x1000_0000);
		assert_eq!(to_virtual(0x2000), 0x1000_2000);
	}

	#[test]
	fn to_physical_reverses_to_virtual() {
		OFFSET_SET.store(false, O::SeqCst);
		set_global_map_offset(0x1000_0000);
		assert_eq!(to_physical(to_virtual(0x2000) as u64), 0x2000);
	}
}
