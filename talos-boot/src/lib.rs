//! Typed boundary over the Limine boot protocol.
//!
//! Everything downstream of this crate (`talos-mem`, `talos-arch-x86_64`,
//! `talos-vmm`, `talos-heap`) consumes a [`BootSnapshot`] rather than the raw
//! `limine` response types directly, so the rest of the memory core never
//! needs to know which bootloader handed it control.
#![cfg_attr(not(test), no_std)]

use limine::{
	BaseRevision,
	memory_map::EntryType,
	request::{FramebufferRequest, HhdmRequest, MemoryMapRequest},
};

/// The maximum number of normalized memory map entries a [`BootSnapshot`] can
/// hold. Limine memory maps in practice carry a few dozen entries; this
/// leaves ample headroom without requiring a heap, which does not yet exist
/// at the point this snapshot is captured.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 64;

/// Provides Limine with the base revision of the protocol this core expects.
#[used]
pub static BASE_REVISION: BaseRevision = BaseRevision::with_revision(2);

/// Requests that Limine perform a Higher Half Direct Map (HHDM) of all
/// physical memory and hand back the offset used.
#[used]
static REQ_HHDM: HhdmRequest = HhdmRequest::with_revision(0);

/// Requests the physical memory map from Limine.
#[used]
static REQ_MMAP: MemoryMapRequest = MemoryMapRequest::with_revision(0);

/// Requests a framebuffer from Limine, if one is available.
#[used]
static REQ_FB: FramebufferRequest = FramebufferRequest::with_revision(0);

/// The classification of a physical memory map entry, mirroring
/// `limine::memory_map::EntryType` one-to-one but named the way the rest of
/// this core's specification names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
	/// Free for general use.
	Usable,
	/// Never usable; reported by firmware as off-limits.
	Reserved,
	/// ACPI tables that may be reclaimed once parsed.
	AcpiReclaimable,
	/// ACPI non-volatile storage; never reclaimable.
	AcpiNvs,
	/// Known-bad RAM.
	Bad,
	/// Used by the bootloader; reclaimable once the kernel no longer needs
	/// any bootloader-owned structures.
	BootloaderReclaimable,
	/// Holds the kernel image and any loaded modules.
	KernelAndModules,
	/// Backs a framebuffer.
	Framebuffer,
}

impl MemoryKind {
	/// Whether frames of this kind form part of the PFA's allocatable pool
	/// at `init()` time, per the frame classification rules in the data
	/// model: usable, bootloader-reclaimable, and ACPI-reclaimable frames are
	/// allocatable; everything else is permanently reserved.
	#[must_use]
	pub const fn is_allocatable(self) -> bool {
		matches!(
			self,
			Self::Usable | Self::BootloaderReclaimable | Self::AcpiReclaimable
		)
	}

	/// Converts a raw Limine entry type into a [`MemoryKind`].
	fn from_limine(ty: EntryType) -> Self {
		match ty {
			EntryType::USABLE => Self::Usable,
			EntryType::BOOTLOADER_RECLAIMABLE => Self::BootloaderReclaimable,
			EntryType::ACPI_RECLAIMABLE => Self::AcpiReclaimable,
			EntryType::ACPI_NVS => Self::AcpiNvs,
			EntryType::BAD_MEMORY => Self::Bad,
			EntryType::KERNEL_AND_MODULES => Self::KernelAndModules,
			EntryType::FRAMEBUFFER => Self::Framebuffer,
			_ => Self::Reserved,
		}
	}
}

/// A single, normalized physical memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
	/// The physical base address of the region.
	pub base: u64,
	/// The length, in bytes, of the region.
	pub length: u64,
	/// The kind of memory this region holds.
	pub kind: MemoryKind,
}

impl MemoryMapEntry {
	/// The exclusive end address of the region.
	#[must_use]
	pub const fn end(&self) -> u64 {
		self.base + self.length
	}
}

/// Read-only framebuffer geometry, consumed only by the (out-of-scope)
/// console subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
	/// Physical base address of the framebuffer.
	pub base: u64,
	/// Width, in pixels.
	pub width: u64,
	/// Height, in pixels.
	pub height: u64,
	/// Bytes per scanline.
	pub pitch: u64,
	/// Bits per pixel (32 for BGRA8888, as this protocol always supplies).
	pub bpp: u16,
}

/// An immutable, validated view over everything the bootloader handed the
/// kernel at entry: the memory map, the HHDM (direct-map) offset, and an
/// optional framebuffer descriptor.
///
/// Entries in [`BootSnapshot::memory_map`] are sorted by base address with
/// adjacent same-kind runs coalesced into one entry — the only normalizations
/// this crate performs; everything else is trusted verbatim from the
/// bootloader.
#[derive(Debug, Clone)]
pub struct BootSnapshot {
	memory_map: heapless::Vec<MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES>,
	hhdm_offset: u64,
	framebuffer: Option<FramebufferInfo>,
}

impl BootSnapshot {
	/// Captures a [`BootSnapshot`] from the Limine requests declared in this
	/// crate. Returns `None` if a required response (HHDM offset or memory
	/// map) was not populated by the bootloader.
	#[must_use]
	pub fn capture() -> Option<Self> {
		let hhdm_offset = REQ_HHDM.get_response()?.offset();
		let mmap = REQ_MMAP.get_response()?;

		let mut entries: heapless::Vec<MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES> =
			heapless::Vec::new();
		for region in mmap.entries() {
			let entry = MemoryMapEntry {
				base: region.base,
				length: region.length,
				kind: MemoryKind::from_limine(region.entry_type),
			};
			// Silently drop entries beyond our fixed capacity rather than
			// panicking; `MAX_MEMORY_MAP_ENTRIES` comfortably exceeds any
			// map Limine is known to produce.
			let _ = entries.push(entry);
		}

		let framebuffer = REQ_FB.get_response().and_then(|r| {
			r.framebuffers().next().map(|fb| {
				FramebufferInfo {
					base: fb.addr() as u64,
					width: fb.width(),
					height: fb.height(),
					pitch: fb.pitch(),
					bpp: fb.bpp(),
				}
			})
		});

		Some(Self::from_raw_parts(&entries, hhdm_offset, framebuffer))
	}

	/// Builds a snapshot from already-decoded parts, normalizing the memory
	/// map by sorting on base address and coalescing adjacent same-kind
	/// runs. Exposed so that unit tests (and the architecture-independent
	/// PFA test harness) can fabricate a memory map without a live
	/// bootloader.
	#[must_use]
	pub fn from_raw_parts(
		raw: &[MemoryMapEntry],
		hhdm_offset: u64,
		framebuffer: Option<FramebufferInfo>,
	) -> Self {
		let mut entries: heapless::Vec<MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES> =
			heapless::Vec::new();
		for e in raw {
			let _ = entries.push(*e);
		}
		entries.sort_unstable_by_key(|e| e.base);

		let mut coalesced: heapless::Vec<MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES> =
			heapless::Vec::new();
		for entry in entries {
			if let Some(last) = coalesced.last_mut() {
				if last.kind == entry.kind && last.end() == entry.base {
					last.length += entry.length;
					continue;
				}
			}
			// Capacity was already bounded going in; this cannot overflow.
			let _ = coalesced.push(entry);
		}

		Self {
			memory_map: coalesced,
			hhdm_offset,
			framebuffer,
		}
	}

	/// The normalized, sorted, coalesced physical memory map.
	#[must_use]
	pub fn memory_map(&self) -> &[MemoryMapEntry] {
		&self.memory_map
	}

	/// The direct-map (HHDM) offset: `virt = phys + offset` is a valid
	/// kernel read/write mapping for any physical page.
	#[must_use]
	pub const fn hhdm_offset(&self) -> u64 {
		self.hhdm_offset
	}

	/// The framebuffer descriptor, if the bootloader provided one.
	#[must_use]
	pub const fn framebuffer(&self) -> Option<FramebufferInfo> {
		self.framebuffer
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(base: u64, length: u64, kind: MemoryKind) -> MemoryMapEntry {
		MemoryMapEntry { base, length, kind }
	}

	#[test]
	fn sorts_unordered_entries() {
		let raw = [
			entry(0x10_0000, 0x1000, MemoryKind::Usable),
			entry(0x0, 0x1000, MemoryKind::Reserved),
		];
		let snap = BootSnapshot::from_raw_parts(&raw, 0, None);
		assert_eq!(snap.memory_map()[0].base, 0x0);
		assert_eq!(snap.memory_map()[1].base, 0x10_0000);
	}

	#[test]
	fn coalesces_adjacent_same_kind_runs() {
		let raw = [
			entry(0x0, 0x1000, MemoryKind::Usable),
			entry(0x1000, 0x1000, MemoryKind::Usable),
			entry(0x2000, 0x1000, MemoryKind::Reserved),
		];
		let snap = BootSnapshot::from_raw_parts(&raw, 0, None);
		assert_eq!(snap.memory_map().len(), 2);
		assert_eq!(snap.memory_map()[0].length, 0x2000);
	}

	#[test]
	fn does_not_coalesce_non_adjacent_same_kind() {
		let raw = [
			entry(0x0, 0x1000, MemoryKind::Usable),
			entry(0x5000, 0x1000, MemoryKind::Usable),
		];
		let snap = BootSnapshot::from_raw_parts(&raw, 0, None);
		assert_eq!(snap.memory_map().len(), 2);
	}

	#[test]
	fn allocatable_classification() {
		assert!(MemoryKind::Usable.is_allocatable());
		assert!(MemoryKind::BootloaderReclaimable.is_allocatable());
		assert!(MemoryKind::AcpiReclaimable.is_allocatable());
		assert!(!MemoryKind::Reserved.is_allocatable());
		assert!(!MemoryKind::Bad.is_allocatable());
		assert!(!MemoryKind::AcpiNvs.is_allocatable());
		assert!(!MemoryKind::KernelAndModules.is_allocatable());
		assert!(!MemoryKind::Framebuffer.is_allocatable());
	}
}
