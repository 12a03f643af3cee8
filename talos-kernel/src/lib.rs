//! Boot glue for the talos kernel memory core.
//!
//! Everything this workspace's `SPEC_FULL.md` scope actually covers -- the
//! physical frame allocator, the `x86_64` page-table backend, the VMM, and
//! the heap -- lives in `talos-mem`, `talos-arch-x86_64`, `talos-vmm`, and
//! `talos-heap`. This crate is the thin wiring that calls them in the right
//! order from the bootloader's entry point and then parks the boot core;
//! it owns no allocator, mapping, or PFA logic of its own.
//!
//! The actual ELF entry sequence, linker script, and target specification
//! that get a `_start` symbol invoked in the first place are an external
//! collaborator this core does not implement, the same way the framebuffer
//! console and the `log::Log` sink are (see `spec.md` §1 and §6); only the
//! `[[bin]]` shim in `bin/x86_64.rs` exists to give Limine a symbol to jump
//! to.
#![no_std]

use talos_arch_x86_64::{Backend, Cpu, X86Cpu};
use talos_boot::BootSnapshot;
use talos_mem::{pfa, translate};
use talos_vmm::Vmm;

/// Captures the boot snapshot, brings up the physical frame allocator, the
/// `x86_64` page-table backend, the VMM, and the kernel heap, in that
/// dependency order, then parks the calling core.
///
/// Every step here is infallible in the sense that matters to this crate:
/// a failure at any of them means the machine cannot run a kernel at all,
/// so each is unwrapped rather than propagated -- there is no caller above
/// this function to hand an error back to.
///
/// # Safety
///
/// Must be called exactly once, from the architecture entry point in
/// `bin/`, before interrupts are enabled and before any other code touches
/// [`talos_mem::pfa::GLOBAL`], [`talos_heap::GLOBAL`], or the VMM this
/// function constructs.
pub unsafe fn boot() -> ! {
	let boot = BootSnapshot::capture().expect("bootloader did not supply a usable memory map");
	translate::set_global_map_offset(boot.hhdm_offset());

	pfa::GLOBAL.init(&boot).expect("physical frame allocator init failed");
	let stats = pfa::GLOBAL.stats().expect("pfa was just initialized");
	log::info!(
		"boot: {} frames total, {} free, {} reserved",
		stats.total_pages,
		stats.free_pages,
		stats.reserved_pages,
	);

	let cpu = X86Cpu;
	cpu.enable_nx();

	let backend = Backend::new(&cpu, &pfa::GLOBAL, boot.hhdm_offset());
	let kernel_handle = backend
		.init_kernel_space()
		.expect("failed to allocate the kernel root page table");
	let vmm = Vmm::new(backend);
	vmm.init(kernel_handle).expect("vmm already initialized");
	log::info!("boot: vmm initialized, kernel address space ready");

	talos_heap::GLOBAL.init_from_pfa().expect("heap init failed");
	log::info!("boot: heap initialized");

	// Everything above this core's own scope -- scheduler, drivers, ACPI,
	// user-mode entry -- starts from here in a complete kernel; none of it
	// is this core's responsibility.
	loop {
		cpu.pause();
	}
}

/// Halts the calling core in response to a panic.
///
/// This core's responsibility ends at the point something in it already
/// called `log::error!` (or, for an integrity failure, is about to); there
/// is no recovery path, and no attempt is made to construct one here.
///
/// # Safety
///
/// Must only be invoked as the architecture entry point's `#[panic_handler]`.
pub unsafe fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
	loop {
		core::hint::spin_loop();
	}
}
