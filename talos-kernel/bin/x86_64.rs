//! Main entry point for the talos kernel on `x86_64`.
#![no_std]
#![no_main]

/// Panic handler for the kernel.
#[panic_handler]
unsafe fn panic(info: &::core::panic::PanicInfo<'_>) -> ! {
	// SAFETY: this is the architecture entry point's own panic handler,
	// SAFETY: the only place allowed to call this function.
	unsafe { ::talos_kernel::panic(info) }
}

/// Main entry point for the talos kernel.
///
/// # Safety
///
/// Do **NOT** call this function directly. It is called by the Limine
/// bootloader as the kernel's ELF entry point.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
	// SAFETY: this is the kernel's entry point, called by the bootloader
	// SAFETY: exactly once before anything else touches the memory core.
	unsafe { ::talos_kernel::boot() }
}
