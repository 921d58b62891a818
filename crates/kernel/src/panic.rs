//! Panic policy for bare-metal builds.
//!
//! A kernel-mode panic is a mandatory-invariant failure: print a banner
//! with whatever the panic machinery knows, mask interrupts, and spin
//! waiting for interrupts so an attached debugger can inspect the wreck.

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::uart::write_bytes(b"\n*** KERNEL PANIC ***\n");

    if let Some(location) = info.location() {
        crate::error!(
            "panic at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    crate::error!("{}", info.message());

    halt()
}

/// Mask interrupts and spin forever.
pub fn halt() -> ! {
    loop {
        unsafe {
            #[cfg(target_arch = "aarch64")]
            core::arch::asm!("msr daifset, #0xf", "wfi", options(nostack, preserves_flags));
            #[cfg(target_arch = "x86_64")]
            core::arch::asm!("cli", "hlt", options(nostack, preserves_flags));
        }
    }
}
