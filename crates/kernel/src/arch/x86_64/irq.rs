// IRQ mask gate (RFLAGS interrupt flag).

use x86_64::registers::rflags::{self, RFlags};

/// Read RFLAGS, mask interrupts, and return the previous value verbatim.
#[inline]
pub fn irq_save() -> u64 {
    let flags = rflags::read_raw();
    x86_64::instructions::interrupts::disable();
    flags
}

/// Restore a previously saved RFLAGS interrupt state.
///
/// # Safety
/// `mask` must come from `irq_save` on this CPU.
#[inline]
pub unsafe fn irq_restore(mask: u64) {
    if RFlags::from_bits_truncate(mask).contains(RFlags::INTERRUPT_FLAG) {
        x86_64::instructions::interrupts::enable();
    }
}

#[inline]
pub fn irqs_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

/// Contention hint inside spin loops.
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop()
}

/// No monitor/event machinery on this port; unlock needs no broadcast.
#[inline]
pub fn send_event() {}
