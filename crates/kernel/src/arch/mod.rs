//! Architecture support.
//!
//! Everything the portable kernel needs from the CPU lives behind this
//! module: the saved-context type and switch routine, the IRQ mask gate,
//! TLB maintenance, and MMU control. The scheduler and memory manager
//! never look inside the per-architecture types.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
use self::aarch64 as imp;
#[cfg(target_arch = "x86_64")]
use self::x86_64 as imp;

pub use imp::context::{Context, TrapFrame};

/// Opaque saved interrupt-mask state (DAIF on ARM64, RFLAGS.IF on x86_64).
pub type IrqMask = u64;

/// Switch from `old` to `new`, saving the callee-saved register state of
/// the caller into `old` and resuming whatever `new` last saved. Returns
/// when something later switches back into `old`.
///
/// # Safety
/// Both pointers must reference valid, distinct contexts; `new` must have
/// been initialized by `Context::new_kernel`/`new_forked` or by a previous
/// switch, and its stack must be live.
#[inline]
pub unsafe fn context_switch(old: *mut Context, new: *const Context) {
    imp::context::switch(old, new)
}

#[cfg(not(test))]
pub use imp::irq::{irq_restore, irq_save, irqs_enabled};

#[cfg(not(test))]
#[inline]
pub fn cpu_relax() {
    imp::irq::cpu_relax()
}

#[cfg(not(test))]
#[inline]
pub fn send_event() {
    imp::irq::send_event()
}

#[cfg(not(test))]
#[inline]
pub fn flush_tlb_page(vaddr: u64) {
    imp::mmu::flush_tlb_page(vaddr)
}

#[cfg(not(test))]
#[inline]
pub fn flush_tlb_all() {
    imp::mmu::flush_tlb_all()
}

/// Install a new translation base (TTBR0_EL1 / CR3) and flush the TLB.
///
/// # Safety
/// `root` must point to a valid top-level page table whose kernel half
/// matches the currently executing code.
#[cfg(not(test))]
#[inline]
pub unsafe fn set_translation_base(root: u64) {
    imp::mmu::set_translation_base(root)
}

// Hosted test builds model the IRQ mask (per thread, standing in for
// per-CPU) and count TLB maintenance instead of executing privileged
// instructions.
#[cfg(test)]
mod hosted {
    use core::sync::atomic::{AtomicU64, Ordering};

    std::thread_local! {
        static IRQS_ON: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
    }
    pub static TLB_PAGE_FLUSHES: AtomicU64 = AtomicU64::new(0);
    pub static TLB_FULL_FLUSHES: AtomicU64 = AtomicU64::new(0);

    pub fn irq_save() -> u64 {
        IRQS_ON.with(|c| {
            let prev = c.get();
            c.set(false);
            prev as u64
        })
    }

    pub unsafe fn irq_restore(mask: u64) {
        IRQS_ON.with(|c| c.set(mask != 0));
    }

    pub fn irqs_enabled() -> bool {
        IRQS_ON.with(|c| c.get())
    }

    pub fn flush_tlb_page(_vaddr: u64) {
        TLB_PAGE_FLUSHES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_tlb_all() {
        TLB_FULL_FLUSHES.fetch_add(1, Ordering::Relaxed);
    }

    pub unsafe fn set_translation_base(_root: u64) {
        TLB_FULL_FLUSHES.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub use hosted::*;

#[cfg(test)]
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop()
}

#[cfg(test)]
#[inline]
pub fn send_event() {}
