//! x86_64 MMU control.
//!
//! Firmware (UEFI/Limine) enters the kernel with paging already live, so
//! there is no enable sequence here; the kernel only swaps CR3 roots and
//! maintains the TLB. Descriptor bit layout lives with the portable
//! walker in `mm::paging`.

use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

/// Install a new top-level table. Writing CR3 flushes all non-global TLB
/// entries as a side effect.
///
/// # Safety
/// See [`crate::arch::set_translation_base`].
#[inline]
pub unsafe fn set_translation_base(root: u64) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root));
    Cr3::write(frame, Cr3Flags::empty());
}

#[inline]
pub fn flush_tlb_page(vaddr: u64) {
    tlb::flush(VirtAddr::new(vaddr));
}

#[inline]
pub fn flush_tlb_all() {
    tlb::flush_all();
}

/// Current translation base, as left by firmware.
pub fn current_translation_base() -> u64 {
    Cr3::read().0.start_address().as_u64()
}
