//! AArch64 MMU control: MAIR/TCR/TTBR/SCTLR programming and TLB
//! maintenance.
//!
//! Descriptor bit layout lives with the portable walker in `mm::paging`;
//! this module only touches system registers.

/// MAIR attribute slots referenced by descriptor AttrIndx.
pub const MAIR_IDX_NORMAL: u64 = 0; // inner-shareable write-back
pub const MAIR_IDX_DEVICE: u64 = 1; // device nGnRE

/// Attr0 = normal memory, write-back non-transient RW-allocate;
/// Attr1 = Device-nGnRE.
const MAIR_VALUE: u64 = 0xFF | (0x04 << 8);

/// 48-bit VAs both halves, 4 KiB granules, inner-shareable WB walks,
/// 48-bit intermediate physical size.
const TCR_VALUE: u64 = (16 << 0)       // T0SZ
    | (0b01 << 8)                       // IRGN0 WB
    | (0b01 << 10)                      // ORGN0 WB
    | (0b11 << 12)                      // SH0 inner
    | (0b00 << 14)                      // TG0 4K
    | (16 << 16)                        // T1SZ
    | (0b01 << 24)                      // IRGN1
    | (0b01 << 26)                      // ORGN1
    | (0b11 << 28)                      // SH1
    | (0b10 << 30)                      // TG1 4K
    | (0b101 << 32); // IPS 48-bit

const SCTLR_M: u64 = 1 << 0; // MMU enable
const SCTLR_C: u64 = 1 << 2; // data cache
const SCTLR_I: u64 = 1 << 12; // instruction cache

/// Program attribute indirection and translation control, install the
/// kernel root in both translation bases, and turn the MMU and caches on.
///
/// # Safety
/// `kernel_root` must identity-map the executing kernel image; the CPU
/// fetches the next instruction through the new tables.
pub unsafe fn enable(kernel_root: u64) {
    core::arch::asm!(
        "msr mair_el1, {mair}",
        "msr tcr_el1, {tcr}",
        "msr ttbr0_el1, {root}",
        "msr ttbr1_el1, {root}",
        "dsb ish",
        "isb",
        "mrs {tmp}, sctlr_el1",
        "orr {tmp}, {tmp}, {sctlr}",
        "msr sctlr_el1, {tmp}",
        "isb",
        mair = in(reg) MAIR_VALUE,
        tcr = in(reg) TCR_VALUE,
        root = in(reg) kernel_root,
        sctlr = in(reg) SCTLR_M | SCTLR_C | SCTLR_I,
        tmp = out(reg) _,
        options(nostack)
    );
}

/// Install a user translation base and drop all stale entries.
///
/// # Safety
/// See [`crate::arch::set_translation_base`].
#[inline]
pub unsafe fn set_translation_base(root: u64) {
    core::arch::asm!(
        "msr ttbr0_el1, {root}",
        "dsb ishst",
        "tlbi vmalle1is",
        "dsb ish",
        "isb",
        root = in(reg) root,
        options(nostack)
    );
}

#[inline]
pub fn flush_tlb_page(vaddr: u64) {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {addr}",
            "dsb ish",
            "isb",
            addr = in(reg) vaddr >> 12,
            options(nostack)
        );
    }
}

#[inline]
pub fn flush_tlb_all() {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            options(nostack)
        );
    }
}
