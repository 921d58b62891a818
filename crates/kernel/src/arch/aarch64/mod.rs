//! AArch64 support: DAIF gate, context switch, MMU and TLB control.

pub mod context;
pub mod irq;
pub mod mmu;
