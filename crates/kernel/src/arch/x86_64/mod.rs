//! x86_64 support: RFLAGS.IF gate, context switch, CR3 and TLB control.

pub mod context;
pub mod irq;
pub mod mmu;
