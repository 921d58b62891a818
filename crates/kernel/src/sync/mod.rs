//! IRQ-safe synchronization primitives.

pub mod spinlock;

pub use spinlock::{IrqSpinLock, IrqSpinLockGuard, SpinLock, SpinLockGuard};
