//! Spinlocks.
//!
//! `SpinLock` is the plain primitive for data never touched by interrupt
//! handlers. `IrqSpinLock` is the only lock permitted around data an
//! interrupt handler shares with task code: acquisition saves the CPU
//! interrupt-mask state and masks IRQs, release restores the saved state
//! verbatim after dropping the lock word.
//!
//! Acquire establishes acquire-ordering, release establishes
//! release-ordering; memory operations inside the critical section are not
//! observable out of order by other CPUs taking the same lock. On ARM64
//! the contended path parks in `wfe` and unlock posts `sev`; on x86_64 the
//! contended path is a `pause` read-spin before retrying `lock cmpxchg`.

use crate::arch;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

pub struct SpinLock<T: ?Sized> {
    word: AtomicU32,
    #[cfg(feature = "lock-debug")]
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
            #[cfg(feature = "lock-debug")]
            name: "<anon>",
            data: UnsafeCell::new(data),
        }
    }

    #[cfg(feature = "lock-debug")]
    pub const fn named(name: &'static str, data: T) -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    fn acquire(&self) {
        loop {
            if self
                .word
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // Read-spin until the word looks free, then retry the exchange
            while self.word.load(Ordering::Relaxed) == LOCKED {
                arch::cpu_relax();
            }
        }
    }

    fn release(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
        arch::send_event();
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == LOCKED
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Spinlock whose critical sections run with IRQs masked.
pub struct IrqSpinLock<T: ?Sized> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: SpinLock::new(data),
        }
    }
}

impl<T: ?Sized> IrqSpinLock<T> {
    /// Mask IRQs, take the lock, and hand back a guard owning the saved
    /// mask token. Dropping the guard releases the lock first, then
    /// restores the pre-acquire mask state verbatim.
    pub fn lock_irq_save(&self) -> IrqSpinLockGuard<'_, T> {
        let saved = arch::irq_save();
        self.inner.acquire();
        IrqSpinLockGuard { lock: self, saved }
    }

    pub fn try_lock_irq_save(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved = arch::irq_save();
        if self
            .inner
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard { lock: self, saved })
        } else {
            unsafe { arch::irq_restore(saved) };
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct IrqSpinLockGuard<'a, T: ?Sized> {
    lock: &'a IrqSpinLock<T>,
    saved: arch::IrqMask,
}

impl<T: ?Sized> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.inner.release();
        unsafe { arch::irq_restore(self.saved) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_excludes_and_releases() {
        let lock = SpinLock::new(5u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn irq_mask_restored_after_release() {
        // The pre-acquire interrupt state must survive a lock/unlock cycle
        let lock = IrqSpinLock::new(0u32);
        assert!(crate::arch::irqs_enabled());
        {
            let mut g = lock.lock_irq_save();
            *g = 7;
            assert!(!crate::arch::irqs_enabled());
        }
        assert!(crate::arch::irqs_enabled());
    }

    #[test]
    fn nested_irq_sections_restore_outermost_state() {
        let a = IrqSpinLock::new(());
        let b = IrqSpinLock::new(());
        let outer = a.lock_irq_save();
        {
            let _inner = b.lock_irq_save();
            assert!(!crate::arch::irqs_enabled());
        }
        // Inner release restores "masked", not "enabled"
        assert!(!crate::arch::irqs_enabled());
        drop(outer);
        assert!(crate::arch::irqs_enabled());
    }

    #[test]
    fn contended_lock_hands_over() {
        use std::sync::Arc;
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *l.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
