//! Monotonic time.
//!
//! ARM generic timer on AArch64, TSC on x86_64. Only used for log
//! timestamps and coarse bring-up delays; hardware waits that need hard
//! bounds use retry counts instead (see `drivers`).

use core::sync::atomic::{AtomicU64, Ordering};

static BOOT_TIMESTAMP_US: AtomicU64 = AtomicU64::new(0);

/// Assumed TSC frequency until calibration data is available.
#[cfg(target_arch = "x86_64")]
const TSC_KHZ_FALLBACK: u64 = 2_000_000;

/// Current timestamp in microseconds.
pub fn get_timestamp_us() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let cntpct: u64;
        let cntfrq: u64;
        core::arch::asm!("mrs {0}, cntpct_el0", out(reg) cntpct, options(nomem, nostack));
        core::arch::asm!("mrs {0}, cntfrq_el0", out(reg) cntfrq, options(nomem, nostack));
        if cntfrq > 0 {
            cntpct / (cntfrq / 1_000_000).max(1)
        } else {
            // QEMU sometimes leaves CNTFRQ unset; assume 62.5 MHz
            cntpct / 62
        }
    }

    #[cfg(target_arch = "x86_64")]
    {
        let tsc = unsafe { core::arch::x86_64::_rdtsc() };
        tsc / (TSC_KHZ_FALLBACK / 1_000)
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        0
    }
}

/// Record the boot instant; later uptimes are relative to it.
pub fn init_boot_timestamp() {
    BOOT_TIMESTAMP_US.store(get_timestamp_us(), Ordering::Relaxed);
}

pub fn uptime_us() -> u64 {
    get_timestamp_us().saturating_sub(BOOT_TIMESTAMP_US.load(Ordering::Relaxed))
}

pub fn uptime_ms() -> u64 {
    uptime_us() / 1000
}
