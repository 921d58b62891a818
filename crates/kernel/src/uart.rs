//! Serial console.
//!
//! PL011 on ARM64 platforms (QEMU virt, Apple Silicon bring-up), 16550 on
//! x86_64. Output is best-effort: before `init` runs (and on hosted test
//! builds, where it never runs) writes are dropped rather than touching
//! unmapped MMIO.

use core::sync::atomic::{AtomicUsize, Ordering};

/// MMIO base of the active console, 0 until `init`.
static UART_BASE: AtomicUsize = AtomicUsize::new(0);

#[cfg(target_arch = "aarch64")]
mod pl011 {
    // PL011 register offsets
    pub const DR: usize = 0x000;
    pub const FR: usize = 0x018;
    pub const IBRD: usize = 0x024;
    pub const FBRD: usize = 0x028;
    pub const LCRH: usize = 0x02C;
    pub const CR: usize = 0x030;

    // Flag register bits
    pub const FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

    // Control register bits
    pub const CR_RXE: u32 = 1 << 9;
    pub const CR_TXE: u32 = 1 << 8;
    pub const CR_UARTEN: u32 = 1 << 0;

    // Line control bits
    pub const LCRH_WLEN_8: u32 = 3 << 5;
    pub const LCRH_FEN: u32 = 1 << 4;
}

#[cfg(target_arch = "x86_64")]
static COM1: spin::Mutex<Option<uart_16550::SerialPort>> = spin::Mutex::new(None);

/// Bring up the console.
///
/// On ARM64 `base` is the PL011 MMIO base and `clock_hz` its input clock;
/// both come from the device tree. On x86_64 the arguments are ignored and
/// COM1 is used.
pub unsafe fn init(base: usize, clock_hz: u32) {
    #[cfg(target_arch = "aarch64")]
    {
        use core::ptr::{read_volatile, write_volatile};
        use pl011::*;

        let reg = |off: usize| (base + off) as *mut u32;

        // Disable while reprogramming
        write_volatile(reg(CR), 0);

        // 115200 baud from the platform clock: divisor = clk / (16 * baud)
        let baud = 115_200u32;
        let clk = if clock_hz != 0 { clock_hz } else { 24_000_000 };
        let div_x64 = (clk / (16 * baud)) * 64 + ((clk % (16 * baud)) * 64) / (16 * baud);
        write_volatile(reg(IBRD), (div_x64 / 64).max(1));
        write_volatile(reg(FBRD), div_x64 % 64);

        // 8n1 with FIFOs
        write_volatile(reg(LCRH), LCRH_WLEN_8 | LCRH_FEN);
        write_volatile(reg(CR), CR_UARTEN | CR_TXE | CR_RXE);

        let _ = read_volatile(reg(FR));
    }

    #[cfg(target_arch = "x86_64")]
    {
        let _ = (base, clock_hz);
        let mut port = uart_16550::SerialPort::new(0x3F8);
        port.init();
        *COM1.lock() = Some(port);
    }

    UART_BASE.store(if base != 0 { base } else { 1 }, Ordering::Release);
}

/// Write raw bytes to the console. Silently drops output while the console
/// is uninitialized.
pub fn write_bytes(bytes: &[u8]) {
    if UART_BASE.load(Ordering::Acquire) == 0 {
        return;
    }

    #[cfg(target_arch = "aarch64")]
    {
        use core::ptr::{read_volatile, write_volatile};
        use pl011::*;

        let base = UART_BASE.load(Ordering::Acquire);
        for &b in bytes {
            unsafe {
                while read_volatile((base + FR) as *const u32) & FR_TXFF != 0 {
                    core::hint::spin_loop();
                }
                write_volatile((base + DR) as *mut u32, b as u32);
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    {
        if let Some(port) = COM1.lock().as_mut() {
            for &b in bytes {
                port.send(b);
            }
        }
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    let _ = bytes;
}
