// Kernel logging (printk) with ring buffer
//
// Every message lands in a fixed-size in-kernel ring of timestamped
// entries; WARN and above are mirrored to the serial console immediately.
// Bring-up code logs structured name=value context on the same path.

use crate::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Runtime log threshold; messages above it only reach the ring buffer.
static CONSOLE_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

pub fn set_console_level(level: LogLevel) {
    CONSOLE_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn console_level() -> LogLevel {
    match CONSOLE_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[derive(Copy, Clone)]
pub struct LogEntry {
    pub timestamp_us: u64,
    pub level: LogLevel,
    pub message: [u8; 192],
    pub len: usize,
}

struct LogBuffer {
    buffer: Mutex<RingBuffer<LogEntry, 1024>>,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new()),
        }
    }
}

static KERNEL_LOG: LogBuffer = LogBuffer::new();

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::uart::write_bytes(s.as_bytes());
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    let mut message = [0u8; 192];
    let msg_str = alloc::format!("{}", args);
    let len = core::cmp::min(msg_str.len(), message.len());
    message[..len].copy_from_slice(&msg_str.as_bytes()[..len]);

    let entry = LogEntry {
        timestamp_us: crate::time::get_timestamp_us(),
        level,
        message,
        len,
    };
    KERNEL_LOG.buffer.lock().push(entry);

    if level <= console_level() {
        let mut writer = ConsoleWriter;
        let _ = write!(writer, "[{}] {}\n", level.as_str(), msg_str);
    }
}

/// Drain the whole log ring, oldest entry first.
pub fn drain_log() -> alloc::vec::Vec<LogEntry> {
    KERNEL_LOG.buffer.lock().drain_all()
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_land_in_ring() {
        crate::info!("printk ring smoke {}", 42);
        let entries = drain_log();
        let hit = entries
            .iter()
            .find(|e| &e.message[..e.len] == b"printk ring smoke 42")
            .expect("ring holds the entry");
        assert_eq!(hit.level, LogLevel::Info);
    }

    #[test]
    fn long_messages_truncate() {
        let long = "y".repeat(500);
        crate::printk::log(LogLevel::Debug, format_args!("{}", long));
        let entries = drain_log();
        assert!(entries
            .iter()
            .any(|e| e.len == 192 && e.message.iter().all(|&b| b == b'y')));
    }
}
