/// Device bring-up engines.
///
/// Bring-up failures are never fatal: the device is logged, marked
/// unusable, and the system continues. Every hardware wait is bounded by
/// a retry count.
pub mod pci;
pub mod usb;
pub mod virtio;

use crate::error::KernelError;

/// Driver-facing error type; converts into the kernel-wide kinds at the
/// subsystem boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Bounded wait expired after this many polls
    Timeout(u32),
    NotInitialized,
    InvalidParameter,
    /// Device answered outside its protocol
    Protocol,
    NotSupported,
    Busy,
    OutOfMemory,
    DeviceNotFound,
}

impl DriverError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "Timeout",
            Self::NotInitialized => "NotInitialized",
            Self::InvalidParameter => "InvalidParameter",
            Self::Protocol => "Protocol",
            Self::NotSupported => "NotSupported",
            Self::Busy => "Busy",
            Self::OutOfMemory => "OutOfMemory",
            Self::DeviceNotFound => "DeviceNotFound",
        }
    }
}

impl From<DriverError> for KernelError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Timeout(_) => KernelError::DeviceTimeout,
            DriverError::Protocol => KernelError::ProtocolError,
            DriverError::NotSupported => KernelError::Unsupported,
            DriverError::Busy => KernelError::Busy,
            DriverError::OutOfMemory => KernelError::OutOfMemory,
            DriverError::InvalidParameter => KernelError::InvalidArgument,
            DriverError::NotInitialized | DriverError::DeviceNotFound => {
                KernelError::Unsupported
            }
        }
    }
}

impl From<KernelError> for DriverError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => DriverError::OutOfMemory,
            KernelError::DeviceTimeout => DriverError::Timeout(0),
            KernelError::ProtocolError => DriverError::Protocol,
            KernelError::Busy => DriverError::Busy,
            _ => DriverError::InvalidParameter,
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Poll `ready` up to `attempts` times with a relax hint between polls.
pub fn poll_until(attempts: u32, mut ready: impl FnMut() -> bool) -> DriverResult<()> {
    for _ in 0..attempts {
        if ready() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(DriverError::Timeout(attempts))
}
