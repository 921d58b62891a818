// Kernel error handling and errno definitions

/// Kernel-internal error kinds.
///
/// Every fallible kernel operation returns one of these; the syscall layer
/// converts them to negated errno values for userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    /// Address outside any valid mapping or user range
    InvalidAddress,
    /// `map` target leaf slot already holds a valid entry
    AlreadyMapped,
    /// `unmap`/`translate` target has no valid leaf entry
    NotMapped,
    InvalidArgument,
    NoSuchTask,
    PermissionDenied,
    /// Bounded hardware wait expired (reset, handshake, handoff)
    DeviceTimeout,
    /// Device violated its protocol (e.g. FEATURES_OK not confirmed)
    ProtocolError,
    Unsupported,
    /// Malformed binary image (ELF magic/class/machine mismatch)
    BadFormat,
    Busy,
}

pub type Result<T> = core::result::Result<T, KernelError>;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such file or directory
    ESRCH = 3,       // No such process
    EIO = 5,         // I/O error
    E2BIG = 7,       // Argument list too long
    ENOEXEC = 8,     // Exec format error
    EBADF = 9,       // Bad file descriptor
    ECHILD = 10,     // No child processes
    EAGAIN = 11,     // Try again / would block
    ENOMEM = 12,     // Out of memory
    EACCES = 13,     // Permission denied
    EFAULT = 14,     // Bad address
    EBUSY = 16,      // Device or resource busy
    EEXIST = 17,     // File exists
    ENODEV = 19,     // No such device
    EINVAL = 22,     // Invalid argument
    ENOSYS = 38,     // Function not implemented
    ENOTSUP = 95,    // Operation not supported
    ETIMEDOUT = 110, // Operation timed out
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::InvalidAddress => Errno::EFAULT,
            KernelError::AlreadyMapped => Errno::EEXIST,
            KernelError::NotMapped => Errno::EFAULT,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::NoSuchTask => Errno::ESRCH,
            KernelError::PermissionDenied => Errno::EPERM,
            KernelError::DeviceTimeout => Errno::ETIMEDOUT,
            KernelError::ProtocolError => Errno::EIO,
            KernelError::Unsupported => Errno::ENOTSUP,
            KernelError::BadFormat => Errno::ENOEXEC,
            KernelError::Busy => Errno::EBUSY,
        }
    }
}

impl Errno {
    /// Negated value as returned through the syscall register.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EIO => "I/O error",
            Errno::E2BIG => "Argument list too long",
            Errno::ENOEXEC => "Exec format error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EBUSY => "Device or resource busy",
            Errno::EEXIST => "File exists",
            Errno::ENODEV => "No such device",
            Errno::EINVAL => "Invalid argument",
            Errno::ENOSYS => "Function not implemented",
            Errno::ENOTSUP => "Operation not supported",
            Errno::ETIMEDOUT => "Operation timed out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_memory_errors() {
        assert_eq!(Errno::from(KernelError::OutOfMemory), Errno::ENOMEM);
        assert_eq!(Errno::from(KernelError::NotMapped), Errno::EFAULT);
        assert_eq!(Errno::from(KernelError::BadFormat), Errno::ENOEXEC);
    }

    #[test]
    fn errno_negation() {
        assert_eq!(Errno::ENOMEM.as_isize(), -12);
        assert_eq!(Errno::ESRCH.as_isize(), -3);
    }
}
