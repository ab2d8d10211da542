use crate::utils::human_readable_bytes;
use std::fmt;
use thiserror::Error;

/// Raw status code returned by a vendor driver call.
///
/// The numeric values follow the Level Zero `ze_result_t` numbering, which is the
/// widest of the supported backends; other backends map their codes onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeStatus(pub i32);

impl NativeStatus {
    pub const SUCCESS: Self = Self(0);
    pub const NOT_READY: Self = Self(1);
    pub const ERROR_DEVICE_LOST: Self = Self(0x7000_0001);
    pub const ERROR_OUT_OF_HOST_MEMORY: Self = Self(0x7000_0002);
    pub const ERROR_OUT_OF_DEVICE_MEMORY: Self = Self(0x7000_0003);
    pub const ERROR_UNINITIALIZED: Self = Self(0x7800_0001);
    pub const ERROR_UNSUPPORTED_FEATURE: Self = Self(0x7800_0003);
    pub const ERROR_INVALID_ARGUMENT: Self = Self(0x7800_0004);
    pub const ERROR_INVALID_NULL_HANDLE: Self = Self(0x7800_0005);
    pub const ERROR_INVALID_SIZE: Self = Self(0x7800_0008);
    pub const ERROR_INVALID_GROUP_SIZE_DIMENSION: Self = Self(0x7800_0017);
    pub const ERROR_UNKNOWN: Self = Self(0x7fff_fffe);

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Maps a negated errno (as returned by KFD ioctls) onto a status code.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOMEM => Self::ERROR_OUT_OF_DEVICE_MEMORY,
            libc::EINVAL => Self::ERROR_INVALID_ARGUMENT,
            libc::EBADF => Self::ERROR_INVALID_NULL_HANDLE,
            libc::ENODEV | libc::EIO => Self::ERROR_DEVICE_LOST,
            libc::ENOTSUP => Self::ERROR_UNSUPPORTED_FEATURE,
            _ => Self::ERROR_UNKNOWN,
        }
    }

    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        err.raw_os_error()
            .map_or(Self::ERROR_UNKNOWN, Self::from_errno)
    }

    const fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "SUCCESS",
            Self::NOT_READY => "NOT_READY",
            Self::ERROR_DEVICE_LOST => "ERROR_DEVICE_LOST",
            Self::ERROR_OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            Self::ERROR_OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            Self::ERROR_UNINITIALIZED => "ERROR_UNINITIALIZED",
            Self::ERROR_UNSUPPORTED_FEATURE => "ERROR_UNSUPPORTED_FEATURE",
            Self::ERROR_INVALID_ARGUMENT => "ERROR_INVALID_ARGUMENT",
            Self::ERROR_INVALID_NULL_HANDLE => "ERROR_INVALID_NULL_HANDLE",
            Self::ERROR_INVALID_SIZE => "ERROR_INVALID_SIZE",
            Self::ERROR_INVALID_GROUP_SIZE_DIMENSION => "ERROR_INVALID_GROUP_SIZE_DIMENSION",
            Self::ERROR_UNKNOWN => "ERROR_UNKNOWN",
            _ => return None,
        })
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:x})", self.0),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}

/// A driver call that returned a non-success status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("native call {call} failed with status {status}")]
pub struct NativeCallFailure {
    pub call: &'static str,
    pub status: NativeStatus,
}

#[derive(Error, Debug)]
pub enum AccelError {
    /// Recoverable: the caller should fall back to non-accelerated execution.
    #[error("[Bailout] {0}")]
    Bailout(String),

    #[error(
        "Out of memory on the target device -> {device}. [Heap limit is: {} and the application requires: {required} bytes ({}), available: {available} bytes ({})]\nSet ACCEL_HEAP_ALLOCATION=<size> to tune the device heap, e.g. ACCEL_HEAP_ALLOCATION=2GB",
        human_readable_bytes(*limit),
        human_readable_bytes(*required),
        human_readable_bytes(*available)
    )]
    OutOfMemory {
        device: String,
        required: u64,
        available: u64,
        limit: u64,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Device required not found: {index} (device count: {count})")]
    DeviceNotFound { index: usize, count: usize },

    #[error(transparent)]
    Native(#[from] NativeCallFailure),

    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

impl AccelError {
    /// True when the error asks the caller to fall back to host execution.
    #[must_use]
    pub const fn is_bailout(&self) -> bool {
        matches!(self, Self::Bailout(_))
    }
}

pub type AccelResult<T> = Result<T, AccelError>;
