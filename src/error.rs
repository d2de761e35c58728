//! Kernel error kinds.
//!
//! Low-level allocation and I/O failures bubble up as `KernelError` until the
//! system-call boundary, where each kind maps onto the user-visible return
//! convention (`false`, `-1`, or a null handle).

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Heap or frame allocation failed.
    OutOfMemory,
    /// No free slot remains on the swap device.
    SwapFull,
    /// Malformed argument: bad pointer, bad alignment, zero length, overlap.
    InvalidArgument,
    /// File descriptor is not open or out of range.
    BadFd,
    /// Path lookup miss.
    NotFound,
    /// Name collision in a directory.
    AlreadyExists,
    /// Operation needs a regular file but found a directory.
    IsDirectory,
    /// Operation needs a directory but found something else.
    NotDirectory,
    /// The block device failed a sector transfer.
    DeviceError,
    /// The per-process file table is full.
    TooManyOpenFiles,
    /// A path component exceeds `NAME_MAX` or a path exceeds `MAXPATH`.
    NameTooLong,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::SwapFull => "swap device full",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::BadFd => "bad file descriptor",
            KernelError::NotFound => "not found",
            KernelError::AlreadyExists => "already exists",
            KernelError::IsDirectory => "is a directory",
            KernelError::NotDirectory => "not a directory",
            KernelError::DeviceError => "device error",
            KernelError::TooManyOpenFiles => "too many open files",
            KernelError::NameTooLong => "name too long",
        };
        write!(f, "{}", msg)
    }
}
