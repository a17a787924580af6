//! # KeOS: KAIST Educational Operating System
//!
//! This crate provides the kernel services the virtual-memory subsystem is
//! written against:
//!
//! - [`mm`]: the pool of physical frames handed out as owned [`mm::Page`]s,
//!   and the [`mm::page_table::PageTable`] trait that stands for the
//!   hardware page table of one address space.
//! - [`fs`]: the block device ([`fs::Disk`]) used as swap, and reference
//!   counted regular-file handles ([`fs::RegularFile`]).
//! - [`sync`]: the explicit-unlock [`sync::SpinLock`].
//!
//! Each service is a trait at the hardware boundary so that the paging code
//! runs the same on the real machine and on the simulated hardware the test
//! suites build.
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate abyss;
extern crate alloc;

pub mod fs;
pub mod mm;
pub mod sync;

pub use abyss::{addressing, debug, info, warning};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation. These errors can be
/// returned to the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            KernelError::OperationNotPermitted => "operation not permitted",
            KernelError::NoSuchEntry => "no such entry",
            KernelError::IOError => "I/O error",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::NoMemory => "out of memory",
            KernelError::InvalidAccess => "invalid access",
            KernelError::BadAddress => "bad address",
            KernelError::Busy => "device or resource busy",
            KernelError::FileExist => "already exists",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NoSpace => "no space left on device",
            KernelError::NotSupportedOperation => "operation not supported",
        };
        f.write_str(msg)
    }
}
