//! The abyss of kernel that operates hardwares.
//!
//! This crate holds the lowest layer the paging code is built on: address
//! types, the explicit-unlock spinlock and the kernel print macros.
//!
//! Instead of using this crate directly, see the [`keos`] crate for the
//! kernel services (physical memory, page tables, block devices and files).
//!
//! [`keos`]: ../keos/index.html
#![cfg_attr(not(test), no_std)]

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod spinlock;
