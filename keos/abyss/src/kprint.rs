//! Kernel print utilities.
//!
//! The macros keep the names the rest of the kernel is written against, but
//! forward to the [`log`] facade so the embedding kernel (or a test) decides
//! where the messages end up. Nothing is printed until a logger is installed.

#[doc(hidden)]
pub use log as __log;

/// Display an information message.
///
/// Use the format! syntax to write data to the installed logger.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::__log::info!($($arg)*));
}

/// Display a warning message.
///
/// Use the format! syntax to write data to the installed logger.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::__log::warn!($($arg)*));
}

/// Display a debug message.
///
/// Use the format! syntax to write data to the installed logger.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ($crate::kprint::__log::debug!($($arg)*));
}
