//! Filesystem abstraction.
//!
//! Two kinds of storage back user pages once they leave memory: regular files
//! (for file-backed pages and lazily loaded program segments) and a raw block
//! device (for swapped-out anonymous pages). Both are reached through traits
//! defined in [`traits`], wrapped in cheap reference-counted handles.

/// Defines traits for storage devices and files.
pub mod traits {
    use super::{FileBlockNumber, Sector};
    use crate::KernelError;

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports block-granular read
    /// and write operations.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file into the provided buffer.
        ///
        /// # Parameters
        /// - `fba`: The `FileBlockNumber` which to read.
        /// - `buf`: A mutable array where the file content will be stored.
        ///
        /// # Returns
        /// - `Ok(true)`: If the block lies within the file.
        /// - `Ok(false)`: If the block lies past the end of the file; `buf` is
        ///   zero-filled.
        /// - `Err(Error)`: An error occured while the read operation.
        fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError>;

        /// Writes a 4096-byte page of data into the specified file block.
        ///
        /// If the target block lies beyond the current end of the file, the
        /// file may be extended up to `min_size` bytes to accommodate the
        /// write.
        fn write(
            &self,
            fba: FileBlockNumber,
            buf: &[u8; 4096],
            min_size: usize,
        ) -> Result<(), KernelError>;
    }

    /// Trait representing a sector-addressed block device.
    pub trait Disk
    where
        Self: Send + Sync,
    {
        /// Number of 512-byte sectors of the device.
        fn sector_count(&self) -> usize;

        /// Read 512 bytes from disk starting from sector.
        fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError>;

        /// Write 512 bytes to disk starting from sector.
        fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError>;
    }
}

use crate::KernelError;
use alloc::{boxed::Box, sync::Arc};

/// This struct provides a reference-counted handle to a file that supports
/// byte-granular reading and writing operations at the kernel level.
///
/// The file is closed when the last handle is dropped.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Opens another handle to the same file.
    ///
    /// The new handle keeps the file open independently of `self`.
    #[inline]
    pub fn reopen(&self) -> Self {
        Self(self.0.clone())
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data at `position` into `buf`.
    ///
    /// Reading stops at the end of the file.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read.
    /// - `Err(Error)`: An error if the read operation fails.
    pub fn read(&self, mut position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; 4096]);
        let max_read = self
            .size()
            .min(position + buf.len())
            .saturating_sub(position);
        let mut read_bytes = 0;
        while read_bytes < max_read {
            let ofs = position & 0xfff;
            let chunk = (0x1000 - ofs).min(max_read - read_bytes);
            if !self
                .0
                .read(FileBlockNumber::from_offset(position), &mut bounce_buffer)?
            {
                break;
            }
            buf[read_bytes..read_bytes + chunk].copy_from_slice(&bounce_buffer[ofs..ofs + chunk]);
            position += chunk;
            read_bytes += chunk;
        }
        Ok(read_bytes)
    }

    /// Writes data from the buffer into the file at `position`.
    ///
    /// If the write position is beyond the current file size, file will be
    /// extended to minimum size required to reflect the update.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes written.
    /// - `Err(Error)`: An error if the write operation fails.
    pub fn write(&self, mut position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; 4096]);
        let mut write_bytes = 0;
        while write_bytes < buf.len() {
            let ofs = position & 0xfff;
            let chunk = (0x1000 - ofs).min(buf.len() - write_bytes);
            let fba = FileBlockNumber::from_offset(position);
            if chunk != 0x1000 {
                // Partial block: merge with the existing contents.
                self.0.read(fba, &mut bounce_buffer)?;
            }
            bounce_buffer[ofs..ofs + chunk].copy_from_slice(&buf[write_bytes..write_bytes + chunk]);
            self.0.write(fba, &bounce_buffer, position + chunk)?;
            position += chunk;
            write_bytes += chunk;
        }
        Ok(write_bytes)
    }
}

/// Sector, an access granuality for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// Get offset that represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * 512
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// Represents a file block number within a file.
///
/// Each block contains 4096 bytes of contents.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FileBlockNumber(pub usize);

impl FileBlockNumber {
    /// Computes the file block number from a byte offset within a file.
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset / 0x1000)
    }

    /// Byte offset of the first byte of the block.
    pub const fn into_offset(self) -> usize {
        self.0 * 0x1000
    }
}

/// The disk, a device that has byte sink.
///
/// Requests past the last sector fail with [`KernelError::IOError`] before
/// they reach the device.
#[derive(Clone)]
pub struct Disk {
    dev: Arc<dyn traits::Disk>,
}

impl Disk {
    /// Create a new Disk from the device.
    pub fn new(dev: impl traits::Disk + 'static) -> Self {
        Self { dev: Arc::new(dev) }
    }

    /// Number of 512-byte sectors of the disk.
    #[inline]
    pub fn sector_count(&self) -> usize {
        self.dev.sector_count()
    }

    /// Read 512 bytes from disk starting from sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        if sector.into_usize() >= self.sector_count() {
            return Err(KernelError::IOError);
        }
        self.dev.read(sector, buf)
    }

    /// Write 512 bytes to disk starting from sector.
    pub fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError> {
        if sector.into_usize() >= self.sector_count() {
            return Err(KernelError::IOError);
        }
        self.dev.write(sector, buf)
    }
}
