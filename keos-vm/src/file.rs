//! File-backed pages and memory-mapped files.
//!
//! A file-backed page mirrors `read_bytes` bytes of a file starting at
//! `offset`; the remaining `zero_bytes` bytes of the page are zero padding
//! that never reaches the file. The file itself is the backing store: an
//! evicted file-backed page is written back only if the MMU marked it dirty,
//! and it is read back from the file on the next fault.
//!
//! `mmap` creates one file-backed page per page of the file it covers, all
//! sharing a handle that is reopened for the mapping, and records the range
//! as an [`MmapRegion`] so that `munmap` can tear it down as a unit.
use crate::{
    KERNEL_BASE,
    mm_struct::MmStruct,
    page::{Loader, VmType},
};
use keos::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE, Va},
    debug,
    fs::RegularFile,
    mm::Page,
    warning,
};

/// A page-sized window of a file.
#[derive(Clone)]
pub struct FileSlice {
    /// The file the bytes come from.
    pub file: RegularFile,
    /// Byte offset of the first byte of the page in the file.
    pub offset: usize,
    /// Number of bytes read from the file.
    pub read_bytes: usize,
    /// Number of trailing bytes that are zero-filled.
    pub zero_bytes: usize,
}

impl FileSlice {
    /// Creates a window covering `read_bytes` bytes of `file` at `offset`,
    /// zero padded to a full page.
    ///
    /// `read_bytes` is clamped to [`PAGE_SIZE`].
    pub fn new(file: RegularFile, offset: usize, read_bytes: usize) -> Self {
        let read_bytes = read_bytes.min(PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        }
    }

    /// Fills `frame` with the window's bytes followed by zeroes.
    ///
    /// A short read is an I/O error.
    pub(crate) fn load(&self, frame: &mut Page) -> Result<(), KernelError> {
        frame.inner_mut(|buf| {
            let (data, zero) = buf.split_at_mut(self.read_bytes);
            if self.file.read(self.offset, data)? != self.read_bytes {
                return Err(KernelError::IOError);
            }
            zero.fill(0);
            Ok(())
        })
    }

    /// Writes the covered bytes of `frame` back to the file.
    pub(crate) fn write_back(&self, frame: &Page) -> Result<(), KernelError> {
        if self.read_bytes == 0 {
            return Ok(());
        }
        let written = frame.inner(|buf| self.file.write(self.offset, &buf[..self.read_bytes]))?;
        if written != self.read_bytes {
            return Err(KernelError::IOError);
        }
        debug!(
            "File: wrote back {} bytes at offset 0x{:x}",
            written, self.offset
        );
        Ok(())
    }

    /// Same window over an independently opened handle.
    pub(crate) fn reopen(&self) -> Self {
        Self {
            file: self.file.reopen(),
            ..self.clone()
        }
    }
}

/// Payload of an initialized file-backed page.
#[derive(Clone)]
pub struct FilePage {
    slice: FileSlice,
}

impl FilePage {
    pub(crate) fn new(slice: FileSlice) -> Self {
        Self { slice }
    }

    /// The window of the file this page mirrors.
    #[inline]
    pub fn slice(&self) -> &FileSlice {
        &self.slice
    }

    /// Re-reads the page from the file.
    pub(crate) fn swap_in(&self, frame: &mut Page) -> Result<(), KernelError> {
        self.slice.load(frame)
    }

    /// Persists an evicted page: write back if dirty, otherwise discard.
    pub(crate) fn swap_out(&self, frame: &Page, dirty: bool) -> Result<(), KernelError> {
        if dirty {
            self.slice.write_back(frame)
        } else {
            Ok(())
        }
    }
}

/// A run of file-backed pages created by one `mmap` call.
pub struct MmapRegion {
    /// First page of the region.
    pub start: Va,
    /// Number of pages in the region.
    pub page_count: usize,
    /// Handle shared by the pages of the region.
    pub file: RegularFile,
}

impl MmapRegion {
    /// Address one past the last page of the region.
    #[inline]
    pub fn end(&self) -> Va {
        self.start + self.page_count * PAGE_SIZE
    }

    /// Page-aligned addresses of the pages of the region.
    pub fn pages(&self) -> impl Iterator<Item = Va> + '_ {
        (0..self.page_count).map(move |i| self.start + i * PAGE_SIZE)
    }

    pub(crate) fn duplicate(&self) -> Self {
        Self {
            start: self.start,
            page_count: self.page_count,
            file: self.file.reopen(),
        }
    }
}

impl MmStruct {
    /// Maps `length` bytes of `file` starting at `offset` into the address
    /// space at `addr`.
    ///
    /// Nothing is read until the pages are first touched. The mapping covers
    /// the requested bytes that exist in the file, zero padded to a page
    /// boundary; pages past the end of the file are not mapped.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `length` is zero, the file is
    ///   empty, `addr` is null or unaligned, or `offset` is unaligned or past
    ///   the end of the file.
    /// - [`KernelError::BadAddress`] if the range reaches kernel memory.
    /// - [`KernelError::FileExist`] if any page of the range is already
    ///   mapped. No page is left behind in that case.
    pub fn mmap(
        &mut self,
        addr: Va,
        length: usize,
        writable: bool,
        file: &RegularFile,
        offset: usize,
    ) -> Result<Va, KernelError> {
        let file_length = file.size();
        if length == 0
            || file_length == 0
            || addr.into_usize() == 0
            || !addr.is_page_aligned()
            || offset & PAGE_MASK != 0
            || offset >= file_length
        {
            return Err(KernelError::InvalidArgument);
        }
        let mut remaining = length.min(file_length - offset);
        let page_count = remaining.div_ceil(PAGE_SIZE);
        addr.into_usize()
            .checked_add(page_count * PAGE_SIZE)
            .filter(|end| *end <= KERNEL_BASE)
            .ok_or(KernelError::BadAddress)?;
        if (0..page_count).any(|i| self.find_page(addr + i * PAGE_SIZE).is_some()) {
            return Err(KernelError::FileExist);
        }

        let region = MmapRegion {
            start: addr,
            page_count,
            file: file.reopen(),
        };
        for (i, va) in region.pages().enumerate() {
            let read_bytes = remaining.min(PAGE_SIZE);
            remaining -= read_bytes;
            let slice = FileSlice::new(region.file.clone(), offset + i * PAGE_SIZE, read_bytes);
            if let Err(e) = self.alloc_page(VmType::File, va, writable, Loader::File(slice)) {
                for va in region.pages().take(i) {
                    if let Err(undo) = self.remove_page(va) {
                        warning!("Mmap: rollback of {:?} failed ({:?})", va, undo);
                    }
                }
                return Err(e);
            }
        }
        debug!(
            "Mmap: {:?}~{:?} ({} pages) at offset 0x{:x}",
            region.start,
            region.end(),
            page_count,
            offset
        );
        self.mmaps.insert(addr, region);
        Ok(addr)
    }

    /// Unmaps the region created by the `mmap` call that returned `addr`.
    ///
    /// Dirty resident pages are written back before their frames are
    /// released. Every page of the region is removed even if a write-back
    /// fails; the first failure is returned.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if no region starts at `addr`.
    pub fn munmap(&mut self, addr: Va) -> Result<(), KernelError> {
        let region = self
            .mmaps
            .remove(&addr)
            .ok_or(KernelError::InvalidArgument)?;
        debug!("Munmap: {:?}~{:?}", region.start, region.end());
        self.unmap_region(region)
    }

    pub(crate) fn unmap_region(&mut self, region: MmapRegion) -> Result<(), KernelError> {
        let mut result = Ok(());
        for va in region.pages() {
            if let Err(e) = self.remove_page(va) {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Returns the region starting at `addr`.
    pub fn mmap_region(&self, addr: Va) -> Option<&MmapRegion> {
        self.mmaps.get(&addr)
    }

    /// Returns the region containing `va`.
    pub fn region_of(&self, va: Va) -> Option<&MmapRegion> {
        self.mmaps
            .range(..=va)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| va < region.end())
    }
}
