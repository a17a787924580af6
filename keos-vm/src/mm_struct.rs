//! # Memory state of a process
//!
//! [`MmStruct`] is the address space of one process, in the spirit of the
//! Linux kernel's `struct mm_struct`. It ties together:
//!
//! - the hardware page table, which only knows resident pages,
//! - the [`SupplementalPageTable`], which knows every page and how to produce
//!   its contents, and
//! - the memory-mapped regions created by [`MmStruct::mmap`].
//!
//! Pages are registered lazily through [`MmStruct::alloc_page`] and become
//! resident on the first fault ([`MmStruct::handle_page_fault`]) or on an
//! explicit [`MmStruct::claim`].
//!
//! ## Validating user memory
//!
//! The kernel must never crash because of a pointer handed over by a system
//! call. [`MmStruct::access_ok`] checks that a user range is backed by
//! registered pages with the right permission, and
//! [`MmStruct::read_user`]/[`MmStruct::write_user`] copy bytes in and out of
//! user pages, loading them on demand exactly as a user access would.
use crate::{
    KERNEL_BASE, Vm,
    fault::claim_locked,
    file::MmapRegion,
    frame::FrameTableInner,
    page::{Loader, PageKind, Uninit, VmPage, VmType},
    spt::SupplementalPageTable,
};
use alloc::{collections::BTreeMap, sync::Arc};
use core::ops::Range;
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    debug,
    mm::page_table::PageTable,
    warning,
};

/// The memory state of a process.
pub struct MmStruct {
    vm: Arc<Vm>,
    pub(crate) page_table: Arc<dyn PageTable>,
    pub(crate) spt: SupplementalPageTable,
    pub(crate) mmaps: BTreeMap<Va, MmapRegion>,
}

impl MmStruct {
    /// Creates an empty address space over `page_table`.
    pub fn new(vm: &Arc<Vm>, page_table: Arc<dyn PageTable>) -> Self {
        Self {
            vm: vm.clone(),
            page_table,
            spt: SupplementalPageTable::new(),
            mmaps: BTreeMap::new(),
        }
    }

    /// The paging state this address space draws frames from.
    #[inline]
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// The hardware page table of this address space.
    #[inline]
    pub fn page_table(&self) -> &Arc<dyn PageTable> {
        &self.page_table
    }

    /// The supplemental page table of this address space.
    #[inline]
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// Registers a page at `va` that is populated by `loader` on first
    /// access and becomes a page of type `ty`.
    ///
    /// # Errors
    /// - [`KernelError::BadAddress`] if `va` is a kernel address.
    /// - [`KernelError::InvalidArgument`] if a file-backed page is requested
    ///   without a file to back it.
    /// - [`KernelError::FileExist`] if the page is already registered.
    pub fn alloc_page(
        &mut self,
        ty: VmType,
        va: Va,
        writable: bool,
        loader: Loader,
    ) -> Result<(), KernelError> {
        if va.into_usize() >= KERNEL_BASE {
            return Err(KernelError::BadAddress);
        }
        if let (VmType::File, Loader::Zero) = (ty, &loader) {
            return Err(KernelError::InvalidArgument);
        }
        self.spt.insert(VmPage::new(
            va,
            writable,
            PageKind::Uninit(Uninit { ty, loader }),
        ))
    }

    /// The entry of the page containing `va`.
    #[inline]
    pub fn find_page(&self, va: Va) -> Option<&VmPage> {
        self.spt.find(va)
    }

    /// Type of the page containing `va`, or the type it will have once
    /// initialized.
    pub fn page_type(&self, va: Va) -> Option<VmType> {
        self.spt.find(va).map(VmPage::ty)
    }

    /// Removes the page containing `va` and releases its frame or swap slot.
    ///
    /// A dirty resident file-backed page is written back first. The page is
    /// removed even if the write-back fails.
    pub fn remove_page(&mut self, va: Va) -> Result<(), KernelError> {
        let page = self.spt.remove(va).ok_or(KernelError::NoSuchEntry)?;
        let mut inner = self.vm.frame_table().lock();
        let result = page.destroy(&mut inner, &*self.page_table);
        inner.unlock();
        result
    }

    /// Releases every page of the address space.
    ///
    /// Memory-mapped regions are unmapped first, writing back their dirty
    /// pages. Running it twice is harmless; dropping an [`MmStruct`] runs it.
    pub fn teardown(&mut self) {
        let regions = core::mem::take(&mut self.mmaps);
        for (_, region) in regions {
            if let Err(e) = self.unmap_region(region) {
                warning!("Teardown: failed to unmap a region ({:?})", e);
            }
        }

        let pages = self.spt.drain();
        if pages.is_empty() {
            return;
        }
        let count = pages.len();
        let mut failed = 0;
        let mut inner = self.vm.frame_table().lock();
        for page in pages {
            if page.destroy(&mut inner, &*self.page_table).is_err() {
                failed += 1;
            }
        }
        inner.unlock();
        if failed != 0 {
            warning!("Teardown: {} of {} pages lost their contents", failed, count);
        }
        debug!("Teardown: released {} pages", count);
    }

    /// Checks that every page of `range` is registered, and writable if
    /// `is_write` is set.
    ///
    /// Nothing is loaded. An empty range is always accepted.
    pub fn access_ok(&self, range: Range<Va>, is_write: bool) -> bool {
        if range.start >= range.end {
            return true;
        }
        if range.end.into_usize() > KERNEL_BASE {
            return false;
        }
        let mut va = range.start.page_down();
        while va < range.end {
            match self.spt.find(va) {
                Some(page) if !is_write || page.writable() => (),
                _ => return false,
            }
            va += PAGE_SIZE;
        }
        true
    }

    /// Makes the page containing `va` resident and runs `f` on its contents.
    ///
    /// The frame cannot be evicted while `f` runs. The access is accounted
    /// as a user access: the accessed bit is set, and the dirty bit as well
    /// if `is_write` is set.
    ///
    /// # Errors
    /// - [`KernelError::BadAddress`] if no page contains `va`.
    /// - [`KernelError::InvalidAccess`] on a write to a read-only page.
    /// - Any error of loading the page.
    ///
    /// # Panics
    /// Panics if no frame can be made available.
    pub fn get_user_page_and<R>(
        &self,
        va: Va,
        is_write: bool,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Result<R, KernelError> {
        let page = self.spt.find(va).ok_or(KernelError::BadAddress)?;
        if is_write && !page.writable() {
            return Err(KernelError::InvalidAccess);
        }
        let mut inner = self.vm.frame_table().lock();
        let result = claim_locked(&mut inner, &self.page_table, page).and_then(|pa| {
            let va = page.va();
            self.page_table.set_accessed(va, true)?;
            if is_write {
                self.page_table.set_dirty(va, true)?;
            }
            inner
                .page_mut(pa)
                .map(|frame| frame.inner_mut(f))
                .ok_or(KernelError::BadAddress)
        });
        FrameTableInner::unlock(inner);
        result
    }

    /// Copies `buf.len()` bytes of user memory starting at `va` into `buf`.
    pub fn read_user(&self, va: Va, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va.checked_add(done).ok_or(KernelError::BadAddress)?;
            let chunk = (PAGE_SIZE - cur.offset()).min(buf.len() - done);
            let ofs = cur.offset();
            self.get_user_page_and(cur, false, |frame| {
                buf[done..done + chunk].copy_from_slice(&frame[ofs..ofs + chunk])
            })?;
            done += chunk;
        }
        Ok(done)
    }

    /// Copies `buf` into user memory starting at `va`.
    pub fn write_user(&self, va: Va, buf: &[u8]) -> Result<usize, KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va.checked_add(done).ok_or(KernelError::BadAddress)?;
            let chunk = (PAGE_SIZE - cur.offset()).min(buf.len() - done);
            let ofs = cur.offset();
            self.get_user_page_and(cur, true, |frame| {
                frame[ofs..ofs + chunk].copy_from_slice(&buf[done..done + chunk])
            })?;
            done += chunk;
        }
        Ok(done)
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        self.teardown();
    }
}
