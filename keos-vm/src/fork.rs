//! # Fork
//!
//! `fork` gives the child a private copy of the parent's address space. The
//! copy is eager: every page is duplicated at fork time, so that parent and
//! child never observe each other's writes.
//!
//! | parent page                | child page                                   |
//! |----------------------------|----------------------------------------------|
//! | not loaded yet             | not loaded yet, same loader                  |
//! | anonymous, resident        | anonymous, resident in a new frame (copy)    |
//! | anonymous, swapped out     | anonymous, in a new swap slot (copy)         |
//! | file-backed, resident      | file-backed, resident in a new frame (copy), |
//! |                            | dirty if the parent's page is dirty          |
//! | file-backed, not resident  | file-backed, not resident                    |
//!
//! File-backed pages of the child read the same file through handles of
//! their own. Pages of a memory-mapped region share the child's handle of
//! that region.
use crate::{
    anon::AnonPage,
    file::{FilePage, FileSlice},
    frame::{FrameTableInner, Owner},
    mm_struct::MmStruct,
    page::{Loader, PageKind, Uninit, VmPage},
};
use alloc::sync::Arc;
use keos::{
    KernelError,
    debug,
    fs::RegularFile,
    mm::page_table::{PageTable, Permission},
};

// The same window over the handle of the child, or over a new handle.
fn rebind(slice: &FileSlice, file: Option<&RegularFile>) -> FileSlice {
    match file {
        Some(file) => FileSlice {
            file: file.clone(),
            ..slice.clone()
        },
        None => slice.reopen(),
    }
}

impl MmStruct {
    /// Creates the address space of a child process over `page_table`.
    ///
    /// On failure the partially built child is torn down.
    pub fn fork(&self, page_table: Arc<dyn PageTable>) -> Result<MmStruct, KernelError> {
        let mut child = MmStruct::new(self.vm(), page_table);
        child.duplicate_from(self)?;
        Ok(child)
    }

    /// Copies every page and memory-mapped region of `src` into `self`.
    ///
    /// On failure `self` may hold part of the copy; tearing it down releases
    /// everything.
    pub fn duplicate_from(&mut self, src: &MmStruct) -> Result<(), KernelError> {
        for (addr, region) in src.mmaps.iter() {
            if self.mmaps.contains_key(addr) {
                return Err(KernelError::FileExist);
            }
            self.mmaps.insert(*addr, region.duplicate());
        }

        let vm = self.vm().clone();
        let mut inner = vm.frame_table().lock();
        let mut result = Ok(());
        for page in src.spt.iter() {
            result = self.duplicate_page(&mut inner, src, page);
            if result.is_err() {
                break;
            }
        }
        FrameTableInner::unlock(inner);

        if result.is_ok() {
            debug!(
                "Fork: duplicated {} pages and {} regions",
                self.spt.len(),
                self.mmaps.len()
            );
        }
        result
    }

    fn duplicate_page(
        &mut self,
        inner: &mut FrameTableInner,
        src: &MmStruct,
        page: &VmPage,
    ) -> Result<(), KernelError> {
        let va = page.va();
        if self.spt.contains(va) {
            return Err(KernelError::FileExist);
        }
        let file = self.region_of(va).map(|region| region.file.clone());

        let state = page.state().lock();
        let kind = match &state.kind {
            PageKind::Uninit(Uninit { ty, loader }) => Ok(PageKind::Uninit(Uninit {
                ty: *ty,
                loader: match loader {
                    Loader::Zero => Loader::Zero,
                    Loader::File(slice) => Loader::File(rebind(slice, file.as_ref())),
                },
            })),
            PageKind::Anon(anon) => match anon.swap_slot() {
                Some(slot) => inner
                    .duplicate_slot(slot)
                    .map(|slot| PageKind::Anon(AnonPage::with_slot(slot))),
                None => Ok(PageKind::Anon(AnonPage::new())),
            },
            PageKind::File(fp) => Ok(PageKind::File(FilePage::new(rebind(
                fp.slice(),
                file.as_ref(),
            )))),
        };
        let parent_frame = state.frame;
        state.unlock();

        let child = VmPage::new(va, page.writable(), kind?);
        if let Some(pa) = parent_frame {
            let contents = inner
                .page(pa)
                .map(|frame| frame.snapshot())
                .ok_or(KernelError::BadAddress)?;
            let dirty = src.page_table.is_dirty(va);

            let mut frame = inner.acquire()?;
            frame.copy_from(&contents);
            self.page_table
                .map(va, frame.pa(), Permission::user(page.writable()))?;
            if dirty {
                self.page_table.set_dirty(va, true)?;
            }

            let mut state = child.state().lock();
            state.frame = Some(frame.pa());
            state.unlock();
            inner.register(
                frame,
                Owner {
                    va,
                    writable: page.writable(),
                    page_table: self.page_table.clone(),
                    state: Arc::downgrade(child.state()),
                },
            );
        }
        self.spt.insert(child)
    }
}
