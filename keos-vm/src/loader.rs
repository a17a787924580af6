//! Lazy loading of a process image.
//!
//! An executable segment is not read when the program is loaded. Each of its
//! pages is registered as an anonymous page whose loader reads its share of
//! the segment from the file and zero-fills the rest, so the file is only
//! touched for the pages the program actually uses. Once loaded, a segment
//! page is an ordinary anonymous page: it goes to swap when evicted, never
//! back to the executable.
use crate::{
    USER_STACK,
    file::FileSlice,
    mm_struct::MmStruct,
    page::{Loader, VmType},
};
use keos::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE, Va},
    debug,
    fs::RegularFile,
    warning,
};

impl MmStruct {
    /// Registers the pages of a segment at `upage` whose first `read_bytes`
    /// bytes come from `file` at `ofs`, followed by `zero_bytes` zeroes.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if `upage` or `ofs` is unaligned or
    /// the segment is not a whole number of pages. Registration errors of
    /// [`MmStruct::alloc_page`] are returned after the pages registered so
    /// far are removed.
    pub fn load_segment(
        &mut self,
        file: &RegularFile,
        ofs: usize,
        upage: Va,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        if (read_bytes + zero_bytes) % PAGE_SIZE != 0
            || !upage.is_page_aligned()
            || ofs & PAGE_MASK != 0
        {
            return Err(KernelError::InvalidArgument);
        }
        let count = (read_bytes + zero_bytes) / PAGE_SIZE;
        let mut remaining = read_bytes;
        for i in 0..count {
            let page_read_bytes = remaining.min(PAGE_SIZE);
            remaining -= page_read_bytes;
            let loader = match page_read_bytes {
                0 => Loader::Zero,
                _ => Loader::File(FileSlice::new(file.clone(), ofs + i * PAGE_SIZE, page_read_bytes)),
            };
            if let Err(e) = self.alloc_page(VmType::Anon, upage + i * PAGE_SIZE, writable, loader) {
                for j in 0..i {
                    if let Err(undo) = self.remove_page(upage + j * PAGE_SIZE) {
                        warning!("Loader: rollback of {:?} failed ({:?})", upage + j * PAGE_SIZE, undo);
                    }
                }
                return Err(e);
            }
        }
        debug!(
            "Loader: segment {:?}~{:?} ({} bytes from file)",
            upage,
            upage + count * PAGE_SIZE,
            read_bytes
        );
        Ok(())
    }

    /// Maps the first page of the user stack and returns the initial stack
    /// pointer.
    ///
    /// The page is removed again if it cannot be made resident.
    pub fn setup_stack(&mut self) -> Result<Va, KernelError> {
        let top = Va::new(USER_STACK).ok_or(KernelError::BadAddress)?;
        let page = top - PAGE_SIZE;
        self.alloc_page(VmType::Anon, page, true, Loader::Zero)?;
        if let Err(e) = self.claim(page) {
            if let Err(undo) = self.remove_page(page) {
                warning!("Loader: rollback of {:?} failed ({:?})", page, undo);
            }
            return Err(e);
        }
        Ok(top)
    }
}
