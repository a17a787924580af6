//! Hardware page table interface.
//!
//! The virtual-memory subsystem never touches page-table memory itself. It
//! talks to the page table of an address space through the [`PageTable`]
//! trait: install or remove a 4-KiB translation, and read or reset the
//! accessed/dirty bits the MMU maintains in the leaf entry.
//!
//! The bit layout of [`PteFlags`] follows the x86_64 4-KiB page-table entry
//! so that an implementation backed by real page-table memory can store the
//! flags verbatim.
use crate::{
    KernelError,
    addressing::{Pa, Va},
};

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
        /// If IA32_EFER.NXE = 1, execute-disable (if 1, instruction fetches are not allowed from the 4-KByte page controlled by this entry)
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Memory permission of a mapping.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// Permission of a user page, writable or not.
    pub fn user(writable: bool) -> Self {
        if writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }

    /// Encodes the permission into the flags of a present leaf entry.
    pub fn into_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::P;
        if self.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if self.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        if !self.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        flags
    }
}

bitflags::bitflags! {
    /// Page fault error code pushed by the CPU.
    pub struct PFErrorCode: u64 {
        /// The fault was caused by a page-protection violation; if clear, by a
        /// non-present page.
        const PRESENT = 1 << 0;
        /// The fault was caused by a write access.
        const WRITE_ACCESS = 1 << 1;
        /// The fault occurred in user mode.
        const USER = 1 << 2;
        /// A reserved bit was set in some paging-structure entry.
        const RESERVED_WRITE = 1 << 3;
        /// The fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Errors of the page table operations.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// The address is not aligned to the page boundary.
    Unaligned,
    /// No translation exists for the address.
    NotExist,
    /// A translation already exists for the address.
    Duplicated,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned => KernelError::InvalidArgument,
            PageTableMappingError::NotExist => KernelError::BadAddress,
            PageTableMappingError::Duplicated => KernelError::FileExist,
        }
    }
}

/// The hardware page table of one address space.
///
/// All methods take `&self`: the MMU updates the accessed and dirty bits
/// concurrently with the kernel, so implementations synchronize internally.
/// Implementations are also responsible for invalidating stale TLB entries
/// on [`unmap`] and [`update_flags`].
///
/// [`unmap`]: PageTable::unmap
/// [`update_flags`]: PageTable::update_flags
pub trait PageTable
where
    Self: Send + Sync,
{
    /// Installs a translation from `va` to `pa` with the given permission.
    ///
    /// Both addresses must be page aligned, and `va` must not be mapped.
    fn map(&self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError>;

    /// Removes the translation of `va`, returning the frame it pointed to.
    fn unmap(&self, va: Va) -> Result<Pa, PageTableMappingError>;

    /// Looks up the leaf entry of `va`.
    fn walk(&self, va: Va) -> Result<(Pa, PteFlags), PageTableMappingError>;

    /// Sets the flags in `set` and clears the flags in `clear` on the leaf
    /// entry of `va`.
    fn update_flags(
        &self,
        va: Va,
        set: PteFlags,
        clear: PteFlags,
    ) -> Result<(), PageTableMappingError>;

    /// Returns `true` if the page at `va` was written since its dirty bit was
    /// last cleared. Unmapped pages are clean.
    fn is_dirty(&self, va: Va) -> bool {
        self.walk(va)
            .map(|(_, flags)| flags.contains(PteFlags::D))
            .unwrap_or(false)
    }

    /// Sets or clears the dirty bit of the page at `va`.
    fn set_dirty(&self, va: Va, dirty: bool) -> Result<(), PageTableMappingError> {
        if dirty {
            self.update_flags(va, PteFlags::D, PteFlags::empty())
        } else {
            self.update_flags(va, PteFlags::empty(), PteFlags::D)
        }
    }

    /// Returns `true` if the page at `va` was accessed since its accessed bit
    /// was last cleared.
    fn is_accessed(&self, va: Va) -> bool {
        self.walk(va)
            .map(|(_, flags)| flags.contains(PteFlags::A))
            .unwrap_or(false)
    }

    /// Sets or clears the accessed bit of the page at `va`.
    fn set_accessed(&self, va: Va, accessed: bool) -> Result<(), PageTableMappingError> {
        if accessed {
            self.update_flags(va, PteFlags::A, PteFlags::empty())
        } else {
            self.update_flags(va, PteFlags::empty(), PteFlags::A)
        }
    }
}
