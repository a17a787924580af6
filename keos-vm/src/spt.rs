//! Supplemental page table.
//!
//! The hardware page table only knows about resident pages. The supplemental
//! page table knows about every page of the address space, resident or not,
//! and is what the fault handler consults to decide whether a fault is a
//! demand-paging fault or an invalid access.
use crate::page::VmPage;
use alloc::{collections::BTreeMap, vec::Vec};
use keos::{KernelError, addressing::Va};

/// Per-process map from page-aligned virtual address to its entry.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<Va, VmPage>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Inserts `page`, failing with [`KernelError::FileExist`] if its address
    /// is already taken.
    pub fn insert(&mut self, page: VmPage) -> Result<(), KernelError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(KernelError::FileExist);
        }
        self.pages.insert(va, page);
        Ok(())
    }

    /// The entry of the page containing `va`.
    pub fn find(&self, va: Va) -> Option<&VmPage> {
        self.pages.get(&va.page_down())
    }

    /// Takes the entry of the page containing `va` out of the table.
    pub fn remove(&mut self, va: Va) -> Option<VmPage> {
        self.pages.remove(&va.page_down())
    }

    /// Returns `true` if the page containing `va` has an entry.
    pub fn contains(&self, va: Va) -> bool {
        self.pages.contains_key(&va.page_down())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if the table has no entry.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterates over the entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &VmPage> {
        self.pages.values()
    }

    /// Removes every entry, in address order.
    pub(crate) fn drain(&mut self) -> Vec<VmPage> {
        core::mem::take(&mut self.pages).into_values().collect()
    }
}
