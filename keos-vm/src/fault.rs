//! # Page fault resolution
//!
//! A page fault on a user address lands in [`MmStruct::handle_page_fault`]
//! with a [`PageFaultReason`] decoded from the CPU error code. The handler
//! decides between three outcomes:
//!
//! - the address belongs to a registered page: the page is claimed, i.e.
//!   made resident in a frame and mapped in the hardware page table;
//! - the address lies just below the stack pointer, inside the stack region:
//!   a fresh zero-filled page is registered (stack growth) and claimed;
//! - anything else is an invalid access, and the caller kills the process.
//!
//! Claiming a page never fails for lack of memory: the frame registry evicts
//! some other resident page when the pool is empty.
use crate::{
    KERNEL_BASE, USER_STACK,
    frame::{FrameTableInner, Owner},
    mm_struct::MmStruct,
    page::{Loader, VmPage, VmType},
};
use alloc::sync::Arc;
use keos::{
    KernelError,
    addressing::{Pa, Va},
    debug,
    mm::page_table::{PFErrorCode, PageTable, Permission},
    warning,
};

/// Why a page fault happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,
    /// Whether the faulting access was a write.
    pub is_write_access: bool,
    /// Whether the page was present, i.e. the fault is a protection
    /// violation rather than a missing translation.
    pub is_present: bool,
    /// User stack pointer at the time of the fault.
    pub rsp: usize,
}

impl PageFaultReason {
    /// Decodes the error code `ec` of a fault at `cr2` taken with the user
    /// stack pointer at `rsp`.
    pub fn new(ec: PFErrorCode, cr2: Va, rsp: usize) -> Self {
        Self {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            rsp,
        }
    }

    /// Returns `true` if the fault is a missing translation, which demand
    /// paging may be able to resolve.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }
}

/// Makes `page` resident. The caller holds the frame table lock.
///
/// Returns the frame of the page. A page that is already resident is left
/// untouched.
pub(crate) fn claim_locked(
    inner: &mut FrameTableInner,
    page_table: &Arc<dyn PageTable>,
    page: &VmPage,
) -> Result<Pa, KernelError> {
    if let Some(pa) = page.frame() {
        return Ok(pa);
    }
    let va = page.va();
    let mut frame = inner.acquire()?;
    page_table.map(va, frame.pa(), Permission::user(page.writable()))?;

    let mut state = page.state().lock();
    let result = state.swap_in(inner, &mut frame);
    state.unlock();
    if let Err(e) = result {
        if let Err(unmap) = page_table.unmap(va) {
            warning!("Claim: {:?} lost its mapping ({:?})", va, unmap);
        }
        warning!("Claim: failed to load {:?} ({:?})", va, e);
        return Err(e);
    }

    let pa = frame.pa();
    inner.register(
        frame,
        Owner {
            va,
            writable: page.writable(),
            page_table: page_table.clone(),
            state: Arc::downgrade(page.state()),
        },
    );
    Ok(pa)
}

impl MmStruct {
    /// Makes the page containing `va` resident and maps it.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchEntry`] if no page contains `va`.
    /// - Any error of loading the page; the page is left unchanged.
    ///
    /// # Panics
    /// Panics if no frame can be made available.
    pub fn claim(&self, va: Va) -> Result<Pa, KernelError> {
        let page = self.spt.find(va).ok_or(KernelError::NoSuchEntry)?;
        let mut inner = self.vm().frame_table().lock();
        let result = claim_locked(&mut inner, &self.page_table, page);
        FrameTableInner::unlock(inner);
        result
    }

    fn is_stack_growth(&self, reason: &PageFaultReason) -> bool {
        let addr = reason.fault_addr.into_usize();
        let bottom = USER_STACK - self.vm().max_stack();
        (bottom..USER_STACK).contains(&addr) && addr + 8 >= reason.rsp
    }

    /// Resolves a page fault.
    ///
    /// A fault on a page that is resident already (another path claimed it
    /// first) succeeds without doing anything.
    ///
    /// # Errors
    /// [`KernelError::InvalidAccess`] if the fault cannot be resolved: a
    /// kernel or null address, an unregistered address outside the stack
    /// growth window, or a write to a read-only page. Errors of loading the
    /// page are returned as is.
    pub fn handle_page_fault(&mut self, reason: &PageFaultReason) -> Result<(), KernelError> {
        let va = reason.fault_addr;
        if va.into_usize() == 0 || va.into_usize() >= KERNEL_BASE {
            warning!("Fault: invalid address {:?}", va);
            return Err(KernelError::InvalidAccess);
        }

        if !self.spt.contains(va) {
            if !self.is_stack_growth(reason) {
                warning!("Fault: unmapped address {:?} (rsp: 0x{:x})", va, reason.rsp);
                return Err(KernelError::InvalidAccess);
            }
            self.alloc_page(VmType::Anon, va.page_down(), true, Loader::Zero)?;
            debug!("Fault: grow stack to {:?}", va.page_down());
            return match self.claim(va) {
                Ok(_) => Ok(()),
                Err(e) => {
                    self.remove_page(va)?;
                    Err(e)
                }
            };
        }

        let page = self.spt.find(va).ok_or(KernelError::InvalidAccess)?;
        if reason.is_write_access && !page.writable() {
            warning!("Fault: write to read-only page {:?}", page.va());
            return Err(KernelError::InvalidAccess);
        }
        self.claim(va).map(|_| ())
    }
}
