//! Page table entries of the supplemental page table.
//!
//! Every virtual page a process may touch is described by a [`VmPage`]. A
//! page starts its life as [`PageKind::Uninit`], carrying the [`Loader`] that
//! produces its first contents and the type it turns into once loaded. The
//! first claim runs the loader and the page becomes [`PageKind::Anon`] or
//! [`PageKind::File`] for the rest of its life.
//!
//! ```text
//!              claim                      evict
//!   Uninit ───────────────▶ Resident ◀──────────────▶ Swapped (Anon)
//!                                         claim        Written back (File)
//! ```
//!
//! The mutable part of an entry ([`PageState`]) sits behind its own lock and
//! is shared with the frame registry through a weak reference, so the
//! eviction path can update a page it does not own. Residency changes only
//! while the frame table lock is held, and the page lock is always taken
//! after the frame table lock.
use crate::{
    anon::AnonPage,
    file::{FilePage, FileSlice},
    frame::FrameTableInner,
    swap::SwapSlot,
};
use alloc::sync::Arc;
use keos::{
    KernelError,
    addressing::{Pa, Va},
    mm::{Page, page_table::PageTable},
    sync::SpinLock,
    warning,
};

/// The type a page has, or will have once initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// Anonymous page backed by swap.
    Anon,
    /// Page backed by a file.
    File,
}

/// Deferred initializer of a page.
#[derive(Clone)]
pub enum Loader {
    /// Fill the page with zeroes.
    Zero,
    /// Read a window of a file, zero padding the rest of the page.
    File(FileSlice),
}

impl Loader {
    fn load(&self, frame: &mut Page) -> Result<(), KernelError> {
        match self {
            Loader::Zero => {
                frame.inner_mut(|buf| buf.fill(0));
                Ok(())
            }
            Loader::File(slice) => slice.load(frame),
        }
    }
}

/// Payload of a page that has not been loaded yet.
#[derive(Clone)]
pub struct Uninit {
    /// Type the page turns into on first claim.
    pub ty: VmType,
    /// Initializer run on first claim.
    pub loader: Loader,
}

impl Uninit {
    // Kind of the page after a successful load.
    fn initialized(&self) -> Result<PageKind, KernelError> {
        match (self.ty, &self.loader) {
            (VmType::Anon, _) => Ok(PageKind::Anon(AnonPage::new())),
            (VmType::File, Loader::File(slice)) => Ok(PageKind::File(FilePage::new(slice.clone()))),
            (VmType::File, Loader::Zero) => Err(KernelError::InvalidArgument),
        }
    }
}

/// Backing variant of a page.
pub enum PageKind {
    /// Not loaded yet.
    Uninit(Uninit),
    /// Anonymous, swappable page.
    Anon(AnonPage),
    /// File-backed page.
    File(FilePage),
}

/// Mutable part of a page table entry.
pub struct PageState {
    pub(crate) kind: PageKind,
    pub(crate) frame: Option<Pa>,
}

impl PageState {
    /// Fills `frame` with the contents of the page.
    ///
    /// On success an uninitialized page becomes its target type and a swapped
    /// anonymous page gives up its slot. On failure the state is unchanged.
    pub(crate) fn swap_in(
        &mut self,
        inner: &mut FrameTableInner,
        frame: &mut Page,
    ) -> Result<(), KernelError> {
        match &mut self.kind {
            PageKind::Uninit(uninit) => {
                let kind = uninit.initialized()?;
                uninit.loader.load(frame)?;
                self.kind = kind;
            }
            PageKind::Anon(anon) => anon.swap_in(&mut inner.swap, frame)?,
            PageKind::File(file) => file.swap_in(frame)?,
        }
        self.frame = Some(frame.pa());
        Ok(())
    }

    /// Persists the contents of an evicted `frame`.
    pub(crate) fn swap_out(
        &mut self,
        inner: &mut FrameTableInner,
        frame: &Page,
        dirty: bool,
    ) -> Result<(), KernelError> {
        let result = match &mut self.kind {
            PageKind::Uninit(_) => Err(KernelError::InvalidArgument),
            PageKind::Anon(anon) => anon.swap_out(inner, frame),
            PageKind::File(file) => file.swap_out(frame, dirty),
        };
        result?;
        self.frame = None;
        Ok(())
    }
}

/// A page table entry of the supplemental page table.
pub struct VmPage {
    va: Va,
    writable: bool,
    state: Arc<SpinLock<PageState>>,
}

impl VmPage {
    pub(crate) fn new(va: Va, writable: bool, kind: PageKind) -> Self {
        Self {
            va: va.page_down(),
            writable,
            state: Arc::new(SpinLock::new(PageState { kind, frame: None })),
        }
    }

    /// Page-aligned virtual address of the page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether user code may write the page.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn state(&self) -> &Arc<SpinLock<PageState>> {
        &self.state
    }

    fn inspect<R>(&self, f: impl FnOnce(&PageState) -> R) -> R {
        let state = self.state.lock();
        let r = f(&state);
        state.unlock();
        r
    }

    /// The type the page has, or will have once initialized.
    pub fn ty(&self) -> VmType {
        self.inspect(|state| match &state.kind {
            PageKind::Uninit(uninit) => uninit.ty,
            PageKind::Anon(_) => VmType::Anon,
            PageKind::File(_) => VmType::File,
        })
    }

    /// Returns `true` until the first successful claim.
    pub fn is_uninit(&self) -> bool {
        self.inspect(|state| matches!(state.kind, PageKind::Uninit(_)))
    }

    /// The frame the page is resident in.
    pub fn frame(&self) -> Option<Pa> {
        self.inspect(|state| state.frame)
    }

    /// Returns `true` if the page occupies a frame.
    pub fn is_resident(&self) -> bool {
        self.frame().is_some()
    }

    /// The swap slot holding an evicted anonymous page.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.inspect(|state| match &state.kind {
            PageKind::Anon(anon) => anon.swap_slot(),
            _ => None,
        })
    }

    /// Releases everything the page owns: its frame (after writing back a
    /// dirty file-backed page), or its swap slot.
    pub(crate) fn destroy(
        self,
        inner: &mut FrameTableInner,
        page_table: &dyn PageTable,
    ) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let mut result = Ok(());
        if let Some(pa) = state.frame.take() {
            let dirty = page_table.is_dirty(self.va);
            if let Err(e) = page_table.unmap(self.va) {
                warning!("Page: {:?} was not mapped ({:?})", self.va, e);
            }
            if let Some(frame) = inner.release(pa) {
                if let (PageKind::File(file), true) = (&state.kind, dirty) {
                    result = file.swap_out(&frame, true);
                }
            }
        } else if let PageKind::Anon(anon) = &mut state.kind {
            anon.destroy(&mut inner.swap);
        }
        state.unlock();
        if let Err(e) = result {
            warning!("Page: failed to write back {:?} ({:?})", self.va, e);
        }
        result
    }
}
