//! Anonymous pages.
//!
//! An anonymous page has no backing file: its contents live either in a
//! frame or, once evicted, in exactly one swap slot. The slot is released as
//! soon as the page is read back in.
use crate::{
    frame::FrameTableInner,
    swap::{SwapSlot, SwapTable},
};
use keos::{KernelError, debug, mm::Page};

/// Payload of an initialized anonymous page.
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub(crate) fn new() -> Self {
        Self { slot: None }
    }

    pub(crate) fn with_slot(slot: SwapSlot) -> Self {
        Self { slot: Some(slot) }
    }

    /// The swap slot holding the contents of this page, if it is swapped out.
    #[inline]
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// Reads the page back from its slot into `frame` and frees the slot.
    pub(crate) fn swap_in(&mut self, swap: &mut SwapTable, frame: &mut Page) -> Result<(), KernelError> {
        let slot = self.slot.ok_or(KernelError::IOError)?;
        swap.read(slot, frame)?;
        swap.free(slot);
        self.slot = None;
        debug!("Swap: {:?} -> {:?}", slot, frame.pa());
        Ok(())
    }

    /// Writes `frame` into a newly allocated slot.
    ///
    /// A full swap device is recorded in `inner` as fatal.
    pub(crate) fn swap_out(&mut self, inner: &mut FrameTableInner, frame: &Page) -> Result<(), KernelError> {
        let slot = inner.alloc_slot()?;
        if let Err(e) = inner.swap.write(slot, frame) {
            inner.swap.free(slot);
            return Err(e);
        }
        debug!("Swap: {:?} -> {:?}", frame.pa(), slot);
        self.slot = Some(slot);
        Ok(())
    }

    /// Releases the swap slot of a non-resident page.
    pub(crate) fn destroy(&mut self, swap: &mut SwapTable) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }
}
