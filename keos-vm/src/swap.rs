//! Swap slot allocator.
//!
//! The swap device is divided into page-sized slots of
//! [`SECTORS_PER_SLOT`] consecutive sectors. A bitmap records which slots
//! hold the contents of an evicted anonymous page; it is the only record of
//! slot ownership, so a slot index is never handed out twice while the page
//! that received it still refers to it.
//!
//! The table itself lives inside the frame table and is only reached while
//! the frame table lock is held.
use alloc::{vec, vec::Vec};
use keos::{
    KernelError,
    addressing::PAGE_SIZE,
    fs::{Disk, Sector},
    info,
    mm::Page,
};

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors that hold one page.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Index of the slot.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }

    /// First sector of the slot.
    #[inline]
    pub fn sector(self) -> Sector {
        Sector(self.0 * SECTORS_PER_SLOT)
    }
}

/// The bitmap of swap slots over a swap device.
pub struct SwapTable {
    disk: Option<Disk>,
    // 1: used, 0: free
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SwapTable {
    /// Creates a table covering every whole slot of `disk`.
    ///
    /// Without a disk the table has no slot, and every eviction of an
    /// anonymous page finds the device full.
    pub fn new(disk: Option<Disk>) -> Self {
        let slots = disk
            .as_ref()
            .map(|disk| disk.sector_count() / SECTORS_PER_SLOT)
            .unwrap_or(0);
        info!("Swap: {} slots.", slots);
        Self {
            disk,
            bitmap: vec![0; slots.div_ceil(64)],
            slots,
            used: 0,
        }
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Number of slots currently holding a page.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.used
    }

    /// Returns `true` if `slot` is allocated.
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let (pos, ofs) = (slot.0 / 64, slot.0 % 64);
        slot.0 < self.slots && self.bitmap[pos] & (1 << ofs) != 0
    }

    /// Allocates the lowest free slot.
    pub fn alloc(&mut self) -> Option<SwapSlot> {
        let pos = self.bitmap.iter().position(|qword| *qword != u64::MAX)?;
        let index = pos * 64 + (!self.bitmap[pos]).trailing_zeros() as usize;
        if index >= self.slots {
            return None;
        }
        self.bitmap[pos] |= 1 << (index % 64);
        self.used += 1;
        Some(SwapSlot(index))
    }

    /// Returns `slot` to the free pool.
    ///
    /// Freeing a slot that is not allocated is a kernel bug.
    pub fn free(&mut self, slot: SwapSlot) {
        assert!(self.is_used(slot), "double free of {:?}", slot);
        self.bitmap[slot.0 / 64] &= !(1 << (slot.0 % 64));
        self.used -= 1;
    }

    fn disk(&self) -> Result<&Disk, KernelError> {
        self.disk.as_ref().ok_or(KernelError::NoSpace)
    }

    /// Writes the contents of `page` into `slot`.
    pub fn write(&self, slot: SwapSlot, page: &Page) -> Result<(), KernelError> {
        let disk = self.disk()?;
        page.inner(|buf| -> Result<(), KernelError> {
            let mut sector = [0u8; SECTOR_SIZE];
            for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
                sector.copy_from_slice(chunk);
                disk.write(slot.sector() + i, &sector)?;
            }
            Ok(())
        })
    }

    /// Reads the contents of `slot` into `page`.
    pub fn read(&self, slot: SwapSlot, page: &mut Page) -> Result<(), KernelError> {
        let disk = self.disk()?;
        page.inner_mut(|buf| -> Result<(), KernelError> {
            let mut sector = [0u8; SECTOR_SIZE];
            for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
                disk.read(slot.sector() + i, &mut sector)?;
                chunk.copy_from_slice(&sector);
            }
            Ok(())
        })
    }

    /// Allocates a new slot holding a copy of `slot`.
    ///
    /// # Errors
    /// [`KernelError::NoSpace`] if the swap device is full.
    pub fn duplicate(&mut self, slot: SwapSlot) -> Result<SwapSlot, KernelError> {
        let copy = self.alloc().ok_or(KernelError::NoSpace)?;
        let r = self.disk().and_then(|disk| {
            let mut sector = [0u8; SECTOR_SIZE];
            for i in 0..SECTORS_PER_SLOT {
                disk.read(slot.sector() + i, &mut sector)?;
                disk.write(copy.sector() + i, &sector)?;
            }
            Ok(())
        });
        match r {
            Ok(()) => Ok(copy),
            Err(e) => {
                self.free(copy);
                Err(e)
            }
        }
    }
}
