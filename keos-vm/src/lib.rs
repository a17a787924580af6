//! # Virtual memory for KeOS
//!
//! This crate turns the flat, eagerly populated address space of a KeOS
//! process into a demand-paged one. Pages are described up front in a
//! per-process [supplemental page table](spt) and only receive a physical
//! frame when user code first touches them. When physical memory runs out,
//! the [frame registry](frame) evicts a resident page chosen by a one-bit
//! clock: anonymous pages go to the [swap device](swap), file-backed pages are
//! written back to their [file](file) if they were modified.
//!
//! The pieces fit together as follows:
//!
//! - [`Vm`] owns the physical frame pool, the frame registry and the swap
//!   table. It is created once, by [`VmBuilder`], and shared by every address
//!   space.
//! - [`MmStruct`] is the address space of one process: its hardware page
//!   table, its supplemental page table and its memory-mapped regions.
//! - [`MmStruct::handle_page_fault`] is the entry point from the page fault
//!   handler; [`MmStruct::claim`] makes a page resident on request.
//! - [`MmStruct::mmap`]/[`MmStruct::munmap`] map files into memory, and
//!   [`MmStruct::fork`] duplicates an address space for a child process.
//!
//! ```text
//!  page fault ──▶ MmStruct ──▶ SupplementalPageTable ──▶ VmPage
//!                    │                                    │
//!                    ▼                                    ▼
//!               FrameTable ──(evict)──▶ AnonPage ──▶ SwapTable ──▶ Disk
//!                                       FilePage ──▶ RegularFile
//! ```
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod anon;
pub mod clock;
pub mod fault;
pub mod file;
pub mod fork;
pub mod frame;
pub mod loader;
pub mod mm_struct;
pub mod page;
pub mod spt;
pub mod swap;

pub use mm_struct::MmStruct;

use alloc::sync::Arc;
use frame::FrameTable;
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Pa},
    fs::Disk,
    info,
    mm::PhysicalMemory,
};
use swap::SwapTable;

/// Top of the user stack. The stack grows down from here.
pub const USER_STACK: usize = 0x4748_0000;

/// First address of the kernel half of the address space.
pub const KERNEL_BASE: usize = 0x8000_0000_0000;

/// Default upper bound on the size of the user stack.
pub const DEFAULT_MAX_STACK: usize = 0x10_0000;

/// Snapshot of the global paging counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    /// Frames in the physical pool.
    pub frames: usize,
    /// Frames not held by anyone.
    pub free_frames: usize,
    /// Frames registered to a resident page.
    pub resident: usize,
    /// Evictions so far.
    pub evictions: usize,
    /// Slots on the swap device.
    pub swap_slots: usize,
    /// Slots holding an evicted page.
    pub swap_in_use: usize,
}

/// The paging state shared by every address space.
pub struct Vm {
    memory: Arc<PhysicalMemory>,
    frames: FrameTable,
    max_stack: usize,
}

impl Vm {
    /// The physical frame pool.
    #[inline]
    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.memory
    }

    /// The frame registry.
    #[inline]
    pub fn frame_table(&self) -> &FrameTable {
        &self.frames
    }

    /// Maximum size of a user stack, in bytes.
    #[inline]
    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    /// Reads the paging counters.
    pub fn stats(&self) -> VmStats {
        let inner = self.frames.lock();
        let stats = VmStats {
            frames: self.memory.frame_count(),
            free_frames: self.memory.free_frames(),
            resident: inner.resident(),
            evictions: inner.evictions(),
            swap_slots: inner.swap().capacity(),
            swap_in_use: inner.swap().in_use(),
        };
        inner.unlock();
        stats
    }
}

/// A builder for the paging state.
///
/// ```
/// use keos_vm::VmBuilder;
///
/// let vm = VmBuilder::new().frames(4).build().unwrap();
/// assert_eq!(vm.stats().frames, 4);
/// assert_eq!(vm.stats().swap_slots, 0);
/// ```
pub struct VmBuilder {
    base: usize,
    frames: usize,
    swap: Option<Disk>,
    max_stack: usize,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBuilder {
    /// Starts from 256 frames at 16 MiB, no swap device, and a stack of at
    /// most [`DEFAULT_MAX_STACK`] bytes.
    pub fn new() -> Self {
        Self {
            base: 0x100_0000,
            frames: 256,
            swap: None,
            max_stack: DEFAULT_MAX_STACK,
        }
    }

    /// Physical address of the first frame.
    pub fn base(mut self, base: usize) -> Self {
        self.base = base;
        self
    }

    /// Number of frames available to user pages.
    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Device that receives evicted anonymous pages.
    pub fn swap_disk(mut self, disk: Disk) -> Self {
        self.swap = Some(disk);
        self
    }

    /// Upper bound on the size of a user stack.
    pub fn max_stack(mut self, max_stack: usize) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Creates the frame pool, the frame registry and the swap table.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if there is no frame, the stack bound
    /// is not a page multiple, or the base address is invalid.
    pub fn build(self) -> Result<Arc<Vm>, KernelError> {
        if self.frames == 0 || self.max_stack % PAGE_SIZE != 0 || self.max_stack > USER_STACK {
            return Err(KernelError::InvalidArgument);
        }
        let base = Pa::new(self.base).ok_or(KernelError::InvalidArgument)?;
        info!("Vm: init {} frames.", self.frames);
        let memory = PhysicalMemory::new(base, self.frames);
        let swap = SwapTable::new(self.swap);
        Ok(Arc::new(Vm {
            frames: FrameTable::new(memory.clone(), swap),
            memory,
            max_stack: self.max_stack,
        }))
    }
}
