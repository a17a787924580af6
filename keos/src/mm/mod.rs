//! Memory Management.
//!
//! This module owns the physical frames that back user pages. The core
//! abstraction is the [`Page`], which represents exclusive ownership of a
//! single physical frame.
//!
//! Memory allocation and deallocation in KeOS is closely tied to Rust's
//! ownership and lifetime system: A frame is allocated by creating an instance
//! of the [`Page`] struct through [`PhysicalMemory::alloc`]. Once the [`Page`]
//! instance is dropped, the frame is automatically returned to the pool,
//! ensuring proper memory management and preventing memory leaks.
//!
//! The contents of a frame are reachable in two ways: through the owning
//! [`Page`], or by physical address through [`PhysicalMemory::with_frame`],
//! which is how the MMU (or a simulated CPU) reaches the frame a page-table
//! entry points to.
pub mod page_table;

use crate::{
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa},
    sync::SpinLock,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};

struct BytePP(usize);
impl core::fmt::Display for BytePP {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.0 > 16 * 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / 1024 / 1024 / 1024)
        } else if self.0 > 16 * 1024 * 1024 {
            write!(f, "{} MiB", self.0 / 1024 / 1024)
        } else if self.0 > 16 * 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

// Frame allocator.
struct Arena {
    // 0: used, 1: unused
    bitmap: Vec<u64>,
    free: usize,
}

impl Arena {
    fn new(cnt: usize) -> Self {
        let mut bitmap = alloc::vec![u64::MAX; cnt.div_ceil(64)];
        // Pad back.
        for i in cnt..bitmap.len() * 64 {
            bitmap[i / 64] &= !(1 << (i % 64));
        }
        Self { bitmap, free: cnt }
    }

    fn set_used(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] &= !(1 << ofs);
        self.free -= 1;
    }

    fn set_unused(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_eq!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] |= 1 << ofs;
        self.free += 1;
    }

    fn alloc(&mut self) -> Option<usize> {
        // search first qword that contains one.
        let pos = self.bitmap.iter().position(|qword| *qword != 0)?;
        let index = pos * 64 + self.bitmap[pos].trailing_zeros() as usize;
        self.set_used(index);
        Some(index)
    }
}

/// The pool of physical frames available to user pages.
///
/// Frames are numbered consecutively from a page-aligned base address. Each
/// frame carries its own lock so that the contents can be copied in and out
/// by physical address.
pub struct PhysicalMemory {
    base: Pa,
    frames: Box<[SpinLock<Box<[u8; PAGE_SIZE]>>]>,
    arena: SpinLock<Arena>,
}

impl PhysicalMemory {
    /// Creates a pool of `cnt` frames whose first frame is at `base`.
    ///
    /// `base` is rounded down to the page boundary.
    pub fn new(base: Pa, cnt: usize) -> Arc<Self> {
        let base = base.page_down();
        info!(
            "    Usable: 0x{:016x}~0x{:016x} ({})",
            base.into_usize(),
            base.into_usize() + cnt * PAGE_SIZE,
            BytePP(cnt * PAGE_SIZE)
        );
        let frames = (0..cnt)
            .map(|_| SpinLock::new(Box::new([0u8; PAGE_SIZE])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            base,
            frames,
            arena: SpinLock::new(Arena::new(cnt)),
        })
    }

    /// Total number of frames in the pool.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames not owned by any [`Page`].
    pub fn free_frames(&self) -> usize {
        let arena = self.arena.lock();
        let free = arena.free;
        arena.unlock();
        free
    }

    fn index_of(&self, pa: Pa) -> Option<usize> {
        let index = pa.into_usize().checked_sub(self.base.into_usize())? >> PAGE_SHIFT;
        (index < self.frames.len()).then_some(index)
    }

    /// Allocate a zero-filled frame.
    ///
    /// Returns `None` when every frame of the pool is in use.
    pub fn alloc(self: &Arc<Self>) -> Option<Page> {
        let mut arena = self.arena.lock();
        let index = arena.alloc();
        arena.unlock();

        let index = index?;
        let mut frame = self.frames[index].lock();
        frame.fill(0);
        frame.unlock();
        Some(Page {
            pa: self.base + (index << PAGE_SHIFT),
            mem: self.clone(),
        })
    }

    fn dealloc(&self, pa: Pa) {
        if let Some(index) = self.index_of(pa) {
            let mut arena = self.arena.lock();
            arena.set_unused(index);
            arena.unlock();
        }
    }

    /// Runs `f` on the contents of the frame containing `pa`.
    ///
    /// Returns `None` if `pa` does not belong to this pool.
    pub fn with_frame<R>(&self, pa: Pa, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> Option<R> {
        let index = self.index_of(pa)?;
        let mut frame = self.frames[index].lock();
        let r = f(&mut **frame);
        frame.unlock();
        Some(r)
    }
}

/// A representation of an owned physical frame.
///
/// The [`Page`] struct encapsulates a single frame of the [`PhysicalMemory`]
/// it was allocated from, providing methods to access the frame's contents.
/// Dropping the [`Page`] returns the frame to its pool.
///
/// ## Example:
/// ```
/// use keos::{addressing::Pa, mm::PhysicalMemory};
///
/// let mem = PhysicalMemory::new(Pa::new(0x10_0000).unwrap(), 2);
/// let mut page = mem.alloc().unwrap();
/// page.inner_mut(|b| b[0] = 0xaa);
/// assert_eq!(page.inner(|b| b[0]), 0xaa);
/// assert_eq!(mem.free_frames(), 1);
/// drop(page);
/// assert_eq!(mem.free_frames(), 2);
/// ```
pub struct Page {
    pa: Pa,
    mem: Arc<PhysicalMemory>,
}

impl Page {
    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Runs `f` with read-only access to the contents of the page.
    pub fn inner<R>(&self, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        self.mem
            .with_frame(self.pa, |frame| f(frame))
            .unwrap_or_else(|| unreachable!("{:?} escaped its pool", self.pa))
    }

    /// Runs `f` with mutable access to the contents of the page.
    pub fn inner_mut<R>(&mut self, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        self.mem
            .with_frame(self.pa, f)
            .unwrap_or_else(|| unreachable!("{:?} escaped its pool", self.pa))
    }

    /// Overwrites the contents of the page with `src`.
    pub fn copy_from(&mut self, src: &[u8; PAGE_SIZE]) {
        self.inner_mut(|dst| dst.copy_from_slice(src))
    }

    /// Copies the contents of the page into a heap buffer.
    pub fn snapshot(&self) -> Box<[u8; PAGE_SIZE]> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.inner(|src| buf.copy_from_slice(src));
        buf
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page").field("pa", &self.pa).finish()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.mem.dealloc(self.pa);
    }
}
