//! The global frame registry.
//!
//! Every physical frame that holds a user page is registered here together
//! with a back-reference to its occupant: the hardware page table the frame
//! is mapped in, the virtual address, and a weak link to the page's state.
//! The registry is what makes eviction possible: when the pool runs dry it
//! walks the registered frames in clock order, picks a frame whose accessed
//! bit is clear, asks the occupant to persist itself, and hands the frame to
//! the caller.
//!
//! The registry and the swap table sit behind a single lock. Every change to
//! the residency of any page, in any address space, happens while that lock
//! is held:
//!
//! ```text
//!   FrameTable lock ──▶ page state lock ──▶ frame contents lock
//! ```
use crate::{
    clock::ClockQueue,
    page::PageState,
    swap::{SwapSlot, SwapTable},
};
use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use keos::{
    KernelError,
    addressing::{Pa, Va},
    debug,
    mm::{
        Page, PhysicalMemory,
        page_table::{PageTable, Permission},
    },
    sync::{SpinLock, SpinLockGuard},
    warning,
};

/// Back-reference from a frame to the page resident in it.
pub(crate) struct Owner {
    pub(crate) va: Va,
    pub(crate) writable: bool,
    pub(crate) page_table: Arc<dyn PageTable>,
    pub(crate) state: Weak<SpinLock<PageState>>,
}

impl Owner {
    // Reads and clears the accessed bit of the mapping.
    fn take_accessed(&self) -> bool {
        let accessed = self.page_table.is_accessed(self.va);
        if accessed {
            if let Err(e) = self.page_table.set_accessed(self.va, false) {
                warning!("Frame: cannot clear accessed bit of {:?} ({:?})", self.va, e);
            }
        }
        accessed
    }

    fn remap(&self, pa: Pa, dirty: bool) -> Result<(), KernelError> {
        self.page_table
            .map(self.va, pa, Permission::user(self.writable))?;
        if dirty {
            self.page_table.set_dirty(self.va, true)?;
        }
        Ok(())
    }
}

struct Frame {
    page: Page,
    owner: Owner,
}

/// A paging resource that ran out. Both are fatal to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// The pool is empty and no resident page can be evicted.
    Memory {
        /// Frames in the pool.
        frames: usize,
        /// Frames registered to a resident page.
        resident: usize,
    },
    /// Every slot of the swap device is taken.
    Swap {
        /// Slots on the swap device.
        slots: usize,
    },
}

impl core::fmt::Display for Exhausted {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Exhausted::Memory { frames, resident } => write!(
                f,
                "out of memory ({} frames, {} resident, nothing evictable)",
                frames, resident
            ),
            Exhausted::Swap { slots } => write!(f, "swap device full ({} slots)", slots),
        }
    }
}

/// State guarded by the frame table lock.
pub struct FrameTableInner {
    memory: Arc<PhysicalMemory>,
    clock: ClockQueue<Pa, Frame>,
    pub(crate) swap: SwapTable,
    evictions: usize,
    fatal: Option<Exhausted>,
}

impl FrameTableInner {
    /// Releases the frame table lock held by `guard`.
    ///
    /// # Panics
    /// Panics, once the lock is free, if a paging resource ran out while it
    /// was held.
    pub fn unlock(mut guard: SpinLockGuard<'_, Self>) {
        let fatal = guard.fatal.take();
        guard.unlock();
        if let Some(e) = fatal {
            panic!("Frame: {}", e);
        }
    }

    /// Returns a frame with no owner, evicting a resident page if the pool
    /// is exhausted.
    ///
    /// An error means a resource ran out: the caller releases the lock with
    /// [`FrameTableInner::unlock`], which panics.
    pub(crate) fn acquire(&mut self) -> Result<Page, KernelError> {
        match self.memory.alloc() {
            Some(page) => Ok(page),
            None => self.evict(),
        }
    }

    /// Allocates a swap slot. A full device is recorded as fatal.
    pub(crate) fn alloc_slot(&mut self) -> Result<SwapSlot, KernelError> {
        match self.swap.alloc() {
            Some(slot) => Ok(slot),
            None => Err(self.swap_full()),
        }
    }

    /// Copies `slot` into a new slot. A full device is recorded as fatal.
    pub(crate) fn duplicate_slot(&mut self, slot: SwapSlot) -> Result<SwapSlot, KernelError> {
        if self.swap.in_use() == self.swap.capacity() {
            return Err(self.swap_full());
        }
        self.swap.duplicate(slot)
    }

    fn swap_full(&mut self) -> KernelError {
        self.fatal = Some(Exhausted::Swap {
            slots: self.swap.capacity(),
        });
        KernelError::NoSpace
    }

    fn evict(&mut self) -> Result<Page, KernelError> {
        // The first pass clears every accessed bit, so the second one always
        // finds a victim unless every write-out fails.
        let budget = 2 * self.clock.len() + 1;
        for _ in 0..budget {
            let Some((pa, referenced)) = self
                .clock
                .front()
                .map(|(pa, frame)| (*pa, frame.owner.take_accessed()))
            else {
                break;
            };
            if referenced {
                self.clock.rotate();
                continue;
            }
            let Some(frame) = self.clock.remove(&pa) else {
                break;
            };
            match self.persist(frame) {
                Ok(page) => {
                    self.evictions += 1;
                    return Ok(page);
                }
                Err(frame) => {
                    self.clock.push_back(pa, frame);
                    if self.fatal.is_some() {
                        return Err(KernelError::NoSpace);
                    }
                }
            }
        }
        self.fatal = Some(Exhausted::Memory {
            frames: self.memory.frame_count(),
            resident: self.clock.len(),
        });
        Err(KernelError::NoMemory)
    }

    // Unmaps the victim and writes it to its backing store. Hands the frame
    // back, mapped again, if the write fails.
    fn persist(&mut self, frame: Frame) -> Result<Page, Frame> {
        let Frame { page, owner } = frame;
        let dirty = owner.page_table.is_dirty(owner.va);
        if let Err(e) = owner.page_table.unmap(owner.va) {
            warning!("Evict: {:?} was not mapped ({:?})", owner.va, e);
        }
        let Some(state) = owner.state.upgrade() else {
            return Ok(page);
        };

        let mut guard = state.lock();
        let result = guard.swap_out(self, &page, dirty);
        guard.unlock();

        match result {
            Ok(()) => {
                debug!(
                    "Evict: {:?} from {:?}{}",
                    page.pa(),
                    owner.va,
                    if dirty { " (dirty)" } else { "" }
                );
                Ok(page)
            }
            Err(e) => {
                warning!("Evict: failed to persist {:?} ({:?})", owner.va, e);
                if let Err(e) = owner.remap(page.pa(), dirty) {
                    warning!("Evict: failed to restore {:?} ({:?})", owner.va, e);
                }
                Err(Frame { page, owner })
            }
        }
    }

    /// Records `page` as the frame of `owner`.
    pub(crate) fn register(&mut self, page: Page, owner: Owner) {
        let pa = page.pa();
        let prev = self.clock.push_back(pa, Frame { page, owner });
        debug_assert!(prev.is_none(), "{:?} registered twice", pa);
    }

    /// Takes the frame at `pa` out of the registry.
    pub(crate) fn release(&mut self, pa: Pa) -> Option<Page> {
        self.clock.remove(&pa).map(|frame| frame.page)
    }

    /// The registered frame at `pa`.
    pub(crate) fn page(&self, pa: Pa) -> Option<&Page> {
        self.clock.get(&pa).map(|frame| &frame.page)
    }

    pub(crate) fn page_mut(&mut self, pa: Pa) -> Option<&mut Page> {
        self.clock.get_mut(&pa).map(|frame| &mut frame.page)
    }

    /// Number of registered frames.
    #[inline]
    pub fn resident(&self) -> usize {
        self.clock.len()
    }

    /// Number of evictions since the table was created.
    #[inline]
    pub fn evictions(&self) -> usize {
        self.evictions
    }

    /// The swap table.
    #[inline]
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Virtual address of the page resident in the frame at `pa`.
    pub fn owner_of(&self, pa: Pa) -> Option<Va> {
        self.clock.get(&pa).map(|frame| frame.owner.va)
    }

    /// Registered frames in clock order, with the address of their occupant.
    pub fn frames(&self) -> Vec<(Pa, Va)> {
        self.clock
            .keys()
            .into_iter()
            .filter_map(|pa| self.owner_of(pa).map(|va| (pa, va)))
            .collect()
    }
}

/// The frame registry shared by every address space.
pub struct FrameTable {
    inner: SpinLock<FrameTableInner>,
}

impl FrameTable {
    /// Creates a registry over the frames of `memory` that swaps to `swap`.
    pub fn new(memory: Arc<PhysicalMemory>, swap: SwapTable) -> Self {
        Self {
            inner: SpinLock::new(FrameTableInner {
                memory,
                clock: ClockQueue::new(),
                swap,
                evictions: 0,
                fatal: None,
            }),
        }
    }

    /// Locks the registry.
    ///
    /// The returned guard must be released with `unlock()`.
    pub fn lock(&self) -> SpinLockGuard<'_, FrameTableInner> {
        self.inner.lock()
    }

    /// Returns a frame with no owner, evicting a resident page if needed.
    ///
    /// The frame is not registered: it returns to the pool when dropped.
    ///
    /// # Panics
    /// Panics if the pool is empty and nothing can be evicted, or if an
    /// anonymous victim does not fit on the swap device.
    pub fn acquire_frame(&self) -> Result<Page, KernelError> {
        let mut inner = self.inner.lock();
        let page = inner.acquire();
        FrameTableInner::unlock(inner);
        page
    }
}
