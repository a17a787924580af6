//! Physical and virtual addresses.
//!
//! The virtual-memory subsystem moves pages between three address spaces:
//! the user virtual address space of each process ([`Va`]), the physical
//! frames owned by the frame registry ([`Pa`]), and the sectors of the swap
//! device. The first two are represented here as thin `usize` wrappers that
//! only allow the arithmetic the paging code actually needs.
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(0x1234).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x1000);
//! assert_eq!(va.page_up().into_usize(), 0x2000);
//! assert_eq!((va.page_down() + PAGE_SIZE).into_usize(), 0x2000);
//! ```

/// The size of a single page in memory, in bytes.
///
/// Every unit the paging code deals with (a user page, a physical frame and a
/// swap slot) is exactly this large.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Represents a physical address.
///
/// A [`Pa`] names a physical frame (or a byte within it). The frame registry
/// keys its records by the page-aligned [`Pa`] of each frame.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// Creates a new physical address if the address is valid.
    ///
    /// The address must be below `0xffff_0000_0000_0000`.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up the physical address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// Both halves of the canonical x86_64 address space are accepted; whether a
/// given [`Va`] is a legal *user* address is decided by the paging policy,
/// not by this type.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Example
    /// ```
    /// use abyss::addressing::Va;
    ///
    /// assert!(Va::new(0x4747_f000).is_some());
    /// assert!(Va::new(0xffff_8000_1234_5678).is_some());
    /// assert!(Va::new(0xffff_7000_1234_5678).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address lies on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// Adds `count` bytes, returning `None` if the result overflows or is not
    /// canonical.
    #[inline]
    pub const fn checked_add(self, count: usize) -> Option<Self> {
        match self.0.checked_add(count) {
            Some(addr) => Self::new(addr),
            None => None,
        }
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 -= other
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);
