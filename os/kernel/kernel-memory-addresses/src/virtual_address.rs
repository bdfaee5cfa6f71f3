use crate::{PageSize, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Bits of a virtual address translated by 4-level paging.
const ADDRESS_BITS: u32 = 48;

/// Number of index bits per page-table level.
const INDEX_BITS: u32 = 9;

const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// Virtual memory address.
///
/// [`new`](Self::new) stores the raw value. Use [`canonical`](Self::canonical)
/// to force the sign extension of bit 47, or [`try_new`](Self::try_new) to
/// reject values that violate it.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::canonical(0x0000_8000_0000_0000);
/// assert_eq!(va.as_u64(), 0xFFFF_8000_0000_0000);
/// assert!(VirtualAddress::try_new(0x0001_0000_0000_0000).is_none());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Sign-extend bit 47 into bits 48..=63.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn canonical(v: u64) -> Self {
        let shift = 64 - ADDRESS_BITS;
        Self((((v << shift) as i64) >> shift) as u64)
    }

    #[inline]
    #[must_use]
    pub const fn try_new(v: u64) -> Option<Self> {
        if Self::canonical(v).0 == v {
            Some(Self(v))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        Self::canonical(self.0).0 == self.0
    }

    /// Build an address from its four table indices (`indices[3]` is the
    /// PML4 index, `indices[0]` the PT index) plus an in-page offset.
    ///
    /// The result is always canonical.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless, clippy::cast_possible_truncation)]
    pub const fn from_indices(indices: [u16; 4], offset: u64) -> Self {
        let mut v = offset & 0xFFF;
        let mut level = 0;
        while level < 4 {
            v |= (indices[level] as u64 & INDEX_MASK) << (12 + INDEX_BITS * level as u32);
            level += 1;
        }
        Self::canonical(v)
    }

    /// Table index at `level` (3 = PML4, 0 = PT).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self, level: usize) -> u16 {
        ((self.0 >> (12 + INDEX_BITS * level as u32)) & INDEX_MASK) as u16
    }

    #[inline]
    #[must_use]
    pub const fn is_higher_half(self) -> bool {
        self.0 & (1 << (ADDRESS_BITS - 1)) != 0
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (VirtualPage<S>, u64) {
        (self.page::<S>(), self.offset::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.offset::<S>() == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
