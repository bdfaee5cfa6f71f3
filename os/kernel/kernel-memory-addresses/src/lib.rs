//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses handled by the frame
//! allocator, the page-table code and the scheduler.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory or MMIO. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory. |
//!
//! ## Canonical virtual addresses
//!
//! x86-64 with 4-level paging translates 48 bits. The remaining bits 48..=63
//! must be copies of bit 47, which splits the space into a lower half
//! (`0x0000_0000_0000_0000..=0x0000_7FFF_FFFF_FFFF`) and a higher half
//! (`0xFFFF_8000_0000_0000..=0xFFFF_FFFF_FFFF_FFFF`).
//!
//! ```text
//!  63      48 47     39 38     30 29     21 20     12 11          0
//! +----------+---------+---------+---------+---------+-------------+
//! | sign ext | PML4 ix | PDPT ix |  PD ix  |  PT ix  |   offset    |
//! +----------+---------+---------+---------+---------+-------------+
//! ```
//!
//! [`VirtualAddress::from_indices`] encodes and [`VirtualAddress::index`]
//! decodes the four 9-bit table indices; both honor the sign extension.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::from_indices([0, 0, 0, 256], 0);
//! assert_eq!(va.as_u64(), 0xFFFF_8000_0000_0000);
//! assert_eq!(va.index(3), 256);
//! assert!(va.is_canonical());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod page;
mod page_size;
mod physical_address;
mod virtual_address;

pub use page::{PhysicalPage, VirtualPage};
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of the base page, in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Number of 4 KiB pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn page_count(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert!(is_aligned(0x20_0000, Size2M::SIZE));
        assert!(!is_aligned(0x20_1000, Size2M::SIZE));
    }

    #[test]
    fn page_counts_round_up() {
        assert_eq!(page_count(0), 0);
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(4096), 1);
        assert_eq!(page_count(4097), 2);
    }

    #[test]
    fn split_and_join_roundtrip_4k() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        let (page, off) = va.split::<Size4K>();
        assert_eq!(page.base().as_u64(), 0xFFFF_FFFF_8000_1000);
        assert_eq!(off, 0x234);
        assert_eq!(page.join(off), va);
    }

    #[test]
    fn split_and_join_roundtrip_2m() {
        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        let (page, off) = pa.split::<Size2M>();
        assert_eq!(page.base().as_u64() & (Size2M::SIZE - 1), 0);
        assert_eq!(page.join(off), pa);
    }
}
