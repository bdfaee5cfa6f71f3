//! # Virtual Memory Management (x86-64, 4-level paging)
//!
//! Page-table entries, table pages, a cursor that walks the radix tree for a
//! virtual address, and [`AddressSpace`] which maps, unmaps and marks
//! demand-fault regions over one tree.
//!
//! ```text
//!  VA  ──► PML4[47:39] ──► PDPT[38:30] ──► PD[29:21] ──► PT[20:12] ──► frame + VA[11:0]
//!                              │ PS=1: 1 GiB    │ PS=1: 2 MiB
//! ```
//!
//! ## Who provides what
//!
//! - [`PhysMapper`] turns a physical table address into a reference. In the
//!   kernel this is the offset window at `HHDM_BASE`; in tests it is a heap
//!   buffer standing in for RAM.
//! - [`FrameAlloc`] hands out raw 4 KiB frames.
//! - [`TableCache`] keeps zeroed table pages in reserve so the page-fault
//!   path can build intermediate tables without calling the allocator.
//!
//! ## Allowed regions
//!
//! Bit 9 of an entry marks the range it covers as valid to back on first
//! touch. The marker may sit at any level, so one entry in a PDPT covers a
//! whole GiB. [`AddressSpace::is_allowed`] walks from the deepest resolvable
//! entry back towards the root and reports the first marker it finds.

#![cfg_attr(not(any(test, doctest, feature = "test-support")), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod cache;
mod cursor;
mod entry;
mod table;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use address_space::{AddressSpace, FaultResolution, MapMode};
pub use cache::TableCache;
pub use cursor::Cursor;
pub use entry::{PageEntry, TABLE_FLAGS};
pub use table::{ENTRIES, PageTable, PageTableLevel, table_at};

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Failures of page-table operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("virtual address {0} is not canonical")]
    NonCanonical(VirtualAddress),
    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("range starting at {0} leaves its address half")]
    RangeOverflow(VirtualAddress),
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} lies inside a huge page")]
    HugePage(VirtualAddress),
    #[error("page-table cache is empty")]
    CacheEmpty,
    #[error("out of physical frames")]
    OutOfMemory,
}

/// Source of physical 4 KiB frames.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Up to `max` contiguous frames; returns the base and the count
    /// actually provided (at least one).
    fn alloc_run(&mut self, max: usize) -> Option<(PhysicalAddress, usize)> {
        debug_assert!(max > 0);
        self.alloc_4k().map(|pa| (pa, 1))
    }

    fn free_4k(&mut self, pa: PhysicalAddress);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        (**self).alloc_4k()
    }

    fn alloc_run(&mut self, max: usize) -> Option<(PhysicalAddress, usize)> {
        (**self).alloc_run(max)
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        (**self).free_4k(pa);
    }
}

/// Access to physical memory holding page tables and fresh frames.
pub trait PhysMapper {
    /// Reference to a `T` stored at physical address `pa`.
    ///
    /// # Safety
    /// `pa` must be mapped by the implementation, suitably aligned for `T`,
    /// and the caller must not create aliasing mutable references.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Fill the frame at `pa` with zeros.
///
/// # Safety
/// The frame must be owned by the caller and not referenced elsewhere.
pub unsafe fn zero_frame<M: PhysMapper>(mapper: &M, pa: PhysicalAddress) {
    debug_assert!(pa.as_u64() % PAGE_SIZE == 0);
    let page = unsafe { mapper.phys_to_mut::<[u64; 512]>(pa) };
    page.fill(0);
}
