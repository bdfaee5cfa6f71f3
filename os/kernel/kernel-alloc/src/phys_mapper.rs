//! # Physical memory access through the offset window
//!
//! Once the kernel address space is active, all usable RAM is visible at
//! `HHDM_BASE + pa`. [`HhdmPhysMapper`] turns a physical address into a
//! reference inside that window.
//!
//! During early boot the loader's identity mapping is still live, so
//! [`IdentityPhysMapper`] is used until the switch to the kernel tables.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//! let mapper = HhdmPhysMapper;
//! unsafe {
//!     let table: &mut PageTable = mapper.phys_to_mut(PhysicalAddress::new(0x1234_0000));
//!     table.zero();
//! }
//! ```

use kernel_info::memory::phys_to_offset_map;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the higher-half offset window.
///
/// # Safety
/// The window must be mapped and cover the referenced physical range.
#[derive(Debug, Copy, Clone, Default)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = phys_to_offset_map(pa.as_u64()) as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *va }
    }
}

/// [`PhysMapper`] for an identity-mapped physical range.
#[derive(Debug, Copy, Clone, Default)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = pa.as_u64() as *mut T;
        // SAFETY: Caller must ensure the range is identity-mapped.
        unsafe { &mut *va }
    }
}
