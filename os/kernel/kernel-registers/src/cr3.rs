use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: Page-Map Level-4 Base Register (PCID disabled).
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0-2: Reserved.
    #[bits(3)]
    __: u8,

    /// Bit 3: PWT: write-through for PML4 accesses.
    pub pwt: bool,

    /// Bit 4: PCD: cache disable for PML4 accesses.
    pub pcd: bool,

    /// Bits 5-11: Reserved.
    #[bits(7)]
    __: u8,

    /// Bits 12-51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52-63: Reserved.
    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value selecting the PML4 at `root` with write-back caching.
    ///
    /// `root` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_root(root: PhysicalAddress) -> Self {
        debug_assert_eq!(root.as_u64() & 0xFFF, 0, "PML4 base must be 4K-aligned");
        Self::new().with_pml4_base_4k(root.as_u64() >> 12)
    }

    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_roundtrip() {
        let cr3 = Cr3::from_root(PhysicalAddress::new(0x0012_3000));
        assert_eq!(cr3.into_bits(), 0x0012_3000);
        assert_eq!(cr3.root(), PhysicalAddress::new(0x0012_3000));
        assert_eq!(Cr3::from_bits(0x0012_3018).root().as_u64(), 0x0012_3000);
    }
}
