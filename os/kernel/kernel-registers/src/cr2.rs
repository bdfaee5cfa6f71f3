use kernel_memory_addresses::VirtualAddress;

/// CR2: Page-Fault Linear Address.
///
/// Holds the faulting virtual address after a `#PF`. Must be read before
/// anything else can fault again.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Cr2(u64);

impl Cr2 {
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn fault_address(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }
}

#[cfg(feature = "asm")]
impl crate::LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let cr2: u64;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(cr2)
    }
}
