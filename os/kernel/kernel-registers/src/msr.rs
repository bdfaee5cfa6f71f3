//! # Model-Specific Registers (MSR)
//!
//! Raw `rdmsr`/`wrmsr` access by architectural index. Most callers go
//! through [`Platform::read_msr`](crate::Platform::read_msr) instead so they
//! can be exercised without hardware.

/// Identifies a **Model-Specific Register** by its architectural index.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    /// Extended feature enables (SCE, LME, NXE).
    pub const IA32_EFER: Self = Self(0xC000_0080);
    /// Page attribute table.
    pub const IA32_PAT: Self = Self(0x0000_0277);
    /// Active GS base.
    pub const IA32_GS_BASE: Self = Self(0xC000_0101);
    /// GS base swapped in by `swapgs`; holds the per-CPU block pointer.
    pub const IA32_KERNEL_GS_BASE: Self = Self(0xC000_0102);

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Write a 64-bit value to this MSR.
    ///
    /// # Safety
    /// Executes the privileged `WRMSR` instruction (CPL 0 only). The MSR
    /// must exist and accept `val`, otherwise the CPU raises `#GP(0)`.
    #[cfg(feature = "asm")]
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn store_raw(self, val: u64) {
        let lo = (val & 0xFFFF_FFFF) as u32;
        let hi = (val >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") self.0,
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags)
            );
        }
    }

    /// Read this MSR.
    ///
    /// # Safety
    /// Executes the privileged `RDMSR` instruction (CPL 0 only).
    #[cfg(feature = "asm")]
    #[inline]
    pub unsafe fn load_raw(self) -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") self.0,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}
