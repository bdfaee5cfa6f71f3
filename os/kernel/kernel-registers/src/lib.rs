//! # Typed `X86_64` Registers
//!
//! Bitfield views of the control registers, RFLAGS and MSRs the memory and
//! scheduling code cares about, plus the [`Platform`] trait through which
//! that code reaches the hardware. Inline assembly is only compiled with the
//! `asm` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr2;
pub mod cr3;
pub mod frame;
pub mod msr;
pub mod platform;
pub mod rflags;

pub use cr2::Cr2;
pub use cr3::Cr3;
pub use frame::InterruptFrame;
pub use msr::Msr;
pub use platform::Platform;
pub use rflags::Rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
