//! # Kernel Configuration and Boot Interface
//!
//! Layout constants and the loader-to-kernel handoff structure shared by the
//! loader, the kernel binary and the memory-management crates.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │        User Space               │
//!                       │  (one address space / process)  │
//! USER_STACK_TOP        ├─────────────────────────────────┤ 0x0000_0800_0000_0000
//!                       │             ...                 │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   non-canonical hole            │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Offset map of physical RAM    │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │   Kernel heap (grown on demand) │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel text & data            │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Boot Protocol
//!
//! The loader builds a [`KernelArgs`](boot::KernelArgs) describing physical
//! memory, the loaded modules and the page tables it set up, then jumps to
//! the kernel with a pointer to it:
//!
//! ```rust
//! # use kernel_info::boot::KernelArgs;
//! pub type KernelEntryFn = extern "win64" fn(*const KernelArgs) -> !;
//! ```
//!
//! The constants in [`memory`] are also consumed by the kernel's `build.rs`
//! to configure the linker.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
