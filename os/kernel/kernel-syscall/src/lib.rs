//! # Kernel System Calls
//!
//! The boundary user space sees: syscall numbers, the registers a call
//! passes through, the numeric [`Status`] every call returns and
//! [`dispatch`], which routes a call to a [`Channel`](kernel_ipc::Channel)
//! or [`Mailbox`](kernel_ipc::Mailbox).
//!
//! ## Calling convention
//!
//! | Register | In                | Out                    |
//! |----------|-------------------|------------------------|
//! | `rax`    | [`SyscallNumber`] | [`Status`]             |
//! | `rdi`    | argument 0        |                        |
//! | `rsi`    | argument 1        |                        |
//! | `rdx`    | argument 2        | value (byte count, …)  |
//! | `r10`    | argument 3        |                        |

#![cfg_attr(not(any(test, doctest)), no_std)]

mod dispatch;
mod frame;
mod number;
mod status;

pub use dispatch::{MAX_TRANSFER, SyscallContext, dispatch};
pub use frame::TrapFrame;
pub use number::SyscallNumber;
pub use status::Status;

/// Vector of the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;
