//! # Kernel synchronization primitives
//!
//! * [`SpinLock`] guards short critical sections such as the frame allocator
//!   lists and the page-table cache.
//! * [`IrqSpinLock`] additionally keeps interrupts off while held, for state
//!   shared with interrupt handlers (mailbox queues, channel rings).
//! * [`SyncOnceCell`] publishes kernel singletons exactly once.
//!
//! Interrupt masking only executes `cli`/`sti` with the `asm` feature; without
//! it [`IrqGuard`] is a no-op so the crate can be tested on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqSpinLock, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
