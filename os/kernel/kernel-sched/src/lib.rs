//! # Kernel Scheduler
//!
//! Processes, threads and the priority round-robin dispatcher.
//!
//! ```text
//!               create_process / create_thread
//!                             │
//!                             ▼
//!   ┌─────────┐  schedule  ┌─────────┐  exit_thread  ┌─────────┐  prune
//!   │  Ready  │ ─────────► │ Running │ ────────────► │ Exited  │ ──────► gone
//!   └─────────┘ ◄───────── └─────────┘               └─────────┘
//!        ▲       preempted      │ block_current           ▲
//!        │ wake                 ▼                         │ kill_process
//!        └──────────────── ┌─────────┐ ──────────────────-┘
//!                          │ Blocked │
//!                          └─────────┘
//! ```
//!
//! Threads live in one arena keyed by [`ThreadId`]; the run-lists, the
//! blocked list and the exited list hold ids only. There is one run-list per
//! [`Priority`] and dispatch always takes the head of the most urgent
//! non-empty list. With nothing ready the idle thread runs; it is never in a
//! run-list.
//!
//! Hardware access (CR3, the TSS kernel stack, building the first interrupt
//! frame of a thread) goes through [`kernel_registers::Platform`], and
//! address-space construction through [`ProcessLoader`], so the whole
//! crate runs in host tests.

#![cfg_attr(not(any(test, doctest, feature = "test-support")), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod image;
pub mod loader;
pub mod process;
pub mod scheduler;
pub mod thread;
pub mod wait_queue;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use image::{ImageError, ProgramImage, Segment, SegmentFlags};
pub use loader::{AddressSpaceLoader, LoadedProcess, ProcessLoader};
pub use process::{Handle, Process, ProcessId};
pub use scheduler::{PRUNE_INTERVAL_TICKS, Scheduler, Selectors, ThreadStart};
pub use thread::{KernelStack, NUM_PRIORITIES, Priority, Thread, ThreadId, ThreadState};
pub use wait_queue::WaitQueue;

use kernel_vmem::MapError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SchedError {
    #[error("no process {0}")]
    NoSuchProcess(ProcessId),
    #[error("no thread {0}")]
    NoSuchThread(ThreadId),
    #[error("thread {tid}: {from:?} -> {to:?} is not a valid transition")]
    BadTransition {
        tid: ThreadId,
        from: ThreadState,
        to: ThreadState,
    },
    #[error("priority {0} out of range")]
    BadPriority(u8),
    #[error("user thread without a stack")]
    MissingStack,
    #[error("the idle thread cannot be {0}")]
    Idle(&'static str),
    #[error("invalid program image: {0}")]
    Image(#[from] ImageError),
    #[error("address space: {0}")]
    AddressSpace(#[from] MapError),
}
