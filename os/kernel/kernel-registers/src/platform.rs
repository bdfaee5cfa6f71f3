//! Hardware access seam.
//!
//! The scheduler and the fault handlers never execute privileged
//! instructions directly; they call through [`Platform`]. The kernel binary
//! provides the x86-64 implementation, tests provide a recording one.

use crate::{InterruptFrame, Msr};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

pub trait Platform {
    /// Address that caused the most recent page fault (CR2).
    fn fault_address(&self) -> VirtualAddress;

    /// Root of the active page-table tree (CR3).
    fn current_root(&self) -> PhysicalAddress;

    /// Activate another page-table tree.
    ///
    /// # Safety
    /// `root` must be a valid PML4 that maps the currently executing code
    /// and stack.
    unsafe fn switch_root(&self, root: PhysicalAddress);

    /// Drop the TLB entry for one page of the active tree.
    fn invalidate_page(&self, va: VirtualAddress);

    fn read_msr(&self, msr: Msr) -> u64;

    /// # Safety
    /// The MSR must exist and accept `value`.
    unsafe fn write_msr(&self, msr: Msr, value: u64);

    /// Store `frame` just below `stack_top` and return the stack pointer
    /// that restores it.
    ///
    /// # Safety
    /// `stack_top` must be the writable top of a kernel stack with room for
    /// an [`InterruptFrame`].
    unsafe fn push_frame(&self, stack_top: VirtualAddress, frame: &InterruptFrame) -> u64;

    /// Stack the CPU switches to when an interrupt arrives from ring 3.
    fn set_kernel_stack(&self, rsp0: VirtualAddress);
}
