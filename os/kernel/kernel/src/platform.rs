//! The real hardware behind [`Platform`].

use crate::tss;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::{Cr2, Cr3, InterruptFrame, LoadRegisterUnsafe, Msr, Platform, StoreRegisterUnsafe};

#[derive(Debug, Default, Copy, Clone)]
pub struct KernelPlatform;

impl Platform for KernelPlatform {
    fn fault_address(&self) -> VirtualAddress {
        // SAFETY: reading CR2 in ring 0 has no side effects.
        unsafe { Cr2::load_unsafe() }.fault_address()
    }

    fn current_root(&self) -> PhysicalAddress {
        // SAFETY: reading CR3 in ring 0 has no side effects.
        unsafe { Cr3::load_unsafe() }.root()
    }

    unsafe fn switch_root(&self, root: PhysicalAddress) {
        if self.current_root() != root {
            // SAFETY: forwarded from the caller.
            unsafe { Cr3::from_root(root).store_unsafe() };
        }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: invlpg only drops a cached translation.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        // SAFETY: callers only name MSRs every x86-64 CPU has.
        unsafe { msr.load_raw() }
    }

    unsafe fn write_msr(&self, msr: Msr, value: u64) {
        // SAFETY: forwarded from the caller.
        unsafe { msr.store_raw(value) }
    }

    unsafe fn push_frame(&self, stack_top: VirtualAddress, frame: &InterruptFrame) -> u64 {
        let rsp = (stack_top.as_u64() - size_of::<InterruptFrame>() as u64) & !0xF;
        // SAFETY: the caller guarantees room for one frame below `stack_top`.
        unsafe { (rsp as *mut InterruptFrame).write(*frame) };
        rsp
    }

    fn set_kernel_stack(&self, rsp0: VirtualAddress) {
        tss::set_rsp0(rsp0);
    }
}
