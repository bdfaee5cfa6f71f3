//! Page faults: demand paging for allowed regions, everything else is fatal
//! for the faulting process (or the kernel).

use crate::interrupts::Idt;
use crate::memory;
use crate::platform::KernelPlatform;
use crate::tasks;
use bitfield_struct::bitfield;
use kernel_registers::{InterruptFrame, Platform};
use kernel_vmem::FaultResolution;
use log::{error, trace};

pub const PAGE_FAULT_VECTOR: usize = 0x0E;

isr_stub!(page_fault_stub, PAGE_FAULT_VECTOR, error_code);

pub trait PageFaultInterrupt {
    fn init_page_fault_gate(&mut self) -> &mut Self;
}

impl PageFaultInterrupt for Idt {
    fn init_page_fault_gate(&mut self) -> &mut Self {
        self[PAGE_FAULT_VECTOR].set_handler(page_fault_stub);
        self
    }
}

/// Page-fault error code layout (Intel SDM Vol. 3A, §6.15 "#PF").
#[bitfield(u64)]
pub struct PageFaultError {
    /// Clear: non-present page. Set: protection violation.
    pub present: bool,
    pub write: bool,
    /// Raised at CPL 3.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

pub(super) fn page_fault(frame: &mut InterruptFrame, rsp: u64) -> u64 {
    let platform = KernelPlatform;
    let va = platform.fault_address();
    let err = PageFaultError::from_bits(frame.error_code);

    if !err.present() {
        match memory::resolve_fault(platform.current_root(), va) {
            Ok(FaultResolution::Resolved(frame_pa)) => {
                trace!("demand page {va} -> {frame_pa}");
                platform.invalidate_page(va);
                return rsp;
            }
            Ok(FaultResolution::NotAllowed | FaultResolution::Protection) => {}
            Err(e) => error!("backing {va} failed: {e}"),
        }
    }

    if frame.from_user() {
        error!("page fault at {va}, rip {:#x}: {}", frame.rip, err.explain());
        return tasks::kill_current(rsp, "page fault");
    }
    panic!(
        "kernel page fault at {va}, rip {:#x}, error {:#x}: {}",
        frame.rip,
        err.into_bits(),
        err.explain()
    );
}
