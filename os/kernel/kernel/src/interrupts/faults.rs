//! CPU exceptions other than page faults.
//!
//! A fault in user mode kills the faulting process; the same fault in the
//! kernel is a bug and panics.

use crate::interrupts::Idt;
use crate::tasks;
use crate::tss::Ist;
use bitfield_struct::bitfield;
use kernel_registers::InterruptFrame;
use log::{error, info};

pub const DIVIDE_ERROR_VECTOR: usize = 0x00;
pub const BREAKPOINT_VECTOR: usize = 0x03;
pub const INVALID_OPCODE_VECTOR: usize = 0x06;
pub const DOUBLE_FAULT_VECTOR: usize = 0x08;
pub const GENERAL_PROTECTION_VECTOR: usize = 0x0D;

isr_stub!(divide_error_stub, DIVIDE_ERROR_VECTOR);
isr_stub!(breakpoint_stub, BREAKPOINT_VECTOR);
isr_stub!(invalid_opcode_stub, INVALID_OPCODE_VECTOR);
isr_stub!(double_fault_stub, DOUBLE_FAULT_VECTOR, error_code);
isr_stub!(general_protection_stub, GENERAL_PROTECTION_VECTOR, error_code);

pub trait FaultInterrupts {
    fn init_fault_gates(&mut self) -> &mut Self;
}

impl FaultInterrupts for Idt {
    fn init_fault_gates(&mut self) -> &mut Self {
        self[DIVIDE_ERROR_VECTOR].set_handler(divide_error_stub);
        // `int3` from user space only logs.
        self[BREAKPOINT_VECTOR].set_handler(breakpoint_stub).dpl(3);
        self[INVALID_OPCODE_VECTOR].set_handler(invalid_opcode_stub);
        self[DOUBLE_FAULT_VECTOR]
            .set_handler(double_fault_stub)
            .ist(Ist::DoubleFault);
        self[GENERAL_PROTECTION_VECTOR].set_handler(general_protection_stub);
        self
    }
}

/// Error code of faults caused by a segment selector.
#[bitfield(u64)]
pub struct SelectorErrorCode {
    /// Raised while delivering an external event.
    pub external: bool,
    /// The index refers to the IDT.
    pub idt: bool,
    /// With `idt` clear: LDT rather than GDT.
    pub ldt: bool,
    #[bits(13)]
    pub index: u16,
    #[bits(48)]
    __: u64,
}

fn fatal(frame: &InterruptFrame, rsp: u64, what: &str) -> u64 {
    if frame.from_user() {
        return tasks::kill_current(rsp, what);
    }
    panic!("{what} in kernel at {:#x}, rsp {:#x}", frame.rip, frame.rsp);
}

pub(super) fn divide_error(frame: &mut InterruptFrame, rsp: u64) -> u64 {
    fatal(frame, rsp, "divide error")
}

pub(super) fn breakpoint(frame: &mut InterruptFrame, rsp: u64) -> u64 {
    info!("breakpoint at {:#x}", frame.rip);
    rsp
}

pub(super) fn invalid_opcode(frame: &mut InterruptFrame, rsp: u64) -> u64 {
    fatal(frame, rsp, "invalid opcode")
}

pub(super) fn double_fault(frame: &mut InterruptFrame, _rsp: u64) -> u64 {
    panic!("double fault at {:#x}, rsp {:#x}", frame.rip, frame.rsp);
}

pub(super) fn general_protection(frame: &mut InterruptFrame, rsp: u64) -> u64 {
    if frame.error_code != 0 {
        let code = SelectorErrorCode::from_bits(frame.error_code);
        let table = match (code.idt(), code.ldt()) {
            (true, _) => "IDT",
            (false, true) => "LDT",
            (false, false) => "GDT",
        };
        error!("#GP on {table} entry {:#x} (external: {})", code.index(), code.external());
    }
    fatal(frame, rsp, "general protection fault")
}
