//! # 64-bit Task State Segment
//!
//! Long mode has no hardware task switching, but the CPU still reads two
//! things from the TSS:
//!
//! - `rsp0`, the stack it switches to when an interrupt arrives from ring 3.
//!   The scheduler points it at the kernel stack of whichever thread runs
//!   next.
//! - `ist1..ist7`, stacks bound to individual IDT gates. The double-fault
//!   gate uses [`Ist::DoubleFault`] so it never runs on a broken stack.

use core::cell::UnsafeCell;
use kernel_memory_addresses::VirtualAddress;

/// Interrupt Stack Table slots in use.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Ist {
    DoubleFault = 1,
}

const IST_STACK_SIZE: usize = 16 * 1024;

#[repr(C, align(16))]
struct IstStack([u8; IST_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);

#[repr(C, packed)]
pub struct Tss64 {
    _reserved0: u32,
    /// Stack for privilege changes into ring 0.
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    /// `ist[n - 1]` backs IST index `n`.
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    /// At the end of the segment: no I/O permission bitmap.
    iopb_offset: u16,
}

impl Tss64 {
    #[allow(clippy::cast_possible_truncation)]
    const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

const _: () = assert!(size_of::<Tss64>() == 104);

/// The bootstrap CPU's TSS. Only written with interrupts off.
struct TssCell(UnsafeCell<Tss64>);

// SAFETY: single CPU; every writer runs with interrupts disabled.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(Tss64::new()));

/// Address and limit of the TSS, for its GDT descriptor.
pub fn segment() -> (VirtualAddress, u32) {
    #[allow(clippy::cast_possible_truncation)]
    let limit = (size_of::<Tss64>() - 1) as u32;
    (VirtualAddress::from_ptr(TSS.0.get()), limit)
}

/// Fill in the initial ring-0 stack and the IST stacks.
pub fn init(rsp0: VirtualAddress) {
    let df_top = VirtualAddress::from_ptr(&raw const DOUBLE_FAULT_STACK) + IST_STACK_SIZE as u64;
    let tss = TSS.0.get();
    // SAFETY: called once during bring-up, before `ltr`.
    unsafe {
        let mut ist = (*tss).ist;
        ist[Ist::DoubleFault as usize - 1] = df_top.as_u64();
        (*tss).ist = ist;
        (*tss).rsp0 = rsp0.as_u64();
    }
}

/// Stack used on the next ring 3 to ring 0 transition.
pub fn set_rsp0(rsp0: VirtualAddress) {
    let tss = TSS.0.get();
    // SAFETY: interrupts are off while the scheduler switches threads, so
    // the CPU cannot read the field mid-update.
    unsafe { (*tss).rsp0 = rsp0.as_u64() };
}
