//! # x86-64 Interrupt Descriptor Table (IDT)
//!
//! Every gate points at a small naked stub that pushes a dummy error code
//! (unless the CPU pushed one), then the vector number, and jumps to
//! [`common_entry`]. That one saves the general purpose registers so the
//! stack holds an [`InterruptFrame`], calls [`dispatch`] with its address
//! and resumes from whatever stack pointer `dispatch` returns. Returning
//! another thread's saved frame is how a context switch happens.
//!
//! ```text
//!   ss, rsp, rflags, cs, rip    pushed by the CPU
//!   error code                  CPU or stub
//!   vector                      stub
//!   rax .. r15                  common_entry     <- rsp passed to dispatch
//! ```
//!
//! All gates are interrupt gates: handlers run with `IF` clear.
//!
//! ## Acronyms
//! - **DPL** – *Descriptor Privilege Level* (0=kernel … 3=user)
//! - **IST** – *Interrupt Stack Table* (per-entry alternate stack from the TSS)

/// Entry stub for `$vector`. The `error_code` form is for vectors where the
/// CPU pushes an error code itself.
macro_rules! isr_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        pub(super) extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym crate::interrupts::common_entry,
            );
        }
    };
    ($name:ident, $vector:expr, error_code) => {
        #[unsafe(naked)]
        pub(super) extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym crate::interrupts::common_entry,
            );
        }
    };
}

pub mod faults;
pub mod page_fault;
pub mod spurious;
pub mod syscall;
pub mod timer;

use crate::gdt::KERNEL_CS;
use crate::tss::Ist;
use bitfield_struct::bitfield;
use core::arch::{asm, naked_asm};
use core::ops::{Index, IndexMut};
use faults::FaultInterrupts;
use kernel_registers::InterruptFrame;
use kernel_sync::SyncOnceCell;
use page_fault::PageFaultInterrupt;
use spurious::SpuriousInterrupt;
use syscall::SyscallInterrupt;
use timer::TimerInterrupt;

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(align_of::<Idt>() == 16);

/// Handler for one vector. Gets the saved frame and the stack pointer it
/// lives at; returns the stack pointer to resume from.
pub type Handler = fn(&mut InterruptFrame, u64) -> u64;

/// The middle two bytes of a gate: IST index, type and attributes.
#[bitfield(u16)]
pub struct IdtGateAttr {
    /// 0 disables IST switching.
    #[bits(3)]
    pub ist: u8,
    #[bits(5)]
    __zero0: u8,
    /// 0xE = interrupt gate, 0xF = trap gate.
    #[bits(4)]
    pub typ: u8,
    #[bits(1)]
    pub s: bool,
    /// Lowest privilege that may raise the vector with `int n`.
    #[bits(2)]
    pub dpl: u8,
    #[bits(1)]
    pub present: bool,
}

#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Load this table with `lidt`.
    ///
    /// # Safety
    /// Every present entry must point at a valid stub.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn load(&'static self) {
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u64,
}

/// One 16-byte gate descriptor.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    ist_type: u16,
    offset_mid: u16,
    offset_hi: u32,
    zero: u32,
}

impl IdtEntry {
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        ist_type: IdtGateAttr::new().into_bits(),
        offset_mid: 0,
        offset_hi: 0,
        zero: 0,
    };

    /// Point this gate at `stub` in the kernel code segment. The gate starts
    /// out present, ring 0 only, as an interrupt gate without IST.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_handler(&mut self, stub: extern "C" fn()) -> IdtEntryBuilder<'_> {
        let addr = stub as usize as u64;
        self.offset_lo = (addr & 0xFFFF) as u16;
        self.offset_mid = ((addr >> 16) & 0xFFFF) as u16;
        self.offset_hi = (addr >> 32) as u32;
        self.selector = KERNEL_CS;
        self.ist_type = IdtGateAttr::new()
            .with_typ(0xE)
            .with_present(true)
            .into_bits();
        IdtEntryBuilder { entry: self }
    }
}

pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

impl IdtEntryBuilder<'_> {
    /// Allow ring `dpl` to raise the vector with `int n`.
    pub fn dpl(self, dpl: u8) -> Self {
        debug_assert!(dpl <= 3);
        let bf = IdtGateAttr::from_bits(self.entry.ist_type).with_dpl(dpl);
        self.entry.ist_type = bf.into_bits();
        self
    }

    /// Switch to a dedicated stack on entry.
    pub const fn ist(self, ist: Ist) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.ist_type).with_ist(ist as u8);
        self.entry.ist_type = bf.into_bits();
        self
    }
}

static IDT: SyncOnceCell<Idt> = SyncOnceCell::new();

/// Build the IDT and load it.
pub fn init() {
    let idt = IDT.get_or_init(|| {
        let mut idt = Idt::new();
        idt.init_fault_gates()
            .init_page_fault_gate()
            .init_syscall_gates()
            .init_timer_gate()
            .init_spurious_interrupt_gate();
        idt
    });
    // SAFETY: every gate installed above points at one of our stubs.
    unsafe { idt.load() };
}

/// Saves the registers behind the stub's pushes, dispatches, and resumes
/// from the stack pointer [`dispatch`] returns.
#[unsafe(naked)]
pub(crate) extern "C" fn common_entry() {
    naked_asm!(
        "push rax", "push rbx", "push rcx", "push rdx", "push rsi", "push rdi", "push rbp",
        "push r8", "push r9", "push r10", "push r11", "push r12", "push r13", "push r14", "push r15",
        "cld",
        // The frame is 22 quadwords on a 16-byte aligned stack, so rsp is
        // aligned for the call.
        "mov rdi, rsp",
        "call {dispatch}",
        "mov rsp, rax",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop r11", "pop r10", "pop r9", "pop r8",
        "pop rbp", "pop rdi", "pop rsi", "pop rdx", "pop rcx", "pop rbx", "pop rax",
        // vector and error code
        "add rsp, 16",
        "iretq",
        dispatch = sym dispatch,
    );
}

static HANDLERS: [Option<Handler>; 256] = handlers();

const fn handlers() -> [Option<Handler>; 256] {
    let mut h: [Option<Handler>; 256] = [None; 256];
    h[faults::DIVIDE_ERROR_VECTOR] = Some(faults::divide_error as Handler);
    h[faults::BREAKPOINT_VECTOR] = Some(faults::breakpoint as Handler);
    h[faults::INVALID_OPCODE_VECTOR] = Some(faults::invalid_opcode as Handler);
    h[faults::DOUBLE_FAULT_VECTOR] = Some(faults::double_fault as Handler);
    h[faults::GENERAL_PROTECTION_VECTOR] = Some(faults::general_protection as Handler);
    h[page_fault::PAGE_FAULT_VECTOR] = Some(page_fault::page_fault as Handler);
    h[syscall::SYSCALL_VECTOR as usize] = Some(syscall::syscall as Handler);
    h[syscall::YIELD_VECTOR as usize] = Some(syscall::yield_cpu as Handler);
    h[timer::LAPIC_TIMER_VECTOR as usize] = Some(timer::timer as Handler);
    h
}

extern "C" fn dispatch(rsp: u64) -> u64 {
    // SAFETY: `common_entry` passes the frame it just built.
    let frame = unsafe { &mut *(rsp as *mut InterruptFrame) };
    #[allow(clippy::cast_possible_truncation)]
    match HANDLERS.get(frame.vector as usize).copied().flatten() {
        Some(handler) => handler(frame, rsp),
        None => panic!("unexpected interrupt {:#x} at {:#x}", frame.vector, frame.rip),
    }
}

pub fn disable() {
    // SAFETY: masking interrupts has no memory effects.
    unsafe { asm!("cli", options(nomem, nostack)) };
}

/// Enable interrupts and halt until the next one arrives. Used by the idle
/// thread only; everything else runs with interrupts off.
pub fn enable_and_wait() {
    // SAFETY: `sti` takes effect after `hlt` is reached, so no wake-up is
    // missed in between.
    unsafe { asm!("sti", "hlt", "cli", options(nostack)) };
}

/// Give up the CPU. The current thread resumes here when it is picked
/// again.
pub fn yield_now() {
    // SAFETY: the yield gate saves and restores the full register state.
    unsafe { asm!("int {v}", v = const syscall::YIELD_VECTOR) };
}
