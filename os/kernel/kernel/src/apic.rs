//! Local APIC in x2APIC mode: spurious vector, end-of-interrupt and the
//! periodic timer that drives the scheduler.

use crate::interrupts::spurious::SPURIOUS_INTERRUPT_VECTOR;
use crate::interrupts::timer::LAPIC_TIMER_VECTOR;
use kernel_registers::Msr;
use log::info;

const IA32_APIC_BASE: Msr = Msr(0x1B);
const APIC_EN: u64 = 1 << 11;
const APIC_EXTD: u64 = 1 << 10;

const X2APIC_ID: Msr = Msr(0x802);
const X2APIC_EOI: Msr = Msr(0x80B);
const X2APIC_SVR: Msr = Msr(0x80F);
const X2APIC_LVT_TIMER: Msr = Msr(0x832);
const X2APIC_INITCNT: Msr = Msr(0x838);
const X2APIC_DIVCONF: Msr = Msr(0x83E);

const LVT_MASKED: u64 = 1 << 16;
const LVT_PERIODIC: u64 = 1 << 17;

/// Divide configuration encodings.
#[allow(dead_code)]
pub mod lapic_div {
    pub const DIV_1: u64 = 0b1011;
    pub const DIV_2: u64 = 0b0000;
    pub const DIV_4: u64 = 0b0001;
    pub const DIV_8: u64 = 0b0010;
    pub const DIV_16: u64 = 0b0011;
}

/// Timer count per period at divide-by-16. Uncalibrated; roughly a
/// millisecond under QEMU.
const TIMER_INITIAL_COUNT: u64 = 62_500;

fn has_x2apic() -> bool {
    #[allow(unused_unsafe)]
    // SAFETY: CPUID leaf 1 exists on every x86-64 CPU.
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.ecx & (1 << 21) != 0
}

/// Switch the local APIC into x2APIC mode and software-enable it.
///
/// # Panics
/// Without x2APIC support; there is no xAPIC fallback.
pub fn init() {
    assert!(has_x2apic(), "x2APIC not supported on this CPU/VM");
    // SAFETY: the MSRs below exist once x2APIC support is confirmed.
    let id = unsafe {
        let base = IA32_APIC_BASE.load_raw();
        IA32_APIC_BASE.store_raw(base | APIC_EN | APIC_EXTD);
        X2APIC_SVR.store_raw((1 << 8) | u64::from(SPURIOUS_INTERRUPT_VECTOR));
        X2APIC_ID.load_raw()
    };
    info!("x2APIC enabled; APIC ID = {id:#x}");
}

/// Arm the periodic scheduler tick.
pub fn start_timer() {
    // SAFETY: the APIC is in x2APIC mode (see `init`) and the timer gate is
    // installed.
    unsafe {
        X2APIC_LVT_TIMER.store_raw(u64::from(LAPIC_TIMER_VECTOR) | LVT_MASKED | LVT_PERIODIC);
        X2APIC_DIVCONF.store_raw(lapic_div::DIV_16);
        X2APIC_INITCNT.store_raw(TIMER_INITIAL_COUNT);
        X2APIC_LVT_TIMER.store_raw(u64::from(LAPIC_TIMER_VECTOR) | LVT_PERIODIC);
    }
    info!("LAPIC timer armed on vector {LAPIC_TIMER_VECTOR:#x}");
}

/// Signal end of interrupt.
pub fn eoi() {
    // SAFETY: writing zero to the EOI register is always valid.
    unsafe { X2APIC_EOI.store_raw(0) };
}
