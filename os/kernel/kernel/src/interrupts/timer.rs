use crate::interrupts::Idt;
use crate::{apic, memory, tasks};
use kernel_registers::InterruptFrame;

pub const LAPIC_TIMER_VECTOR: u8 = 0xE0; // 224

isr_stub!(lapic_timer_stub, LAPIC_TIMER_VECTOR);

pub trait TimerInterrupt {
    fn init_timer_gate(&mut self) -> &mut Self;
}

impl TimerInterrupt for Idt {
    fn init_timer_gate(&mut self) -> &mut Self {
        self[usize::from(LAPIC_TIMER_VECTOR)].set_handler(lapic_timer_stub);
        self
    }
}

/// Scheduler tick. Keeps the table cache topped up so faults taken with
/// the cache empty stay rare.
pub(super) fn timer(_frame: &mut InterruptFrame, rsp: u64) -> u64 {
    apic::eoi();
    memory::refill_cache();
    tasks::tick(rsp)
}
