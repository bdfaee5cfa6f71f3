use crate::interrupts::Idt;
use core::arch::naked_asm;

/// Spurious interrupt vector for the APIC.
pub const SPURIOUS_INTERRUPT_VECTOR: u8 = 0xFF;

const _: () = assert!(SPURIOUS_INTERRUPT_VECTOR >= 0x10);

pub trait SpuriousInterrupt {
    fn init_spurious_interrupt_gate(&mut self) -> &mut Self;
}

impl SpuriousInterrupt for Idt {
    fn init_spurious_interrupt_gate(&mut self) -> &mut Self {
        self[usize::from(SPURIOUS_INTERRUPT_VECTOR)].set_handler(spurious_stub);
        self
    }
}

/// No EOI for spurious interrupts; just return.
#[unsafe(naked)]
extern "C" fn spurious_stub() {
    naked_asm!("iretq");
}
