//! The `int 0x80` system call gate and the kernel-only yield gate.

use crate::interrupts::Idt;
use crate::tasks;
use kernel_registers::InterruptFrame;
use kernel_syscall::TrapFrame;

pub use kernel_syscall::SYSCALL_VECTOR;

/// Raised by blocked kernel paths to switch away.
pub const YIELD_VECTOR: u8 = 0x81;

isr_stub!(syscall_stub, SYSCALL_VECTOR);
isr_stub!(yield_stub, YIELD_VECTOR);

pub trait SyscallInterrupt {
    fn init_syscall_gates(&mut self) -> &mut Self;
}

impl SyscallInterrupt for Idt {
    fn init_syscall_gates(&mut self) -> &mut Self {
        self[usize::from(SYSCALL_VECTOR)].set_handler(syscall_stub).dpl(3);
        self[usize::from(YIELD_VECTOR)].set_handler(yield_stub);
        self
    }
}

/// Runs with interrupts off. A call that blocks parks the thread inside
/// this handler, on its own kernel stack, until it is woken.
pub(super) fn syscall(frame: &mut InterruptFrame, rsp: u64) -> u64 {
    let mut tf = TrapFrame {
        rax: frame.rax,
        rdi: frame.rdi,
        rsi: frame.rsi,
        rdx: frame.rdx,
        r10: frame.r10,
    };
    tasks::syscall(&mut tf);
    frame.rax = tf.rax;
    frame.rdx = tf.rdx;
    rsp
}

pub(super) fn yield_cpu(_frame: &mut InterruptFrame, rsp: u64) -> u64 {
    tasks::schedule(rsp)
}
