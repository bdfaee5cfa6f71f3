//! # Kernel Entry Point
//!
//! The loader jumps to [`_start_kernel`] with interrupts off, on its own
//! page tables, passing a [`KernelArgs`] pointer. From there:
//!
//! 1. switch to the boot stack,
//! 2. run the pre-init and init steps (see [`init`]),
//! 3. become the idle thread: enable interrupts and halt until the next
//!    one, forever.

#![no_std]
#![no_main]
#![allow(unsafe_code)]

extern crate alloc;

mod apic;
mod gdt;
mod init;
mod interrupts;
mod memory;
mod platform;
mod tasks;
mod tss;

use core::panic::PanicInfo;
use kernel_alloc::LockedHeap;
use kernel_info::boot::KernelArgs;
use kernel_qemu::qemu_trace;
use log::error;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::new();

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();
    error!("kernel panic: {info}");
    halt_forever()
}

/// The kernel entry point.
///
/// # ABI
/// `win64`, since the loader is a UEFI (PE/COFF) application: the args
/// pointer arrives in `RCX` and is moved to `RDI` for [`kernel_entry`].
///
/// # Naked function & Stack
/// The loader's stack is not ours to keep; the boot stack is set up here
/// before any Rust code runs.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "win64" fn _start_kernel(_args: *const KernelArgs) -> ! {
    core::arch::naked_asm!(
        "cli",
        "mov r12, rcx",

        "lea rax, [rip + {stack_sym}]",
        "add rax, {stack_size}",
        "and rax, -16",
        "mov rsp, rax",
        // Emulate a CALL so that RSP % 16 == 8 at entry.
        "push 0",
        "xor rbp, rbp",

        "mov rdi, r12",
        "jmp {rust_entry}",
        stack_sym = sym init::BOOT_STACK,
        stack_size = const init::BOOT_STACK_SIZE,
        rust_entry = sym kernel_entry,
    );
}

/// Kernel entry on the boot stack.
#[unsafe(no_mangle)]
extern "C" fn kernel_entry(args: *const KernelArgs) -> ! {
    qemu_trace!("Kernel reporting to QEMU!\n");

    // SAFETY: the loader hands over a pointer to a live argument block
    // that stays mapped until the scratch tables are released, and
    // `validate` checks it before anything else is read.
    let args = unsafe { &*args };
    init::run(args);
    kernel_main()
}

/// The idle thread.
fn kernel_main() -> ! {
    loop {
        interrupts::enable_and_wait();
    }
}

fn halt_forever() -> ! {
    loop {
        // SAFETY: interrupts are off; nothing wakes us up again.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}
