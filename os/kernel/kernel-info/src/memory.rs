//! # Memory Layout

/// Size of a physical frame and of a base page.
pub const PAGE_SIZE: u64 = 4096;

/// First address above the canonical lower half.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Offset map base. Physical address `pa` is reachable at `HHDM_BASE + pa`.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the window reserved for the kernel heap.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// Upper bound for the kernel heap window.
pub const KERNEL_HEAP_MAX: u64 = 1024 * 1024 * 1024;

/// Where the kernel executes (VMA), matches the linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Size of every kernel stack, including the per-CPU idle stack.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Top of the initial user stack of a new process.
pub const USER_STACK_TOP: u64 = 0x0000_0800_0000_0000;

/// Size of the initial user stack of a new process.
pub const USER_STACK_SIZE: u64 = 0x1_0000;

/// Minimum number of zeroed page-table pages kept ready for fault handling.
pub const TABLE_CACHE_WATERMARK: usize = 16;

/// First PML4 slot of the kernel half; slots `256..512` are shared by every
/// address space.
pub const KERNEL_PML4_START: usize = 256;

/// Virtual address of physical address `pa` in the offset map.
#[inline]
#[must_use]
pub const fn phys_to_offset_map(pa: u64) -> u64 {
    HHDM_BASE + pa
}

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(USER_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_BASE.is_multiple_of(1 << 30));
    assert!(HHDM_BASE > USERSPACE_END);
    assert!(KERNEL_HEAP_BASE > HHDM_BASE);
    assert!(KERNEL_HEAP_BASE + KERNEL_HEAP_MAX <= KERNEL_BASE);
    assert!(USER_STACK_TOP < USERSPACE_END);
    assert!(TABLE_CACHE_WATERMARK > 0);
};
