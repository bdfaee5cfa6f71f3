//! # Global Descriptor Table
//!
//! Segmentation is mostly off in long mode, but selectors still carry the
//! privilege level the CPU checks on every `iretq`, and the TSS is found
//! through a 16-byte system descriptor here.
//!
//! Index | Selector | Meaning
//! ------|----------|--------
//! 0     | 0x00     | Null
//! 1     | 0x08     | Kernel code (64-bit, DPL=0)
//! 2     | 0x10     | Kernel data (DPL=0)
//! 3     | 0x18     | User data (DPL=3), loaded as **0x1b**
//! 4     | 0x20     | User code (64-bit, DPL=3), loaded as **0x23**
//! 5/6   | 0x28     | TSS
//!
//! These values are the ones [`Selectors::STANDARD`] hands to new threads.

use crate::tss;
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use kernel_sched::Selectors;
use kernel_sync::SyncOnceCell;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_DS: u16 = 0x18 | 3;
pub const USER_CS: u16 = 0x20 | 3;
pub const TSS_SEL: u16 = 0x28;

const _: () = {
    assert!(Selectors::STANDARD.kernel_cs == KERNEL_CS);
    assert!(Selectors::STANDARD.kernel_ss == KERNEL_DS);
    assert!(Selectors::STANDARD.user_cs == USER_CS);
    assert!(Selectors::STANDARD.user_ss == USER_DS);
};

/// An 8-byte code or data descriptor. Base and limit are ignored in long
/// mode and stay zero.
#[bitfield(u64)]
pub struct SegmentDesc {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    /// `0b1010` execute/read code, `0b0010` read/write data.
    #[bits(4)]
    typ: u8,
    /// Code/data rather than system.
    s: bool,
    #[bits(2)]
    dpl: u8,
    p: bool,
    #[bits(4)]
    limit_hi: u8,
    avl: bool,
    /// 64-bit code.
    l: bool,
    /// Must be clear when `l` is set.
    db: bool,
    g: bool,
    base_hi: u8,
}

impl SegmentDesc {
    const fn code(dpl: u8) -> Self {
        Self::new()
            .with_typ(0b1010)
            .with_s(true)
            .with_dpl(dpl & 0b11)
            .with_p(true)
            .with_l(true)
    }

    const fn data(dpl: u8) -> Self {
        Self::new().with_typ(0b0010).with_s(true).with_dpl(dpl & 0b11).with_p(true)
    }
}

/// Low half of a 64-bit available TSS descriptor (type 0x9).
#[bitfield(u64)]
pub struct TssDescLow {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    #[bits(4)]
    typ: u8,
    s: bool,
    #[bits(2)]
    dpl: u8,
    p: bool,
    #[bits(4)]
    limit_hi: u8,
    avl: bool,
    #[bits(2)]
    zero: u8,
    g: bool,
    base_hi: u8,
}

/// High half: `base[63:32]`.
#[bitfield(u64)]
pub struct TssDescHigh {
    base_upper: u32,
    reserved: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct TssDesc {
    low: TssDescLow,
    high: TssDescHigh,
}

impl TssDesc {
    #[allow(clippy::cast_possible_truncation)]
    fn new(base: VirtualAddress, limit: u32) -> Self {
        let b = base.as_u64();
        let low = TssDescLow::new()
            .with_limit_lo(limit as u16)
            .with_base_lo(b as u16)
            .with_base_mid((b >> 16) as u8)
            .with_typ(0x9)
            .with_p(true)
            .with_limit_hi(((limit >> 16) & 0xF) as u8)
            .with_base_hi((b >> 24) as u8);
        let high = TssDescHigh::new().with_base_upper((b >> 32) as u32);
        Self { low, high }
    }
}

#[repr(C, align(16))]
pub struct Gdt {
    null: u64,
    kcode: SegmentDesc,
    kdata: SegmentDesc,
    udata: SegmentDesc,
    ucode: SegmentDesc,
    tss: TssDesc,
}

const _: () = assert!(size_of::<Gdt>() == 7 * 8);

impl Gdt {
    fn new(tss: TssDesc) -> Self {
        Self {
            null: 0,
            kcode: SegmentDesc::code(0),
            kdata: SegmentDesc::data(0),
            udata: SegmentDesc::data(3),
            ucode: SegmentDesc::code(3),
            tss,
        }
    }
}

/// Operand of `lgdt` and `lidt`.
#[repr(C, packed)]
pub struct DescTablePtr {
    /// Size in bytes, minus one.
    pub limit: u16,
    pub base: u64,
}

static GDT: SyncOnceCell<Gdt> = SyncOnceCell::new();

/// Build and load the GDT and the TSS, then reload every segment register.
///
/// `rsp0` is the stack interrupts from ring 3 land on until the scheduler
/// picks a thread.
#[allow(clippy::cast_possible_truncation)]
pub fn init(rsp0: VirtualAddress) {
    tss::init(rsp0);
    let gdt = GDT.get_or_init(|| {
        let (base, limit) = tss::segment();
        Gdt::new(TssDesc::new(base, limit))
    });
    let ptr = DescTablePtr {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: VirtualAddress::from_ptr(gdt).as_u64(),
    };

    // SAFETY: the table lives in a static and is never modified again; the
    // selectors below index it.
    unsafe {
        core::arch::asm!("lgdt [{}]", in(reg) &raw const ptr, options(readonly, nostack, preserves_flags));

        core::arch::asm!(
            "mov ds, {0:x}",
            "mov es, {0:x}",
            "mov ss, {0:x}",
            in(reg) KERNEL_DS,
            options(nostack, preserves_flags)
        );

        // No far jump to a 64-bit target; a far return reloads CS instead.
        core::arch::asm!(
            "push {cs}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            cs = in(reg) u64::from(KERNEL_CS),
            tmp = lateout(reg) _,
        );

        core::arch::asm!("ltr {0:x}", in(reg) TSS_SEL, options(nostack, preserves_flags));
    }
}
