use bitfield_struct::bitfield;

/// Architectural RFLAGS model for x86-64.
///
/// Only the flags the kernel inspects or sets on new threads are named;
/// arithmetic status flags are kept as a raw group.
#[bitfield(u64)]
pub struct Rflags {
    /// CF.
    pub carry: bool, // 0

    /// Always 1 in 64-bit mode.
    #[bits(default = true)]
    _always1: bool, // 1

    /// PF, AF, ZF, SF and the reserved bits between them.
    #[bits(6)]
    pub status: u8, // 2-7

    /// TF.
    pub trap: bool, // 8

    /// IF: maskable interrupts enabled.
    pub interrupt_enable: bool, // 9

    /// DF.
    pub direction: bool, // 10

    /// OF.
    pub overflow: bool, // 11

    /// I/O privilege level.
    #[bits(2)]
    pub iopl: u8, // 12-13

    #[bits(50)]
    __: u64,
}

impl Rflags {
    /// Flags a freshly created thread starts with: interrupts on, IOPL 0.
    #[must_use]
    pub const fn thread_default() -> Self {
        Self::new().with_interrupt_enable(true)
    }
}
