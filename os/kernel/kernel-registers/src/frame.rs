use crate::Rflags;

/// Register state saved by the interrupt entry stubs.
///
/// The stubs push the general purpose registers in reverse order of this
/// struct after the vector number and error code, so the saved stack
/// pointer of an interrupted thread points at `r15`. Restoring a thread
/// means loading that pointer into `rsp`, popping the registers and
/// executing `iretq`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the CPU.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// Frame that "returns" into a new thread at `entry` with stack `rsp`.
    ///
    /// `arg` is passed in `rdi` following the System V convention.
    #[must_use]
    pub fn new_thread(entry: u64, rsp: u64, cs: u16, ss: u16, arg: u64) -> Self {
        Self {
            rip: entry,
            cs: u64::from(cs),
            rflags: Rflags::thread_default().into_bits(),
            rsp,
            ss: u64::from(ss),
            rdi: arg,
            ..Self::default()
        }
    }

    /// Whether the interrupted code ran in ring 3.
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.cs & 0b11 == 0b11
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_stub_pushes() {
        assert_eq!(size_of::<InterruptFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, rip), 17 * 8);
    }

    #[test]
    fn new_thread_frame() {
        let f = InterruptFrame::new_thread(0x40_1000, 0x7000, 0x23 | 3, 0x1b | 3, 9);
        assert!(f.from_user());
        assert_eq!(f.rflags, 0x202);
        assert_eq!(f.rdi, 9);
    }
}
