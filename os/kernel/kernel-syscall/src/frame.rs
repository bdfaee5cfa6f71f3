use crate::{Status, SyscallNumber};

/// The registers a system call reads and writes.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
}

impl TrapFrame {
    /// Frame for calling `number` with up to four arguments.
    #[must_use]
    pub fn call(number: SyscallNumber, args: [u64; 4]) -> Self {
        Self {
            rax: number.into(),
            rdi: args[0],
            rsi: args[1],
            rdx: args[2],
            r10: args[3],
        }
    }

    #[must_use]
    pub const fn number(&self) -> u64 {
        self.rax
    }

    /// Argument `n` (0..4); anything else reads as zero.
    #[must_use]
    pub const fn arg(&self, n: usize) -> u64 {
        match n {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            _ => 0,
        }
    }

    pub const fn set_result(&mut self, status: Status, value: u64) {
        self.rax = status.0;
        self.rdx = value;
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        Status(self.rax)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.rdx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_and_results() {
        let mut tf = TrapFrame::call(SyscallNumber::MailboxReply, [1, 2, 3, 4]);
        assert_eq!(tf.number(), 8);
        assert_eq!([tf.arg(0), tf.arg(1), tf.arg(2), tf.arg(3), tf.arg(4)], [1, 2, 3, 4, 0]);
        tf.set_result(Status::ERR_REFUSED, 13);
        assert_eq!((tf.status(), tf.value()), (Status::ERR_REFUSED, 13));
    }
}
