/// Numbers user space puts into `rax`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u64)]
pub enum SyscallNumber {
    /// `(msg_ptr, block)`: receive on the calling process' own endpoint.
    EndpointReceive = 1,
    /// `(handle, ptr, len)` → bytes written.
    ChannelEnqueue = 2,
    /// `(handle, ptr, len)` → bytes read.
    ChannelDequeue = 3,
    /// `(handle)` → waiters woken.
    ChannelClose = 4,
    /// `(handle, msg_ptr)`
    MailboxSend = 5,
    /// `(handle, msg_ptr)`: the answer overwrites the message.
    MailboxCall = 6,
    /// `(handle, msg_ptr, block)`
    MailboxReceive = 7,
    /// `(handle, reply_tag, msg_ptr, error)`: a non-zero `error` refuses
    /// the call, otherwise the message at `msg_ptr` is the answer.
    MailboxReply = 8,
    /// `(handle)` → waiters woken.
    MailboxClose = 9,
}

impl SyscallNumber {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            1 => Self::EndpointReceive,
            2 => Self::ChannelEnqueue,
            3 => Self::ChannelDequeue,
            4 => Self::ChannelClose,
            5 => Self::MailboxSend,
            6 => Self::MailboxCall,
            7 => Self::MailboxReceive,
            8 => Self::MailboxReply,
            9 => Self::MailboxClose,
            _ => return None,
        })
    }
}

impl From<SyscallNumber> for u64 {
    fn from(value: SyscallNumber) -> Self {
        value as Self
    }
}
