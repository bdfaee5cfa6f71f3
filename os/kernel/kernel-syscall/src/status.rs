use core::fmt;
use kernel_alloc::{AddressRangeError, FrameAllocError, HeapError};
use kernel_ipc::{ChannelError, MailboxError};
use kernel_sched::SchedError;
use kernel_vmem::MapError;

/// Result of a system call as user space sees it.
///
/// The values are ABI; append new codes, never renumber.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Status(pub u64);

impl Status {
    pub const OK: Self = Self(0);
    /// The channel or mailbox is closed.
    pub const ERR_CLOSED: Self = Self(1);
    /// Unknown handle, reply tag, process or thread.
    pub const ERR_NOT_FOUND: Self = Self(2);
    pub const ERR_INVALID_ARG: Self = Self(3);
    /// Nothing to receive and the caller asked not to wait.
    pub const ERR_WOULD_BLOCK: Self = Self(4);
    pub const ERR_NO_MEMORY: Self = Self(5);
    /// A bounded resource other than memory ran out (reply tags, ranges).
    pub const ERR_INSUFFICIENT: Self = Self(6);
    /// The receiver dropped the call without answering.
    pub const ERR_NO_REPLY: Self = Self(7);
    /// The receiver refused the call; its code is returned as the value.
    pub const ERR_REFUSED: Self = Self(8);
    pub const ERR_UNKNOWN_SYSCALL: Self = Self(9);

    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == Self::OK.0
    }

    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "OK",
            Self::ERR_CLOSED => "ERR_CLOSED",
            Self::ERR_NOT_FOUND => "ERR_NOT_FOUND",
            Self::ERR_INVALID_ARG => "ERR_INVALID_ARG",
            Self::ERR_WOULD_BLOCK => "ERR_WOULD_BLOCK",
            Self::ERR_NO_MEMORY => "ERR_NO_MEMORY",
            Self::ERR_INSUFFICIENT => "ERR_INSUFFICIENT",
            Self::ERR_NO_REPLY => "ERR_NO_REPLY",
            Self::ERR_REFUSED => "ERR_REFUSED",
            Self::ERR_UNKNOWN_SYSCALL => "ERR_UNKNOWN_SYSCALL",
            _ => return None,
        })
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Status({})", self.0),
        }
    }
}

impl From<ChannelError> for Status {
    fn from(value: ChannelError) -> Self {
        match value {
            ChannelError::Closed => Self::ERR_CLOSED,
        }
    }
}

impl From<MailboxError> for Status {
    fn from(value: MailboxError) -> Self {
        match value {
            MailboxError::Closed => Self::ERR_CLOSED,
            MailboxError::WouldBlock => Self::ERR_WOULD_BLOCK,
            MailboxError::UnknownTag(_) => Self::ERR_NOT_FOUND,
            MailboxError::TagsExhausted => Self::ERR_INSUFFICIENT,
            MailboxError::NoReply => Self::ERR_NO_REPLY,
            MailboxError::Refused(_) => Self::ERR_REFUSED,
        }
    }
}

impl From<MapError> for Status {
    fn from(value: MapError) -> Self {
        match value {
            MapError::CacheEmpty | MapError::OutOfMemory => Self::ERR_NO_MEMORY,
            MapError::NonCanonical(_)
            | MapError::Unaligned(_)
            | MapError::RangeOverflow(_)
            | MapError::AlreadyMapped(_)
            | MapError::HugePage(_) => Self::ERR_INVALID_ARG,
        }
    }
}

impl From<SchedError> for Status {
    fn from(value: SchedError) -> Self {
        match value {
            SchedError::NoSuchProcess(_) | SchedError::NoSuchThread(_) => Self::ERR_NOT_FOUND,
            SchedError::AddressSpace(e) => e.into(),
            SchedError::BadTransition { .. }
            | SchedError::BadPriority(_)
            | SchedError::MissingStack
            | SchedError::Idle(_)
            | SchedError::Image(_) => Self::ERR_INVALID_ARG,
        }
    }
}

impl From<FrameAllocError> for Status {
    fn from(value: FrameAllocError) -> Self {
        match value {
            FrameAllocError::OutOfMemory { .. } | FrameAllocError::SlabExhausted => Self::ERR_NO_MEMORY,
            FrameAllocError::Unaligned(_) | FrameAllocError::Overlap { .. } => Self::ERR_INVALID_ARG,
        }
    }
}

impl From<AddressRangeError> for Status {
    fn from(value: AddressRangeError) -> Self {
        match value {
            AddressRangeError::NoSpace { .. } | AddressRangeError::TooFragmented => Self::ERR_INSUFFICIENT,
            AddressRangeError::OutOfWindow { .. }
            | AddressRangeError::NotFree { .. }
            | AddressRangeError::Overlap { .. }
            | AddressRangeError::Unaligned(_) => Self::ERR_INVALID_ARG,
        }
    }
}

impl From<HeapError> for Status {
    fn from(value: HeapError) -> Self {
        match value {
            HeapError::NotInitialized | HeapError::Exhausted { .. } => Self::ERR_NO_MEMORY,
            HeapError::Backing(e) => e.into(),
            HeapError::Range(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_sched::{ImageError, ProcessId};
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn codes_are_stable() {
        let expected = [
            (Status::OK, 0),
            (Status::ERR_CLOSED, 1),
            (Status::ERR_NOT_FOUND, 2),
            (Status::ERR_INVALID_ARG, 3),
            (Status::ERR_WOULD_BLOCK, 4),
            (Status::ERR_NO_MEMORY, 5),
            (Status::ERR_INSUFFICIENT, 6),
            (Status::ERR_NO_REPLY, 7),
            (Status::ERR_REFUSED, 8),
            (Status::ERR_UNKNOWN_SYSCALL, 9),
        ];
        for (status, raw) in expected {
            assert_eq!(status.0, raw);
            assert!(status.name().is_some());
        }
        assert_eq!(format!("{:?}", Status(77)), "Status(77)");
        assert_eq!(format!("{:?}", Status::ERR_CLOSED), "ERR_CLOSED");
    }

    #[test]
    fn nested_errors_keep_their_meaning() {
        assert_eq!(Status::from(SchedError::AddressSpace(MapError::OutOfMemory)), Status::ERR_NO_MEMORY);
        assert_eq!(Status::from(SchedError::Image(ImageError::BadMagic)), Status::ERR_INVALID_ARG);
        assert_eq!(Status::from(SchedError::NoSuchProcess(ProcessId(4))), Status::ERR_NOT_FOUND);
        assert_eq!(
            Status::from(HeapError::Backing(MapError::AlreadyMapped(VirtualAddress::new(0x1000)))),
            Status::ERR_INVALID_ARG
        );
        assert_eq!(
            Status::from(HeapError::Range(AddressRangeError::NoSpace { size: 1 })),
            Status::ERR_INSUFFICIENT
        );
        assert_eq!(Status::from(MailboxError::Refused(3)), Status::ERR_REFUSED);
        assert_eq!(Status::from(ChannelError::Closed), Status::ERR_CLOSED);
    }
}
