//! # Kernel IPC
//!
//! Two kernel objects user space talks through:
//!
//! * [`Channel`]: one-directional byte stream over a bounded ring buffer.
//!   Writes are partial when the buffer fills up.
//! * [`Mailbox`]: message passing with synchronous calls. A call parks the
//!   caller under a reply tag until the receiver answers through a
//!   [`Replyer`].
//!
//! Both keep their state behind an [`IrqSpinLock`](kernel_sync::IrqSpinLock)
//! and never hold it while waking or blocking a thread. Thread suspension
//! goes through the [`Blocker`] seam; the kernel implements it on top of its
//! scheduler.

#![cfg_attr(not(any(test, doctest, feature = "test-support")), no_std)]

extern crate alloc;

pub mod channel;
pub mod mailbox;
pub mod message;
pub mod ring_buffer;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use channel::{Channel, ChannelError};
pub use mailbox::{Mailbox, MailboxError, Replyer};
pub use message::{MESSAGE_SIZE, Message};
pub use ring_buffer::RingBuffer;

use kernel_sched::ThreadId;

/// Why a blocked thread was woken.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u64)]
pub enum WakeReason {
    /// A message or data arrived.
    Message = 1,
    /// The call was answered.
    Replied = 2,
    /// The call ended without an answer.
    Failed = 3,
    /// The object was closed.
    Closed = 4,
}

impl WakeReason {
    /// Encoded as a thread's wake value.
    #[must_use]
    pub const fn into_value(self) -> u64 {
        self as u64
    }

    #[must_use]
    pub const fn from_value(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Message),
            2 => Some(Self::Replied),
            3 => Some(Self::Failed),
            4 => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Suspends and resumes threads on behalf of IPC objects.
///
/// A [`wake`](Self::wake) for a thread that has not reached
/// [`block`](Self::block) yet must not be lost: its next `block` returns at
/// once.
pub trait Blocker {
    /// The calling thread.
    fn current(&self) -> ThreadId;

    /// Suspend the calling thread until someone wakes it.
    fn block(&self) -> WakeReason;

    fn wake(&self, tid: ThreadId, reason: WakeReason);
}

impl<B: Blocker + ?Sized> Blocker for &B {
    fn current(&self) -> ThreadId {
        (**self).current()
    }

    fn block(&self) -> WakeReason {
        (**self).block()
    }

    fn wake(&self, tid: ThreadId, reason: WakeReason) {
        (**self).wake(tid, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_reason_values() {
        for r in [
            WakeReason::Message,
            WakeReason::Replied,
            WakeReason::Failed,
            WakeReason::Closed,
        ] {
            assert_eq!(WakeReason::from_value(r.into_value()), Some(r));
        }
        assert_eq!(WakeReason::from_value(0), None);
    }
}
