//! Message passing with synchronous calls.
//!
//! ```text
//!  caller                    mailbox                       receiver
//!    │ call(msg) ──────► pending[tag] = caller
//!    │ (blocked)          queue / hand-off ──────────────► receive()
//!    │                                                        │
//!    │                    replies[tag] ◄──── drop(Replyer) ◄── reply(tag)
//!    ◄──────────── woken, takes replies[tag]
//! ```
//!
//! Every outstanding call owns exactly one reply tag, from `call` until the
//! caller collects its outcome. Tags count up, wrap, skip zero (the tag of
//! plain sends) and skip tags still in use.

use crate::message::Message;
use crate::{Blocker, WakeReason};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use kernel_sched::{ThreadId, WaitQueue};
use kernel_sync::IrqSpinLock;
use log::{debug, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox closed")]
    Closed,
    #[error("no message waiting")]
    WouldBlock,
    #[error("no call is waiting for reply tag {0}")]
    UnknownTag(u16),
    #[error("every reply tag is in use")]
    TagsExhausted,
    #[error("the call was dropped without a reply")]
    NoReply,
    #[error("the receiver answered with error {0}")]
    Refused(u64),
}

#[derive(Debug)]
struct Pending {
    caller: ThreadId,
    message: Message,
}

#[derive(Debug)]
struct State {
    closed: bool,
    next_tag: u16,
    messages: VecDeque<Message>,
    receivers: WaitQueue,
    /// Messages given straight to a parked receiver.
    handoff: BTreeMap<ThreadId, Message>,
    /// Calls not yet taken by [`Mailbox::reply`].
    pending: BTreeMap<u16, Pending>,
    /// Finished calls whose caller has not resumed yet.
    replies: BTreeMap<u16, Result<Message, MailboxError>>,
}

impl State {
    const fn new() -> Self {
        Self {
            closed: false,
            next_tag: 1,
            messages: VecDeque::new(),
            receivers: WaitQueue::new(),
            handoff: BTreeMap::new(),
            pending: BTreeMap::new(),
            replies: BTreeMap::new(),
        }
    }

    fn allocate_tag(&mut self) -> Result<u16, MailboxError> {
        for _ in 0..=u16::MAX {
            let tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1);
            if tag != 0 && !self.pending.contains_key(&tag) && !self.replies.contains_key(&tag) {
                return Ok(tag);
            }
        }
        Err(MailboxError::TagsExhausted)
    }

    /// Give `msg` to the oldest parked receiver, or queue it.
    fn deliver(&mut self, msg: Message) -> Option<ThreadId> {
        if let Some(tid) = self.receivers.pop() {
            self.handoff.insert(tid, msg);
            return Some(tid);
        }
        self.messages.push_back(msg);
        None
    }
}

#[derive(Debug)]
pub struct Mailbox {
    state: IrqSpinLock<State>,
}

impl Mailbox {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: IrqSpinLock::new(State::new()),
        }
    }

    /// Deliver `msg` without waiting for an answer.
    ///
    /// # Errors
    /// [`MailboxError::Closed`].
    pub fn send<B: Blocker + ?Sized>(&self, blocker: &B, mut msg: Message) -> Result<(), MailboxError> {
        msg.reply_tag = 0;
        let receiver = self.state.with_lock(|s| {
            if s.closed {
                return Err(MailboxError::Closed);
            }
            Ok(s.deliver(msg))
        })?;
        if let Some(tid) = receiver {
            blocker.wake(tid, WakeReason::Message);
        }
        Ok(())
    }

    /// Deliver `msg` and wait for the answer, which replaces `msg`.
    ///
    /// # Errors
    /// - [`MailboxError::Closed`], also when closed while waiting.
    /// - [`MailboxError::NoReply`] or [`MailboxError::Refused`] when the
    ///   receiver did not answer properly.
    /// - [`MailboxError::TagsExhausted`].
    pub fn call<B: Blocker + ?Sized>(&self, blocker: &B, msg: &mut Message) -> Result<(), MailboxError> {
        let caller = blocker.current();
        let (tag, receiver) = self.state.with_lock(|s| {
            if s.closed {
                return Err(MailboxError::Closed);
            }
            let tag = s.allocate_tag()?;
            msg.reply_tag = tag;
            s.pending.insert(
                tag,
                Pending {
                    caller,
                    message: *msg,
                },
            );
            Ok((tag, s.deliver(*msg)))
        })?;
        if let Some(tid) = receiver {
            blocker.wake(tid, WakeReason::Message);
        }

        let reason = blocker.block();
        let outcome = self.state.with_lock(|s| match s.replies.remove(&tag) {
            Some(outcome) => Some(outcome),
            // Woken by something else than the reply path.
            None => s.pending.remove(&tag).map(|_| Err(MailboxError::Closed)),
        });
        match outcome {
            Some(Ok(reply)) => {
                *msg = reply;
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                warn!("call with tag {tag} woke with {reason:?} but has no outcome");
                Err(MailboxError::NoReply)
            }
        }
    }

    /// Take the oldest message. With nothing queued, either park until one
    /// arrives (`block`) or fail with [`MailboxError::WouldBlock`].
    ///
    /// # Errors
    /// [`MailboxError::Closed`], also when closed while waiting, or
    /// [`MailboxError::WouldBlock`].
    pub fn receive<B: Blocker + ?Sized>(&self, blocker: &B, block: bool) -> Result<Message, MailboxError> {
        let me = blocker.current();
        let queued = self.state.with_lock(|s| {
            if s.closed {
                return Err(MailboxError::Closed);
            }
            if let Some(msg) = s.messages.pop_front() {
                return Ok(Some(msg));
            }
            if !block {
                return Err(MailboxError::WouldBlock);
            }
            s.receivers.push(me);
            Ok(None)
        })?;
        if let Some(msg) = queued {
            return Ok(msg);
        }

        loop {
            let reason = blocker.block();
            let outcome = self.state.with_lock(|s| {
                if let Some(msg) = s.handoff.remove(&me) {
                    return Some(Ok(msg));
                }
                if s.closed {
                    s.receivers.remove(me);
                    return Some(Err(MailboxError::Closed));
                }
                // Woken for something else; stay parked.
                if !s.receivers.contains(me) {
                    if let Some(msg) = s.messages.pop_front() {
                        return Some(Ok(msg));
                    }
                    s.receivers.push(me);
                }
                None
            });
            match outcome {
                Some(result) => return result,
                None => trace!("receiver {me:?} woke ({reason:?}) with nothing handed over"),
            }
        }
    }

    /// Claim the call waiting under `tag`. The caller resumes when the
    /// returned [`Replyer`] is dropped.
    ///
    /// # Errors
    /// [`MailboxError::UnknownTag`] when no call is waiting under `tag`,
    /// including a tag that was already answered.
    pub fn reply<'a, B: Blocker + ?Sized>(
        &'a self,
        blocker: &'a B,
        tag: u16,
    ) -> Result<Replyer<'a, B>, MailboxError> {
        let pending = self
            .state
            .with_lock(|s| s.pending.remove(&tag))
            .ok_or(MailboxError::UnknownTag(tag))?;
        Ok(Replyer {
            mailbox: self,
            blocker,
            tag,
            caller: pending.caller,
            message: pending.message,
            answered: false,
            error: None,
        })
    }

    /// Close for good: queued messages are dropped, parked receivers and
    /// waiting callers wake with [`MailboxError::Closed`]. Returns how many
    /// threads were woken; a second close does nothing.
    pub fn close<B: Blocker + ?Sized>(&self, blocker: &B) -> usize {
        let waiters: Vec<ThreadId> = self.state.with_lock(|s| {
            if s.closed {
                return Vec::new();
            }
            s.closed = true;
            s.messages.clear();
            let mut waiters: Vec<ThreadId> = s.receivers.drain().collect();
            for (tag, pending) in core::mem::take(&mut s.pending) {
                s.replies.insert(tag, Err(MailboxError::Closed));
                waiters.push(pending.caller);
            }
            waiters
        });
        for &tid in &waiters {
            blocker.wake(tid, WakeReason::Closed);
        }
        debug!("mailbox closed, {} waiters woken", waiters.len());
        waiters.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.with_lock(|s| s.closed)
    }

    /// Messages queued for receivers.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.with_lock(|s| s.messages.len())
    }

    /// Calls not yet claimed by [`reply`](Self::reply).
    #[must_use]
    pub fn outstanding_calls(&self) -> usize {
        self.state.with_lock(|s| s.pending.len())
    }

    /// Receivers parked in [`receive`](Self::receive).
    #[must_use]
    pub fn waiting_receivers(&self) -> usize {
        self.state.with_lock(|s| s.receivers.len())
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Answer to one call; delivered and the caller woken on drop.
///
/// The caller sees:
/// * the error given to [`set_error`](Self::set_error), if any;
/// * otherwise the message, if [`message_mut`](Self::message_mut) was used;
/// * otherwise [`MailboxError::NoReply`].
///
/// If the mailbox was closed in the meantime the caller sees
/// [`MailboxError::Closed`] instead.
#[must_use = "the caller resumes when the replyer is dropped"]
pub struct Replyer<'a, B: Blocker + ?Sized> {
    mailbox: &'a Mailbox,
    blocker: &'a B,
    tag: u16,
    caller: ThreadId,
    message: Message,
    answered: bool,
    error: Option<u64>,
}

impl<B: Blocker + ?Sized> Replyer<'_, B> {
    /// Whether the answer will reach the caller as an answer, that is, the
    /// mailbox is still open.
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.mailbox.is_closed()
    }

    #[must_use]
    pub const fn tag(&self) -> u16 {
        self.tag
    }

    #[must_use]
    pub const fn caller(&self) -> ThreadId {
        self.caller
    }

    /// The message as the caller sent it.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// The answer, starting out as the caller's message. Using it marks the
    /// call as answered.
    pub const fn message_mut(&mut self) -> &mut Message {
        self.answered = true;
        &mut self.message
    }

    /// Fail the call with `code`.
    pub const fn set_error(&mut self, code: u64) {
        self.error = Some(code);
    }
}

impl<B: Blocker + ?Sized> Drop for Replyer<'_, B> {
    fn drop(&mut self) {
        let tag = self.tag;
        let reason = self.mailbox.state.with_lock(|s| {
            let (outcome, reason) = if s.closed {
                (Err(MailboxError::Closed), WakeReason::Closed)
            } else if let Some(code) = self.error {
                (Err(MailboxError::Refused(code)), WakeReason::Failed)
            } else if self.answered {
                let mut reply = self.message;
                reply.reply_tag = tag;
                (Ok(reply), WakeReason::Replied)
            } else {
                (Err(MailboxError::NoReply), WakeReason::Failed)
            };
            s.replies.insert(tag, outcome);
            reason
        });
        self.blocker.wake(self.caller, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn park_call(s: &mut State, tag: u16) {
        s.pending.insert(
            tag,
            Pending {
                caller: ThreadId(u64::from(tag)),
                message: Message::new(0),
            },
        );
    }

    #[test]
    fn tags_wrap_and_skip_zero() {
        let mut s = State::new();
        assert_eq!(s.allocate_tag(), Ok(1));
        s.next_tag = u16::MAX;
        assert_eq!(s.allocate_tag(), Ok(u16::MAX));
        assert_eq!(s.allocate_tag(), Ok(1));
    }

    #[test]
    fn tags_skip_outstanding_calls() {
        let mut s = State::new();
        park_call(&mut s, 1);
        park_call(&mut s, 2);
        s.replies.insert(3, Err(MailboxError::NoReply));
        assert_eq!(s.allocate_tag(), Ok(4));

        for tag in 1..=u16::MAX {
            park_call(&mut s, tag);
        }
        assert_eq!(s.allocate_tag(), Err(MailboxError::TagsExhausted));
    }
}
