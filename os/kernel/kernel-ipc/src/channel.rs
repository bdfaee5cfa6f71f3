//! One-directional byte stream.
//!
//! `enqueue`/`dequeue` never block and report partial transfers. The
//! `_blocking` variants park the caller while the buffer is full (writers)
//! or empty (readers); every transfer wakes one parked thread on the other
//! side, and closing wakes everybody.

use crate::ring_buffer::RingBuffer;
use crate::{Blocker, WakeReason};
use alloc::vec::Vec;
use kernel_sched::{ThreadId, WaitQueue};
use kernel_sync::IrqSpinLock;
use log::debug;

/// Buffer size of [`Channel::default`].
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

#[derive(Debug)]
struct State {
    buffer: RingBuffer,
    closed: bool,
    readers: WaitQueue,
    writers: WaitQueue,
}

#[derive(Debug)]
pub struct Channel {
    state: IrqSpinLock<State>,
}

impl Channel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: IrqSpinLock::new(State {
                buffer: RingBuffer::new(capacity),
                closed: false,
                readers: WaitQueue::new(),
                writers: WaitQueue::new(),
            }),
        }
    }

    /// Copy as much of `data` as fits. `Ok(0)` when the buffer is full.
    ///
    /// # Errors
    /// [`ChannelError::Closed`]; nothing is written.
    pub fn enqueue<B: Blocker + ?Sized>(&self, blocker: &B, data: &[u8]) -> Result<usize, ChannelError> {
        let (written, reader) = self.state.with_lock(|s| {
            if s.closed {
                return Err(ChannelError::Closed);
            }
            let n = s.buffer.write(data);
            Ok((n, if n > 0 { s.readers.pop() } else { None }))
        })?;
        if let Some(tid) = reader {
            blocker.wake(tid, WakeReason::Message);
        }
        Ok(written)
    }

    /// Copy out up to `buffer.len()` bytes. `Ok(0)` when nothing is
    /// buffered yet.
    ///
    /// # Errors
    /// [`ChannelError::Closed`] once the channel is closed and drained.
    pub fn dequeue<B: Blocker + ?Sized>(&self, blocker: &B, buffer: &mut [u8]) -> Result<usize, ChannelError> {
        let (read, writer) = self.state.with_lock(|s| {
            if s.buffer.is_empty() && s.closed {
                return Err(ChannelError::Closed);
            }
            let n = s.buffer.read(buffer);
            Ok((n, if n > 0 { s.writers.pop() } else { None }))
        })?;
        if let Some(tid) = writer {
            blocker.wake(tid, WakeReason::Message);
        }
        Ok(read)
    }

    /// Like [`enqueue`](Self::enqueue), but waits for room instead of
    /// returning `Ok(0)`. An empty `data` returns at once.
    ///
    /// # Errors
    /// [`ChannelError::Closed`], also when closed while waiting.
    pub fn enqueue_blocking<B: Blocker + ?Sized>(&self, blocker: &B, data: &[u8]) -> Result<usize, ChannelError> {
        loop {
            let (outcome, reader) = self.state.with_lock(|s| {
                if s.closed {
                    return (Err(ChannelError::Closed), None);
                }
                let n = s.buffer.write(data);
                if n == 0 && !data.is_empty() {
                    s.writers.push(blocker.current());
                    return (Ok(None), None);
                }
                (Ok(Some(n)), s.readers.pop())
            });
            if let Some(tid) = reader {
                blocker.wake(tid, WakeReason::Message);
            }
            match outcome? {
                Some(n) => return Ok(n),
                None => {
                    if blocker.block() == WakeReason::Closed {
                        return Err(ChannelError::Closed);
                    }
                }
            }
        }
    }

    /// Like [`dequeue`](Self::dequeue), but waits for data instead of
    /// returning `Ok(0)`. An empty `buffer` returns at once.
    ///
    /// # Errors
    /// [`ChannelError::Closed`] once the channel is closed and drained.
    pub fn dequeue_blocking<B: Blocker + ?Sized>(&self, blocker: &B, buffer: &mut [u8]) -> Result<usize, ChannelError> {
        loop {
            let (outcome, writer) = self.state.with_lock(|s| {
                let n = s.buffer.read(buffer);
                if n > 0 || buffer.is_empty() {
                    return (Ok(Some(n)), s.writers.pop());
                }
                if s.closed {
                    return (Err(ChannelError::Closed), None);
                }
                s.readers.push(blocker.current());
                (Ok(None), None)
            });
            if let Some(tid) = writer {
                blocker.wake(tid, WakeReason::Message);
            }
            match outcome? {
                Some(n) => return Ok(n),
                None => {
                    // Closed wake-ups loop once more to drain what is left.
                    let _ = blocker.block();
                }
            }
        }
    }

    /// Close for good and wake every parked reader and writer. Returns how
    /// many were woken; a second close does nothing.
    pub fn close<B: Blocker + ?Sized>(&self, blocker: &B) -> usize {
        let waiters: Vec<ThreadId> = self.state.with_lock(|s| {
            if s.closed {
                return Vec::new();
            }
            s.closed = true;
            s.readers.drain().chain(s.writers.drain()).collect()
        });
        for &tid in &waiters {
            blocker.wake(tid, WakeReason::Closed);
        }
        debug!("channel closed, {} waiters woken", waiters.len());
        waiters.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.with_lock(|s| s.closed)
    }

    /// Open with room for at least one byte.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.state.with_lock(|s| !s.closed && !s.buffer.is_full())
    }

    /// Data is buffered.
    #[must_use]
    pub fn can_recv(&self) -> bool {
        self.state.with_lock(|s| !s.buffer.is_empty())
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.with_lock(|s| s.buffer.len())
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
