use crate::SchedError;
use crate::scheduler::Scheduler;
use crate::thread::ThreadId;
use alloc::collections::VecDeque;
use kernel_registers::Platform;

/// Threads parked until someone wakes them, in arrival order.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<ThreadId>,
}

impl WaitQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Block the current thread and append it. Takes effect at the next
    /// [`Scheduler::schedule`].
    ///
    /// # Errors
    /// When the current thread cannot block (it is the idle thread).
    pub fn park<P: Platform>(&mut self, sched: &mut Scheduler<P>) -> Result<ThreadId, SchedError> {
        let tid = sched.block_current()?;
        self.waiters.push_back(tid);
        Ok(tid)
    }

    /// Append a thread that the caller has blocked itself.
    pub fn push(&mut self, tid: ThreadId) {
        self.waiters.push_back(tid);
    }

    /// Take the oldest waiter without waking it.
    pub fn pop(&mut self) -> Option<ThreadId> {
        self.waiters.pop_front()
    }

    /// Wake the oldest waiter with `value`.
    ///
    /// Waiters that went away in the meantime (killed) are skipped.
    pub fn wake_one<P: Platform>(&mut self, sched: &mut Scheduler<P>, value: u64) -> Option<ThreadId> {
        while let Some(tid) = self.waiters.pop_front() {
            if sched.wake(tid, value).is_ok() {
                return Some(tid);
            }
        }
        None
    }

    /// Wake every waiter with `value`; returns how many woke.
    pub fn wake_all<P: Platform>(&mut self, sched: &mut Scheduler<P>, value: u64) -> usize {
        let mut woken = 0;
        while self.wake_one(sched, value).is_some() {
            woken += 1;
        }
        woken
    }

    /// Take the waiters out without waking them.
    pub fn drain(&mut self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.drain(..)
    }

    /// Forget `tid`; returns whether it was waiting.
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|&t| t != tid);
        before != self.waiters.len()
    }

    #[must_use]
    pub fn contains(&self, tid: ThreadId) -> bool {
        self.waiters.contains(&tid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;
    use crate::scheduler::ThreadStart;
    use crate::testing::MockPlatform;
    use crate::thread::{Priority, ThreadState};
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

    fn running_threads(n: usize) -> (Scheduler<MockPlatform>, Vec<ThreadId>) {
        let root = PhysicalAddress::new(0x1000);
        let mut s = Scheduler::new(MockPlatform::new(root), root, VirtualAddress::new(0xffff_ffff_8010_0000));
        let tids = (0..n)
            .map(|_| {
                s.create_thread(
                    ProcessId::KERNEL,
                    ThreadStart::kernel(VirtualAddress::new(0xffff_ffff_8000_2000), 0),
                    Priority::DEFAULT,
                )
                .unwrap()
            })
            .collect();
        (s, tids)
    }

    #[test]
    fn fifo_wake_order() {
        let (mut s, tids) = running_threads(3);
        let mut q = WaitQueue::new();
        for _ in 0..3 {
            s.schedule(0);
            q.park(&mut s).unwrap();
        }
        assert_eq!(q.len(), 3);
        assert_eq!(s.ready_count(), 0);

        assert_eq!(q.wake_one(&mut s, 5), Some(tids[0]));
        assert_eq!(s.thread(tids[0]).unwrap().wake_value, 5);
        assert_eq!(q.wake_all(&mut s, 6), 2);
        assert!(q.is_empty());
        assert_eq!(s.thread(tids[2]).unwrap().state(), ThreadState::Ready);
    }

    #[test]
    fn vanished_waiters_are_skipped() {
        let (mut s, tids) = running_threads(2);
        let mut q = WaitQueue::new();
        s.schedule(0);
        q.park(&mut s).unwrap();
        s.schedule(0);
        q.park(&mut s).unwrap();

        s.exit_thread(tids[0], 0).unwrap();
        assert_eq!(q.wake_one(&mut s, 1), Some(tids[1]));
        assert_eq!(q.wake_one(&mut s, 1), None);

        q.push(tids[0]);
        assert!(q.contains(tids[0]));
        assert!(q.remove(tids[0]));
        assert!(!q.remove(tids[0]));
    }
}
