//! [`Blocker`] on host threads (`test-support` feature).

extern crate std;

use crate::{Blocker, WakeReason};
use kernel_sched::ThreadId;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct State {
    next: u64,
    ids: HashMap<thread::ThreadId, ThreadId>,
    permits: HashMap<ThreadId, WakeReason>,
    blocked: usize,
}

/// Maps each host thread to a [`ThreadId`] on first use and parks it on a
/// condition variable. Wakes that come early are kept as permits.
#[derive(Default)]
pub struct ThreadBlocker {
    state: Mutex<State>,
    cond: Condvar,
}

impl ThreadBlocker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Threads currently inside [`Blocker::block`].
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.lock().blocked
    }

    /// Spin until `n` threads are blocked.
    ///
    /// # Panics
    /// After about five seconds.
    pub fn wait_for_blocked(&self, n: usize) {
        for _ in 0..5000 {
            if self.blocked() >= n {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("{n} threads never blocked");
    }
}

impl Blocker for ThreadBlocker {
    fn current(&self) -> ThreadId {
        let mut s = self.lock();
        let next = ThreadId(s.next + 1);
        let tid = *s.ids.entry(thread::current().id()).or_insert(next);
        if tid == next {
            s.next += 1;
        }
        tid
    }

    fn block(&self) -> WakeReason {
        let me = self.current();
        let mut s = self.lock();
        s.blocked += 1;
        loop {
            if let Some(reason) = s.permits.remove(&me) {
                s.blocked -= 1;
                return reason;
            }
            s = self.cond.wait(s).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wake(&self, tid: ThreadId, reason: WakeReason) {
        self.lock().permits.insert(tid, reason);
        self.cond.notify_all();
    }
}
