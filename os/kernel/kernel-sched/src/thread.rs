use crate::SchedError;
use crate::process::ProcessId;
use alloc::boxed::Box;
use core::fmt;
use kernel_info::memory::KERNEL_STACK_SIZE;
use kernel_memory_addresses::VirtualAddress;

/// Number of run-lists.
pub const NUM_PRIORITIES: usize = 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Scheduling priority; a larger value is more urgent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Self = Self(0);
    pub const DEFAULT: Self = Self(4);
    #[allow(clippy::cast_possible_truncation)]
    pub const HIGHEST: Self = Self(NUM_PRIORITIES as u8 - 1);

    /// # Errors
    /// [`SchedError::BadPriority`] above [`Priority::HIGHEST`].
    pub const fn new(value: u8) -> Result<Self, SchedError> {
        if value as usize >= NUM_PRIORITIES {
            return Err(SchedError::BadPriority(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Exited,
}

impl ThreadState {
    /// ```text
    /// ready -> running -> ready | blocked | exited
    /// blocked -> ready | exited
    /// ```
    #[must_use]
    pub const fn can_become(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Ready, Self::Running)
                | (Self::Running, Self::Ready | Self::Blocked | Self::Exited)
                | (Self::Blocked, Self::Ready | Self::Exited)
        )
    }
}

/// Heap-allocated kernel stack; freed when the thread is reclaimed.
pub struct KernelStack(Box<[u128]>);

impl KernelStack {
    #[must_use]
    pub fn new() -> Self {
        Self(alloc::vec![0u128; KERNEL_STACK_SIZE / size_of::<u128>()].into_boxed_slice())
    }

    /// First address above the stack, 16-byte aligned.
    #[must_use]
    pub fn top(&self) -> VirtualAddress {
        let range = self.0.as_ptr_range();
        VirtualAddress::from_ptr(range.end.cast::<u8>())
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Thread {
    pub tid: ThreadId,
    pub pid: ProcessId,
    pub priority: Priority,
    state: ThreadState,
    /// Stack pointer to restore when the thread is dispatched next.
    pub saved_rsp: u64,
    /// `None` for the idle thread, which runs on the boot stack.
    pub kernel_stack: Option<KernelStack>,
    /// Set by whoever wakes the thread; read by the thread after resuming.
    pub wake_value: u64,
    pub exit_code: Option<i64>,
    /// Tick at which the thread exited.
    pub exited_at: Option<u64>,
}

impl Thread {
    #[must_use]
    pub const fn new(tid: ThreadId, pid: ProcessId, priority: Priority, saved_rsp: u64) -> Self {
        Self {
            tid,
            pid,
            priority,
            state: ThreadState::Ready,
            saved_rsp,
            kernel_stack: None,
            wake_value: 0,
            exit_code: None,
            exited_at: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ThreadState {
        self.state
    }

    /// # Errors
    /// [`SchedError::BadTransition`] for moves the state machine forbids.
    pub fn set_state(&mut self, to: ThreadState) -> Result<(), SchedError> {
        if !self.state.can_become(to) {
            return Err(SchedError::BadTransition {
                tid: self.tid,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("saved_rsp", &format_args!("{:#x}", self.saved_rsp))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        use ThreadState::{Blocked, Exited, Ready, Running};
        let all = [Ready, Running, Blocked, Exited];
        let allowed = [
            (Ready, Running),
            (Running, Ready),
            (Running, Blocked),
            (Running, Exited),
            (Blocked, Ready),
            (Blocked, Exited),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_become(to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn set_state_reports_bad_transition() {
        let mut t = Thread::new(ThreadId(3), ProcessId(1), Priority::DEFAULT, 0);
        assert_eq!(
            t.set_state(ThreadState::Blocked),
            Err(SchedError::BadTransition {
                tid: ThreadId(3),
                from: ThreadState::Ready,
                to: ThreadState::Blocked
            })
        );
        t.set_state(ThreadState::Running).unwrap();
        t.set_state(ThreadState::Exited).unwrap();
        assert!(t.set_state(ThreadState::Ready).is_err());
    }

    #[test]
    fn priority_bounds() {
        assert_eq!(Priority::new(7).unwrap(), Priority::HIGHEST);
        assert_eq!(Priority::new(8), Err(SchedError::BadPriority(8)));
        assert_eq!(Priority::default().get(), 4);
    }

    #[test]
    fn kernel_stack_top_is_aligned() {
        let stack = KernelStack::new();
        assert_eq!(stack.top().as_u64() % 16, 0);
    }
}
