//! The dispatcher.

use crate::SchedError;
use crate::image::ProgramImage;
use crate::loader::ProcessLoader;
use crate::process::{Process, ProcessId};
use crate::thread::{KernelStack, NUM_PRIORITIES, Priority, Thread, ThreadId, ThreadState};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::{InterruptFrame, Platform};
use log::{debug, info, trace, warn};

/// Exited threads are reclaimed every this many ticks.
pub const PRUNE_INTERVAL_TICKS: u64 = 16;

/// GDT selectors loaded into a new thread's frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Selectors {
    pub kernel_cs: u16,
    pub kernel_ss: u16,
    pub user_cs: u16,
    pub user_ss: u16,
}

impl Selectors {
    /// Kernel code/data at GDT 1/2, user data/code at 3/4 (RPL 3), the
    /// order `sysret` expects.
    pub const STANDARD: Self = Self {
        kernel_cs: 0x08,
        kernel_ss: 0x10,
        user_cs: 0x20 | 3,
        user_ss: 0x18 | 3,
    };
}

/// Initial register state of a new thread.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ThreadStart {
    pub entry: VirtualAddress,
    /// Ring-3 stack pointer. Kernel threads run on their kernel stack and
    /// leave this `None`.
    pub user_stack: Option<VirtualAddress>,
    /// Passed in `rdi`.
    pub arg: u64,
}

impl ThreadStart {
    #[must_use]
    pub const fn kernel(entry: VirtualAddress, arg: u64) -> Self {
        Self {
            entry,
            user_stack: None,
            arg,
        }
    }

    #[must_use]
    pub const fn user(entry: VirtualAddress, user_stack: VirtualAddress, arg: u64) -> Self {
        Self {
            entry,
            user_stack: Some(user_stack),
            arg,
        }
    }
}

/// Per-CPU scheduler.
pub struct Scheduler<P: Platform> {
    platform: P,
    selectors: Selectors,
    processes: BTreeMap<ProcessId, Process>,
    threads: BTreeMap<ThreadId, Thread>,
    ready: [VecDeque<ThreadId>; NUM_PRIORITIES],
    blocked: Vec<ThreadId>,
    exited: Vec<ThreadId>,
    idle: ThreadId,
    idle_stack_top: VirtualAddress,
    current: ThreadId,
    next_pid: u32,
    next_tid: u64,
    ticks: u64,
    /// Roots of finished processes, for the caller to tear down.
    reclaimed: Vec<PhysicalAddress>,
}

impl<P: Platform> Scheduler<P> {
    /// Create the kernel process and adopt the calling context as its idle
    /// thread, running on the stack that ends at `idle_stack_top`.
    pub fn new(platform: P, kernel_root: PhysicalAddress, idle_stack_top: VirtualAddress) -> Self {
        let idle = ThreadId(0);
        let mut kernel = Process::new(ProcessId::KERNEL, "kernel", kernel_root);
        kernel.threads.push(idle);

        let mut thread = Thread::new(idle, ProcessId::KERNEL, Priority::LOWEST, idle_stack_top.as_u64());
        // The caller is executing right now.
        let _ = thread.set_state(ThreadState::Running);

        let mut processes = BTreeMap::new();
        processes.insert(ProcessId::KERNEL, kernel);
        let mut threads = BTreeMap::new();
        threads.insert(idle, thread);

        Self {
            platform,
            selectors: Selectors::STANDARD,
            processes,
            threads,
            ready: Default::default(),
            blocked: Vec::new(),
            exited: Vec::new(),
            idle,
            idle_stack_top,
            current: idle,
            next_pid: 1,
            next_tid: 1,
            ticks: 0,
            reclaimed: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_selectors(mut self, selectors: Selectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// Validate `image`, load it and queue its first thread.
    ///
    /// # Errors
    /// - [`SchedError::Image`] for a malformed image.
    /// - Whatever `loader` reports; nothing is left behind in that case.
    pub fn create_process<L: ProcessLoader + ?Sized>(
        &mut self,
        name: &str,
        image: &[u8],
        priority: Option<Priority>,
        loader: &mut L,
    ) -> Result<ProcessId, SchedError> {
        let image = ProgramImage::parse(image)?;
        let loaded = loader.load(&image)?;

        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        self.processes.insert(pid, Process::new(pid, name, loaded.root));

        let start = ThreadStart::user(loaded.entry, loaded.user_stack_top, 0);
        match self.create_thread(pid, start, priority.unwrap_or_default()) {
            Ok(tid) => {
                info!("process {pid} '{name}' created, root {}, entry {}, thread {tid}", loaded.root, loaded.entry);
                Ok(pid)
            }
            Err(e) => {
                self.processes.remove(&pid);
                loader.unload(loaded.root);
                Err(e)
            }
        }
    }

    /// Add a thread to an existing process and queue it.
    ///
    /// # Errors
    /// - [`SchedError::NoSuchProcess`].
    /// - [`SchedError::MissingStack`] for a user thread without a stack.
    pub fn create_thread(
        &mut self,
        pid: ProcessId,
        start: ThreadStart,
        priority: Priority,
    ) -> Result<ThreadId, SchedError> {
        let process = self.processes.get_mut(&pid).ok_or(SchedError::NoSuchProcess(pid))?;

        let stack = KernelStack::new();
        let frame = if process.is_kernel() {
            InterruptFrame::new_thread(
                start.entry.as_u64(),
                stack.top().as_u64(),
                self.selectors.kernel_cs,
                self.selectors.kernel_ss,
                start.arg,
            )
        } else {
            let rsp = start.user_stack.ok_or(SchedError::MissingStack)?;
            InterruptFrame::new_thread(
                start.entry.as_u64(),
                rsp.as_u64(),
                self.selectors.user_cs,
                self.selectors.user_ss,
                start.arg,
            )
        };
        // SAFETY: the stack is fresh and owned by the thread created below.
        let saved_rsp = unsafe { self.platform.push_frame(stack.top(), &frame) };

        let tid = ThreadId(self.next_tid);
        self.next_tid += 1;
        let mut thread = Thread::new(tid, pid, priority, saved_rsp);
        thread.kernel_stack = Some(stack);
        self.threads.insert(tid, thread);
        process.threads.push(tid);
        self.ready[priority.index()].push_back(tid);

        debug!("thread {tid} of {pid} at {} priority {}", start.entry, priority.get());
        Ok(tid)
    }

    /// Pick the next thread and return the stack pointer to resume it from.
    ///
    /// `rsp` is where the interrupted thread's frame was saved. A thread
    /// still `Running` goes to the tail of its run-list.
    pub fn schedule(&mut self, rsp: u64) -> u64 {
        let prev = self.current;
        if let Some(t) = self.threads.get_mut(&prev) {
            t.saved_rsp = rsp;
            if t.state() == ThreadState::Running {
                let _ = t.set_state(ThreadState::Ready);
                if prev != self.idle {
                    self.ready[t.priority.index()].push_back(prev);
                }
            }
        }

        let next = self.pop_ready().unwrap_or_else(|| {
            trace!("nothing ready, idling");
            self.idle
        });
        let Some(thread) = self.threads.get_mut(&next) else {
            panic!("run-list holds unknown thread {next}");
        };
        if let Err(e) = thread.set_state(ThreadState::Running) {
            panic!("dispatching {next}: {e}");
        }
        let saved = thread.saved_rsp;
        let stack_top = thread.kernel_stack.as_ref().map_or(self.idle_stack_top, KernelStack::top);
        let pid = thread.pid;
        self.current = next;

        if let Some(process) = self.processes.get(&pid)
            && process.root != self.platform.current_root()
        {
            // SAFETY: every process root shares the kernel half we run in.
            unsafe { self.platform.switch_root(process.root) };
        }
        self.platform.set_kernel_stack(stack_top);

        if prev != next {
            trace!("switch {prev} -> {next}");
        }
        saved
    }

    /// Timer interrupt: count, prune now and then, then reschedule.
    pub fn tick(&mut self, rsp: u64) -> u64 {
        self.ticks += 1;
        if self.ticks.is_multiple_of(PRUNE_INTERVAL_TICKS) {
            self.prune(self.ticks);
        }
        self.schedule(rsp)
    }

    fn pop_ready(&mut self) -> Option<ThreadId> {
        self.ready.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    /// Move the current thread to the blocked list. It keeps executing until
    /// the next [`schedule`](Self::schedule).
    ///
    /// # Errors
    /// [`SchedError::Idle`]: the idle thread never blocks.
    pub fn block_current(&mut self) -> Result<ThreadId, SchedError> {
        let tid = self.current;
        if tid == self.idle {
            return Err(SchedError::Idle("blocked"));
        }
        self.thread_mut(tid)?.set_state(ThreadState::Blocked)?;
        self.blocked.push(tid);
        Ok(tid)
    }

    /// Make a blocked thread ready, handing it `value`.
    ///
    /// # Errors
    /// [`SchedError::NoSuchThread`], or [`SchedError::BadTransition`] when
    /// the thread is not blocked.
    pub fn wake(&mut self, tid: ThreadId, value: u64) -> Result<(), SchedError> {
        let thread = self.threads.get_mut(&tid).ok_or(SchedError::NoSuchThread(tid))?;
        if thread.state() != ThreadState::Blocked {
            return Err(SchedError::BadTransition {
                tid,
                from: thread.state(),
                to: ThreadState::Ready,
            });
        }
        thread.set_state(ThreadState::Ready)?;
        thread.wake_value = value;
        let priority = thread.priority;
        self.blocked.retain(|&t| t != tid);
        self.ready[priority.index()].push_back(tid);
        Ok(())
    }

    /// End a running or blocked thread. Its resources go at the next
    /// [`prune`](Self::prune) once it is no longer current.
    ///
    /// # Errors
    /// [`SchedError::Idle`], [`SchedError::NoSuchThread`], or
    /// [`SchedError::BadTransition`] for a thread that is ready or gone.
    pub fn exit_thread(&mut self, tid: ThreadId, code: i64) -> Result<(), SchedError> {
        if tid == self.idle {
            return Err(SchedError::Idle("exited"));
        }
        let now = self.ticks;
        let thread = self.thread_mut(tid)?;
        thread.set_state(ThreadState::Exited)?;
        thread.exit_code = Some(code);
        thread.exited_at = Some(now);
        let pid = thread.pid;

        self.blocked.retain(|&t| t != tid);
        self.exited.push(tid);
        if let Some(process) = self.processes.get_mut(&pid) {
            process.exit_code = Some(code);
        }
        debug!("thread {tid} of {pid} exited with {code}");
        Ok(())
    }

    /// End every thread of `pid`.
    ///
    /// Ready threads are not executing anywhere and are dropped at once; the
    /// others take the [`exit_thread`](Self::exit_thread) path. Returns the
    /// number of threads ended.
    ///
    /// # Errors
    /// [`SchedError::NoSuchProcess`]; the kernel process cannot be killed
    /// either.
    pub fn kill_process(&mut self, pid: ProcessId, code: i64) -> Result<usize, SchedError> {
        if pid == ProcessId::KERNEL {
            return Err(SchedError::NoSuchProcess(pid));
        }
        let threads = self
            .processes
            .get(&pid)
            .ok_or(SchedError::NoSuchProcess(pid))?
            .threads
            .clone();

        let mut ended = 0;
        for tid in threads {
            match self.threads.get(&tid).map(Thread::state) {
                Some(ThreadState::Ready) => {
                    for list in &mut self.ready {
                        list.retain(|&t| t != tid);
                    }
                    self.reap(tid);
                    ended += 1;
                }
                Some(ThreadState::Running | ThreadState::Blocked) => {
                    self.exit_thread(tid, code)?;
                    ended += 1;
                }
                Some(ThreadState::Exited) | None => {}
            }
        }
        if let Some(process) = self.processes.get_mut(&pid) {
            process.exit_code = Some(code);
        }
        info!("process {pid} killed, {ended} threads ended");
        Ok(ended)
    }

    /// Reclaim threads that exited before `now`, except the current one,
    /// and every process left without threads. Returns the number of
    /// threads reclaimed.
    pub fn prune(&mut self, now: u64) -> usize {
        let current = self.current;
        let threads = &self.threads;
        let (reap, keep): (Vec<ThreadId>, Vec<ThreadId>) = self.exited.iter().partition(|&&tid| {
            tid != current
                && threads
                    .get(&tid)
                    .and_then(|t| t.exited_at)
                    .is_none_or(|at| at < now)
        });
        self.exited = keep;
        for &tid in &reap {
            self.reap(tid);
        }
        if !reap.is_empty() {
            debug!("pruned {} threads", reap.len());
        }
        reap.len()
    }

    /// Drop a thread that is not executing; retire its process with it if
    /// it was the last one.
    fn reap(&mut self, tid: ThreadId) {
        let Some(thread) = self.threads.remove(&tid) else {
            return;
        };
        let pid = thread.pid;
        let Some(process) = self.processes.get_mut(&pid) else {
            warn!("thread {tid} belonged to missing process {pid}");
            return;
        };
        process.threads.retain(|&t| t != tid);
        if process.threads.is_empty()
            && !process.is_kernel()
            && let Some(process) = self.processes.remove(&pid)
        {
            info!(
                "process {pid} '{}' finished, exit code {:?}",
                process.name, process.exit_code
            );
            self.reclaimed.push(process.root);
        }
    }

    /// Roots of processes that finished since the last call. The caller
    /// tears them down with [`ProcessLoader::unload`].
    pub fn take_reclaimed(&mut self) -> Vec<PhysicalAddress> {
        core::mem::take(&mut self.reclaimed)
    }

    #[must_use]
    pub fn get_process_by_id(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_process_by_id_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    #[must_use]
    pub const fn current(&self) -> ThreadId {
        self.current
    }

    #[must_use]
    pub fn current_process(&self) -> Option<&Process> {
        self.threads
            .get(&self.current)
            .and_then(|t| self.processes.get(&t.pid))
    }

    #[must_use]
    pub const fn idle(&self) -> ThreadId {
        self.idle
    }

    #[must_use]
    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut Thread, SchedError> {
        self.threads.get_mut(&tid).ok_or(SchedError::NoSuchThread(tid))
    }

    /// Threads waiting in run-lists.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }

    #[must_use]
    pub const fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    #[must_use]
    pub const fn exited_count(&self) -> usize {
        self.exited.len()
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadedProcess;
    use crate::testing::{ElfBuilder, MockPlatform};

    const KERNEL_ROOT: PhysicalAddress = PhysicalAddress::new(0x1000);
    const IDLE_TOP: VirtualAddress = VirtualAddress::new(0xffff_ffff_8010_0000);

    /// Hands out consecutive fake roots.
    #[derive(Default)]
    struct FakeLoader {
        next: u64,
        unloaded: Vec<PhysicalAddress>,
        fail: bool,
    }

    impl ProcessLoader for FakeLoader {
        fn load(&mut self, image: &ProgramImage<'_>) -> Result<LoadedProcess, SchedError> {
            if self.fail {
                return Err(SchedError::AddressSpace(kernel_vmem::MapError::OutOfMemory));
            }
            self.next += 1;
            Ok(LoadedProcess {
                root: PhysicalAddress::new(0x10_0000 + self.next * 0x1000),
                entry: image.entry(),
                user_stack_top: VirtualAddress::new(0x7000_0000),
            })
        }

        fn unload(&mut self, root: PhysicalAddress) {
            self.unloaded.push(root);
        }
    }

    fn sched() -> Scheduler<MockPlatform> {
        Scheduler::new(MockPlatform::new(KERNEL_ROOT), KERNEL_ROOT, IDLE_TOP)
    }

    fn kernel_thread(s: &mut Scheduler<MockPlatform>, priority: u8) -> ThreadId {
        s.create_thread(
            ProcessId::KERNEL,
            ThreadStart::kernel(VirtualAddress::new(0xffff_ffff_8000_1000), 0),
            Priority::new(priority).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn idles_with_nothing_ready() {
        let mut s = sched();
        assert_eq!(s.current(), s.idle());
        assert_eq!(s.schedule(0x1234), 0x1234);
        assert_eq!(s.current(), s.idle());
        assert_eq!(*s.platform().kernel_stack.borrow(), Some(IDLE_TOP));
        assert!(s.platform().switches.borrow().is_empty());
    }

    #[test]
    fn priorities_then_round_robin() {
        let mut s = sched();
        let a = kernel_thread(&mut s, 0);
        let b = kernel_thread(&mut s, 0);
        let c = kernel_thread(&mut s, 1);

        let mut order = Vec::new();
        for _ in 0..3 {
            s.schedule(0);
            order.push(s.current());
        }
        // c never blocks, so it keeps the CPU
        assert_eq!(order, [c, c, c]);

        s.block_current().unwrap();
        let mut order = Vec::new();
        for _ in 0..4 {
            s.schedule(0);
            order.push(s.current());
        }
        assert_eq!(order, [a, b, a, b]);

        s.wake(c, 0).unwrap();
        s.schedule(0);
        assert_eq!(s.current(), c);
    }

    #[test]
    fn saved_rsp_round_trips() {
        let mut s = sched();
        let t = kernel_thread(&mut s, 3);
        let first = s.thread(t).unwrap().saved_rsp;
        assert_eq!(s.schedule(0xaaaa), first);
        assert_eq!(s.thread(s.idle()).unwrap().saved_rsp, 0xaaaa);

        s.block_current().unwrap();
        assert_eq!(s.schedule(0xbbbb), 0xaaaa);
        assert_eq!(s.thread(t).unwrap().saved_rsp, 0xbbbb);
    }

    #[test]
    fn new_thread_frame_uses_its_kernel_stack() {
        let mut s = sched();
        let t = kernel_thread(&mut s, 2);
        let top = s.thread(t).unwrap().kernel_stack.as_ref().unwrap().top();
        let frames = s.platform().frames.borrow();
        let (stack_top, frame) = frames[0];
        assert_eq!(stack_top, top);
        assert_eq!(frame.cs, 0x08);
        assert_eq!(frame.rsp, top.as_u64());
        assert!(s.thread(t).unwrap().saved_rsp < top.as_u64());
    }

    #[test]
    fn process_switch_changes_root() {
        let mut s = sched();
        let mut loader = FakeLoader::default();
        let image = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        let pid = s.create_process("init", &image, None, &mut loader).unwrap();
        let root = s.get_process_by_id(pid).unwrap().root;
        let tid = s.get_process_by_id(pid).unwrap().threads[0];
        assert_eq!(s.thread(tid).unwrap().priority, Priority::DEFAULT);

        let (_, frame) = s.platform().frames.borrow()[0];
        assert_eq!(frame.rip, 0x40_0000);
        assert_eq!(frame.rsp, 0x7000_0000);
        assert!(frame.from_user());

        s.schedule(0);
        assert_eq!(s.current(), tid);
        assert_eq!(s.platform().switches.borrow().as_slice(), &[root]);

        // Staying in the same process does not reload CR3.
        s.schedule(0);
        assert_eq!(s.platform().switches.borrow().len(), 1);

        s.block_current().unwrap();
        s.schedule(0);
        assert_eq!(s.platform().switches.borrow().as_slice(), &[root, KERNEL_ROOT]);
    }

    #[test]
    fn bad_image_is_reported() {
        let mut s = sched();
        let mut loader = FakeLoader::default();
        assert!(matches!(
            s.create_process("junk", &[0u8; 16], None, &mut loader),
            Err(SchedError::Image(crate::ImageError::TooShort))
        ));
        loader.fail = true;
        let image = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        assert!(matches!(
            s.create_process("oom", &image, None, &mut loader),
            Err(SchedError::AddressSpace(_))
        ));
        assert_eq!(s.ready_count(), 0);
    }

    #[test]
    fn user_thread_needs_stack() {
        let mut s = sched();
        let mut loader = FakeLoader::default();
        let image = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        let pid = s.create_process("init", &image, None, &mut loader).unwrap();
        assert_eq!(
            s.create_thread(
                pid,
                ThreadStart::kernel(VirtualAddress::new(0x40_0000), 0),
                Priority::DEFAULT
            ),
            Err(SchedError::MissingStack)
        );
    }

    #[test]
    fn wake_requires_blocked() {
        let mut s = sched();
        let t = kernel_thread(&mut s, 1);
        assert!(matches!(s.wake(t, 1), Err(SchedError::BadTransition { .. })));
        assert_eq!(s.wake(ThreadId(99), 1), Err(SchedError::NoSuchThread(ThreadId(99))));
        assert_eq!(s.block_current(), Err(SchedError::Idle("blocked")));

        s.schedule(0);
        assert_eq!(s.block_current(), Ok(t));
        assert_eq!(s.blocked_count(), 1);
        s.wake(t, 42).unwrap();
        assert_eq!(s.thread(t).unwrap().wake_value, 42);
        assert_eq!(s.blocked_count(), 0);
        assert_eq!(s.ready_count(), 1);
    }

    #[test]
    fn exited_threads_are_pruned_later() {
        let mut s = sched();
        let mut loader = FakeLoader::default();
        let image = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        let pid = s.create_process("short", &image, None, &mut loader).unwrap();
        let root = s.get_process_by_id(pid).unwrap().root;

        s.schedule(0);
        let t = s.current();
        s.exit_thread(t, 7).unwrap();
        assert_eq!(s.exited_count(), 1);

        // Still current: the stack is in use.
        assert_eq!(s.prune(100), 0);
        s.schedule(0);
        assert_eq!(s.current(), s.idle());
        assert_eq!(s.prune(0), 0, "exited at tick 0, not before it");
        assert_eq!(s.prune(1), 1);

        assert!(s.thread(t).is_none());
        assert!(s.get_process_by_id(pid).is_none());
        assert_eq!(s.take_reclaimed(), [root]);
        assert!(s.take_reclaimed().is_empty());
    }

    #[test]
    fn tick_prunes_periodically() {
        let mut s = sched();
        let t = kernel_thread(&mut s, 5);
        s.schedule(0);
        s.block_current().unwrap();
        s.exit_thread(t, 0).unwrap();
        for _ in 0..PRUNE_INTERVAL_TICKS {
            s.tick(0);
        }
        assert_eq!(s.ticks(), PRUNE_INTERVAL_TICKS);
        assert!(s.thread(t).is_none());
        // The kernel process outlives its threads.
        assert!(s.get_process_by_id(ProcessId::KERNEL).is_some());
        assert!(s.take_reclaimed().is_empty());
    }

    #[test]
    fn kill_drops_ready_and_retires_blocked() {
        let mut s = sched();
        let mut loader = FakeLoader::default();
        let image = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        let pid = s.create_process("victim", &image, None, &mut loader).unwrap();
        assert_eq!(s.current_process().map(|p| p.pid), Some(ProcessId::KERNEL));

        s.schedule(0);
        let blocked = s.current();
        s.block_current().unwrap();
        let ready = s
            .create_thread(
                pid,
                ThreadStart::user(VirtualAddress::new(0x40_0000), VirtualAddress::new(0x6000_0000), 1),
                Priority::LOWEST,
            )
            .unwrap();

        assert_eq!(s.kill_process(pid, -9), Ok(2));
        assert_eq!(s.thread(blocked).unwrap().state(), ThreadState::Exited);
        assert!(s.thread(ready).is_none());
        assert_eq!(s.ready_count(), 0);
        assert_eq!(s.get_process_by_id(pid).unwrap().exit_code, Some(-9));
        assert_eq!(
            s.kill_process(ProcessId::KERNEL, 0),
            Err(SchedError::NoSuchProcess(ProcessId::KERNEL))
        );

        s.schedule(0);
        assert_eq!(s.current(), s.idle());
        assert_eq!(s.prune(1), 1);
        assert!(s.get_process_by_id(pid).is_none());
        assert_eq!(s.take_reclaimed().len(), 1);
    }
}
