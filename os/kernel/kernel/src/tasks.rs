//! Processes, threads and the kernel objects they talk through.
//!
//! Lock order: [`PERMITS`], then [`SCHEDULER`], then the heap, then
//! memory. [`OBJECTS`] is never held together with the scheduler.

use crate::interrupts;
use crate::memory::{self, KernelLoader};
use crate::platform::KernelPlatform;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_ipc::channel::DEFAULT_CAPACITY;
use kernel_ipc::{Blocker, Channel, Mailbox, WakeReason};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sched::{Handle, ProcessId, SchedError, Scheduler, Thread, ThreadId, ThreadState};
use kernel_sync::{IrqSpinLock, SyncOnceCell};
use kernel_syscall::{Status, SyscallContext, TrapFrame};
use log::{debug, error, info, warn};

/// Exit code of a process killed by the kernel.
pub const KILLED: i64 = -1;

static SCHEDULER: SyncOnceCell<IrqSpinLock<Scheduler<KernelPlatform>>> = SyncOnceCell::new();

/// Wake-ups that arrived before their thread blocked.
static PERMITS: IrqSpinLock<BTreeMap<ThreadId, WakeReason>> = IrqSpinLock::new(BTreeMap::new());

static OBJECTS: IrqSpinLock<Objects> = IrqSpinLock::new(Objects::new());

/// Adopt the running context as the idle thread.
pub fn init(kernel_root: PhysicalAddress, idle_stack_top: VirtualAddress) {
    let scheduler = Scheduler::new(KernelPlatform, kernel_root, idle_stack_top);
    if SCHEDULER.set(IrqSpinLock::new(scheduler)).is_err() {
        warn!("scheduler already initialized");
    }
}

/// Run `f` on the scheduler.
///
/// # Panics
/// Before [`init`].
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler<KernelPlatform>) -> R) -> R {
    let Some(scheduler) = SCHEDULER.get() else {
        panic!("scheduler used before init");
    };
    scheduler.with_lock(f)
}

/// Pick the next thread; `rsp` is the interrupted thread's saved frame.
pub fn schedule(rsp: u64) -> u64 {
    with_scheduler(|s| s.schedule(rsp))
}

/// Timer tick: reschedule, then release what finished processes left behind.
pub fn tick(rsp: u64) -> u64 {
    let (next, reclaimed) = with_scheduler(|s| {
        let next = s.tick(rsp);
        (next, s.take_reclaimed())
    });
    memory::unload_all(&reclaimed);
    next
}

/// Load `image` as a new process and connect it to every process spawned
/// before it.
///
/// Each new process gets an endpoint mailbox. Every pair of processes
/// shares one channel and holds a handle to the other's endpoint.
///
/// # Errors
/// Whatever prevented the process from being created.
pub fn spawn(name: &str, image: &[u8]) -> Result<ProcessId, SchedError> {
    let pid = with_scheduler(|s| s.create_process(name, image, None, &mut KernelLoader))?;
    let endpoint = Arc::new(Mailbox::new());

    let grants = OBJECTS.with_lock(|o| {
        let peers: Vec<(ProcessId, Arc<Mailbox>)> = o.endpoints.iter().map(|(p, m)| (*p, Arc::clone(m))).collect();
        let mut grants = Vec::with_capacity(peers.len() * 4);
        for (peer, peer_endpoint) in peers {
            let channel = Arc::new(Channel::new(DEFAULT_CAPACITY));
            grants.push((pid, o.insert(KernelObject::Mailbox(peer_endpoint))));
            grants.push((pid, o.insert(KernelObject::Channel(Arc::clone(&channel)))));
            grants.push((peer, o.insert(KernelObject::Mailbox(Arc::clone(&endpoint)))));
            grants.push((peer, o.insert(KernelObject::Channel(channel))));
        }
        o.endpoints.insert(pid, Arc::clone(&endpoint));
        grants
    });

    with_scheduler(|s| {
        for &(owner, handle) in &grants {
            match s.get_process_by_id_mut(owner) {
                Some(process) => process.handles.push(handle),
                None => debug!("{owner} is gone, handle {} dropped", handle.0),
            }
        }
    });
    info!("spawned {pid} '{name}', {} handles granted", grants.len());
    Ok(pid)
}

/// Kill the process of the current thread and pick the next thread.
///
/// # Panics
/// When the current thread belongs to the kernel.
pub fn kill_current(rsp: u64, reason: &str) -> u64 {
    let (pid, threads, next) = with_scheduler(|s| {
        let Some(process) = s.current_process() else {
            panic!("current thread has no process");
        };
        assert!(!process.is_kernel(), "kernel thread faulted: {reason}");
        let pid = process.pid;
        let threads = process.threads.clone();
        if let Err(e) = s.kill_process(pid, KILLED) {
            error!("killing {pid}: {e}");
        }
        (pid, threads, s.schedule(rsp))
    });
    error!("{pid} killed: {reason}");

    PERMITS.with_lock(|p| {
        for tid in &threads {
            p.remove(tid);
        }
    });
    let endpoint = OBJECTS.with_lock(|o| o.endpoints.remove(&pid));
    if let Some(endpoint) = endpoint {
        endpoint.close(&KernelBlocker);
    }
    next
}

/// Something a [`Handle`] can name.
#[derive(Debug, Clone)]
pub enum KernelObject {
    Channel(Arc<Channel>),
    Mailbox(Arc<Mailbox>),
}

struct Objects {
    next: u64,
    table: BTreeMap<Handle, KernelObject>,
    /// Each process' own mailbox.
    endpoints: BTreeMap<ProcessId, Arc<Mailbox>>,
}

impl Objects {
    const fn new() -> Self {
        Self {
            next: 1,
            table: BTreeMap::new(),
            endpoints: BTreeMap::new(),
        }
    }

    fn insert(&mut self, object: KernelObject) -> Handle {
        let handle = Handle(self.next);
        self.next += 1;
        self.table.insert(handle, object);
        handle
    }
}

/// Suspends threads through the scheduler.
#[derive(Debug, Default, Copy, Clone)]
pub struct KernelBlocker;

enum BlockOutcome {
    Parked(ThreadId),
    Permit(WakeReason),
}

impl Blocker for KernelBlocker {
    fn current(&self) -> ThreadId {
        with_scheduler(|s| s.current())
    }

    fn block(&self) -> WakeReason {
        let outcome = PERMITS.with_lock(|permits| {
            with_scheduler(|s| {
                let me = s.current();
                if let Some(reason) = permits.remove(&me) {
                    return BlockOutcome::Permit(reason);
                }
                match s.block_current() {
                    Ok(tid) => BlockOutcome::Parked(tid),
                    Err(e) => {
                        error!("cannot block {me}: {e}");
                        BlockOutcome::Permit(WakeReason::Failed)
                    }
                }
            })
        });
        let me = match outcome {
            BlockOutcome::Permit(reason) => return reason,
            BlockOutcome::Parked(me) => me,
        };

        interrupts::yield_now();

        let value = with_scheduler(|s| s.thread(me).map(|t| t.wake_value));
        value.and_then(WakeReason::from_value).unwrap_or(WakeReason::Failed)
    }

    fn wake(&self, tid: ThreadId, reason: WakeReason) {
        PERMITS.with_lock(|permits| {
            with_scheduler(|s| match s.thread(tid).map(Thread::state) {
                Some(ThreadState::Blocked) => {
                    if let Err(e) = s.wake(tid, reason.into_value()) {
                        warn!("waking {tid}: {e}");
                    }
                }
                Some(ThreadState::Ready | ThreadState::Running) => {
                    permits.insert(tid, reason);
                }
                Some(ThreadState::Exited) | None => {}
            });
        });
    }
}

/// The calling process as a system call sees it, with the object behind
/// the first argument already looked up.
struct CallerContext {
    pid: ProcessId,
    root: PhysicalAddress,
    handle: Handle,
    object: Option<KernelObject>,
    endpoint: Option<Arc<Mailbox>>,
}

impl CallerContext {
    fn capture(handle: Handle) -> Option<Self> {
        let (pid, root, owned) = with_scheduler(|s| {
            s.current_process()
                .map(|p| (p.pid, p.root, p.handles.contains(&handle)))
        })?;
        let (object, endpoint) = OBJECTS.with_lock(|o| {
            let object = owned.then(|| o.table.get(&handle).cloned()).flatten();
            (object, o.endpoints.get(&pid).cloned())
        });
        Some(Self {
            pid,
            root,
            handle,
            object,
            endpoint,
        })
    }
}

impl SyscallContext for CallerContext {
    type Blocker = KernelBlocker;

    fn blocker(&self) -> &Self::Blocker {
        &KernelBlocker
    }

    fn badge(&self) -> u64 {
        u64::from(self.pid.0)
    }

    fn channel(&self, handle: Handle) -> Option<&Channel> {
        match &self.object {
            Some(KernelObject::Channel(c)) if handle == self.handle => Some(c),
            _ => None,
        }
    }

    fn mailbox(&self, handle: Handle) -> Option<&Mailbox> {
        match &self.object {
            Some(KernelObject::Mailbox(m)) if handle == self.handle => Some(m),
            _ => None,
        }
    }

    fn endpoint(&self) -> Option<&Mailbox> {
        self.endpoint.as_deref()
    }

    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Status> {
        memory::copy_from_user(self.root, addr, buf).ok_or(Status::ERR_INVALID_ARG)
    }

    fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), Status> {
        memory::copy_to_user(self.root, addr, data).ok_or(Status::ERR_INVALID_ARG)
    }
}

/// Run the system call in `frame` for the current thread.
pub fn syscall(frame: &mut TrapFrame) {
    let Some(ctx) = CallerContext::capture(Handle(frame.rdi)) else {
        frame.set_result(Status::ERR_NOT_FOUND, 0);
        return;
    };
    kernel_syscall::dispatch(&ctx, frame);
}
