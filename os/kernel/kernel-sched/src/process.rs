use crate::thread::ThreadId;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The kernel itself.
    pub const KERNEL: Self = Self(0);
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Opaque capability handle held by a process.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Handle(pub u64);

/// One address space and the threads running in it.
#[derive(Debug)]
pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    /// PML4 of the process' paging tree.
    pub root: PhysicalAddress,
    pub threads: Vec<ThreadId>,
    pub handles: Vec<Handle>,
    /// Exit code of the last thread that exited.
    pub exit_code: Option<i64>,
}

impl Process {
    #[must_use]
    pub fn new(pid: ProcessId, name: &str, root: PhysicalAddress) -> Self {
        Self {
            pid,
            name: String::from(name),
            root,
            threads: Vec::new(),
            handles: Vec::new(),
            exit_code: None,
        }
    }

    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.pid.0 == ProcessId::KERNEL.0
    }
}
