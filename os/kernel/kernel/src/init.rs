//! # Kernel bring-up
//!
//! Initialization is an explicit, ordered list of [`InitStep`]s in two
//! phases:
//!
//! * **pre-init** runs on the loader's page tables and must not touch the
//!   heap: logger, boot arguments, raw frame source, kernel page tables.
//! * **init** runs on the kernel's own tables: frame allocator, table
//!   cache, heap, descriptor tables, scheduler, programs, timer.
//!
//! Every step names the steps it depends on; [`run_steps`] refuses to run a
//! step before them. A failing step is fatal.
//!
//! Everything the loader hands over (the argument block, the memory map,
//! the module list and images) is addressed through the offset window,
//! which both the loader's tables and the kernel's tables map.

use crate::memory::{self, MAPPER, MEMORY};
use crate::{HEAP, apic, gdt, interrupts, tasks};
use kernel_alloc::bootstrap;
use kernel_alloc::{FrameAllocError, HeapError, RawFrameSource};
use kernel_info::boot::{BootArgsError, KernelArgs, MemoryMapEntry, Module, ModuleKind};
use kernel_info::memory::{KERNEL_HEAP_MAX, phys_to_offset_map};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_qemu::QemuLogger;
use kernel_registers::{Cr3, StoreRegisterUnsafe};
use kernel_sched::SchedError;
use kernel_vmem::MapError;
use log::{LevelFilter, debug, info};

/// Boot stack size. The idle thread keeps running on it.
pub const BOOT_STACK_SIZE: usize = 64 * 1024;

/// 16-byte aligned stack
#[repr(align(16))]
pub struct Aligned<const N: usize>(pub [u8; N]);

#[unsafe(link_section = ".bss.boot")]
#[unsafe(no_mangle)]
pub static mut BOOT_STACK: Aligned<BOOT_STACK_SIZE> = Aligned([0; BOOT_STACK_SIZE]);

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);

/// Top of [`BOOT_STACK`].
pub fn boot_stack_top() -> VirtualAddress {
    let base = VirtualAddress::from_ptr(&raw const BOOT_STACK);
    VirtualAddress::new(base.as_u64() + BOOT_STACK_SIZE as u64)
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("a logger is already installed")]
    Logger,
    #[error("boot arguments: {0}")]
    BootArgs(#[from] BootArgsError),
    #[error("frame allocator: {0}")]
    Frames(#[from] FrameAllocError),
    #[error("page tables: {0}")]
    Map(#[from] MapError),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
    #[error("scheduler: {0}")]
    Sched(#[from] SchedError),
    #[error("{0} is not available yet")]
    Missing(&'static str),
}

/// State handed from one step to the next.
pub struct Boot<'a> {
    args: &'a KernelArgs,
    map: &'a [MemoryMapEntry],
    modules: &'a [Module],
    raw: Option<RawFrameSource<'a>>,
    root: Option<PhysicalAddress>,
}

impl<'a> Boot<'a> {
    const fn new(args: &'a KernelArgs) -> Self {
        Self {
            args,
            map: &[],
            modules: &[],
            raw: None,
            root: None,
        }
    }
}

pub struct InitStep {
    pub name: &'static str,
    pub requires: &'static [&'static str],
    pub run: fn(&mut Boot<'_>) -> Result<(), InitError>,
}

const PRE_INIT: &[InitStep] = &[
    InitStep {
        name: "logger",
        requires: &[],
        run: init_logger,
    },
    InitStep {
        name: "boot-args",
        requires: &["logger"],
        run: read_boot_args,
    },
    InitStep {
        name: "raw-frames",
        requires: &["boot-args"],
        run: open_raw_frames,
    },
    InitStep {
        name: "kernel-space",
        requires: &["raw-frames"],
        run: build_kernel_space,
    },
];

const INIT: &[InitStep] = &[
    InitStep {
        name: "frame-allocator",
        requires: &["kernel-space"],
        run: seed_frame_allocator,
    },
    InitStep {
        name: "table-cache",
        requires: &["frame-allocator"],
        run: refill_table_cache,
    },
    InitStep {
        name: "heap",
        requires: &["table-cache"],
        run: init_heap,
    },
    InitStep {
        name: "descriptor-tables",
        requires: &["heap"],
        run: load_descriptor_tables,
    },
    InitStep {
        name: "scheduler",
        requires: &["descriptor-tables"],
        run: start_scheduler,
    },
    InitStep {
        name: "programs",
        requires: &["scheduler"],
        run: spawn_programs,
    },
    InitStep {
        name: "timer",
        requires: &["scheduler"],
        run: start_timer,
    },
];

/// Most steps a boot runs, across both phases.
const MAX_STEPS: usize = 16;

/// Names of the steps that completed, in order.
struct Completed {
    names: [&'static str; MAX_STEPS],
    len: usize,
}

impl Completed {
    const fn new() -> Self {
        Self {
            names: [""; MAX_STEPS],
            len: 0,
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.names[..self.len].contains(&name)
    }

    fn push(&mut self, name: &'static str) {
        assert!(self.len < MAX_STEPS, "more than {MAX_STEPS} init steps");
        self.names[self.len] = name;
        self.len += 1;
    }
}

/// Bring the kernel up; returns as the idle thread.
pub fn run(args: &KernelArgs) {
    let mut boot = Boot::new(args);
    let mut done = Completed::new();
    run_steps("pre-init", PRE_INIT, &mut boot, &mut done);
    run_steps("init", INIT, &mut boot, &mut done);
    info!("kernel up, {} init steps", done.len);
}

fn run_steps(phase: &str, steps: &[InitStep], boot: &mut Boot<'_>, done: &mut Completed) {
    for (i, step) in steps.iter().enumerate() {
        if let Some(missing) = step.requires.iter().find(|r| !done.contains(r)) {
            panic!("{phase} step '{}' runs before '{missing}'", step.name);
        }
        if let Err(e) = (step.run)(boot) {
            panic!("{phase} step '{}' failed: {e}", step.name);
        }
        done.push(step.name);
        // The logger is the first step, so this reports it too.
        debug!("{phase} {}/{}: {} done", i + 1, steps.len(), step.name);
    }
}

fn init_logger(_: &mut Boot<'_>) -> Result<(), InitError> {
    LOGGER.init().map_err(|_| InitError::Logger)
}

fn read_boot_args(boot: &mut Boot<'_>) -> Result<(), InitError> {
    boot.args.validate()?;
    // SAFETY: validated above; the loader keeps both arrays alive in
    // `Args` memory, which is never freed.
    unsafe {
        boot.map = boot.args.memory_map();
        boot.modules = boot.args.modules();
    }
    info!(
        "{} memory map entries, {} modules, loader root {}",
        boot.map.len(),
        boot.modules.len(),
        boot.args.root_table
    );
    Ok(())
}

fn open_raw_frames(boot: &mut Boot<'_>) -> Result<(), InitError> {
    boot.raw = Some(RawFrameSource::new(boot.map));
    Ok(())
}

fn build_kernel_space(boot: &mut Boot<'_>) -> Result<(), InitError> {
    let raw = boot.raw.as_mut().ok_or(InitError::Missing("raw frame source"))?;
    let root = MEMORY.with_lock(|m| {
        bootstrap::build_kernel_space(boot.map, boot.modules, &MAPPER, &mut m.cache, raw)
    })?;
    // SAFETY: the new tree maps the kernel image, the boot stack and the
    // offset window exactly where the loader's tree had them.
    unsafe { Cr3::from_root(root).store_unsafe() };
    boot.root = Some(root);
    info!("switched to kernel page tables at {root}");
    Ok(())
}

fn seed_frame_allocator(boot: &mut Boot<'_>) -> Result<(), InitError> {
    let root = boot.root.ok_or(InitError::Missing("kernel root"))?;
    let raw = boot.raw.take();
    MEMORY.with_lock(|m| -> Result<(), InitError> {
        bootstrap::ingest(boot.map, raw.as_ref(), &mut m.frames)?;
        bootstrap::release_scratch(&boot.args.page_tables, &mut m.frames)?;
        m.root = root;
        Ok(())
    })
}

fn refill_table_cache(_: &mut Boot<'_>) -> Result<(), InitError> {
    MEMORY.with_lock(|m| m.cache.refill(&MAPPER, &mut m.frames))?;
    Ok(())
}

fn init_heap(_: &mut Boot<'_>) -> Result<(), InitError> {
    memory::RANGES.with_lock(|ranges| HEAP.init(ranges, KERNEL_HEAP_MAX, &memory::HEAP_BACKING))?;
    Ok(())
}

fn load_descriptor_tables(_: &mut Boot<'_>) -> Result<(), InitError> {
    gdt::init(boot_stack_top());
    interrupts::init();
    Ok(())
}

fn start_scheduler(boot: &mut Boot<'_>) -> Result<(), InitError> {
    let root = boot.root.ok_or(InitError::Missing("kernel root"))?;
    tasks::init(root, boot_stack_top());
    Ok(())
}

fn spawn_programs(boot: &mut Boot<'_>) -> Result<(), InitError> {
    let programs = boot.modules.iter().filter(|m| m.kind == ModuleKind::Program);
    for (i, module) in programs.enumerate() {
        let start = phys_to_offset_map(module.start.as_u64()) as *const u8;
        // SAFETY: modules live in `Module` memory, mapped through the
        // offset window and never freed.
        #[allow(clippy::cast_possible_truncation)]
        let image = unsafe { core::slice::from_raw_parts(start, module.length as usize) };
        let name = alloc::format!("program-{i}");
        tasks::spawn(&name, image)?;
    }
    Ok(())
}

fn start_timer(_: &mut Boot<'_>) -> Result<(), InitError> {
    apic::init();
    apic::start_timer();
    Ok(())
}
