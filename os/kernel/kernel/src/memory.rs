//! Kernel-wide memory state and the glue between its users.
//!
//! Lock order: scheduler, then heap, then [`MEMORY`]. Nothing allocates
//! from the heap while holding [`MEMORY`], so heap growth can always take
//! it.

use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_alloc::{AddressRangeManager, FrameAllocator, HeapBacking};
use kernel_info::memory::{
    KERNEL_HEAP_BASE, KERNEL_HEAP_MAX, PAGE_SIZE, TABLE_CACHE_WATERMARK, USERSPACE_END, phys_to_offset_map,
};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sched::{AddressSpaceLoader, LoadedProcess, ProcessLoader, ProgramImage, SchedError};
use kernel_sync::IrqSpinLock;
use kernel_vmem::{AddressSpace, FaultResolution, MapError, MapMode, PageEntry, TableCache};
use log::{debug, error, trace, warn};

pub static MAPPER: HhdmPhysMapper = HhdmPhysMapper;

pub struct KernelMemory {
    pub frames: FrameAllocator,
    pub cache: TableCache,
    /// Root of the kernel address space; every process shares its upper half.
    pub root: PhysicalAddress,
}

impl KernelMemory {
    const fn new() -> Self {
        Self {
            frames: FrameAllocator::new(),
            cache: TableCache::new(TABLE_CACHE_WATERMARK),
            root: PhysicalAddress::zero(),
        }
    }

    fn kernel_space(&self) -> AddressSpace<'static, HhdmPhysMapper> {
        AddressSpace::from_root(&MAPPER, self.root)
    }
}

pub static MEMORY: IrqSpinLock<KernelMemory> = IrqSpinLock::new(KernelMemory::new());

/// Virtual windows of the kernel half handed out at runtime.
pub static RANGES: IrqSpinLock<AddressRangeManager> = IrqSpinLock::new(AddressRangeManager::new(
    VirtualAddress::new(KERNEL_HEAP_BASE),
    KERNEL_HEAP_MAX,
));

/// Backs heap growth with fresh frames mapped into the kernel half.
pub struct KernelHeapBacking;

pub static HEAP_BACKING: KernelHeapBacking = KernelHeapBacking;

impl HeapBacking for KernelHeapBacking {
    fn map_pages(&self, virt: VirtualAddress, pages: u64) -> Result<(), MapError> {
        MEMORY.with_lock(|m| {
            if m.cache.is_low() {
                m.cache.refill(&MAPPER, &mut m.frames)?;
            }
            let space = m.kernel_space();
            let mut done = 0;
            while done < pages {
                #[allow(clippy::cast_possible_truncation)]
                let (frame, count) = m
                    .frames
                    .try_allocate((pages - done) as usize)
                    .map_err(|_| MapError::OutOfMemory)?;
                let at = VirtualAddress::new(virt.as_u64() + done * PAGE_SIZE);
                if let Err(e) = space.map(
                    &mut m.cache,
                    &mut m.frames,
                    at,
                    frame,
                    count,
                    PageEntry::kernel_data(),
                    MapMode::Fresh,
                ) {
                    if let Err(free) = m.frames.free(frame, count as u64) {
                        error!("returning {count} frames at {frame} failed: {free}");
                    }
                    return Err(e);
                }
                done += count as u64;
            }
            Ok(())
        })
    }
}

/// [`ProcessLoader`] over the kernel's frame allocator and table cache.
pub struct KernelLoader;

impl ProcessLoader for KernelLoader {
    fn load(&mut self, image: &ProgramImage<'_>) -> Result<LoadedProcess, SchedError> {
        MEMORY.with_lock(|m| {
            let kernel = m.kernel_space();
            AddressSpaceLoader::new(&kernel, &mut m.cache, &mut m.frames).load(image)
        })
    }

    fn unload(&mut self, root: PhysicalAddress) {
        MEMORY.with_lock(|m| {
            let kernel = m.kernel_space();
            AddressSpaceLoader::new(&kernel, &mut m.cache, &mut m.frames).unload(root);
        });
    }
}

/// Back a faulting page of the tree at `root`.
///
/// # Errors
/// [`MapError`] when the cache or the frames run dry.
pub fn resolve_fault(root: PhysicalAddress, va: VirtualAddress) -> Result<FaultResolution, MapError> {
    MEMORY.with_lock(|m| {
        let space = AddressSpace::from_root(&MAPPER, root);
        space.handle_fault(&mut m.cache, &mut m.frames, va)
    })
}

/// Timer bottom half: top up the table cache for the next faults and fold
/// touching frame blocks back together.
pub fn refill_cache() {
    MEMORY.with_lock(|m| {
        if m.cache.is_low()
            && let Err(e) = m.cache.refill(&MAPPER, &mut m.frames)
        {
            error!("table cache refill failed: {e}");
        }
        let merged = m.frames.consolidate();
        if merged > 0 {
            trace!("consolidated {merged} frame blocks");
        }
    });
}

/// How a user buffer is going to be accessed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Access {
    Read,
    Write,
}

/// Physical address behind user address `va` in the tree at `root`,
/// faulting the page in if it lies in an allowed region.
fn user_page(root: PhysicalAddress, va: VirtualAddress, access: Access) -> Option<PhysicalAddress> {
    MEMORY.with_lock(|m| {
        let space = AddressSpace::from_root(&MAPPER, root);
        if let Some((pa, entry)) = space.translate(va) {
            let writable = access == Access::Read || entry.writable();
            return (entry.user() && writable).then_some(pa);
        }
        match space.handle_fault(&mut m.cache, &mut m.frames, va) {
            Ok(FaultResolution::Resolved(frame)) => Some(frame + (va.as_u64() & (PAGE_SIZE - 1))),
            Ok(_) => None,
            Err(e) => {
                warn!("user access at {va} could not be backed: {e}");
                None
            }
        }
    })
}

/// Walk `[addr, addr + len)` page by page, handing each piece's
/// offset-window pointer and its offset into the buffer to `f`.
fn for_each_user_chunk(
    root: PhysicalAddress,
    addr: u64,
    len: usize,
    access: Access,
    mut f: impl FnMut(*mut u8, core::ops::Range<usize>),
) -> Option<()> {
    let end = addr.checked_add(len as u64)?;
    if end > USERSPACE_END {
        return None;
    }
    let mut at = addr;
    while at < end {
        let page_end = (at & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let chunk_end = end.min(page_end);
        let pa = user_page(root, VirtualAddress::new(at), access)?;
        #[allow(clippy::cast_possible_truncation)]
        let range = (at - addr) as usize..(chunk_end - addr) as usize;
        f(phys_to_offset_map(pa.as_u64()) as *mut u8, range);
        at = chunk_end;
    }
    Some(())
}

/// Copy from user memory of the tree at `root`.
pub fn copy_from_user(root: PhysicalAddress, addr: u64, buf: &mut [u8]) -> Option<()> {
    for_each_user_chunk(root, addr, buf.len(), Access::Read, |src, range| {
        let n = range.len();
        // SAFETY: `src` is mapped user memory with `n` bytes left on its page.
        unsafe { core::ptr::copy_nonoverlapping(src, buf[range].as_mut_ptr(), n) };
    })
}

/// Copy into writable user memory of the tree at `root`.
pub fn copy_to_user(root: PhysicalAddress, addr: u64, data: &[u8]) -> Option<()> {
    for_each_user_chunk(root, addr, data.len(), Access::Write, |dst, range| {
        let n = range.len();
        // SAFETY: `dst` is mapped writable user memory with `n` bytes left on its page.
        unsafe { core::ptr::copy_nonoverlapping(data[range].as_ptr(), dst, n) };
    })
}

/// Release the address spaces of finished processes.
pub fn unload_all(roots: &[PhysicalAddress]) {
    for &root in roots {
        KernelLoader.unload(root);
    }
    if !roots.is_empty() {
        debug!("released {} address spaces", roots.len());
    }
}
