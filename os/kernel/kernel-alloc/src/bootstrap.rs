//! # Memory bootstrap
//!
//! Runs once at kernel entry, with interrupts disabled:
//!
//! 1. [`ingest`] seeds the [`FrameAllocator`] from the boot memory map.
//!    Free memory goes to the free list, everything else is recorded as
//!    used with flags describing how it must be treated.
//! 2. [`build_kernel_space`] builds the kernel's own paging tree: the
//!    physical offset window, the kernel image and the modules, and
//!    identity mappings for ACPI tables.
//! 3. After the switch to the new tree, [`release_scratch`] returns the
//!    loader's page-table pages.

use crate::frame::{FrameAllocError, FrameAllocator, FrameFlags};
use crate::raw::RawFrameSource;
use kernel_info::boot::{MemoryKind, MemoryMapEntry, Module, ModuleKind, PageTableArea};
use kernel_info::memory::phys_to_offset_map;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, page_count};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, MapMode, PageEntry, PhysMapper, TableCache};
use log::{debug, info};

/// Totals gathered by [`ingest`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BootstrapReport {
    pub free_frames: u64,
    pub reserved_frames: u64,
    pub regions: usize,
}

/// How a reserved region is recorded in the used list.
#[must_use]
pub fn flags_for(kind: MemoryKind) -> FrameFlags {
    let flags = FrameFlags::new();
    match kind {
        MemoryKind::Free => flags,
        MemoryKind::Kernel | MemoryKind::Module | MemoryKind::Args | MemoryKind::Table => {
            flags.with_map_kernel(true)
        }
        MemoryKind::Acpi => flags.with_map_ident(true).with_acpi_wait(true),
        MemoryKind::Mmio => flags.with_mmio(true),
        MemoryKind::Persistent => flags.with_nonvolatile(true),
        MemoryKind::UefiRuntime => flags.with_permanent(true),
    }
}

/// Seed `fa` from the boot memory map.
///
/// Frames already handed out by `raw` are recorded as used kernel memory
/// instead of being freed. Frame 0 is never freed.
///
/// # Errors
/// Propagates [`FrameAllocError`] when the map has overlapping entries or
/// the descriptor slab runs out.
pub fn ingest(
    map: &[MemoryMapEntry],
    raw: Option<&RawFrameSource<'_>>,
    fa: &mut FrameAllocator,
) -> Result<BootstrapReport, FrameAllocError> {
    let mut report = BootstrapReport::default();

    for (index, entry) in map.iter().enumerate() {
        if entry.frame_count == 0 {
            continue;
        }
        report.regions += 1;
        debug!(
            "memory map: {} x {} {:?}",
            entry.start, entry.frame_count, entry.kind
        );

        if entry.kind != MemoryKind::Free {
            fa.mark_used(entry.start, entry.frame_count, flags_for(entry.kind))?;
            report.reserved_frames += entry.frame_count;
            continue;
        }

        if entry.start.as_u64() == 0 {
            fa.mark_used(PhysicalAddress::zero(), 1, FrameFlags::new().with_permanent(true))?;
            report.reserved_frames += 1;
        }

        let (used, rest) = match raw.and_then(|r| r.split(index)) {
            Some(split) => split,
            None => RawFrameSource::new(core::slice::from_ref(entry))
                .split(0)
                .unwrap_or_default(),
        };
        if !used.is_empty() {
            fa.mark_used(used.start, used.count, flags_for(MemoryKind::Table))?;
            report.reserved_frames += used.count;
        }
        if !rest.is_empty() {
            fa.free(rest.start, rest.count)?;
            report.free_frames += rest.count;
        }
    }

    info!(
        "physical memory: {} MiB free, {} MiB reserved in {} regions",
        (report.free_frames * PAGE_SIZE) >> 20,
        (report.reserved_frames * PAGE_SIZE) >> 20,
        report.regions
    );
    Ok(report)
}

/// Build the kernel's paging tree and return its root.
///
/// # Errors
/// [`MapError`] when tables cannot be allocated or the memory map asks for
/// overlapping mappings.
pub fn build_kernel_space<M: PhysMapper, A: FrameAlloc + ?Sized>(
    map: &[MemoryMapEntry],
    modules: &[Module],
    mapper: &M,
    cache: &mut TableCache,
    alloc: &mut A,
) -> Result<PhysicalAddress, MapError> {
    cache.refill(mapper, alloc)?;
    let space = AddressSpace::new(mapper, cache)?;
    space.populate_kernel_half(cache, alloc)?;

    let mut window = 0u64;
    let mut identity = 0u64;
    for entry in map.iter().filter(|e| e.frame_count > 0) {
        if entry.kind != MemoryKind::Mmio {
            let virt = VirtualAddress::new(phys_to_offset_map(entry.start.as_u64()));
            space.map(
                cache,
                alloc,
                virt,
                entry.start,
                entry.frame_count as usize,
                PageEntry::kernel_data(),
                MapMode::Fresh,
            )?;
            window += entry.frame_count;
        }
        if entry.kind == MemoryKind::Acpi {
            space.map(
                cache,
                alloc,
                VirtualAddress::new(entry.start.as_u64()),
                entry.start,
                entry.frame_count as usize,
                PageEntry::kernel_data(),
                MapMode::Fresh,
            )?;
            identity += entry.frame_count;
        }
    }

    let mut image = 0u64;
    for module in modules.iter().filter(|m| m.virt.as_u64() != 0) {
        let flags = match module.kind {
            ModuleKind::Kernel => PageEntry::kernel_code().with_writable(true),
            _ => PageEntry::kernel_data(),
        };
        let pages = page_count(module.length);
        space.map(
            cache,
            alloc,
            module.virt,
            module.start,
            pages as usize,
            flags,
            MapMode::Fresh,
        )?;
        image += pages;
    }

    info!(
        "kernel space at {}: {window} window pages, {image} image pages, {identity} identity pages",
        space.root()
    );
    Ok(space.root())
}

/// Return the loader's page-table pages once the kernel tree is active.
///
/// # Errors
/// [`FrameAllocError`] if the area is already free.
pub fn release_scratch(area: &PageTableArea, fa: &mut FrameAllocator) -> Result<u64, FrameAllocError> {
    if area.count == 0 {
        return Ok(0);
    }
    fa.free(area.phys, area.count)?;
    debug!("released {} loader table pages at {}", area.count, area.phys);
    Ok(area.count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::HHDM_BASE;
    use kernel_vmem::testing::{BumpAlloc, TestPhys};

    fn entry(start: u64, frames: u64, kind: MemoryKind) -> MemoryMapEntry {
        MemoryMapEntry::new(PhysicalAddress::new(start), frames, kind)
    }

    #[test]
    fn reserved_kinds_get_their_flags() {
        assert!(flags_for(MemoryKind::Kernel).map_kernel());
        assert!(flags_for(MemoryKind::Table).map_kernel());
        let acpi = flags_for(MemoryKind::Acpi);
        assert!(acpi.map_ident() && acpi.acpi_wait());
        assert!(flags_for(MemoryKind::Mmio).mmio());
        assert!(flags_for(MemoryKind::Persistent).nonvolatile());
        assert!(flags_for(MemoryKind::UefiRuntime).permanent());
    }

    #[test]
    fn ingest_frees_free_memory_and_keeps_frame_zero() {
        let map = [
            entry(0, 16, MemoryKind::Free),
            entry(0x10_0000, 32, MemoryKind::Kernel),
            entry(0x20_0000, 64, MemoryKind::Free),
            entry(0xfee0_0000, 1, MemoryKind::Mmio),
        ];
        let mut fa = FrameAllocator::new();
        let report = ingest(&map, None, &mut fa).unwrap();
        assert_eq!(report.regions, 4);
        assert_eq!(report.free_frames, 15 + 64);
        assert_eq!(report.reserved_frames, 1 + 32 + 1);
        assert_eq!(fa.free_frames(), 79);
        assert!(fa.free_iter().all(|b| b.address.as_u64() != 0));
        assert!(fa.used_iter().any(|b| b.address.as_u64() == 0 && b.flags.permanent()));
    }

    #[test]
    fn ingest_respects_raw_allocations() {
        let map = [entry(0x1000, 8, MemoryKind::Free), entry(0x10_0000, 8, MemoryKind::Free)];
        let mut raw = RawFrameSource::new(&map);
        for _ in 0..10 {
            raw.allocate_page().unwrap();
        }
        let mut fa = FrameAllocator::new();
        let report = ingest(&map, Some(&raw), &mut fa).unwrap();
        assert_eq!(report.free_frames, 6);
        assert_eq!(report.reserved_frames, 10);
        let free: Vec<_> = fa.free_iter().map(|b| (b.address.as_u64(), b.count)).collect();
        assert_eq!(free, vec![(0x10_2000, 6)]);
    }

    #[test]
    fn overlapping_map_is_an_error() {
        let map = [entry(0x1000, 8, MemoryKind::Free), entry(0x4000, 1, MemoryKind::Kernel)];
        let mut fa = FrameAllocator::new();
        assert!(matches!(
            ingest(&map, None, &mut fa),
            Err(FrameAllocError::Overlap { .. })
        ));
    }

    #[test]
    fn kernel_space_maps_window_modules_and_acpi() {
        let phys = TestPhys::new(1024);
        let mut alloc = BumpAlloc::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(1024 * 4096));
        let mut cache = TableCache::new(16);

        let map = [
            entry(0x10_0000, 4, MemoryKind::Free),
            entry(0x7fe_0000, 2, MemoryKind::Acpi),
            entry(0xfee0_0000, 1, MemoryKind::Mmio),
        ];
        let kernel_virt = VirtualAddress::new(0xffff_ffff_8000_0000);
        let modules = [Module {
            start: PhysicalAddress::new(0x40_0000),
            length: 0x2800,
            kind: ModuleKind::Kernel,
            virt: kernel_virt,
        }];

        let root = build_kernel_space(&map, &modules, &phys, &mut cache, &mut alloc).unwrap();
        let space = AddressSpace::from_root(&phys, root);

        let (pa, e) = space.translate(VirtualAddress::new(HHDM_BASE + 0x10_2000)).unwrap();
        assert_eq!(pa.as_u64(), 0x10_2000);
        assert!(e.no_execute() && e.writable() && !e.user());

        let (pa, e) = space.translate(kernel_virt + 0x2000).unwrap();
        assert_eq!(pa.as_u64(), 0x40_2000);
        assert!(!e.no_execute());

        assert!(space.translate(VirtualAddress::new(0x7fe_1000)).is_some());
        assert!(space.translate(VirtualAddress::new(HHDM_BASE + 0xfee0_0000)).is_none());
    }

    #[test]
    fn scratch_tables_are_released() {
        let mut fa = FrameAllocator::new();
        let map = [entry(0x80_0000, 4, MemoryKind::Table)];
        ingest(&map, None, &mut fa).unwrap();
        let area = PageTableArea {
            phys: PhysicalAddress::new(0x80_0000),
            virt: VirtualAddress::new(0x80_0000),
            count: 4,
            used: 3,
        };
        assert_eq!(release_scratch(&area, &mut fa).unwrap(), 4);
        assert_eq!(fa.free_frames(), 4);
        assert_eq!(fa.used_frames(), 0);
    }
}
