//! Building a process' address space from a [`ProgramImage`].

use crate::SchedError;
use crate::image::ProgramImage;
use kernel_info::memory::{USER_STACK_SIZE, USER_STACK_TOP};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
use kernel_vmem::{
    AddressSpace, FrameAlloc, MapError, MapMode, PageEntry, PageTableLevel, PhysMapper, TableCache,
    zero_frame,
};
use log::debug;

/// Where a freshly loaded process starts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoadedProcess {
    pub root: PhysicalAddress,
    pub entry: VirtualAddress,
    pub user_stack_top: VirtualAddress,
}

/// Creates and destroys process address spaces for the scheduler.
pub trait ProcessLoader {
    /// Build an address space holding `image`.
    ///
    /// # Errors
    /// Whatever prevented the address space from being built; nothing is
    /// leaked in that case.
    fn load(&mut self, image: &ProgramImage<'_>) -> Result<LoadedProcess, SchedError>;

    /// Release an address space built by [`load`](Self::load).
    fn unload(&mut self, root: PhysicalAddress);
}

/// [`ProcessLoader`] on top of `kernel-vmem`.
///
/// Segments are copied into fresh frames. The user stack is not mapped;
/// its pages are marked allowed and faulted in on first touch.
pub struct AddressSpaceLoader<'a, 'm, M: PhysMapper, A: FrameAlloc + ?Sized> {
    kernel: &'a AddressSpace<'m, M>,
    cache: &'a mut TableCache,
    alloc: &'a mut A,
}

impl<'a, 'm, M: PhysMapper, A: FrameAlloc + ?Sized> AddressSpaceLoader<'a, 'm, M, A> {
    pub const fn new(
        kernel: &'a AddressSpace<'m, M>,
        cache: &'a mut TableCache,
        alloc: &'a mut A,
    ) -> Self {
        Self {
            kernel,
            cache,
            alloc,
        }
    }

    fn populate(&mut self, space: &AddressSpace<'m, M>, image: &ProgramImage<'_>) -> Result<(), MapError> {
        let mapper = space.mapper();
        for seg in image.segments() {
            let flags = if seg.flags.execute() {
                PageEntry::user_code()
            } else {
                PageEntry::user_data().with_writable(seg.flags.write())
            };
            let file = image.segment_bytes(&seg);
            let file_start = seg.vaddr.as_u64();
            let file_end = file_start + file.len() as u64;

            let mut page = align_down(file_start, PAGE_SIZE);
            while page < align_up(seg.end(), PAGE_SIZE) {
                let va = VirtualAddress::new(page);
                let (frame, leaf, fresh) = match space.translate(va) {
                    // Shared with the previous segment: keep its contents, widen the rights.
                    Some((frame, old)) => (
                        frame,
                        flags
                            .with_writable(flags.writable() || old.writable())
                            .with_no_execute(flags.no_execute() && old.no_execute()),
                        false,
                    ),
                    None => {
                        let frame = self.alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
                        // SAFETY: fresh frame, not mapped anywhere yet.
                        unsafe { zero_frame(mapper, frame) };
                        (frame, flags, true)
                    }
                };

                let from = file_start.max(page);
                let to = file_end.min(page + PAGE_SIZE);
                if from < to {
                    // SAFETY: the frame belongs to this address space and is not in use.
                    let dst = unsafe { mapper.phys_to_mut::<[u8; PAGE_SIZE as usize]>(frame) };
                    #[allow(clippy::cast_possible_truncation)]
                    dst[(from - page) as usize..(to - page) as usize]
                        .copy_from_slice(&file[(from - file_start) as usize..(to - file_start) as usize]);
                }

                if let Err(e) = space.map(self.cache, self.alloc, va, frame, 1, leaf, MapMode::Overwrite) {
                    // Teardown only sees mapped frames.
                    if fresh {
                        self.alloc.free_4k(frame);
                    }
                    return Err(e);
                }
                page += PAGE_SIZE;
            }
        }

        let mut page = USER_STACK_TOP - USER_STACK_SIZE;
        while page < USER_STACK_TOP {
            space.allow(self.cache, self.alloc, VirtualAddress::new(page), true, PageTableLevel::Pt)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }
}

impl<M: PhysMapper, A: FrameAlloc + ?Sized> ProcessLoader for AddressSpaceLoader<'_, '_, M, A> {
    fn load(&mut self, image: &ProgramImage<'_>) -> Result<LoadedProcess, SchedError> {
        if self.cache.is_low() {
            self.cache.refill(self.kernel.mapper(), self.alloc)?;
        }
        let space = self.kernel.new_user(self.cache)?;
        if let Err(e) = self.populate(&space, image) {
            space.teardown(self.cache, self.alloc);
            return Err(e.into());
        }
        debug!("loaded image at {}, entry {}", space.root(), image.entry());
        Ok(LoadedProcess {
            root: space.root(),
            entry: image.entry(),
            user_stack_top: VirtualAddress::new(USER_STACK_TOP),
        })
    }

    fn unload(&mut self, root: PhysicalAddress) {
        let space = AddressSpace::from_root(self.kernel.mapper(), root);
        let frames = space.teardown(self.cache, self.alloc);
        debug!("unloaded {root}, {frames} frames released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ElfBuilder;
    use kernel_vmem::testing::{BumpAlloc, TestPhys};

    const FRAMES: usize = 1024;

    struct Fixture {
        phys: TestPhys,
        cache: TableCache,
        alloc: BumpAlloc,
        kernel_root: PhysicalAddress,
    }

    fn fixture() -> Fixture {
        let phys = TestPhys::new(FRAMES);
        let mut alloc = BumpAlloc::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(FRAMES as u64 * 4096));
        let mut cache = TableCache::new(16);
        cache.refill(&phys, &mut alloc).unwrap();
        let kernel_root = {
            let kernel = AddressSpace::new(&phys, &mut cache).unwrap();
            kernel.populate_kernel_half(&mut cache, &mut alloc).unwrap();
            kernel.root()
        };
        Fixture {
            phys,
            cache,
            alloc,
            kernel_root,
        }
    }

    #[test]
    fn segments_are_copied_and_zero_filled() {
        let mut f = fixture();
        let kernel = AddressSpace::from_root(&f.phys, f.kernel_root);
        let code = [0x48, 0x31, 0xc0, 0xeb, 0xfe];
        let bytes = ElfBuilder::new(0x40_0000)
            .code(&code)
            .data(0x40_1ffe, &[0xAA, 0xBB, 0xCC], 0x10)
            .build();
        let image = ProgramImage::parse(&bytes).unwrap();

        let mut loader = AddressSpaceLoader::new(&kernel, &mut f.cache, &mut f.alloc);
        let loaded = loader.load(&image).unwrap();
        assert_eq!(loaded.entry.as_u64(), 0x40_0000);
        let space = AddressSpace::from_root(&f.phys, loaded.root);

        let (frame, e) = space.translate(VirtualAddress::new(0x40_0000)).unwrap();
        assert!(e.user() && !e.writable() && !e.no_execute());
        assert_eq!(&f.phys.read_frame(frame)[..5], &code);

        // The data segment straddles a page boundary.
        let (first, e) = space.translate(VirtualAddress::new(0x40_1000)).unwrap();
        assert!(e.writable() && e.no_execute());
        assert_eq!(&f.phys.read_frame(first)[0xffe..], &[0xAA, 0xBB]);
        let (second, _) = space.translate(VirtualAddress::new(0x40_2000)).unwrap();
        assert_eq!(f.phys.read_frame(second)[0], 0xCC);
        assert!(f.phys.read_frame(second)[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stack_is_demand_faulted_and_kernel_half_shared() {
        let mut f = fixture();
        let kernel = AddressSpace::from_root(&f.phys, f.kernel_root);
        let bytes = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        let image = ProgramImage::parse(&bytes).unwrap();
        let loaded = AddressSpaceLoader::new(&kernel, &mut f.cache, &mut f.alloc)
            .load(&image)
            .unwrap();
        let space = AddressSpace::from_root(&f.phys, loaded.root);

        let below_top = VirtualAddress::new(USER_STACK_TOP - 8);
        assert!(space.translate(below_top).is_none());
        assert!(space.is_allowed(below_top));
        assert!(!space.is_allowed(VirtualAddress::new(USER_STACK_TOP - USER_STACK_SIZE - 8)));

        let kva = VirtualAddress::new(0xffff_ffff_8000_0000);
        assert_eq!(
            kernel.cursor(kva).entry(PageTableLevel::Pml4),
            space.cursor(kva).entry(PageTableLevel::Pml4)
        );
    }

    #[test]
    fn failed_load_returns_every_frame() {
        let mut f = fixture();
        let kernel = AddressSpace::from_root(&f.phys, f.kernel_root);
        // One segment per PML4 slot, so each needs three fresh tables.
        let mut builder = ElfBuilder::new(0x40_0000).code(&[0xc3]);
        for slot in 1..6u64 {
            builder = builder.data(slot << 39, &[0x5a], 1);
        }
        let bytes = builder.build();
        let image = ProgramImage::parse(&bytes).unwrap();

        f.cache.trim(&f.phys, &mut f.alloc, 16);
        f.cache.refill(&f.phys, &mut f.alloc).unwrap();
        let mut hoard = Vec::new();
        while let Some(pa) = f.alloc.alloc_4k() {
            hoard.push(pa);
        }
        // Enough for every segment page, not for the last segment's tables.
        for pa in hoard.drain(..6) {
            f.alloc.free_4k(pa);
        }
        let held = f.alloc.outstanding() - f.cache.len();

        let result = AddressSpaceLoader::new(&kernel, &mut f.cache, &mut f.alloc).load(&image);
        assert!(matches!(result, Err(SchedError::AddressSpace(MapError::OutOfMemory))));
        assert_eq!(f.alloc.outstanding() - f.cache.len(), held);
    }

    #[test]
    fn unload_returns_frames() {
        let mut f = fixture();
        let kernel = AddressSpace::from_root(&f.phys, f.kernel_root);
        let bytes = ElfBuilder::new(0x40_0000).code(&[0xc3; 5000]).build();
        let image = ProgramImage::parse(&bytes).unwrap();
        let mut loader = AddressSpaceLoader::new(&kernel, &mut f.cache, &mut f.alloc);
        let loaded = loader.load(&image).unwrap();
        loader.unload(loaded.root);
        drop(loader);
        // Only tables and the kernel half remain outstanding.
        let outstanding = f.alloc.outstanding();
        assert!(outstanding <= 1 + 256 + 2 * 16, "{outstanding} frames outstanding");
    }
}
