//! # Address Space (x86-64, PML4-rooted)
//!
//! [`AddressSpace`] operates on one paging tree. Intermediate tables come
//! from a [`TableCache`]; operations that may build several tables top the
//! cache up first, [`AddressSpace::handle_fault`] never does.
//!
//! TLB maintenance is left to the caller: none of these functions know
//! whether the tree is active.

use crate::table::{ENTRIES, table_at};
use crate::{
    Cursor, FrameAlloc, MapError, PageEntry, PageTableLevel, PhysMapper, TableCache, zero_frame,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::{debug, warn};

/// First PML4 slot of the higher half; slots from here on are shared by
/// every address space.
const KERNEL_HALF: usize = ENTRIES / 2;

/// Tables a single 4 KiB leaf can require below the root.
const TABLES_PER_LEAF: usize = 3;

/// What to do with leaves that already exist in a range being mapped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapMode {
    /// Refuse the whole request.
    Fresh,
    /// Replace them.
    Overwrite,
}

/// Outcome of [`AddressSpace::handle_fault`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// The page was backed with the given zeroed frame.
    Resolved(PhysicalAddress),
    /// The address is not inside an allowed region.
    NotAllowed,
    /// The page is mapped; the fault was a permission violation.
    Protection,
}

/// Handle to a single paging tree.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing tree.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { root, mapper }
    }

    /// Empty tree with a root taken from `cache`.
    ///
    /// # Errors
    /// [`MapError::CacheEmpty`].
    pub fn new(mapper: &'m M, cache: &mut TableCache) -> Result<Self, MapError> {
        let root = cache.take(mapper)?;
        Ok(Self { root, mapper })
    }

    /// New tree for a user process. Its lower half is empty; its higher half
    /// references the same PDPTs as `self`.
    ///
    /// Kernel mappings created later show up in every process only if the
    /// kernel PML4 slots already exist; see
    /// [`populate_kernel_half`](Self::populate_kernel_half).
    ///
    /// # Errors
    /// [`MapError::CacheEmpty`].
    pub fn new_user(&self, cache: &mut TableCache) -> Result<Self, MapError> {
        let root = cache.take(self.mapper)?;
        // SAFETY: both roots are page tables; `root` is fresh so they differ.
        let (kernel, user) = unsafe { (table_at(self.mapper, self.root), table_at(self.mapper, root)) };
        for i in KERNEL_HALF..ENTRIES {
            user.set(i, kernel.entry(i));
        }
        Ok(Self {
            root,
            mapper: self.mapper,
        })
    }

    /// Link a PDPT into every higher-half PML4 slot that has none. Returns
    /// how many were created.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when the cache cannot be refilled.
    pub fn populate_kernel_half<A: FrameAlloc + ?Sized>(
        &self,
        cache: &mut TableCache,
        alloc: &mut A,
    ) -> Result<usize, MapError> {
        // SAFETY: the root is a page table.
        let root = unsafe { table_at(self.mapper, self.root) };
        let mut created = 0;
        for i in KERNEL_HALF..ENTRIES {
            let e = root.entry(i);
            if e.present() {
                continue;
            }
            if cache.is_empty() {
                cache.refill(self.mapper, alloc)?;
            }
            let pdpt = cache.take(self.mapper)?;
            root.set(i, PageEntry::table(pdpt).with_allowed(e.allowed()));
            created += 1;
        }
        debug!("kernel half: {created} PDPTs created");
        Ok(created)
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[must_use]
    pub fn cursor(&self, va: VirtualAddress) -> Cursor<'m, M> {
        Cursor::new(self.mapper, self.root, va)
    }

    /// Map `count` pages starting at `virt` to consecutive frames starting at
    /// `phys`, using the permission bits of `flags`.
    ///
    /// Missing tables are built from `cache`, which is refilled from `alloc`
    /// whenever it runs low. An `allowed` marker on a replaced leaf is kept.
    ///
    /// # Errors
    /// - [`MapError::NonCanonical`], [`MapError::Unaligned`] and
    ///   [`MapError::RangeOverflow`] for bad arguments.
    /// - [`MapError::AlreadyMapped`] in [`MapMode::Fresh`] if any page of the
    ///   range is mapped; nothing is written in that case.
    /// - [`MapError::OutOfMemory`] when tables cannot be obtained.
    #[allow(clippy::too_many_arguments)]
    pub fn map<A: FrameAlloc + ?Sized>(
        &self,
        cache: &mut TableCache,
        alloc: &mut A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        count: usize,
        flags: PageEntry,
        mode: MapMode,
    ) -> Result<(), MapError> {
        check_range(virt, count)?;
        if phys.as_u64() % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned(phys.as_u64()));
        }

        if mode == MapMode::Fresh
            && let Some(va) = self.first_mapped(virt, count)
        {
            return Err(MapError::AlreadyMapped(va));
        }

        let mut c = self.cursor(virt);
        for i in 0..count as u64 {
            if cache.len() < TABLES_PER_LEAF {
                cache.refill(self.mapper, alloc)?;
            }
            c.ensure_table(PageTableLevel::Pt, cache)?;
            let old = c.entry(PageTableLevel::Pt).unwrap_or_default();
            let leaf = PageEntry::leaf(phys + i * PAGE_SIZE, flags).with_allowed(old.allowed());
            c.set_entry(PageTableLevel::Pt, leaf);
            c.next(PageTableLevel::Pt);
        }
        Ok(())
    }

    /// Address of the first mapped page in the range, if any.
    fn first_mapped(&self, virt: VirtualAddress, count: usize) -> Option<VirtualAddress> {
        let mut c = self.cursor(virt);
        for _ in 0..count {
            let level = c.depth();
            if c.entry(level).is_some_and(|e| e.present()) {
                return Some(c.address());
            }
            c.next(PageTableLevel::Pt);
        }
        None
    }

    /// Clear the leaves of `count` pages from `virt`. Tables left without
    /// any entry go back to `cache` and their parent entry is cleared, up to
    /// but excluding the root. Returns the number of leaves cleared.
    pub fn unmap(&self, cache: &mut TableCache, virt: VirtualAddress, count: usize) -> usize {
        if let Err(e) = check_range(virt, count) {
            warn!("unmap of {virt} x {count}: {e}");
            return 0;
        }

        let mut c = self.cursor(virt);
        let mut cleared = 0;
        for _ in 0..count {
            if let Some(e) = c.entry(PageTableLevel::Pt)
                && e.present()
            {
                c.set_entry(PageTableLevel::Pt, PageEntry::new().with_allowed(e.allowed()));
                cleared += 1;
                self.release_empty_tables(&mut c, cache);
            }
            if !c.next(PageTableLevel::Pt) {
                break;
            }
        }
        cleared
    }

    fn release_empty_tables(&self, c: &mut Cursor<'m, M>, cache: &mut TableCache) {
        let mut level = PageTableLevel::Pt;
        while let Some(upper) = level.upper() {
            let Some(table) = c.table(level) else {
                return;
            };
            // SAFETY: reached through present links from the root.
            if !unsafe { table_at(self.mapper, table) }.is_empty() {
                return;
            }
            let link = c.entry(upper).unwrap_or_default();
            c.set_entry(upper, PageEntry::new().with_allowed(link.allowed()));
            c.forget_below(upper);
            cache.give(self.mapper, table);
            level = upper;
        }
    }

    /// Set or clear the demand-fault marker on the entry at `level` that
    /// covers `virt`, building the tables above it if necessary.
    ///
    /// # Errors
    /// [`MapError::NonCanonical`], [`MapError::HugePage`] or
    /// [`MapError::OutOfMemory`].
    pub fn allow<A: FrameAlloc + ?Sized>(
        &self,
        cache: &mut TableCache,
        alloc: &mut A,
        virt: VirtualAddress,
        allowed: bool,
        level: PageTableLevel,
    ) -> Result<(), MapError> {
        if !virt.is_canonical() {
            return Err(MapError::NonCanonical(virt));
        }
        if cache.len() < TABLES_PER_LEAF {
            cache.refill(self.mapper, alloc)?;
        }
        let mut c = self.cursor(virt);
        c.ensure_table(level, cache)?;
        let e = c.entry(level).unwrap_or_default();
        c.set_entry(level, e.with_allowed(allowed));
        Ok(())
    }

    /// Whether `virt` lies in a region marked by [`allow`](Self::allow) at
    /// any level.
    #[must_use]
    pub fn is_allowed(&self, virt: VirtualAddress) -> bool {
        virt.is_canonical() && self.cursor(virt).is_allowed()
    }

    /// Physical address and leaf entry for `virt`, following huge pages.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, PageEntry)> {
        if !virt.is_canonical() {
            return None;
        }
        let mut c = self.cursor(virt);
        for level in PageTableLevel::TOP_DOWN {
            let e = c.entry(level)?;
            if !e.present() {
                return None;
            }
            if level == PageTableLevel::Pt || e.huge() {
                let offset = virt.as_u64() & (level.span() - 1);
                return Some((e.address() + offset, e));
            }
        }
        None
    }

    /// Back a faulting page inside an allowed region with a zeroed frame.
    ///
    /// Tables are taken from `cache` without refilling it, so this is safe
    /// to call from the page-fault handler as long as the cache was topped
    /// up beforehand.
    ///
    /// # Errors
    /// [`MapError::CacheEmpty`] or [`MapError::OutOfMemory`]; the kernel
    /// treats both as fatal.
    pub fn handle_fault<A: FrameAlloc + ?Sized>(
        &self,
        cache: &mut TableCache,
        alloc: &mut A,
        virt: VirtualAddress,
    ) -> Result<FaultResolution, MapError> {
        if !virt.is_canonical() {
            return Ok(FaultResolution::NotAllowed);
        }
        if self.translate(virt).is_some() {
            return Ok(FaultResolution::Protection);
        }

        let page = VirtualAddress::new(virt.as_u64() & !(PAGE_SIZE - 1));
        let mut c = self.cursor(page);
        if !c.is_allowed() {
            return Ok(FaultResolution::NotAllowed);
        }

        c.ensure_table(PageTableLevel::Pt, cache)?;
        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        // SAFETY: the frame was just allocated and is not mapped anywhere.
        unsafe { zero_frame(self.mapper, frame) };

        let flags = if page.is_higher_half() {
            PageEntry::kernel_data()
        } else {
            PageEntry::user_data()
        };
        let old = c.entry(PageTableLevel::Pt).unwrap_or_default();
        c.set_entry(PageTableLevel::Pt, PageEntry::leaf(frame, flags).with_allowed(old.allowed()));
        Ok(FaultResolution::Resolved(frame))
    }

    /// Destroy a user tree: every frame mapped in the lower half goes back
    /// to `alloc`, every lower-half table and the root go back to `cache`.
    /// The shared higher half is left alone. Returns the number of frames
    /// released.
    pub fn teardown<A: FrameAlloc + ?Sized>(self, cache: &mut TableCache, alloc: &mut A) -> usize {
        // SAFETY: the root is a page table.
        let root = unsafe { table_at(self.mapper, self.root) };
        let mut frames = 0;
        for i in 0..KERNEL_HALF {
            let e = root.entry(i);
            if e.present() {
                frames += self.release_subtree(e.address(), PageTableLevel::Pdpt, cache, alloc);
            }
        }
        cache.give(self.mapper, self.root);
        cache.trim(self.mapper, alloc, cache.watermark() * 2);
        debug!("address space {} torn down, {frames} frames released", self.root);
        frames
    }

    fn release_subtree<A: FrameAlloc + ?Sized>(
        &self,
        table: PhysicalAddress,
        level: PageTableLevel,
        cache: &mut TableCache,
        alloc: &mut A,
    ) -> usize {
        // SAFETY: reached through a present table link.
        let t = unsafe { table_at(self.mapper, table) };
        let mut frames = 0;
        for i in 0..ENTRIES {
            let e = t.entry(i);
            if !e.present() || e.huge() {
                continue;
            }
            match level.lower() {
                None => {
                    alloc.free_4k(e.address());
                    frames += 1;
                }
                Some(lower) => frames += self.release_subtree(e.address(), lower, cache, alloc),
            }
        }
        cache.give(self.mapper, table);
        frames
    }

    /// Log the whole tree.
    pub fn dump(&self) {
        // SAFETY: the root is a page table.
        unsafe { table_at(self.mapper, self.root) }.dump(self.mapper, PageTableLevel::Pml4, true);
    }
}

/// `virt` and the last page of the range are canonical, in the same half,
/// and `virt` is page aligned.
fn check_range(virt: VirtualAddress, count: usize) -> Result<(), MapError> {
    if !virt.is_canonical() {
        return Err(MapError::NonCanonical(virt));
    }
    if virt.as_u64() % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned(virt.as_u64()));
    }
    let Some(pages) = (count as u64).checked_sub(1) else {
        return Ok(());
    };
    let last = pages
        .checked_mul(PAGE_SIZE)
        .and_then(|bytes| virt.checked_add(bytes))
        .and_then(|last| VirtualAddress::try_new(last.as_u64()))
        .ok_or(MapError::RangeOverflow(virt))?;
    if last.is_higher_half() == virt.is_higher_half() {
        Ok(())
    } else {
        Err(MapError::RangeOverflow(virt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpAlloc, TestPhys};

    const FRAMES: usize = 512;

    struct Fixture {
        phys: TestPhys,
        alloc: BumpAlloc,
        cache: TableCache,
    }

    impl Fixture {
        fn new() -> Self {
            let phys = TestPhys::new(FRAMES);
            let mut alloc = BumpAlloc::new(
                PhysicalAddress::new(0x1000),
                PhysicalAddress::new(FRAMES as u64 * PAGE_SIZE),
            );
            let mut cache = TableCache::new(16);
            cache.refill(&phys, &mut alloc).unwrap();
            Self { phys, alloc, cache }
        }
    }

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn map_then_translate() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .map(&mut f.cache, &mut f.alloc, va(0x40_0000), pa(0x8000_0000), 3, PageEntry::user_data(), MapMode::Fresh)
            .unwrap();

        let (p, e) = space.translate(va(0x40_1abc)).unwrap();
        assert_eq!(p, pa(0x8000_1abc));
        assert!(e.user() && e.writable() && e.no_execute());
        assert!(space.translate(va(0x40_3000)).is_none());
    }

    #[test]
    fn unmap_returns_tables_to_cache() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        let before = f.cache.len();

        space
            .map(&mut f.cache, &mut f.alloc, va(0x7f00_0000), pa(0x10_0000), 4, PageEntry::user_data(), MapMode::Fresh)
            .unwrap();
        assert_eq!(f.cache.len(), before - 3);

        assert_eq!(space.unmap(&mut f.cache, va(0x7f00_0000), 4), 4);
        assert_eq!(f.cache.len(), before);
        for i in 0..4 {
            assert!(space.translate(va(0x7f00_0000 + i * PAGE_SIZE)).is_none());
        }
        // SAFETY: test root.
        assert!(unsafe { table_at(&f.phys, space.root()) }.is_empty());
    }

    #[test]
    fn partial_unmap_keeps_shared_table() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .map(&mut f.cache, &mut f.alloc, va(0x1000), pa(0x20_0000), 2, PageEntry::kernel_data(), MapMode::Fresh)
            .unwrap();
        let mid = f.cache.len();
        assert_eq!(space.unmap(&mut f.cache, va(0x1000), 1), 1);
        assert_eq!(f.cache.len(), mid);
        assert!(space.translate(va(0x2000)).is_some());
    }

    #[test]
    fn fresh_map_rejects_overlap_without_writing() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .map(&mut f.cache, &mut f.alloc, va(0x5000), pa(0x5000), 1, PageEntry::kernel_data(), MapMode::Fresh)
            .unwrap();

        let err = space
            .map(&mut f.cache, &mut f.alloc, va(0x3000), pa(0x9000), 4, PageEntry::kernel_data(), MapMode::Fresh)
            .unwrap_err();
        assert_eq!(err, MapError::AlreadyMapped(va(0x5000)));
        assert!(space.translate(va(0x3000)).is_none());
        assert!(space.translate(va(0x4000)).is_none());
        assert_eq!(space.translate(va(0x5000)).unwrap().0, pa(0x5000));
    }

    #[test]
    fn overwrite_replaces_leaf() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .map(&mut f.cache, &mut f.alloc, va(0x5000), pa(0x5000), 1, PageEntry::kernel_data(), MapMode::Fresh)
            .unwrap();
        space
            .map(&mut f.cache, &mut f.alloc, va(0x5000), pa(0xa000), 1, PageEntry::kernel_code(), MapMode::Overwrite)
            .unwrap();
        let (p, e) = space.translate(va(0x5000)).unwrap();
        assert_eq!(p, pa(0xa000));
        assert!(!e.writable());
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        let flags = PageEntry::kernel_data();

        let r = space.map(&mut f.cache, &mut f.alloc, va(0x0000_9000_0000_0000), pa(0), 1, flags, MapMode::Fresh);
        assert_eq!(r, Err(MapError::NonCanonical(va(0x0000_9000_0000_0000))));

        let r = space.map(&mut f.cache, &mut f.alloc, va(0x1001), pa(0), 1, flags, MapMode::Fresh);
        assert_eq!(r, Err(MapError::Unaligned(0x1001)));

        let r = space.map(&mut f.cache, &mut f.alloc, va(0x1000), pa(0x10), 1, flags, MapMode::Fresh);
        assert_eq!(r, Err(MapError::Unaligned(0x10)));

        let top = va(0x0000_7fff_ffff_f000);
        let r = space.map(&mut f.cache, &mut f.alloc, top, pa(0), 2, flags, MapMode::Fresh);
        assert_eq!(r, Err(MapError::RangeOverflow(top)));

        let r = space.allow(&mut f.cache, &mut f.alloc, va(0x0000_9000_0000_0000), true, PageTableLevel::Pd);
        assert_eq!(r, Err(MapError::NonCanonical(va(0x0000_9000_0000_0000))));
    }

    #[test]
    fn coarse_allow_covers_whole_range() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        // One PD entry: 2 MiB at 0x4000_0000.
        space
            .allow(&mut f.cache, &mut f.alloc, va(0x4000_0000), true, PageTableLevel::Pd)
            .unwrap();

        for probe in [0x4000_0000, 0x4000_1000, 0x4010_0000, 0x401f_f000] {
            assert!(space.is_allowed(va(probe)), "{probe:#x}");
        }
        assert!(!space.is_allowed(va(0x3fff_f000)));
        assert!(!space.is_allowed(va(0x4020_0000)));

        // Unrelated mappings elsewhere do not change the answers.
        space
            .map(&mut f.cache, &mut f.alloc, va(0x4020_0000), pa(0x1_0000), 2, PageEntry::user_data(), MapMode::Fresh)
            .unwrap();
        assert!(space.is_allowed(va(0x401f_f000)));
        assert!(!space.is_allowed(va(0x4020_0000)));
        assert!(!space.is_allowed(va(0x3fff_f000)));
    }

    #[test]
    fn allow_can_be_revoked() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .allow(&mut f.cache, &mut f.alloc, va(0x8000_0000), true, PageTableLevel::Pt)
            .unwrap();
        assert!(space.is_allowed(va(0x8000_0000)));
        assert!(!space.is_allowed(va(0x8000_1000)));
        space
            .allow(&mut f.cache, &mut f.alloc, va(0x8000_0000), false, PageTableLevel::Pt)
            .unwrap();
        assert!(!space.is_allowed(va(0x8000_0000)));
    }

    #[test]
    fn marker_survives_table_creation_below_it() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .allow(&mut f.cache, &mut f.alloc, va(0xffff_c000_0000_0000), true, PageTableLevel::Pdpt)
            .unwrap();
        space
            .map(
                &mut f.cache,
                &mut f.alloc,
                va(0xffff_c000_0000_0000),
                pa(0x3000),
                1,
                PageEntry::kernel_data(),
                MapMode::Fresh,
            )
            .unwrap();
        assert!(space.is_allowed(va(0xffff_c000_3fff_f000)));

        // Unmapping frees the tables below the marker but keeps the marker.
        space.unmap(&mut f.cache, va(0xffff_c000_0000_0000), 1);
        assert!(space.is_allowed(va(0xffff_c000_0000_0000)));
    }

    #[test]
    fn fault_in_allowed_region_is_backed() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .allow(&mut f.cache, &mut f.alloc, va(0x7000_0000), true, PageTableLevel::Pd)
            .unwrap();

        let r = space.handle_fault(&mut f.cache, &mut f.alloc, va(0x7000_2468)).unwrap();
        let FaultResolution::Resolved(frame) = r else {
            panic!("expected resolution, got {r:?}");
        };
        let (p, e) = space.translate(va(0x7000_2000)).unwrap();
        assert_eq!(p, frame);
        assert!(e.user() && e.writable());
        assert!(f.phys.read_frame(frame).iter().all(|&b| b == 0));

        assert_eq!(
            space.handle_fault(&mut f.cache, &mut f.alloc, va(0x7000_2000)),
            Ok(FaultResolution::Protection)
        );
        assert_eq!(
            space.handle_fault(&mut f.cache, &mut f.alloc, va(0x9000_0000)),
            Ok(FaultResolution::NotAllowed)
        );
    }

    #[test]
    fn fault_does_not_refill_cache() {
        let mut f = Fixture::new();
        let space = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        space
            .allow(&mut f.cache, &mut f.alloc, va(0x0), true, PageTableLevel::Pml4)
            .unwrap();
        let mut empty = TableCache::new(16);
        assert_eq!(
            space.handle_fault(&mut empty, &mut f.alloc, va(0x1000)),
            Err(MapError::CacheEmpty)
        );
    }

    #[test]
    fn user_space_shares_kernel_half() {
        let mut f = Fixture::new();
        let kernel = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        assert_eq!(kernel.populate_kernel_half(&mut f.cache, &mut f.alloc).unwrap(), 256);
        let user = kernel.new_user(&mut f.cache).unwrap();

        kernel
            .map(
                &mut f.cache,
                &mut f.alloc,
                va(0xffff_8880_0000_0000),
                pa(0x4000),
                1,
                PageEntry::kernel_data(),
                MapMode::Fresh,
            )
            .unwrap();
        assert_eq!(user.translate(va(0xffff_8880_0000_0000)).unwrap().0, pa(0x4000));

        user.map(&mut f.cache, &mut f.alloc, va(0x1000), pa(0x6000), 1, PageEntry::user_data(), MapMode::Fresh)
            .unwrap();
        assert!(kernel.translate(va(0x1000)).is_none());
    }

    #[test]
    fn teardown_releases_user_frames() {
        let mut f = Fixture::new();
        let kernel = AddressSpace::new(&f.phys, &mut f.cache).unwrap();
        let user = kernel.new_user(&mut f.cache).unwrap();
        let frames: Vec<_> = (0..3).map(|_| f.alloc.alloc_4k().unwrap()).collect();
        for (i, &frame) in frames.iter().enumerate() {
            user.map(
                &mut f.cache,
                &mut f.alloc,
                va(0x40_0000 + i as u64 * PAGE_SIZE),
                frame,
                1,
                PageEntry::user_data(),
                MapMode::Fresh,
            )
            .unwrap();
        }
        let outstanding = f.alloc.outstanding();
        assert_eq!(user.teardown(&mut f.cache, &mut f.alloc), 3);
        assert!(f.alloc.outstanding() < outstanding);
    }
}
