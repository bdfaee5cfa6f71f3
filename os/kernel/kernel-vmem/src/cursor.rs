use crate::table::table_at;
use crate::{MapError, PageEntry, PageTableLevel, PhysMapper, TableCache};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Walker over the paging tree for one virtual address.
///
/// Holds the four table indices of the address and remembers the physical
/// address of each table once resolved. Nothing is stored in the tables
/// themselves; parent links are rediscovered by walking down from the root.
///
/// Moving with [`next`](Self::next) keeps the resolved tables above the
/// highest index that changed and forgets the ones below it.
pub struct Cursor<'m, M: PhysMapper> {
    mapper: &'m M,
    indices: [u16; 4],
    tables: [Option<PhysicalAddress>; 4],
}

impl<'m, M: PhysMapper> Cursor<'m, M> {
    #[must_use]
    pub fn new(mapper: &'m M, root: PhysicalAddress, va: VirtualAddress) -> Self {
        let mut indices = [0; 4];
        for (level, index) in indices.iter_mut().enumerate() {
            *index = va.index(level);
        }
        Self {
            mapper,
            indices,
            tables: [None, None, None, Some(root)],
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(&self, level: PageTableLevel) -> usize {
        self.indices[level.number()] as usize
    }

    /// The 4 KiB page the cursor currently points at.
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.start(PageTableLevel::Pt)
    }

    /// Physical address of the table at `level`, if the walk reaches it.
    pub fn table(&mut self, level: PageTableLevel) -> Option<PhysicalAddress> {
        if let Some(pa) = self.tables[level.number()] {
            return Some(pa);
        }
        let parent = self.entry(level.upper()?)?;
        if !parent.present() || parent.huge() {
            return None;
        }
        self.tables[level.number()] = Some(parent.address());
        Some(parent.address())
    }

    /// Entry at `level` on the path to the current address.
    pub fn entry(&mut self, level: PageTableLevel) -> Option<PageEntry> {
        let table = self.table(level)?;
        // SAFETY: `table` was reached by walking present table links.
        Some(unsafe { table_at(self.mapper, table) }.entry(self.index(level)))
    }

    /// Overwrite the entry at `level`. Returns `false` if the table is not
    /// reachable.
    pub(crate) fn set_entry(&mut self, level: PageTableLevel, entry: PageEntry) -> bool {
        let Some(table) = self.table(level) else {
            return false;
        };
        // SAFETY: as in `entry`; the reference does not outlive this call.
        unsafe { table_at(self.mapper, table) }.set(self.index(level), entry);
        true
    }

    /// Deepest level the walk reaches: the first entry, from the root down,
    /// that is not present or maps a huge page. `Pt` if everything above
    /// the leaf is present.
    pub fn depth(&mut self) -> PageTableLevel {
        for level in PageTableLevel::TOP_DOWN {
            let Some(e) = self.entry(level) else {
                return level;
            };
            if !e.present() || e.huge() || level == PageTableLevel::Pt {
                return level;
            }
        }
        PageTableLevel::Pt
    }

    /// Whether the current address lies in an allowed region: the entry at
    /// [`depth`](Self::depth) or any of its ancestors carries the marker.
    pub fn is_allowed(&mut self) -> bool {
        let mut level = Some(self.depth());
        while let Some(l) = level {
            if self.entry(l).is_some_and(|e| e.allowed()) {
                return true;
            }
            level = l.upper();
        }
        false
    }

    /// Make sure the table at `level` exists, creating it and any missing
    /// ancestors with pages from `cache`.
    ///
    /// A new table is linked with [`TABLE_FLAGS`](crate::TABLE_FLAGS) (plus
    /// `user` in the lower half). The parent entry keeps its `allowed`
    /// marker, which therefore keeps covering everything below it.
    ///
    /// # Errors
    /// [`MapError::CacheEmpty`] when a table is needed and the cache is dry;
    /// [`MapError::HugePage`] when a huge page sits where a table would go.
    pub fn ensure_table(
        &mut self,
        level: PageTableLevel,
        cache: &mut TableCache,
    ) -> Result<PhysicalAddress, MapError> {
        if let Some(pa) = self.table(level) {
            return Ok(pa);
        }
        let Some(upper) = level.upper() else {
            unreachable!("the root table always resolves");
        };
        self.ensure_table(upper, cache)?;

        let parent = self.entry(upper).unwrap_or_default();
        if parent.present() {
            return Err(MapError::HugePage(self.start(upper)));
        }

        let page = cache.take(self.mapper)?;
        let link = PageEntry::table(page)
            .with_allowed(parent.allowed())
            .with_user(!self.address().is_higher_half());
        self.set_entry(upper, link);
        self.tables[level.number()] = Some(page);
        Ok(page)
    }

    /// Advance to the next entry at `level`, zeroing all lower indices and
    /// carrying into the levels above. Returns `false` when the walk runs
    /// off the end of the address space.
    pub fn next(&mut self, level: PageTableLevel) -> bool {
        for lower in 0..level.number() {
            self.indices[lower] = 0;
        }

        let mut n = level.number();
        loop {
            self.indices[n] += 1;
            if self.indices[n] < 512 {
                break;
            }
            self.indices[n] = 0;
            if n == PageTableLevel::Pml4.number() {
                return false;
            }
            n += 1;
        }

        // Tables below the highest changed index hang off different entries now.
        for table in &mut self.tables[..n] {
            *table = None;
        }
        true
    }

    /// Forget resolved tables below `level` after the tree changed there.
    pub(crate) fn forget_below(&mut self, level: PageTableLevel) {
        for table in &mut self.tables[..level.number()] {
            *table = None;
        }
    }

    /// First address covered by the current entry at `level`.
    #[must_use]
    pub const fn start(&self, level: PageTableLevel) -> VirtualAddress {
        let mut indices = self.indices;
        let mut l = 0;
        while l < level.number() {
            indices[l] = 0;
            l += 1;
        }
        VirtualAddress::from_indices(indices, 0)
    }

    /// First address past the current entry at `level`, canonicalized.
    #[must_use]
    pub const fn end(&self, level: PageTableLevel) -> VirtualAddress {
        VirtualAddress::canonical(self.start(level).as_u64().wrapping_add(level.span()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpAlloc, TestPhys};

    fn setup(frames: usize) -> (TestPhys, TableCache, PhysicalAddress) {
        let phys = TestPhys::new(frames);
        let mut alloc = BumpAlloc::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(frames as u64 * 4096));
        let mut cache = TableCache::new(16);
        cache.refill(&phys, &mut alloc).unwrap();
        let root = cache.take(&phys).unwrap();
        (phys, cache, root)
    }

    #[test]
    fn indices_follow_address_bits() {
        let (phys, _cache, root) = setup(32);
        let va = VirtualAddress::from_indices([3, 2, 1, 0x1ff], 0x123);
        let c = Cursor::new(&phys, root, va);
        assert_eq!(c.index(PageTableLevel::Pt), 3);
        assert_eq!(c.index(PageTableLevel::Pd), 2);
        assert_eq!(c.index(PageTableLevel::Pdpt), 1);
        assert_eq!(c.index(PageTableLevel::Pml4), 0x1ff);
        assert_eq!(c.address().as_u64(), va.as_u64() & !0xfff);
    }

    #[test]
    fn depth_of_empty_tree_is_root() {
        let (phys, _cache, root) = setup(32);
        let mut c = Cursor::new(&phys, root, VirtualAddress::new(0x4000_0000));
        assert_eq!(c.depth(), PageTableLevel::Pml4);
        assert_eq!(c.table(PageTableLevel::Pdpt), None);
    }

    #[test]
    fn ensure_table_builds_chain() {
        let (phys, mut cache, root) = setup(32);
        let before = cache.len();
        let mut c = Cursor::new(&phys, root, VirtualAddress::new(0x4000_0000));
        c.ensure_table(PageTableLevel::Pt, &mut cache).unwrap();
        assert_eq!(cache.len(), before - 3);
        assert_eq!(c.depth(), PageTableLevel::Pt);

        let link = c.entry(PageTableLevel::Pd).unwrap();
        assert!(link.present() && link.writable() && link.user());

        // Already there: no more pages taken.
        c.ensure_table(PageTableLevel::Pt, &mut cache).unwrap();
        assert_eq!(cache.len(), before - 3);
    }

    #[test]
    fn ensure_table_keeps_parent_marker() {
        let (phys, mut cache, root) = setup(32);
        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let mut c = Cursor::new(&phys, root, va);
        c.set_entry(PageTableLevel::Pml4, PageEntry::new().with_allowed(true));
        c.ensure_table(PageTableLevel::Pd, &mut cache).unwrap();

        let link = c.entry(PageTableLevel::Pml4).unwrap();
        assert!(link.present() && link.allowed() && !link.user());
        assert!(c.is_allowed());
    }

    #[test]
    fn next_carries_into_upper_levels() {
        let (phys, _cache, root) = setup(32);
        let va = VirtualAddress::from_indices([511, 511, 0, 0], 0);
        let mut c = Cursor::new(&phys, root, va);
        assert!(c.next(PageTableLevel::Pt));
        assert_eq!(c.index(PageTableLevel::Pt), 0);
        assert_eq!(c.index(PageTableLevel::Pd), 0);
        assert_eq!(c.index(PageTableLevel::Pdpt), 1);
        assert_eq!(c.address().as_u64(), 0x4000_0000);

        assert!(c.next(PageTableLevel::Pdpt));
        assert_eq!(c.address().as_u64(), 0x8000_0000);
    }

    #[test]
    fn next_crosses_into_higher_half_canonically() {
        let (phys, _cache, root) = setup(32);
        let va = VirtualAddress::from_indices([0, 0, 0, 255], 0);
        let mut c = Cursor::new(&phys, root, va);
        assert!(c.next(PageTableLevel::Pml4));
        assert_eq!(c.address().as_u64(), 0xffff_8000_0000_0000);
        assert!(c.address().is_canonical());
    }

    #[test]
    fn next_runs_off_the_end() {
        let (phys, _cache, root) = setup(32);
        let mut c = Cursor::new(&phys, root, VirtualAddress::new(0xffff_ff80_0000_0000));
        assert!(!c.next(PageTableLevel::Pml4));
    }

    #[test]
    fn start_and_end_are_canonical() {
        let (phys, _cache, root) = setup(32);
        let c = Cursor::new(&phys, root, VirtualAddress::new(0xffff_8000_0020_1000));
        assert_eq!(c.start(PageTableLevel::Pd).as_u64(), 0xffff_8000_0020_0000);
        assert_eq!(c.end(PageTableLevel::Pd).as_u64(), 0xffff_8000_0040_0000);
        assert_eq!(c.start(PageTableLevel::Pml4).as_u64(), 0xffff_8000_0000_0000);

        let low = Cursor::new(&phys, root, VirtualAddress::new(0x0000_7fff_ffff_f000));
        assert_eq!(low.end(PageTableLevel::Pml4).as_u64(), 0xffff_8000_0000_0000);
    }
}
