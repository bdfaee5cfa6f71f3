use crate::{PageEntry, PhysMapper};
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// Paging level, numbered the way the address bits are: level `n` is
/// indexed by bits `12 + 9n ..= 20 + 9n`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    Pt = 0,
    Pd = 1,
    Pdpt = 2,
    Pml4 = 3,
}

impl PageTableLevel {
    /// Root to leaf.
    pub const TOP_DOWN: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    #[inline]
    #[must_use]
    pub const fn number(self) -> usize {
        self as usize
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << (12 + 9 * self as u64)
    }

    /// Next level towards the leaves.
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Next level towards the root.
    #[must_use]
    pub const fn upper(self) -> Option<Self> {
        match self {
            Self::Pt => Some(Self::Pd),
            Self::Pd => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pml4),
            Self::Pml4 => None,
        }
    }

    /// Whether an entry at this level may map a page directly.
    #[must_use]
    pub const fn can_map_huge(self) -> bool {
        matches!(self, Self::Pd | Self::Pdpt)
    }
}

impl fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pt => "PT",
            Self::Pd => "PD",
            Self::Pdpt => "PDPT",
            Self::Pml4 => "PML4",
        })
    }
}

/// One 4 KiB page-table page.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::new(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::new());
    }

    /// No entry is present and none carries the `allowed` marker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.into_bits() == 0)
    }

    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }

    /// Log every present entry, descending into child tables when
    /// `recurse` is set.
    pub fn dump<M: PhysMapper>(&self, mapper: &M, level: PageTableLevel, recurse: bool) {
        log::debug!("{level} table @ {:p}:", self);
        for (i, e) in self.iter() {
            if !e.present() {
                if e.allowed() {
                    log::debug!("  {i:3}: {:016x} allowed, not present", e.into_bits());
                }
                continue;
            }
            if level == PageTableLevel::Pt || e.huge() {
                log::debug!("  {i:3}: {:016x} -> page at {}", e.into_bits(), e.address());
            } else {
                log::debug!("  {i:3}: {:016x} -> table at {}", e.into_bits(), e.address());
            }
        }

        let Some(lower) = level.lower() else {
            return;
        };
        if !recurse {
            return;
        }
        for (_, e) in self.iter().filter(|(_, e)| e.present() && !e.huge()) {
            // SAFETY: present non-huge entries above PT level link to tables.
            let child = unsafe { table_at(mapper, e.address()) };
            child.dump(mapper, lower, true);
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrow the table stored in the frame at `pa`.
///
/// # Safety
/// `pa` must hold a page table (or a frame the caller is about to turn into
/// one), and no other live reference may alias it mutably.
#[inline]
pub unsafe fn table_at<'a, M: PhysMapper>(mapper: &M, pa: PhysicalAddress) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(pa) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans() {
        assert_eq!(PageTableLevel::Pt.span(), 0x1000);
        assert_eq!(PageTableLevel::Pd.span(), 0x20_0000);
        assert_eq!(PageTableLevel::Pdpt.span(), 0x4000_0000);
        assert_eq!(PageTableLevel::Pml4.span(), 0x80_0000_0000);
    }

    #[test]
    fn level_navigation() {
        assert_eq!(PageTableLevel::Pml4.lower(), Some(PageTableLevel::Pdpt));
        assert_eq!(PageTableLevel::Pt.lower(), None);
        assert_eq!(PageTableLevel::Pt.upper(), Some(PageTableLevel::Pd));
        assert_eq!(PageTableLevel::Pml4.upper(), None);
        assert!(PageTableLevel::Pml4 > PageTableLevel::Pt);
    }

    #[test]
    fn allowed_only_entry_keeps_table_non_empty() {
        let mut t = PageTable::new();
        assert!(t.is_empty());
        t.entry_mut(7).set_allowed(true);
        assert!(!t.is_empty());
        assert_eq!(t.present_count(), 0);
        t.zero();
        assert!(t.is_empty());
    }
}
