//! Single-frame allocation straight from the boot memory map, used while the
//! block allocator does not exist yet.

use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_vmem::FrameAlloc;

/// A run of frames.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameRun {
    pub start: PhysicalAddress,
    pub count: u64,
}

impl FrameRun {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Cursor over the free entries of the boot memory map.
///
/// Frames are taken in map order from the bottom of each free entry.
/// Frame 0 is never handed out. Nothing is written to the map; the split of
/// each entry into consumed and remaining frames is derived from the cursor
/// position.
pub struct RawFrameSource<'a> {
    map: &'a [MemoryMapEntry],
    region: usize,
    used_in_region: u64,
}

impl<'a> RawFrameSource<'a> {
    #[must_use]
    pub const fn new(map: &'a [MemoryMapEntry]) -> Self {
        Self {
            map,
            region: 0,
            used_in_region: 0,
        }
    }

    /// Frames of a free entry that may be handed out.
    fn usable(entry: &MemoryMapEntry) -> FrameRun {
        if entry.kind != MemoryKind::Free || entry.frame_count == 0 {
            return FrameRun {
                start: entry.start,
                count: 0,
            };
        }
        if entry.start.as_u64() == 0 {
            FrameRun {
                start: PhysicalAddress::new(PAGE_SIZE),
                count: entry.frame_count - 1,
            }
        } else {
            FrameRun {
                start: entry.start,
                count: entry.frame_count,
            }
        }
    }

    /// Hand out one frame, or `None` once every free entry is used up.
    pub fn allocate_page(&mut self) -> Option<PhysicalAddress> {
        while let Some(entry) = self.map.get(self.region) {
            let usable = Self::usable(entry);
            if self.used_in_region < usable.count {
                let pa = usable.start + self.used_in_region * PAGE_SIZE;
                self.used_in_region += 1;
                return Some(pa);
            }
            self.region += 1;
            self.used_in_region = 0;
        }
        None
    }

    /// How map entry `index` divides into frames already handed out and
    /// frames still available. `None` for entries that are not free memory.
    #[must_use]
    pub fn split(&self, index: usize) -> Option<(FrameRun, FrameRun)> {
        let entry = self.map.get(index)?;
        if entry.kind != MemoryKind::Free {
            return None;
        }
        let usable = Self::usable(entry);
        let used = match index.cmp(&self.region) {
            core::cmp::Ordering::Less => usable.count,
            core::cmp::Ordering::Equal => self.used_in_region.min(usable.count),
            core::cmp::Ordering::Greater => 0,
        };
        Some((
            FrameRun {
                start: usable.start,
                count: used,
            },
            FrameRun {
                start: usable.start + used * PAGE_SIZE,
                count: usable.count - used,
            },
        ))
    }

    /// Runs handed out so far.
    pub fn consumed(&self) -> impl Iterator<Item = FrameRun> + '_ {
        (0..self.map.len())
            .filter_map(|i| self.split(i))
            .map(|(used, _)| used)
            .filter(|r| !r.is_empty())
    }

    /// Runs not handed out yet, to be given to the block allocator.
    pub fn remaining(&self) -> impl Iterator<Item = FrameRun> + '_ {
        (0..self.map.len())
            .filter_map(|i| self.split(i))
            .map(|(_, rest)| rest)
            .filter(|r| !r.is_empty())
    }

    #[must_use]
    pub fn consumed_frames(&self) -> u64 {
        self.consumed().map(|r| r.count).sum()
    }
}

impl FrameAlloc for RawFrameSource<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.allocate_page()
    }

    /// Raw frames cannot be returned; they stay consumed until the map is
    /// ingested.
    fn free_4k(&mut self, pa: PhysicalAddress) {
        log::warn!("raw frame source cannot take back {pa}");
    }
}
