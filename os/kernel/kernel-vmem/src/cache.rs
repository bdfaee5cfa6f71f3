use crate::{FrameAlloc, MapError, PhysMapper, zero_frame};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::{debug, trace};

/// Reserve of zeroed page-table pages.
///
/// The pages form an intrusive singly linked list: the first word of each
/// cached page holds the physical address of the next one (0 terminates).
/// [`take`](Self::take) clears that word again, so pages leave the cache
/// fully zeroed.
///
/// Only [`refill`](Self::refill) talks to the frame allocator. It is meant
/// to run from ordinary kernel context so that [`take`](Self::take) can be
/// used while handling a page fault.
#[derive(Debug)]
pub struct TableCache {
    head: Option<PhysicalAddress>,
    len: usize,
    watermark: usize,
}

impl TableCache {
    #[must_use]
    pub const fn new(watermark: usize) -> Self {
        Self {
            head: None,
            len: 0,
            watermark,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn watermark(&self) -> usize {
        self.watermark
    }

    #[must_use]
    pub const fn is_low(&self) -> bool {
        self.len < self.watermark
    }

    /// Top the cache up to the watermark.
    ///
    /// Frames are requested as one run; partial runs are accepted and the
    /// request repeated for the remainder. Returns how many pages were
    /// added.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the allocator runs dry. Pages obtained
    /// before that stay in the cache.
    pub fn refill<M: PhysMapper, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
    ) -> Result<usize, MapError> {
        let mut added = 0;
        while self.len < self.watermark {
            let (base, n) = alloc
                .alloc_run(self.watermark - self.len)
                .ok_or(MapError::OutOfMemory)?;
            for i in 0..n as u64 {
                self.give(mapper, base + i * PAGE_SIZE);
            }
            added += n;
        }
        if added > 0 {
            trace!("table cache refilled with {added} pages, now {}", self.len);
        }
        Ok(added)
    }

    /// Pop one zeroed page. Never allocates.
    ///
    /// # Errors
    /// [`MapError::CacheEmpty`] when no page is left.
    pub fn take<M: PhysMapper>(&mut self, mapper: &M) -> Result<PhysicalAddress, MapError> {
        let page = self.head.ok_or(MapError::CacheEmpty)?;
        // SAFETY: cached pages are owned by the cache.
        let link = unsafe { mapper.phys_to_mut::<u64>(page) };
        self.head = match *link {
            0 => None,
            next => Some(PhysicalAddress::new(next)),
        };
        *link = 0;
        self.len -= 1;
        Ok(page)
    }

    /// Zero `page` and keep it for later.
    pub fn give<M: PhysMapper>(&mut self, mapper: &M, page: PhysicalAddress) {
        debug_assert!(page.as_u64() % PAGE_SIZE == 0);
        debug_assert!(page.as_u64() != 0, "frame 0 terminates the list");
        // SAFETY: the caller hands over ownership of the page.
        unsafe {
            zero_frame(mapper, page);
            *mapper.phys_to_mut::<u64>(page) = self.head.map_or(0, PhysicalAddress::as_u64);
        }
        self.head = Some(page);
        self.len += 1;
    }

    /// Return pages above `keep` to the allocator.
    pub fn trim<M: PhysMapper, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        alloc: &mut A,
        keep: usize,
    ) -> usize {
        let mut released = 0;
        while self.len > keep {
            let Ok(page) = self.take(mapper) else { break };
            alloc.free_4k(page);
            released += 1;
        }
        released
    }

    /// Log the cached pages.
    pub fn dump<M: PhysMapper>(&self, mapper: &M) {
        debug!("table cache: {} pages (watermark {})", self.len, self.watermark);
        let mut cur = self.head;
        while let Some(page) = cur {
            debug!("  {page}");
            // SAFETY: cached pages are owned by the cache.
            let next = unsafe { *mapper.phys_to_mut::<u64>(page) };
            cur = (next != 0).then(|| PhysicalAddress::new(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpAlloc, TestPhys};

    #[test]
    fn refill_reaches_watermark_in_one_run() {
        let phys = TestPhys::new(64);
        let mut alloc = BumpAlloc::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(64 * 4096));
        let mut cache = TableCache::new(16);
        assert!(cache.is_low());
        assert_eq!(cache.refill(&phys, &mut alloc).unwrap(), 16);
        assert_eq!(cache.len(), 16);
        assert_eq!(alloc.outstanding(), 16);
        assert_eq!(cache.refill(&phys, &mut alloc).unwrap(), 0);
    }

    #[test]
    fn take_never_allocates() {
        let phys = TestPhys::new(4);
        let mut cache = TableCache::new(16);
        assert_eq!(cache.take(&phys), Err(MapError::CacheEmpty));
    }

    #[test]
    fn pages_leave_zeroed() {
        let phys = TestPhys::new(8);
        let dirty = PhysicalAddress::new(0x3000);
        unsafe { phys.phys_to_mut::<[u8; 4096]>(dirty) }.fill(0xAA);

        let mut cache = TableCache::new(2);
        cache.give(&phys, PhysicalAddress::new(0x2000));
        cache.give(&phys, dirty);
        assert_eq!(cache.len(), 2);

        let first = cache.take(&phys).unwrap();
        assert_eq!(first, dirty);
        assert!(phys.read_frame(first).iter().all(|&b| b == 0));
        let second = cache.take(&phys).unwrap();
        assert_eq!(second, PhysicalAddress::new(0x2000));
        assert!(phys.read_frame(second).iter().all(|&b| b == 0));
        assert!(cache.is_empty());
    }

    #[test]
    fn refill_fails_when_allocator_is_dry() {
        let phys = TestPhys::new(8);
        let mut alloc = BumpAlloc::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x4000));
        let mut cache = TableCache::new(16);
        assert_eq!(cache.refill(&phys, &mut alloc), Err(MapError::OutOfMemory));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn trim_returns_excess() {
        let phys = TestPhys::new(32);
        let mut alloc = BumpAlloc::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(32 * 4096));
        let mut cache = TableCache::new(8);
        cache.refill(&phys, &mut alloc).unwrap();
        assert_eq!(cache.trim(&phys, &mut alloc, 5), 3);
        assert_eq!(cache.len(), 5);
        assert_eq!(alloc.outstanding(), 5);
    }
}
