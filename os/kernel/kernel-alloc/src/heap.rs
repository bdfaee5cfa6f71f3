//! # Kernel heap
//!
//! The heap owns a virtual window reserved from an
//! [`AddressRangeManager`]. Only the bottom of the window is backed by
//! frames; when the free list cannot satisfy a request the heap asks its
//! [`HeapBacking`] to map more pages directly above the mapped part and
//! feeds them to the [`FreeListAllocator`].
//!
//! ```text
//! start                 start + mapped                        end
//!   |==== mapped, managed by the free list ====|---- reserved ----|
//! ```

use crate::address_range::{AddressRangeError, AddressRangeManager};
use crate::free_list::FreeListAllocator;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, page_count};
use kernel_sync::SpinLock;
use kernel_vmem::MapError;
use log::{debug, error};

/// Smallest growth step, in pages.
pub const MIN_GROW_PAGES: u64 = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap not initialized")]
    NotInitialized,
    #[error("heap window exhausted, {requested} bytes requested")]
    Exhausted { requested: usize },
    #[error("mapping heap pages failed: {0}")]
    Backing(#[from] MapError),
    #[error("reserving the heap window failed: {0}")]
    Range(#[from] AddressRangeError),
}

/// Provides frames for freshly grown heap pages.
pub trait HeapBacking: Sync {
    /// Map `pages` writable kernel pages at `virt`.
    ///
    /// # Errors
    /// Whatever prevented the mapping.
    fn map_pages(&self, virt: VirtualAddress, pages: u64) -> Result<(), MapError>;
}

pub struct KernelHeap {
    start: u64,
    end: u64,
    mapped: u64,
    free: FreeListAllocator,
    backing: Option<&'static dyn HeapBacking>,
}

impl KernelHeap {
    /// A heap with no window; every allocation fails until
    /// [`init`](Self::init).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            start: 0,
            end: 0,
            mapped: 0,
            free: FreeListAllocator::new(),
            backing: None,
        }
    }

    /// Reserve a window of `max_bytes` and remember how to back it. No page
    /// is mapped yet.
    ///
    /// # Errors
    /// [`HeapError::Range`] when the window cannot be reserved.
    pub fn init(
        &mut self,
        ranges: &mut AddressRangeManager,
        max_bytes: u64,
        backing: &'static dyn HeapBacking,
    ) -> Result<(), HeapError> {
        let start = ranges.reserve(max_bytes, PAGE_SIZE)?;
        self.start = start.as_u64();
        self.end = self.start + page_count(max_bytes) * PAGE_SIZE;
        self.mapped = 0;
        self.backing = Some(backing);
        debug!("heap window {start} + {max_bytes:#x}");
        Ok(())
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.backing.is_some()
    }

    /// Bytes currently backed by frames.
    #[must_use]
    pub const fn mapped_bytes(&self) -> u64 {
        self.mapped
    }

    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free.free_bytes()
    }

    /// Map at least `bytes` more (and never fewer than
    /// [`MIN_GROW_PAGES`] pages) above the mapped part of the window.
    ///
    /// # Errors
    /// [`HeapError::Exhausted`] when the window is full, or the backing's
    /// error.
    #[allow(clippy::cast_possible_truncation)]
    pub fn grow(&mut self, bytes: usize) -> Result<u64, HeapError> {
        let backing = self.backing.ok_or(HeapError::NotInitialized)?;
        let available = (self.end - self.start - self.mapped) / PAGE_SIZE;
        let pages = page_count(bytes as u64).max(MIN_GROW_PAGES).min(available);
        if pages == 0 || pages * PAGE_SIZE < bytes as u64 {
            return Err(HeapError::Exhausted { requested: bytes });
        }

        let at = self.start + self.mapped;
        backing.map_pages(VirtualAddress::new(at), pages)?;
        // SAFETY: the pages were just mapped and nothing else uses them.
        unsafe { self.free.add_region(at as usize, (pages * PAGE_SIZE) as usize) };
        self.mapped += pages * PAGE_SIZE;
        debug!("heap grew by {pages} pages to {:#x} bytes", self.mapped);
        Ok(pages)
    }

    /// # Errors
    /// [`HeapError`] when neither the free list nor growing can satisfy
    /// the request.
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if let Some(ptr) = self.free.allocate(layout) {
            return Ok(ptr);
        }
        self.grow(layout.size() + layout.align())?;
        self.free.allocate(layout).ok_or(HeapError::Exhausted {
            requested: layout.size(),
        })
    }

    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) with `layout`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert!((self.start..self.start + self.mapped).contains(&(ptr.as_ptr() as u64)));
        // SAFETY: forwarded from the caller.
        unsafe { self.free.deallocate(ptr, layout) };
    }
}

/// The kernel heap behind a spin lock, usable as `#[global_allocator]`.
pub struct LockedHeap(SpinLock<KernelHeap>);

impl LockedHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self(SpinLock::new(KernelHeap::empty()))
    }

    /// # Errors
    /// See [`KernelHeap::init`].
    pub fn init(
        &self,
        ranges: &mut AddressRangeManager,
        max_bytes: u64,
        backing: &'static dyn HeapBacking,
    ) -> Result<(), HeapError> {
        self.0.with_lock(|heap| heap.init(ranges, max_bytes, backing))
    }

    pub fn with_lock<R>(&self, f: impl FnOnce(&mut KernelHeap) -> R) -> R {
        self.0.with_lock(f)
    }
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.0.lock().allocate(layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(e) => {
                error!("heap allocation of {} bytes failed: {e}", layout.size());
                null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: `GlobalAlloc` contract.
            unsafe { self.0.lock().deallocate(ptr, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PAGES: usize = 64;

    #[repr(C, align(4096))]
    struct Window([u8; PAGES * 4096]);

    /// Records the mapping requests; the host memory is already there.
    struct Recorder(Mutex<Vec<(u64, u64)>>);

    impl HeapBacking for Recorder {
        fn map_pages(&self, virt: VirtualAddress, pages: u64) -> Result<(), MapError> {
            self.0.lock().unwrap().push((virt.as_u64(), pages));
            Ok(())
        }
    }

    struct Failing;

    impl HeapBacking for Failing {
        fn map_pages(&self, _: VirtualAddress, _: u64) -> Result<(), MapError> {
            Err(MapError::OutOfMemory)
        }
    }

    fn window() -> (Box<Window>, AddressRangeManager) {
        let mut w = Box::new(Window([0; PAGES * 4096]));
        let base = VirtualAddress::new(w.0.as_mut_ptr() as u64);
        let ranges = AddressRangeManager::new(base, (PAGES * 4096) as u64);
        (w, ranges)
    }

    fn recorder() -> &'static Recorder {
        Box::leak(Box::new(Recorder(Mutex::new(Vec::new()))))
    }

    #[test]
    fn empty_heap_refuses() {
        let mut heap = KernelHeap::empty();
        assert_eq!(
            heap.allocate(Layout::new::<u64>()),
            Err(HeapError::NotInitialized)
        );
    }

    #[test]
    fn first_allocation_grows_by_minimum_step() {
        let (_w, mut ranges) = window();
        let backing = recorder();
        let mut heap = KernelHeap::empty();
        heap.init(&mut ranges, (PAGES * 4096) as u64, backing).unwrap();
        assert_eq!(heap.mapped_bytes(), 0);

        let p = heap.allocate(Layout::new::<[u64; 4]>()).unwrap();
        assert_eq!(heap.mapped_bytes(), MIN_GROW_PAGES * PAGE_SIZE);
        assert_eq!(backing.0.lock().unwrap().len(), 1);
        assert_eq!(p.as_ptr() as u64, ranges.window().start);

        unsafe { heap.deallocate(p, Layout::new::<[u64; 4]>()) };
        assert_eq!(heap.free_bytes() as u64, heap.mapped_bytes());
    }

    #[test]
    fn growth_is_contiguous_and_bounded() {
        let (_w, mut ranges) = window();
        let backing = recorder();
        let mut heap = KernelHeap::empty();
        heap.init(&mut ranges, (PAGES * 4096) as u64, backing).unwrap();

        let big = Layout::from_size_align(20 * 4096, 16).unwrap();
        heap.allocate(big).unwrap();
        heap.allocate(big).unwrap();
        let calls = backing.0.lock().unwrap().clone();
        assert!(calls.windows(2).all(|w| w[0].0 + w[0].1 * PAGE_SIZE == w[1].0));

        let huge = Layout::from_size_align(40 * 4096, 16).unwrap();
        assert!(matches!(heap.allocate(huge), Err(HeapError::Exhausted { .. })));
        assert!(heap.mapped_bytes() <= (PAGES * 4096) as u64);
    }

    #[test]
    fn backing_failure_is_reported() {
        let (_w, mut ranges) = window();
        static FAILING: Failing = Failing;
        let mut heap = KernelHeap::empty();
        heap.init(&mut ranges, 0x4000, &FAILING).unwrap();
        assert_eq!(
            heap.allocate(Layout::new::<u8>()),
            Err(HeapError::Backing(MapError::OutOfMemory))
        );
    }

    #[test]
    fn locked_heap_as_global_alloc() {
        let (_w, mut ranges) = window();
        let heap = LockedHeap::new();
        heap.init(&mut ranges, (PAGES * 4096) as u64, recorder()).unwrap();
        unsafe {
            let layout = Layout::from_size_align(128, 64).unwrap();
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            p.write_bytes(0xAB, 128);
            heap.dealloc(p, layout);
            assert!(heap.alloc(Layout::from_size_align(1 << 30, 16).unwrap()).is_null());
        }
    }
}
