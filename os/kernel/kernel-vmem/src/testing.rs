//! Host stand-ins for physical memory, used by this crate's tests and by the
//! tests of crates built on top of it (`test-support` feature).

extern crate std;

use crate::{FrameAlloc, PhysMapper};
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::vec::Vec;

/// A zeroed, page-aligned heap buffer playing the role of RAM.
///
/// Physical address `pa` is byte `pa` of the buffer, so frame 0 lives at
/// `PhysicalAddress(0)`.
pub struct TestPhys {
    base: NonNull<u8>,
    frames: usize,
}

impl TestPhys {
    /// # Panics
    /// If the host allocation fails.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let layout = Self::layout(frames);
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).expect("test RAM allocation failed");
        Self { base, frames }
    }

    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.frames as u64 * PAGE_SIZE
    }

    /// Copy of the frame at `pa`.
    #[must_use]
    pub fn read_frame(&self, pa: PhysicalAddress) -> [u8; 4096] {
        // SAFETY: bounds are checked by `phys_to_mut`.
        *unsafe { self.phys_to_mut::<[u8; 4096]>(pa) }
    }

    fn layout(frames: usize) -> Layout {
        Layout::from_size_align(frames.max(1) * PAGE_SIZE as usize, PAGE_SIZE as usize)
            .expect("test RAM layout")
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.frames)) };
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = pa.as_u64();
        assert!(
            offset + size_of::<T>() as u64 <= self.bytes(),
            "{pa} outside of test RAM"
        );
        // SAFETY: in bounds of the buffer; aliasing is the caller's problem.
        unsafe { &mut *self.base.as_ptr().add(offset as usize).cast::<T>() }
    }
}

/// Frame allocator over `[start, end)` that recycles freed frames first.
#[derive(Debug)]
pub struct BumpAlloc {
    next: u64,
    end: u64,
    freed: Vec<PhysicalAddress>,
    outstanding: usize,
}

impl BumpAlloc {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self {
            next: start.as_u64(),
            end: end.as_u64(),
            freed: Vec::new(),
            outstanding: 0,
        }
    }

    /// Frames handed out and not yet returned.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        let pa = if let Some(pa) = self.freed.pop() {
            pa
        } else if self.next + PAGE_SIZE <= self.end {
            let pa = PhysicalAddress::new(self.next);
            self.next += PAGE_SIZE;
            pa
        } else {
            return None;
        };
        self.outstanding += 1;
        Some(pa)
    }

    fn alloc_run(&mut self, max: usize) -> Option<(PhysicalAddress, usize)> {
        if !self.freed.is_empty() {
            return self.alloc_4k().map(|pa| (pa, 1));
        }
        let available = ((self.end - self.next) / PAGE_SIZE) as usize;
        let n = max.min(available);
        if n == 0 {
            return None;
        }
        let pa = PhysicalAddress::new(self.next);
        self.next += n as u64 * PAGE_SIZE;
        self.outstanding += n;
        Some((pa, n))
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        assert!(!self.freed.contains(&pa), "double free of {pa}");
        self.outstanding -= 1;
        self.freed.push(pa);
    }
}
