//! Virtual range reservation inside a fixed window.
//!
//! The manager only hands out address space; backing it with frames is the
//! caller's job. Free ranges live in a fixed-size array sorted by address so
//! it works before the heap exists (the heap itself reserves its window
//! here).

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up, is_aligned};

/// Free ranges tracked at most.
pub const MAX_FREE_RANGES: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressRangeError {
    #[error("no free range of {size:#x} bytes")]
    NoSpace { size: u64 },
    #[error("range {base} + {size:#x} lies outside the window")]
    OutOfWindow { base: VirtualAddress, size: u64 },
    #[error("range {base} + {size:#x} is not free")]
    NotFree { base: VirtualAddress, size: u64 },
    #[error("range {base} + {size:#x} overlaps a free range")]
    Overlap { base: VirtualAddress, size: u64 },
    #[error("too many free fragments")]
    TooFragmented,
    #[error("{0:#x} is not page aligned")]
    Unaligned(u64),
}

/// `[start, start + size)`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct VirtualRange {
    pub start: u64,
    pub size: u64,
}

impl VirtualRange {
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }

    #[must_use]
    pub const fn contains_range(&self, start: u64, size: u64) -> bool {
        start >= self.start && start + size <= self.end()
    }

    #[must_use]
    pub const fn overlaps(&self, start: u64, size: u64) -> bool {
        start < self.end() && self.start < start + size
    }
}

pub struct AddressRangeManager {
    window: VirtualRange,
    free: [VirtualRange; MAX_FREE_RANGES],
    len: usize,
}

impl AddressRangeManager {
    /// Manager over `[base, base + size)`, entirely free.
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        let window = VirtualRange::new(base.as_u64(), size);
        let mut free = [VirtualRange::new(0, 0); MAX_FREE_RANGES];
        free[0] = window;
        Self {
            window,
            free,
            len: if size == 0 { 0 } else { 1 },
        }
    }

    #[must_use]
    pub const fn window(&self) -> VirtualRange {
        self.window
    }

    fn ranges(&self) -> &[VirtualRange] {
        &self.free[..self.len]
    }

    fn check(&self, base: u64, size: u64) -> Result<(), AddressRangeError> {
        if !is_aligned(base, PAGE_SIZE) {
            return Err(AddressRangeError::Unaligned(base));
        }
        if size == 0 || !is_aligned(size, PAGE_SIZE) {
            return Err(AddressRangeError::Unaligned(size));
        }
        if base.checked_add(size).is_none() || !self.window.contains_range(base, size) {
            return Err(AddressRangeError::OutOfWindow {
                base: VirtualAddress::new(base),
                size,
            });
        }
        Ok(())
    }

    /// First free range that fits `size` bytes at `align`.
    ///
    /// # Errors
    /// [`AddressRangeError::NoSpace`], or `Unaligned` for sizes that are not
    /// whole pages.
    pub fn reserve(&mut self, size: u64, align: u64) -> Result<VirtualAddress, AddressRangeError> {
        let size = align_up(size, PAGE_SIZE);
        let align = align.max(PAGE_SIZE);
        if size == 0 {
            return Err(AddressRangeError::Unaligned(0));
        }
        let base = self
            .ranges()
            .iter()
            .find_map(|r| {
                let base = align_up(r.start, align);
                (base >= r.start && r.contains_range(base, size)).then_some(base)
            })
            .ok_or(AddressRangeError::NoSpace { size })?;
        self.cut(base, size)?;
        Ok(VirtualAddress::new(base))
    }

    /// Reserve exactly `[base, base + size)`.
    ///
    /// # Errors
    /// [`AddressRangeError::NotFree`] if any part is already reserved.
    pub fn reserve_at(&mut self, base: VirtualAddress, size: u64) -> Result<(), AddressRangeError> {
        let start = base.as_u64();
        self.check(start, size)?;
        if !self.ranges().iter().any(|r| r.contains_range(start, size)) {
            return Err(AddressRangeError::NotFree { base, size });
        }
        self.cut(start, size)
    }

    /// Remove `[base, base + size)` from the free range that contains it.
    fn cut(&mut self, base: u64, size: u64) -> Result<(), AddressRangeError> {
        let Some(i) = self.ranges().iter().position(|r| r.contains_range(base, size)) else {
            return Err(AddressRangeError::NotFree {
                base: VirtualAddress::new(base),
                size,
            });
        };
        let r = self.free[i];
        let head = VirtualRange::new(r.start, base - r.start);
        let tail = VirtualRange::new(base + size, r.end() - (base + size));
        match (head.size, tail.size) {
            (0, 0) => self.remove(i),
            (0, _) => self.free[i] = tail,
            (_, 0) => self.free[i] = head,
            (_, _) => {
                self.insert_at(i + 1, tail)?;
                self.free[i] = head;
            }
        }
        Ok(())
    }

    /// Give `[base, base + size)` back, merging with free neighbours.
    ///
    /// # Errors
    /// [`AddressRangeError::Overlap`] if part of the range is already free,
    /// [`AddressRangeError::TooFragmented`] if the range table is full.
    pub fn release(&mut self, base: VirtualAddress, size: u64) -> Result<(), AddressRangeError> {
        let start = base.as_u64();
        self.check(start, size)?;
        if self.ranges().iter().any(|r| r.overlaps(start, size)) {
            return Err(AddressRangeError::Overlap { base, size });
        }

        let i = self.ranges().partition_point(|r| r.start < start);
        let merge_prev = i > 0 && self.free[i - 1].end() == start;
        let merge_next = i < self.len && self.free[i].start == start + size;
        match (merge_prev, merge_next) {
            (true, true) => {
                self.free[i - 1].size += size + self.free[i].size;
                self.remove(i);
            }
            (true, false) => self.free[i - 1].size += size,
            (false, true) => {
                self.free[i].start = start;
                self.free[i].size += size;
            }
            (false, false) => self.insert_at(i, VirtualRange::new(start, size))?,
        }
        Ok(())
    }

    fn insert_at(&mut self, i: usize, range: VirtualRange) -> Result<(), AddressRangeError> {
        if self.len == MAX_FREE_RANGES {
            return Err(AddressRangeError::TooFragmented);
        }
        self.free.copy_within(i..self.len, i + 1);
        self.free[i] = range;
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, i: usize) {
        self.free.copy_within(i + 1..self.len, i);
        self.len -= 1;
    }

    /// Whether `addr` lies inside the managed window.
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        self.window.contains_range(addr.as_u64(), 1)
    }

    /// Whether `addr` is inside the window and currently reserved.
    #[must_use]
    pub fn is_reserved(&self, addr: VirtualAddress) -> bool {
        self.contains(addr) && !self.ranges().iter().any(|r| r.contains_range(addr.as_u64(), 1))
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.ranges().iter().map(|r| r.size).sum()
    }

    #[must_use]
    pub const fn free_ranges(&self) -> usize {
        self.len
    }
}
