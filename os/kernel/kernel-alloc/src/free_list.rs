use core::alloc::Layout;
use core::ptr::{self, NonNull, null_mut};

/// Granularity of every block; also the smallest block.
pub const MIN_BLOCK: usize = 16;

/// Node stored at the beginning of every **free** block.
///
/// ```text
/// +-----------+-----------+------------------------+
/// | size      | next      |  unused                |
/// +-----------+-----------+------------------------+
/// ^ block                                          ^ block + size
/// ```
///
/// `size` covers the whole block. Allocated blocks carry no header; the
/// caller's [`Layout`] tells [`FreeListAllocator::deallocate`] how large
/// they are.
#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

/// Bytes a request of `layout` occupies.
const fn block_size(layout: Layout) -> usize {
    round_up(if layout.size() == 0 { 1 } else { layout.size() }, MIN_BLOCK)
}

/// First-fit free list with splitting and coalescing.
///
/// # Invariants
/// - Free blocks are sorted by address, non-overlapping and never adjacent
///   (adjacent blocks are merged on insertion).
/// - Every block start and size is a multiple of [`MIN_BLOCK`].
/// - `head` is a sentinel; the first real block is at `head.next`.
pub struct FreeListAllocator {
    head: FreeBlock,
    free: usize,
}

// SAFETY: the allocator owns the memory it points into and is only used
// behind a lock.
unsafe impl Send for FreeListAllocator {}

impl FreeListAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: FreeBlock {
                size: 0,
                next: null_mut(),
            },
            free: 0,
        }
    }

    /// Hand `[start, start + size)` to the allocator. The range is trimmed
    /// to [`MIN_BLOCK`] boundaries.
    ///
    /// # Safety
    /// The range must be valid, writable, unused and exclusively owned by
    /// the allocator from now on.
    pub unsafe fn add_region(&mut self, start: usize, size: usize) {
        let begin = round_up(start, MIN_BLOCK);
        let end = (start + size) & !(MIN_BLOCK - 1);
        if end > begin {
            // SAFETY: forwarded from the caller.
            unsafe { self.insert(begin, end - begin) };
        }
    }

    /// Sorted insert of a free block, merged with its neighbours.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be owned by the allocator and not already
    /// free.
    unsafe fn insert(&mut self, addr: usize, size: usize) {
        debug_assert!(addr % MIN_BLOCK == 0 && size % MIN_BLOCK == 0 && size > 0);
        let mut prev = &raw mut self.head;
        // SAFETY: every node reached is a live free block.
        unsafe {
            let mut current = (*prev).next;
            while !current.is_null() && (current as usize) < addr {
                prev = current;
                current = (*current).next;
            }

            let new = addr as *mut FreeBlock;
            ptr::write(new, FreeBlock { size, next: current });
            (*prev).next = new;

            // Merge with the following block.
            if !current.is_null() && addr + size == current as usize {
                (*new).size += (*current).size;
                (*new).next = (*current).next;
            }
            // Merge into the preceding block (the sentinel has no memory).
            if !ptr::eq(prev, &raw const self.head) && prev as usize + (*prev).size == addr {
                (*prev).size += (*new).size;
                (*prev).next = (*new).next;
            }
        }
        self.free += size;
    }

    /// First block that can hold `layout`, or `None`.
    ///
    /// The chosen block is split; the unused head (from alignment) and tail
    /// go back to the list.
    pub fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let size = block_size(layout);
        let align = layout.align().max(MIN_BLOCK);

        let mut prev = &raw mut self.head;
        // SAFETY: every node reached is a live free block; split remainders
        // stay within the chosen block.
        unsafe {
            let mut current = (*prev).next;
            while !current.is_null() {
                let start = current as usize;
                let end = start + (*current).size;
                let alloc_start = round_up(start, align);
                let alloc_end = alloc_start.saturating_add(size);
                if alloc_end <= end {
                    (*prev).next = (*current).next;
                    self.free -= end - start;

                    if alloc_start > start {
                        self.insert(start, alloc_start - start);
                    }
                    if end > alloc_end {
                        self.insert(alloc_end, end - alloc_end);
                    }
                    return NonNull::new(alloc_start as *mut u8);
                }
                prev = current;
                current = (*current).next;
            }
        }
        None
    }

    /// Return a block to the list.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator
    /// with the same `layout`, and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded from the caller.
        unsafe { self.insert(ptr.as_ptr() as usize, block_size(layout)) };
    }

    /// Bytes currently free.
    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free
    }

    /// Size of the largest free block.
    #[must_use]
    pub fn largest_block(&self) -> usize {
        self.blocks().map(|(_, size)| size).max().unwrap_or(0)
    }

    /// `(address, size)` of each free block, in address order.
    pub fn blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut current = self.head.next.cast_const();
        core::iter::from_fn(move || {
            if current.is_null() {
                return None;
            }
            // SAFETY: nodes in the list are live free blocks.
            let block = unsafe { &*current };
            let item = (current as usize, block.size);
            current = block.next;
            Some(item)
        })
    }
}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new()
    }
}
