//! # Physical Frame Allocator
//!
//! Physical memory is tracked as runs of contiguous frames ("blocks") in two
//! address-sorted lists: free and used. Neighbouring blocks with equal flags
//! are merged as soon as they touch, so each list stays as short as the
//! memory map allows.
//!
//! Block descriptors live in a fixed [`BlockSlab`] embedded in the
//! allocator. No heap is required, which lets the allocator run before the
//! kernel heap exists; descriptors freed by merging go back to the slab.
//!
//! ```text
//!  free: [0x0010_0000 x 240] -> [0x0100_0000 x 32000] -> ...
//!  used: [0x0000_1000 x 15 kernel] -> [0x00f0_0000 x 2 acpi] -> ...
//! ```
//!
//! [`FrameAllocator::allocate`] always serves the lowest free block and
//! takes frames from its top end, so the block's start (and its descriptor)
//! stays put.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_vmem::FrameAlloc;
use log::{error, info};

/// Descriptors available to one allocator.
pub const MAX_BLOCKS: usize = 1024;

/// Attributes of a run of frames.
///
/// Bit positions are stable; the `map_*` group says how the kernel expects
/// the frames to be mapped.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FrameFlags {
    /// Memory-mapped device registers.
    pub mmio: bool,
    /// Persistent memory.
    pub nonvolatile: bool,
    #[bits(3)]
    __: u8,
    /// Queued for release once no longer referenced.
    pub pending_free: bool,
    /// ACPI tables; reclaimable after the tables are parsed.
    pub acpi_wait: bool,
    /// Never returned to the free list.
    pub permanent: bool,
    /// Mapped at the identical virtual address.
    pub map_ident: bool,
    /// Mapped into the kernel image window.
    pub map_kernel: bool,
    /// Mapped through the physical offset window.
    pub map_offset: bool,
    #[bits(21)]
    __: u32,
}

impl FrameFlags {
    /// The `map_*` bits.
    pub const MAP_MASK: u32 = 0x700;

    #[must_use]
    pub const fn map_bits(self) -> u32 {
        self.into_bits() & Self::MAP_MASK
    }
}

/// Failures of the frame allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("no free block can hold {requested} frames")]
    OutOfMemory { requested: usize },
    #[error("{0} is not frame aligned")]
    Unaligned(PhysicalAddress),
    #[error("{address} x {count} overlaps free memory")]
    Overlap { address: PhysicalAddress, count: u64 },
    #[error("block descriptors exhausted")]
    SlabExhausted,
}

/// A run of `count` frames starting at `address`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameBlock {
    pub address: PhysicalAddress,
    pub count: u64,
    pub flags: FrameFlags,
}

impl FrameBlock {
    #[must_use]
    pub const fn new(address: PhysicalAddress, count: u64, flags: FrameFlags) -> Self {
        Self {
            address,
            count,
            flags,
        }
    }

    /// First address past the block.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.address.as_u64() + self.count * PAGE_SIZE)
    }

    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.address.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    /// `other` starts exactly where `self` ends.
    #[must_use]
    pub const fn is_adjacent_to(&self, other: &Self) -> bool {
        self.end().as_u64() == other.address.as_u64()
    }

    #[must_use]
    pub fn can_merge(&self, other: &Self) -> bool {
        self.is_adjacent_to(other) && self.flags == other.flags
    }

    #[must_use]
    pub const fn overlaps(&self, address: PhysicalAddress, count: u64) -> bool {
        let start = address.as_u64();
        let end = start + count * PAGE_SIZE;
        start < self.end().as_u64() && self.address.as_u64() < end
    }
}

impl fmt::Debug for FrameBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} x {} flags {:#x}]",
            self.address,
            self.count,
            self.flags.into_bits()
        )
    }
}

type Link = Option<u16>;

#[derive(Copy, Clone)]
struct Node {
    block: FrameBlock,
    next: Link,
}

const EMPTY_NODE: Node = Node {
    block: FrameBlock::new(PhysicalAddress::zero(), 0, FrameFlags::new()),
    next: None,
};

/// Fixed pool of block descriptors, linked by index.
pub struct BlockSlab {
    nodes: [Node; MAX_BLOCKS],
    /// Never-used nodes start here.
    fresh: usize,
    /// Recycled nodes.
    recycled: Link,
    in_use: usize,
}

impl BlockSlab {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: [EMPTY_NODE; MAX_BLOCKS],
            fresh: 0,
            recycled: None,
            in_use: 0,
        }
    }

    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub const fn available(&self) -> usize {
        MAX_BLOCKS - self.in_use
    }

    #[allow(clippy::cast_possible_truncation)]
    fn alloc(&mut self, block: FrameBlock) -> Result<u16, FrameAllocError> {
        let index = if let Some(i) = self.recycled {
            self.recycled = self.nodes[i as usize].next;
            i
        } else if self.fresh < MAX_BLOCKS {
            self.fresh += 1;
            (self.fresh - 1) as u16
        } else {
            return Err(FrameAllocError::SlabExhausted);
        };
        self.nodes[index as usize] = Node { block, next: None };
        self.in_use += 1;
        Ok(index)
    }

    fn release(&mut self, index: u16) {
        self.nodes[index as usize] = Node {
            next: self.recycled,
            ..EMPTY_NODE
        };
        self.recycled = Some(index);
        self.in_use -= 1;
    }

    fn block(&self, index: u16) -> &FrameBlock {
        &self.nodes[index as usize].block
    }

    fn block_mut(&mut self, index: u16) -> &mut FrameBlock {
        &mut self.nodes[index as usize].block
    }

    fn next(&self, index: u16) -> Link {
        self.nodes[index as usize].next
    }

    fn set_next(&mut self, index: u16, next: Link) {
        self.nodes[index as usize].next = next;
    }
}

impl Default for BlockSlab {
    fn default() -> Self {
        Self::new()
    }
}

/// Which of the two lists an operation works on.
#[derive(Copy, Clone)]
enum List {
    Free,
    Used,
}

/// The physical frame allocator. Use it behind a
/// [`SpinLock`](kernel_sync::SpinLock) once more than one context can reach
/// it.
pub struct FrameAllocator {
    slab: BlockSlab,
    free: Link,
    used: Link,
}

impl FrameAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slab: BlockSlab::new(),
            free: None,
            used: None,
        }
    }

    fn head(&self, list: List) -> Link {
        match list {
            List::Free => self.free,
            List::Used => self.used,
        }
    }

    fn set_head(&mut self, list: List, link: Link) {
        match list {
            List::Free => self.free = link,
            List::Used => self.used = link,
        }
    }

    /// Take frames from the lowest free block.
    ///
    /// If the block holds no more than `count` frames it is taken whole and
    /// its size is returned. Otherwise the block shrinks by `count` from its
    /// top and exactly `count` frames are returned.
    ///
    /// # Panics
    /// When no free memory is left. Running out of physical memory is not
    /// recoverable for the kernel.
    pub fn allocate(&mut self, count: usize) -> (PhysicalAddress, usize) {
        match self.try_allocate(count) {
            Ok(run) => run,
            Err(e) => panic!("out of physical memory: {e}"),
        }
    }

    /// [`allocate`](Self::allocate) that reports exhaustion instead of
    /// panicking.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if the free list is empty,
    /// [`FrameAllocError::SlabExhausted`] if the allocation cannot be
    /// recorded.
    #[allow(clippy::cast_possible_truncation)]
    pub fn try_allocate(&mut self, count: usize) -> Result<(PhysicalAddress, usize), FrameAllocError> {
        let count = count.max(1);
        let first = self.free.ok_or(FrameAllocError::OutOfMemory { requested: count })?;
        let taken = self.take_from(None, first, count as u64)?;
        Ok((taken.address, taken.count as usize))
    }

    /// Exactly `count` contiguous frames from the first block big enough.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] when no single block is large enough.
    pub fn allocate_exact(&mut self, count: usize) -> Result<PhysicalAddress, FrameAllocError> {
        let count = count.max(1);
        let mut prev = None;
        let mut cur = self.free;
        while let Some(i) = cur {
            if self.slab.block(i).count >= count as u64 {
                return Ok(self.take_from(prev, i, count as u64)?.address);
            }
            prev = cur;
            cur = self.slab.next(i);
        }
        Err(FrameAllocError::OutOfMemory { requested: count })
    }

    /// Cut up to `count` frames from free block `index` and record them as
    /// used.
    fn take_from(&mut self, prev: Link, index: u16, count: u64) -> Result<FrameBlock, FrameAllocError> {
        let block = *self.slab.block(index);
        if count >= block.count {
            self.unlink(List::Free, prev, index);
            self.slab.release(index);
            self.insert(List::Used, block)?;
            return Ok(block);
        }

        let remaining = block.count - count;
        let taken = FrameBlock::new(
            block.address + remaining * PAGE_SIZE,
            count,
            FrameFlags::new(),
        );
        self.insert(List::Used, taken)?;
        self.slab.block_mut(index).count = remaining;
        Ok(taken)
    }

    /// Return `count` frames at `address` to the free list.
    ///
    /// Any part of the range recorded as used is dropped from the used list
    /// first. The range is then inserted in address order and merged with
    /// the following and the preceding free block.
    ///
    /// # Errors
    /// [`FrameAllocError::Unaligned`], [`FrameAllocError::Overlap`] if
    /// any frame of the range is already free (double free), or
    /// [`FrameAllocError::SlabExhausted`] before anything is changed.
    pub fn free(&mut self, address: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        if address.as_u64() % PAGE_SIZE != 0 {
            return Err(FrameAllocError::Unaligned(address));
        }
        if count == 0 {
            return Ok(());
        }
        if self.overlaps(List::Free, address, count) {
            return Err(FrameAllocError::Overlap { address, count });
        }
        let block = FrameBlock::new(address, count, FrameFlags::new());
        let needed = usize::from(self.splits(List::Used, address, count))
            + usize::from(!self.merges_into(List::Free, &block));
        if self.slab.available() < needed {
            return Err(FrameAllocError::SlabExhausted);
        }
        self.carve(List::Used, address, count)?;
        self.insert(List::Free, block)
    }

    /// Record reserved memory that must never be handed out.
    ///
    /// # Errors
    /// [`FrameAllocError::Overlap`] if part of the range is free, or
    /// [`FrameAllocError::SlabExhausted`] before anything is changed.
    pub fn mark_used(
        &mut self,
        address: PhysicalAddress,
        count: u64,
        flags: FrameFlags,
    ) -> Result<(), FrameAllocError> {
        if address.as_u64() % PAGE_SIZE != 0 {
            return Err(FrameAllocError::Unaligned(address));
        }
        if count == 0 {
            return Ok(());
        }
        if self.overlaps(List::Free, address, count) {
            return Err(FrameAllocError::Overlap { address, count });
        }
        // The carved list is the one inserted into, so count the insert
        // as needing its own descriptor.
        if self.slab.available() < usize::from(self.splits(List::Used, address, count)) + 1 {
            return Err(FrameAllocError::SlabExhausted);
        }
        self.carve(List::Used, address, count)?;
        self.insert(List::Used, FrameBlock::new(address, count, flags))
    }

    fn overlaps(&self, list: List, address: PhysicalAddress, count: u64) -> bool {
        self.iter(list).any(|b| b.overlaps(address, count))
    }

    /// Whether carving the range out of `list` splits a block in two.
    fn splits(&self, list: List, address: PhysicalAddress, count: u64) -> bool {
        let end = address.as_u64() + count * PAGE_SIZE;
        self.iter(list).any(|b| b.address < address && b.end().as_u64() > end)
    }

    /// Whether `block` would grow a neighbour in `list` instead of taking a
    /// descriptor.
    fn merges_into(&self, list: List, block: &FrameBlock) -> bool {
        self.iter(list).any(|b| b.can_merge(block) || block.can_merge(&b))
    }

    /// Remove `[address, address + count)` from `list`, splitting blocks
    /// that straddle the range boundaries.
    fn carve(&mut self, list: List, address: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        let start = address.as_u64();
        let end = start + count * PAGE_SIZE;

        let mut prev = None;
        let mut cur = self.head(list);
        while let Some(i) = cur {
            let block = *self.slab.block(i);
            let next = self.slab.next(i);
            if block.address.as_u64() >= end {
                break;
            }
            if !block.overlaps(address, count) {
                prev = cur;
                cur = next;
                continue;
            }

            let b_start = block.address.as_u64();
            let b_end = block.end().as_u64();
            let head = start.saturating_sub(b_start) / PAGE_SIZE;
            let tail = b_end.saturating_sub(end) / PAGE_SIZE;

            match (head, tail) {
                (0, 0) => {
                    self.unlink(list, prev, i);
                    self.slab.release(i);
                    cur = next;
                    continue;
                }
                (0, _) => {
                    let b = self.slab.block_mut(i);
                    b.address = PhysicalAddress::new(end);
                    b.count = tail;
                }
                (_, 0) => self.slab.block_mut(i).count = head,
                (_, _) => {
                    let rest = FrameBlock::new(PhysicalAddress::new(end), tail, block.flags);
                    let j = self.slab.alloc(rest)?;
                    self.slab.block_mut(i).count = head;
                    self.slab.set_next(j, next);
                    self.slab.set_next(i, Some(j));
                    return Ok(());
                }
            }
            prev = cur;
            cur = self.slab.next(i);
        }
        Ok(())
    }

    fn unlink(&mut self, list: List, prev: Link, index: u16) {
        let next = self.slab.next(index);
        match prev {
            None => self.set_head(list, next),
            Some(p) => self.slab.set_next(p, next),
        }
    }

    /// Sorted insert, then merge with the next and the previous block.
    fn insert(&mut self, list: List, block: FrameBlock) -> Result<(), FrameAllocError> {
        let mut prev = None;
        let mut cur = self.head(list);
        while let Some(i) = cur {
            if self.slab.block(i).address > block.address {
                break;
            }
            prev = cur;
            cur = self.slab.next(i);
        }

        // Grow a neighbour in place where possible so no descriptor is needed.
        if let Some(n) = cur
            && block.can_merge(self.slab.block(n))
        {
            let nb = self.slab.block_mut(n);
            nb.address = block.address;
            nb.count += block.count;
            self.merge_prev(list, prev, n);
            return Ok(());
        }
        if let Some(p) = prev
            && self.slab.block(p).can_merge(&block)
        {
            self.slab.block_mut(p).count += block.count;
            return Ok(());
        }

        let node = self.slab.alloc(block)?;
        self.slab.set_next(node, cur);
        match prev {
            None => self.set_head(list, Some(node)),
            Some(p) => self.slab.set_next(p, Some(node)),
        }
        Ok(())
    }

    /// Fold `index` into `prev` if the two touch.
    fn merge_prev(&mut self, list: List, prev: Link, index: u16) {
        let Some(p) = prev else { return };
        let block = *self.slab.block(index);
        if self.slab.block(p).can_merge(&block) {
            self.slab.block_mut(p).count += block.count;
            self.unlink(list, prev, index);
            self.slab.release(index);
        }
    }

    /// Merge every pair of mergeable neighbours in both lists. Returns the
    /// number of descriptors reclaimed.
    pub fn consolidate(&mut self) -> usize {
        let mut reclaimed = 0;
        for list in [List::Free, List::Used] {
            let mut cur = self.head(list);
            while let Some(i) = cur {
                match self.slab.next(i) {
                    Some(n) if self.slab.block(i).can_merge(self.slab.block(n)) => {
                        let extra = self.slab.block(n).count;
                        self.slab.block_mut(i).count += extra;
                        self.unlink(list, Some(i), n);
                        self.slab.release(n);
                        reclaimed += 1;
                    }
                    next => cur = next,
                }
            }
        }
        reclaimed
    }

    fn iter(&self, list: List) -> impl Iterator<Item = FrameBlock> + '_ {
        let mut cur = self.head(list);
        core::iter::from_fn(move || {
            let i = cur?;
            cur = self.slab.next(i);
            Some(*self.slab.block(i))
        })
    }

    pub fn free_iter(&self) -> impl Iterator<Item = FrameBlock> + '_ {
        self.iter(List::Free)
    }

    pub fn used_iter(&self) -> impl Iterator<Item = FrameBlock> + '_ {
        self.iter(List::Used)
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.free_iter().map(|b| b.count).sum()
    }

    #[must_use]
    pub fn used_frames(&self) -> u64 {
        self.used_iter().map(|b| b.count).sum()
    }

    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.free_iter().count()
    }

    #[must_use]
    pub const fn descriptors_in_use(&self) -> usize {
        self.slab.in_use()
    }

    /// Log both lists.
    pub fn dump(&self) {
        info!(
            "frames: {} free in {} blocks, {} used",
            self.free_frames(),
            self.free_blocks(),
            self.used_frames()
        );
        for b in self.free_iter() {
            log::debug!("  free {b:?}");
        }
        for b in self.used_iter() {
            log::debug!("  used {b:?}");
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAlloc for FrameAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.try_allocate(1).ok().map(|(pa, _)| pa)
    }

    fn alloc_run(&mut self, max: usize) -> Option<(PhysicalAddress, usize)> {
        self.try_allocate(max).ok()
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        if let Err(e) = self.free(pa, 1) {
            error!("free of frame {pa} failed: {e}");
        }
    }
}
