//! # Kernel Memory Allocation
//!
//! Physical memory accounting, the boot-time memory setup, virtual range
//! reservation and the kernel heap.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  LockedHeap / KernelHeap                            │
//! │    • GlobalAlloc over a FreeListAllocator           │
//! │    • grows on demand through a HeapBacking          │
//! └──────────┬──────────────────────────┬───────────────┘
//!            │ window                   │ pages
//! ┌──────────▼─────────────┐ ┌──────────▼───────────────┐
//! │  AddressRangeManager   │ │  kernel-vmem AddressSpace│
//! │    • virtual windows   │ │    • tables from cache   │
//! └────────────────────────┘ └──────────┬───────────────┘
//!                                       │ frames
//! ┌─────────────────────────────────────▼───────────────┐
//! │  FrameAllocator                                     │
//! │    • sorted free/used block lists, eager merging    │
//! │    • seeded by bootstrap::ingest                    │
//! │  RawFrameSource (before the allocator exists)       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Boot order
//!
//! 1. A [`RawFrameSource`](raw::RawFrameSource) hands out single frames
//!    straight from the memory map while early tables are built.
//! 2. [`bootstrap::ingest`] moves the map into the
//!    [`FrameAllocator`](frame::FrameAllocator), keeping the frames the raw
//!    source already gave away.
//! 3. [`bootstrap::build_kernel_space`] builds the kernel tree; the kernel
//!    switches to it and then calls [`bootstrap::release_scratch`].
//! 4. The heap reserves its window and starts growing on first use.
//!
//! Nothing here allocates from the heap, so every piece works before the
//! heap exists.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_range;
pub mod bootstrap;
pub mod frame;
pub mod free_list;
pub mod heap;
pub mod phys_mapper;
pub mod raw;

pub use address_range::{AddressRangeError, AddressRangeManager};
pub use frame::{FrameAllocError, FrameAllocator, FrameBlock, FrameFlags};
pub use heap::{HeapBacking, HeapError, KernelHeap, LockedHeap};
pub use raw::RawFrameSource;
