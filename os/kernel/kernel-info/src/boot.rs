//! # Kernel Boot Arguments

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Kernel function pointer.
///
/// # ABI
/// The ABI is defined as `win64` since the kernel is called from a UEFI
/// (PE/COFF) application.
pub type KernelEntryFn = extern "win64" fn(*const KernelArgs) -> !;

/// Identifies a [`KernelArgs`] block in memory.
pub const KERNEL_ARGS_MAGIC: u64 = 0x6b65_726e_6172_6773; // "kernargs"

/// Layout version of [`KernelArgs`].
pub const KERNEL_ARGS_VERSION: u32 = 1;

/// What a range of physical memory is used for.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    /// Usable RAM, handed to the frame allocator.
    Free = 0,
    /// Must stay mapped for UEFI runtime services.
    UefiRuntime = 1,
    /// ACPI tables; reclaimable once parsed.
    Acpi = 2,
    /// Device memory.
    Mmio = 3,
    /// Non-volatile RAM.
    Persistent = 4,
    /// This argument block and the memory map itself.
    Args = 5,
    /// A loaded module image.
    Module = 6,
    /// The kernel image.
    Kernel = 7,
    /// Page tables built by the loader.
    Table = 8,
}

/// One run of physical frames of the same [`MemoryKind`].
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub start: PhysicalAddress,
    pub frame_count: u64,
    pub kind: MemoryKind,
    /// Firmware attribute bits (cacheability, runtime flags).
    pub attributes: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(start: PhysicalAddress, frame_count: u64, kind: MemoryKind) -> Self {
        Self {
            start,
            frame_count,
            kind,
            attributes: 0,
        }
    }

    /// One past the last byte of this entry.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.frame_count * crate::memory::PAGE_SIZE)
    }

    /// `next` directly follows `self` and describes the same kind of memory.
    #[must_use]
    pub fn can_merge(&self, next: &Self) -> bool {
        self.kind == next.kind
            && self.attributes == next.attributes
            && self.end() == next.start
    }
}

/// What a loaded module contains.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ModuleKind {
    Kernel = 0,
    Program = 1,
    Initrd = 2,
    Data = 3,
}

/// A file the loader placed in physical memory.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Module {
    pub start: PhysicalAddress,
    pub length: u64,
    pub kind: ModuleKind,
    /// Virtual base the module must be mapped at, or zero for "anywhere".
    pub virt: VirtualAddress,
}

/// Scratch pages the loader used for the bootstrap page tables.
///
/// The first `used` of `count` pages hold live tables; the rest can be
/// handed to the kernel's table cache or back to the frame allocator.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PageTableArea {
    pub phys: PhysicalAddress,
    pub virt: VirtualAddress,
    pub count: u64,
    pub used: u64,
}

/// Information the kernel needs right after `ExitBootServices`.
/// Keep this `#[repr(C)]` and prefer fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct KernelArgs {
    pub magic: u64,
    pub version: u32,
    pub memory_map: *const MemoryMapEntry,
    pub memory_map_len: u64,
    pub modules: *const Module,
    pub modules_len: u64,
    pub page_tables: PageTableArea,
    /// PML4 the loader activated before jumping to the kernel.
    pub root_table: PhysicalAddress,
}

/// Why a [`KernelArgs`] block was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootArgsError {
    #[error("boot argument magic mismatch")]
    BadMagic,
    #[error("unsupported boot argument version {0}")]
    BadVersion(u32),
    #[error("memory map is missing")]
    NoMemoryMap,
    #[error("root page table {0} is not page aligned")]
    UnalignedRoot(PhysicalAddress),
    #[error("memory map buffer is full")]
    MapFull,
}

impl KernelArgs {
    /// Check the header before any pointer in it is trusted.
    ///
    /// # Errors
    /// Any [`BootArgsError`] except [`BootArgsError::MapFull`].
    pub fn validate(&self) -> Result<(), BootArgsError> {
        if self.magic != KERNEL_ARGS_MAGIC {
            return Err(BootArgsError::BadMagic);
        }
        if self.version != KERNEL_ARGS_VERSION {
            return Err(BootArgsError::BadVersion(self.version));
        }
        if self.memory_map.is_null() || self.memory_map_len == 0 {
            return Err(BootArgsError::NoMemoryMap);
        }
        if self.root_table.as_u64() & (crate::memory::PAGE_SIZE - 1) != 0 {
            return Err(BootArgsError::UnalignedRoot(self.root_table));
        }
        Ok(())
    }

    /// The physical memory map.
    ///
    /// # Safety
    /// `memory_map` must point to `memory_map_len` valid entries that outlive
    /// `self`, as established by [`validate`](Self::validate) and the loader.
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    #[must_use]
    pub unsafe fn memory_map(&self) -> &[MemoryMapEntry] {
        unsafe { core::slice::from_raw_parts(self.memory_map, self.memory_map_len as usize) }
    }

    /// The loaded modules.
    ///
    /// # Safety
    /// Same requirements as [`memory_map`](Self::memory_map) for `modules`.
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    #[must_use]
    pub unsafe fn modules(&self) -> &[Module] {
        if self.modules.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.modules, self.modules_len as usize) }
    }
}

/// Builds a memory map into a fixed buffer, extending the previous entry
/// whenever the new one continues it.
pub struct MemoryMapWriter<'a> {
    entries: &'a mut [MemoryMapEntry],
    len: usize,
}

impl<'a> MemoryMapWriter<'a> {
    pub const fn new(entries: &'a mut [MemoryMapEntry]) -> Self {
        Self { entries, len: 0 }
    }

    /// Append `entry`, or grow the last entry if the two can merge.
    ///
    /// # Errors
    /// [`BootArgsError::MapFull`] when the buffer has no room left.
    pub fn push_or_merge(&mut self, entry: MemoryMapEntry) -> Result<(), BootArgsError> {
        if entry.frame_count == 0 {
            return Ok(());
        }
        if let Some(last) = self.len.checked_sub(1).map(|i| &mut self.entries[i])
            && last.can_merge(&entry)
        {
            last.frame_count += entry.frame_count;
            return Ok(());
        }
        let slot = self
            .entries
            .get_mut(self.len)
            .ok_or(BootArgsError::MapFull)?;
        *slot = entry;
        self.len += 1;
        Ok(())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.len]
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: MemoryMapEntry = MemoryMapEntry::new(PhysicalAddress::zero(), 0, MemoryKind::Free);

    #[test]
    fn adjacent_entries_merge() {
        let mut buf = [EMPTY; 4];
        let mut map = MemoryMapWriter::new(&mut buf);
        map.push_or_merge(MemoryMapEntry::new(PhysicalAddress::new(0x1000), 2, MemoryKind::Free))
            .unwrap();
        map.push_or_merge(MemoryMapEntry::new(PhysicalAddress::new(0x3000), 3, MemoryKind::Free))
            .unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.as_slice()[0].frame_count, 5);
    }

    #[test]
    fn kind_or_gap_prevents_merge() {
        let mut buf = [EMPTY; 4];
        let mut map = MemoryMapWriter::new(&mut buf);
        map.push_or_merge(MemoryMapEntry::new(PhysicalAddress::new(0x1000), 1, MemoryKind::Free))
            .unwrap();
        map.push_or_merge(MemoryMapEntry::new(PhysicalAddress::new(0x2000), 1, MemoryKind::Acpi))
            .unwrap();
        map.push_or_merge(MemoryMapEntry::new(PhysicalAddress::new(0x5000), 1, MemoryKind::Acpi))
            .unwrap();
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn full_buffer_is_reported() {
        let mut buf = [EMPTY; 1];
        let mut map = MemoryMapWriter::new(&mut buf);
        map.push_or_merge(MemoryMapEntry::new(PhysicalAddress::new(0x1000), 1, MemoryKind::Free))
            .unwrap();
        let err = map
            .push_or_merge(MemoryMapEntry::new(PhysicalAddress::new(0x9000), 1, MemoryKind::Free))
            .unwrap_err();
        assert_eq!(err, BootArgsError::MapFull);
    }

    #[test]
    fn validate_checks_header() {
        let entries = [MemoryMapEntry::new(PhysicalAddress::new(0), 16, MemoryKind::Free)];
        let mut args = KernelArgs {
            magic: KERNEL_ARGS_MAGIC,
            version: KERNEL_ARGS_VERSION,
            memory_map: entries.as_ptr(),
            memory_map_len: 1,
            modules: core::ptr::null(),
            modules_len: 0,
            page_tables: PageTableArea {
                phys: PhysicalAddress::zero(),
                virt: VirtualAddress::zero(),
                count: 0,
                used: 0,
            },
            root_table: PhysicalAddress::new(0x1000),
        };
        assert_eq!(args.validate(), Ok(()));

        args.root_table = PhysicalAddress::new(0x1234);
        assert!(matches!(args.validate(), Err(BootArgsError::UnalignedRoot(_))));

        args.memory_map_len = 0;
        assert_eq!(args.validate(), Err(BootArgsError::NoMemoryMap));

        args.magic = 0;
        assert_eq!(args.validate(), Err(BootArgsError::BadMagic));
    }
}
