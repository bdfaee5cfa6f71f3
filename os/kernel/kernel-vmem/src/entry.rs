use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// One 64-bit entry of any of the four paging levels.
///
/// The same layout serves table pointers and leaf mappings; which one an
/// entry is depends on its level and the `huge` bit. Bit positions are the
/// hardware format and must not move.
///
/// | Bits  | Field           | Notes                                         |
/// |-------|-----------------|-----------------------------------------------|
/// | 0     | `present`       |                                               |
/// | 1     | `writable`      |                                               |
/// | 2     | `user`          | ring 3 may access                             |
/// | 3     | `write_through` | PWT                                           |
/// | 4     | `cache_disable` | PCD                                           |
/// | 5     | `accessed`      | set by the CPU                                |
/// | 6     | `dirty`         | leaves only                                   |
/// | 7     | `huge`          | PS; 1 GiB in a PDPT, 2 MiB in a PD            |
/// | 8     | `global`        | leaves only                                   |
/// | 9     | `allowed`       | OS bit: demand-fault region marker            |
/// | 10–11 | `os_low`        | OS bits, unused                               |
/// | 12–51 | frame           | physical address >> 12                        |
/// | 52–58 | `os_high`       | OS bits, unused                               |
/// | 59–62 | `protection_key`|                                               |
/// | 63    | `no_execute`    | requires EFER.NXE                             |
///
/// `allowed` may be set on a non-present entry. It marks the whole range the
/// entry covers as valid to back lazily on first touch; see
/// [`AddressSpace::allow`](crate::AddressSpace::allow).
///
/// ```rust
/// # use kernel_vmem::PageEntry;
/// # use kernel_memory_addresses::PhysicalAddress;
/// let e = PageEntry::table(PhysicalAddress::new(0x5000));
/// assert_eq!(e.into_bits(), 0x5003);
/// assert!(PageEntry::new().with_allowed(true).into_bits() == 0x200);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,
    pub allowed: bool,
    #[bits(2)]
    pub os_low: u8,
    #[bits(40)]
    frame: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

/// Flag bits of an entry pointing at a child table: present and writable.
///
/// Permissions are decided at the leaf, so intermediate entries stay
/// maximally permissive apart from `user`, which callers add for the lower
/// half.
pub const TABLE_FLAGS: u64 = 0x003;

/// Permission and caching bits a leaf takes from its template:
/// present, writable, user, PWT, PCD, global and NX.
const FLAG_MASK: u64 = (1 << 63) | 0x11F;

impl PageEntry {
    /// Entry linking to a child table at `pa`.
    #[must_use]
    pub const fn table(pa: PhysicalAddress) -> Self {
        Self::from_bits(TABLE_FLAGS).with_frame(pa.as_u64() >> 12)
    }

    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    pub fn set_address(&mut self, pa: PhysicalAddress) {
        self.set_frame(pa.as_u64() >> 12);
    }

    #[must_use]
    pub const fn with_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.as_u64() >> 12)
    }

    /// Leaf entry for `pa` using the permission bits of `flags`.
    ///
    /// The frame and CPU-maintained bits of `flags` are ignored; the result
    /// is always present.
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, flags: Self) -> Self {
        Self::from_bits(flags.into_bits() & FLAG_MASK)
            .with_present(true)
            .with_address(pa)
    }

    /// Kernel data: writable, not executable, global.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_global(true)
            .with_no_execute(true)
    }

    /// Kernel text: read-only, executable, global.
    #[must_use]
    pub const fn kernel_code() -> Self {
        Self::new().with_present(true).with_global(true)
    }

    /// Device memory: writable, uncached, not executable.
    #[must_use]
    pub const fn mmio() -> Self {
        Self::kernel_data().with_cache_disable(true).with_write_through(true)
    }

    #[must_use]
    pub const fn user_data() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_no_execute(true)
    }

    #[must_use]
    pub const fn user_code() -> Self {
        Self::new().with_present(true).with_user(true)
    }

    /// An all-zero entry, or one carrying nothing but the `allowed` marker.
    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.into_bits() & !(1 << 9) == 0
    }
}
