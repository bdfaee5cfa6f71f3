use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Short label used in diagnostics.
    const NAME: &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, mapped by a PT entry.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page, mapped by a PD entry with PS set.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page, mapped by a PDPT entry with PS set.
    Size1G, 30, "1G"
);
