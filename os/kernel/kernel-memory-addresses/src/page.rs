use crate::{PageSize, PhysicalAddress, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

macro_rules! page_type {
    ($(#[$doc:meta])* $name:ident, $addr:ident, $tag:literal) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name<S: PageSize> {
            base: u64,
            _size: PhantomData<S>,
        }

        impl<S: PageSize> $name<S> {
            /// Page that contains `addr` (aligns down).
            #[inline]
            #[must_use]
            pub const fn containing(addr: $addr) -> Self {
                Self {
                    base: addr.as_u64() & !(S::SIZE - 1),
                    _size: PhantomData,
                }
            }

            /// Page starting at `addr`, or `None` if `addr` is not aligned to `S`.
            #[inline]
            #[must_use]
            pub const fn from_start(addr: $addr) -> Option<Self> {
                if addr.as_u64() & (S::SIZE - 1) == 0 {
                    Some(Self::containing(addr))
                } else {
                    None
                }
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                $addr::new(self.base)
            }

            /// Combine with an in-page offset.
            #[inline]
            #[must_use]
            pub const fn join(self, offset: u64) -> $addr {
                debug_assert!(offset < S::SIZE);
                $addr::new(self.base + offset)
            }

            /// The page `n` pages after this one.
            #[inline]
            #[must_use]
            pub const fn add_pages(self, n: u64) -> Self {
                Self {
                    base: self.base + n * S::SIZE,
                    _size: PhantomData,
                }
            }
        }

        impl<S: PageSize> fmt::Debug for $name<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "<{}>(0x{:016X})"), S::NAME, self.base)
            }
        }

        impl<S: PageSize> From<$name<S>> for $addr {
            #[inline]
            fn from(value: $name<S>) -> Self {
                value.base()
            }
        }
    };
}

page_type!(
    /// Page-aligned base of a physical page of size `S`.
    PhysicalPage, PhysicalAddress, "PhysicalPage"
);
page_type!(
    /// Page-aligned base of a virtual page of size `S`.
    VirtualPage, VirtualAddress, "VirtualPage"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Size2M, Size4K};

    #[test]
    fn from_start_requires_alignment() {
        assert!(PhysicalPage::<Size4K>::from_start(PhysicalAddress::new(0x1000)).is_some());
        assert!(PhysicalPage::<Size4K>::from_start(PhysicalAddress::new(0x1001)).is_none());
        assert!(PhysicalPage::<Size2M>::from_start(PhysicalAddress::new(0x1000)).is_none());
    }

    #[test]
    fn add_pages_advances_by_size() {
        let p = VirtualPage::<Size4K>::containing(VirtualAddress::new(0x4000_0123));
        assert_eq!(p.add_pages(3).base().as_u64(), 0x4000_3000);
    }
}
