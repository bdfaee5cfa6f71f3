//! Read-only view of an ELF64 program image.
//!
//! Nothing is copied; headers are decoded from the byte slice on demand.
//! [`ProgramImage::parse`] checks everything process creation relies on, so
//! a loader can walk [`ProgramImage::segments`] without further bounds
//! checks.

use bitfield_struct::bitfield;
use kernel_info::memory::USERSPACE_END;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("image shorter than an ELF header")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 64-bit image")]
    BadClass,
    #[error("not little-endian")]
    BadEndianness,
    #[error("not an executable or position-independent image")]
    BadType,
    #[error("not an x86-64 image")]
    BadMachine,
    #[error("malformed ELF header")]
    BadHeader,
    #[error("program headers out of bounds")]
    HeadersOutOfBounds,
    #[error("no loadable segment")]
    NoLoadSegment,
    #[error("segment {0} file data out of bounds")]
    SegmentOutOfBounds(usize),
    #[error("segment {0} outside of user space")]
    SegmentNotUser(usize),
    #[error("segment {0} file size exceeds memory size")]
    FileSizeExceedsMemSize(usize),
    #[error("entry point {0} not in an executable segment")]
    EntryNotExecutable(VirtualAddress),
}

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
struct Eh64 {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: VirtualAddress,
    e_phoff: u64,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
}

/// `Elf64_Phdr.p_flags` (SVr4): bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
pub struct SegmentFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// One `PT_LOAD` program header.
#[derive(Copy, Clone, Debug)]
pub struct Segment {
    pub flags: SegmentFlags,
    pub offset: u64,
    pub vaddr: VirtualAddress,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl Segment {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.vaddr.as_u64() + self.memsz
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.vaddr.as_u64() && va.as_u64() < self.end()
    }
}

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;
pub const PT_LOAD: u32 = 1;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

#[inline]
fn le64(x: &[u8]) -> u64 {
    u64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
}

/// A validated program image.
#[derive(Copy, Clone)]
pub struct ProgramImage<'a> {
    bytes: &'a [u8],
    eh: Eh64,
}

impl<'a> ProgramImage<'a> {
    /// Decode and validate `bytes`.
    ///
    /// # Errors
    /// The first [`ImageError`] found.
    #[allow(clippy::cast_possible_truncation)]
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        if bytes.len() < EHDR_SIZE {
            return Err(ImageError::TooShort);
        }
        if &bytes[0..4] != b"\x7FELF" {
            return Err(ImageError::BadMagic);
        }
        // ELFCLASS64
        if bytes[4] != 2 {
            return Err(ImageError::BadClass);
        }
        if bytes[5] != 1 {
            return Err(ImageError::BadEndianness);
        }

        let eh = Eh64 {
            e_type: le16(&bytes[16..18]),
            e_machine: le16(&bytes[18..20]),
            e_version: le32(&bytes[20..24]),
            e_entry: VirtualAddress::new(le64(&bytes[24..32])),
            e_phoff: le64(&bytes[32..40]),
            e_ehsize: le16(&bytes[52..54]),
            e_phentsize: le16(&bytes[54..56]),
            e_phnum: le16(&bytes[56..58]),
        };

        if !(eh.e_type == ET_EXEC || eh.e_type == ET_DYN) {
            return Err(ImageError::BadType);
        }
        if eh.e_machine != EM_X86_64 {
            return Err(ImageError::BadMachine);
        }
        if eh.e_version != 1 || eh.e_ehsize as usize > bytes.len() {
            return Err(ImageError::BadHeader);
        }
        if eh.e_phentsize as usize != PHDR_SIZE {
            return Err(ImageError::BadHeader);
        }

        let need = usize::try_from(eh.e_phoff)
            .ok()
            .and_then(|off| off.checked_add(eh.e_phnum as usize * PHDR_SIZE))
            .ok_or(ImageError::HeadersOutOfBounds)?;
        if need > bytes.len() {
            return Err(ImageError::HeadersOutOfBounds);
        }

        let image = Self { bytes, eh };
        image.validate_segments()?;
        Ok(image)
    }

    fn validate_segments(&self) -> Result<(), ImageError> {
        let mut loads = 0;
        for (i, seg) in self.segments().enumerate() {
            loads += 1;
            if seg.filesz > seg.memsz {
                return Err(ImageError::FileSizeExceedsMemSize(i));
            }
            seg.offset
                .checked_add(seg.filesz)
                .filter(|&end| end <= self.bytes.len() as u64)
                .ok_or(ImageError::SegmentOutOfBounds(i))?;
            seg.vaddr
                .as_u64()
                .checked_add(seg.memsz)
                .filter(|&end| end <= USERSPACE_END)
                .ok_or(ImageError::SegmentNotUser(i))?;
        }
        if loads == 0 {
            return Err(ImageError::NoLoadSegment);
        }

        let entry = self.entry();
        if !self
            .segments()
            .any(|s| s.flags.execute() && s.contains(entry))
        {
            return Err(ImageError::EntryNotExecutable(entry));
        }
        Ok(())
    }

    /// Program header `i`, whatever its type: `(p_type, segment)`.
    #[allow(clippy::cast_possible_truncation)]
    fn header(&self, i: usize) -> Option<(u32, Segment)> {
        if i >= self.eh.e_phnum as usize {
            return None;
        }
        let p = self.eh.e_phoff as usize + i * PHDR_SIZE;
        let s = self.bytes.get(p..p + PHDR_SIZE)?;
        Some((
            le32(&s[0..4]),
            Segment {
                flags: SegmentFlags::from_bits(le32(&s[4..8])),
                offset: le64(&s[8..16]),
                vaddr: VirtualAddress::new(le64(&s[16..24])),
                filesz: le64(&s[32..40]),
                memsz: le64(&s[40..48]),
                align: match le64(&s[48..56]) {
                    // ELF permits 0: no alignment requirement
                    0 => 1,
                    a => a,
                },
            },
        ))
    }

    /// The `PT_LOAD` segments in header order.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        (0..self.eh.e_phnum as usize)
            .filter_map(|i| self.header(i))
            .filter(|(ty, _)| *ty == PT_LOAD)
            .map(|(_, seg)| seg)
    }

    /// File bytes backing `segment`; shorter than `memsz` when the rest is
    /// zero-filled.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn segment_bytes(&self, segment: &Segment) -> &'a [u8] {
        let start = segment.offset as usize;
        &self.bytes[start..start + segment.filesz as usize]
    }

    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.eh.e_entry
    }

    /// True for PIE (`ET_DYN`), false for fixed `ET_EXEC`.
    #[must_use]
    pub const fn is_pie(&self) -> bool {
        self.eh.e_type == ET_DYN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ElfBuilder;

    #[test]
    fn accepts_minimal_executable() {
        let bytes = ElfBuilder::new(0x40_0000).code(&[0x90, 0xeb, 0xfe]).build();
        let image = ProgramImage::parse(&bytes).unwrap();
        assert_eq!(image.entry().as_u64(), 0x40_0000);
        assert!(!image.is_pie());
        let segs: Vec<_> = image.segments().collect();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].flags.execute() && segs[0].flags.read());
        assert_eq!(image.segment_bytes(&segs[0]), &[0x90, 0xeb, 0xfe]);
    }

    #[test]
    fn rejects_bad_identification() {
        assert_eq!(ProgramImage::parse(&[0; 10]).err(), Some(ImageError::TooShort));

        let good = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        let mut bad = good.clone();
        bad[1] = b'X';
        assert_eq!(ProgramImage::parse(&bad).err(), Some(ImageError::BadMagic));
        let mut bad = good.clone();
        bad[4] = 1;
        assert_eq!(ProgramImage::parse(&bad).err(), Some(ImageError::BadClass));
        let mut bad = good.clone();
        bad[5] = 2;
        assert_eq!(ProgramImage::parse(&bad).err(), Some(ImageError::BadEndianness));
        let mut bad = good.clone();
        bad[18] = 3;
        assert_eq!(ProgramImage::parse(&bad).err(), Some(ImageError::BadMachine));
        let mut bad = good;
        bad[16] = 1;
        assert_eq!(ProgramImage::parse(&bad).err(), Some(ImageError::BadType));
    }

    #[test]
    fn rejects_truncated_headers() {
        let mut bytes = ElfBuilder::new(0x40_0000).code(&[0xc3]).build();
        // e_phnum = 40
        bytes[56] = 40;
        assert_eq!(
            ProgramImage::parse(&bytes).err(),
            Some(ImageError::HeadersOutOfBounds)
        );
    }

    #[test]
    fn rejects_kernel_half_segment() {
        let bytes = ElfBuilder::new(0xffff_8000_0000_0000).code(&[0xc3]).build();
        assert_eq!(ProgramImage::parse(&bytes).err(), Some(ImageError::SegmentNotUser(0)));
    }

    #[test]
    fn rejects_entry_outside_code() {
        let bytes = ElfBuilder::new(0x40_0000)
            .code(&[0xc3])
            .entry(0x50_0000)
            .build();
        assert_eq!(
            ProgramImage::parse(&bytes).err(),
            Some(ImageError::EntryNotExecutable(VirtualAddress::new(0x50_0000)))
        );
    }

    #[test]
    fn rejects_oversized_file_data() {
        let bytes = ElfBuilder::new(0x40_0000).code(&[0xc3]).memsz(0).build();
        assert_eq!(
            ProgramImage::parse(&bytes).err(),
            Some(ImageError::FileSizeExceedsMemSize(0))
        );
    }

    #[test]
    fn data_segment_and_no_loads() {
        let bytes = ElfBuilder::new(0x40_0000)
            .code(&[0xc3])
            .data(0x60_0000, &[1, 2, 3, 4], 0x2000)
            .build();
        let image = ProgramImage::parse(&bytes).unwrap();
        let data = image.segments().nth(1).unwrap();
        assert!(data.flags.write() && !data.flags.execute());
        assert_eq!(data.memsz, 0x2000);

        let none = ElfBuilder::new(0x40_0000).code(&[0xc3]).without_loads().build();
        assert_eq!(ProgramImage::parse(&none).err(), Some(ImageError::NoLoadSegment));
    }
}
