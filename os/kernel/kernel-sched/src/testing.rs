//! Host helpers for tests of this crate and the crates built on it
//! (`test-support` feature).

extern crate std;

use crate::image::{EM_X86_64, ET_EXEC, PT_LOAD};
use core::cell::RefCell;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::{InterruptFrame, Msr, Platform};
use std::vec::Vec;

const PT_NOTE: u32 = 4;

struct Seg {
    vaddr: u64,
    bytes: Vec<u8>,
    memsz: u64,
    flags: u32,
}

/// Builds small ELF64 executables.
pub struct ElfBuilder {
    entry: u64,
    segs: Vec<Seg>,
    loads: bool,
}

impl ElfBuilder {
    /// An image whose entry point is `code_base`.
    #[must_use]
    pub const fn new(code_base: u64) -> Self {
        Self {
            entry: code_base,
            segs: Vec::new(),
            loads: true,
        }
    }

    /// Read/execute segment at the entry point.
    #[must_use]
    pub fn code(mut self, bytes: &[u8]) -> Self {
        self.segs.push(Seg {
            vaddr: self.entry,
            bytes: bytes.to_vec(),
            memsz: bytes.len() as u64,
            flags: 0b101,
        });
        self
    }

    /// Read/write segment, zero-filled up to `memsz`.
    #[must_use]
    pub fn data(mut self, vaddr: u64, bytes: &[u8], memsz: u64) -> Self {
        self.segs.push(Seg {
            vaddr,
            bytes: bytes.to_vec(),
            memsz,
            flags: 0b110,
        });
        self
    }

    #[must_use]
    pub const fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Override the memory size of the last segment.
    #[must_use]
    pub fn memsz(mut self, memsz: u64) -> Self {
        if let Some(seg) = self.segs.last_mut() {
            seg.memsz = memsz;
        }
        self
    }

    /// Emit every header as `PT_NOTE`.
    #[must_use]
    pub const fn without_loads(mut self) -> Self {
        self.loads = false;
        self
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let phoff = 64u64;
        let mut data_off = phoff + 56 * self.segs.len() as u64;

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7FELF");
        out.extend_from_slice(&[2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&EM_X86_64.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&phoff.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&56u16.to_le_bytes());
        out.extend_from_slice(&(self.segs.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]);

        let p_type = if self.loads { PT_LOAD } else { PT_NOTE };
        for seg in &self.segs {
            out.extend_from_slice(&p_type.to_le_bytes());
            out.extend_from_slice(&seg.flags.to_le_bytes());
            out.extend_from_slice(&data_off.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&(seg.bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
            data_off += seg.bytes.len() as u64;
        }
        for seg in &self.segs {
            out.extend_from_slice(&seg.bytes);
        }
        out
    }
}

/// Platform that records what the scheduler asks of the hardware.
pub struct MockPlatform {
    root: RefCell<PhysicalAddress>,
    /// Every root passed to `switch_root`.
    pub switches: RefCell<Vec<PhysicalAddress>>,
    /// Every frame passed to `push_frame`, with the stack top.
    pub frames: RefCell<Vec<(VirtualAddress, InterruptFrame)>>,
    pub kernel_stack: RefCell<Option<VirtualAddress>>,
    pub fault: RefCell<VirtualAddress>,
}

impl MockPlatform {
    #[must_use]
    pub fn new(root: PhysicalAddress) -> Self {
        Self {
            root: RefCell::new(root),
            switches: RefCell::new(Vec::new()),
            frames: RefCell::new(Vec::new()),
            kernel_stack: RefCell::new(None),
            fault: RefCell::new(VirtualAddress::zero()),
        }
    }
}

impl Platform for MockPlatform {
    fn fault_address(&self) -> VirtualAddress {
        *self.fault.borrow()
    }

    fn current_root(&self) -> PhysicalAddress {
        *self.root.borrow()
    }

    unsafe fn switch_root(&self, root: PhysicalAddress) {
        *self.root.borrow_mut() = root;
        self.switches.borrow_mut().push(root);
    }

    fn invalidate_page(&self, _va: VirtualAddress) {}

    fn read_msr(&self, _msr: Msr) -> u64 {
        0
    }

    unsafe fn write_msr(&self, _msr: Msr, _value: u64) {}

    /// Does not touch memory; the returned pointer is where the frame would
    /// start.
    unsafe fn push_frame(&self, stack_top: VirtualAddress, frame: &InterruptFrame) -> u64 {
        self.frames.borrow_mut().push((stack_top, *frame));
        stack_top.as_u64() - size_of::<InterruptFrame>() as u64
    }

    fn set_kernel_stack(&self, rsp0: VirtualAddress) {
        *self.kernel_stack.borrow_mut() = Some(rsp0);
    }
}
