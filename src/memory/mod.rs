//! Virtual memory access over a physical snapshot.
//!
//! The builder only talks to memory through [`VirtualMemory`]. Reads return a
//! `Result` so that an unreadable address is an ordinary value at each call
//! site rather than a condition unwinding through the traversal.

pub mod error;
pub mod image;

pub use error::MemoryError;
pub use image::{ImageLimits, Mapping, MemoryImage, PageTable};

use error::Result;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Architecture of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    X86,
    X86_64,
}

/// Architecture constants of the kernel the snapshot was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSpecs {
    pub arch: Arch,
    /// Start of the kernel's direct mapping; lower addresses are user land.
    pub page_offset: u64,
    /// Highest valid virtual address.
    pub vaddr_space_end: u64,
    /// Largest errno encoded in error pointers.
    pub max_errno: u64,
    pub list_poison1: u64,
    pub list_poison2: u64,
    pub page_size: u64,
}

impl MemSpecs {
    pub fn x86_64() -> Self {
        Self {
            arch: Arch::X86_64,
            page_offset: 0xffff_8800_0000_0000,
            vaddr_space_end: u64::MAX,
            max_errno: 4095,
            list_poison1: 0xdead_0000_0010_0100,
            list_poison2: 0xdead_0000_0020_0200,
            page_size: 4096,
        }
    }

    pub fn x86() -> Self {
        Self {
            arch: Arch::X86,
            page_offset: 0xc000_0000,
            vaddr_space_end: 0xffff_ffff,
            max_errno: 4095,
            list_poison1: 0x0010_0100,
            list_poison2: 0x0020_0200,
            page_size: 4096,
        }
    }

    pub fn pointer_size(&self) -> usize {
        match self.arch {
            Arch::X86 => 4,
            Arch::X86_64 => 8,
        }
    }
}

/// How a virtual address is backed in physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMapping {
    /// The whole object is contiguous in physical memory.
    Linear,
    /// Backed page by page; every page may live elsewhere.
    Paged { page_size: u64 },
}

/// Byte-level access to a memory snapshot.
pub trait VirtualMemory: Send + Sync {
    fn specs(&self) -> &MemSpecs;

    /// Read `len` bytes at virtual address `address`.
    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    /// Translate a virtual address to its physical location.
    fn virtual_to_physical(&self, address: u64) -> Result<(u64, PageMapping)>;

    /// Switch concurrent-reader mode on or off. Returns the previous mode.
    fn set_thread_safety(&self, enabled: bool) -> bool;

    fn is_executable(&self, address: u64) -> bool;

    /// A fresh stream over the physical memory, positioned at offset zero.
    fn open_physical(&self) -> Result<Box<dyn Read + Send + '_>>;

    fn physical_size(&self) -> u64;

    fn is_readable(&self, address: u64) -> bool {
        self.read_bytes(address, 1).is_ok()
    }

    /// Read an unsigned little-endian integer of 1, 2, 4 or 8 bytes.
    fn read_uint(&self, address: u64, size: usize) -> Result<u64> {
        let b = self.read_bytes(address, size)?;
        Ok(match size {
            1 => b[0] as u64,
            2 => u16::from_le_bytes([b[0], b[1]]) as u64,
            4 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64,
            8 => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            other => return Err(MemoryError::UnsupportedSize(other)),
        })
    }

    /// Read a pointer of the snapshot's native width.
    fn read_pointer(&self, address: u64) -> Result<u64> {
        self.read_uint(address, self.specs().pointer_size())
    }
}
