//! Memory images: a physical snapshot plus the page table that maps kernel
//! virtual addresses onto it.
//!
//! The snapshot is either an owned buffer or a read-only memory map of a raw
//! dump file. Both are immutable once opened, so reads never need a lock.

use super::error::{MemoryError, Result};
use super::{MemSpecs, PageMapping, VirtualMemory};
use bytes::Bytes;
use memmap2::Mmap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

/// Resource limits for opening dump files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLimits {
    /// The absolute maximum dump size that can be opened.
    pub max_image_size: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_image_size: 64 * 1024 * 1024 * 1024, // 64GB
        }
    }
}

/// One contiguous virtual-to-physical mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub virt_start: u64,
    pub phys_start: u64,
    pub len: u64,
    /// `None` for a linear region, otherwise the page size of a paged mapping.
    pub page_size: Option<u64>,
    pub executable: bool,
}

impl Mapping {
    fn contains(&self, address: u64) -> bool {
        address >= self.virt_start && address - self.virt_start < self.len
    }
}

/// Sorted set of non-overlapping virtual mappings.
#[derive(Debug, Clone, Default)]
pub struct PageTable {
    mappings: Vec<Mapping>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a linear region such as the kernel's direct mapping.
    pub fn map_linear(&mut self, virt: u64, phys: u64, len: u64, executable: bool) -> &mut Self {
        self.insert(Mapping {
            virt_start: virt,
            phys_start: phys,
            len,
            page_size: None,
            executable,
        })
    }

    /// Map one page of a paged region. Page sizes are powers of two.
    pub fn map_page(&mut self, virt: u64, phys: u64, page_size: u64, executable: bool) -> &mut Self {
        assert!(page_size.is_power_of_two(), "page size {page_size:#x} is not a power of two");
        self.insert(Mapping {
            virt_start: virt,
            phys_start: phys,
            len: page_size,
            page_size: Some(page_size),
            executable,
        })
    }

    fn insert(&mut self, mapping: Mapping) -> &mut Self {
        let pos = self
            .mappings
            .partition_point(|m| m.virt_start < mapping.virt_start);
        self.mappings.insert(pos, mapping);
        self
    }

    /// Find the mapping covering `address`.
    pub fn lookup(&self, address: u64) -> Option<&Mapping> {
        let idx = self.mappings.partition_point(|m| m.virt_start <= address);
        if idx == 0 {
            return None;
        }
        let m = &self.mappings[idx - 1];
        m.contains(address).then_some(m)
    }

    pub fn translate(&self, address: u64) -> Option<(u64, PageMapping)> {
        self.lookup(address).map(|m| {
            let phys = m.phys_start + (address - m.virt_start);
            let kind = match m.page_size {
                None => PageMapping::Linear,
                Some(page_size) => PageMapping::Paged { page_size },
            };
            (phys, kind)
        })
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
    // memmap cannot map empty files.
    Empty,
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Owned(v) => v.as_slice(),
            Backing::Mapped(m) => &m[..],
            Backing::Empty => &[],
        }
    }
}

/// A physical memory snapshot with its virtual address translation.
pub struct MemoryImage {
    path: Option<PathBuf>,
    backing: Backing,
    specs: MemSpecs,
    table: PageTable,
    thread_safe: AtomicBool,
}

impl MemoryImage {
    /// Wrap an in-memory physical image.
    pub fn from_bytes(data: Vec<u8>, specs: MemSpecs, table: PageTable) -> Self {
        Self {
            path: None,
            backing: Backing::Owned(data),
            specs,
            table,
            thread_safe: AtomicBool::new(false),
        }
    }

    /// Memory-map a raw physical dump file.
    ///
    /// This function will fail if the file size exceeds `limits.max_image_size`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        specs: MemSpecs,
        table: PageTable,
        limits: ImageLimits,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        debug!(
            path = %path.display(),
            size = size,
            limits.max_image_size = limits.max_image_size,
            mappings = table.len(),
            "Opening memory dump"
        );

        if size > limits.max_image_size {
            warn!(
                path = %path.display(),
                size = size,
                limit = limits.max_image_size,
                "Memory dump is too large"
            );
            return Err(MemoryError::ImageTooLarge {
                limit: limits.max_image_size,
                found: size,
            });
        }

        let backing = if size == 0 {
            Backing::Empty
        } else {
            // Safety: read-only map of a regular file that is not modified while mapped.
            Backing::Mapped(unsafe { Mmap::map(&file)? })
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            backing,
            specs,
            table,
            thread_safe: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Acquire)
    }

    /// Copy a range of physical memory, clamped to the end of the image.
    pub fn read_physical(&self, offset: u64, len: u64) -> Bytes {
        let data = self.backing.as_slice();
        let start = offset as usize;
        if start >= data.len() {
            return Bytes::new();
        }
        let end = std::cmp::min(start.saturating_add(len as usize), data.len());
        Bytes::copy_from_slice(&data[start..end])
    }
}

impl VirtualMemory for MemoryImage {
    fn specs(&self) -> &MemSpecs {
        &self.specs
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let data = self.backing.as_slice();
        let mut out = Vec::with_capacity(len);
        let mut cur = address;
        let mut remaining = len as u64;

        // A read may cross into the next mapping.
        while remaining > 0 {
            let m = self.table.lookup(cur).ok_or(MemoryError::Unreadable(cur))?;
            let in_mapping = m.len - (cur - m.virt_start);
            let take = remaining.min(in_mapping);
            let phys = m.phys_start + (cur - m.virt_start);
            let start = phys as usize;
            let end = start.saturating_add(take as usize);
            if end > data.len() || end < start {
                return Err(MemoryError::OutOfRange(format!(
                    "PA:{:#x}..{:#x} not within [0,{:#x})",
                    start,
                    end,
                    data.len()
                )));
            }
            out.extend_from_slice(&data[start..end]);
            remaining -= take;
            cur = cur.wrapping_add(take);
        }

        trace!(address = format_args!("{:#x}", address), len, "Performed read");
        Ok(out)
    }

    fn virtual_to_physical(&self, address: u64) -> Result<(u64, PageMapping)> {
        self.table
            .translate(address)
            .ok_or(MemoryError::Translation(address))
    }

    fn set_thread_safety(&self, enabled: bool) -> bool {
        self.thread_safe.swap(enabled, Ordering::AcqRel)
    }

    fn is_executable(&self, address: u64) -> bool {
        self.table.lookup(address).is_some_and(|m| m.executable)
    }

    fn open_physical(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(self.backing.as_slice())))
    }

    fn physical_size(&self) -> u64 {
        self.backing.as_slice().len() as u64
    }
}
