use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Hugepage requirement: every SGL entry must be at least this big.
pub const MIN_SGL_ENTRY_BYTES: usize = 2 * 1024 * 1024;

/// One scatter-gather entry: a userspace/bus address pair and a length,
/// as returned by the kernel DMA registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SglEntry {
    pub user_addr: usize,
    pub bus_addr: u64,
    pub len: usize,
}

/// The scatter-gather list for one registered buffer. Entries are ordered
/// and their userspace addresses are contiguous: entry `i+1`'s `user_addr`
/// equals entry `i`'s `user_addr + len`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sgl(pub Vec<SglEntry>);

impl Sgl {
    pub fn total_len(&self) -> usize {
        self.0.iter().map(|e| e.len).sum()
    }

    /// Entry containing the given byte offset from the buffer base, plus
    /// the intra-entry displacement.
    fn locate(&self, offset: usize) -> Option<(&SglEntry, usize)> {
        let mut cursor = 0usize;
        for entry in &self.0 {
            if offset < cursor + entry.len {
                return Some((entry, offset - cursor));
            }
            cursor += entry.len;
        }
        None
    }

    /// Splits the SGL into a FIFO reservation (the first `fifo_size` bytes,
    /// taken from the first entry) and the page addresses covering the rest
    /// of the buffer at `page_size` stride, in SGL order. Used by engine A
    /// to carve the ReadyFIFO out of the same buffer its pages land in.
    ///
    /// Every entry must be at least [`MIN_SGL_ENTRY_BYTES`] (the hugepage
    /// requirement); an undersized entry is reported as `SglEntryTooSmall`
    /// rather than silently skipped, since a short entry means the kernel
    /// handed back a buffer the rest of the core can't safely DMA into.
    pub fn partition(&self, fifo_size: usize, page_size: usize) -> Result<SglPartition> {
        for entry in &self.0 {
            if entry.len < MIN_SGL_ENTRY_BYTES {
                return Err(Error::SglEntryTooSmall {
                    got: entry.len,
                    need: MIN_SGL_ENTRY_BYTES,
                });
            }
        }
        let first = self.0.first().ok_or(Error::BadParameter {
            key: "sgl".into(),
            reason: "cannot partition an empty SGL".into(),
        })?;
        if fifo_size > first.len {
            return Err(Error::BadParameter {
                key: "fifo-reservation".into(),
                reason: format!(
                    "FIFO reservation of {fifo_size} bytes exceeds the first SGL entry's {} bytes",
                    first.len
                ),
            });
        }

        let fifo = FifoReservation {
            user_addr: first.user_addr,
            bus_addr: first.bus_addr,
            size: fifo_size,
        };

        let total = self.total_len();
        let mut pages = Vec::new();
        let mut offset = fifo_size;
        while offset < total {
            let (entry, displacement) = self.locate(offset).ok_or(Error::BadParameter {
                key: "sgl".into(),
                reason: format!("offset {offset} is not covered by any SGL entry"),
            })?;
            pages.push((entry.user_addr + displacement, entry.bus_addr + displacement as u64));
            offset += page_size;
        }

        Ok(SglPartition { fifo, pages })
    }
}

/// The FIFO half of [`Sgl::partition`]: the first `size` bytes of the SGL,
/// as a single contiguous (userspace, bus) region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoReservation {
    pub user_addr: usize,
    pub bus_addr: u64,
    pub size: usize,
}

/// Result of [`Sgl::partition`]: the FIFO reservation plus one
/// `(user_addr, bus_addr)` pair per page after it, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SglPartition {
    pub fifo: FifoReservation,
    pub pages: Vec<(usize, u64)>,
}

/// A plain host memory region: a userspace address and a size, not yet
/// registered with the kernel DMA layer.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub address: usize,
    pub size: usize,
}

/// RAII wrapper around a huge-page-backed file mapping. Unmaps on drop;
/// does not delete the backing file (channel close explicitly deletes the
/// lock/FIFO files it owns, but a client-provided buffer file outlives
/// the channel by design).
pub struct FileMapping {
    address: usize,
    size: usize,
    path: PathBuf,
}

impl FileMapping {
    /// Creates (or extends) `path` to `size` bytes and maps it shared,
    /// read-write. `size` must be a multiple of 2 MiB.
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if size == 0 || size % MIN_SGL_ENTRY_BYTES != 0 {
            return Err(Error::BadParameter {
                key: "buffer-parameters".into(),
                reason: format!(
                    "file buffer size {size} is not a nonzero multiple of {MIN_SGL_ENTRY_BYTES}"
                ),
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::DmaRegistrationFailed {
                reason: format!("could not create {}: {e}", parent.display()),
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::DmaRegistrationFailed {
                reason: format!("could not open {}: {e}", path.display()),
            })?;
        file.set_len(size as u64)
            .map_err(|e| Error::DmaRegistrationFailed {
                reason: format!("could not extend {} to {size} bytes: {e}", path.display()),
            })?;

        // SAFETY: `file` stays open for the duration of the mmap call; the
        // returned pointer is only ever read/written through `Bar`-style
        // volatile helpers or plain byte copies, never aliased as a Rust
        // reference of a different type.
        let address = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(Error::DmaRegistrationFailed {
                reason: format!(
                    "mmap of {} ({size} bytes) failed: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                ),
            });
        }

        Ok(Self {
            address: address as usize,
            size,
            path,
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // SAFETY: `self.address`/`self.size` are exactly the values used to
        // create this mapping in `create`.
        unsafe {
            libc::munmap(self.address as *mut libc::c_void, self.size);
        }
    }
}

/// Presents one DMA-registered region to the channel: either nothing, a
/// client-supplied memory region, or a huge-page-backed file.
pub enum BufferProvider {
    Null,
    Memory { region: MemoryRegion, sgl: Sgl },
    File {
        region: MemoryRegion,
        sgl: Sgl,
        mapping: FileMapping,
    },
}

impl BufferProvider {
    pub fn null() -> Self {
        BufferProvider::Null
    }

    pub fn memory(region: MemoryRegion, sgl: Sgl) -> Self {
        BufferProvider::Memory { region, sgl }
    }

    pub fn file(mapping: FileMapping, sgl: Sgl) -> Self {
        let region = MemoryRegion {
            address: mapping.address(),
            size: mapping.size(),
        };
        BufferProvider::File {
            region,
            sgl,
            mapping,
        }
    }

    pub fn address(&self) -> usize {
        match self {
            BufferProvider::Null => 0,
            BufferProvider::Memory { region, .. } | BufferProvider::File { region, .. } => {
                region.address
            }
        }
    }

    pub fn size(&self) -> usize {
        match self {
            BufferProvider::Null => 0,
            BufferProvider::Memory { region, .. } | BufferProvider::File { region, .. } => {
                region.size
            }
        }
    }

    pub fn sgl(&self) -> &Sgl {
        static EMPTY: Sgl = Sgl(Vec::new());
        match self {
            BufferProvider::Null => &EMPTY,
            BufferProvider::Memory { sgl, .. } | BufferProvider::File { sgl, .. } => sgl,
        }
    }

    /// The hot path called on every push: translate a byte offset from the
    /// buffer base to its bus address. Dominated by an early-return for
    /// the common 1-2 entry (IOMMU-enabled) case, but the walk itself
    /// stays linear since real SGLs are small and stable.
    pub fn bus_offset(&self, offset: usize) -> Result<u64> {
        if offset >= self.size() {
            return Err(Error::BadParameter {
                key: "offset".into(),
                reason: format!("offset {offset} is outside the {}-byte buffer", self.size()),
            });
        }
        let sgl = self.sgl();
        if let Some(first) = sgl.0.first() {
            if offset < first.len {
                return Ok(first.bus_addr + offset as u64);
            }
        }
        let (entry, displacement) = sgl
            .locate(offset)
            .ok_or(Error::BadParameter {
                key: "offset".into(),
                reason: format!("offset {offset} is not covered by any SGL entry"),
            })?;
        Ok(entry.bus_addr + displacement as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgl_two_entries() -> Sgl {
        Sgl(vec![
            SglEntry {
                user_addr: 0x1000_0000,
                bus_addr: 0x8000_0000,
                len: 4 * 1024 * 1024,
            },
            SglEntry {
                user_addr: 0x1000_0000 + 4 * 1024 * 1024,
                bus_addr: 0x9000_0000,
                len: 2 * 1024 * 1024,
            },
        ])
    }

    #[test]
    fn bus_offset_round_trips_through_each_entry() {
        let sgl = sgl_two_entries();
        let provider = BufferProvider::memory(
            MemoryRegion {
                address: 0x1000_0000,
                size: sgl.total_len(),
            },
            sgl.clone(),
        );
        assert_eq!(provider.bus_offset(0).unwrap(), 0x8000_0000);
        assert_eq!(provider.bus_offset(100).unwrap(), 0x8000_0000 + 100);
        let second_entry_offset = 4 * 1024 * 1024 + 10;
        assert_eq!(
            provider.bus_offset(second_entry_offset).unwrap(),
            0x9000_0000 + 10
        );
    }

    #[test]
    fn partition_carves_fifo_then_enumerates_every_page_in_order() {
        let sgl = sgl_two_entries();
        let total = sgl.total_len();
        let fifo_size = 1024 * 1024;
        let page_size = 8192;

        let partition = sgl.partition(fifo_size, page_size).unwrap();
        assert_eq!(partition.fifo.user_addr, 0x1000_0000);
        assert_eq!(partition.fifo.bus_addr, 0x8000_0000);
        assert_eq!(partition.fifo.size, fifo_size);

        let expected_pages = (total - fifo_size) / page_size;
        assert_eq!(partition.pages.len(), expected_pages);

        let mut offset = fifo_size;
        for (user_addr, bus_addr) in &partition.pages {
            let (entry, displacement) = sgl.locate(offset).unwrap();
            assert_eq!(*user_addr, entry.user_addr + displacement);
            assert_eq!(*bus_addr, entry.bus_addr + displacement as u64);
            offset += page_size;
        }
    }

    #[test]
    fn partition_rejects_undersized_sgl_entries() {
        let sgl = Sgl(vec![SglEntry {
            user_addr: 0x1000_0000,
            bus_addr: 0x8000_0000,
            len: 1024,
        }]);
        let err = sgl.partition(0, 8192).unwrap_err();
        assert!(matches!(
            err,
            Error::SglEntryTooSmall {
                got: 1024,
                need: MIN_SGL_ENTRY_BYTES
            }
        ));
    }
}
