//! Guest physical memory access for device models.
//!
//! Devices that perform DMA (the VDE security engine, for example) read and
//! write guest physical memory through [`GuestMemory`]. Reads and writes are
//! copy-based; a backend may additionally expose contiguous slices as a fast
//! path. MMIO-mapped device register windows hang off the physical address
//! space via [`MmioHandler`].

#![forbid(unsafe_code)]

use core::fmt;

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestMemoryError {
    /// The requested address range is outside the guest physical memory size.
    OutOfRange { paddr: u64, len: usize, size: u64 },
    /// The requested size cannot be represented by the current platform's `usize`.
    SizeTooLarge { size: u64 },
}

impl fmt::Display for GuestMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestMemoryError::OutOfRange { paddr, len, size } => write!(
                f,
                "guest memory access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}"
            ),
            GuestMemoryError::SizeTooLarge { size } => {
                write!(f, "guest memory size {size} does not fit in usize")
            }
        }
    }
}

impl std::error::Error for GuestMemoryError {}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Guest *physical* memory storage.
///
/// All externally-visible addresses are `u64`; device-visible address widths
/// (e.g. the 32-bit DMA addresses the security engine latches) are widened by
/// the caller.
pub trait GuestMemory {
    fn size(&self) -> u64;

    /// Reads bytes from guest physical memory into `dst`.
    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes bytes from `src` into guest physical memory.
    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Validates that `[paddr, paddr + len)` is a mappable range.
    ///
    /// DMA engines call this up front so that a run either maps both of its
    /// windows or performs no transfer at all.
    fn check_range(&self, paddr: u64, len: usize) -> GuestMemoryResult<()> {
        let size = self.size();
        let end = paddr
            .checked_add(len as u64)
            .ok_or(GuestMemoryError::OutOfRange { paddr, len, size })?;
        if end > size {
            return Err(GuestMemoryError::OutOfRange { paddr, len, size });
        }
        Ok(())
    }

    fn read_u32_le(&self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32_le(&mut self, paddr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }
}

/// Heap-backed [`GuestMemory`] used by machine models and tests.
#[derive(Debug, Clone)]
pub struct VecGuestMemory {
    bytes: Vec<u8>,
}

impl VecGuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, paddr: u64, len: usize) -> GuestMemoryResult<core::ops::Range<usize>> {
        self.check_range(paddr, len)?;
        let start =
            usize::try_from(paddr).map_err(|_| GuestMemoryError::SizeTooLarge { size: paddr })?;
        Ok(start..start + len)
    }
}

impl GuestMemory for VecGuestMemory {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let range = self.range(paddr, dst.len())?;
        dst.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let range = self.range(paddr, src.len())?;
        self.bytes[range].copy_from_slice(src);
        Ok(())
    }
}

/// Handler for an MMIO-mapped register window.
///
/// `offset` is relative to the window base. Handlers have no error channel;
/// models log and ignore unrecognized accesses, and treat genuinely fatal
/// conditions as machine-terminating.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}
