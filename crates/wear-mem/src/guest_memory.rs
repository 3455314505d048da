use std::mem;
use std::ops::Range;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::regions::{DEFAULT_MEMORY_SIZE, USER_BASE};
use crate::MemoryResult;

/// Faults raised by guest memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryFault {
    /// The translated range does not fit inside the buffer.
    #[error("guest memory access out of bounds: addr=0x{addr:x} len={len} size=0x{size:x}")]
    OutOfBounds { addr: u64, len: usize, size: u64 },
    /// Alignment enforcement is enabled and the address is not naturally aligned.
    #[error("misaligned guest memory access: addr=0x{addr:x} align={align}")]
    Misaligned { addr: u64, align: usize },
    /// The range cannot be represented (translated end overflows).
    #[error("invalid guest address range: addr=0x{addr:x} len={len}")]
    InvalidAddress { addr: u64, len: usize },
}

/// Errors returned when constructing a [`GuestMemory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("guest memory size 0x{size:x} must be a non-zero power of two")]
    InvalidSize { size: u64 },
    #[error("guest memory size 0x{size:x} does not fit in usize")]
    SizeTooLarge { size: u64 },
    #[error("failed to allocate 0x{size:x} bytes of guest memory")]
    AllocationFailure { size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of the unified buffer in bytes. Must be a power of two.
    pub size_bytes: u64,
    /// Reject typed accesses that are not naturally aligned.
    pub enforce_alignment: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size_bytes: DEFAULT_MEMORY_SIZE,
            enforce_alignment: false,
        }
    }
}

fn try_alloc_zeroed(len: usize) -> Result<Vec<u8>, std::collections::TryReserveError> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)?;
    data.resize(len, 0);
    Ok(data)
}

/// The guest's unified memory: one contiguous, zero-initialised buffer.
///
/// Addresses passed to every accessor are guest virtual addresses; they are folded into the
/// buffer with [`GuestMemory::translate_address`] and then checked against its bounds.
pub struct GuestMemory {
    data: Vec<u8>,
    mask: u64,
    enforce_alignment: bool,
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("size", &self.size())
            .field("enforce_alignment", &self.enforce_alignment)
            .finish_non_exhaustive()
    }
}

impl GuestMemory {
    pub fn new(config: MemoryConfig) -> Result<Self, MemoryError> {
        let size = config.size_bytes;
        if !size.is_power_of_two() {
            return Err(MemoryError::InvalidSize { size });
        }
        let len = usize::try_from(size).map_err(|_| MemoryError::SizeTooLarge { size })?;
        let data = try_alloc_zeroed(len).map_err(|err| {
            tracing::error!(size, error = %err, "guest memory allocation failed");
            MemoryError::AllocationFailure { size }
        })?;
        tracing::debug!(size, "allocated guest memory");

        Ok(Self {
            data,
            mask: size - 1,
            enforce_alignment: config.enforce_alignment,
        })
    }

    pub fn with_size(size_bytes: u64) -> Result<Self, MemoryError> {
        Self::new(MemoryConfig {
            size_bytes,
            ..MemoryConfig::default()
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Folds a guest virtual address into a buffer offset.
    ///
    /// Addresses at or above [`USER_BASE`] are rebased so the executable image starts at offset 0;
    /// everything is then masked to the buffer size. Addresses that differ only above the mask
    /// alias the same offset.
    pub fn translate_address(&self, virt: u64) -> u64 {
        if virt >= USER_BASE {
            (virt - USER_BASE) & self.mask
        } else {
            virt & self.mask
        }
    }

    pub fn is_valid_address(&self, addr: u64, len: u64) -> bool {
        let phys = self.translate_address(addr);
        phys.checked_add(len).is_some_and(|end| end <= self.size())
    }

    fn checked_range(&self, addr: u64, len: usize) -> MemoryResult<Range<usize>> {
        let phys = self.translate_address(addr);
        let end = phys
            .checked_add(len as u64)
            .ok_or(MemoryFault::InvalidAddress { addr, len })?;
        if end > self.size() {
            return Err(MemoryFault::OutOfBounds {
                addr,
                len,
                size: self.size(),
            });
        }
        // `end <= data.len()`, so both bounds fit in usize.
        Ok(phys as usize..end as usize)
    }

    fn check_alignment(&self, addr: u64, align: usize) -> MemoryResult<()> {
        if self.enforce_alignment && align > 1 && addr % align as u64 != 0 {
            return Err(MemoryFault::Misaligned { addr, align });
        }
        Ok(())
    }

    /// Reads a plain-old-data value in host byte order.
    pub fn read<T: Pod>(&self, addr: u64) -> MemoryResult<T> {
        let range = self.checked_range(addr, mem::size_of::<T>())?;
        self.check_alignment(addr, mem::align_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&self.data[range]))
    }

    /// Writes a plain-old-data value in host byte order.
    pub fn write<T: Pod>(&mut self, addr: u64, value: T) -> MemoryResult<()> {
        let range = self.checked_range(addr, mem::size_of::<T>())?;
        self.check_alignment(addr, mem::align_of::<T>())?;
        self.data[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> MemoryResult<u8> {
        self.read::<u8>(addr)
    }

    pub fn read_u16(&self, addr: u64) -> MemoryResult<u16> {
        self.check_alignment(addr, 2)?;
        Ok(u16::from_le_bytes(self.read::<[u8; 2]>(addr)?))
    }

    pub fn read_u32(&self, addr: u64) -> MemoryResult<u32> {
        self.check_alignment(addr, 4)?;
        Ok(u32::from_le_bytes(self.read::<[u8; 4]>(addr)?))
    }

    pub fn read_u64(&self, addr: u64) -> MemoryResult<u64> {
        self.check_alignment(addr, 8)?;
        Ok(u64::from_le_bytes(self.read::<[u8; 8]>(addr)?))
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> MemoryResult<()> {
        self.write(addr, value)
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) -> MemoryResult<()> {
        self.check_alignment(addr, 2)?;
        self.write(addr, value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> MemoryResult<()> {
        self.check_alignment(addr, 4)?;
        self.write(addr, value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> MemoryResult<()> {
        self.check_alignment(addr, 8)?;
        self.write(addr, value.to_le_bytes())
    }

    pub fn read_block(&self, addr: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let range = self.checked_range(addr, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    pub fn write_block(&mut self, addr: u64, src: &[u8]) -> MemoryResult<()> {
        let range = self.checked_range(addr, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&mut self, addr: u64, len: usize, value: u8) -> MemoryResult<()> {
        let range = self.checked_range(addr, len)?;
        self.data[range].fill(value);
        Ok(())
    }

    pub fn zero(&mut self, addr: u64, len: usize) -> MemoryResult<()> {
        self.fill(addr, len, 0)
    }

    /// Reads a NUL-terminated byte string of at most `max_len` bytes (terminator excluded).
    ///
    /// Each byte is translated on its own, so a string running off the end of the buffer folds
    /// back to its start like any other address.
    pub fn read_cstr(&self, addr: u64, max_len: usize) -> MemoryResult<Vec<u8>> {
        let mut out = Vec::new();
        for i in 0..max_len as u64 {
            let byte = self.read_u8(addr.wrapping_add(i))?;
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        Ok(out)
    }

    /// Borrows the translated range directly after validating it.
    pub fn physical_slice(&self, addr: u64, len: usize) -> MemoryResult<&[u8]> {
        let range = self.checked_range(addr, len)?;
        Ok(&self.data[range])
    }

    pub fn physical_slice_mut(&mut self, addr: u64, len: usize) -> MemoryResult<&mut [u8]> {
        let range = self.checked_range(addr, len)?;
        Ok(&mut self.data[range])
    }
}
