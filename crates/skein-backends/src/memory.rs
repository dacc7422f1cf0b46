//! Device memory carving
//!
//! Each device owns two large allocations: framebuffer (device-private) and
//! zero-copy (host-pinned, device-visible). Both carve a reserved header off
//! the base for runtime-internal use and hand the remainder to a first-fit
//! sub-allocator.
//!
//! ```text
//! base ┌────────────┬────────────────────────────────┐
//!      │  reserve   │  sub-allocated user region      │
//!      └────────────┴────────────────────────────────┘
//! ```

use crate::error::Result;
use skein_base::RuntimeError;
use std::collections::BTreeMap;

/// First-fit sub-allocator over a contiguous byte range
///
/// Free blocks are kept as an offset-sorted map and coalesced on free.
pub struct Suballocator {
    size: usize,
    /// offset -> length of each free block
    free_blocks: BTreeMap<usize, usize>,
    /// offset -> length of each live allocation
    live: BTreeMap<usize, usize>,
}

impl Suballocator {
    pub fn new(size: usize) -> Self {
        let mut free_blocks = BTreeMap::new();
        if size > 0 {
            free_blocks.insert(0, size);
        }
        Self {
            size,
            free_blocks,
            live: BTreeMap::new(),
        }
    }

    /// Bytes currently available (possibly fragmented)
    pub fn available(&self) -> usize {
        self.free_blocks.values().sum()
    }

    /// Allocate `bytes`, returning the offset within the managed range
    pub fn alloc(&mut self, bytes: usize) -> std::result::Result<usize, RuntimeError> {
        if bytes == 0 {
            return Err(RuntimeError::invalid("zero-size allocation"));
        }
        let found = self
            .free_blocks
            .iter()
            .find(|(_, &len)| len >= bytes)
            .map(|(&off, &len)| (off, len));
        match found {
            Some((off, len)) => {
                self.free_blocks.remove(&off);
                if len > bytes {
                    self.free_blocks.insert(off + bytes, len - bytes);
                }
                self.live.insert(off, bytes);
                Ok(off)
            }
            None => Err(RuntimeError::OutOfMemory {
                requested: bytes,
                available: self.available(),
            }),
        }
    }

    /// Return an allocation to the free list, coalescing neighbors
    pub fn free(&mut self, offset: usize) -> std::result::Result<(), RuntimeError> {
        let len = self
            .live
            .remove(&offset)
            .ok_or_else(|| RuntimeError::InvalidHandle(format!("free of unallocated offset {offset}")))?;
        let mut off = offset;
        let mut size = len;
        // merge with the preceding free block if adjacent
        if let Some((&prev_off, &prev_len)) = self.free_blocks.range(..off).next_back() {
            if prev_off + prev_len == off {
                self.free_blocks.remove(&prev_off);
                off = prev_off;
                size += prev_len;
            }
        }
        // merge with the following free block if adjacent
        if let Some(&next_len) = self.free_blocks.get(&(offset + len)) {
            self.free_blocks.remove(&(offset + len));
            size += next_len;
        }
        self.free_blocks.insert(off, size);
        debug_assert!(self.available() <= self.size);
        Ok(())
    }
}

/// A device memory region with a reserved header
///
/// Offsets handed out by [`CarvedMemory::alloc`] are absolute device
/// addresses, already past the reserve.
pub struct CarvedMemory {
    base: u64,
    reserve: usize,
    alloc: Suballocator,
}

impl CarvedMemory {
    /// Carve `reserve` bytes off the front of `[base, base+total)`
    pub fn new(base: u64, total: usize, reserve: usize) -> Result<Self> {
        if reserve > total {
            return Err(crate::error::BackendError::AddressOutOfBounds {
                base,
                len: reserve,
            });
        }
        Ok(Self {
            base,
            reserve,
            alloc: Suballocator::new(total - reserve),
        })
    }

    /// First device address past the reserved header
    pub fn user_base(&self) -> u64 {
        self.base + self.reserve as u64
    }

    /// Bytes available to users
    pub fn available(&self) -> usize {
        self.alloc.available()
    }

    /// Allocate and return an absolute device address
    pub fn alloc(&mut self, bytes: usize) -> std::result::Result<u64, RuntimeError> {
        let off = self.alloc.alloc(bytes)?;
        Ok(self.user_base() + off as u64)
    }

    /// Free an address previously returned by [`CarvedMemory::alloc`]
    pub fn free(&mut self, addr: u64) -> std::result::Result<(), RuntimeError> {
        let off = addr
            .checked_sub(self.user_base())
            .ok_or_else(|| RuntimeError::InvalidHandle(format!("address {addr:#x} below user base")))?;
        self.alloc.free(off as usize)
    }
}

/// The two memories every device carries
pub struct DeviceMemory {
    pub framebuffer: CarvedMemory,
    pub zerocopy: CarvedMemory,
}

impl DeviceMemory {
    pub fn new(
        fb_base: u64,
        fb_total: usize,
        fb_reserve: usize,
        zc_base: u64,
        zc_total: usize,
        zc_reserve: usize,
    ) -> Result<Self> {
        Ok(Self {
            framebuffer: CarvedMemory::new(fb_base, fb_total, fb_reserve)?,
            zerocopy: CarvedMemory::new(zc_base, zc_total, zc_reserve)?,
        })
    }
}

// ================================================================================================
// Tests
// ================================================================================================
