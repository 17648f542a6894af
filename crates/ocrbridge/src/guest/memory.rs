//! Guest Memory
//!
//! Address types for guest linear memory, the region allocator bridge over
//! the guest's own `reserve`/`release` exports, and a host-side simulated
//! linear memory for guests that run without wasmtime.

use std::collections::HashMap;
use tracing::debug;

use crate::error::{OcrError, OcrResult};

/// Guest pointer type (32-bit address in WASM linear memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestPtr(pub u32);

impl GuestPtr {
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub fn offset(&self, bytes: u32) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for GuestPtr {
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

impl From<GuestPtr> for u32 {
    fn from(ptr: GuestPtr) -> Self {
        ptr.0
    }
}

/// A contiguous reservation inside guest linear memory.
///
/// Plain data: ownership and the release obligation live in
/// [`ScopedBuffer`](crate::buffer::ScopedBuffer), never in this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestBuffer {
    pub address: GuestPtr,
    pub length: u32,
}

impl GuestBuffer {
    pub fn new(address: GuestPtr, length: u32) -> Self {
        Self { address, length }
    }

    pub fn end(&self) -> GuestPtr {
        self.address.offset(self.length)
    }

    pub fn contains(&self, addr: GuestPtr) -> bool {
        addr >= self.address && addr < self.end()
    }
}

/// Raw allocator over guest linear memory.
///
/// Implementations keep no bookkeeping on the host side: `release` must be
/// given the exact length passed to `reserve`.
pub trait RegionAllocator: Send + Sync {
    /// Reserve `length` bytes. A guest that cannot satisfy the request
    /// reports [`OcrError::Allocation`].
    fn reserve(&self, length: u32) -> OcrResult<GuestPtr>;

    fn release(&self, address: GuestPtr, length: u32) -> OcrResult<()>;

    /// Copy host bytes into guest memory at `address`.
    fn write(&self, address: GuestPtr, bytes: &[u8]) -> OcrResult<()>;
}

/// Read a NUL-terminated UTF-8 string starting at `ptr`.
///
/// At most `max_len` bytes are scanned for the terminator.
pub fn read_c_string(memory: &[u8], ptr: GuestPtr, max_len: usize) -> OcrResult<String> {
    let start = ptr.as_usize();
    if start >= memory.len() {
        return Err(OcrError::MemoryOutOfBounds {
            offset: ptr.0,
            size: 1,
        });
    }

    let window = &memory[start..memory.len().min(start.saturating_add(max_len))];
    let end = window.iter().position(|&b| b == 0).ok_or_else(|| {
        OcrError::Execution(format!(
            "no NUL terminator within {} bytes of {:#x}",
            max_len, ptr.0
        ))
    })?;

    String::from_utf8(window[..end].to_vec())
        .map_err(|e| OcrError::Execution(format!("invalid UTF-8 at {:#x}: {}", ptr.0, e)))
}

/// Host-side stand-in for guest linear memory with a first-fit allocator.
///
/// Release checks are strict: releasing an unknown address, or with a length
/// other than the reserved one, is an error rather than a silent no-op.
pub struct SimulatedMemory {
    data: Vec<u8>,
    /// Maximum pages
    max_pages: u32,
    /// Live reservations by start address
    live: HashMap<u32, u32>,
    /// Released blocks available for reuse
    free_blocks: Vec<GuestBuffer>,
    /// Next never-used address
    heap_base: u32,
    peak_bytes: u64,
    allocated_bytes: u64,
}

impl SimulatedMemory {
    const PAGE_SIZE: u32 = 65536;

    pub fn new(initial_pages: u32, max_pages: u32) -> Self {
        Self {
            data: vec![0u8; initial_pages as usize * Self::PAGE_SIZE as usize],
            max_pages,
            live: HashMap::new(),
            free_blocks: Vec::new(),
            // first page stays reserved so that 0 never names a live region
            heap_base: Self::PAGE_SIZE,
            peak_bytes: 0,
            allocated_bytes: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn pages(&self) -> u32 {
        (self.data.len() / Self::PAGE_SIZE as usize) as u32
    }

    pub fn live_regions(&self) -> usize {
        self.live.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    fn align_size(size: u32) -> u32 {
        size.saturating_add(7) & !7
    }

    fn grow_to(&mut self, end: u32) -> OcrResult<()> {
        if end as usize <= self.data.len() {
            return Ok(());
        }
        let needed_pages = end.div_ceil(Self::PAGE_SIZE);
        if needed_pages > self.max_pages {
            return Err(OcrError::Allocation {
                size: u64::from(end) - u64::from(self.heap_base),
            });
        }
        let old_pages = self.pages();
        self.data
            .resize(needed_pages as usize * Self::PAGE_SIZE as usize, 0);
        debug!("Memory grown from {} to {} pages", old_pages, needed_pages);
        Ok(())
    }

    pub fn reserve(&mut self, length: u32) -> OcrResult<GuestPtr> {
        let aligned = Self::align_size(length);

        // First-fit over released blocks
        let reused = self
            .free_blocks
            .iter()
            .position(|block| block.length >= aligned);
        let ptr = if let Some(i) = reused {
            let block = self.free_blocks[i];
            let remaining = block.length - aligned;
            if remaining > 0 {
                self.free_blocks[i] = GuestBuffer::new(block.address.offset(aligned), remaining);
            } else {
                self.free_blocks.remove(i);
            }
            block.address
        } else {
            let end = self
                .heap_base
                .checked_add(aligned)
                .ok_or(OcrError::Allocation {
                    size: u64::from(length),
                })?;
            self.grow_to(end).map_err(|_| OcrError::Allocation {
                size: u64::from(length),
            })?;
            let ptr = GuestPtr(self.heap_base);
            self.heap_base = end;
            ptr
        };

        self.live.insert(ptr.0, length);
        self.allocated_bytes += u64::from(aligned);
        self.peak_bytes = self.peak_bytes.max(self.allocated_bytes);
        debug!("Reserved {} bytes at {:?}", length, ptr);
        Ok(ptr)
    }

    pub fn release(&mut self, ptr: GuestPtr, length: u32) -> OcrResult<()> {
        match self.live.get(&ptr.0) {
            None => Err(OcrError::Execution(format!(
                "release of unreserved region {:#x}",
                ptr.0
            ))),
            Some(&reserved) if reserved != length => Err(OcrError::Execution(format!(
                "release length mismatch at {:#x}: reserved {}, released {}",
                ptr.0, reserved, length
            ))),
            Some(_) => {
                self.live.remove(&ptr.0);
                let aligned = Self::align_size(length);
                self.allocated_bytes = self.allocated_bytes.saturating_sub(u64::from(aligned));
                self.return_block(GuestBuffer::new(ptr, aligned));
                debug!("Released {} bytes at {:?}", length, ptr);
                Ok(())
            }
        }
    }

    /// Return a block to the free list, coalescing with neighbours
    fn return_block(&mut self, block: GuestBuffer) {
        let mut coalesced = block;
        let mut i = 0;

        while i < self.free_blocks.len() {
            let other = self.free_blocks[i];
            if other.end() == coalesced.address {
                coalesced = GuestBuffer::new(other.address, other.length + coalesced.length);
                self.free_blocks.remove(i);
            } else if coalesced.end() == other.address {
                coalesced = GuestBuffer::new(coalesced.address, coalesced.length + other.length);
                self.free_blocks.remove(i);
            } else {
                i += 1;
            }
        }

        self.free_blocks.push(coalesced);
    }

    /// Whether `len` bytes at `ptr` are exactly one live reservation
    pub fn is_reserved(&self, ptr: GuestPtr, len: u32) -> bool {
        self.live.get(&ptr.0) == Some(&len)
    }

    pub fn read(&self, ptr: GuestPtr, len: u32) -> OcrResult<&[u8]> {
        let start = ptr.as_usize();
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.data.len())
            .ok_or(OcrError::MemoryOutOfBounds {
                offset: ptr.0,
                size: u64::from(len),
            })?;
        Ok(&self.data[start..end])
    }

    pub fn write(&mut self, ptr: GuestPtr, bytes: &[u8]) -> OcrResult<()> {
        let start = ptr.as_usize();
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(OcrError::MemoryOutOfBounds {
                offset: ptr.0,
                size: bytes.len() as u64,
            })?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Whole memory as a slice, for string reads
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Default for SimulatedMemory {
    fn default() -> Self {
        Self::new(1, 256)
    }
}
