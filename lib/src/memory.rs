/*! Physical memory seen by the loader.

The boot loader runs without virtual memory, segments are copied straight
to the physical addresses they were linked for. [`PhysicalMemory`] models
that address space as one byte region per [`AddressWindow`] the loader is
allowed to write into. Every access is checked against those regions, an
access that isn't fully contained in a single region fails with
[`Error::OutOfBounds`].

It also provides the two memory services the loader needs from the rest of
the boot loader: a bump allocator that hands out pages right after the
loaded kernel, and a map of named ranges that later boot stages must not
overwrite.
*/
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::macho::PHYSICAL_ADDRESS_MASK;

const PAGE_SIZE: u64 = 0x1000;

/// A physical address range the loader is allowed to write into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressWindow {
    /// First address in the window.
    pub base: u64,
    /// Length of the window in bytes.
    pub len: u64,
}

impl AddressWindow {
    /// Default window for the kernel and everything allocated after it.
    pub const KERNEL: AddressWindow =
        AddressWindow { base: 0x0010_0000, len: 0x0800_0000 };

    /// Default window for the hibernation area.
    pub const HIBERNATION: AddressWindow =
        AddressWindow { base: 0x0000_4000, len: 0x0000_4000 };

    /// Address immediately after the window.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    /// Returns `true` if `[address, address + size)` lies entirely inside
    /// the window.
    pub fn contains(&self, address: u64, size: u64) -> bool {
        match address.checked_add(size) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }
}

/// A named range of physical memory that is in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRange {
    /// Name of the range, as shown in the memory map.
    pub name: String,
    /// Start of the range.
    pub base: u64,
    /// Length of the range.
    pub len: u64,
}

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    /// Returns the offset within the region for `address`, if the region
    /// contains it.
    fn offset_of(&self, address: u64) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        if offset < self.bytes.len() as u64 {
            Some(offset as usize)
        } else {
            None
        }
    }
}

/// Simulated physical memory.
pub struct PhysicalMemory {
    regions: Vec<Region>,
    ranges: Vec<MemoryRange>,
    kernel_window: AddressWindow,
    /// Next address returned by the kernel memory allocator.
    last_kernel_addr: u64,
}

impl PhysicalMemory {
    /// Creates a zero-filled physical memory that backs the kernel window
    /// and the hibernation window.
    ///
    /// Both windows must lie below 1 GiB, the highest physical address a
    /// segment can be loaded at. Otherwise [`Error::InvalidWindow`] is
    /// returned.
    pub fn new(
        kernel: AddressWindow,
        hibernation: AddressWindow,
    ) -> Result<Self, Error> {
        let mut regions = Vec::with_capacity(2);

        for window in [hibernation, kernel] {
            match window.base.checked_add(window.len) {
                Some(end) if end <= PHYSICAL_ADDRESS_MASK + 1 => {}
                _ => {
                    return Err(Error::InvalidWindow {
                        base: window.base,
                        len: window.len,
                    })
                }
            }

            if window.len > 0 {
                regions.push(Region {
                    base: window.base,
                    bytes: vec![0; window.len as usize],
                });
            }
        }

        Ok(Self {
            regions,
            ranges: Vec::new(),
            kernel_window: kernel,
            last_kernel_addr: kernel.base,
        })
    }

    /// Returns the `len` bytes starting at `address`.
    pub fn read(&self, address: u64, len: u64) -> Result<&[u8], Error> {
        let (index, start, end) = self.locate(address, len)?;
        Ok(&self.regions[index].bytes[start..end])
    }

    /// Like [`PhysicalMemory::read`], but if the range extends past the end
    /// of the region that contains `address` the returned slice is cut at
    /// the end of the region.
    pub fn read_up_to(&self, address: u64, len: u64) -> Result<&[u8], Error> {
        let (region, start) = self
            .regions
            .iter()
            .find_map(|region| Some((region, region.offset_of(address)?)))
            .ok_or(Error::OutOfBounds { address, len })?;

        let end = start.saturating_add(len as usize).min(region.bytes.len());

        Ok(&region.bytes[start..end])
    }

    /// Returns a mutable slice for the `len` bytes starting at `address`.
    pub fn slice_mut(
        &mut self,
        address: u64,
        len: u64,
    ) -> Result<&mut [u8], Error> {
        let (index, start, end) = self.locate(address, len)?;
        Ok(&mut self.regions[index].bytes[start..end])
    }

    /// Copies `bytes` to `address`. Nothing is written if the destination
    /// is not completely backed by memory.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), Error> {
        self.slice_mut(address, bytes.len() as u64)?.copy_from_slice(bytes);
        Ok(())
    }

    /// Moves the start of the kernel memory allocator past `end`, rounded
    /// up to a page boundary. The allocator never moves backwards.
    pub fn reserve_kernel_memory(&mut self, end: u64) {
        let end = round_page(end).unwrap_or(u64::MAX);
        self.last_kernel_addr = self.last_kernel_addr.max(end);
    }

    /// Allocates `size` bytes (rounded up to full pages) in the kernel
    /// window, right after everything allocated so far.
    pub fn allocate_kernel_memory(&mut self, size: u64) -> Result<u64, Error> {
        let address = self.last_kernel_addr;

        let next = round_page(size)
            .and_then(|size| address.checked_add(size))
            .filter(|next| *next <= self.kernel_window.end())
            .ok_or(Error::AllocationFailure { size })?;

        self.last_kernel_addr = next;

        Ok(address)
    }

    /// Adds a named range to the memory map.
    pub fn register_range(&mut self, name: &str, base: u64, len: u64) {
        self.ranges.push(MemoryRange { name: name.to_string(), base, len });
    }

    /// Named ranges registered so far, in registration order.
    pub fn ranges(&self) -> &[MemoryRange] {
        self.ranges.as_slice()
    }

    /// Address that will be returned by the next kernel memory allocation.
    pub fn kernel_memory_top(&self) -> u64 {
        self.last_kernel_addr
    }

    fn locate(
        &self,
        address: u64,
        len: u64,
    ) -> Result<(usize, usize, usize), Error> {
        let out_of_bounds = || Error::OutOfBounds { address, len };

        for (index, region) in self.regions.iter().enumerate() {
            if let Some(start) = region.offset_of(address) {
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| start.checked_add(len))
                    .filter(|end| *end <= region.bytes.len())
                    .ok_or_else(out_of_bounds)?;

                return Ok((index, start, end));
            }
        }

        Err(out_of_bounds())
    }
}

fn round_page(value: u64) -> Option<u64> {
    Some(value.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}
