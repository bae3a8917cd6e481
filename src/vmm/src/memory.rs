// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The guest's single memory region and the two primitives every other
//! module uses to touch it: translating a guest physical address to a
//! host pointer, and typed fixed-offset reads/writes. No code outside
//! this module does raw pointer arithmetic over guest memory.

use vm_memory::{
    Address, Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap,
};

/// Below the 32-bit PCI hole (`0xC000_0000`). Multiple memory slots
/// (e.g. to cover memory above the hole) are out of scope.
pub const MAX_GUEST_SIZE: u64 = 0xC000_0000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest memory size {0:#x} is not a multiple of 2 MiB")]
    Unaligned(u64),
    #[error("guest memory size {0:#x} is at or above the 32-bit PCI hole")]
    TooLarge(u64),
    #[error("guest memory size {0:#x} exceeds 512 page-directory entries (1 GiB)")]
    TooManyPdeEntries(u64),
    #[error("failed to allocate guest memory: {0}")]
    Mmap(vm_memory::Error),
    #[error("guest physical address {0:#x} is out of bounds")]
    OutOfBounds(u64),
    #[error("guest memory access error: {0}")]
    Access(vm_memory::GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

const TWO_MIB: u64 = 2 * 1024 * 1024;
const MAX_PDE_ENTRIES: u64 = 512;

/// A single page-aligned, anonymous mapping of the guest's physical
/// address space, starting at guest physical address 0.
pub struct GuestMemory {
    mmap: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocates `size` bytes of guest memory. `size` must be a
    /// multiple of 2 MiB, must fit within 512 2 MiB page-directory
    /// entries, and must be below the 32-bit PCI hole.
    pub fn new(size: u64) -> Result<Self> {
        if size == 0 || size % TWO_MIB != 0 {
            return Err(Error::Unaligned(size));
        }
        if size / TWO_MIB > MAX_PDE_ENTRIES {
            return Err(Error::TooManyPdeEntries(size));
        }
        if size >= MAX_GUEST_SIZE {
            return Err(Error::TooLarge(size));
        }

        let mmap = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)])
            .map_err(Error::Mmap)?;

        Ok(GuestMemory { mmap, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mmap(&self) -> &GuestMemoryMmap {
        &self.mmap
    }

    /// Translates a guest physical address into a host pointer valid
    /// for the remainder of the region it falls in.
    pub fn host_addr(&self, addr: u64) -> Result<*mut u8> {
        self.mmap
            .get_host_address(GuestAddress(addr))
            .map_err(|_| Error::OutOfBounds(addr))
    }

    /// Returns a mutable byte slice into guest memory starting at
    /// `addr` and spanning `len` bytes, bounds-checked against the
    /// region.
    pub fn slice_mut(&self, addr: u64, len: usize) -> Result<&mut [u8]> {
        let region = self
            .mmap
            .find_region(GuestAddress(addr))
            .ok_or(Error::OutOfBounds(addr))?;
        let region_offset = addr - region.start_addr().raw_value();
        if region_offset + len as u64 > region.len() {
            return Err(Error::OutOfBounds(addr));
        }
        let ptr = self.host_addr(addr)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    pub fn read_obj<T: vm_memory::ByteValued>(&self, addr: u64) -> Result<T> {
        self.mmap
            .read_obj(GuestAddress(addr))
            .map_err(Error::Access)
    }

    pub fn write_obj<T: vm_memory::ByteValued>(&self, val: T, addr: u64) -> Result<()> {
        self.mmap
            .write_obj(val, GuestAddress(addr))
            .map_err(Error::Access)
    }

    /// Copies `len` bytes from `src` (positioned at `offset`) into
    /// guest memory at `addr`, matching the ELF loader's `p_filesz`
    /// copy.
    pub fn read_from_file(
        &self,
        addr: u64,
        src: &mut std::fs::File,
        len: usize,
    ) -> Result<()> {
        self.mmap
            .read_from(GuestAddress(addr), src, len)
            .map_err(Error::Access)?;
        Ok(())
    }

    /// Zero-fills `len` bytes of guest memory starting at `addr`,
    /// matching the PT_LOAD tail beyond `p_filesz`.
    pub fn zero_fill(&self, addr: u64, len: usize) -> Result<()> {
        let zeros = vec![0u8; len];
        self.mmap
            .write_slice(&zeros, GuestAddress(addr))
            .map_err(Error::Access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_size() {
        assert!(matches!(GuestMemory::new(1), Err(Error::Unaligned(_))));
    }

    #[test]
    fn rejects_oversized_memory() {
        assert!(matches!(
            GuestMemory::new(MAX_GUEST_SIZE),
            Err(Error::TooLarge(_))
        ));
    }

    #[test]
    fn allocates_aligned_memory() {
        let mem = GuestMemory::new(TWO_MIB).unwrap();
        assert_eq!(mem.size(), TWO_MIB);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mem = GuestMemory::new(TWO_MIB).unwrap();
        mem.write_obj(0x1234_5678u32, 0x100).unwrap();
        let back: u32 = mem.read_obj(0x100).unwrap();
        assert_eq!(back, 0x1234_5678);
    }

    #[test]
    fn zero_fill_clears_tail() {
        let mem = GuestMemory::new(TWO_MIB).unwrap();
        mem.write_obj(0xFFu8, 0x200).unwrap();
        mem.zero_fill(0x200, 4).unwrap();
        let back: u32 = mem.read_obj(0x200).unwrap();
        assert_eq!(back, 0);
    }
}
