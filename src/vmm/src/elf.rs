// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Validates and stages a 64-bit ELF executable into guest memory,
//! writing the boot-info header (see [`crate::bootinfo`]) on the first
//! loaded segment.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use crate::bootinfo::BootInfo;
use crate::hostfacts;
use crate::memory::GuestMemory;

const EI_MAG0: u8 = 0x7f;
const EI_MAG1: u8 = b'E';
const EI_MAG2: u8 = b'L';
const EI_MAG3: u8 = b'F';
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
/// OS/ABI tag identifying the guest family this monitor supports.
const ELFOSABI_SUPPORTED: u8 = 0x42;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open kernel image: {0}")]
    Open(std::io::Error),
    #[error("failed to read ELF header or program headers: {0}")]
    Read(#[from] hostfacts::Error),
    #[error("not an ELF64 little-endian file")]
    BadIdentification,
    #[error("unsupported ELF OS/ABI tag {0:#x}")]
    UnsupportedAbi(u8),
    #[error("not an executable ELF file")]
    NotExecutable,
    #[error("unsupported machine type, expected x86-64")]
    UnsupportedMachine,
    #[error("guest memory error: {0}")]
    Memory(#[from] crate::memory::Error),
    #[error("ELF file has no PT_LOAD segments")]
    NoLoadSegments,
    #[error("failed to seek to segment offset: {0}")]
    Seek(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of a successful load: the guest entry point and the base
/// address of the boot-info header.
pub struct LoadedKernel {
    pub entry_point: u64,
    pub boot_info: BootInfo,
}

struct Phdr {
    p_type: u32,
    p_offset: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

fn read_phdr(buf: &[u8]) -> Phdr {
    Phdr {
        p_type: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        p_offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        p_paddr: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        p_filesz: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        p_memsz: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
    }
}

/// Loads the ELF image at `path` into `mem`, returning its entry point
/// and the boot-info header location.
pub fn load(mem: &GuestMemory, path: &Path) -> Result<LoadedKernel> {
    let mut file = File::open(path).map_err(Error::Open)?;

    let mut ehdr = [0u8; EHDR_SIZE];
    hostfacts::pread_exact_retry(&file, &mut ehdr, 0)?;

    if ehdr[0] != EI_MAG0 || ehdr[1] != EI_MAG1 || ehdr[2] != EI_MAG2 || ehdr[3] != EI_MAG3 {
        return Err(Error::BadIdentification);
    }
    if ehdr[4] != ELFCLASS64 || ehdr[5] != ELFDATA2LSB {
        return Err(Error::BadIdentification);
    }
    if ehdr[7] != ELFOSABI_SUPPORTED {
        return Err(Error::UnsupportedAbi(ehdr[7]));
    }

    let e_type = u16::from_le_bytes(ehdr[16..18].try_into().unwrap());
    if e_type != ET_EXEC {
        return Err(Error::NotExecutable);
    }

    let e_machine = u16::from_le_bytes(ehdr[18..20].try_into().unwrap());
    if e_machine != EM_X86_64 {
        return Err(Error::UnsupportedMachine);
    }

    let e_entry = u64::from_le_bytes(ehdr[24..32].try_into().unwrap());
    let e_phoff = u64::from_le_bytes(ehdr[32..40].try_into().unwrap());
    let e_phentsize = u16::from_le_bytes(ehdr[54..56].try_into().unwrap()) as usize;
    let e_phnum = u16::from_le_bytes(ehdr[56..58].try_into().unwrap()) as usize;

    let mut boot_info = None;

    for i in 0..e_phnum {
        let mut phdr_buf = vec![0u8; PHDR_SIZE.max(e_phentsize)];
        let off = e_phoff + (i * e_phentsize) as u64;
        hostfacts::pread_exact_retry(&file, &mut phdr_buf[..e_phentsize.max(PHDR_SIZE)], off)?;
        let phdr = read_phdr(&phdr_buf);

        if phdr.p_type != PT_LOAD {
            continue;
        }

        file.seek(SeekFrom::Start(phdr.p_offset)).map_err(Error::Seek)?;
        mem.read_from_file(phdr.p_paddr, &mut file, phdr.p_filesz as usize)?;
        if phdr.p_memsz > phdr.p_filesz {
            mem.zero_fill(
                phdr.p_paddr + phdr.p_filesz,
                (phdr.p_memsz - phdr.p_filesz) as usize,
            )?;
        }

        let info = boot_info.get_or_insert_with(|| BootInfo::new(phdr.p_paddr));
        if info.mboot() == phdr.p_paddr {
            info.init(mem, phdr.p_paddr, mem.size(), hostfacts::detect_cpu_freq_mhz())?;
        }
        let total = phdr.p_paddr + phdr.p_memsz - info.mboot();
        info.set_file_size(mem, total)?;
    }

    let boot_info = boot_info.ok_or(Error::NoLoadSegments)?;

    Ok(LoadedKernel {
        entry_point: e_entry,
        boot_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_elf(osabi: u8, machine: u16, etype: u16, payload: &[u8]) -> Vec<u8> {
        let phoff = EHDR_SIZE as u64;
        let entry = 0x1000u64;
        let paddr = 0x1000u64;

        let mut ehdr = vec![0u8; EHDR_SIZE];
        ehdr[0] = EI_MAG0;
        ehdr[1] = EI_MAG1;
        ehdr[2] = EI_MAG2;
        ehdr[3] = EI_MAG3;
        ehdr[4] = ELFCLASS64;
        ehdr[5] = ELFDATA2LSB;
        ehdr[7] = osabi;
        ehdr[16..18].copy_from_slice(&etype.to_le_bytes());
        ehdr[18..20].copy_from_slice(&machine.to_le_bytes());
        ehdr[24..32].copy_from_slice(&entry.to_le_bytes());
        ehdr[32..40].copy_from_slice(&phoff.to_le_bytes());
        ehdr[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        ehdr[56..58].copy_from_slice(&1u16.to_le_bytes());

        let mut phdr = vec![0u8; PHDR_SIZE];
        phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        let file_off = (EHDR_SIZE + PHDR_SIZE) as u64;
        phdr[8..16].copy_from_slice(&file_off.to_le_bytes());
        phdr[24..32].copy_from_slice(&paddr.to_le_bytes());
        phdr[32..40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        phdr[40..48].copy_from_slice(&((payload.len() + 16) as u64).to_le_bytes());

        let mut image = ehdr;
        image.extend_from_slice(&phdr);
        image.extend_from_slice(payload);
        image
    }

    #[test]
    fn rejects_wrong_machine() {
        let image = build_elf(ELFOSABI_SUPPORTED, 0x28, ET_EXEC, b"hi");
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image).unwrap();

        let mem = GuestMemory::new(2 * 1024 * 1024).unwrap();
        let err = load(&mem, tmp.path()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMachine));
    }

    #[test]
    fn rejects_wrong_abi() {
        let image = build_elf(0x00, EM_X86_64, ET_EXEC, b"hi");
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image).unwrap();

        let mem = GuestMemory::new(2 * 1024 * 1024).unwrap();
        let err = load(&mem, tmp.path()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAbi(0x00)));
    }

    #[test]
    fn loads_segment_and_zero_fills_tail() {
        let payload = b"HELLOWORLD";
        let image = build_elf(ELFOSABI_SUPPORTED, EM_X86_64, ET_EXEC, payload);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image).unwrap();

        let mem = GuestMemory::new(2 * 1024 * 1024).unwrap();
        let loaded = load(&mem, tmp.path()).unwrap();
        assert_eq!(loaded.entry_point, 0x1000);

        let copied = mem.slice_mut(0x1000, payload.len()).unwrap();
        assert_eq!(copied, payload);

        let tail = mem.slice_mut(0x1000 + payload.len() as u64, 16).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }
}
