// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::result;

use kvm_bindings::{kvm_regs, CpuId, KVM_MP_STATE_RUNNABLE};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};

use crate::memory::GuestMemory;

pub(crate) mod cpuid;
mod gdt;

/// Identity-mapped page tables covering `[0, guest_size)`.
pub const PML4_START: u64 = 0x10000;
pub const PDPTE_START: u64 = 0x11000;
pub const PDE_START: u64 = 0x12000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// Register state every vCPU -- boot processor and APs alike -- enters
/// the guest with.
const ENTRY_RFLAGS: u64 = 0x2;
const ENTRY_RAX: u64 = 2;
const ENTRY_RBX: u64 = 2;
const ENTRY_RDX: u64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest memory error: {0}")]
    GuestMemory(#[from] crate::memory::Error),
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("hypercall dispatch error: {0}")]
    Hypercall(#[from] crate::hypercall::Error),
    #[error("guest faulted with MMIO at address {0:#x}; no device emulation is provided")]
    UnsupportedMmio(u64),
    #[error("guest entry failed: {0:?}")]
    FailEntry(u64),
    #[error("KVM internal error, sub-code {0}")]
    InternalError(u32),
    #[error("unexpected guest shutdown")]
    Shutdown,
    #[error("vCPU thread terminated by the teardown signal")]
    Terminated,
    #[error("vCPU faulted, rip = {rip:#x}")]
    Fault { rip: u64 },
}

pub type Result<T> = result::Result<T, Error>;

/// A single vCPU, running its own host thread once spawned.
pub struct Vcpu {
    pub index: u64,
    pub vcpu_fd: VcpuFd,
}

impl Vcpu {
    /// Issues `KVM_CREATE_VCPU(index)`.
    pub fn new(vm_fd: &VmFd, index: u64) -> Result<Self> {
        Ok(Vcpu {
            index,
            vcpu_fd: vm_fd.create_vcpu(index).map_err(Error::KvmIoctl)?,
        })
    }

    pub fn configure_cpuid(&self, cpuid: &CpuId) -> Result<()> {
        self.vcpu_fd.set_cpuid2(cpuid).map_err(Error::KvmIoctl)
    }

    /// `rip` is the ELF entry point shared by every vCPU; `rax`/`rbx`/
    /// `rdx`/`rflags` match the values this ABI was reconstructed from.
    pub fn configure_regs(&self, rip: u64) -> Result<()> {
        let regs = kvm_regs {
            rip,
            rax: ENTRY_RAX,
            rbx: ENTRY_RBX,
            rdx: ENTRY_RDX,
            rflags: ENTRY_RFLAGS,
            ..Default::default()
        };
        self.vcpu_fd.set_regs(&regs).map_err(Error::KvmIoctl)
    }

    /// Builds identity-mapped page tables and the flat GDT, then points
    /// CR3/CR0/CR4/EFER at them. Called once by the boot processor;
    /// APs apply the same cached `kvm_sregs` value instead of
    /// recomputing it.
    pub fn configure_sregs(&self, mem: &GuestMemory) -> Result<()> {
        let mut sregs = self.vcpu_fd.get_sregs().map_err(Error::KvmIoctl)?;

        let gdt_table: [u64; gdt::BOOT_GDT_MAX] = [
            gdt::gdt_entry(0, 0, 0),            // NULL
            gdt::gdt_entry(0xa09b, 0, 0xfffff), // CODE
            gdt::gdt_entry(0xc093, 0, 0xfffff), // DATA
        ];
        gdt::write_gdt_table(&gdt_table, mem)?;

        sregs.gdt.base = gdt::BOOT_GDT_OFFSET;
        sregs.gdt.limit = std::mem::size_of_val(&gdt_table) as u16 - 1;

        let code_seg = gdt::kvm_segment_from_gdt(gdt_table[1], 1);
        let data_seg = gdt::kvm_segment_from_gdt(gdt_table[2], 2);
        sregs.cs = code_seg;
        sregs.ds = data_seg;
        sregs.es = data_seg;
        sregs.fs = data_seg;
        sregs.gs = data_seg;
        sregs.ss = data_seg;

        sregs.cr0 |= X86_CR0_PE;
        sregs.efer |= EFER_LME | EFER_LMA;

        write_page_tables(mem)?;
        sregs.cr3 = PML4_START;
        sregs.cr4 |= X86_CR4_PAE;
        sregs.cr0 |= X86_CR0_PG;

        self.vcpu_fd.set_sregs(&sregs).map_err(Error::KvmIoctl)
    }

    /// Applies a `kvm_sregs` value the boot processor already computed,
    /// so every AP shares identical paging and segmentation state.
    pub fn apply_sregs(&self, sregs: &kvm_bindings::kvm_sregs) -> Result<()> {
        self.vcpu_fd.set_sregs(sregs).map_err(Error::KvmIoctl)
    }

    pub fn sregs(&self) -> Result<kvm_bindings::kvm_sregs> {
        self.vcpu_fd.get_sregs().map_err(Error::KvmIoctl)
    }

    /// Forces multiprocessor state to `RUNNABLE` if it isn't already;
    /// APs otherwise never reach their first `KVM_RUN`.
    pub fn ensure_runnable(&self) -> Result<()> {
        let mut mp_state = self.vcpu_fd.get_mp_state().map_err(Error::KvmIoctl)?;
        if mp_state.mp_state != KVM_MP_STATE_RUNNABLE {
            mp_state.mp_state = KVM_MP_STATE_RUNNABLE;
            self.vcpu_fd.set_mp_state(mp_state).map_err(Error::KvmIoctl)?;
        }
        Ok(())
    }

    /// The exit-reason dispatch loop. Returns the guest's requested
    /// exit status on an `EXIT` hypercall or a voluntary `HLT`.
    ///
    /// `net` is locked only for the duration of a single hypercall
    /// dispatch, not for the loop's lifetime -- holding it across
    /// `KVM_RUN` would serialize every vCPU against the others for as
    /// long as any one of them is inside the guest.
    pub fn run(
        &mut self,
        mem: &GuestMemory,
        net: &std::sync::Mutex<Option<crate::net::TapDevice>>,
    ) -> Result<i32> {
        loop {
            match self.vcpu_fd.run() {
                Ok(VcpuExit::Hlt) => return Ok(0),
                Ok(VcpuExit::Shutdown) => return Err(Error::Shutdown),
                Ok(VcpuExit::MmioRead(addr, _)) | Ok(VcpuExit::MmioWrite(addr, _)) => {
                    return Err(Error::UnsupportedMmio(addr))
                }
                Ok(VcpuExit::FailEntry(reason, _cpu)) => return Err(Error::FailEntry(reason)),
                Ok(VcpuExit::InternalError) => return Err(Error::InternalError(0)),
                Ok(VcpuExit::IoOut(port, data)) => {
                    let addr = u32::from_le_bytes(data.try_into().unwrap_or([0; 4])) as u64;
                    let mut net_guard = net.lock().unwrap();
                    match crate::hypercall::dispatch(port, addr, mem, net_guard.as_mut())? {
                        crate::hypercall::Outcome::Continue => {}
                        crate::hypercall::Outcome::Exit(status) => return Ok(status),
                    }
                }
                Ok(other) => {
                    eprintln!("unhandled vCPU exit: {:?}", other);
                }
                Err(e) if e.errno() == libc::EINTR => {
                    if crate::teardown::shutdown_requested() {
                        return Err(Error::Terminated);
                    }
                    continue;
                }
                Err(e) if e.errno() == libc::EFAULT => {
                    let regs = self.vcpu_fd.get_regs().map_err(Error::KvmIoctl)?;
                    return Err(Error::Fault { rip: regs.rip });
                }
                Err(e) => return Err(Error::KvmIoctl(e)),
            }
        }
    }
}

/// Writes one PML4 entry, one PDPTE entry and 512 2 MiB PDE entries
/// covering `[0, 1 GiB)`.
fn write_page_tables(mem: &GuestMemory) -> Result<()> {
    mem.write_obj(PDPTE_START | 0x03, PML4_START)?;
    mem.write_obj(PDE_START | 0x03, PDPTE_START)?;
    for i in 0..512u64 {
        mem.write_obj((i << 21) + 0x83u64, PDE_START + i * 8)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_tables_identity_map_first_gigabyte() {
        let mem = GuestMemory::new(2 * 1024 * 1024).unwrap();
        write_page_tables(&mem).unwrap();

        let pml4: u64 = mem.read_obj(PML4_START).unwrap();
        assert_eq!(pml4, PDPTE_START | 0x03);

        let pde0: u64 = mem.read_obj(PDE_START).unwrap();
        assert_eq!(pde0, 0x83);

        let pde1: u64 = mem.read_obj(PDE_START + 8).unwrap();
        assert_eq!(pde1, (1u64 << 21) + 0x83);
    }
}
