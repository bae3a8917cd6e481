// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Spawns one host thread per additional vCPU and sequences their
//! entry through the SMP-gate counter in the boot-info header. The
//! boot processor runs on the caller's own thread; this module only
//! owns the peers.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use kvm_bindings::{kvm_sregs, CpuId};
use kvm_ioctls::VmFd;

use crate::bootinfo::BootInfo;
use crate::cpu::{self, Vcpu};
use crate::memory::GuestMemory;
use crate::net::TapDevice;

/// Spawns one thread per core in `1..num_cpus`. Each peer spins on the
/// SMP gate until the guest has released it, records its own id,
/// applies the boot processor's cached `sregs`, derives its own
/// CPUID table (leaf 0xB's reported APIC id must match its own id),
/// and enters the dispatch loop.
pub fn spawn_peers(
    num_cpus: u32,
    vm_fd: Arc<VmFd>,
    mem: Arc<GuestMemory>,
    boot_info: BootInfo,
    entry_point: u64,
    cached_sregs: kvm_sregs,
    base_cpuid: Arc<CpuId>,
    net: Arc<Mutex<Option<TapDevice>>>,
) -> Vec<JoinHandle<cpu::Result<i32>>> {
    (1..num_cpus)
        .map(|id| {
            let vm_fd = Arc::clone(&vm_fd);
            let mem = Arc::clone(&mem);
            let base_cpuid = Arc::clone(&base_cpuid);
            let net = Arc::clone(&net);
            std::thread::spawn(move || {
                run_peer(id as u64, &vm_fd, &mem, boot_info, entry_point, &cached_sregs, &base_cpuid, &net)
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn run_peer(
    id: u64,
    vm_fd: &VmFd,
    mem: &GuestMemory,
    boot_info: BootInfo,
    entry_point: u64,
    cached_sregs: &kvm_sregs,
    base_cpuid: &CpuId,
    net: &Mutex<Option<TapDevice>>,
) -> cpu::Result<i32> {
    while (boot_info.smp_gate(mem).unwrap_or(0) as u64) < id {
        std::hint::spin_loop();
    }
    boot_info.set_current_apic_id(mem, id as u32)?;

    let mut cpuid = base_cpuid.clone();
    cpu::cpuid::filter_cpuid(id as u32, &mut cpuid);

    let mut vcpu = Vcpu::new(vm_fd, id)?;
    vcpu.apply_sregs(cached_sregs)?;
    vcpu.configure_regs(entry_point)?;
    vcpu.configure_cpuid(&cpuid)?;
    vcpu.ensure_runnable()?;

    vcpu.run(mem, net)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smp_gate_reflects_guest_writes() {
        let mem = GuestMemory::new(2 * 1024 * 1024).unwrap();
        let boot_info = BootInfo::new(0x1000);
        boot_info.init(&mem, 0x1000, mem.size(), 0).unwrap();

        assert!((boot_info.smp_gate(&mem).unwrap() as u64) < 1);
        mem.write_obj(1u32, boot_info.mboot() + 0x20).unwrap();
        assert!((boot_info.smp_gate(&mem).unwrap() as u64) >= 1);
    }
}
