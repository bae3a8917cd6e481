// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

//! Orchestrates the monitor's lifecycle: opens KVM, allocates and
//! registers guest memory, loads the kernel ELF, brings up the boot
//! processor and its peers, and runs the boot processor's dispatch
//! loop to completion.

use std::path::Path;
use std::sync::{Arc, Mutex};

use kvm_bindings::{kvm_userspace_memory_region, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::Kvm;

pub mod bootinfo;
pub mod config;
pub mod cpu;
pub mod elf;
pub mod hostfacts;
pub mod hypercall;
pub mod memory;
pub mod net;
pub mod smp;
pub mod teardown;

use config::Config;
use memory::GuestMemory;
use teardown::Teardown;

/// KVM's stable ABI version; anything else means a host kernel this
/// monitor has never been tested against.
const EXPECTED_KVM_API_VERSION: i32 = 12;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("failed to allocate guest memory: {0}")]
    Memory(#[from] memory::Error),
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(kvm_ioctls::Error),
    #[error("unsupported KVM API version {0}, expected {EXPECTED_KVM_API_VERSION}")]
    ApiVersion(i32),
    #[error("failed to create VM: {0}")]
    CreateVm(kvm_ioctls::Error),
    #[error("failed to register guest memory with KVM: {0}")]
    SetUserMemoryRegion(kvm_ioctls::Error),
    #[error("failed to create the in-kernel interrupt controller: {0}")]
    CreateIrqChip(kvm_ioctls::Error),
    #[error("failed to query supported CPUID: {0}")]
    GetSupportedCpuid(kvm_ioctls::Error),
    #[error("failed to load kernel image: {0}")]
    Elf(#[from] elf::Error),
    #[error("vCPU setup or run error: {0}")]
    Cpu(#[from] cpu::Error),
    #[error("failed to install teardown signal handler: {0}")]
    Teardown(#[from] teardown::Error),
    #[error("network back-end error: {0}")]
    Net(#[from] net::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runs the monitor end to end for `kernel_path`, returning the
/// guest's exit status: 0 on `HLT`, the guest's explicit `EXIT`
/// hypercall status otherwise.
pub fn run(kernel_path: &Path) -> Result<i32> {
    let config = Config::from_env(kernel_path.to_path_buf())?;
    run_with_config(config)
}

fn run_with_config(config: Config) -> Result<i32> {
    let mem = Arc::new(GuestMemory::new(config.mem_size)?);

    let kvm = Kvm::new().map_err(Error::OpenKvm)?;
    let api_version = kvm.get_api_version();
    if api_version != EXPECTED_KVM_API_VERSION {
        return Err(Error::ApiVersion(api_version));
    }

    let vm_fd = kvm.create_vm().map_err(Error::CreateVm)?;

    let mem_region = kvm_userspace_memory_region {
        slot: 0,
        guest_phys_addr: 0,
        memory_size: mem.size(),
        userspace_addr: mem.host_addr(0)? as u64,
        flags: 0,
    };
    // SAFETY: `mem_region` describes the single mapping `mem` owns for
    // the remainder of this process.
    unsafe { vm_fd.set_user_memory_region(mem_region) }.map_err(Error::SetUserMemoryRegion)?;

    vm_fd.create_irq_chip().map_err(Error::CreateIrqChip)?;

    let loaded = elf::load(&mem, &config.kernel_path)?;

    teardown::install_handler()?;

    let base_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(Error::GetSupportedCpuid)?;
    let base_cpuid = Arc::new(base_cpuid);

    let mut boot_cpuid = (*base_cpuid).clone();
    cpu::cpuid::filter_cpuid(0, &mut boot_cpuid);

    let boot_cpu = cpu::Vcpu::new(&vm_fd, 0)?;
    boot_cpu.configure_sregs(&mem)?;
    boot_cpu.configure_regs(loaded.entry_point)?;
    boot_cpu.configure_cpuid(&boot_cpuid)?;
    boot_cpu.ensure_runnable()?;
    let cached_sregs = boot_cpu.sregs()?;

    loaded.boot_info.set_cpu_count(&mem, config.num_cpus)?;

    let net = Arc::new(Mutex::new(match &config.netif {
        Some(ifname) => Some(net::TapDevice::open(ifname)?),
        None => None,
    }));

    let vm_fd = Arc::new(vm_fd);
    let peers = smp::spawn_peers(
        config.num_cpus,
        Arc::clone(&vm_fd),
        Arc::clone(&mem),
        loaded.boot_info,
        loaded.entry_point,
        cached_sregs,
        Arc::clone(&base_cpuid),
        Arc::clone(&net),
    );

    let mut teardown = Teardown::new(vm_fd, kvm);
    teardown.peers = peers;
    teardown.mem = Some(Arc::clone(&mem));
    teardown.klog_addr = Some(loaded.boot_info.klog_addr());
    teardown.verbose = config.verbose;

    let mut boot_cpu = boot_cpu;
    let status = boot_cpu.run(&mem, &net)?;

    drop(teardown);
    Ok(status)
}
