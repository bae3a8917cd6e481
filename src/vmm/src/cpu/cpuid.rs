// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Trims the host CPUID table down to what the guest is allowed to
//! see: it is told it is running under a hypervisor, told it can use
//! the hypervisor-MSR leaf to discover this monitor's vendor string,
//! and denied the performance-monitoring leaf (this monitor does not
//! virtualize PMU state).

use kvm_bindings::CpuId;

const LEAF_FEATURE_INFO: u32 = 0x1;
const LEAF_PERFMON: u32 = 0x0A;

/// ECX bit 31 of leaf 1: "running under a hypervisor".
const ECX_HYPERVISOR_BIT: u32 = 1 << 31;
/// EDX bit 5 of leaf 1: "MSR supported". Always true on real silicon,
/// but we assert it explicitly since the guest checks it before
/// touching any MSR this monitor emulates.
const EDX_MSR_BIT: u32 = 1 << 5;

/// Applies the guest-visible CPUID policy in place. `cpu_index`
/// becomes the guest's logical APIC id via leaf 0xB/1's EDX, matching
/// how the SMP coordinator numbers vCPUs.
pub fn filter_cpuid(cpu_index: u32, cpuid: &mut CpuId) {
    for entry in cpuid.as_mut_slice().iter_mut() {
        match entry.function {
            LEAF_FEATURE_INFO => {
                entry.ecx |= ECX_HYPERVISOR_BIT;
                entry.edx |= EDX_MSR_BIT;
            }
            LEAF_PERFMON => {
                entry.eax = 0;
            }
            0x0B if entry.index == 0 => {
                entry.edx = cpu_index;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_cpuid_entry2;

    fn cpuid_with(entries: Vec<kvm_cpuid_entry2>) -> CpuId {
        CpuId::from_entries(&entries).unwrap()
    }

    #[test]
    fn sets_hypervisor_and_msr_bits_on_leaf_one() {
        let mut cpuid = cpuid_with(vec![kvm_cpuid_entry2 {
            function: LEAF_FEATURE_INFO,
            ..Default::default()
        }]);
        filter_cpuid(0, &mut cpuid);
        let entry = &cpuid.as_mut_slice()[0];
        assert_ne!(entry.ecx & ECX_HYPERVISOR_BIT, 0);
        assert_ne!(entry.edx & EDX_MSR_BIT, 0);
    }

    #[test]
    fn zeroes_performance_monitor_leaf() {
        let mut cpuid = cpuid_with(vec![kvm_cpuid_entry2 {
            function: LEAF_PERFMON,
            eax: 0xdead_beef,
            ..Default::default()
        }]);
        filter_cpuid(0, &mut cpuid);
        assert_eq!(cpuid.as_mut_slice()[0].eax, 0);
    }
}
