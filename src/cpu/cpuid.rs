extern crate bitflags;

use bitflags::bitflags;

bitflags! {
    pub struct FlagsECX: u32 {
        const SSE3         = 1 << 0;
        const MONITOR      = 1 << 3;
        const TM2          = 1 << 8;
        const PDCM         = 1 << 15;
        const X2APIC       = 1 << 21;
        const TSCD         = 1 << 24;
    }
}

bitflags! {
    pub struct FlagsEDX: u32 {
        const FPU          = 1 << 0;
        const TSC          = 1 << 4;
        const MSR          = 1 << 5;
        const APIC         = 1 << 9;
        const MCA          = 1 << 14;
        const ACPI         = 1 << 22;
        const HTT          = 1 << 28;
        const TM1          = 1 << 29;
    }
}

/// Leaf 1 of cpuid, the only part the interrupt core looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CPUFeatures {
    pub ecx: FlagsECX,
    pub edx: FlagsEDX,
}

impl CPUFeatures {
    pub fn from_raw(ecx: u32, edx: u32) -> Self {
        CPUFeatures {
            ecx: FlagsECX::from_bits_truncate(ecx),
            edx: FlagsEDX::from_bits_truncate(edx),
        }
    }

    /// xApic needs both the APIC bit and rdmsr/wrmsr to reach IA32_APIC_BASE.
    pub fn has_xapic(&self) -> bool {
        self.edx.contains(FlagsEDX::APIC | FlagsEDX::MSR)
    }

    pub fn has_x2apic(&self) -> bool {
        self.ecx.contains(FlagsECX::X2APIC)
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn probe_cpu_features() -> CPUFeatures {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::__cpuid;

    let leaf = unsafe { __cpuid(1) };
    log::debug!("cpuid register ecx=0x{:x}, edx=0x{:x}", leaf.ecx, leaf.edx);

    CPUFeatures::from_raw(leaf.ecx, leaf.edx)
}

/// Initial APIC id of the executing processor (cpuid leaf 1, ebx[31:24]).
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn initial_apic_id() -> u8 {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::__cpuid;

    let leaf = unsafe { __cpuid(1) };
    (leaf.ebx >> 24) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xapic_requires_msr_support() {
        let only_apic = CPUFeatures::from_raw(0, 1 << 9);
        assert!(!only_apic.has_xapic());

        let full = CPUFeatures::from_raw(1 << 21, (1 << 9) | (1 << 5));
        assert!(full.has_xapic());
        assert!(full.has_x2apic());
    }
}
