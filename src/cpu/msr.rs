#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use core::arch::asm;

/// IA32_APIC_BASE: BSP flag, x2APIC/xAPIC enable and the MMIO base.
pub const IA32_APIC_BASE: u32 = 0x1B;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn read_msr(msr: u32) -> u64 {
    let (high, low): (u32, u32);
    unsafe {
        asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }

    ((high as u64) << 32) | (low as u64)
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn write_msr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") low,
            in("edx") high,
            options(nostack, preserves_flags)
        );
    }
}
