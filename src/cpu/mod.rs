pub mod cmos;
pub mod cpuid;
pub mod dispatcher;
pub mod gdt;
pub mod interrupts;
pub mod io;
pub mod msr;
pub mod pic;
pub mod pit;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use core::arch::asm;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// reads IF (bit 9) out of (e/r)flags.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn are_enabled() -> bool {
    let flags: usize;
    unsafe {
        asm!("pushf", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }

    flags & (1 << 9) != 0
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn pause() {
    unsafe {
        asm!("pause", options(nomem, nostack, preserves_flags));
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn halt() {
    unsafe {
        asm!("hlt", options(nomem, nostack));
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn halt_with_interrupts() -> ! {
    enable_interrupts();
    loop {
        halt();
    }
}
