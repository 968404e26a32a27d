//! Interrupt delivery for x86 kernels: ACPI MADT discovery, the local
//! APIC and I/O APIC, the APIC timer, SMP bring-up and a façade that falls
//! back to the 8259A pair when no APIC is usable.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate log;

pub mod acpi;
pub mod apic;
pub mod cpu;
pub mod logging;
pub mod mm;
pub mod platform;
pub mod system;

#[cfg(test)]
mod mock;
