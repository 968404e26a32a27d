//! The boundary between the interrupt core and the rest of the kernel:
//! register access, paging, the PIT and the scheduler all come in through
//! [`Platform`].

use crate::cpu::cpuid::CPUFeatures;
use crate::cpu::gdt::DescriptorPointer;
use crate::cpu::io::PortIO;
use crate::mm::{MemoryError, PhysicalAddress, VirtualAddress};

/// Control state of the BSP that every AP copies before it can share
/// the kernel address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorState {
    pub gdtr: DescriptorPointer,
    pub idtr: DescriptorPointer,
    pub cr0: u32,
    pub cr3: u32,
    pub cr4: u32,
}

pub trait Platform: PortIO + Send + Sync + 'static {
    fn read_mmio(&self, address: VirtualAddress) -> u32;
    fn write_mmio(&self, address: VirtualAddress, value: u32);

    fn read_msr(&self, msr: u32) -> u64;
    fn write_msr(&self, msr: u32, value: u64);

    fn cpu_features(&self) -> CPUFeatures;

    /// maps a device window uncached.
    fn map_mmio(&self, phys: PhysicalAddress, size: usize) -> Result<VirtualAddress, MemoryError>;
    /// maps `phys` at the same virtual address; used for the trampoline page.
    fn map_identity(
        &self,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError>;
    /// maps arbitrary physical memory, e.g. the BIOS data area.
    fn map_physical(
        &self,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError>;
    fn unmap(&self, virt: VirtualAddress, size: usize);

    fn busy_wait_ns(&self, ns: u64);
    fn pause(&self);

    fn interrupts_enabled(&self) -> bool;
    fn enable_interrupts(&self);
    fn disable_interrupts(&self);

    fn processor_state(&self) -> ProcessorState;

    /// called from the BSP timer tick.
    fn yield_now(&self);
}

/// What the embedding kernel has to provide for [`Native`].
pub trait KernelServices: Send + Sync + 'static {
    fn map_mmio(&self, phys: PhysicalAddress, size: usize) -> Result<VirtualAddress, MemoryError>;
    fn map_identity(
        &self,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError>;
    fn map_physical(
        &self,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError>;
    fn unmap(&self, virt: VirtualAddress, size: usize);
    fn yield_now(&self);
}

#[cfg(target_arch = "x86")]
pub use native::Native;

#[cfg(target_arch = "x86")]
mod native {
    use core::arch::asm;

    use super::{KernelServices, Platform, ProcessorState};
    use crate::cpu;
    use crate::cpu::cpuid::{self, CPUFeatures};
    use crate::cpu::gdt::DescriptorPointer;
    use crate::cpu::io::{Port, PortIO};
    use crate::cpu::msr;
    use crate::cpu::pit::Pit;
    use crate::mm::io::MemoryIO;
    use crate::mm::{MemoryError, PhysicalAddress, VirtualAddress};

    /// Bare-metal platform: real ports, MMIO and MSRs, the PIT for delays.
    pub struct Native<K: KernelServices> {
        kernel: K,
    }

    impl<K: KernelServices> Native<K> {
        pub const fn new(kernel: K) -> Self {
            Native { kernel }
        }
    }

    impl<K: KernelServices> PortIO for Native<K> {
        fn read_port(&self, port: u16) -> u8 {
            Port::new(port, true).read_u8()
        }

        fn write_port(&self, port: u16, value: u8) {
            Port::new(port, false).write_u8(value)
        }

        fn io_wait(&self) {
            cpu::io::wait();
        }
    }

    impl<K: KernelServices> Platform for Native<K> {
        fn read_mmio(&self, address: VirtualAddress) -> u32 {
            MemoryIO::new(address, true).read_u32()
        }

        fn write_mmio(&self, address: VirtualAddress, value: u32) {
            MemoryIO::new(address, false).write_u32(value)
        }

        fn read_msr(&self, msr: u32) -> u64 {
            msr::read_msr(msr)
        }

        fn write_msr(&self, msr: u32, value: u64) {
            msr::write_msr(msr, value)
        }

        fn cpu_features(&self) -> CPUFeatures {
            cpuid::probe_cpu_features()
        }

        fn map_mmio(
            &self,
            phys: PhysicalAddress,
            size: usize,
        ) -> Result<VirtualAddress, MemoryError> {
            self.kernel.map_mmio(phys, size)
        }

        fn map_identity(
            &self,
            phys: PhysicalAddress,
            size: usize,
        ) -> Result<VirtualAddress, MemoryError> {
            self.kernel.map_identity(phys, size)
        }

        fn map_physical(
            &self,
            phys: PhysicalAddress,
            size: usize,
        ) -> Result<VirtualAddress, MemoryError> {
            self.kernel.map_physical(phys, size)
        }

        fn unmap(&self, virt: VirtualAddress, size: usize) {
            self.kernel.unmap(virt, size)
        }

        fn busy_wait_ns(&self, ns: u64) {
            Pit::busy_wait_ns(self, ns)
        }

        fn pause(&self) {
            cpu::pause()
        }

        fn interrupts_enabled(&self) -> bool {
            cpu::are_enabled()
        }

        fn enable_interrupts(&self) {
            cpu::enable_interrupts()
        }

        fn disable_interrupts(&self) {
            cpu::disable_interrupts()
        }

        fn processor_state(&self) -> ProcessorState {
            let mut gdtr = DescriptorPointer::default();
            let mut idtr = DescriptorPointer::default();
            let (cr0, cr3, cr4): (u32, u32, u32);
            unsafe {
                asm!(
                    "sgdt [{}]",
                    in(reg) &mut gdtr as *mut DescriptorPointer,
                    options(nostack, preserves_flags)
                );
                asm!(
                    "sidt [{}]",
                    in(reg) &mut idtr as *mut DescriptorPointer,
                    options(nostack, preserves_flags)
                );
                asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
                asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
                asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
            }

            ProcessorState {
                gdtr,
                idtr,
                cr0,
                cr3,
                cr4,
            }
        }

        fn yield_now(&self) {
            self.kernel.yield_now()
        }
    }
}
