extern crate alloc;
extern crate log;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::apic::lapic::LocalApicRegisters;
use crate::apic::registers::Level;
use crate::apic::{
    Apic, ApicBackend, ApicError, ControllerState, AP_STACK_SIZE, MAX_CPUS, TRAMPOLINE_ADDR,
};
use crate::cpu::cmos::{CMOS_SHUTDOWN_STATUS, SHUTDOWN_JUMP_WARM_RESET};
use crate::cpu::gdt::{DescriptorPointer, GlobalDescriptorTable};
use crate::mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::platform::Platform;

/// BIOS data area word pair 0040:0067, the far pointer a warm reset
/// jumps through.
const WARM_RESET_VECTOR: u64 = 0x467;
const WARM_RESET_VECTOR_SIZE: usize = 4;

/// Real-mode startup code plus the offsets of the slots the BSP fills
/// in before any AP is woken.
#[derive(Clone, Copy)]
pub struct TrampolineBlob {
    pub code: &'static [u8],
    /// 6-byte pseudo descriptors
    pub gdtr: usize,
    pub idtr: usize,
    /// 32-bit control registers
    pub cr0: usize,
    pub cr3: usize,
    pub cr4: usize,
    /// pointer to `[DescriptorPointer; n]` indexed by APIC id
    pub gdts: usize,
    /// pointer to `[usize; n]` of stack tops indexed by APIC id
    pub stacks: usize,
    /// address of `entry_point`
    pub entry: usize,
    pub entry_point: extern "C" fn(u32),
}

impl TrampolineBlob {
    /// The blob has to fit the trampoline page and every slot has to lie inside the blob.
    pub fn validate(&self) -> Result<(), ApicError> {
        if self.code.len() > PAGE_SIZE {
            log::error!("trampoline is {} bytes, more than a page", self.code.len());
            return Err(ApicError::OutOfRange);
        }

        let pointer = mem::size_of::<usize>();
        let slots = [
            (self.gdtr, mem::size_of::<DescriptorPointer>()),
            (self.idtr, mem::size_of::<DescriptorPointer>()),
            (self.cr0, 4),
            (self.cr3, 4),
            (self.cr4, 4),
            (self.gdts, pointer),
            (self.stacks, pointer),
            (self.entry, pointer),
        ];

        if slots
            .iter()
            .any(|(offset, size)| offset + size > self.code.len())
        {
            return Err(ApicError::OutOfRange);
        }

        Ok(())
    }
}

/// APs are started by APIC id and report back in one 64-bit word, so
/// the ids of every listed processor, enabled or not, have to be `0..n`
/// with `n <= 64`.
pub fn check_cpu_ids(ids: &[u8]) -> Result<(), ApicError> {
    if ids.iter().any(|id| *id as usize >= MAX_CPUS) {
        return Err(ApicError::OutOfRange);
    }

    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    if sorted
        .iter()
        .enumerate()
        .any(|(index, id)| *id as usize != index)
    {
        return Err(ApicError::NotContiguous);
    }

    Ok(())
}

#[inline]
unsafe fn write_slot<T>(page: VirtualAddress, offset: usize, value: T) {
    ptr::write_unaligned(page.offset(offset).get_mut_ptr::<T>(), value);
}

impl<P: Platform> Apic<P> {
    /// Wakes every enabled AP with INIT-SIPI-SIPI. Returns the
    /// `running_aps` bitmap; CPUs that did not answer are logged and left
    /// out.
    pub fn startup_smp(&self, blob: &TrampolineBlob) -> Result<u64, ApicError> {
        match self.state() {
            ControllerState::ApicEnabled => {}
            ControllerState::SmpEnabled => return Err(ApicError::AlreadyInitialized),
            _ => return Err(ApicError::NotSupported),
        }

        let backend = self.backend().ok_or(ApicError::NotSupported)?;
        blob.validate()?;

        let slots = backend.slot_ids();
        if let Err(err) = check_cpu_ids(&slots) {
            log::error!("SMP disabled, staying single core: {}", err);
            return Err(err);
        }

        if self.smp_started.swap(true, Ordering::AcqRel) {
            return Err(ApicError::AlreadyInitialized);
        }

        let aps: Vec<u8> = backend
            .cpu_ids()
            .into_iter()
            .filter(|id| *id != backend.bsp_id)
            .collect();

        let platform = self.platform.as_ref();
        let interrupts_were_enabled = platform.interrupts_enabled();
        platform.disable_interrupts();
        self.cmos.disable_nmi(platform);

        let result = if aps.is_empty() {
            Ok(())
        } else {
            self.boot_aps(backend, blob, &aps, slots.len())
        };

        self.cmos.enable_nmi(platform);
        if interrupts_were_enabled {
            platform.enable_interrupts();
        }

        result?;
        self.set_state(ControllerState::SmpEnabled);

        let running = self.running_aps();
        log::info!(
            "SMP: {} of {} application processors running (0x{:x})",
            running.count_ones(),
            aps.len(),
            running
        );
        Ok(running)
    }

    fn boot_aps(
        &self,
        backend: &ApicBackend<P>,
        blob: &TrampolineBlob,
        aps: &[u8],
        slots: usize,
    ) -> Result<(), ApicError> {
        let platform = self.platform.as_ref();

        // pointer tables the trampoline indexes by APIC id; they only
        // have to live until every AP has loaded its GDT and stack
        let mut stack_tops: Vec<usize> = vec![0; slots];
        let mut gdt_pointers: Vec<DescriptorPointer> = vec![DescriptorPointer::default(); slots];
        {
            let mut stacks = self.ap_stacks.lock();
            let mut gdts = self.ap_gdts.lock();
            for cpu in aps.iter().map(|cpu| *cpu as usize) {
                let stack: Box<[u8]> = vec![0u8; AP_STACK_SIZE].into_boxed_slice();
                let stack_top = stack.as_ptr() as usize + AP_STACK_SIZE;
                let gdt = GlobalDescriptorTable::new_for_processor(stack_top as u32);

                stack_tops[cpu] = stack_top;
                gdt_pointers[cpu] = gdt.as_pointer();
                stacks.push(stack);
                gdts.push(gdt);
            }
        }

        let trampoline = PhysicalAddress::from_u64(TRAMPOLINE_ADDR);
        let page = platform.map_identity(trampoline, PAGE_SIZE)?;
        let state = platform.processor_state();

        unsafe {
            ptr::copy_nonoverlapping(blob.code.as_ptr(), page.get_mut_ptr::<u8>(), blob.code.len());
            write_slot(page, blob.gdtr, state.gdtr.to_bytes());
            write_slot(page, blob.idtr, state.idtr.to_bytes());
            write_slot(page, blob.cr0, state.cr0);
            write_slot(page, blob.cr3, state.cr3);
            write_slot(page, blob.cr4, state.cr4);
            write_slot(page, blob.gdts, gdt_pointers.as_ptr() as usize);
            write_slot(page, blob.stacks, stack_tops.as_ptr() as usize);
            write_slot(page, blob.entry, blob.entry_point as usize);
        }

        let regs = LocalApicRegisters::new(platform, backend.mode);
        let warm_reset = match regs.version() {
            Ok(version) if !version.is_integrated() => match self.prepare_warm_reset() {
                Ok(vector) => Some(vector),
                Err(err) => {
                    platform.unmap(page, PAGE_SIZE);
                    return Err(err);
                }
            },
            Ok(_) => None,
            Err(err) => {
                platform.unmap(page, PAGE_SIZE);
                return Err(err);
            }
        };

        let result = aps
            .iter()
            .try_for_each(|cpu| self.wake_ap(&regs, trampoline, *cpu));

        if let Some(vector) = warm_reset {
            self.cmos.write_register(platform, CMOS_SHUTDOWN_STATUS, 0);
            platform.unmap(vector, WARM_RESET_VECTOR_SIZE);
        }
        platform.unmap(page, PAGE_SIZE);

        result
    }

    /// Discrete APICs ignore STARTUP, they come up through the BIOS warm
    /// reset path instead: shutdown code 0x0A plus the far pointer at
    /// 0040:0067.
    fn prepare_warm_reset(&self) -> Result<VirtualAddress, ApicError> {
        let platform = self.platform.as_ref();
        self.cmos
            .write_register(platform, CMOS_SHUTDOWN_STATUS, SHUTDOWN_JUMP_WARM_RESET);

        let vector = platform.map_physical(
            PhysicalAddress::from_u64(WARM_RESET_VECTOR),
            WARM_RESET_VECTOR_SIZE,
        )?;
        let offset = (TRAMPOLINE_ADDR & 0xf) as u16;
        let segment = (TRAMPOLINE_ADDR >> 4) as u16;
        unsafe {
            write_slot(vector, 0, offset);
            write_slot(vector, 2, segment);
        }

        log::debug!("warm reset vector set to {:04x}:{:04x}", segment, offset);
        Ok(vector)
    }

    fn wake_ap(
        &self,
        regs: &LocalApicRegisters<P>,
        trampoline: PhysicalAddress,
        cpu: u8,
    ) -> Result<(), ApicError> {
        let platform = self.platform.as_ref();

        regs.clear_errors()?;
        regs.send_init_ipi(cpu, Level::Assert)?;
        regs.send_init_ipi(cpu, Level::Deassert)?;
        platform.busy_wait_ns(self.config.init_deassert_wait_ns);

        for _ in 0..2 {
            regs.clear_errors()?;
            regs.send_startup_ipi(cpu, trampoline)?;
            platform.busy_wait_ns(self.config.startup_wait_ns);
        }

        if self.wait_for_ap(cpu) {
            log::debug!("cpu {} reported running", cpu);
        } else {
            log::warn!("{}", ApicError::ApTimeout(cpu));
        }
        Ok(())
    }

    fn wait_for_ap(&self, cpu: u8) -> bool {
        let bit = 1u64 << cpu;
        for _ in 0..self.config.ap_poll_attempts {
            if self.running_aps() & bit != 0 {
                return true;
            }
            self.platform.busy_wait_ns(self.config.ap_poll_interval_ns);
        }
        self.running_aps() & bit != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn nowhere(_cpu: u32) {}

    static CODE: [u8; 64] = [0; 64];

    fn blob(code: &'static [u8]) -> TrampolineBlob {
        TrampolineBlob {
            code,
            gdtr: 0,
            idtr: 8,
            cr0: 16,
            cr3: 20,
            cr4: 24,
            gdts: 32,
            stacks: 40,
            entry: 48,
            entry_point: nowhere,
        }
    }

    #[test]
    fn slots_must_lie_inside_the_blob() {
        assert_eq!(blob(&CODE).validate(), Ok(()));
        assert_eq!(blob(&CODE[..50]).validate(), Err(ApicError::OutOfRange));
    }

    #[test]
    fn blob_must_fit_a_page() {
        static BIG: [u8; PAGE_SIZE + 1] = [0; PAGE_SIZE + 1];
        assert_eq!(blob(&BIG).validate(), Err(ApicError::OutOfRange));
    }

    #[test]
    fn cpu_ids_must_be_a_prefix_below_64() {
        let all: Vec<u8> = (0..64).collect();
        assert_eq!(check_cpu_ids(&all), Ok(()));
        assert_eq!(check_cpu_ids(&[2, 0, 1]), Ok(()));

        let too_many: Vec<u8> = (0..65).collect();
        assert_eq!(check_cpu_ids(&too_many), Err(ApicError::OutOfRange));
        assert_eq!(check_cpu_ids(&[0, 2]), Err(ApicError::NotContiguous));
    }

    #[test]
    fn startup_vector_is_the_trampoline_page() {
        assert_eq!(PhysicalAddress::from_u64(TRAMPOLINE_ADDR).page_number(), 8);
    }
}
