extern crate alloc;
extern crate log;
extern crate spin;

use alloc::vec::Vec;
use spin::Mutex;

use crate::acpi::madt::{
    InterruptSourceOverride, NmiSource, PerProcessorIOAPIC, Polarity,
    TriggerMode as InterruptTrigger,
};
use crate::apic::registers::{DeliveryMode, IoApicVersion, PinPolarity, RedtblEntry, TriggerMode};
use crate::apic::ApicError;
use crate::cpu::interrupts::HARDWARE_INTERRUPTS_BASE;
use crate::mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::platform::Platform;

pub enum IOAPICMMIOCommands {
    IOAPICRegisterSelect = 0x00,
    IOAPICRegisterWindow = 0x10,
    IOAPICRegisterEoi = 0x40,
}

/// indirect registers behind the select/window pair
const IOAPIC_REG_ID: u32 = 0x00;
const IOAPIC_REG_VERSION: u32 = 0x01;
const IOAPIC_REG_REDTBL_BASE: u32 = 0x10;

#[inline]
fn apply_polarity(entry: &mut RedtblEntry, polarity: Polarity) {
    match polarity {
        Polarity::ActiveHigh => entry.pin_polarity = PinPolarity::High,
        Polarity::ActiveLow => entry.pin_polarity = PinPolarity::Low,
        Polarity::Bus => {}
    }
}

#[inline]
fn apply_trigger(entry: &mut RedtblEntry, trigger: InterruptTrigger) {
    match trigger {
        InterruptTrigger::Edge => entry.trigger_mode = TriggerMode::Edge,
        InterruptTrigger::Level => entry.trigger_mode = TriggerMode::Level,
        InterruptTrigger::Bus => {}
    }
}

/// The single I/O APIC of the system. All access goes through the
/// select/window pair, so every indirect access holds `window`.
#[derive(Debug)]
pub struct IoApic {
    pub id: u8,
    pub phys_base: PhysicalAddress,
    pub virt_base: VirtualAddress,
    pub gsi_base: u32,
    pub gsi_max: u32,
    pub version: u8,
    pub direct_eoi: bool,
    pub nmi_sources: Vec<NmiSource>,
    window: Mutex<()>,
}

impl IoApic {
    /// Maps the chip described by `entry` and sizes its redirection table.
    pub fn initialize<P: Platform>(
        platform: &P,
        entry: &PerProcessorIOAPIC,
    ) -> Result<IoApic, ApicError> {
        let phys_base = PhysicalAddress::from_u64(entry.mmio_address as u64);
        let virt_base = platform.map_mmio(phys_base, PAGE_SIZE)?;

        let mut ioapic = IoApic {
            id: entry.ioapic_id,
            phys_base,
            virt_base,
            gsi_base: entry.gsi_base,
            gsi_max: entry.gsi_base,
            version: 0,
            direct_eoi: false,
            nmi_sources: Vec::new(),
            window: Mutex::new(()),
        };

        let version = IoApicVersion::from_raw(ioapic.read_register(platform, IOAPIC_REG_VERSION));
        ioapic.version = version.version;
        ioapic.direct_eoi = version.has_directed_eoi();
        ioapic.gsi_max = ioapic.gsi_base + version.max_redirection_entry as u32;

        log::info!(
            "I/O APIC {} version=0x{:x}, GSI {}..={}, registers at 0x{:x} -> 0x{:x}",
            ioapic.id,
            ioapic.version,
            ioapic.gsi_base,
            ioapic.gsi_max,
            phys_base,
            virt_base
        );
        Ok(ioapic)
    }

    #[inline]
    pub fn contains(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi <= self.gsi_max
    }

    /// number of redirection table entries.
    pub fn entries(&self) -> u32 {
        self.gsi_max - self.gsi_base + 1
    }

    #[inline]
    fn mmio(&self, register: IOAPICMMIOCommands) -> VirtualAddress {
        self.virt_base.offset(register as usize)
    }

    pub fn read_register<P: Platform>(&self, platform: &P, register: u32) -> u32 {
        let _window = self.window.lock();
        platform.write_mmio(self.mmio(IOAPICMMIOCommands::IOAPICRegisterSelect), register);
        platform.read_mmio(self.mmio(IOAPICMMIOCommands::IOAPICRegisterWindow))
    }

    pub fn write_register<P: Platform>(&self, platform: &P, register: u32, value: u32) {
        let _window = self.window.lock();
        platform.write_mmio(self.mmio(IOAPICMMIOCommands::IOAPICRegisterSelect), register);
        platform.write_mmio(self.mmio(IOAPICMMIOCommands::IOAPICRegisterWindow), value);
    }

    pub fn read_id<P: Platform>(&self, platform: &P) -> u8 {
        (self.read_register(platform, IOAPIC_REG_ID) >> 24) as u8
    }

    #[inline]
    fn redtbl_register(&self, gsi: u32) -> Result<u32, ApicError> {
        if !self.contains(gsi) {
            return Err(ApicError::OutOfRange);
        }
        Ok(IOAPIC_REG_REDTBL_BASE + (gsi - self.gsi_base) * 2)
    }

    pub fn read_redtbl<P: Platform>(&self, platform: &P, gsi: u32) -> Result<RedtblEntry, ApicError> {
        let register = self.redtbl_register(gsi)?;
        let low = self.read_register(platform, register) as u64;
        let high = self.read_register(platform, register + 1) as u64;
        Ok(RedtblEntry::from_raw((high << 32) | low))
    }

    /// high half first: the low half holds the mask bit.
    pub fn write_redtbl<P: Platform>(
        &self,
        platform: &P,
        gsi: u32,
        entry: RedtblEntry,
    ) -> Result<(), ApicError> {
        let register = self.redtbl_register(gsi)?;
        let raw = entry.to_raw();
        self.write_register(platform, register + 1, (raw >> 32) as u32);
        self.write_register(platform, register, raw as u32);
        Ok(())
    }

    /// Programs every entry masked and routed to the BSP, then applies
    /// the firmware overrides and NMI sources.
    pub fn initialize_redtbl<P: Platform>(
        &mut self,
        platform: &P,
        bsp_id: u8,
        overrides: &[InterruptSourceOverride],
        nmi_sources: &[NmiSource],
    ) -> Result<(), ApicError> {
        for gsi in self.gsi_base..=self.gsi_max {
            let vector = (gsi + HARDWARE_INTERRUPTS_BASE as u32) as u8;
            let mut entry = RedtblEntry::masked(vector, bsp_id);

            for iso in overrides.iter().filter(|iso| iso.gsi == gsi) {
                let flags = iso.inti_flags();
                entry.vector = iso.irq + HARDWARE_INTERRUPTS_BASE;
                apply_polarity(&mut entry, flags.polarity());
                apply_trigger(&mut entry, flags.trigger_mode());

                let (irq, target) = (iso.irq, iso.gsi);
                log::debug!("IRQ {} overridden to GSI {}", irq, target);
            }

            self.write_redtbl(platform, gsi, entry)?;
        }

        let (gsi_base, gsi_max) = (self.gsi_base, self.gsi_max);
        for nmi in nmi_sources
            .iter()
            .filter(|nmi| nmi.gsi >= gsi_base && nmi.gsi <= gsi_max)
        {
            let gsi = nmi.gsi;
            let flags = nmi.inti_flags();
            let mut entry = RedtblEntry::masked(0, bsp_id);
            entry.delivery_mode = DeliveryMode::Nmi;
            entry.masked = false;
            apply_polarity(&mut entry, flags.polarity());
            apply_trigger(&mut entry, flags.trigger_mode());
            self.write_redtbl(platform, gsi, entry)?;
            self.nmi_sources.push(*nmi);
            log::debug!("GSI {} carries NMI", gsi);
        }

        Ok(())
    }

    pub fn allow<P: Platform>(&self, platform: &P, gsi: u32) -> Result<(), ApicError> {
        let mut entry = self.read_redtbl(platform, gsi)?;
        entry.masked = false;
        self.write_redtbl(platform, gsi, entry)
    }

    pub fn forbid<P: Platform>(&self, platform: &P, gsi: u32) -> Result<(), ApicError> {
        let mut entry = self.read_redtbl(platform, gsi)?;
        entry.masked = true;
        self.write_redtbl(platform, gsi, entry)
    }

    /// true if masked.
    pub fn status<P: Platform>(&self, platform: &P, gsi: u32) -> Result<bool, ApicError> {
        Ok(self.read_redtbl(platform, gsi)?.masked)
    }

    /// Clears Remote IRR of a level triggered entry after the local APIC
    /// EOI. Edge triggered entries need nothing.
    pub fn send_end_of_interrupt<P: Platform>(
        &self,
        platform: &P,
        vector: u8,
        gsi: u32,
    ) -> Result<(), ApicError> {
        let entry = self.read_redtbl(platform, gsi)?;
        if entry.trigger_mode == TriggerMode::Edge {
            return Ok(());
        }

        if self.direct_eoi {
            platform.write_mmio(self.mmio(IOAPICMMIOCommands::IOAPICRegisterEoi), vector as u32);
            return Ok(());
        }

        // Chips before version 0x20 have no EOI register. Linux's
        // workaround: switching the entry to edge clears Remote IRR, so
        // rewrite it masked and edge triggered, then put the original back.
        let mut edge = entry;
        edge.masked = true;
        edge.trigger_mode = TriggerMode::Edge;
        self.write_redtbl(platform, gsi, edge)?;
        self.write_redtbl(platform, gsi, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConfig, MockPlatform, IOAPIC_PHYS};

    fn chip(mock: &MockPlatform, gsi_base: u32) -> IoApic {
        IoApic::initialize(mock, &PerProcessorIOAPIC::new(1, IOAPIC_PHYS as u32, gsi_base))
            .unwrap()
    }

    #[test]
    fn version_register_sizes_the_table() {
        let mock = MockPlatform::new(MockConfig::default());
        let ioapic = chip(&mock, 0);
        assert_eq!(ioapic.version, 0x11);
        assert!(!ioapic.direct_eoi);
        assert_eq!(ioapic.gsi_max, 23);
        assert_eq!(ioapic.entries(), 24);
    }

    #[test]
    fn default_entries_are_masked_and_point_at_the_bsp() {
        let mock = MockPlatform::new(MockConfig::default());
        let mut ioapic = chip(&mock, 0);
        let overrides = [InterruptSourceOverride::new(0, 2, 0)];
        ioapic.initialize_redtbl(&mock, 0, &overrides, &[]).unwrap();

        for gsi in 0..=ioapic.gsi_max {
            let entry = ioapic.read_redtbl(&mock, gsi).unwrap();
            assert!(entry.masked);
            assert_eq!(entry.destination, 0);
            if gsi == 2 {
                assert_eq!(entry.vector, 32);
            } else {
                assert_eq!(entry.vector as u32, gsi + 32);
            }
        }
    }

    #[test]
    fn override_flags_replace_defaults_unless_bus() {
        let mock = MockPlatform::new(MockConfig::default());
        let mut ioapic = chip(&mock, 0);
        // active low, level
        let overrides = [
            InterruptSourceOverride::new(9, 9, 0b1111),
            InterruptSourceOverride::new(0, 2, 0),
        ];
        ioapic.initialize_redtbl(&mock, 0, &overrides, &[]).unwrap();

        let sci = ioapic.read_redtbl(&mock, 9).unwrap();
        assert_eq!(sci.pin_polarity, PinPolarity::Low);
        assert_eq!(sci.trigger_mode, TriggerMode::Level);

        let pit = ioapic.read_redtbl(&mock, 2).unwrap();
        assert_eq!(pit.pin_polarity, PinPolarity::High);
        assert_eq!(pit.trigger_mode, TriggerMode::Edge);
    }

    #[test]
    fn nmi_sources_are_unmasked_nmi_entries() {
        let mock = MockPlatform::new(MockConfig::default());
        let mut ioapic = chip(&mock, 0);
        let nmis = [NmiSource { flags: 0, gsi: 5 }, NmiSource { flags: 0, gsi: 99 }];
        ioapic.initialize_redtbl(&mock, 0, &[], &nmis).unwrap();

        let entry = ioapic.read_redtbl(&mock, 5).unwrap();
        assert_eq!(entry.delivery_mode, DeliveryMode::Nmi);
        assert_eq!(entry.vector, 0);
        assert!(!entry.masked);
        assert_eq!(ioapic.nmi_sources.len(), 1);
    }

    #[test]
    fn single_entry_chip_programs_exactly_one_entry() {
        let mock = MockPlatform::new(MockConfig {
            ioapic_max_entry: 0,
            ..MockConfig::default()
        });
        let mut ioapic = chip(&mock, 0);
        assert_eq!(ioapic.gsi_max, ioapic.gsi_base);

        mock.clear_events();
        ioapic.initialize_redtbl(&mock, 0, &[], &[]).unwrap();
        assert_eq!(mock.redtbl_writes(), vec![0]);
        assert_eq!(ioapic.read_redtbl(&mock, 0).unwrap().vector, 32);
    }

    #[test]
    fn gsi_outside_the_chip_is_out_of_range() {
        let mock = MockPlatform::new(MockConfig::default());
        let ioapic = chip(&mock, 0);
        assert_eq!(ioapic.allow(&mock, 24), Err(ApicError::OutOfRange));
        assert_eq!(ioapic.status(&mock, 1000), Err(ApicError::OutOfRange));

        let shifted = chip(&mock, 24);
        assert_eq!(shifted.forbid(&mock, 0), Err(ApicError::OutOfRange));
    }

    #[test]
    fn allow_and_forbid_toggle_only_the_mask() {
        let mock = MockPlatform::new(MockConfig::default());
        let mut ioapic = chip(&mock, 0);
        ioapic.initialize_redtbl(&mock, 0, &[], &[]).unwrap();

        ioapic.allow(&mock, 1).unwrap();
        assert_eq!(ioapic.status(&mock, 1), Ok(false));
        let entry = ioapic.read_redtbl(&mock, 1).unwrap();
        assert_eq!(entry.vector, 33);

        ioapic.forbid(&mock, 1).unwrap();
        assert_eq!(ioapic.status(&mock, 1), Ok(true));
    }

    #[test]
    fn directed_eoi_uses_the_eoi_register() {
        let mock = MockPlatform::new(MockConfig {
            ioapic_version: 0x20,
            ..MockConfig::default()
        });
        let mut ioapic = chip(&mock, 0);
        assert!(ioapic.direct_eoi);
        let overrides = [InterruptSourceOverride::new(4, 4, 0b1100)];
        ioapic.initialize_redtbl(&mock, 0, &overrides, &[]).unwrap();

        ioapic.send_end_of_interrupt(&mock, 36, 4).unwrap();
        assert_eq!(mock.ioapic_eoi_writes(), vec![36]);
    }

    #[test]
    fn edge_entries_need_no_ioapic_eoi() {
        let mock = MockPlatform::new(MockConfig::default());
        let mut ioapic = chip(&mock, 0);
        ioapic.initialize_redtbl(&mock, 0, &[], &[]).unwrap();

        mock.clear_events();
        ioapic.send_end_of_interrupt(&mock, 36, 4).unwrap();
        assert!(mock.redtbl_writes().is_empty());
        assert!(mock.ioapic_eoi_writes().is_empty());
    }
}
