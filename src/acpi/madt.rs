extern crate alloc;
extern crate log;
extern crate spin;

use alloc::vec::Vec;
use bit_field::BitField;
use bitflags::bitflags;
use core::fmt;
use core::mem;
use spin::Once;

use crate::acpi::rsdt::{self, RSDPDescriptor, SDTHeader};
use crate::mm::PhysicalAddress;

use rsdt::read_struct;

const MADT_SIG: &[u8; 4] = b"APIC";

// MADT entry types
const ENTRY_PROCESSOR_LAPIC: u8 = 0;
const ENTRY_IOAPIC: u8 = 1;
const ENTRY_SOURCE_OVERRIDE: u8 = 2;
const ENTRY_NMI_SOURCE: u8 = 3;
const ENTRY_LAPIC_NMI: u8 = 4;
const ENTRY_LAPIC_ADDRESS_OVERRIDE: u8 = 5;

/// processor id of a local APIC NMI record that applies to every CPU.
pub const ALL_PROCESSORS: u8 = 0xFF;

bitflags! {
    pub struct MADTFlags: u32 {
        /// the system also has a PC/AT dual 8259 setup
        const PCAT_COMPAT = 1 << 0;
    }
}

bitflags! {
    pub struct LocalApicFlags: u32 {
        const ENABLED = 1 << 0;
        const ONLINE_CAPABLE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MADTError {
    InvalidSignature,
    InvalidChecksum,
    InvalidLength,
    /// an entry advertising length 0 would loop forever.
    ZeroLengthEntry { offset: usize },
    TruncatedEntry { offset: usize },
    UnsupportedRevision(u8),
}

impl fmt::Display for MADTError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MADTError::InvalidSignature => write!(f, "not a MADT"),
            MADTError::InvalidChecksum => write!(f, "MADT checksum mismatch"),
            MADTError::InvalidLength => write!(f, "MADT length out of bounds"),
            MADTError::ZeroLengthEntry { offset } => {
                write!(f, "MADT entry at offset {} has length 0", offset)
            }
            MADTError::TruncatedEntry { offset } => {
                write!(f, "MADT entry at offset {} runs past the table", offset)
            }
            MADTError::UnsupportedRevision(rev) => {
                write!(f, "RSDP revision {} is not supported", rev)
            }
        }
    }
}

/// Pin polarity as encoded in MPS INTI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// conforms to the bus, active high on ISA
    Bus,
    ActiveHigh,
    ActiveLow,
}

/// Trigger mode as encoded in MPS INTI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// conforms to the bus, edge on ISA
    Bus,
    Edge,
    Level,
}

/// Polarity and trigger mode bits shared by overrides and NMI records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntiFlags(pub u16);

impl IntiFlags {
    pub fn polarity(&self) -> Polarity {
        match self.0.get_bits(0..2) {
            0b01 => Polarity::ActiveHigh,
            0b11 => Polarity::ActiveLow,
            // 0b10 is reserved
            _ => Polarity::Bus,
        }
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        match self.0.get_bits(2..4) {
            0b01 => TriggerMode::Edge,
            0b11 => TriggerMode::Level,
            _ => TriggerMode::Bus,
        }
    }
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct PerProcessorLAPIC {
    pub processor_id: u8,
    pub apic_id: u8,
    flags: u32,
}

impl PerProcessorLAPIC {
    pub fn new(processor_id: u8, apic_id: u8, enabled: bool) -> Self {
        let flags = if enabled {
            LocalApicFlags::ENABLED.bits()
        } else {
            0
        };

        PerProcessorLAPIC {
            processor_id,
            apic_id,
            flags,
        }
    }

    pub fn flags(&self) -> LocalApicFlags {
        LocalApicFlags::from_bits_truncate(self.flags)
    }

    /// disabled processors must not be started
    pub fn is_enabled(&self) -> bool {
        self.flags().contains(LocalApicFlags::ENABLED)
    }
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct PerProcessorIOAPIC {
    pub ioapic_id: u8,
    reserved: u8,
    pub mmio_address: u32,
    pub gsi_base: u32,
}

impl PerProcessorIOAPIC {
    pub fn new(ioapic_id: u8, mmio_address: u32, gsi_base: u32) -> Self {
        PerProcessorIOAPIC {
            ioapic_id,
            reserved: 0,
            mmio_address,
            gsi_base,
        }
    }
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct InterruptSourceOverride {
    pub bus: u8,
    pub irq: u8,
    pub gsi: u32,
    pub flags: u16,
}

impl InterruptSourceOverride {
    pub fn new(irq: u8, gsi: u32, flags: u16) -> Self {
        InterruptSourceOverride {
            bus: 0,
            irq,
            gsi,
            flags,
        }
    }

    pub fn inti_flags(&self) -> IntiFlags {
        IntiFlags(self.flags)
    }
}

/// A GSI wired to NMI rather than to a device.
#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct NmiSource {
    pub flags: u16,
    pub gsi: u32,
}

impl NmiSource {
    pub fn inti_flags(&self) -> IntiFlags {
        IntiFlags(self.flags)
    }
}

/// Which LINT pin of a processor carries NMI.
#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct LocalApicNmi {
    pub processor_id: u8,
    pub flags: u16,
    pub lint: u8,
}

impl LocalApicNmi {
    pub fn inti_flags(&self) -> IntiFlags {
        IntiFlags(self.flags)
    }

    #[inline]
    pub fn applies_to(&self, processor_id: u8) -> bool {
        self.processor_id == ALL_PROCESSORS || self.processor_id == processor_id
    }
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
struct LocalApicAddressOverride {
    reserved: u16,
    address: u64,
}

// some helper LAPIC structs
#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
struct LAPICRootHeader {
    pub header: SDTHeader,
    pub lapic_phy_addr: u32,
    pub lapic_flags: u32,
}

#[derive(Debug, Copy, Clone)]
#[repr(C, packed)]
struct LAPICEntry {
    pub entry_type: u8,
    pub entry_size: u8,
}

/// Everything the interrupt core needs from the MADT, detached from
/// firmware memory.
#[derive(Debug, Clone)]
pub struct MultiProcessorInfo {
    pub cores: Vec<PerProcessorLAPIC>,
    pub ioapics: Vec<PerProcessorIOAPIC>,
    pub isos: Vec<InterruptSourceOverride>,
    pub nmi_sources: Vec<NmiSource>,
    pub lapic_nmis: Vec<LocalApicNmi>,
    pub lapic_address: PhysicalAddress,
    pub pcat_compat: bool,
}

impl MultiProcessorInfo {
    pub fn enabled_cores(&self) -> impl Iterator<Item = &PerProcessorLAPIC> {
        self.cores.iter().filter(|core| core.is_enabled())
    }

    /// NMI record of `processor_id`, a dedicated one wins over the wildcard.
    pub fn nmi_for(&self, processor_id: u8) -> Option<LocalApicNmi> {
        let exact = self
            .lapic_nmis
            .iter()
            .find(|nmi| nmi.processor_id == processor_id);
        exact
            .or_else(|| self.lapic_nmis.iter().find(|nmi| nmi.applies_to(processor_id)))
            .copied()
    }
}

/// Iterates the variable length records after the MADT header,
/// yielding (type, body, offset).
struct EntryIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<(u8, &'a [u8], usize), MADTError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }

        let offset = self.offset;
        let entry: LAPICEntry = match read_struct(&self.bytes[offset..]) {
            Some(entry) => entry,
            None => {
                self.offset = self.bytes.len();
                return Some(Err(MADTError::TruncatedEntry { offset }));
            }
        };

        let size = entry.entry_size as usize;
        if size == 0 {
            self.offset = self.bytes.len();
            return Some(Err(MADTError::ZeroLengthEntry { offset }));
        }

        if size < mem::size_of::<LAPICEntry>() || offset + size > self.bytes.len() {
            self.offset = self.bytes.len();
            return Some(Err(MADTError::TruncatedEntry { offset }));
        }

        self.offset += size;
        let body = &self.bytes[offset + mem::size_of::<LAPICEntry>()..offset + size];
        Some(Ok((entry.entry_type, body, offset)))
    }
}

fn body_size(entry_type: u8) -> usize {
    match entry_type {
        ENTRY_PROCESSOR_LAPIC => mem::size_of::<PerProcessorLAPIC>(),
        ENTRY_IOAPIC => mem::size_of::<PerProcessorIOAPIC>(),
        ENTRY_SOURCE_OVERRIDE => mem::size_of::<InterruptSourceOverride>(),
        ENTRY_NMI_SOURCE => mem::size_of::<NmiSource>(),
        ENTRY_LAPIC_NMI => mem::size_of::<LocalApicNmi>(),
        ENTRY_LAPIC_ADDRESS_OVERRIDE => mem::size_of::<LocalApicAddressOverride>(),
        _ => 0,
    }
}

/// A validated MADT. The per-type collections are built on first use.
pub struct MADT<'a> {
    entries: &'a [u8],
    lapic_phy_addr: u32,
    flags: MADTFlags,
    processors: Once<Vec<PerProcessorLAPIC>>,
    ioapics: Once<Vec<PerProcessorIOAPIC>>,
    overrides: Once<Vec<InterruptSourceOverride>>,
    nmi_sources: Once<Vec<NmiSource>>,
    lapic_nmis: Once<Vec<LocalApicNmi>>,
    address_override: Once<Option<u64>>,
}

impl<'a> MADT<'a> {
    pub fn parse(rsdp: &RSDPDescriptor, bytes: &'a [u8]) -> Result<MADT<'a>, MADTError> {
        if rsdp.revision() != 0 {
            log::error!("ACPI revision {} tables are not supported", rsdp.revision());
            return Err(MADTError::UnsupportedRevision(rsdp.revision()));
        }

        let root: LAPICRootHeader = read_struct(bytes).ok_or(MADTError::InvalidLength)?;
        if &root.header.signature != MADT_SIG {
            return Err(MADTError::InvalidSignature);
        }

        let length = root.header.length();
        if length < mem::size_of::<LAPICRootHeader>() || length > bytes.len() {
            return Err(MADTError::InvalidLength);
        }

        if !rsdt::checksum_ok(&bytes[..length]) {
            log::error!("MADT checksum mismatch");
            return Err(MADTError::InvalidChecksum);
        }

        let entries = &bytes[mem::size_of::<LAPICRootHeader>()..length];
        let madt = MADT {
            entries,
            lapic_phy_addr: root.lapic_phy_addr,
            flags: MADTFlags::from_bits_truncate(root.lapic_flags),
            processors: Once::new(),
            ioapics: Once::new(),
            overrides: Once::new(),
            nmi_sources: Once::new(),
            lapic_nmis: Once::new(),
            address_override: Once::new(),
        };

        // validate once so the lazy walks below never meet a bad entry
        for entry in madt.iter() {
            let (entry_type, body, offset) = entry?;
            let expected = body_size(entry_type);
            if body.len() < expected {
                return Err(MADTError::TruncatedEntry { offset });
            }
        }

        log::debug!("APIC Tables size: {}", entries.len());
        Ok(madt)
    }

    fn iter(&self) -> EntryIter<'a> {
        EntryIter {
            bytes: self.entries,
            offset: 0,
        }
    }

    fn collect<T: Copy>(&self, wanted: u8) -> Vec<T> {
        self.iter()
            .filter_map(|entry| entry.ok())
            .filter(|(entry_type, _, _)| *entry_type == wanted)
            .filter_map(|(_, body, _)| read_struct::<T>(body))
            .collect()
    }

    pub fn flags(&self) -> MADTFlags {
        self.flags
    }

    pub fn processors(&self) -> &[PerProcessorLAPIC] {
        self.processors.call_once(|| self.collect(ENTRY_PROCESSOR_LAPIC))
    }

    pub fn ioapics(&self) -> &[PerProcessorIOAPIC] {
        self.ioapics.call_once(|| self.collect(ENTRY_IOAPIC))
    }

    pub fn overrides(&self) -> &[InterruptSourceOverride] {
        self.overrides.call_once(|| self.collect(ENTRY_SOURCE_OVERRIDE))
    }

    pub fn nmi_sources(&self) -> &[NmiSource] {
        self.nmi_sources.call_once(|| self.collect(ENTRY_NMI_SOURCE))
    }

    pub fn lapic_nmis(&self) -> &[LocalApicNmi] {
        self.lapic_nmis.call_once(|| self.collect(ENTRY_LAPIC_NMI))
    }

    /// the 64-bit override (type 5) wins over the header field.
    pub fn lapic_address(&self) -> PhysicalAddress {
        let overridden = self.address_override.call_once(|| {
            self.collect::<LocalApicAddressOverride>(ENTRY_LAPIC_ADDRESS_OVERRIDE)
                .first()
                .map(|entry| entry.address)
        });

        match overridden {
            Some(address) => PhysicalAddress::from_u64(*address),
            None => PhysicalAddress::from_u64(self.lapic_phy_addr as u64),
        }
    }

    pub fn probe_cpu_cores(&self) -> MultiProcessorInfo {
        let info = MultiProcessorInfo {
            cores: self.processors().to_vec(),
            ioapics: self.ioapics().to_vec(),
            isos: self.overrides().to_vec(),
            nmi_sources: self.nmi_sources().to_vec(),
            lapic_nmis: self.lapic_nmis().to_vec(),
            lapic_address: self.lapic_address(),
            pcat_compat: self.flags.contains(MADTFlags::PCAT_COMPAT),
        };

        log::info!(
            "Number of CPU cores: {}, Local APIC Address: 0x{:x}",
            info.cores.len(),
            info.lapic_address
        );

        for proc in &info.cores {
            let (processor_id, apic_id) = (proc.processor_id, proc.apic_id);
            log::debug!(
                "CPU-{} - {} enabled={}",
                processor_id,
                apic_id,
                proc.is_enabled()
            );
        }

        info
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::acpi::rsdt::testing::{fix_checksum, sdt_header};
    use std::vec::Vec;

    /// Assembles MADT images for tests.
    pub struct MadtBuilder {
        lapic_address: u32,
        flags: u32,
        body: Vec<u8>,
    }

    impl MadtBuilder {
        pub fn new(lapic_address: u32, flags: u32) -> Self {
            MadtBuilder {
                lapic_address,
                flags,
                body: Vec::new(),
            }
        }

        pub fn raw(mut self, entry_type: u8, length: u8, body: &[u8]) -> Self {
            self.body.push(entry_type);
            self.body.push(length);
            self.body.extend_from_slice(body);
            self
        }

        pub fn processor(self, processor_id: u8, apic_id: u8, enabled: bool) -> Self {
            let mut body = std::vec![processor_id, apic_id];
            body.extend_from_slice(&(enabled as u32).to_le_bytes());
            self.raw(ENTRY_PROCESSOR_LAPIC, 8, &body)
        }

        pub fn ioapic(self, id: u8, address: u32, gsi_base: u32) -> Self {
            let mut body = std::vec![id, 0];
            body.extend_from_slice(&address.to_le_bytes());
            body.extend_from_slice(&gsi_base.to_le_bytes());
            self.raw(ENTRY_IOAPIC, 12, &body)
        }

        pub fn source_override(self, irq: u8, gsi: u32, flags: u16) -> Self {
            let mut body = std::vec![0, irq];
            body.extend_from_slice(&gsi.to_le_bytes());
            body.extend_from_slice(&flags.to_le_bytes());
            self.raw(ENTRY_SOURCE_OVERRIDE, 10, &body)
        }

        pub fn nmi_source(self, flags: u16, gsi: u32) -> Self {
            let mut body = Vec::new();
            body.extend_from_slice(&flags.to_le_bytes());
            body.extend_from_slice(&gsi.to_le_bytes());
            self.raw(ENTRY_NMI_SOURCE, 8, &body)
        }

        pub fn lapic_nmi(self, processor_id: u8, flags: u16, lint: u8) -> Self {
            let mut body = std::vec![processor_id];
            body.extend_from_slice(&flags.to_le_bytes());
            body.push(lint);
            self.raw(ENTRY_LAPIC_NMI, 6, &body)
        }

        pub fn address_override(self, address: u64) -> Self {
            let mut body = std::vec![0, 0];
            body.extend_from_slice(&address.to_le_bytes());
            self.raw(ENTRY_LAPIC_ADDRESS_OVERRIDE, 12, &body)
        }

        pub fn build(self) -> Vec<u8> {
            let length = (44 + self.body.len()) as u32;
            let mut bytes = sdt_header(b"APIC", length);
            bytes.extend_from_slice(&self.lapic_address.to_le_bytes());
            bytes.extend_from_slice(&self.flags.to_le_bytes());
            bytes.extend_from_slice(&self.body);
            fix_checksum(&mut bytes, 9);
            bytes
        }
    }
}
