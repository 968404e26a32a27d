//! Typed views over the 32/64-bit APIC registers. Field encodings follow
//! the IA-32 SDM vol. 3 ch. 10 and the ICH5 datasheet sec. 9.5.8.

use bit_field::BitField;

use crate::mm::PhysicalAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed = 0,
    LowestPriority = 1,
    Smi = 2,
    Reserved = 3,
    Nmi = 4,
    Init = 5,
    Startup = 6,
    ExtInt = 7,
}

impl DeliveryMode {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b111 {
            0 => DeliveryMode::Fixed,
            1 => DeliveryMode::LowestPriority,
            2 => DeliveryMode::Smi,
            3 => DeliveryMode::Reserved,
            4 => DeliveryMode::Nmi,
            5 => DeliveryMode::Init,
            6 => DeliveryMode::Startup,
            _ => DeliveryMode::ExtInt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Physical,
    Logical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Idle,
    SendPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolarity {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Deassert,
    Assert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationShorthand {
    NoShorthand,
    ToSelf,
    AllIncludingSelf,
    AllExcludingSelf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
    TscDeadline,
}

/// Divide configuration of the local APIC timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDivide {
    By1,
    By2,
    By4,
    By8,
    By16,
    By32,
    By64,
    By128,
}

impl TimerDivide {
    /// DCR encoding, bits 0, 1 and 3.
    pub fn to_register(self) -> u32 {
        match self {
            TimerDivide::By2 => 0b0000,
            TimerDivide::By4 => 0b0001,
            TimerDivide::By8 => 0b0010,
            TimerDivide::By16 => 0b0011,
            TimerDivide::By32 => 0b1000,
            TimerDivide::By64 => 0b1001,
            TimerDivide::By128 => 0b1010,
            TimerDivide::By1 => 0b1011,
        }
    }

    pub fn from_register(raw: u32) -> Self {
        match raw & 0b1011 {
            0b0000 => TimerDivide::By2,
            0b0001 => TimerDivide::By4,
            0b0010 => TimerDivide::By8,
            0b0011 => TimerDivide::By16,
            0b1000 => TimerDivide::By32,
            0b1001 => TimerDivide::By64,
            0b1010 => TimerDivide::By128,
            _ => TimerDivide::By1,
        }
    }

    pub fn divisor(self) -> u32 {
        match self {
            TimerDivide::By1 => 1,
            TimerDivide::By2 => 2,
            TimerDivide::By4 => 4,
            TimerDivide::By8 => 8,
            TimerDivide::By16 => 16,
            TimerDivide::By32 => 32,
            TimerDivide::By64 => 64,
            TimerDivide::By128 => 128,
        }
    }
}

#[inline]
fn bit(raw: u64, index: usize) -> bool {
    raw.get_bit(index)
}

/// Local vector table entry (timer, thermal, performance, LINT0/1,
/// error, CMCI). Not every field is meaningful for every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LvtEntry {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    /// read-only
    pub delivery_status: DeliveryStatus,
    pub pin_polarity: PinPolarity,
    /// read-only
    pub remote_irr: bool,
    pub trigger_mode: TriggerMode,
    pub masked: bool,
    pub timer_mode: TimerMode,
}

impl LvtEntry {
    /// {fixed, active high, edge, masked}
    pub fn masked(vector: u8) -> Self {
        LvtEntry {
            vector,
            delivery_mode: DeliveryMode::Fixed,
            delivery_status: DeliveryStatus::Idle,
            pin_polarity: PinPolarity::High,
            remote_irr: false,
            trigger_mode: TriggerMode::Edge,
            masked: true,
            timer_mode: TimerMode::OneShot,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        let raw = raw as u64;
        LvtEntry {
            vector: raw.get_bits(0..8) as u8,
            delivery_mode: DeliveryMode::from_bits(raw.get_bits(8..11)),
            delivery_status: if bit(raw, 12) {
                DeliveryStatus::SendPending
            } else {
                DeliveryStatus::Idle
            },
            pin_polarity: if bit(raw, 13) {
                PinPolarity::Low
            } else {
                PinPolarity::High
            },
            remote_irr: bit(raw, 14),
            trigger_mode: if bit(raw, 15) {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
            masked: bit(raw, 16),
            timer_mode: match raw.get_bits(17..19) {
                0 => TimerMode::OneShot,
                1 => TimerMode::Periodic,
                _ => TimerMode::TscDeadline,
            },
        }
    }

    pub fn to_raw(&self) -> u32 {
        let mut raw: u32 = 0;
        raw.set_bits(0..8, self.vector as u32);
        raw.set_bits(8..11, self.delivery_mode as u32);
        raw.set_bit(12, self.delivery_status == DeliveryStatus::SendPending);
        raw.set_bit(13, self.pin_polarity == PinPolarity::Low);
        raw.set_bit(14, self.remote_irr);
        raw.set_bit(15, self.trigger_mode == TriggerMode::Level);
        raw.set_bit(16, self.masked);
        raw.set_bits(
            17..19,
            match self.timer_mode {
                TimerMode::OneShot => 0,
                TimerMode::Periodic => 1,
                TimerMode::TscDeadline => 2,
            },
        );
        raw
    }
}

/// Spurious interrupt vector register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Svr {
    pub vector: u8,
    pub software_enable: bool,
    pub focus_checking_disabled: bool,
    pub eoi_broadcast_suppression: bool,
}

impl Svr {
    pub fn from_raw(raw: u32) -> Self {
        Svr {
            vector: raw.get_bits(0..8) as u8,
            software_enable: raw.get_bit(8),
            focus_checking_disabled: raw.get_bit(9),
            eoi_broadcast_suppression: raw.get_bit(12),
        }
    }

    pub fn to_raw(&self) -> u32 {
        let mut raw: u32 = 0;
        raw.set_bits(0..8, self.vector as u32);
        raw.set_bit(8, self.software_enable);
        raw.set_bit(9, self.focus_checking_disabled);
        raw.set_bit(12, self.eoi_broadcast_suppression);
        raw
    }
}

/// Interrupt command register, split over ICR_LOW/ICR_HIGH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcrEntry {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub destination_mode: DestinationMode,
    /// read-only
    pub delivery_status: DeliveryStatus,
    pub level: Level,
    pub trigger_mode: TriggerMode,
    pub shorthand: DestinationShorthand,
    pub destination: u8,
}

impl IcrEntry {
    pub fn new(vector: u8, delivery_mode: DeliveryMode, destination: u8) -> Self {
        IcrEntry {
            vector,
            delivery_mode,
            destination_mode: DestinationMode::Physical,
            delivery_status: DeliveryStatus::Idle,
            level: Level::Assert,
            trigger_mode: TriggerMode::Edge,
            shorthand: DestinationShorthand::NoShorthand,
            destination,
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        IcrEntry {
            vector: raw.get_bits(0..8) as u8,
            delivery_mode: DeliveryMode::from_bits(raw.get_bits(8..11)),
            destination_mode: if bit(raw, 11) {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            delivery_status: if bit(raw, 12) {
                DeliveryStatus::SendPending
            } else {
                DeliveryStatus::Idle
            },
            level: if bit(raw, 14) {
                Level::Assert
            } else {
                Level::Deassert
            },
            trigger_mode: if bit(raw, 15) {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
            shorthand: match raw.get_bits(18..20) {
                0 => DestinationShorthand::NoShorthand,
                1 => DestinationShorthand::ToSelf,
                2 => DestinationShorthand::AllIncludingSelf,
                _ => DestinationShorthand::AllExcludingSelf,
            },
            destination: raw.get_bits(56..64) as u8,
        }
    }

    pub fn to_raw(&self) -> u64 {
        let mut raw: u64 = 0;
        raw.set_bits(0..8, self.vector as u64);
        raw.set_bits(8..11, self.delivery_mode as u64);
        raw.set_bit(11, self.destination_mode == DestinationMode::Logical);
        raw.set_bit(12, self.delivery_status == DeliveryStatus::SendPending);
        raw.set_bit(14, self.level == Level::Assert);
        raw.set_bit(15, self.trigger_mode == TriggerMode::Level);
        raw.set_bits(18..20, self.shorthand as u64);
        raw.set_bits(56..64, self.destination as u64);
        raw
    }
}

/// I/O APIC redirection table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedtblEntry {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub destination_mode: DestinationMode,
    /// read-only
    pub delivery_status: DeliveryStatus,
    pub pin_polarity: PinPolarity,
    /// read-only
    pub remote_irr: bool,
    pub trigger_mode: TriggerMode,
    pub masked: bool,
    pub destination: u8,
}

impl RedtblEntry {
    /// fixed, physical, active high, edge, masked
    pub fn masked(vector: u8, destination: u8) -> Self {
        RedtblEntry {
            vector,
            delivery_mode: DeliveryMode::Fixed,
            destination_mode: DestinationMode::Physical,
            delivery_status: DeliveryStatus::Idle,
            pin_polarity: PinPolarity::High,
            remote_irr: false,
            trigger_mode: TriggerMode::Edge,
            masked: true,
            destination,
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        RedtblEntry {
            vector: raw.get_bits(0..8) as u8,
            delivery_mode: DeliveryMode::from_bits(raw.get_bits(8..11)),
            destination_mode: if bit(raw, 11) {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            delivery_status: if bit(raw, 12) {
                DeliveryStatus::SendPending
            } else {
                DeliveryStatus::Idle
            },
            pin_polarity: if bit(raw, 13) {
                PinPolarity::Low
            } else {
                PinPolarity::High
            },
            remote_irr: bit(raw, 14),
            trigger_mode: if bit(raw, 15) {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
            masked: bit(raw, 16),
            destination: raw.get_bits(56..64) as u8,
        }
    }

    pub fn to_raw(&self) -> u64 {
        let mut raw: u64 = 0;
        raw.set_bits(0..8, self.vector as u64);
        raw.set_bits(8..11, self.delivery_mode as u64);
        raw.set_bit(11, self.destination_mode == DestinationMode::Logical);
        raw.set_bit(12, self.delivery_status == DeliveryStatus::SendPending);
        raw.set_bit(13, self.pin_polarity == PinPolarity::Low);
        raw.set_bit(14, self.remote_irr);
        raw.set_bit(15, self.trigger_mode == TriggerMode::Level);
        raw.set_bit(16, self.masked);
        raw.set_bits(56..64, self.destination as u64);
        raw
    }
}

/// IA32_APIC_BASE MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApicBaseMsr {
    pub bsp: bool,
    pub x2apic_enabled: bool,
    pub xapic_enabled: bool,
    pub base: PhysicalAddress,
}

impl ApicBaseMsr {
    pub fn from_raw(raw: u64) -> Self {
        ApicBaseMsr {
            bsp: raw.get_bit(8),
            x2apic_enabled: raw.get_bit(10),
            xapic_enabled: raw.get_bit(11),
            base: PhysicalAddress::from_u64(raw & 0x000f_ffff_ffff_f000),
        }
    }

    pub fn to_raw(&self) -> u64 {
        let mut raw = self.base.as_u64() & 0x000f_ffff_ffff_f000;
        raw.set_bit(8, self.bsp);
        raw.set_bit(10, self.x2apic_enabled);
        raw.set_bit(11, self.xapic_enabled);
        raw
    }
}

/// Local APIC version register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApicVersion {
    pub version: u8,
    pub max_lvt_entry: u8,
    pub eoi_broadcast_suppression: bool,
}

impl LocalApicVersion {
    pub fn from_raw(raw: u32) -> Self {
        LocalApicVersion {
            version: raw.get_bits(0..8) as u8,
            max_lvt_entry: raw.get_bits(16..24) as u8,
            eoi_broadcast_suppression: raw.get_bit(24),
        }
    }

    /// 0x0X is a discrete 82489DX, 0x1X an integrated APIC.
    pub fn is_integrated(&self) -> bool {
        self.version >= 0x10
    }
}

/// I/O APIC version register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicVersion {
    pub version: u8,
    pub max_redirection_entry: u8,
}

impl IoApicVersion {
    pub fn from_raw(raw: u32) -> Self {
        IoApicVersion {
            version: raw.get_bits(0..8) as u8,
            max_redirection_entry: raw.get_bits(16..24) as u8,
        }
    }

    /// version 0x20 and later have the EOI register at +0x40.
    pub fn has_directed_eoi(&self) -> bool {
        self.version >= 0x20
    }
}
