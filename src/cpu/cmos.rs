use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::io::PortIO;

const CMOS_INDEX_PORT: u16 = 0x70;
const CMOS_DATA_PORT: u16 = 0x71;

/// bit 7 of the index port masks NMI at the chipset.
const NMI_DISABLE_BIT: u8 = 0x80;

/// shutdown status byte, read by the BIOS on warm reset.
pub const CMOS_SHUTDOWN_STATUS: u8 = 0x0F;

/// "jump to the far pointer at 40:67 without EOI".
pub const SHUTDOWN_JUMP_WARM_RESET: u8 = 0x0A;

/// The index port is write-only, the NMI bit is tracked here so that
/// register accesses do not re-enable NMIs behind our back.
pub struct Cmos {
    nmi_disabled: AtomicBool,
}

impl Cmos {
    pub const fn new() -> Self {
        Cmos {
            nmi_disabled: AtomicBool::new(false),
        }
    }

    #[inline]
    fn select<IO: PortIO + ?Sized>(&self, io: &IO, register: u8) {
        let nmi = if self.nmi_disabled.load(Ordering::Relaxed) {
            NMI_DISABLE_BIT
        } else {
            0
        };
        io.write_port(CMOS_INDEX_PORT, (register & 0x7f) | nmi);
    }

    pub fn disable_nmi<IO: PortIO + ?Sized>(&self, io: &IO) {
        self.nmi_disabled.store(true, Ordering::Relaxed);
        self.select(io, 0);
    }

    pub fn enable_nmi<IO: PortIO + ?Sized>(&self, io: &IO) {
        self.nmi_disabled.store(false, Ordering::Relaxed);
        self.select(io, 0);
    }

    pub fn nmi_disabled(&self) -> bool {
        self.nmi_disabled.load(Ordering::Relaxed)
    }

    pub fn write_register<IO: PortIO + ?Sized>(&self, io: &IO, register: u8, value: u8) {
        self.select(io, register);
        io.write_port(CMOS_DATA_PORT, value);
    }

    pub fn read_register<IO: PortIO + ?Sized>(&self, io: &IO, register: u8) -> u8 {
        self.select(io, register);
        io.read_port(CMOS_DATA_PORT)
    }
}
