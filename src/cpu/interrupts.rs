/// hardware interrupts start from 0x20, i.e from 32
/// because of interrupt remapping.
pub const HARDWARE_INTERRUPTS_BASE: u8 = 0x20;

// PC/AT lines after remapping
pub const PIT: u8 = 32;
pub const KEYBOARD: u8 = 33;
pub const CASCADE: u8 = 34;
pub const COM2: u8 = 35;
pub const COM1: u8 = 36;
pub const LPT2: u8 = 37;
pub const FLOPPY: u8 = 38;
pub const LPT1: u8 = 39;
pub const RTC: u8 = 40;
pub const ACPI: u8 = 41;
pub const FREE1: u8 = 42;
pub const FREE2: u8 = 43;
pub const MOUSE: u8 = 44;
pub const FPU: u8 = 45;
pub const PRIMARY_ATA: u8 = 46;
pub const SECONDARY_ATA: u8 = 47;

pub const SYSTEM_CALL: u8 = 0x86;

// local APIC sources
pub const CMCI: u8 = 0xF8;
pub const TIMER: u8 = 0xF9;
pub const THERMAL: u8 = 0xFA;
pub const PERFORMANCE: u8 = 0xFB;
pub const LINT0: u8 = 0xFC;
pub const LINT1: u8 = 0xFD;
pub const ERROR: u8 = 0xFE;
pub const SPURIOUS: u8 = 0xFF;

pub const DIVIDE_ERROR: u8 = 0x00;
pub const INVALID_OPCODE: u8 = 0x06;
pub const DOUBLE_FAULT: u8 = 0x08;
pub const INVALID_TSS: u8 = 0x0A;
pub const SEGMENT_NOT_PRESENT: u8 = 0x0B;
pub const STACK_FAULT: u8 = 0x0C;
pub const GENERAL_PROTECTION: u8 = 0x0D;
pub const PAGE_FAULT: u8 = 0x0E;
pub const MACHINE_CHECK: u8 = 0x12;

/// exceptions the kernel cannot resume from unless something handles them.
pub const UNRECOVERABLE_EXCEPTIONS: [u8; 9] = [
    DIVIDE_ERROR,
    INVALID_OPCODE,
    DOUBLE_FAULT,
    INVALID_TSS,
    SEGMENT_NOT_PRESENT,
    STACK_FAULT,
    GENERAL_PROTECTION,
    PAGE_FAULT,
    MACHINE_CHECK,
];

#[inline]
pub fn is_unrecoverable(vector: u8) -> bool {
    UNRECOVERABLE_EXCEPTIONS.contains(&vector)
}

#[inline]
pub fn is_local_apic_source(vector: u8) -> bool {
    (CMCI..=ERROR).contains(&vector)
}

/// Register state pushed by the low-level stub, i386 layout: segment
/// registers, pusha block, vector and error code, then the hardware frame.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

impl InterruptFrame {
    pub fn for_vector(vector: u8) -> Self {
        InterruptFrame {
            vector: vector as u32,
            ..InterruptFrame::default()
        }
    }

    #[inline]
    pub fn vector(&self) -> u8 {
        self.vector as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_sources_cover_cmci_to_error() {
        assert!(is_local_apic_source(CMCI));
        assert!(is_local_apic_source(ERROR));
        assert!(!is_local_apic_source(SPURIOUS));
        assert!(!is_local_apic_source(SYSTEM_CALL));
    }

    #[test]
    fn page_fault_is_fatal_breakpoint_is_not() {
        assert!(is_unrecoverable(PAGE_FAULT));
        assert!(is_unrecoverable(DOUBLE_FAULT));
        assert!(!is_unrecoverable(0x03));
    }
}
