#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use core::arch::asm;

/// A legacy x86 I/O port. Only byte-wide access is needed for the
/// 8259A, the PIT, the CMOS and the IMCR.
#[derive(Debug, Clone, Copy)]
pub struct Port {
    pub port_no: u16,
    pub read_only: bool,
}

impl Port {
    pub const fn new(port_no: u16, read_only: bool) -> Self {
        Port { port_no, read_only }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Port {
    pub fn read_u8(&self) -> u8 {
        let value: u8;
        unsafe {
            asm!(
                "in al, dx", out("al") value, in("dx") self.port_no,
                options(nomem, nostack, preserves_flags)
            );
        }

        value
    }

    pub fn write_u8(&self, value: u8) {
        if !self.read_only {
            unsafe {
                asm!(
                    "out dx, al", in("dx") self.port_no, in("al") value,
                    options(nomem, nostack, preserves_flags)
                );
            }
        }
    }
}

/// writes to an unused port to give slow devices (the 8259A) time to settle.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn wait() {
    Port::new(0x80, false).write_u8(0);
}

/// Byte-wide port access. Implemented by the platform so the legacy
/// chip drivers can be run against real ports or an emulation.
pub trait PortIO {
    fn read_port(&self, port: u16) -> u8;
    fn write_port(&self, port: u16, value: u8);

    /// short delay for the 8259A between initialization words.
    fn io_wait(&self) {
        self.write_port(0x80, 0);
    }
}
