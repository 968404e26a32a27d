extern crate log;

use core::fmt;

use crate::cpu::io::PortIO;

// Command ports are used to send commands.
const MASTER_CMD_PORT: u16 = 0x20;
const SLAVE_CMD_PORT: u16 = 0xA0;

// Data ports are used to read/write data.
const MASTER_DATA_PORT: u16 = 0x21;
const SLAVE_DATA_PORT: u16 = 0xA1;

/// rebase hardware IRQs starting from this offset.
pub const IRQ_OFFSET: u8 = 0x20;

/// command to read Interrupt request register
const CMD_IRQ_REGISTER_READ: u8 = 0x0A;

/// command to read Interrupt service register
const CMD_ISR_REGISTER_READ: u8 = 0x0B;

/// ICW1: edge triggered, cascade, ICW4 follows
const CMD_PIC_INIT: u8 = 0x11;

/// Command to set PIC in x86 8086 legacy hardware mode
const DATA_MODE_8086: u8 = 0x01;

/// Command to say interrupt has ended
const CMD_INTERRUPT_ACK: u8 = 0x20;

/// Number of interrupts per PIC chip
const MAX_INTERRUPTS_PER_CHIP: u8 = 8;

/// the slave is wired to this master input.
const CASCADE_IRQ: u8 = 2;

pub struct InterruptStatusRegister {
    pub master_isr: u8,
    pub master_irq: u8,
    pub slave_isr: u8,
    pub slave_irq: u8,
}

impl fmt::Display for InterruptStatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "master_isr={:08b}, master_irr={:08b}, slave_isr={:08b}, slave_irr={:08b}",
            self.master_isr, self.master_irq, self.slave_isr, self.slave_irq
        )
    }
}

impl fmt::Debug for InterruptStatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One 8259A chip.
pub struct PIC {
    pub cmd_port: u16,
    pub data_port: u16,
    pub offset: u8,
}

impl PIC {
    pub const fn new(cmd_port: u16, data_port: u16, offset: u8) -> Self {
        PIC {
            cmd_port,
            data_port,
            offset,
        }
    }

    #[inline]
    pub fn eoi<IO: PortIO + ?Sized>(&self, io: &IO) {
        io.write_port(self.cmd_port, CMD_INTERRUPT_ACK);
    }

    #[inline]
    pub fn mask<IO: PortIO + ?Sized>(&self, io: &IO) -> u8 {
        io.read_port(self.data_port)
    }

    #[inline]
    pub fn set_mask<IO: PortIO + ?Sized>(&self, io: &IO, mask: u8) {
        io.write_port(self.data_port, mask);
    }

    #[inline]
    fn read_register<IO: PortIO + ?Sized>(&self, io: &IO, command: u8) -> u8 {
        io.write_port(self.cmd_port, command);
        io.read_port(self.cmd_port)
    }

    pub fn read_isr<IO: PortIO + ?Sized>(&self, io: &IO) -> u8 {
        self.read_register(io, CMD_ISR_REGISTER_READ)
    }
}

/// The PC/AT master/slave pair. IRQ 0-7 live on the master, 8-15 on
/// the slave which is chained through master input 2.
pub struct ChainedPIC {
    pub pics: [PIC; 2],
}

impl ChainedPIC {
    pub const fn new() -> Self {
        ChainedPIC {
            pics: [
                PIC::new(MASTER_CMD_PORT, MASTER_DATA_PORT, IRQ_OFFSET),
                PIC::new(
                    SLAVE_CMD_PORT,
                    SLAVE_DATA_PORT,
                    IRQ_OFFSET + MAX_INTERRUPTS_PER_CHIP,
                ),
            ],
        }
    }

    #[inline]
    fn chip_for(&self, irq: u8) -> (&PIC, u8) {
        if irq < MAX_INTERRUPTS_PER_CHIP {
            (&self.pics[0], irq)
        } else {
            (&self.pics[1], irq - MAX_INTERRUPTS_PER_CHIP)
        }
    }

    /// true if `irq` is a line of the pair.
    #[inline]
    pub fn can_handle(&self, irq: u8) -> bool {
        irq < 2 * MAX_INTERRUPTS_PER_CHIP
    }

    pub fn mask_requests<IO: PortIO + ?Sized>(&self, io: &IO, master_mask: u8, slave_mask: u8) {
        self.pics[1].set_mask(io, slave_mask);
        self.pics[0].set_mask(io, master_mask);
    }

    pub fn mask_all<IO: PortIO + ?Sized>(&self, io: &IO) {
        self.mask_requests(io, 0xff, 0xff);
    }

    /// (master, slave) mask bytes.
    pub fn masks<IO: PortIO + ?Sized>(&self, io: &IO) -> (u8, u8) {
        (self.pics[0].mask(io), self.pics[1].mask(io))
    }

    /// Remaps the pair onto vectors 0x20..0x2f, every line stays masked.
    pub fn initialize<IO: PortIO + ?Sized>(&self, io: &IO) {
        // disable (mask) interrupts before set-up
        self.mask_all(io);

        let master: &PIC = &self.pics[0];
        let slave: &PIC = &self.pics[1];

        // ICW1
        io.write_port(master.cmd_port, CMD_PIC_INIT);
        io.io_wait();
        io.write_port(slave.cmd_port, CMD_PIC_INIT);
        io.io_wait();

        // ICW2: set offset
        master.set_mask(io, master.offset);
        io.io_wait();
        slave.set_mask(io, slave.offset);
        io.io_wait();

        // ICW3: set chain
        master.set_mask(io, 1 << CASCADE_IRQ);
        io.io_wait();
        slave.set_mask(io, CASCADE_IRQ);
        io.io_wait();

        // ICW4: set legacy 8086 mode
        master.set_mask(io, DATA_MODE_8086);
        io.io_wait();
        slave.set_mask(io, DATA_MODE_8086);
        io.io_wait();

        // re-mask
        self.mask_all(io);
        log::debug!("8259A pair remapped to 0x{:x}/0x{:x}", master.offset, slave.offset);
    }

    pub fn allow<IO: PortIO + ?Sized>(&self, io: &IO, irq: u8) {
        let (pic, line) = self.chip_for(irq);
        let mask = pic.mask(io);
        pic.set_mask(io, mask & !(1 << line));
    }

    pub fn forbid<IO: PortIO + ?Sized>(&self, io: &IO, irq: u8) {
        let (pic, line) = self.chip_for(irq);
        let mask = pic.mask(io);
        pic.set_mask(io, mask | (1 << line));
    }

    /// true if the line is masked.
    pub fn status<IO: PortIO + ?Sized>(&self, io: &IO, irq: u8) -> bool {
        let (pic, line) = self.chip_for(irq);
        pic.mask(io) & (1 << line) != 0
    }

    pub fn send_end_of_interrupt<IO: PortIO + ?Sized>(&self, io: &IO, irq: u8) {
        if irq >= MAX_INTERRUPTS_PER_CHIP {
            self.pics[1].eoi(io);
        }
        self.pics[0].eoi(io);
    }

    /// IRQ 7 and IRQ 15 fire spuriously when a request is withdrawn before
    /// the CPU acknowledges it; the matching ISR bit is then clear.
    pub fn is_spurious<IO: PortIO + ?Sized>(&self, io: &IO, irq: u8) -> bool {
        match irq {
            7 => self.pics[0].read_isr(io) & (1 << 7) == 0,
            15 => {
                if self.pics[1].read_isr(io) & (1 << 7) == 0 {
                    // the master did see a real request on the cascade line
                    self.pics[0].eoi(io);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    pub fn read_registers<IO: PortIO + ?Sized>(&self, io: &IO) -> InterruptStatusRegister {
        let master: &PIC = &self.pics[0];
        let slave: &PIC = &self.pics[1];

        InterruptStatusRegister {
            master_irq: master.read_register(io, CMD_IRQ_REGISTER_READ),
            master_isr: master.read_register(io, CMD_ISR_REGISTER_READ),
            slave_irq: slave.read_register(io, CMD_IRQ_REGISTER_READ),
            slave_isr: slave.read_register(io, CMD_ISR_REGISTER_READ),
        }
    }
}
