extern crate alloc;
extern crate log;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::acpi::madt::{LocalApicNmi, Polarity, TriggerMode as InterruptTrigger};
use crate::apic::registers::{
    ApicBaseMsr, DeliveryMode, DeliveryStatus, IcrEntry, Level, LocalApicVersion, LvtEntry,
    PinPolarity, Svr, TriggerMode,
};
use crate::apic::ApicError;
use crate::cpu::dispatcher::{Dispatcher, InterruptHandler};
use crate::cpu::interrupts::{self, InterruptFrame};
use crate::cpu::msr::IA32_APIC_BASE;
use crate::cpu::pic::ChainedPIC;
use crate::mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::platform::Platform;

/// IMCR select/data ports, present on chipsets that can route the
/// 8259A either to the BSP's INTR pin or through the APIC.
const IMCR_SELECT_PORT: u16 = 0x22;
const IMCR_DATA_PORT: u16 = 0x23;
const IMCR_SELECT: u8 = 0x70;
const IMCR_ROUTE_THROUGH_APIC: u8 = 0x01;
const IMCR_ROUTE_THROUGH_PIC: u8 = 0x00;

/// first MSR of the x2APIC register block.
pub const X2APIC_MSR_BASE: u32 = 0x800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapicNumbers {
    LapicID = 0x20,
    LapicVersion = 0x30,
    TaskPriority = 0x80,
    Eoi = 0xb0,
    SupriousInterrupt = 0xf0,
    ErrorStatus = 0x280,
    LvtCMCI = 0x2f0,
    InterruptCommandLow = 0x300,
    InterruptCommandHigh = 0x310,
    LvtTimer = 0x320,
    LvtThermalSensor = 0x330,
    LvtPMCounters = 0x340,
    LvtLINT0 = 0x350,
    LvtLINT1 = 0x360,
    LvtError = 0x370,
    TimerInitialCount = 0x380,
    TimerCurrentCount = 0x390,
    TimerDivideConfig = 0x3e0,
}

/// Interrupt sources wired into the local vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalInterrupt {
    Cmci,
    Timer,
    Thermal,
    Performance,
    Lint0,
    Lint1,
    Error,
}

impl LocalInterrupt {
    pub const ALL: [LocalInterrupt; 7] = [
        LocalInterrupt::Cmci,
        LocalInterrupt::Timer,
        LocalInterrupt::Thermal,
        LocalInterrupt::Performance,
        LocalInterrupt::Lint0,
        LocalInterrupt::Lint1,
        LocalInterrupt::Error,
    ];

    pub fn register(self) -> LapicNumbers {
        match self {
            LocalInterrupt::Cmci => LapicNumbers::LvtCMCI,
            LocalInterrupt::Timer => LapicNumbers::LvtTimer,
            LocalInterrupt::Thermal => LapicNumbers::LvtThermalSensor,
            LocalInterrupt::Performance => LapicNumbers::LvtPMCounters,
            LocalInterrupt::Lint0 => LapicNumbers::LvtLINT0,
            LocalInterrupt::Lint1 => LapicNumbers::LvtLINT1,
            LocalInterrupt::Error => LapicNumbers::LvtError,
        }
    }

    pub fn vector(self) -> u8 {
        match self {
            LocalInterrupt::Cmci => interrupts::CMCI,
            LocalInterrupt::Timer => interrupts::TIMER,
            LocalInterrupt::Thermal => interrupts::THERMAL,
            LocalInterrupt::Performance => interrupts::PERFORMANCE,
            LocalInterrupt::Lint0 => interrupts::LINT0,
            LocalInterrupt::Lint1 => interrupts::LINT1,
            LocalInterrupt::Error => interrupts::ERROR,
        }
    }

    pub fn from_vector(vector: u8) -> Option<LocalInterrupt> {
        Self::ALL.iter().copied().find(|source| source.vector() == vector)
    }

    /// CMCI, thermal and performance entries only exist on newer parts,
    /// VER reports the index of the last LVT entry.
    pub fn is_present(self, version: &LocalApicVersion) -> bool {
        match self {
            LocalInterrupt::Cmci => version.max_lvt_entry >= 6,
            LocalInterrupt::Thermal => version.max_lvt_entry >= 5,
            LocalInterrupt::Performance => version.max_lvt_entry >= 4,
            _ => true,
        }
    }
}

impl fmt::Display for LocalInterrupt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LocalInterrupt::Cmci => "CMCI",
            LocalInterrupt::Timer => "TIMER",
            LocalInterrupt::Thermal => "THERMAL",
            LocalInterrupt::Performance => "PERFORMANCE",
            LocalInterrupt::Lint0 => "LINT0",
            LocalInterrupt::Lint1 => "LINT1",
            LocalInterrupt::Error => "ERROR",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mmio(pub VirtualAddress);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msr(pub u32);

/// How the local APIC registers are reached. Only xApic MMIO is
/// implemented; x2APIC access reports `NotSupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unmapped,
    XApic(Mmio),
    X2Apic(Msr),
}

/// The register window of the local APIC of the executing CPU. Every
/// CPU sees its own APIC behind the same address, so one window value
/// serves all of them.
pub struct LocalApicRegisters<'a, P: Platform> {
    platform: &'a P,
    mode: Mode,
}

impl<'a, P: Platform> LocalApicRegisters<'a, P> {
    pub fn new(platform: &'a P, mode: Mode) -> Self {
        LocalApicRegisters { platform, mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    fn address(&self, register: LapicNumbers) -> Result<VirtualAddress, ApicError> {
        match self.mode {
            Mode::XApic(Mmio(base)) => Ok(base.offset(register as usize)),
            Mode::X2Apic(_) => Err(ApicError::NotSupported),
            Mode::Unmapped => Err(ApicError::MmioNotMapped),
        }
    }

    #[inline]
    pub fn read(&self, register: LapicNumbers) -> Result<u32, ApicError> {
        let addr = self.address(register)?;
        Ok(self.platform.read_mmio(addr))
    }

    #[inline]
    pub fn write(&self, register: LapicNumbers, value: u32) -> Result<(), ApicError> {
        let addr = self.address(register)?;
        self.platform.write_mmio(addr, value);
        Ok(())
    }

    pub fn id(&self) -> Result<u8, ApicError> {
        Ok((self.read(LapicNumbers::LapicID)? >> 24) as u8)
    }

    pub fn version(&self) -> Result<LocalApicVersion, ApicError> {
        let raw = self.read(LapicNumbers::LapicVersion)?;
        Ok(LocalApicVersion::from_raw(raw))
    }

    pub fn read_lvt(&self, source: LocalInterrupt) -> Result<LvtEntry, ApicError> {
        Ok(LvtEntry::from_raw(self.read(source.register())?))
    }

    pub fn write_lvt(&self, source: LocalInterrupt, entry: LvtEntry) -> Result<(), ApicError> {
        self.write(source.register(), entry.to_raw())
    }

    pub fn read_svr(&self) -> Result<Svr, ApicError> {
        Ok(Svr::from_raw(self.read(LapicNumbers::SupriousInterrupt)?))
    }

    pub fn write_svr(&self, svr: Svr) -> Result<(), ApicError> {
        self.write(LapicNumbers::SupriousInterrupt, svr.to_raw())
    }

    pub fn read_icr(&self) -> Result<IcrEntry, ApicError> {
        let high = self.read(LapicNumbers::InterruptCommandHigh)? as u64;
        let low = self.read(LapicNumbers::InterruptCommandLow)? as u64;
        Ok(IcrEntry::from_raw((high << 32) | low))
    }

    /// the low half commits the command, so it goes last.
    pub fn write_icr(&self, entry: IcrEntry) -> Result<(), ApicError> {
        let raw = entry.to_raw();
        self.write(LapicNumbers::InterruptCommandHigh, (raw >> 32) as u32)?;
        self.write(LapicNumbers::InterruptCommandLow, raw as u32)
    }

    /// spins until the ICR delivery status returns to idle.
    pub fn wait_for_ipi_dispatch(&self) -> Result<(), ApicError> {
        loop {
            let low = self.read(LapicNumbers::InterruptCommandLow)? as u64;
            if IcrEntry::from_raw(low).delivery_status == DeliveryStatus::Idle {
                return Ok(());
            }
            self.platform.pause();
        }
    }

    pub fn send_init_ipi(&self, target: u8, level: Level) -> Result<(), ApicError> {
        let mut icr = IcrEntry::new(0, DeliveryMode::Init, target);
        icr.level = level;
        icr.trigger_mode = TriggerMode::Level;
        self.write_icr(icr)?;
        self.wait_for_ipi_dispatch()
    }

    /// `page` is the physical address of the startup code; the AP begins
    /// executing at `page >> 12` : 0000 in real mode.
    pub fn send_startup_ipi(&self, target: u8, page: PhysicalAddress) -> Result<(), ApicError> {
        let icr = IcrEntry::new(page.page_number() as u8, DeliveryMode::Startup, target);
        self.write_icr(icr)?;
        self.wait_for_ipi_dispatch()
    }

    pub fn send_end_of_interrupt(&self) -> Result<(), ApicError> {
        self.write(LapicNumbers::Eoi, 0)
    }

    pub fn clear_errors(&self) -> Result<(), ApicError> {
        self.write(LapicNumbers::ErrorStatus, 0)?;
        self.write(LapicNumbers::ErrorStatus, 0)
    }

    /// ESR latches on write, so it is written before the read. The bit
    /// meaning differs between Pentium and P6-or-later parts, the raw
    /// value is what gets reported.
    pub fn handle_errors(&self) -> Result<u32, ApicError> {
        self.write(LapicNumbers::ErrorStatus, 0)?;
        self.read(LapicNumbers::ErrorStatus)
    }
}

/// Per-CPU record built from one enabled MADT processor entry.
#[derive(Debug)]
pub struct LocalApic {
    pub cpu_id: u8,
    pub processor_id: u8,
    pub phys_base: PhysicalAddress,
    pub virt_base: VirtualAddress,
    pub nmi_lint: LocalInterrupt,
    pub nmi_polarity: Polarity,
    pub nmi_trigger: InterruptTrigger,
    initialized: AtomicBool,
}

impl LocalApic {
    pub fn new(
        cpu_id: u8,
        processor_id: u8,
        phys_base: PhysicalAddress,
        virt_base: VirtualAddress,
        nmi: Option<LocalApicNmi>,
    ) -> Self {
        let (nmi_lint, nmi_polarity, nmi_trigger) = match nmi {
            Some(nmi) => {
                let lint = if nmi.lint == 0 {
                    LocalInterrupt::Lint0
                } else {
                    LocalInterrupt::Lint1
                };
                let flags = nmi.inti_flags();
                (lint, flags.polarity(), flags.trigger_mode())
            }
            None => {
                log::warn!(
                    "no NMI record for cpu {}, assuming LINT1 with bus defaults",
                    cpu_id
                );
                (LocalInterrupt::Lint1, Polarity::Bus, InterruptTrigger::Bus)
            }
        };

        LocalApic {
            cpu_id,
            processor_id,
            phys_base,
            virt_base,
            nmi_lint,
            nmi_polarity,
            nmi_trigger,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// LVT entry for the NMI pin. Bus default means active high, edge.
    pub fn nmi_entry(&self) -> LvtEntry {
        let mut entry = LvtEntry::masked(self.nmi_lint.vector());
        entry.delivery_mode = DeliveryMode::Nmi;
        entry.masked = false;
        entry.pin_polarity = match self.nmi_polarity {
            Polarity::ActiveLow => PinPolarity::Low,
            _ => PinPolarity::High,
        };
        entry.trigger_mode = match self.nmi_trigger {
            InterruptTrigger::Level => TriggerMode::Level,
            _ => TriggerMode::Edge,
        };
        entry
    }

    /// Programs the local APIC of the executing CPU, which must be the
    /// CPU this record describes.
    pub fn initialize<P: Platform>(&self, regs: &LocalApicRegisters<P>) -> Result<(), ApicError> {
        let version = regs.version()?;

        for source in LocalInterrupt::ALL.iter() {
            if source.is_present(&version) {
                regs.write_lvt(*source, LvtEntry::masked(source.vector()))?;
            }
        }

        regs.write_lvt(self.nmi_lint, self.nmi_entry())?;

        regs.write_svr(Svr {
            vector: interrupts::SPURIOUS,
            software_enable: true,
            focus_checking_disabled: false,
            eoi_broadcast_suppression: version.eoi_broadcast_suppression,
        })?;

        // write, read, write: ESR must be written before it is read
        regs.write(LapicNumbers::ErrorStatus, 0)?;
        regs.read(LapicNumbers::ErrorStatus)?;
        regs.write(LapicNumbers::ErrorStatus, 0)?;

        // drop anything in service from before we took over
        regs.send_end_of_interrupt()?;

        regs.write(LapicNumbers::TaskPriority, 0)?;

        self.initialized.store(true, Ordering::Release);
        log::debug!(
            "local APIC {} ready, version=0x{:x} max_lvt={}",
            self.cpu_id,
            version.version,
            version.max_lvt_entry
        );
        Ok(())
    }

    pub fn allow<P: Platform>(
        regs: &LocalApicRegisters<P>,
        source: LocalInterrupt,
    ) -> Result<(), ApicError> {
        let mut entry = regs.read_lvt(source)?;
        entry.masked = false;
        regs.write_lvt(source, entry)
    }

    pub fn forbid<P: Platform>(
        regs: &LocalApicRegisters<P>,
        source: LocalInterrupt,
    ) -> Result<(), ApicError> {
        let mut entry = regs.read_lvt(source)?;
        entry.masked = true;
        regs.write_lvt(source, entry)
    }

    /// true if masked.
    pub fn status<P: Platform>(
        regs: &LocalApicRegisters<P>,
        source: LocalInterrupt,
    ) -> Result<bool, ApicError> {
        Ok(regs.read_lvt(source)?.masked)
    }
}

/// Switches the calling CPU, which must be the BSP, to xApic mode:
/// enables the APIC at `phys_base`, maps its window, takes the 8259A
/// off the CPU and masks every PC/AT line. Returns the register mode
/// and the BSP's APIC id.
pub fn initialize_bsp<P: Platform>(
    platform: &P,
    phys_base: PhysicalAddress,
    pcat_compat: bool,
    pic: &ChainedPIC,
) -> Result<(Mode, u8), ApicError> {
    let mut base = ApicBaseMsr::from_raw(platform.read_msr(IA32_APIC_BASE));
    if !base.bsp {
        log::warn!("BSP LAPIC init function called from a non BSP.");
        return Err(ApicError::NotBsp);
    }

    if !platform.cpu_features().has_xapic() {
        return Err(ApicError::NotSupported);
    }

    base.xapic_enabled = true;
    base.x2apic_enabled = false;
    base.base = phys_base;
    platform.write_msr(IA32_APIC_BASE, base.to_raw());

    let virt_base = platform.map_mmio(phys_base, PAGE_SIZE)?;
    let mode = Mode::XApic(Mmio(virt_base));

    if pcat_compat {
        // route INTR through the APIC instead of straight to the BSP
        platform.write_port(IMCR_SELECT_PORT, IMCR_SELECT);
        platform.write_port(IMCR_DATA_PORT, IMCR_ROUTE_THROUGH_APIC);
    }

    pic.mask_all(platform);

    let regs = LocalApicRegisters::new(platform, mode);
    let bsp_id = regs.id()?;
    log::info!(
        "xApic enabled on BSP {}, registers at 0x{:x} -> 0x{:x}",
        bsp_id,
        phys_base,
        virt_base
    );

    Ok((mode, bsp_id))
}

/// Gives INTR back to the 8259A after a setup step following
/// `initialize_bsp` failed.
pub fn release_bsp<P: Platform>(platform: &P, pcat_compat: bool) {
    if pcat_compat {
        platform.write_port(IMCR_SELECT_PORT, IMCR_SELECT);
        platform.write_port(IMCR_DATA_PORT, IMCR_ROUTE_THROUGH_PIC);
    } else {
        log::warn!("no IMCR, 8259A interrupts rely on the LAPIC virtual wire");
    }
}

/// Logs the raw ESR of the CPU that raised the error interrupt.
pub struct ApicErrorHandler<P: Platform> {
    platform: Arc<P>,
    mode: Mode,
    errors: AtomicUsize,
}

impl<P: Platform> ApicErrorHandler<P> {
    pub fn new(platform: Arc<P>, mode: Mode) -> Self {
        ApicErrorHandler {
            platform,
            mode,
            errors: AtomicUsize::new(0),
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

impl<P: Platform> InterruptHandler for ApicErrorHandler<P> {
    fn plugin(self: Arc<Self>, dispatcher: &Dispatcher) {
        dispatcher.assign(interrupts::ERROR, self);
    }

    fn trigger(&self, _frame: &InterruptFrame, cpu_id: u8) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let regs = LocalApicRegisters::new(self.platform.as_ref(), self.mode);
        match regs.handle_errors() {
            Ok(esr) => log::error!("APIC error on cpu {}: esr=0x{:08x}", cpu_id, esr),
            Err(err) => log::error!("APIC error on cpu {}, ESR unreadable: {}", cpu_id, err),
        }
    }
}
