//! The interrupt controller of the kernel. [`Apic`] starts on the 8259A
//! pair, switches to the local APIC + I/O APIC when the firmware and CPU
//! support it, and hides which one is active behind
//! `allow`/`forbid`/`status`/`send_end_of_interrupt`.

extern crate alloc;
extern crate log;
extern crate spin;

pub mod counters;
pub mod diagnostics;
pub mod ioapic;
pub mod lapic;
pub mod registers;
pub mod smp;
pub mod timer;
pub mod trampoline;


use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use lazy_static::lazy_static;
use spin::{Mutex, Once};

use crate::acpi::madt::{InterruptSourceOverride, MultiProcessorInfo};
use crate::apic::counters::InterruptCounters;
use crate::apic::ioapic::IoApic;
use crate::apic::lapic::{
    ApicErrorHandler, LocalApic, LocalApicRegisters, LocalInterrupt, Mmio, Mode,
};
use crate::apic::registers::TimerDivide;
use crate::apic::timer::ApicTimers;
use crate::cpu::cmos::Cmos;
use crate::cpu::dispatcher::{Dispatcher, InterruptControl, InterruptHandler};
use crate::cpu::gdt::GlobalDescriptorTable;
use crate::cpu::interrupts::{self, InterruptFrame, HARDWARE_INTERRUPTS_BASE};
use crate::cpu::pic::ChainedPIC;
use crate::mm::{MemoryError, VirtualAddress};
use crate::platform::Platform;

/// Physical page the AP startup code is copied to. Below 1 MiB, and
/// `TRAMPOLINE_ADDR >> 12` is the STARTUP IPI vector.
pub const TRAMPOLINE_ADDR: u64 = 0x8000;

/// `running_aps` is one 64-bit word.
pub const MAX_CPUS: usize = 64;

pub const AP_STACK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicError {
    NotSupported,
    AlreadyInitialized,
    NotBsp,
    MmioNotMapped,
    OutOfRange,
    NotContiguous,
    ApTimeout(u8),
    Unrecoverable(u8),
    Memory(MemoryError),
}

impl fmt::Display for ApicError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApicError::NotSupported => write!(f, "APIC not supported"),
            ApicError::AlreadyInitialized => write!(f, "already initialized"),
            ApicError::NotBsp => write!(f, "not running on the BSP"),
            ApicError::MmioNotMapped => write!(f, "APIC registers are not mapped"),
            ApicError::OutOfRange => write!(f, "out of range"),
            ApicError::NotContiguous => write!(f, "APIC ids are not contiguous"),
            ApicError::ApTimeout(cpu) => write!(f, "cpu {} did not come up", cpu),
            ApicError::Unrecoverable(vector) => {
                write!(f, "unrecoverable exception 0x{:x}", vector)
            }
            ApicError::Memory(err) => write!(f, "mapping failed: {}", err),
        }
    }
}

impl From<MemoryError> for ApicError {
    fn from(err: MemoryError) -> Self {
        ApicError::Memory(err)
    }
}

/// Tunables of the timer and of SMP bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApicConfig {
    pub timer_interval_ns: u64,
    pub yield_interval_ms: u64,
    pub calibration_factor: u32,
    pub timer_divider: TimerDivide,
    pub ap_poll_interval_ns: u64,
    pub ap_poll_attempts: u32,
    pub init_deassert_wait_ns: u64,
    pub startup_wait_ns: u64,
}

impl Default for ApicConfig {
    fn default() -> Self {
        ApicConfig {
            timer_interval_ns: 10_000_000,
            yield_interval_ms: 10,
            calibration_factor: 10,
            timer_divider: TimerDivide::By16,
            ap_poll_interval_ns: 10_000_000,
            ap_poll_attempts: 10,
            init_deassert_wait_ns: 10_000_000,
            startup_wait_ns: 200_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    Uninit = 0,
    PicOnly = 1,
    ApicEnabled = 2,
    SmpEnabled = 3,
}

impl ControllerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ControllerState::PicOnly,
            2 => ControllerState::ApicEnabled,
            3 => ControllerState::SmpEnabled,
            _ => ControllerState::Uninit,
        }
    }
}

/// Everything owned once the APIC path is live.
pub struct ApicBackend<P: Platform> {
    pub mode: Mode,
    pub bsp_id: u8,
    /// indexed by APIC id, disabled CPUs leave their slot empty
    pub lapics: Vec<Option<LocalApic>>,
    /// APIC ids of processors the MADT lists as disabled; they are never
    /// started but keep their slot in the per-CPU tables
    pub reserved: Vec<u8>,
    pub ioapic: IoApic,
    pub overrides: Vec<InterruptSourceOverride>,
    pub timers: Arc<ApicTimers<P>>,
    pub errors: Arc<ApicErrorHandler<P>>,
    /// last rendering of the BSP's LVT, served to the other CPUs
    pub bsp_lvt: Mutex<String>,
}

impl<P: Platform> ApicBackend<P> {
    pub fn lapic(&self, cpu_id: u8) -> Option<&LocalApic> {
        self.lapics.get(cpu_id as usize).and_then(Option::as_ref)
    }

    pub fn cpu_ids(&self) -> Vec<u8> {
        self.lapics.iter().flatten().map(|lapic| lapic.cpu_id).collect()
    }

    /// Enabled and disabled APIC ids, each once.
    pub fn slot_ids(&self) -> Vec<u8> {
        let mut ids = self.cpu_ids();
        for id in self.reserved.iter() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// I/O APIC input behind an external vector. An overridden IRQ moves
    /// to its GSI, and the GSI it vacates has no IRQ of its own.
    pub fn gsi_for_vector(&self, vector: u8) -> Option<u32> {
        if vector < HARDWARE_INTERRUPTS_BASE || interrupts::is_local_apic_source(vector) {
            return None;
        }

        let irq = (vector - HARDWARE_INTERRUPTS_BASE) as u32;
        if let Some(iso) = self.overrides.iter().find(|iso| iso.irq as u32 == irq) {
            let gsi = iso.gsi;
            return if self.ioapic.contains(gsi) {
                Some(gsi)
            } else {
                None
            };
        }

        if self.overrides.iter().any(|iso| iso.gsi == irq) {
            return None;
        }

        if self.ioapic.contains(irq) {
            Some(irq)
        } else {
            None
        }
    }
}

pub enum InterruptController<P: Platform> {
    Pic,
    Apic(ApicBackend<P>),
}

/// The façade the rest of the kernel talks to.
pub struct Apic<P: Platform> {
    platform: Arc<P>,
    config: ApicConfig,
    pic: ChainedPIC,
    cmos: Cmos,
    dispatcher: Dispatcher,
    counters: InterruptCounters,
    controller: Once<InterruptController<P>>,
    state: AtomicU8,
    enabling: AtomicBool,
    smp_started: AtomicBool,
    running_aps: AtomicU64,
    ap_stacks: Mutex<Vec<Box<[u8]>>>,
    ap_gdts: Mutex<Vec<Box<GlobalDescriptorTable>>>,
}

impl<P: Platform> Apic<P> {
    pub fn new(platform: Arc<P>, config: ApicConfig) -> Self {
        Apic {
            platform,
            config,
            pic: ChainedPIC::new(),
            cmos: Cmos::new(),
            dispatcher: Dispatcher::new(MAX_CPUS),
            counters: InterruptCounters::new(MAX_CPUS),
            controller: Once::new(),
            state: AtomicU8::new(ControllerState::Uninit as u8),
            enabling: AtomicBool::new(false),
            smp_started: AtomicBool::new(false),
            running_aps: AtomicU64::new(0),
            ap_stacks: Mutex::new(Vec::new()),
            ap_gdts: Mutex::new(Vec::new()),
        }
    }

    pub fn platform(&self) -> &P {
        self.platform.as_ref()
    }

    pub fn config(&self) -> &ApicConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ControllerState) {
        log::debug!("interrupt controller: {:?} -> {:?}", self.state(), state);
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pic(&self) -> &ChainedPIC {
        &self.pic
    }

    pub fn backend(&self) -> Option<&ApicBackend<P>> {
        match self.controller.r#try() {
            Some(InterruptController::Apic(backend)) => Some(backend),
            _ => None,
        }
    }

    /// the register window of the executing CPU, if the APIC is live.
    pub fn local_registers(&self) -> Option<LocalApicRegisters<P>> {
        self.backend()
            .map(|backend| LocalApicRegisters::new(self.platform.as_ref(), backend.mode))
    }

    /// Plugs `handler` into the shared dispatcher.
    pub fn register_handler<H: InterruptHandler + 'static>(&self, handler: Arc<H>) {
        handler.plugin(&self.dispatcher);
    }

    /// Takes over interrupt delivery. The 8259A pair is always remapped
    /// first; the APIC path is taken when `mp_info` describes a supported
    /// system, otherwise the PIC stays in charge.
    pub fn enable(&self, mp_info: Option<&MultiProcessorInfo>) -> Result<(), ApicError> {
        if self.enabling.swap(true, Ordering::AcqRel) {
            log::warn!("interrupt controller enabled twice");
            return Err(ApicError::AlreadyInitialized);
        }

        self.pic.initialize(self.platform.as_ref());
        self.set_state(ControllerState::PicOnly);

        match self.enable_apic(mp_info) {
            Ok(backend) => {
                log::info!(
                    "APIC enabled: BSP {}, {} cpu(s), GSI {}..={}",
                    backend.bsp_id,
                    backend.cpu_ids().len(),
                    backend.ioapic.gsi_base,
                    backend.ioapic.gsi_max
                );
                self.controller
                    .call_once(|| InterruptController::Apic(backend));
                self.set_state(ControllerState::ApicEnabled);
                // APs can only ever see this copy
                self.lvt_report();
                Ok(())
            }
            Err(ApicError::NotSupported) => {
                log::info!("APIC unavailable, interrupts stay on the 8259A");
                self.controller.call_once(|| InterruptController::Pic);
                Ok(())
            }
            Err(err) => {
                log::error!("APIC initialization failed: {}, back on the 8259A", err);
                self.controller.call_once(|| InterruptController::Pic);
                Err(err)
            }
        }
    }

    fn enable_apic(&self, mp_info: Option<&MultiProcessorInfo>) -> Result<ApicBackend<P>, ApicError> {
        let platform = self.platform.as_ref();

        let mp_info = match mp_info {
            Some(mp_info) => mp_info,
            None => {
                log::warn!("no MADT, APIC cannot be used");
                return Err(ApicError::NotSupported);
            }
        };

        if !platform.cpu_features().has_xapic() {
            log::warn!("CPU does not report an xApic");
            return Err(ApicError::NotSupported);
        }

        if mp_info.ioapics.len() != 1 {
            log::warn!(
                "{} I/O APICs reported, exactly one is supported",
                mp_info.ioapics.len()
            );
            return Err(ApicError::NotSupported);
        }

        let pic_masks = self.pic.masks(platform);
        let (mode, bsp_id) =
            lapic::initialize_bsp(platform, mp_info.lapic_address, mp_info.pcat_compat, &self.pic)?;

        self.build_backend(mp_info, mode, bsp_id).map_err(|err| {
            lapic::release_bsp(platform, mp_info.pcat_compat);
            self.pic.mask_requests(platform, pic_masks.0, pic_masks.1);
            err
        })
    }

    fn build_backend(
        &self,
        mp_info: &MultiProcessorInfo,
        mode: Mode,
        bsp_id: u8,
    ) -> Result<ApicBackend<P>, ApicError> {
        let platform = self.platform.as_ref();
        let virt_base = match mode {
            Mode::XApic(Mmio(base)) => base,
            _ => VirtualAddress::from_usize(0),
        };

        let mut lapics: Vec<Option<LocalApic>> = Vec::new();
        let mut place = |lapic: LocalApic| {
            let index = lapic.cpu_id as usize;
            if lapics.len() <= index {
                lapics.resize_with(index + 1, || None);
            }
            if lapics[index].is_some() {
                log::warn!("APIC id {} listed twice, ignoring the duplicate", index);
            } else {
                lapics[index] = Some(lapic);
            }
        };

        for core in mp_info.enabled_cores() {
            let (processor_id, apic_id) = (core.processor_id, core.apic_id);
            place(LocalApic::new(
                apic_id,
                processor_id,
                mp_info.lapic_address,
                virt_base,
                mp_info.nmi_for(processor_id),
            ));
        }

        let bsp_listed = mp_info.enabled_cores().any(|core| core.apic_id == bsp_id);
        if !bsp_listed {
            log::warn!("BSP {} missing from the MADT", bsp_id);
            place(LocalApic::new(
                bsp_id,
                bsp_id,
                mp_info.lapic_address,
                virt_base,
                mp_info.nmi_for(bsp_id),
            ));
        }

        let reserved: Vec<u8> = mp_info
            .cores
            .iter()
            .filter(|core| !core.is_enabled())
            .map(|core| core.apic_id)
            .collect();

        let regs = LocalApicRegisters::new(platform, mode);
        if let Some(bsp) = lapics.get(bsp_id as usize).and_then(Option::as_ref) {
            bsp.initialize(&regs)?;
        }

        let mut ioapic = IoApic::initialize(platform, &mp_info.ioapics[0])?;
        ioapic.initialize_redtbl(platform, bsp_id, &mp_info.isos, &mp_info.nmi_sources)?;

        let errors = Arc::new(ApicErrorHandler::new(self.platform.clone(), mode));
        errors.clone().plugin(&self.dispatcher);

        let initial_count = timer::calibrate(platform, &regs, &self.config)?;
        let cpu_ids: Vec<u8> = lapics.iter().flatten().map(|lapic| lapic.cpu_id).collect();
        let timers = Arc::new(ApicTimers::new(
            self.platform.clone(),
            &self.config,
            bsp_id,
            &cpu_ids,
            initial_count,
        ));
        timers.clone().plugin(&self.dispatcher);
        timers.start(&regs, bsp_id)?;

        Ok(ApicBackend {
            mode,
            bsp_id,
            lapics,
            reserved,
            ioapic,
            overrides: mp_info.isos.clone(),
            timers,
            errors,
            bsp_lvt: Mutex::new(String::new()),
        })
    }

    /// APIC id of the executing CPU, 0 while the PIC is in charge.
    pub fn current_cpu(&self) -> u8 {
        self.local_registers()
            .and_then(|regs| regs.id().ok())
            .unwrap_or(0)
    }

    pub fn bsp_id(&self) -> Option<u8> {
        self.backend().map(|backend| backend.bsp_id)
    }

    /// CPUs known to the controller, including the BSP.
    pub fn cpu_ids(&self) -> Vec<u8> {
        match self.backend() {
            Some(backend) => backend.cpu_ids(),
            None => alloc::vec![0],
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_ids().len()
    }

    pub fn running_aps(&self) -> u64 {
        self.running_aps.load(Ordering::Relaxed)
    }

    pub fn spurious_count(&self) -> usize {
        self.dispatcher.spurious_count()
    }

    pub fn interrupt_depth(&self, cpu_id: u8) -> usize {
        self.dispatcher.depth(cpu_id)
    }

    pub fn interrupt_count(&self, cpu_id: u8, vector: u8) -> usize {
        self.counters.get(cpu_id, vector)
    }

    pub fn counters(&self) -> &InterruptCounters {
        &self.counters
    }

    pub fn timer_initial_count(&self) -> Option<u32> {
        self.backend().map(|backend| backend.timers.initial_count())
    }

    /// Entry of the low-level interrupt stub.
    pub fn dispatch(&self, frame: &InterruptFrame) {
        let cpu_id = self.current_cpu();
        self.counters.increment(cpu_id, frame.vector());
        self.dispatcher.dispatch(frame, cpu_id, self);
    }

    /// Runs on each AP once the trampoline reaches protected mode.
    pub fn ap_main(&self, cpu_id: u8) {
        if (cpu_id as usize) < MAX_CPUS {
            self.running_aps.fetch_or(1 << cpu_id, Ordering::Relaxed);
        }

        let backend = match self.backend() {
            Some(backend) => backend,
            None => {
                log::error!("cpu {} started without an APIC", cpu_id);
                return;
            }
        };

        let regs = LocalApicRegisters::new(self.platform.as_ref(), backend.mode);
        let started = match backend.lapic(cpu_id) {
            Some(lapic) => lapic
                .initialize(&regs)
                .and_then(|_| backend.timers.start(&regs, cpu_id)),
            None => Err(ApicError::OutOfRange),
        };

        match started {
            Ok(()) => log::info!("cpu {} online", cpu_id),
            Err(err) => log::error!("cpu {} failed to initialize: {}", cpu_id, err),
        }
    }

    fn with_local<F>(&self, source: LocalInterrupt, op: F) -> Option<bool>
    where
        F: FnOnce(&LocalApicRegisters<P>, LocalInterrupt) -> Result<bool, ApicError>,
    {
        let regs = self.local_registers()?;
        match op(&regs, source) {
            Ok(result) => Some(result),
            Err(err) => {
                log::error!("{} LVT access failed: {}", source, err);
                None
            }
        }
    }

    fn with_gsi<F>(&self, vector: u8, op: F) -> Option<bool>
    where
        F: FnOnce(&IoApic, &P, u32) -> Result<bool, ApicError>,
    {
        let backend = self.backend()?;
        let gsi = backend.gsi_for_vector(vector)?;
        match op(&backend.ioapic, self.platform.as_ref(), gsi) {
            Ok(result) => Some(result),
            Err(err) => {
                log::error!("REDTBL access for GSI {} failed: {}", gsi, err);
                None
            }
        }
    }

    #[inline]
    fn pic_irq(&self, vector: u8) -> Option<u8> {
        let irq = vector.checked_sub(HARDWARE_INTERRUPTS_BASE)?;
        if self.pic.can_handle(irq) {
            Some(irq)
        } else {
            None
        }
    }
}

impl<P: Platform> InterruptControl for Apic<P> {
    fn allow(&self, vector: u8) {
        match self.controller.r#try() {
            Some(InterruptController::Pic) => {
                if let Some(irq) = self.pic_irq(vector) {
                    self.pic.allow(self.platform.as_ref(), irq);
                }
            }
            Some(InterruptController::Apic(_)) => {
                if let Some(source) = LocalInterrupt::from_vector(vector) {
                    self.with_local(source, |regs, source| {
                        LocalApic::allow(regs, source).map(|_| true)
                    });
                } else {
                    self.with_gsi(vector, |ioapic, platform, gsi| {
                        ioapic.allow(platform, gsi).map(|_| true)
                    });
                }
            }
            None => {}
        }
    }

    fn forbid(&self, vector: u8) {
        match self.controller.r#try() {
            Some(InterruptController::Pic) => {
                if let Some(irq) = self.pic_irq(vector) {
                    self.pic.forbid(self.platform.as_ref(), irq);
                }
            }
            Some(InterruptController::Apic(_)) => {
                if let Some(source) = LocalInterrupt::from_vector(vector) {
                    self.with_local(source, |regs, source| {
                        LocalApic::forbid(regs, source).map(|_| true)
                    });
                } else {
                    self.with_gsi(vector, |ioapic, platform, gsi| {
                        ioapic.forbid(platform, gsi).map(|_| true)
                    });
                }
            }
            None => {}
        }
    }

    fn status(&self, vector: u8) -> bool {
        match self.controller.r#try() {
            Some(InterruptController::Pic) => self
                .pic_irq(vector)
                .map(|irq| self.pic.status(self.platform.as_ref(), irq))
                .unwrap_or(false),
            Some(InterruptController::Apic(_)) => match LocalInterrupt::from_vector(vector) {
                Some(source) => self
                    .with_local(source, |regs, source| LocalApic::status(regs, source))
                    .unwrap_or(false),
                None => self
                    .with_gsi(vector, |ioapic, platform, gsi| ioapic.status(platform, gsi))
                    .unwrap_or(false),
            },
            None => false,
        }
    }

    fn send_end_of_interrupt(&self, vector: u8) {
        match self.controller.r#try() {
            Some(InterruptController::Pic) => {
                if let Some(irq) = self.pic_irq(vector) {
                    self.pic.send_end_of_interrupt(self.platform.as_ref(), irq);
                }
            }
            Some(InterruptController::Apic(backend)) => {
                // LINT1 is delivered as NMI, which takes no EOI
                if vector == interrupts::LINT1 {
                    return;
                }

                let gsi = if interrupts::is_local_apic_source(vector) {
                    None
                } else {
                    match backend.gsi_for_vector(vector) {
                        Some(gsi) => Some(gsi),
                        None => return,
                    }
                };

                let regs = LocalApicRegisters::new(self.platform.as_ref(), backend.mode);
                if let Err(err) = regs.send_end_of_interrupt() {
                    log::error!("local EOI for 0x{:x} failed: {}", vector, err);
                }

                if let Some(gsi) = gsi {
                    if let Err(err) =
                        backend
                            .ioapic
                            .send_end_of_interrupt(self.platform.as_ref(), vector, gsi)
                    {
                        log::error!("I/O APIC EOI for GSI {} failed: {}", gsi, err);
                    }
                }
            }
            None => {}
        }
    }

    fn is_spurious(&self, vector: u8) -> bool {
        match self.controller.r#try() {
            Some(InterruptController::Pic) => match self.pic_irq(vector) {
                Some(irq) if irq == 7 || irq == 15 => {
                    self.pic.is_spurious(self.platform.as_ref(), irq)
                }
                _ => false,
            },
            Some(InterruptController::Apic(_)) => vector == interrupts::SPURIOUS,
            None => false,
        }
    }
}

/// What the low-level stubs need from the installed façade.
pub trait InterruptSystem: Sync {
    fn dispatch(&self, frame: &InterruptFrame);
    fn ap_main(&self, cpu_id: u8);
}

impl<P: Platform> InterruptSystem for Apic<P> {
    fn dispatch(&self, frame: &InterruptFrame) {
        Apic::dispatch(self, frame)
    }

    fn ap_main(&self, cpu_id: u8) {
        Apic::ap_main(self, cpu_id)
    }
}

lazy_static! {
    static ref INTERRUPT_SYSTEM: Once<&'static dyn InterruptSystem> = Once::new();
}

/// Publishes `apic` to the interrupt stubs and the AP trampoline. Only
/// the first call has an effect.
pub fn install<P: Platform>(apic: &'static Apic<P>) {
    INTERRUPT_SYSTEM.call_once(|| apic as &'static dyn InterruptSystem);
}

pub fn installed() -> Option<&'static dyn InterruptSystem> {
    INTERRUPT_SYSTEM.r#try().copied()
}

/// Called by the interrupt stubs with the saved register frame.
#[no_mangle]
pub extern "C" fn dispatch_interrupt(frame: &InterruptFrame) {
    match installed() {
        Some(system) => system.dispatch(frame),
        None => {
            if interrupts::is_unrecoverable(frame.vector()) {
                panic!(
                    "{} before the interrupt controller was installed",
                    ApicError::Unrecoverable(frame.vector())
                );
            }
        }
    }
}

/// Called by the AP trampoline once in protected mode; never returns.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[no_mangle]
pub extern "C" fn boot_ap_main(cpu_id: u32) {
    if let Some(system) = installed() {
        system.ap_main(cpu_id as u8);
    }

    crate::cpu::halt_with_interrupts();
}
