//! Emulated chipset for the unit tests: per-CPU local APICs, one I/O
//! APIC, the 8259A pair, CMOS, IMCR and a clock that only moves on busy
//! waits. Startup IPIs run the entry pointer patched into the trampoline
//! page, on the target CPU, during the next busy wait.

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use crate::apic::registers::{DeliveryMode, TimerDivide};
use crate::apic::TRAMPOLINE_ADDR;
use crate::cpu::cpuid::CPUFeatures;
use crate::cpu::gdt::DescriptorPointer;
use crate::cpu::io::PortIO;
use crate::cpu::pit::{Pit, PIT_OSCILLATION_FREQUENCY};
use crate::mm::{MemoryError, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::platform::{Platform, ProcessorState};

pub const LAPIC_PHYS: u64 = 0xFEE0_0000;
pub const IOAPIC_PHYS: u64 = 0xFEC0_0000;

/// where test trampolines keep the entry pointer.
pub const TEST_ENTRY_SLOT: usize = 48;

pub const BUS_HZ: u64 = 100_000_000;

const MMIO_WINDOW_BASE: usize = 0x4000_0000;

const LAPIC_ID: usize = 0x20;
const LAPIC_VERSION: usize = 0x30;
const LAPIC_EOI: usize = 0xB0;
const LAPIC_ICR_LOW: usize = 0x300;
const LAPIC_ICR_HIGH: usize = 0x310;
const LAPIC_TIMER_INITIAL: usize = 0x380;
const LAPIC_TIMER_CURRENT: usize = 0x390;
const LAPIC_TIMER_DIVIDE: usize = 0x3E0;

const IOAPIC_SELECT: usize = 0x00;
const IOAPIC_WINDOW: usize = 0x10;
const IOAPIC_EOI: usize = 0x40;

const APIC_BASE_MSR: u32 = 0x1B;

const PIC_PORTS: [(u16, u16); 2] = [(0x20, 0x21), (0xA0, 0xA1)];

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub cpu_features: CPUFeatures,
    /// raw VER of every local APIC
    pub lapic_version: u32,
    pub ioapic_version: u8,
    pub ioapic_max_entry: u8,
    /// APs that never answer a STARTUP IPI
    pub unresponsive: Vec<u8>,
    /// no virtual range left for the I/O APIC window
    pub ioapic_unmappable: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            cpu_features: CPUFeatures::from_raw(0, (1 << 9) | (1 << 5)),
            lapic_version: 0x14 | (6 << 16) | (1 << 24),
            ioapic_version: 0x11,
            ioapic_max_entry: 23,
            unresponsive: Vec::new(),
            ioapic_unmappable: false,
        }
    }
}

/// Register traffic in wire order. I/O APIC accesses are recorded by
/// indirect register, the select write is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    LapicRead { cpu: u8, register: usize },
    LapicWrite { cpu: u8, register: usize, value: u32 },
    IoApicRead { register: u32 },
    IoApicWrite { register: u32, value: u32 },
    IoApicEoi { vector: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Lapic,
    IoApic,
}

#[derive(Default)]
struct LocalApicState {
    registers: HashMap<usize, u32>,
    icr_pending: bool,
    timer_started_ns: u64,
}

#[derive(Default)]
struct PicState {
    mask: u8,
    isr: u8,
    read_isr: bool,
    init_words: u8,
}

struct Mapping {
    phys: u64,
    buffer: Vec<u8>,
}

#[derive(Default)]
struct State {
    now_ns: u64,
    lapics: HashMap<u8, LocalApicState>,
    msrs: HashMap<(u8, u32), u64>,
    ioapic_select: u32,
    ioapic_registers: HashMap<u32, u32>,
    pics: [PicState; 2],
    cmos_index: u8,
    cmos: HashMap<u8, u8>,
    cmos_writes: Vec<(u8, u8)>,
    nmi_masked: bool,
    ports: Vec<(u16, u8)>,
    events: Vec<Event>,
    windows: Vec<(usize, usize, Region)>,
    next_window: usize,
    mappings: HashMap<usize, Mapping>,
    unmapped: Vec<(u64, Vec<u8>)>,
    startups: Vec<(u8, u8)>,
    pending_aps: Vec<u8>,
    started_aps: Vec<u8>,
}

pub struct MockPlatform {
    config: MockConfig,
    state: Mutex<State>,
    current: AtomicU8,
    yields: AtomicUsize,
    interrupts: AtomicBool,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        MockPlatform {
            config,
            state: Mutex::new(State {
                next_window: MMIO_WINDOW_BASE,
                ..State::default()
            }),
            current: AtomicU8::new(0),
            yields: AtomicUsize::new(0),
            interrupts: AtomicBool::new(true),
        }
    }

    pub fn current_cpu(&self) -> u8 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set_current_cpu(&self, cpu: u8) {
        self.current.store(cpu, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn clear_events(&self) {
        let mut state = self.state.lock().unwrap();
        state.events.clear();
        state.ports.clear();
    }

    /// Raw register of the local APIC of `cpu`.
    pub fn lapic_register(&self, cpu: u8, register: usize) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .lapics
            .get(&cpu)
            .map(|lapic| lapic_stored(lapic, register))
            .unwrap_or_else(|| lapic_reset_value(register))
    }

    pub fn lapic_eoi_writes(&self, cpu: u8) -> usize {
        self.events()
            .iter()
            .filter(|event| match event {
                Event::LapicWrite { cpu: c, register, .. } => *c == cpu && *register == LAPIC_EOI,
                _ => false,
            })
            .count()
    }

    /// REDTBL indexes whose low half, the one holding the mask, was written.
    pub fn redtbl_writes(&self) -> Vec<u32> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Event::IoApicWrite { register, .. } if *register >= 0x10 && register % 2 == 0 => {
                    Some((register - 0x10) / 2)
                }
                _ => None,
            })
            .collect()
    }

    pub fn ioapic_eoi_writes(&self) -> Vec<u32> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Event::IoApicEoi { vector } => Some(*vector),
                _ => None,
            })
            .collect()
    }

    pub fn pic_masks(&self) -> (u8, u8) {
        let state = self.state.lock().unwrap();
        (state.pics[0].mask, state.pics[1].mask)
    }

    pub fn set_pic_isr(&self, master: u8, slave: u8) {
        let mut state = self.state.lock().unwrap();
        state.pics[0].isr = master;
        state.pics[1].isr = slave;
    }

    pub fn port_writes(&self) -> Vec<(u16, u8)> {
        self.state.lock().unwrap().ports.clone()
    }

    pub fn cmos_writes(&self) -> Vec<(u8, u8)> {
        self.state.lock().unwrap().cmos_writes.clone()
    }

    pub fn nmi_masked(&self) -> bool {
        self.state.lock().unwrap().nmi_masked
    }

    /// (target, vector) of every STARTUP IPI.
    pub fn startups(&self) -> Vec<(u8, u8)> {
        self.state.lock().unwrap().startups.clone()
    }

    /// (physical address, final content) of every released heap mapping.
    pub fn unmapped(&self) -> Vec<(u64, Vec<u8>)> {
        self.state.lock().unwrap().unmapped.clone()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }

    pub fn now_ns(&self) -> u64 {
        self.state.lock().unwrap().now_ns
    }

    fn region(state: &State, address: usize) -> Option<(Region, usize)> {
        state
            .windows
            .iter()
            .find(|(base, size, _)| address >= *base && address < base + size)
            .map(|(base, _, region)| (*region, address - base))
    }

    fn map_window(&self, phys: PhysicalAddress, size: usize) -> VirtualAddress {
        let region = if phys.as_u64() == IOAPIC_PHYS {
            Region::IoApic
        } else {
            Region::Lapic
        };

        let mut state = self.state.lock().unwrap();
        let base = state.next_window;
        let size = size.max(PAGE_SIZE);
        state.next_window += size;
        state.windows.push((base, size, region));
        VirtualAddress::from_usize(base)
    }

    fn map_heap(&self, phys: PhysicalAddress, size: usize) -> VirtualAddress {
        let mut buffer = vec![0u8; size];
        let virt = buffer.as_mut_ptr() as usize;
        self.state.lock().unwrap().mappings.insert(
            virt,
            Mapping {
                phys: phys.as_u64(),
                buffer,
            },
        );
        VirtualAddress::from_usize(virt)
    }

    /// Entry pointer patched into the trampoline page, if it is mapped.
    fn trampoline_entry(state: &State) -> Option<extern "C" fn(u32)> {
        let mapping = state
            .mappings
            .values()
            .find(|mapping| mapping.phys == TRAMPOLINE_ADDR)?;
        if mapping.buffer.len() < TEST_ENTRY_SLOT + mem::size_of::<usize>() {
            return None;
        }

        let raw = unsafe {
            ptr::read_unaligned(mapping.buffer.as_ptr().add(TEST_ENTRY_SLOT) as *const usize)
        };
        if raw == 0 {
            return None;
        }
        Some(unsafe { mem::transmute::<usize, extern "C" fn(u32)>(raw) })
    }

    fn read_lapic(&self, state: &mut State, cpu: u8, register: usize) -> u32 {
        state.events.push(Event::LapicRead { cpu, register });
        let now = state.now_ns;
        let lapic = state.lapics.entry(cpu).or_default();

        match register {
            LAPIC_ID => (cpu as u32) << 24,
            LAPIC_VERSION => self.config.lapic_version,
            LAPIC_ICR_LOW => {
                let mut value = lapic_stored(lapic, register) & !(1 << 12);
                if lapic.icr_pending {
                    value |= 1 << 12;
                    lapic.icr_pending = false;
                }
                value
            }
            LAPIC_TIMER_CURRENT => timer_current(lapic, now),
            _ => lapic_stored(lapic, register),
        }
    }

    fn write_lapic(&self, state: &mut State, cpu: u8, register: usize, value: u32) {
        state.events.push(Event::LapicWrite {
            cpu,
            register,
            value,
        });
        let now = state.now_ns;
        let lapic = state.lapics.entry(cpu).or_default();
        lapic.registers.insert(register, value);

        match register {
            LAPIC_TIMER_INITIAL => lapic.timer_started_ns = now,
            LAPIC_ICR_LOW => {
                lapic.icr_pending = true;
                let target = (lapic_stored(lapic, LAPIC_ICR_HIGH) >> 24) as u8;
                if (value >> 8) & 0b111 == DeliveryMode::Startup as u32 {
                    state.startups.push((target, value as u8));
                    let wakes = target != cpu
                        && !self.config.unresponsive.contains(&target)
                        && !state.started_aps.contains(&target)
                        && !state.pending_aps.contains(&target);
                    if wakes {
                        state.pending_aps.push(target);
                    }
                }
            }
            _ => {}
        }
    }

    fn read_ioapic(&self, state: &mut State, offset: usize) -> u32 {
        if offset != IOAPIC_WINDOW {
            return 0;
        }

        let register = state.ioapic_select;
        state.events.push(Event::IoApicRead { register });
        match register {
            0x00 => 1 << 24,
            0x01 => self.config.ioapic_version as u32 | ((self.config.ioapic_max_entry as u32) << 16),
            _ => state
                .ioapic_registers
                .get(&register)
                .copied()
                .unwrap_or(if register >= 0x10 && register % 2 == 0 {
                    1 << 16
                } else {
                    0
                }),
        }
    }

    fn write_ioapic(&self, state: &mut State, offset: usize, value: u32) {
        match offset {
            IOAPIC_SELECT => state.ioapic_select = value,
            IOAPIC_WINDOW => {
                let register = state.ioapic_select;
                state.events.push(Event::IoApicWrite { register, value });
                state.ioapic_registers.insert(register, value);
            }
            IOAPIC_EOI => state.events.push(Event::IoApicEoi { vector: value }),
            _ => {}
        }
    }

    fn run_pending_aps(&self) {
        let (pending, entry) = {
            let mut state = self.state.lock().unwrap();
            let pending: Vec<u8> = state.pending_aps.drain(..).collect();
            state.started_aps.extend(pending.iter().copied());
            (pending, Self::trampoline_entry(&state))
        };

        let entry = match entry {
            Some(entry) => entry,
            None => return,
        };

        for cpu in pending {
            let previous = self.current.swap(cpu, Ordering::SeqCst);
            entry(cpu as u32);
            self.current.store(previous, Ordering::SeqCst);
        }
    }
}

fn lapic_reset_value(register: usize) -> u32 {
    match register {
        // every LVT entry comes out of reset masked
        0x2F0 | 0x320..=0x370 => 1 << 16,
        0xF0 => 0xFF,
        _ => 0,
    }
}

fn lapic_stored(lapic: &LocalApicState, register: usize) -> u32 {
    lapic
        .registers
        .get(&register)
        .copied()
        .unwrap_or_else(|| lapic_reset_value(register))
}

fn timer_current(lapic: &LocalApicState, now: u64) -> u32 {
    let initial = lapic_stored(lapic, LAPIC_TIMER_INITIAL) as u64;
    if initial == 0 {
        return 0;
    }

    let divisor = TimerDivide::from_register(lapic_stored(lapic, LAPIC_TIMER_DIVIDE)).divisor() as u128;
    let elapsed_ns = (now - lapic.timer_started_ns) as u128;
    let ticks = (elapsed_ns * BUS_HZ as u128 / (divisor * 1_000_000_000)) as u64;

    let periodic = (lapic_stored(lapic, 0x320) >> 17) & 0b11 == 1;
    if ticks < initial {
        (initial - ticks) as u32
    } else if periodic {
        (initial - ticks % initial) as u32
    } else {
        0
    }
}

impl PortIO for MockPlatform {
    fn read_port(&self, port: u16) -> u8 {
        let state = self.state.lock().unwrap();
        for (index, (cmd, data)) in PIC_PORTS.iter().enumerate() {
            let pic = &state.pics[index];
            if port == *cmd {
                return if pic.read_isr { pic.isr } else { 0 };
            }
            if port == *data {
                return pic.mask;
            }
        }

        match port {
            0x71 => state.cmos.get(&state.cmos_index).copied().unwrap_or(0),
            // PIT channel 2 output, always expired
            0x61 => 1 << 5,
            _ => 0,
        }
    }

    fn write_port(&self, port: u16, value: u8) {
        let mut state = self.state.lock().unwrap();
        state.ports.push((port, value));

        for (index, (cmd, data)) in PIC_PORTS.iter().enumerate() {
            let pic = &mut state.pics[index];
            if port == *cmd {
                match value {
                    _ if value & 0x10 != 0 => pic.init_words = 3,
                    0x0A => pic.read_isr = false,
                    0x0B => pic.read_isr = true,
                    0x20 => pic.isr &= pic.isr.wrapping_sub(1),
                    _ => {}
                }
                return;
            }
            if port == *data {
                if pic.init_words > 0 {
                    pic.init_words -= 1;
                } else {
                    pic.mask = value;
                }
                return;
            }
        }

        match port {
            0x70 => {
                state.cmos_index = value & 0x7f;
                state.nmi_masked = value & 0x80 != 0;
            }
            0x71 => {
                let index = state.cmos_index;
                state.cmos.insert(index, value);
                state.cmos_writes.push((index, value));
            }
            _ => {}
        }
    }

    fn io_wait(&self) {}
}

impl Platform for MockPlatform {
    fn read_mmio(&self, address: VirtualAddress) -> u32 {
        let cpu = self.current_cpu();
        let mut state = self.state.lock().unwrap();
        match Self::region(&state, address.as_usize()) {
            Some((Region::Lapic, offset)) => self.read_lapic(&mut state, cpu, offset),
            Some((Region::IoApic, offset)) => self.read_ioapic(&mut state, offset),
            None => panic!("read from unmapped MMIO 0x{:x}", address.as_usize()),
        }
    }

    fn write_mmio(&self, address: VirtualAddress, value: u32) {
        let cpu = self.current_cpu();
        let mut state = self.state.lock().unwrap();
        match Self::region(&state, address.as_usize()) {
            Some((Region::Lapic, offset)) => self.write_lapic(&mut state, cpu, offset, value),
            Some((Region::IoApic, offset)) => self.write_ioapic(&mut state, offset, value),
            None => panic!("write to unmapped MMIO 0x{:x}", address.as_usize()),
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        let cpu = self.current_cpu();
        let state = self.state.lock().unwrap();
        if let Some(value) = state.msrs.get(&(cpu, msr)) {
            return *value;
        }

        match msr {
            APIC_BASE_MSR => {
                let bsp = if cpu == 0 { 1 << 8 } else { 0 };
                LAPIC_PHYS | (1 << 11) | bsp
            }
            _ => 0,
        }
    }

    fn write_msr(&self, msr: u32, value: u64) {
        let cpu = self.current_cpu();
        self.state.lock().unwrap().msrs.insert((cpu, msr), value);
    }

    fn cpu_features(&self) -> CPUFeatures {
        self.config.cpu_features
    }

    fn map_mmio(&self, phys: PhysicalAddress, size: usize) -> Result<VirtualAddress, MemoryError> {
        if self.config.ioapic_unmappable && phys.as_u64() == IOAPIC_PHYS {
            return Err(MemoryError::OutOfVirtualMemory);
        }
        Ok(self.map_window(phys, size))
    }

    fn map_identity(
        &self,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        Ok(self.map_heap(phys, size))
    }

    fn map_physical(
        &self,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        Ok(self.map_heap(phys, size))
    }

    fn unmap(&self, virt: VirtualAddress, _size: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(mapping) = state.mappings.remove(&virt.as_usize()) {
            state.unmapped.push((mapping.phys, mapping.buffer));
        }
    }

    fn busy_wait_ns(&self, ns: u64) {
        // the PIT only resolves whole ticks
        let ticks = Pit::ns_to_ticks(ns);
        let waited = (ticks as u128 * 1_000_000_000 / PIT_OSCILLATION_FREQUENCY as u128) as u64;
        self.state.lock().unwrap().now_ns += waited;

        self.run_pending_aps();
    }

    fn pause(&self) {
        std::hint::spin_loop();
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }

    fn processor_state(&self) -> ProcessorState {
        ProcessorState {
            gdtr: DescriptorPointer {
                limit: 0x2f,
                base: 0x0010_0000,
            },
            idtr: DescriptorPointer {
                limit: 0x7ff,
                base: 0x0010_1000,
            },
            cr0: 0x8000_0011,
            cr3: 0x0020_0000,
            cr4: 0x10,
        }
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
    }
}
