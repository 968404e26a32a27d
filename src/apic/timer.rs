extern crate alloc;
extern crate log;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::apic::lapic::{LapicNumbers, LocalApicRegisters, LocalInterrupt};
use crate::apic::registers::{LvtEntry, TimerDivide, TimerMode};
use crate::apic::{ApicConfig, ApicError};
use crate::cpu::dispatcher::{Dispatcher, InterruptHandler};
use crate::cpu::interrupts::{self, InterruptFrame};
use crate::platform::Platform;

const NS_PER_MS: u64 = 1_000_000;
const COUNTER_START: u32 = 0xffff_ffff;

/// Per-CPU tick bookkeeping of the local APIC timer.
#[derive(Debug)]
pub struct ApicTimer {
    pub cpu_id: u8,
    pub timer_interval_ns: u64,
    pub yield_interval_ms: u64,
    time: AtomicU64,
}

impl ApicTimer {
    pub fn new(cpu_id: u8, timer_interval_ns: u64, yield_interval_ms: u64) -> Self {
        ApicTimer {
            cpu_id,
            timer_interval_ns,
            yield_interval_ms,
            time: AtomicU64::new(0),
        }
    }

    /// Advances the clock by one interval; true when the scheduler is due.
    pub fn tick(&self) -> bool {
        let now = self.time.fetch_add(self.timer_interval_ns, Ordering::Relaxed)
            + self.timer_interval_ns;
        let yield_ns = self.yield_interval_ms * NS_PER_MS;
        yield_ns != 0 && now % yield_ns == 0
    }

    /// nanoseconds of timer ticks seen on this CPU.
    pub fn time_ns(&self) -> u64 {
        self.time.load(Ordering::Relaxed)
    }
}

/// Measures how many timer ticks fit one interval by letting the counter
/// run down from its maximum across `factor * interval` of busy wait.
/// Leaves the timer stopped and its LVT entry masked.
pub fn calibrate<P: Platform>(
    platform: &P,
    regs: &LocalApicRegisters<P>,
    config: &ApicConfig,
) -> Result<u32, ApicError> {
    let mut lvt = regs.read_lvt(LocalInterrupt::Timer)?;
    lvt.timer_mode = TimerMode::Periodic;
    lvt.masked = true;
    regs.write_lvt(LocalInterrupt::Timer, lvt)?;

    regs.write(
        LapicNumbers::TimerDivideConfig,
        config.timer_divider.to_register(),
    )?;
    regs.write(LapicNumbers::TimerInitialCount, COUNTER_START)?;

    let factor = config.calibration_factor.max(1);
    platform.busy_wait_ns(factor as u64 * config.timer_interval_ns);

    let current = regs.read(LapicNumbers::TimerCurrentCount)?;
    regs.write(LapicNumbers::TimerInitialCount, 0)?;

    let ticks = COUNTER_START - current;
    let initial_count = ticks / factor;
    log::info!(
        "APIC timer: {} ticks per {} ns at divide {}",
        initial_count,
        config.timer_interval_ns,
        config.timer_divider.divisor()
    );

    if initial_count == 0 {
        log::warn!("APIC timer did not advance during calibration");
    }

    Ok(initial_count)
}

/// The timers of every CPU plus the calibrated count they share.
pub struct ApicTimers<P: Platform> {
    platform: Arc<P>,
    timers: Vec<Option<ApicTimer>>,
    bsp_id: u8,
    divide: TimerDivide,
    initial_count: AtomicU32,
}

impl<P: Platform> ApicTimers<P> {
    pub fn new(
        platform: Arc<P>,
        config: &ApicConfig,
        bsp_id: u8,
        cpu_ids: &[u8],
        initial_count: u32,
    ) -> Self {
        let slots = cpu_ids
            .iter()
            .copied()
            .chain(core::iter::once(bsp_id))
            .max()
            .map(|max| max as usize + 1)
            .unwrap_or(0);

        let mut timers: Vec<Option<ApicTimer>> = (0..slots).map(|_| None).collect();
        for cpu_id in cpu_ids.iter().copied().chain(core::iter::once(bsp_id)) {
            timers[cpu_id as usize] = Some(ApicTimer::new(
                cpu_id,
                config.timer_interval_ns,
                config.yield_interval_ms,
            ));
        }

        ApicTimers {
            platform,
            timers,
            bsp_id,
            divide: config.timer_divider,
            initial_count: AtomicU32::new(initial_count),
        }
    }

    pub fn initial_count(&self) -> u32 {
        self.initial_count.load(Ordering::Relaxed)
    }

    pub fn timer(&self, cpu_id: u8) -> Option<&ApicTimer> {
        self.timers.get(cpu_id as usize).and_then(Option::as_ref)
    }

    /// Starts the periodic timer of the executing CPU, `cpu_id`.
    pub fn start(&self, regs: &LocalApicRegisters<P>, cpu_id: u8) -> Result<(), ApicError> {
        if self.timer(cpu_id).is_none() {
            return Err(ApicError::OutOfRange);
        }

        let mut lvt = LvtEntry::masked(interrupts::TIMER);
        lvt.masked = false;
        lvt.timer_mode = TimerMode::Periodic;

        regs.write(LapicNumbers::TimerDivideConfig, self.divide.to_register())?;
        regs.write_lvt(LocalInterrupt::Timer, lvt)?;
        regs.write(LapicNumbers::TimerInitialCount, self.initial_count())?;

        log::debug!("APIC timer started on cpu {}", cpu_id);
        Ok(())
    }
}

impl<P: Platform> InterruptHandler for ApicTimers<P> {
    fn plugin(self: Arc<Self>, dispatcher: &Dispatcher) {
        dispatcher.assign(interrupts::TIMER, self);
    }

    fn trigger(&self, _frame: &InterruptFrame, cpu_id: u8) {
        if let Some(timer) = self.timer(cpu_id) {
            // APs have no scheduler, their clocks only count
            if timer.tick() && cpu_id == self.bsp_id {
                self.platform.yield_now();
            }
        }
    }
}
