extern crate log;

use core::hint;

use crate::cpu::io::PortIO;

/// PIT interrupt channel 2, the only channel whose output can be polled.
const PIT_CMD_CHANNEL_2: u16 = 0x42;

/// PIT register used to deal with commands.
const PIT_COMMAND_REGISTER: u16 = 0x43;

/// NMI status and control port: bit 0 gates channel 2, bit 1 drives the
/// speaker, bit 5 mirrors the channel 2 output.
const PIT_CHANNEL_2_GATE: u16 = 0x61;

/// By default, the PIT hardware produces frequencies at 1.19 Mhz
pub const PIT_OSCILLATION_FREQUENCY: u64 = 1193182;

/// channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count), binary.
const CMD_CHANNEL_2_ONESHOT: u8 = 0b10_11_000_0;

const GATE_ENABLE: u8 = 1 << 0;
const SPEAKER_ENABLE: u8 = 1 << 1;
const CHANNEL_2_OUTPUT: u8 = 1 << 5;

/// Polled delays on PIT channel 2. Does not depend on interrupts, so it
/// can be used to calibrate the APIC timer with IF cleared.
pub struct Pit;

impl Pit {
    #[inline]
    pub fn ns_to_ticks(ns: u64) -> u64 {
        ((ns as u128 * PIT_OSCILLATION_FREQUENCY as u128) / 1_000_000_000) as u64
    }

    /// counts down at most 0xffff ticks and spins until the output goes high.
    fn oneshot<IO: PortIO + ?Sized>(io: &IO, ticks: u16) {
        let gate = io.read_port(PIT_CHANNEL_2_GATE);
        io.write_port(PIT_CHANNEL_2_GATE, (gate & !SPEAKER_ENABLE) | GATE_ENABLE);

        io.write_port(PIT_COMMAND_REGISTER, CMD_CHANNEL_2_ONESHOT);
        io.write_port(PIT_CMD_CHANNEL_2, ticks as u8);
        io.write_port(PIT_CMD_CHANNEL_2, (ticks >> 8) as u8);

        while io.read_port(PIT_CHANNEL_2_GATE) & CHANNEL_2_OUTPUT == 0 {
            hint::spin_loop();
        }
    }

    pub fn busy_wait_ns<IO: PortIO + ?Sized>(io: &IO, ns: u64) {
        let mut remaining = Self::ns_to_ticks(ns);
        let saved_gate = io.read_port(PIT_CHANNEL_2_GATE);

        while remaining > 0 {
            let chunk = if remaining > 0xffff { 0xffff } else { remaining };
            Self::oneshot(io, chunk as u16);
            remaining -= chunk;
        }

        io.write_port(PIT_CHANNEL_2_GATE, saved_gate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::vec::Vec;

    struct FakePit {
        writes: RefCell<Vec<(u16, u8)>>,
    }

    impl PortIO for FakePit {
        fn read_port(&self, port: u16) -> u8 {
            if port == PIT_CHANNEL_2_GATE {
                // output is high as soon as a count has been written
                return CHANNEL_2_OUTPUT;
            }
            0
        }

        fn write_port(&self, port: u16, value: u8) {
            self.writes.borrow_mut().push((port, value));
        }
    }

    fn counts(pit: &FakePit) -> Vec<u16> {
        let writes = pit.writes.borrow();
        let data: Vec<u8> = writes
            .iter()
            .filter(|(port, _)| *port == PIT_CMD_CHANNEL_2)
            .map(|(_, value)| *value)
            .collect();
        data.chunks(2)
            .map(|pair| pair[0] as u16 | ((pair[1] as u16) << 8))
            .collect()
    }

    #[test]
    fn ten_milliseconds_is_one_chunk() {
        let pit = FakePit { writes: RefCell::new(Vec::new()) };
        Pit::busy_wait_ns(&pit, 10_000_000);
        assert_eq!(counts(&pit), vec![11931]);
        assert!(pit
            .writes
            .borrow()
            .contains(&(PIT_COMMAND_REGISTER, CMD_CHANNEL_2_ONESHOT)));
    }

    #[test]
    fn long_waits_are_split() {
        let pit = FakePit { writes: RefCell::new(Vec::new()) };
        Pit::busy_wait_ns(&pit, 100_000_000);
        assert_eq!(counts(&pit), vec![0xffff, (119318u32 - 0xffff) as u16]);
    }

    #[test]
    fn zero_wait_touches_only_the_gate() {
        let pit = FakePit { writes: RefCell::new(Vec::new()) };
        Pit::busy_wait_ns(&pit, 0);
        assert!(counts(&pit).is_empty());
    }
}
