extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cpu::dispatcher::MAX_VECTORS;

/// `counters[cpu, vector]`, one atomic word per pair.
pub struct InterruptCounters {
    cpus: usize,
    counts: Vec<AtomicUsize>,
}

impl InterruptCounters {
    pub fn new(cpus: usize) -> Self {
        InterruptCounters {
            cpus,
            counts: (0..cpus * MAX_VECTORS).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    fn slot(&self, cpu_id: u8, vector: u8) -> Option<&AtomicUsize> {
        if (cpu_id as usize) < self.cpus {
            self.counts
                .get(cpu_id as usize * MAX_VECTORS + vector as usize)
        } else {
            None
        }
    }

    /// CPUs outside the matrix are not counted.
    pub fn increment(&self, cpu_id: u8, vector: u8) {
        if let Some(count) = self.slot(cpu_id, vector) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, cpu_id: u8, vector: u8) -> usize {
        self.slot(cpu_id, vector)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// CSV with one column per CPU in `cpus`; vectors no CPU has seen
    /// are left out.
    pub fn report(&self, cpus: &[u8]) -> String {
        let mut out = String::new();
        let _ = write!(out, "vector");
        for cpu in cpus {
            let _ = write!(out, ",cpu{}", cpu);
        }
        out.push('\n');

        for vector in 0..MAX_VECTORS {
            let row: Vec<usize> = cpus
                .iter()
                .map(|cpu| self.get(*cpu, vector as u8))
                .collect();
            if row.iter().all(|count| *count == 0) {
                continue;
            }

            let _ = write!(out, "{}", vector);
            for count in row {
                let _ = write!(out, ",{}", count);
            }
            out.push('\n');
        }

        out
    }
}
