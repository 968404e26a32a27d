extern crate alloc;
extern crate log;
extern crate spin;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::RwLock;

use crate::apic::ApicError;
use crate::cpu::interrupts::{self, InterruptFrame};

pub const MAX_VECTORS: usize = 256;

/// The operations every interrupt controller exposes to the dispatcher.
pub trait InterruptControl {
    fn allow(&self, vector: u8);
    fn forbid(&self, vector: u8);
    /// true if the vector is masked.
    fn status(&self, vector: u8) -> bool;
    fn send_end_of_interrupt(&self, vector: u8);
    fn is_spurious(&self, vector: u8) -> bool;
}

pub trait InterruptHandler: Send + Sync {
    /// registers the handler for the vector(s) it serves.
    fn plugin(self: Arc<Self>, dispatcher: &Dispatcher)
    where
        Self: Sized;

    fn trigger(&self, frame: &InterruptFrame, cpu_id: u8);
}

/// Vector to handler table shared by every CPU.
pub struct Dispatcher {
    handlers: Vec<RwLock<Vec<Arc<dyn InterruptHandler>>>>,
    spurious: AtomicUsize,
    depth: Vec<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(max_cpus: usize) -> Self {
        Dispatcher {
            handlers: (0..MAX_VECTORS).map(|_| RwLock::new(Vec::new())).collect(),
            spurious: AtomicUsize::new(0),
            depth: (0..max_cpus).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// appends `handler` to the list of `vector`.
    pub fn assign(&self, vector: u8, handler: Arc<dyn InterruptHandler>) {
        self.handlers[vector as usize].write().push(handler);
    }

    pub fn has_handler(&self, vector: u8) -> bool {
        !self.handlers[vector as usize].read().is_empty()
    }

    pub fn spurious_count(&self) -> usize {
        self.spurious.load(Ordering::Relaxed)
    }

    /// nesting level of interrupt handling on `cpu_id`.
    pub fn depth(&self, cpu_id: u8) -> usize {
        self.depth
            .get(cpu_id as usize)
            .map(|depth| depth.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn dispatch(&self, frame: &InterruptFrame, cpu_id: u8, control: &dyn InterruptControl) {
        let vector = frame.vector();
        let depth = self.depth.get(cpu_id as usize);
        if let Some(depth) = depth {
            depth.fetch_add(1, Ordering::Relaxed);
        }

        if control.is_spurious(vector) {
            self.spurious.fetch_add(1, Ordering::Relaxed);
        } else {
            // clone the list so handlers may plug further handlers
            let handlers: Vec<Arc<dyn InterruptHandler>> =
                self.handlers[vector as usize].read().clone();

            if handlers.is_empty() && interrupts::is_unrecoverable(vector) {
                panic!("{} on cpu {}: {:?}", ApicError::Unrecoverable(vector), cpu_id, frame);
            }

            for handler in handlers.iter() {
                handler.trigger(frame, cpu_id);
            }

            control.send_end_of_interrupt(vector);
        }

        if let Some(depth) = depth {
            depth.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    #[derive(Default)]
    struct Controller {
        eois: Mutex<Vec<u8>>,
    }

    impl InterruptControl for Controller {
        fn allow(&self, _vector: u8) {}
        fn forbid(&self, _vector: u8) {}
        fn status(&self, _vector: u8) -> bool {
            false
        }
        fn send_end_of_interrupt(&self, vector: u8) {
            self.eois.lock().unwrap().push(vector);
        }
        fn is_spurious(&self, vector: u8) -> bool {
            vector == interrupts::SPURIOUS
        }
    }

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, u8, usize)>>>,
        dispatcher_depth: Arc<Dispatcher>,
    }

    impl InterruptHandler for Recorder {
        fn plugin(self: Arc<Self>, dispatcher: &Dispatcher) {
            dispatcher.assign(interrupts::KEYBOARD, self);
        }

        fn trigger(&self, frame: &InterruptFrame, cpu_id: u8) {
            let depth = self.dispatcher_depth.depth(cpu_id);
            self.seen.lock().unwrap().push((self.name, frame.vector(), depth));
        }
    }

    #[test]
    fn handlers_run_in_registration_order_then_eoi() {
        let dispatcher = Arc::new(Dispatcher::new(4));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"].iter() {
            Arc::new(Recorder {
                name,
                seen: seen.clone(),
                dispatcher_depth: dispatcher.clone(),
            })
            .plugin(&dispatcher);
        }

        let controller = Controller::default();
        dispatcher.dispatch(&InterruptFrame::for_vector(interrupts::KEYBOARD), 1, &controller);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("first", interrupts::KEYBOARD, 1),
                ("second", interrupts::KEYBOARD, 1)
            ]
        );
        assert_eq!(*controller.eois.lock().unwrap(), vec![interrupts::KEYBOARD]);
        assert_eq!(dispatcher.depth(1), 0);
    }

    #[test]
    fn spurious_vector_is_counted_not_acknowledged() {
        let dispatcher = Dispatcher::new(1);
        let controller = Controller::default();
        dispatcher.dispatch(&InterruptFrame::for_vector(interrupts::SPURIOUS), 0, &controller);
        assert_eq!(dispatcher.spurious_count(), 1);
        assert!(controller.eois.lock().unwrap().is_empty());
    }

    #[test]
    fn unhandled_vectors_still_get_eoi() {
        let dispatcher = Dispatcher::new(1);
        let controller = Controller::default();
        dispatcher.dispatch(&InterruptFrame::for_vector(interrupts::COM1), 0, &controller);
        assert_eq!(*controller.eois.lock().unwrap(), vec![interrupts::COM1]);
    }

    #[test]
    #[should_panic(expected = "unrecoverable")]
    fn unhandled_page_fault_panics() {
        let dispatcher = Dispatcher::new(1);
        let controller = Controller::default();
        dispatcher.dispatch(&InterruptFrame::for_vector(interrupts::PAGE_FAULT), 0, &controller);
    }
}
