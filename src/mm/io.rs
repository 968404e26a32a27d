use crate::mm::VirtualAddress;

use core::ptr;

#[derive(Clone, Copy)]
/// Represents a memory-mapped register from where data
/// can be read or written, it is similar to h/w ports in cpu::io
pub struct MemoryIO {
    pub address: VirtualAddress,
    pub read_only: bool,
}

impl MemoryIO {
    pub fn new(address: VirtualAddress, read_only: bool) -> Self {
        MemoryIO { address, read_only }
    }

    pub fn read_u32(&self) -> u32 {
        unsafe { ptr::read_volatile(self.address.get_mut_ptr::<u32>()) }
    }

    pub fn write_u32(&self, value: u32) {
        if !self.read_only {
            unsafe { ptr::write_volatile(self.address.get_mut_ptr::<u32>(), value) }
        }
    }
}
