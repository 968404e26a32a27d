pub mod io;

use core::fmt;

/// Size of a page frame on x86.
pub const PAGE_SIZE: usize = 4096;

pub struct Alignment;

impl Alignment {
    pub fn align_down(addr: u64, size: u64) -> u64 {
        addr & !(size - 1)
    }

    pub fn align_up(addr: u64, size: u64) -> u64 {
        if addr & (size - 1) == 0 {
            addr
        } else {
            (addr | (size - 1)) + 1
        }
    }
}

/// Represents a virtual address in the kernel address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(usize);

/// Represents a physical address, wide enough for the 64-bit
/// APIC base MSR and the MADT address override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(u64);

impl VirtualAddress {
    #[inline]
    pub const fn from_usize(addr: usize) -> Self {
        VirtualAddress(addr)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        VirtualAddress(ptr as usize)
    }

    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn offset(&self, bytes: usize) -> VirtualAddress {
        VirtualAddress(self.0 + bytes)
    }

    #[inline]
    pub fn get_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub fn is_aligned_at(&self, size: usize) -> bool {
        Alignment::align_down(self.0 as u64, size as u64) == self.0 as u64
    }
}

impl PhysicalAddress {
    #[inline]
    pub const fn from_u64(addr: u64) -> Self {
        PhysicalAddress(addr)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn page_number(&self) -> u64 {
        self.0 >> 12
    }

    #[inline]
    pub fn is_aligned_at(&self, size: u64) -> bool {
        Alignment::align_down(self.0, size) == self.0
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Failures reported by the paging collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The requested physical range is already in use.
    Unavailable,
    /// No virtual range could be found for the mapping.
    OutOfVirtualMemory,
    InvalidAddress,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::Unavailable => write!(f, "physical range unavailable"),
            MemoryError::OutOfVirtualMemory => write!(f, "out of virtual memory"),
            MemoryError::InvalidAddress => write!(f, "invalid address"),
        }
    }
}
