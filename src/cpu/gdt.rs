extern crate alloc;

use alloc::boxed::Box;
use bit_field::BitField;
use core::mem;

/// null, kernel code, kernel data, user code, user data, tss
pub const GDT_ENTRIES: usize = 6;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18;
pub const USER_DATA_SELECTOR: u16 = 0x20;
pub const TSS_SELECTOR: u16 = 0x28;

// access bytes
const ACCESS_KERNEL_CODE: u8 = 0x9A;
const ACCESS_KERNEL_DATA: u8 = 0x92;
const ACCESS_USER_CODE: u8 = 0xFA;
const ACCESS_USER_DATA: u8 = 0xF2;
const ACCESS_TSS_AVAILABLE: u8 = 0x89;

/// 4 KiB granularity, 32-bit default operand size.
const FLAGS_FLAT_32: u8 = 0xC;

/// The 48-bit operand of lgdt/lidt/sgdt/sidt in protected mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(C, packed)]
pub struct DescriptorPointer {
    pub limit: u16,
    pub base: u32,
}

impl DescriptorPointer {
    pub fn to_bytes(&self) -> [u8; 6] {
        let limit = self.limit;
        let base = self.base;
        let mut bytes = [0u8; 6];
        bytes[0..2].copy_from_slice(&limit.to_le_bytes());
        bytes[2..6].copy_from_slice(&base.to_le_bytes());
        bytes
    }
}

/// Encodes a legacy segment descriptor.
pub fn segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut descriptor: u64 = 0;
    descriptor.set_bits(0..16, limit.get_bits(0..16) as u64);
    descriptor.set_bits(16..40, base.get_bits(0..24) as u64);
    descriptor.set_bits(40..48, access as u64);
    descriptor.set_bits(48..52, limit.get_bits(16..20) as u64);
    descriptor.set_bits(52..56, flags as u64 & 0xf);
    descriptor.set_bits(56..64, base.get_bits(24..32) as u64);
    descriptor
}

/// i386 hardware task state. Only ss0/esp0 matter: they are loaded
/// when an interrupt arrives while the AP runs at ring 3.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskStateSegment {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldtr: u32,
    pub trap: u16,
    pub iomap_base: u16,
}

pub const TSS_SIZE: usize = 104;

/// Descriptor table pair owned by one application processor. Boxed so
/// that the TSS address baked into the descriptor never moves.
#[repr(C)]
pub struct GlobalDescriptorTable {
    pub entries: [u64; GDT_ENTRIES],
    pub tss: TaskStateSegment,
}

impl GlobalDescriptorTable {
    pub fn new_for_processor(stack_top: u32) -> Box<GlobalDescriptorTable> {
        let mut table = Box::new(GlobalDescriptorTable {
            entries: [
                0,
                segment_descriptor(0, 0xfffff, ACCESS_KERNEL_CODE, FLAGS_FLAT_32),
                segment_descriptor(0, 0xfffff, ACCESS_KERNEL_DATA, FLAGS_FLAT_32),
                segment_descriptor(0, 0xfffff, ACCESS_USER_CODE, FLAGS_FLAT_32),
                segment_descriptor(0, 0xfffff, ACCESS_USER_DATA, FLAGS_FLAT_32),
                0,
            ],
            tss: TaskStateSegment {
                ss0: KERNEL_DATA_SELECTOR as u32,
                esp0: stack_top,
                iomap_base: TSS_SIZE as u16,
                ..TaskStateSegment::default()
            },
        });

        let tss_base = &table.tss as *const TaskStateSegment as usize as u32;
        table.entries[(TSS_SELECTOR >> 3) as usize] =
            segment_descriptor(tss_base, (TSS_SIZE - 1) as u32, ACCESS_TSS_AVAILABLE, 0);
        table
    }

    pub fn as_pointer(&self) -> DescriptorPointer {
        DescriptorPointer {
            base: self.entries.as_ptr() as usize as u32,
            limit: (mem::size_of::<u64>() * GDT_ENTRIES - 1) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_segments_encode_like_the_manual() {
        assert_eq!(
            segment_descriptor(0, 0xfffff, ACCESS_KERNEL_CODE, FLAGS_FLAT_32),
            0x00CF_9A00_0000_FFFF
        );
        assert_eq!(
            segment_descriptor(0, 0xfffff, ACCESS_USER_DATA, FLAGS_FLAT_32),
            0x00CF_F200_0000_FFFF
        );
        assert_eq!(
            segment_descriptor(0x1234_5678, 103, ACCESS_TSS_AVAILABLE, 0),
            0x1200_8934_5678_0067
        );
    }

    #[test]
    fn tss_has_the_i386_layout() {
        assert_eq!(mem::size_of::<TaskStateSegment>(), TSS_SIZE);
        assert_eq!(mem::size_of::<DescriptorPointer>(), 6);
    }

    #[test]
    fn processor_table_points_at_its_own_tss() {
        let table = GlobalDescriptorTable::new_for_processor(0x9000);
        let tss = table.entries[5];
        let base = (tss.get_bits(16..40) | (tss.get_bits(56..64) << 24)) as u32;
        assert_eq!(base, &table.tss as *const TaskStateSegment as usize as u32);
        assert_eq!(tss.get_bits(40..48), ACCESS_TSS_AVAILABLE as u64);
        assert_eq!({ table.tss.esp0 }, 0x9000);
        assert_eq!({ table.tss.ss0 }, 0x10);
        assert_eq!({ table.as_pointer().limit }, 47);
    }

    #[test]
    fn pointer_serializes_little_endian() {
        let ptr = DescriptorPointer {
            limit: 0x2f,
            base: 0x0010_2000,
        };
        assert_eq!(ptr.to_bytes(), [0x2f, 0x00, 0x00, 0x20, 0x10, 0x00]);
    }
}
