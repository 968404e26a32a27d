//! The AP startup blob assembled into bare-metal i686 kernels. Hosted
//! builds have no use for real-mode code and bring their own
//! [`TrampolineBlob`](crate::apic::smp::TrampolineBlob).

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod native {
    use core::arch::global_asm;
    use core::slice;

    use crate::apic::boot_ap_main;
    use crate::apic::smp::TrampolineBlob;

    global_asm!(include_str!("trampoline.s"), options(att_syntax));

    extern "C" {
        static boot_ap: u8;
        /// absolute symbol, the address is the length of the blob
        static boot_ap_size: u8;
        static boot_ap_gdtr: u8;
        static boot_ap_idtr: u8;
        static boot_ap_cr0: u8;
        static boot_ap_cr3: u8;
        static boot_ap_cr4: u8;
        static boot_ap_gdts: u8;
        static boot_ap_stacks: u8;
        static boot_ap_entry: u8;
    }

    impl TrampolineBlob {
        /// The assembled trampoline, entering [`boot_ap_main`].
        pub fn native() -> TrampolineBlob {
            unsafe {
                let start = &boot_ap as *const u8 as usize;
                let size = &boot_ap_size as *const u8 as usize;
                let offset = |symbol: &u8| symbol as *const u8 as usize - start;

                TrampolineBlob {
                    code: slice::from_raw_parts(start as *const u8, size),
                    gdtr: offset(&boot_ap_gdtr),
                    idtr: offset(&boot_ap_idtr),
                    cr0: offset(&boot_ap_cr0),
                    cr3: offset(&boot_ap_cr3),
                    cr4: offset(&boot_ap_cr4),
                    gdts: offset(&boot_ap_gdts),
                    stacks: offset(&boot_ap_stacks),
                    entry: offset(&boot_ap_entry),
                    entry_point: boot_ap_main,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    const ASSEMBLY: &str = include_str!("trampoline.s");
    const BINDINGS: &str = include_str!("trampoline.rs");

    fn bound_symbols() -> Vec<&'static str> {
        BINDINGS
            .lines()
            .filter_map(|line| line.trim().strip_prefix("static "))
            .filter_map(|rest| rest.split(':').next())
            .collect()
    }

    #[test]
    fn every_bound_symbol_is_exported() {
        let symbols = bound_symbols();
        assert!(symbols.contains(&"boot_ap_size"));
        for symbol in symbols {
            let export = format!(".global {}\n", symbol);
            assert!(ASSEMBLY.contains(&export), "{} is not exported", symbol);
        }
    }

    #[test]
    fn blob_size_spans_the_patched_slots() {
        assert!(ASSEMBLY.contains(".set boot_ap_size, boot_ap_end - boot_ap\n"));
        let end = ASSEMBLY.find("\nboot_ap_end:").unwrap();
        let size = ASSEMBLY.find(".set boot_ap_size").unwrap();
        let entry = ASSEMBLY.find("\nboot_ap_entry:").unwrap();
        assert!(entry < end && end < size);
    }
}
