//! Text renderings of the controller state, exposed as read-only devfs
//! nodes under `/device/apic/`.

extern crate alloc;
extern crate log;
extern crate spin;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use core::fmt::Write;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::apic::lapic::{LocalApicRegisters, LocalInterrupt};
use crate::apic::Apic;
use crate::platform::Platform;
use crate::system::filesystem::devfs::{self, DevOps};
use crate::system::filesystem::FSError;

pub const DIAGNOSTICS_ROOT: &str = "/device/apic";
pub const APIC_DEVICE_MAJOR: u32 = 10;

static NEXT_MINOR: AtomicU32 = AtomicU32::new(0);

#[inline]
fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Lapic,
    Ioapic,
    Lvt,
    Redtbl,
    Pic,
    Irqs,
}

impl Report {
    pub const ALL: [Report; 6] = [
        Report::Lapic,
        Report::Ioapic,
        Report::Lvt,
        Report::Redtbl,
        Report::Pic,
        Report::Irqs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Report::Lapic => "lapic",
            Report::Ioapic => "ioapic",
            Report::Lvt => "lvt",
            Report::Redtbl => "redtbl",
            Report::Pic => "pic",
            Report::Irqs => "irqs",
        }
    }
}

impl<P: Platform> Apic<P> {
    pub fn render(&self, report: Report) -> String {
        match report {
            Report::Lapic => self.lapic_report(),
            Report::Ioapic => self.ioapic_report(),
            Report::Lvt => self.lvt_report(),
            Report::Redtbl => self.redtbl_report(),
            Report::Pic => self.pic_report(),
            Report::Irqs => self.irqs_report(),
        }
    }

    /// One row per known CPU.
    pub fn lapic_report(&self) -> String {
        let backend = match self.backend() {
            Some(backend) => backend,
            None => return String::from("APIC disabled\n"),
        };

        let running = self.running_aps();
        let mut out = String::from("cpu,acpi_id,running,initialized,nmi_pin,nmi_polarity,nmi_trigger\n");
        for lapic in backend.lapics.iter().flatten() {
            let is_running =
                lapic.cpu_id == backend.bsp_id || running & (1u64 << lapic.cpu_id) != 0;
            let _ = writeln!(
                out,
                "{},{},{},{},{},{:?},{:?}",
                lapic.cpu_id,
                lapic.processor_id,
                yes_no(is_running),
                yes_no(lapic.is_initialized()),
                lapic.nmi_lint,
                lapic.nmi_polarity,
                lapic.nmi_trigger
            );
        }
        out
    }

    pub fn ioapic_report(&self) -> String {
        let backend = match self.backend() {
            Some(backend) => backend,
            None => return String::from("APIC disabled\n"),
        };

        let ioapic = &backend.ioapic;
        let mut out = String::new();
        let _ = writeln!(out, "id: {}", ioapic.id);
        let _ = writeln!(out, "version: 0x{:x}", ioapic.version);
        let _ = writeln!(out, "directed_eoi: {}", yes_no(ioapic.direct_eoi));
        let _ = writeln!(out, "gsi_base: {}", ioapic.gsi_base);
        let _ = writeln!(out, "gsi_max: {}", ioapic.gsi_max);
        let _ = writeln!(
            out,
            "mmio: 0x{:x} -> 0x{:x}",
            ioapic.phys_base, ioapic.virt_base
        );

        for iso in backend.overrides.iter() {
            let (irq, gsi, flags) = (iso.irq, iso.gsi, iso.inti_flags());
            let _ = writeln!(
                out,
                "override: irq {} -> gsi {}, polarity {:?}, trigger {:?}",
                irq,
                gsi,
                flags.polarity(),
                flags.trigger_mode()
            );
        }
        for nmi in ioapic.nmi_sources.iter() {
            let gsi = nmi.gsi;
            let _ = writeln!(out, "nmi: gsi {}", gsi);
        }
        out
    }

    /// LVT of the BSP. The register window only shows the APIC of the
    /// executing CPU, so other CPUs get the rendering the BSP last made.
    pub fn lvt_report(&self) -> String {
        let backend = match self.backend() {
            Some(backend) => backend,
            None => return String::from("APIC disabled\n"),
        };

        let regs = LocalApicRegisters::new(self.platform(), backend.mode);
        let mut snapshot = backend.bsp_lvt.lock();
        if regs.id().ok() == Some(backend.bsp_id) {
            *snapshot = render_lvt(&regs, backend.bsp_id);
        }
        snapshot.clone()
    }

    pub fn redtbl_report(&self) -> String {
        let backend = match self.backend() {
            Some(backend) => backend,
            None => return String::from("APIC disabled\n"),
        };

        let ioapic = &backend.ioapic;
        let mut out = String::from("gsi,vector,masked,trigger,polarity,destination\n");
        for gsi in ioapic.gsi_base..=ioapic.gsi_max {
            match ioapic.read_redtbl(self.platform(), gsi) {
                Ok(entry) => {
                    let _ = writeln!(
                        out,
                        "{},0x{:02x},{},{:?},{:?},{}",
                        gsi,
                        entry.vector,
                        yes_no(entry.masked),
                        entry.trigger_mode,
                        entry.pin_polarity,
                        entry.destination
                    );
                }
                Err(err) => {
                    let _ = writeln!(out, "{},unavailable: {}", gsi, err);
                }
            }
        }
        out
    }

    pub fn pic_report(&self) -> String {
        let (master, slave) = self.pic().masks(self.platform());
        let registers = self.pic().read_registers(self.platform());
        format!(
            "master_mask={:08b}\nslave_mask={:08b}\n{}\n",
            master, slave, registers
        )
    }

    /// Per-CPU interrupt counts as CSV.
    pub fn irqs_report(&self) -> String {
        self.counters().report(&self.cpu_ids())
    }
}

fn render_lvt<P: Platform>(regs: &LocalApicRegisters<P>, cpu_id: u8) -> String {
    let version = match regs.version() {
        Ok(version) => version,
        Err(err) => return format!("unavailable: {}\n", err),
    };

    let mut out = String::new();
    let _ = writeln!(out, "cpu: {}", cpu_id);
    let _ = writeln!(
        out,
        "version: 0x{:x}, max_lvt: {}",
        version.version, version.max_lvt_entry
    );
    if let Ok(svr) = regs.read_svr() {
        let _ = writeln!(
            out,
            "svr: vector=0x{:02x} enabled={} eoi_suppression={}",
            svr.vector,
            yes_no(svr.software_enable),
            yes_no(svr.eoi_broadcast_suppression)
        );
    }

    for source in LocalInterrupt::ALL.iter().copied() {
        if !source.is_present(&version) {
            continue;
        }
        match regs.read_lvt(source) {
            Ok(entry) => {
                let _ = writeln!(
                    out,
                    "{:<12} vector=0x{:02x} masked={} mode={:?} trigger={:?} polarity={:?}",
                    source,
                    entry.vector,
                    yes_no(entry.masked),
                    entry.delivery_mode,
                    entry.trigger_mode,
                    entry.pin_polarity
                );
            }
            Err(err) => {
                let _ = writeln!(out, "{:<12} unavailable: {}", source, err);
            }
        }
    }
    out
}

/// A devfs node whose content is rebuilt on every length query.
pub struct ApicDiagnosticFile<P: Platform> {
    apic: &'static Apic<P>,
    report: Report,
    content: Mutex<String>,
}

impl<P: Platform> ApicDiagnosticFile<P> {
    pub fn new(apic: &'static Apic<P>, report: Report) -> Self {
        ApicDiagnosticFile {
            apic,
            report,
            content: Mutex::new(String::new()),
        }
    }

    pub fn report(&self) -> Report {
        self.report
    }
}

impl<P: Platform> DevOps for ApicDiagnosticFile<P> {
    fn length(&self) -> usize {
        let fresh = self.apic.render(self.report);
        let length = fresh.len();
        *self.content.lock() = fresh;
        length
    }

    fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, FSError> {
        let mut content = self.content.lock();
        if content.is_empty() {
            *content = self.apic.render(self.report);
        }

        let source = match content.as_bytes().get(offset..) {
            Some(source) => source,
            None => return Ok(0),
        };
        let count = source.len().min(buffer.len());
        buffer[..count].copy_from_slice(&source[..count]);
        Ok(count)
    }
}

pub fn register_diagnostics<P: Platform>(apic: &'static Apic<P>) -> Result<(), FSError> {
    register_diagnostics_at(apic, DIAGNOSTICS_ROOT)
}

/// Registers one node per [`Report`] below `prefix`.
pub fn register_diagnostics_at<P: Platform>(
    apic: &'static Apic<P>,
    prefix: &str,
) -> Result<(), FSError> {
    for report in Report::ALL.iter().copied() {
        let path = format!("{}/{}", prefix, report.name());
        let minor = NEXT_MINOR.fetch_add(1, Ordering::Relaxed);
        devfs::register_device(
            &path,
            APIC_DEVICE_MAJOR,
            minor,
            Box::new(ApicDiagnosticFile::new(apic, report)),
        )?;
    }

    log::info!("APIC diagnostics mounted at {}", prefix);
    Ok(())
}
