pub mod madt;
pub mod rsdt;

use crate::acpi::madt::{MADTError, MultiProcessorInfo, MADT};
use crate::acpi::rsdt::RSDPDescriptor;

/// Parses the MADT image found through `rsdp` and detaches the result
/// from firmware memory.
pub fn probe_processors(
    rsdp: &RSDPDescriptor,
    madt_bytes: &[u8],
) -> Result<MultiProcessorInfo, MADTError> {
    let madt = MADT::parse(rsdp, madt_bytes).map_err(|err| {
        log::error!("rejecting MADT: {}", err);
        err
    })?;

    Ok(madt.probe_cpu_cores())
}
