extern crate log;

use core::fmt;
use core::mem;
use core::ptr;
use core::str;

use crate::mm::PhysicalAddress;

const RSDP_SIG: &[u8; 8] = b"RSD PTR ";
const RSDT_SIG: &[u8; 4] = b"RSDT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiRootTableError {
    NotFound,
    InvalidSignature,
    InvalidChecksum,
    InvalidLength,
}

impl fmt::Display for AcpiRootTableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AcpiRootTableError::NotFound => write!(f, "table not found"),
            AcpiRootTableError::InvalidSignature => write!(f, "invalid table signature"),
            AcpiRootTableError::InvalidChecksum => write!(f, "invalid table checksum"),
            AcpiRootTableError::InvalidLength => write!(f, "invalid table length"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
/// The struct representing RSDP descriptor (ACPI 1.0 part)
pub struct RSDPDescriptor {
    signature: [u8; 8],
    checksum_byte: u8,
    oem: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct SDTHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_rev: u32,
    pub creator_id: u32,
    pub creator_rev: u32,
}

/// every ACPI structure sums to zero over its length.
#[inline]
pub fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte)) == 0
}

/// Reads a packed firmware structure from the start of `bytes`.
#[inline]
pub(crate) fn read_struct<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }

    Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

impl RSDPDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<RSDPDescriptor, AcpiRootTableError> {
        let rsdp: RSDPDescriptor = read_struct(bytes).ok_or(AcpiRootTableError::InvalidLength)?;

        // verify checksum and signature:
        if &rsdp.signature != RSDP_SIG {
            log::error!("Invalid rsdp signature, expected={:?}", str::from_utf8(RSDP_SIG));
            return Err(AcpiRootTableError::InvalidSignature);
        }

        // ACPI 1.0 RSDP is 20 bytes
        if !checksum_ok(&bytes[..mem::size_of::<RSDPDescriptor>()]) {
            log::error!("Invalid legacy rsdp checksum");
            return Err(AcpiRootTableError::InvalidChecksum);
        }

        Ok(rsdp)
    }

    #[inline]
    pub fn revision(&self) -> u8 {
        self.revision
    }

    #[inline]
    pub fn rsdt_address(&self) -> PhysicalAddress {
        PhysicalAddress::from_u64(self.rsdt_address as u64)
    }

    pub fn oem(&self) -> [u8; 6] {
        self.oem
    }
}

impl SDTHeader {
    pub fn parse(bytes: &[u8]) -> Result<SDTHeader, AcpiRootTableError> {
        read_struct(bytes).ok_or(AcpiRootTableError::InvalidLength)
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// checks signature, length and checksum of a whole table.
    pub fn validate(bytes: &[u8], signature: &[u8; 4]) -> Result<SDTHeader, AcpiRootTableError> {
        let header = Self::parse(bytes)?;
        if &header.signature != signature {
            return Err(AcpiRootTableError::InvalidSignature);
        }

        let length = header.length();
        if length < mem::size_of::<SDTHeader>() || length > bytes.len() {
            return Err(AcpiRootTableError::InvalidLength);
        }

        if !checksum_ok(&bytes[..length]) {
            return Err(AcpiRootTableError::InvalidChecksum);
        }

        Ok(header)
    }
}

/// Root system description table with 32-bit entry pointers.
pub struct RSDT<'a> {
    pub header: SDTHeader,
    entries: &'a [u8],
}

impl<'a> RSDT<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<RSDT<'a>, AcpiRootTableError> {
        let header = SDTHeader::validate(bytes, RSDT_SIG)?;
        let entries = &bytes[mem::size_of::<SDTHeader>()..header.length()];

        log::debug!("RSDT has {} tables", entries.len() / mem::size_of::<u32>());
        Ok(RSDT { header, entries })
    }

    pub fn table_addresses(&self) -> impl Iterator<Item = PhysicalAddress> + 'a {
        self.entries.chunks_exact(mem::size_of::<u32>()).map(|raw| {
            let addr = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            PhysicalAddress::from_u64(addr as u64)
        })
    }

    /// `resolve` maps a physical table address to its bytes.
    pub fn find_table<'t, F>(&self, signature: &[u8; 4], resolve: F) -> Option<&'t [u8]>
    where
        F: Fn(PhysicalAddress) -> Option<&'t [u8]>,
    {
        for addr in self.table_addresses() {
            if let Some(table) = resolve(addr) {
                if table.len() >= 4 && &table[..4] == signature {
                    return Some(table);
                }
            }
        }

        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn rsdp_round_trips_through_checksum() {
        let bytes = rsdp(0, 0x7fe_1000);
        let parsed = RSDPDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed.revision(), 0);
        assert_eq!(parsed.rsdt_address().as_u64(), 0x7fe_1000);
    }

    #[test]
    fn rsdp_rejects_bad_signature_and_checksum() {
        let mut bytes = rsdp(0, 0x1000);
        bytes[19] ^= 0xff;
        assert_eq!(
            RSDPDescriptor::parse(&bytes).unwrap_err(),
            AcpiRootTableError::InvalidChecksum
        );

        let mut bytes = rsdp(0, 0x1000);
        bytes[0] = b'X';
        assert_eq!(
            RSDPDescriptor::parse(&bytes).unwrap_err(),
            AcpiRootTableError::InvalidSignature
        );

        assert_eq!(
            RSDPDescriptor::parse(&[0u8; 10]).unwrap_err(),
            AcpiRootTableError::InvalidLength
        );
    }

    #[test]
    fn rsdt_finds_table_by_signature() {
        let mut facp = sdt_header(b"FACP", 36);
        fix_checksum(&mut facp, 9);
        let mut apic = sdt_header(b"APIC", 36);
        fix_checksum(&mut apic, 9);

        let mut rsdt = sdt_header(b"RSDT", 36 + 8);
        rsdt.extend_from_slice(&0x1000u32.to_le_bytes());
        rsdt.extend_from_slice(&0x2000u32.to_le_bytes());
        fix_checksum(&mut rsdt, 9);

        let parsed = RSDT::parse(&rsdt).unwrap();
        assert_eq!(parsed.table_addresses().count(), 2);

        let found = parsed.find_table(b"APIC", |addr| match addr.as_u64() {
            0x1000 => Some(&facp[..]),
            0x2000 => Some(&apic[..]),
            _ => None,
        });
        assert_eq!(found.map(|t| &t[..4]), Some(&b"APIC"[..]));
        assert!(parsed.find_table(b"HPET", |_| None).is_none());
    }

    #[test]
    fn sdt_length_past_buffer_is_rejected() {
        let mut table = sdt_header(b"RSDT", 64);
        fix_checksum(&mut table, 9);
        assert_eq!(
            SDTHeader::validate(&table, b"RSDT").unwrap_err(),
            AcpiRootTableError::InvalidLength
        );
    }
}
