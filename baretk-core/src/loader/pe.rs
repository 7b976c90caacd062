//! PE Reader
//!
//! Parses PE32 and PE32+ images. PE is always little-endian.
//!
//! Addresses are absolute: every section is placed at `ImageBase + VirtualAddress`
//! and the entry point at `ImageBase + AddressOfEntryPoint`, so that branch
//! targets decoded from the code line up with the segment map.

use crate::error::{BaretkError, Result};
use crate::loader::{
    checked_segment, ByteSource, ContainerKind, Endianness, Machine, Permissions, Program, Section,
    Segment,
};
use goblin::pe::header::{
    COFF_MACHINE_ARM, COFF_MACHINE_ARM64, COFF_MACHINE_ARMNT, COFF_MACHINE_RISCV32,
    COFF_MACHINE_RISCV64, COFF_MACHINE_X86, COFF_MACHINE_X86_64, DOS_MAGIC, PE_MAGIC,
};
use goblin::pe::optional_header::{MAGIC_32, MAGIC_64};
use goblin::pe::section_table::{IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE};
use std::collections::BTreeMap;

/// Offset of `e_lfanew` in the DOS header.
const PE_POINTER_OFFSET: u64 = 0x3c;
const COFF_HEADER_SIZE: u64 = 20;
const SECTION_HEADER_SIZE: u64 = 40;

pub(crate) fn is_pe(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && u16::from_le_bytes([bytes[0], bytes[1]]) == DOS_MAGIC
}

fn machine_from(machine: u16) -> Machine {
    match machine {
        COFF_MACHINE_X86 => Machine::X86,
        COFF_MACHINE_X86_64 => Machine::Amd64,
        COFF_MACHINE_ARM | COFF_MACHINE_ARMNT => Machine::Arm,
        COFF_MACHINE_ARM64 => Machine::Aarch64,
        COFF_MACHINE_RISCV32 => Machine::RiscV32,
        COFF_MACHINE_RISCV64 => Machine::RiscV64,
        _ => Machine::Unknown,
    }
}

fn permissions_from(characteristics: u32) -> Permissions {
    let mut perm: Permissions = Permissions::empty();
    if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
        perm |= Permissions::EXEC;
    }
    if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
        perm |= Permissions::WRITE;
    }
    if characteristics & IMAGE_SCN_MEM_READ != 0 {
        perm |= Permissions::READ;
    }
    perm
}

/// Section names are 8 bytes, NUL-padded.
fn section_name(raw: &[u8]) -> String {
    let end: usize = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Parse a PE container.
///
/// # Errors
/// - `UnsupportedFormat` when the `PE\0\0` signature or optional header magic is wrong
/// - `Truncated` when the COFF header, optional header or section table does not fit
/// - `Malformed` when a section's raw data lies outside the file
#[inline(never)] // Large function - don't inline
pub fn parse(bytes: &[u8]) -> Result<Program> {
    let src = ByteSource::new(bytes, Endianness::Little);

    let pe_offset: u64 = u64::from(src.read_u32(PE_POINTER_OFFSET)?);
    let signature: u32 = src.read_u32(pe_offset)?;
    if signature != PE_MAGIC {
        return Err(BaretkError::UnsupportedFormat {
            magic: bytes.iter().take(2).copied().collect(),
        });
    }

    let coff: u64 = pe_offset + 4;
    src.slice(coff, COFF_HEADER_SIZE)?;
    let machine: u16 = src.read_u16(coff)?;
    let num_sections: u16 = src.read_u16(coff + 2)?;
    let optional_size: u16 = src.read_u16(coff + 16)?;

    let opt: u64 = coff + COFF_HEADER_SIZE;
    src.slice(opt, u64::from(optional_size))?;

    let (bits, entry_rva, image_base): (u8, u64, u64) = if optional_size == 0 {
        (32, 0, 0)
    } else {
        match src.read_u16(opt)? {
            MAGIC_32 => (
                32,
                u64::from(src.read_u32(opt + 16)?),
                u64::from(src.read_u32(opt + 28)?),
            ),
            MAGIC_64 => (
                64,
                u64::from(src.read_u32(opt + 16)?),
                src.read_u64(opt + 24)?,
            ),
            other => {
                log::warn!("unknown optional header magic 0x{:x}", other);
                return Err(BaretkError::UnsupportedFormat {
                    magic: other.to_le_bytes().to_vec(),
                });
            }
        }
    };

    let table: u64 = opt + u64::from(optional_size);
    src.slice(table, u64::from(num_sections) * SECTION_HEADER_SIZE)?;

    let mut segments: Vec<Segment> = Vec::with_capacity(num_sections as usize);
    let mut sections: BTreeMap<String, Section> = BTreeMap::new();
    for i in 0..u64::from(num_sections) {
        let base: u64 = table + i * SECTION_HEADER_SIZE;
        let name: String = section_name(src.slice(base, 8)?);
        let rva: u64 = u64::from(src.read_u32(base + 12)?);
        let raw_size: u64 = u64::from(src.read_u32(base + 16)?);
        let raw_ptr: u64 = u64::from(src.read_u32(base + 20)?);
        let characteristics: u32 = src.read_u32(base + 36)?;
        let vaddr: u64 = image_base.wrapping_add(rva);

        let data: &[u8] = if raw_size == 0 {
            &[]
        } else {
            src.slice(raw_ptr, raw_size).map_err(|_| {
                BaretkError::malformed(format!(
                    "section '{}' raw data at 0x{:x} (+0x{:x}) extends past end of file",
                    name, raw_ptr, raw_size
                ))
            })?
        };

        if raw_size > 0 {
            segments.push(checked_segment(
                &src,
                permissions_from(characteristics),
                raw_ptr,
                vaddr,
                vaddr,
                raw_size,
            )?);
        }
        if sections.contains_key(&name) {
            log::debug!("duplicate section name '{}' ignored", name);
            continue;
        }
        sections.insert(
            name.clone(),
            Section {
                name,
                addr: vaddr,
                data: data.to_vec(),
            },
        );
    }

    let machine: Machine = machine_from(machine);
    log::info!(
        "loaded PE{} {}: {} sections, image base 0x{:x}",
        if bits == 64 { "32+" } else { "32" },
        machine,
        sections.len(),
        image_base
    );

    Ok(Program {
        container: ContainerKind::Pe,
        endianness: Endianness::Little,
        machine,
        bits,
        entry: image_base.wrapping_add(entry_rva),
        segments,
        sections,
        symbols: Vec::new(),
        image: bytes.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PE_OFF: usize = 0x40;

    /// PE32+ image with one `.text` section holding `code`.
    fn pe64_with_code(code: &[u8]) -> Vec<u8> {
        let opt_size: usize = 0xf0;
        let table = PE_OFF + 24 + opt_size;
        let raw_ptr = table + 40;
        let mut data = vec![0u8; raw_ptr];
        data[0..2].copy_from_slice(b"MZ");
        data[0x3c..0x40].copy_from_slice(&(PE_OFF as u32).to_le_bytes());
        data[PE_OFF..PE_OFF + 4].copy_from_slice(b"PE\0\0");
        let coff = PE_OFF + 4;
        data[coff..coff + 2].copy_from_slice(&COFF_MACHINE_X86_64.to_le_bytes());
        data[coff + 2..coff + 4].copy_from_slice(&1u16.to_le_bytes());
        data[coff + 16..coff + 18].copy_from_slice(&(opt_size as u16).to_le_bytes());
        let opt = coff + 20;
        data[opt..opt + 2].copy_from_slice(&MAGIC_64.to_le_bytes());
        data[opt + 16..opt + 20].copy_from_slice(&0x1000u32.to_le_bytes());
        data[opt + 24..opt + 32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());

        data[table..table + 5].copy_from_slice(b".text");
        data[table + 8..table + 12].copy_from_slice(&(code.len() as u32).to_le_bytes());
        data[table + 12..table + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        data[table + 16..table + 20].copy_from_slice(&(code.len() as u32).to_le_bytes());
        data[table + 20..table + 24].copy_from_slice(&(raw_ptr as u32).to_le_bytes());
        data[table + 36..table + 40]
            .copy_from_slice(&(IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ).to_le_bytes());
        data.extend_from_slice(code);
        data
    }

    #[test]
    fn parses_text_section() {
        let program = parse(&pe64_with_code(&[0x90, 0xc3])).unwrap();
        assert_eq!(program.machine(), Machine::Amd64);
        assert_eq!(program.bits(), 64);
        assert_eq!(program.entry_point(), 0x1_4000_1000);
        let text = program.section(".text").unwrap();
        assert_eq!(text.addr, 0x1_4000_1000);
        assert_eq!(text.data, vec![0x90, 0xc3]);
        let seg = program.segments()[0];
        assert!(seg.is_executable());
        assert_eq!(seg.perm, Permissions::EXEC | Permissions::READ);
    }

    #[test]
    fn missing_signature_is_unsupported() {
        let mut data = pe64_with_code(&[0xc3]);
        data[PE_OFF] = b'X';
        assert!(matches!(
            parse(&data),
            Err(BaretkError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn section_table_past_eof_is_truncated() {
        let mut data = pe64_with_code(&[0xc3]);
        data[PE_OFF + 6..PE_OFF + 8].copy_from_slice(&200u16.to_le_bytes());
        assert!(matches!(parse(&data), Err(BaretkError::Truncated { .. })));
    }

    #[test]
    fn raw_data_past_eof_is_malformed() {
        let mut data = pe64_with_code(&[0xc3]);
        let table = PE_OFF + 24 + 0xf0;
        data[table + 16..table + 20].copy_from_slice(&0x4000u32.to_le_bytes());
        assert!(matches!(parse(&data), Err(BaretkError::Malformed { .. })));
    }
}
