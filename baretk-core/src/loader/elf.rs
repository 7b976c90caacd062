//! ELF Reader
//!
//! Parses ELF32/ELF64 containers in either byte order.
//!
//! # Algorithm
//! 1. Read `EI_CLASS`/`EI_DATA` from the identification bytes and fix the word size and endianness
//! 2. Read the file header and check that the program and section header tables fit in the file
//! 3. Walk `PT_LOAD` program headers into segments (allocatable sections for
//!    relocatable objects)
//! 4. Walk section headers, naming them through the `e_shstrndx` string table
//! 5. Collect function and object symbols from `SHT_SYMTAB`
//!
//! Field constants come from `goblin`; the table walk itself is done over a
//! [`ByteSource`] so that every size inconsistency maps onto the loader's
//! `Truncated`/`Malformed` taxonomy.

use crate::error::{BaretkError, Result};
use crate::loader::{
    checked_segment, ByteSource, ContainerKind, Endianness, Machine, Permissions, Program, Section,
    Segment, Symbol, SymbolKind,
};
use goblin::elf::header::{
    EI_CLASS, EI_DATA, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB, ELFMAG, EM_386,
    EM_AARCH64, EM_ARM, EM_RISCV, EM_X86_64,
};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_SYMTAB};
use goblin::elf::sym::{STT_FUNC, STT_OBJECT};
use std::collections::BTreeMap;

/// Parsed file header fields, widened to 64 bits.
#[derive(Debug, Clone, Copy)]
struct FileHeader {
    is_64: bool,
    machine: u16,
    entry: u64,
    phoff: u64,
    shoff: u64,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    name: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    entsize: u64,
}

pub(crate) fn is_elf(bytes: &[u8]) -> bool {
    bytes.len() >= ELFMAG.len() && bytes[..ELFMAG.len()] == ELFMAG[..]
}

fn machine_from(e_machine: u16, is_64: bool) -> Machine {
    match e_machine {
        EM_386 => Machine::X86,
        EM_X86_64 => Machine::Amd64,
        EM_ARM => Machine::Arm,
        EM_AARCH64 => Machine::Aarch64,
        EM_RISCV if is_64 => Machine::RiscV64,
        EM_RISCV => Machine::RiscV32,
        _ => Machine::Unknown,
    }
}

fn read_file_header(src: &ByteSource<'_>, is_64: bool) -> Result<FileHeader> {
    // The whole header must be present before any field is trusted.
    let header_size: u64 = if is_64 { 64 } else { 52 };
    src.slice(0, header_size)?;

    let (entry, phoff, shoff, tail): (u64, u64, u64, u64) = if is_64 {
        (src.read_u64(24)?, src.read_u64(32)?, src.read_u64(40)?, 52)
    } else {
        (
            u64::from(src.read_u32(24)?),
            u64::from(src.read_u32(28)?),
            u64::from(src.read_u32(32)?),
            40,
        )
    };

    Ok(FileHeader {
        is_64,
        machine: src.read_u16(18)?,
        entry,
        phoff,
        shoff,
        phentsize: src.read_u16(tail + 2)?,
        phnum: src.read_u16(tail + 4)?,
        shentsize: src.read_u16(tail + 6)?,
        shnum: src.read_u16(tail + 8)?,
        shstrndx: src.read_u16(tail + 10)?,
    })
}

/// Check that a header table of `count` entries of `entsize` bytes fits in the file.
fn check_table(
    src: &ByteSource<'_>,
    what: &str,
    offset: u64,
    count: u16,
    entsize: u16,
    min_entsize: u16,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    if entsize < min_entsize {
        return Err(BaretkError::malformed(format!(
            "{} entry size {} is smaller than {}",
            what, entsize, min_entsize
        )));
    }
    let total: u64 = u64::from(count) * u64::from(entsize);
    src.slice(offset, total).map(|_| ())
}

fn read_segments(src: &ByteSource<'_>, hdr: &FileHeader) -> Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::with_capacity(hdr.phnum as usize);
    for i in 0..u64::from(hdr.phnum) {
        let base: u64 = hdr.phoff + i * u64::from(hdr.phentsize);
        let p_type: u32 = src.read_u32(base)?;
        if p_type != PT_LOAD {
            continue;
        }
        let (flags, offset, vaddr, paddr, filesz): (u32, u64, u64, u64, u64) = if hdr.is_64 {
            (
                src.read_u32(base + 4)?,
                src.read_u64(base + 8)?,
                src.read_u64(base + 16)?,
                src.read_u64(base + 24)?,
                src.read_u64(base + 32)?,
            )
        } else {
            (
                src.read_u32(base + 24)?,
                u64::from(src.read_u32(base + 4)?),
                u64::from(src.read_u32(base + 8)?),
                u64::from(src.read_u32(base + 12)?),
                u64::from(src.read_u32(base + 16)?),
            )
        };
        if filesz == 0 {
            log::debug!("skipping zero-sized PT_LOAD at vaddr 0x{:x}", vaddr);
            continue;
        }

        let mut perm: Permissions = Permissions::empty();
        if flags & PF_X != 0 {
            perm |= Permissions::EXEC;
        }
        if flags & PF_W != 0 {
            perm |= Permissions::WRITE;
        }
        if flags & PF_R != 0 {
            perm |= Permissions::READ;
        }
        segments.push(checked_segment(src, perm, offset, vaddr, paddr, filesz)?);
    }
    Ok(segments)
}

fn read_section_headers(src: &ByteSource<'_>, hdr: &FileHeader) -> Result<Vec<SectionHeader>> {
    let mut headers: Vec<SectionHeader> = Vec::with_capacity(hdr.shnum as usize);
    for i in 0..u64::from(hdr.shnum) {
        let base: u64 = hdr.shoff + i * u64::from(hdr.shentsize);
        let sh: SectionHeader = if hdr.is_64 {
            SectionHeader {
                name: src.read_u32(base)?,
                kind: src.read_u32(base + 4)?,
                flags: src.read_u64(base + 8)?,
                addr: src.read_u64(base + 16)?,
                offset: src.read_u64(base + 24)?,
                size: src.read_u64(base + 32)?,
                link: src.read_u32(base + 40)?,
                entsize: src.read_u64(base + 56)?,
            }
        } else {
            SectionHeader {
                name: src.read_u32(base)?,
                kind: src.read_u32(base + 4)?,
                flags: u64::from(src.read_u32(base + 8)?),
                addr: u64::from(src.read_u32(base + 12)?),
                offset: u64::from(src.read_u32(base + 16)?),
                size: u64::from(src.read_u32(base + 20)?),
                link: src.read_u32(base + 24)?,
                entsize: u64::from(src.read_u32(base + 36)?),
            }
        };
        headers.push(sh);
    }
    Ok(headers)
}

/// File contents of a section; `SHT_NOBITS` sections occupy no file bytes.
fn section_bytes<'a>(src: &ByteSource<'a>, sh: &SectionHeader) -> Result<&'a [u8]> {
    if sh.kind == SHT_NOBITS || sh.size == 0 {
        return Ok(&[]);
    }
    src.slice(sh.offset, sh.size).map_err(|_| {
        BaretkError::malformed(format!(
            "section at offset 0x{:x} with size 0x{:x} extends past end of file",
            sh.offset, sh.size
        ))
    })
}

fn section_name<'a>(strtab: &ByteSource<'a>, offset: u32) -> Result<&'a str> {
    if u64::from(offset) >= strtab.len() as u64 {
        return Err(BaretkError::malformed(format!(
            "section name offset 0x{:x} outside string table",
            offset
        )));
    }
    strtab.read_cstr(u64::from(offset))
}

fn read_symbols(
    src: &ByteSource<'_>,
    hdr: &FileHeader,
    headers: &[SectionHeader],
) -> Result<Vec<Symbol>> {
    let mut symbols: Vec<Symbol> = Vec::new();
    let entsize: u64 = if hdr.is_64 { 24 } else { 16 };

    for symtab in headers.iter().filter(|h| h.kind == SHT_SYMTAB) {
        let Some(strtab_hdr) = headers.get(symtab.link as usize) else {
            log::warn!("symbol table links to missing string table {}", symtab.link);
            continue;
        };
        let table: &[u8] = section_bytes(src, symtab)?;
        let strtab = ByteSource::new(section_bytes(src, strtab_hdr)?, src.endianness());
        let table = ByteSource::new(table, src.endianness());
        let stride: u64 = symtab.entsize.max(entsize);

        let count: u64 = table.len() as u64 / stride;
        for i in 1..count {
            let base: u64 = i * stride;
            let (name, info, value, size): (u32, u8, u64, u64) = if hdr.is_64 {
                (
                    table.read_u32(base)?,
                    table.read_u8(base + 4)?,
                    table.read_u64(base + 8)?,
                    table.read_u64(base + 16)?,
                )
            } else {
                (
                    table.read_u32(base)?,
                    table.read_u8(base + 12)?,
                    u64::from(table.read_u32(base + 4)?),
                    u64::from(table.read_u32(base + 8)?),
                )
            };
            let kind: SymbolKind = match info & 0xf {
                t if t == STT_FUNC => SymbolKind::Function,
                t if t == STT_OBJECT => SymbolKind::Object,
                _ => continue,
            };
            if name == 0 || u64::from(name) >= strtab.len() as u64 {
                continue;
            }
            let name: &str = match strtab.read_cstr(u64::from(name)) {
                Ok(n) if !n.is_empty() => n,
                _ => continue,
            };
            symbols.push(Symbol {
                name: name.to_string(),
                addr: value,
                size,
                kind,
            });
        }
    }

    symbols.sort_by(|a, b| a.addr.cmp(&b.addr).then_with(|| a.name.cmp(&b.name)));
    Ok(symbols)
}

/// Relocatable objects carry no program headers; map their allocatable sections instead.
fn segments_from_sections(src: &ByteSource<'_>, headers: &[SectionHeader]) -> Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::new();
    for sh in headers {
        if sh.flags & u64::from(SHF_ALLOC) == 0 || sh.kind == SHT_NOBITS || sh.size == 0 {
            continue;
        }
        let mut perm: Permissions = Permissions::READ;
        if sh.flags & u64::from(SHF_WRITE) != 0 {
            perm |= Permissions::WRITE;
        }
        if sh.flags & u64::from(SHF_EXECINSTR) != 0 {
            perm |= Permissions::EXEC;
        }
        segments.push(checked_segment(
            src, perm, sh.offset, sh.addr, sh.addr, sh.size,
        )?);
    }
    Ok(segments)
}

/// Parse an ELF container.
///
/// # Errors
/// - `UnsupportedFormat` for an unknown class or data encoding
/// - `Truncated` when the header or a header table does not fit in `bytes`
/// - `Malformed` for out-of-file segments/sections or a bad `e_shstrndx`
#[inline(never)] // Large function - don't inline
pub fn parse(bytes: &[u8]) -> Result<Program> {
    let ident = ByteSource::new(bytes, Endianness::Little);
    let class: u8 = ident.read_u8(EI_CLASS as u64)?;
    let data: u8 = ident.read_u8(EI_DATA as u64)?;

    let is_64: bool = match class {
        ELFCLASS64 => true,
        ELFCLASS32 => false,
        _ => {
            return Err(BaretkError::UnsupportedFormat {
                magic: bytes.iter().take(6).copied().collect(),
            })
        }
    };
    let endianness: Endianness = match data {
        ELFDATA2LSB => Endianness::Little,
        ELFDATA2MSB => Endianness::Big,
        _ => {
            return Err(BaretkError::UnsupportedFormat {
                magic: bytes.iter().take(6).copied().collect(),
            })
        }
    };

    let src: ByteSource<'_> = ident.with_endianness(endianness);
    let hdr: FileHeader = read_file_header(&src, is_64)?;
    let (ph_size, sh_size): (u16, u16) = if is_64 { (56, 64) } else { (32, 40) };
    check_table(&src, "program header", hdr.phoff, hdr.phnum, hdr.phentsize, ph_size)?;
    check_table(&src, "section header", hdr.shoff, hdr.shnum, hdr.shentsize, sh_size)?;

    let headers: Vec<SectionHeader> = read_section_headers(&src, &hdr)?;

    let mut sections: BTreeMap<String, Section> = BTreeMap::new();
    if !headers.is_empty() {
        let strtab_hdr: &SectionHeader = headers.get(hdr.shstrndx as usize).ok_or_else(|| {
            BaretkError::malformed(format!(
                "e_shstrndx {} out of range ({} sections)",
                hdr.shstrndx, hdr.shnum
            ))
        })?;
        let strtab = ByteSource::new(section_bytes(&src, strtab_hdr)?, endianness);

        for sh in headers.iter().skip(1) {
            let name: &str = section_name(&strtab, sh.name)?;
            if name.is_empty() {
                continue;
            }
            if sections.contains_key(name) {
                log::debug!("duplicate section name '{}' ignored", name);
                continue;
            }
            sections.insert(
                name.to_string(),
                Section {
                    name: name.to_string(),
                    addr: sh.addr,
                    data: section_bytes(&src, sh)?.to_vec(),
                },
            );
        }
    }

    let mut segments: Vec<Segment> = read_segments(&src, &hdr)?;
    if hdr.phnum == 0 {
        segments = segments_from_sections(&src, &headers)?;
    }
    let symbols: Vec<Symbol> = read_symbols(&src, &hdr, &headers)?;

    let machine: Machine = machine_from(hdr.machine, is_64);
    log::info!(
        "loaded ELF{} {} {}: {} segments, {} sections, {} symbols",
        if is_64 { 64 } else { 32 },
        endianness.name(),
        machine,
        segments.len(),
        sections.len(),
        symbols.len()
    );

    Ok(Program {
        container: ContainerKind::Elf,
        endianness,
        machine,
        bits: if is_64 { 64 } else { 32 },
        entry: hdr.entry,
        segments,
        sections,
        symbols,
        image: bytes.to_vec(),
    })
}
