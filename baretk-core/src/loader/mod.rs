//! Program Loader
//!
//! Parses an executable container (ELF or PE) into a [`Program`]: endianness,
//! machine type, segments, named sections, symbols and the entry point.
//!
//! # Detection
//! The container format is selected from the magic signature at offset 0:
//! - `7F 45 4C 46` selects the ELF reader ([`elf`])
//! - `MZ` followed by a `PE\0\0` signature selects the PE reader ([`pe`])
//!
//! Anything else is [`BaretkError::UnsupportedFormat`].
//!
//! # Ownership
//! A `Program` owns a private copy of the file bytes. Segment contents are
//! served from that copy, section contents are copied out at load time, and
//! `Clone` is a full deep copy with no shared backing storage.

pub mod bytes;
pub mod dump;
pub mod elf;
pub mod pe;

use crate::error::{BaretkError, Result};
use bitflags::bitflags;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

pub use bytes::ByteSource;

/// Byte order of multi-byte fields, with the values of the C ABI enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Endianness {
    Little = 0x1,
    Big = 0x2,
}

impl Endianness {
    pub fn name(self) -> &'static str {
        match self {
            Endianness::Little => "little-endian",
            Endianness::Big => "big-endian",
        }
    }
}

bitflags! {
    /// Segment access rights, with the values of the C ABI `BARETK_Perm` flags.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

impl Permissions {
    /// `rwx`-style rendering, `-` for absent rights.
    pub fn to_rwx(self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.contains(Permissions::READ) { 'r' } else { '-' });
        s.push(if self.contains(Permissions::WRITE) { 'w' } else { '-' });
        s.push(if self.contains(Permissions::EXEC) { 'x' } else { '-' });
        s
    }
}

/// Machine type of a loaded program. Selects the instruction decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Machine {
    X86,
    Amd64,
    Arm,
    Aarch64,
    RiscV32,
    RiscV64,
    Unknown,
}

impl Machine {
    /// Stable identifier, also returned through the C ABI.
    pub fn name(self) -> &'static str {
        match self {
            Machine::X86 => "x86",
            Machine::Amd64 => "amd64",
            Machine::Arm => "arm",
            Machine::Aarch64 => "aarch64",
            Machine::RiscV32 => "riscv32",
            Machine::RiscV64 => "riscv64",
            Machine::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Container format a program was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerKind {
    Elf,
    Pe,
}

/// Contiguous mapped region of the binary.
///
/// # Memory Layout
/// `#[repr(C)]` with the field order of `BARETK_Segment`, so a `&[Segment]`
/// can be handed across the C ABI without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)] // Ensure C-compatible layout
pub struct Segment {
    /// Access rights (`BARETK_Perm` bits)
    pub perm: Permissions,
    /// Offset of the segment contents in the file
    pub offset: u64,
    /// Virtual address the segment is mapped at
    pub vaddr: u64,
    /// Physical address (equal to `vaddr` for PE)
    pub paddr: u64,
    /// Size of the file-backed contents, always > 0
    pub size: usize,
}

impl Segment {
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.perm.contains(Permissions::EXEC)
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr - self.vaddr < self.size as u64
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.vaddr.saturating_add(self.size as u64)
    }
}

/// Named, addressed byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolKind {
    Function,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub addr: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

/// Loaded executable: layout model plus a private copy of the file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub(crate) container: ContainerKind,
    pub(crate) endianness: Endianness,
    pub(crate) machine: Machine,
    pub(crate) bits: u8,
    pub(crate) entry: u64,
    pub(crate) segments: Vec<Segment>,
    pub(crate) sections: BTreeMap<String, Section>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) image: Vec<u8>,
}

impl Program {
    #[inline]
    pub fn container(&self) -> ContainerKind {
        self.container
    }

    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    #[inline]
    pub fn machine(&self) -> Machine {
        self.machine
    }

    /// Word size in bits (32 or 64).
    #[inline]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[inline]
    pub fn entry_point(&self) -> u64 {
        self.entry
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// Contents of the named section; empty for an unknown name.
    pub fn section_data(&self, name: &str) -> &[u8] {
        self.sections
            .get(name)
            .map(|s| s.data.as_slice())
            .unwrap_or(&[])
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn executable_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_executable())
    }

    /// File-backed contents of a segment.
    pub fn segment_data(&self, segment: &Segment) -> &[u8] {
        let start: usize = segment.offset as usize;
        self.image
            .get(start..start.saturating_add(segment.size))
            .unwrap_or(&[])
    }

    /// Executable segment mapping `addr`, if any.
    pub fn executable_segment_at(&self, addr: u64) -> Option<&Segment> {
        self.executable_segments().find(|s| s.contains(addr))
    }

    /// Name of the function symbol starting exactly at `addr`.
    pub fn function_name_at(&self, addr: u64) -> Option<&str> {
        self.symbols
            .iter()
            .find(|s| s.kind == SymbolKind::Function && s.addr == addr)
            .map(|s| s.name.as_str())
    }

    /// Raw bytes of the loaded file.
    pub fn image(&self) -> &[u8] {
        &self.image
    }
}

/// Parse a container from raw bytes.
///
/// # Errors
/// - `UnsupportedFormat` if no known signature matches
/// - `Truncated` if a declared table exceeds the available bytes
/// - `Malformed` if internal offsets are inconsistent
pub fn load(bytes: &[u8]) -> Result<Program> {
    if elf::is_elf(bytes) {
        log::debug!("detected ELF container ({} bytes)", bytes.len());
        return elf::parse(bytes);
    }
    if pe::is_pe(bytes) {
        log::debug!("detected PE container ({} bytes)", bytes.len());
        return pe::parse(bytes);
    }
    Err(BaretkError::UnsupportedFormat {
        magic: bytes.iter().take(4).copied().collect(),
    })
}

/// Read and parse a container from a file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Program> {
    let path: &Path = path.as_ref();
    let bytes: Vec<u8> =
        std::fs::read(path).map_err(|e| BaretkError::io(path.display().to_string(), e))?;
    load(&bytes)
}

/// Build a segment after checking that its file range lies inside the input.
pub(crate) fn checked_segment(
    src: &ByteSource<'_>,
    perm: Permissions,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    size: u64,
) -> Result<Segment> {
    let end: Option<u64> = offset.checked_add(size);
    match end {
        Some(end) if end <= src.len() as u64 => Ok(Segment {
            perm,
            offset,
            vaddr,
            paddr,
            size: size as usize,
        }),
        _ => Err(BaretkError::malformed(format!(
            "segment at offset 0x{:x} with size 0x{:x} extends past end of file (0x{:x})",
            offset,
            size,
            src.len()
        ))),
    }
}
