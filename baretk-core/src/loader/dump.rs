//! Program summary, objdump style.

use crate::loader::{ContainerKind, Endianness, Machine, Program};
use serde::Serialize;
use std::fmt::Write;

/// Machine-readable program layout, serialized by `baretk dump --json`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramSummary {
    pub container: ContainerKind,
    pub machine: Machine,
    pub bits: u8,
    pub endianness: Endianness,
    pub entry_point: u64,
    pub segments: Vec<SegmentSummary>,
    pub sections: Vec<SectionSummary>,
    pub symbol_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentSummary {
    pub perm: String,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub name: String,
    pub addr: u64,
    pub size: usize,
}

impl ProgramSummary {
    pub fn of(program: &Program) -> Self {
        Self {
            container: program.container(),
            machine: program.machine(),
            bits: program.bits(),
            endianness: program.endianness(),
            entry_point: program.entry_point(),
            segments: program
                .segments()
                .iter()
                .map(|s| SegmentSummary {
                    perm: s.perm.to_rwx(),
                    offset: s.offset,
                    vaddr: s.vaddr,
                    paddr: s.paddr,
                    size: s.size,
                })
                .collect(),
            sections: program
                .sections()
                .map(|s| SectionSummary {
                    name: s.name.clone(),
                    addr: s.addr,
                    size: s.data.len(),
                })
                .collect(),
            symbol_count: program.symbols().len(),
        }
    }
}

/// Render the segment and section tables of a program.
pub fn dump_program(program: &Program) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(
        out,
        "{}-bit, {}, {} {:?} executable",
        program.bits(),
        program.endianness().name(),
        program.machine(),
        program.container()
    );
    let _ = writeln!(out, "Entry point: 0x{:x}", program.entry_point());

    let _ = writeln!(out, "Segments:");
    let _ = writeln!(
        out,
        "  {:<4} {:<10} {:<18} {:<18} {:<10}",
        "Perm", "Offset", "VirtAddr", "PhysAddr", "Size"
    );
    for seg in program.segments() {
        let _ = writeln!(
            out,
            "  {:<4} 0x{:08x} 0x{:016x} 0x{:016x} 0x{:08x}",
            seg.perm.to_rwx(),
            seg.offset,
            seg.vaddr,
            seg.paddr,
            seg.size
        );
    }

    let _ = writeln!(out, "Sections:");
    let _ = writeln!(out, "  {:<20} {:<18} {:<10}", "Name", "Address", "Size");
    for section in program.sections() {
        let _ = writeln!(
            out,
            "  {:<20} 0x{:016x} 0x{:08x}",
            section.name,
            section.addr,
            section.data.len()
        );
    }
    let _ = writeln!(out, "Symbols: {}", program.symbols().len());
    out
}
