//! objdump-style listing.

use super::Disassembly;
use crate::decoder::Instruction;
use std::fmt::Write;

/// Width of the hex byte column (seven bytes).
const BYTES_COLUMN: usize = 21;

fn hex_bytes(insn: &Instruction) -> String {
    insn.bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render every block in address order, with a header in front of each function entry.
pub fn render(disassembly: &Disassembly) -> String {
    let program = disassembly.program();
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(
        out,
        "Disassembly of {} code ({} instructions):",
        program.machine(),
        disassembly.instruction_count()
    );

    for block in disassembly.cfg().blocks() {
        if let Some(function) = disassembly
            .functions()
            .iter()
            .find(|f| f.entry == block.id)
        {
            let _ = writeln!(out);
            let _ = writeln!(out, "{:016x} <{}>:", function.address, function.name);
        }
        for insn in &block.instructions {
            let _ = write!(
                out,
                "  {:8x}:\t{:<width$}\t{}",
                insn.address,
                hex_bytes(insn),
                insn,
                width = BYTES_COLUMN
            );
            if insn.overlapping {
                out.push_str("\t; overlapping");
            }
            out.push('\n');
        }
    }
    if disassembly.is_partial() {
        let _ = writeln!(out, "\n; listing truncated: instruction budget reached");
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::disasm::disassemble;
    use crate::loader::{ContainerKind, Endianness, Machine, Permissions, Program, Segment};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn lists_function_with_bad_byte() {
        let code = [0x90u8, 0xd6, 0xc3];
        let program = Program {
            container: ContainerKind::Elf,
            endianness: Endianness::Little,
            machine: Machine::Amd64,
            bits: 64,
            entry: 0x401000,
            segments: vec![Segment {
                perm: Permissions::EXEC | Permissions::READ,
                offset: 0,
                vaddr: 0x401000,
                paddr: 0x401000,
                size: code.len(),
            }],
            sections: BTreeMap::new(),
            symbols: Vec::new(),
            image: code.to_vec(),
        };
        let text = disassemble(program).unwrap().listing();
        let expected = "\
Disassembly of amd64 code (3 instructions):

0000000000401000 <sub_401000>:
    401000:\t90                   \tnop
    401001:\td6                   \t(bad)
    401002:\tc3                   \tret
";
        assert_eq!(text, expected);
    }
}
