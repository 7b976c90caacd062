//! Linear sweep with recursive-descent augmentation.
//!
//! # Algorithm
//! 1. Queue every seed (executable segment starts, entry point, function symbols)
//! 2. Pop an address and decode sequentially from it until an already decoded
//!    address or the end of its segment
//! 3. Queue every static branch/call target that lands in an executable segment
//! 4. Repeat until the work-list is empty or the instruction budget is spent
//!
//! A stream starting inside bytes already covered by another instruction is an
//! overlapping stream and its instructions are flagged as such. Undecodable
//! bytes become length-1 `(bad)` instructions and the sweep resumes at the next
//! byte. For fixed-width sets the bytes up to the next aligned address are
//! `(bad)` as well, so decoding resumes on the instruction grid.

use crate::decoder::{Decoder, FlowKind, Instruction};
use crate::loader::{Program, Segment};
use bitvec::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// Byte coverage of one executable segment.
struct Coverage {
    vaddr: u64,
    bits: BitVec<u64, Lsb0>,
}

/// Sweep state over one program.
pub(crate) struct Sweep<'p> {
    program: &'p Program,
    decoder: &'p dyn Decoder,
    budget: usize,
    coverage: Vec<Coverage>,
    worklist: VecDeque<u64>,
    queued: HashSet<u64>,
    /// Decoded instructions keyed by address
    pub instructions: BTreeMap<u64, Instruction>,
    /// Seeds and static targets
    pub leaders: BTreeSet<u64>,
    /// Static call targets
    pub call_targets: BTreeSet<u64>,
    /// The instruction budget ran out before the work-list was empty
    pub exhausted: bool,
}

impl<'p> Sweep<'p> {
    pub fn new(program: &'p Program, decoder: &'p dyn Decoder, budget: usize) -> Self {
        let coverage: Vec<Coverage> = program
            .executable_segments()
            .map(|s| Coverage {
                vaddr: s.vaddr,
                bits: bitvec![u64, Lsb0; 0; s.size],
            })
            .collect();
        Self {
            program,
            decoder,
            budget,
            coverage,
            worklist: VecDeque::new(),
            queued: HashSet::new(),
            instructions: BTreeMap::new(),
            leaders: BTreeSet::new(),
            call_targets: BTreeSet::new(),
            exhausted: false,
        }
    }

    /// Queue `addr` if it lies in an executable segment and was not queued before.
    pub fn enqueue(&mut self, addr: u64) {
        if self.program.executable_segment_at(addr).is_none() {
            log::debug!("ignoring target 0x{:x} outside executable segments", addr);
            return;
        }
        self.leaders.insert(addr);
        if self.queued.insert(addr) {
            self.worklist.push_back(addr);
        }
    }

    /// Drain the work-list.
    pub fn run(&mut self) {
        while let Some(start) = self.worklist.pop_front() {
            if self.exhausted {
                break;
            }
            self.stream(start);
        }
    }

    fn covered(&self, addr: u64) -> bool {
        self.coverage.iter().any(|c| {
            addr.checked_sub(c.vaddr)
                .and_then(|off| c.bits.get(off as usize).map(|b| *b))
                .unwrap_or(false)
        })
    }

    fn mark(&mut self, insn: &Instruction) {
        for c in self.coverage.iter_mut() {
            let Some(off) = insn.address.checked_sub(c.vaddr) else {
                continue;
            };
            let start: usize = off as usize;
            if start >= c.bits.len() {
                continue;
            }
            let end: usize = (start + usize::from(insn.length)).min(c.bits.len());
            c.bits[start..end].fill(true);
        }
    }

    /// Decode one stream starting at `start`.
    fn stream(&mut self, start: u64) {
        let segment: Segment = match self.program.executable_segment_at(start) {
            Some(s) => *s,
            None => return,
        };
        let alignment: u64 = self.decoder.alignment();
        if start % alignment != 0 {
            log::debug!("skipping misaligned target 0x{:x}", start);
            return;
        }
        if self.instructions.contains_key(&start) {
            return;
        }
        let overlapping: bool = self.covered(start);
        if overlapping {
            log::debug!("0x{:x} starts an overlapping decode stream", start);
        }

        let program: &'p Program = self.program;
        let data: &'p [u8] = program.segment_data(&segment);
        let endianness = program.endianness();
        let mut addr: u64 = start;

        while addr < segment.end() {
            if addr != start && self.instructions.contains_key(&addr) {
                break;
            }
            if self.instructions.len() >= self.budget {
                log::warn!(
                    "instruction budget of {} reached at 0x{:x}; disassembly is partial",
                    self.budget,
                    addr
                );
                self.exhausted = true;
                return;
            }
            let offset: usize = (addr - segment.vaddr) as usize;
            let bytes: &[u8] = match data.get(offset..) {
                Some(b) if !b.is_empty() => b,
                _ => break,
            };
            let mut insn: Instruction = if addr % alignment != 0 {
                // No encoding starts off the instruction grid.
                Instruction::invalid(addr, bytes[0])
            } else {
                match self.decoder.decode(bytes, addr, endianness) {
                    Ok((insn, _)) => insn,
                    Err(e) => {
                        log::debug!("{}", e);
                        Instruction::invalid(addr, bytes[0])
                    }
                }
            };
            insn.overlapping = overlapping;

            if let Some(target) = insn.target {
                if insn.flow == FlowKind::Call {
                    self.call_targets.insert(target);
                }
                self.enqueue(target);
            }
            self.mark(&insn);
            addr = insn.end();
            self.instructions.insert(insn.address, insn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::arm::ArmDecoder;
    use crate::decoder::x86::{Mode, X86Decoder};
    use crate::loader::{ContainerKind, Endianness, Machine, Permissions};
    use std::collections::BTreeMap as Map;

    fn program(code: &[u8]) -> Program {
        Program {
            container: ContainerKind::Elf,
            endianness: Endianness::Little,
            machine: Machine::Amd64,
            bits: 64,
            entry: 0x1000,
            segments: vec![Segment {
                perm: Permissions::EXEC | Permissions::READ,
                offset: 0,
                vaddr: 0x1000,
                paddr: 0x1000,
                size: code.len(),
            }],
            sections: Map::new(),
            symbols: Vec::new(),
            image: code.to_vec(),
        }
    }

    #[test]
    fn resyncs_after_invalid_byte() {
        let p = program(&[0x90, 0xd6, 0xc3]);
        let dec = X86Decoder::new(Mode::Long);
        let mut sweep = Sweep::new(&p, &dec, 100);
        sweep.enqueue(0x1000);
        sweep.run();
        let got: Vec<(u64, u8, &str)> = sweep
            .instructions
            .values()
            .map(|i| (i.address, i.length, i.mnemonic))
            .collect();
        assert_eq!(
            got,
            vec![(0x1000, 1, "nop"), (0x1001, 1, "(bad)"), (0x1002, 1, "ret")]
        );
    }

    #[test]
    fn jump_into_instruction_is_overlapping() {
        // 0x1000: mov eax, 0x90c3 ... jumps into its own immediate.
        // b8 c3 90 00 00 | eb fa (jmp 0x1001)
        let p = program(&[0xb8, 0xc3, 0x90, 0x00, 0x00, 0xeb, 0xfa]);
        let dec = X86Decoder::new(Mode::Long);
        let mut sweep = Sweep::new(&p, &dec, 100);
        sweep.enqueue(0x1000);
        sweep.run();
        let ret = &sweep.instructions[&0x1001];
        assert_eq!(ret.mnemonic, "ret");
        assert!(ret.overlapping);
        assert!(!sweep.instructions[&0x1000].overlapping);
    }

    #[test]
    fn resyncs_on_the_instruction_grid() {
        let mut p = program(&[0xff, 0xff, 0xff, 0xff, 0x1e, 0xff, 0x2f, 0xe1]);
        p.machine = Machine::Arm;
        let dec = ArmDecoder;
        let mut sweep = Sweep::new(&p, &dec, 100);
        sweep.enqueue(0x1000);
        sweep.run();
        let got: Vec<(u64, u8, &str)> = sweep
            .instructions
            .values()
            .map(|i| (i.address, i.length, i.mnemonic))
            .collect();
        assert_eq!(
            got,
            vec![
                (0x1000, 1, "(bad)"),
                (0x1001, 1, "(bad)"),
                (0x1002, 1, "(bad)"),
                (0x1003, 1, "(bad)"),
                (0x1004, 4, "bx"),
            ]
        );
        assert_eq!(sweep.instructions[&0x1004].flow, FlowKind::Return);
    }

    #[test]
    fn budget_stops_the_sweep() {
        let p = program(&[0x90; 16]);
        let dec = X86Decoder::new(Mode::Long);
        let mut sweep = Sweep::new(&p, &dec, 4);
        sweep.enqueue(0x1000);
        sweep.run();
        assert_eq!(sweep.instructions.len(), 4);
        assert!(sweep.exhausted);
    }
}
