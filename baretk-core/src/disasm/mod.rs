//! Disassembler
//!
//! Turns a [`Program`] into a [`Disassembly`]: decoded instructions grouped
//! into basic blocks, a whole-program control flow graph and recovered
//! functions.
//!
//! # Pipeline
//! 1. **Sweep** ([`sweep`]): linear sweep of every executable segment,
//!    augmented with recursive descent into static branch and call targets
//! 2. **Blocks and edges** ([`cfg`]): leader-based block splitting and edge
//!    construction
//! 3. **Functions**: entries are the program entry, call targets and function
//!    symbols; blocks no entry reaches become entries of their own
//! 4. **Return edges**: returning blocks of each function are linked to the
//!    return sites of its callers
//!
//! Block and function order is by address, so the result does not depend on
//! the order in which the work-list discovered code.

pub mod cfg;
pub mod listing;
mod sweep;

pub use cfg::{BasicBlock, BlockId, ControlFlowGraph, Edge, EdgeKind, Function};

use crate::config::AnalysisConfig;
use crate::decoder::{decoder_for, Decoder, Instruction};
use crate::error::{BaretkError, Result};
use crate::loader::{Program, SymbolKind};
use bitvec::prelude::*;
use std::collections::{BTreeSet, VecDeque};
use sweep::Sweep;

/// Disassembled program. Owns the [`Program`] it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disassembly {
    program: Program,
    cfg: ControlFlowGraph,
    functions: Vec<Function>,
    partial: bool,
}

impl Disassembly {
    /// The program this disassembly was built from.
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    /// Recovered functions in address order.
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Function whose entry is at `addr`.
    pub fn function_at(&self, addr: u64) -> Option<&Function> {
        self.functions.iter().find(|f| f.address == addr)
    }

    /// All instructions in block order.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.cfg.blocks().iter().flat_map(|b| b.instructions.iter())
    }

    pub fn instruction_count(&self) -> usize {
        self.cfg.instruction_count()
    }

    /// True when the instruction budget cut the sweep short.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// objdump-style text listing.
    pub fn listing(&self) -> String {
        listing::render(self)
    }

    /// Give the program back, dropping the analysis.
    pub fn into_program(self) -> Program {
        self.program
    }
}

/// Disassemble with the default configuration.
pub fn disassemble(program: Program) -> Result<Disassembly> {
    disassemble_with(program, &AnalysisConfig::default())
}

/// Disassemble a program.
///
/// # Errors
/// - `NoExecutableRegion` when the program has no executable segment
/// - `UnsupportedMachine` when no decoder exists for the machine type
#[inline(never)] // Large function - don't inline
pub fn disassemble_with(program: Program, config: &AnalysisConfig) -> Result<Disassembly> {
    if program.executable_segments().next().is_none() {
        return Err(BaretkError::NoExecutableRegion);
    }
    let decoder: Box<dyn Decoder> =
        decoder_for(program.machine()).ok_or_else(|| BaretkError::UnsupportedMachine {
            machine: program.machine().to_string(),
        })?;
    log::info!(
        "disassembling {} code, {} executable segment(s)",
        decoder.name(),
        program.executable_segments().count()
    );

    let mut sweep = Sweep::new(&program, decoder.as_ref(), config.max_instructions);
    let seeds: Vec<u64> = program
        .executable_segments()
        .map(|s| s.vaddr)
        .chain(std::iter::once(program.entry_point()))
        .collect();
    for seed in seeds {
        sweep.enqueue(seed);
    }
    if config.use_symbols {
        for sym in program.symbols() {
            if sym.kind == SymbolKind::Function {
                sweep.enqueue(sym.addr);
            }
        }
    }
    sweep.run();

    let partial: bool = sweep.exhausted;
    let mut cfg = ControlFlowGraph::build(&sweep.instructions, &sweep.leaders);
    let call_targets: BTreeSet<u64> = std::mem::take(&mut sweep.call_targets);
    drop(sweep);

    let functions: Vec<Function> = recover_functions(&cfg, &program, &call_targets, config);
    cfg.link_returns(&functions);

    log::info!(
        "disassembled {} instructions: {} blocks, {} edges, {} functions",
        cfg.instruction_count(),
        cfg.len(),
        cfg.edges().len(),
        functions.len()
    );
    Ok(Disassembly {
        program,
        cfg,
        functions,
        partial,
    })
}

/// Blocks reachable from `entry` through local edges, in id order.
fn reachable(cfg: &ControlFlowGraph, entry: BlockId) -> Vec<BlockId> {
    let mut visited: BitVec = bitvec![0; cfg.len()];
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    visited.set(entry as usize, true);
    queue.push_back(entry);
    while let Some(b) = queue.pop_front() {
        if let Some(block) = cfg.block(b) {
            for &s in &block.successors {
                if !visited[s as usize] {
                    visited.set(s as usize, true);
                    queue.push_back(s);
                }
            }
        }
    }
    visited.iter_ones().map(|i| i as BlockId).collect()
}

fn recover_functions(
    cfg: &ControlFlowGraph,
    program: &Program,
    call_targets: &BTreeSet<u64>,
    config: &AnalysisConfig,
) -> Vec<Function> {
    let mut entries: BTreeSet<BlockId> = BTreeSet::new();
    entries.extend(cfg.block_at(program.entry_point()));
    entries.extend(call_targets.iter().filter_map(|&t| cfg.block_at(t)));
    if config.use_symbols {
        entries.extend(
            program
                .symbols()
                .iter()
                .filter(|s| s.kind == SymbolKind::Function)
                .filter_map(|s| cfg.block_at(s.addr)),
        );
    }

    let mut covered: BitVec = bitvec![0; cfg.len()];
    let mut functions: Vec<Function> = Vec::new();
    let mut add = |entry: BlockId, covered: &mut BitVec| {
        let blocks: Vec<BlockId> = reachable(cfg, entry);
        for &b in &blocks {
            covered.set(b as usize, true);
        }
        let address: u64 = cfg.block(entry).map_or(0, |b| b.start);
        let name: String = program
            .function_name_at(address)
            .filter(|_| config.use_symbols)
            .map(str::to_string)
            .unwrap_or_else(|| format!("sub_{:x}", address));
        log::debug!("function {} at 0x{:x}: {} blocks", name, address, blocks.len());
        functions.push(Function {
            name,
            address,
            entry,
            blocks,
        });
    };

    for &entry in &entries {
        add(entry, &mut covered);
    }
    for b in 0..cfg.len() {
        if !covered[b] {
            add(b as BlockId, &mut covered);
        }
    }
    functions.sort_by_key(|f| f.address);
    functions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{
        ContainerKind, Endianness, Machine, Permissions, Segment, Symbol,
    };
    use std::collections::BTreeMap;

    fn program(code: &[u8], machine: Machine, perm: Permissions) -> Program {
        Program {
            container: ContainerKind::Elf,
            endianness: Endianness::Little,
            machine,
            bits: 64,
            entry: 0x1000,
            segments: vec![Segment {
                perm,
                offset: 0,
                vaddr: 0x1000,
                paddr: 0x1000,
                size: code.len(),
            }],
            sections: BTreeMap::new(),
            symbols: Vec::new(),
            image: code.to_vec(),
        }
    }

    fn amd64(code: &[u8]) -> Program {
        program(code, Machine::Amd64, Permissions::EXEC | Permissions::READ)
    }

    #[test]
    fn no_executable_segment() {
        let p = program(&[0x90], Machine::Amd64, Permissions::READ);
        assert!(matches!(
            disassemble(p),
            Err(BaretkError::NoExecutableRegion)
        ));
    }

    fn arm(words: &[u32]) -> Program {
        let code: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        program(&code, Machine::Arm, Permissions::EXEC | Permissions::READ)
    }

    #[test]
    fn arm_conditional_branch_splits_blocks() {
        // cmp r0, #0 | beq 0x1010 | mov r0, #1 | bx lr | mov r0, #2 | bx lr
        let d = disassemble(arm(&[
            0xe350_0000,
            0x0a00_0001,
            0xe3a0_0001,
            0xe12f_ff1e,
            0xe3a0_0002,
            0xe12f_ff1e,
        ]))
        .unwrap();
        let starts: Vec<u64> = d.cfg().blocks().iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0x1000, 0x1008, 0x1010]);
        let kinds: Vec<(Option<BlockId>, EdgeKind)> =
            d.cfg().edges_from(0).map(|e| (e.to, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![(Some(2), EdgeKind::Taken), (Some(1), EdgeKind::Fallthrough)]
        );
        assert_eq!(d.cfg().edges_from(1).count(), 0);
        assert_eq!(d.cfg().edges_from(2).count(), 0);
        assert_eq!(d.functions().len(), 1);
    }

    #[test]
    fn arm_predicated_return_keeps_the_fallthrough() {
        // cmp r0, #0 | bxeq lr | mov r0, #1 | bx lr
        let d = disassemble(arm(&[0xe350_0000, 0x012f_ff1e, 0xe3a0_0001, 0xe12f_ff1e]))
            .unwrap();
        let kinds: Vec<(Option<BlockId>, EdgeKind)> =
            d.cfg().edges_from(0).map(|e| (e.to, e.kind)).collect();
        assert!(kinds.contains(&(Some(1), EdgeKind::Fallthrough)));
        assert!(kinds.contains(&(None, EdgeKind::IndirectUnresolved)));
        assert_eq!(d.cfg().block(1).map(|b| b.start), Some(0x1008));
    }

    #[test]
    fn call_target_becomes_function() {
        // 0x1000: call 0x1006 | 0x1005: ret | 0x1006: ret
        let d = disassemble(amd64(&[0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xc3])).unwrap();
        let names: Vec<&str> = d.functions().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["sub_1000", "sub_1006"]);
        assert_eq!(d.function_at(0x1000).unwrap().blocks, vec![0, 1]);

        let ret_edge = d
            .cfg()
            .edges()
            .iter()
            .find(|e| e.kind == EdgeKind::Return)
            .copied();
        assert_eq!(
            ret_edge,
            Some(Edge {
                from: 2,
                to: Some(1),
                kind: EdgeKind::Return
            })
        );
    }

    #[test]
    fn symbols_name_functions() {
        let mut p = amd64(&[0xc3]);
        p.symbols.push(Symbol {
            name: "_start".to_string(),
            addr: 0x1000,
            size: 1,
            kind: SymbolKind::Function,
        });
        let d = disassemble(p.clone()).unwrap();
        assert_eq!(d.functions()[0].name, "_start");

        let config = AnalysisConfig {
            use_symbols: false,
            ..AnalysisConfig::default()
        };
        let d = disassemble_with(p, &config).unwrap();
        assert_eq!(d.functions()[0].name, "sub_1000");
    }

    #[test]
    fn unreachable_block_gets_its_own_function() {
        // 0x1000: ret | 0x1001: nop | 0x1002: ret
        let d = disassemble(amd64(&[0xc3, 0x90, 0xc3])).unwrap();
        assert_eq!(d.functions().len(), 2);
        assert_eq!(d.functions()[1].address, 0x1001);
    }

    #[test]
    fn disassembly_owns_its_program() {
        let p = amd64(&[0xc3]);
        let d = disassemble(p.clone()).unwrap();
        assert_eq!(d.program(), &p);
        assert_eq!(d.into_program(), p);
    }
}
