//! Control Flow Graph
//!
//! Basic blocks and edges over the whole program, built from the instruction
//! map produced by the sweep.
//!
//! # Memory Optimizations
//! - `EdgeKind` uses `#[repr(u8)]`
//! - `BasicBlock.successors` and `predecessors` use `SmallVec<[BlockId; 2]>`
//! - Block IDs are `u32`
//!
//! # CFG Construction Algorithm
//! 1. **Identify block leaders**: seeds, branch targets, instructions after a
//!    branch/call/return, and any instruction that is not the unique sequential
//!    successor of another instruction (stream starts and joins)
//! 2. **Build basic blocks**: chain instructions by `address + length` from each
//!    leader until a block-ending instruction or the next leader
//! 3. **Identify edges**: fallthrough, branch-taken, call and unresolved edges
//!    from the last instruction of each block
//!
//! Return edges need function boundaries and are added afterwards by
//! [`ControlFlowGraph::link_returns`].

use crate::decoder::{FlowKind, Instruction};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Block identifier, assigned in address order of the block leaders.
pub type BlockId = u32;

/// Basic block: a maximal straight-line run of instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Address of the first instruction
    pub start: u64,
    /// Address one past the last instruction
    pub end: u64,
    pub instructions: Vec<Instruction>,
    /// Intra-procedural successors (fallthrough and taken edges)
    pub successors: SmallVec<[BlockId; 2]>,
    /// Intra-procedural predecessors
    pub predecessors: SmallVec<[BlockId; 2]>,
}

impl BasicBlock {
    #[inline]
    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Flow kind of the terminating instruction.
    pub fn exit_flow(&self) -> FlowKind {
        self.last().map_or(FlowKind::Sequential, |i| i.flow)
    }
}

/// Type of control flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EdgeKind {
    /// Sequential flow into the next block (also the return site of a call)
    Fallthrough = 0,
    /// Branch taken to a statically resolved target
    Taken = 1,
    /// Caller block to callee entry
    Call = 2,
    /// Returning callee block to the caller's return site
    Return = 3,
    /// Indirect or unresolvable transfer, including sequential flow into
    /// undecoded bytes; the edge has no target
    IndirectUnresolved = 4,
}

impl EdgeKind {
    /// Edges that stay within a function.
    #[inline]
    pub fn is_local(self) -> bool {
        matches!(self, EdgeKind::Fallthrough | EdgeKind::Taken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: BlockId,
    /// `None` only for `IndirectUnresolved`
    pub to: Option<BlockId>,
    pub kind: EdgeKind,
}

/// Recovered function: an entry block plus everything reachable from it
/// through local edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub address: u64,
    pub entry: BlockId,
    /// Member blocks in id (address) order
    pub blocks: Vec<BlockId>,
}

/// Control flow graph over all decoded code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlFlowGraph {
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    by_address: BTreeMap<u64, BlockId>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block. Ids are dense and follow insertion order.
    pub fn add_block(&mut self, start: u64, instructions: Vec<Instruction>) -> BlockId {
        let id: BlockId = self.blocks.len() as BlockId;
        let end: u64 = instructions.last().map_or(start, |i| i.end());
        self.by_address.insert(start, id);
        self.blocks.push(BasicBlock {
            id,
            start,
            end,
            instructions,
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
        });
        id
    }

    /// Record an edge. Local edges also update successor/predecessor lists.
    pub fn add_edge(&mut self, from: BlockId, to: Option<BlockId>, kind: EdgeKind) {
        let edge = Edge { from, to, kind };
        if self.edges.contains(&edge) {
            return;
        }
        self.edges.push(edge);
        if let (Some(to), true) = (to, kind.is_local()) {
            if let Some(src) = self.blocks.get_mut(from as usize) {
                if !src.successors.contains(&to) {
                    src.successors.push(to);
                }
            }
            if let Some(dst) = self.blocks.get_mut(to as usize) {
                if !dst.predecessors.contains(&from) {
                    dst.predecessors.push(from);
                }
            }
        }
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id as usize)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edges_from(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Block starting exactly at `addr`.
    pub fn block_at(&self, addr: u64) -> Option<BlockId> {
        self.by_address.get(&addr).copied()
    }

    /// Target of the local edge of `kind` leaving `id`.
    pub fn local_target(&self, id: BlockId, kind: EdgeKind) -> Option<BlockId> {
        self.edges_from(id)
            .find(|e| e.kind == kind)
            .and_then(|e| e.to)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    /// Build blocks and edges from the decoded instruction map.
    ///
    /// # Arguments
    /// * `instructions` - All decoded instructions keyed by address
    /// * `leaders` - Seeds and statically known branch/call targets
    #[inline(never)] // Large function - don't inline
    pub fn build(instructions: &BTreeMap<u64, Instruction>, leaders: &BTreeSet<u64>) -> Self {
        // First pass: count sequential predecessors of every instruction
        let mut sequential_preds: HashMap<u64, u32> = HashMap::new();
        for insn in instructions.values() {
            if !insn.flow.ends_block() && instructions.contains_key(&insn.end()) {
                *sequential_preds.entry(insn.end()).or_insert(0) += 1;
            }
        }
        let is_leader = |addr: u64| -> bool {
            leaders.contains(&addr) || sequential_preds.get(&addr).copied() != Some(1)
        };

        // Second pass: chain instructions into blocks, in leader address order
        let mut cfg = ControlFlowGraph::new();
        for addr in instructions.keys().copied().filter(|&a| is_leader(a)) {
            let mut body: Vec<Instruction> = Vec::new();
            let mut cur: u64 = addr;
            while let Some(insn) = instructions.get(&cur) {
                body.push(insn.clone());
                if insn.flow.ends_block() {
                    break;
                }
                cur = insn.end();
                if is_leader(cur) {
                    break;
                }
            }
            cfg.add_block(addr, body);
        }

        // Third pass: edges from each block's terminator
        for id in 0..cfg.blocks.len() as BlockId {
            let (flow, target, end) = match cfg.blocks[id as usize].last() {
                Some(last) => (last.flow, last.target, last.end()),
                None => continue,
            };
            let next: Option<BlockId> = cfg.block_at(end);
            let resolved: Option<BlockId> = target.and_then(|t| cfg.block_at(t));
            match flow {
                FlowKind::Sequential | FlowKind::Invalid => match next {
                    Some(next) => cfg.add_edge(id, Some(next), EdgeKind::Fallthrough),
                    // Runs off the segment end or into bytes the budget left undecoded.
                    None => cfg.add_edge(id, None, EdgeKind::IndirectUnresolved),
                },
                FlowKind::UnconditionalBranch | FlowKind::ConditionalBranch => {
                    match resolved {
                        Some(t) => cfg.add_edge(id, Some(t), EdgeKind::Taken),
                        None => cfg.add_edge(id, None, EdgeKind::IndirectUnresolved),
                    }
                    if flow == FlowKind::ConditionalBranch {
                        if let Some(next) = next {
                            cfg.add_edge(id, Some(next), EdgeKind::Fallthrough);
                        }
                    }
                }
                FlowKind::Call => {
                    match resolved {
                        Some(t) => cfg.add_edge(id, Some(t), EdgeKind::Call),
                        None => cfg.add_edge(id, None, EdgeKind::IndirectUnresolved),
                    }
                    if let Some(next) = next {
                        cfg.add_edge(id, Some(next), EdgeKind::Fallthrough);
                    }
                }
                FlowKind::Return => {}
            }
        }
        log::debug!(
            "built CFG: {} blocks, {} edges",
            cfg.blocks.len(),
            cfg.edges.len()
        );
        cfg
    }

    /// Add return edges from every returning block of each called function to
    /// the return sites of its callers.
    pub fn link_returns(&mut self, functions: &[Function]) {
        let mut pending: Vec<(BlockId, BlockId)> = Vec::new();
        for function in functions {
            let callers: Vec<BlockId> = self
                .edges
                .iter()
                .filter(|e| e.kind == EdgeKind::Call && e.to == Some(function.entry))
                .map(|e| e.from)
                .collect();
            let sites: Vec<BlockId> = callers
                .iter()
                .filter_map(|&c| self.block(c).and_then(|b| self.block_at(b.end)))
                .collect();
            for &b in &function.blocks {
                if self.blocks[b as usize].exit_flow() == FlowKind::Return {
                    pending.extend(sites.iter().map(|&site| (b, site)));
                }
            }
        }
        for (from, to) in pending {
            self.add_edge(from, Some(to), EdgeKind::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Operation;
    use smallvec::smallvec;

    fn insn(address: u64, length: u8, flow: FlowKind, target: Option<u64>) -> Instruction {
        Instruction {
            address,
            length,
            mnemonic: "test",
            operation: Operation::Other,
            operands: SmallVec::new(),
            flow,
            target,
            bytes: smallvec![0; length as usize],
            overlapping: false,
            condition: None,
        }
    }

    fn map(list: Vec<Instruction>) -> BTreeMap<u64, Instruction> {
        list.into_iter().map(|i| (i.address, i)).collect()
    }

    #[test]
    fn diamond() {
        // 0: jcc 6 | 2: nop | 4: jmp 8 | 6: nop | 8: ret
        let insns = map(vec![
            insn(0, 2, FlowKind::ConditionalBranch, Some(6)),
            insn(2, 2, FlowKind::Sequential, None),
            insn(4, 2, FlowKind::UnconditionalBranch, Some(8)),
            insn(6, 2, FlowKind::Sequential, None),
            insn(8, 1, FlowKind::Return, None),
        ]);
        let leaders: BTreeSet<u64> = [0, 6, 8].into_iter().collect();
        let cfg = ControlFlowGraph::build(&insns, &leaders);

        let starts: Vec<u64> = cfg.blocks().iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 2, 6, 8]);
        assert_eq!(cfg.block(1).unwrap().instructions.len(), 2);
        assert_eq!(cfg.local_target(0, EdgeKind::Taken), Some(2));
        assert_eq!(cfg.local_target(0, EdgeKind::Fallthrough), Some(1));
        assert_eq!(cfg.local_target(1, EdgeKind::Taken), Some(3));
        assert_eq!(cfg.local_target(2, EdgeKind::Fallthrough), Some(3));
        assert_eq!(cfg.block(3).unwrap().predecessors.len(), 2);
    }

    #[test]
    fn join_point_starts_a_block() {
        // Two streams merge at 4 without a branch pointing there.
        let insns = map(vec![
            insn(0, 4, FlowKind::Sequential, None),
            insn(1, 3, FlowKind::Sequential, None),
            insn(4, 1, FlowKind::Return, None),
        ]);
        let cfg = ControlFlowGraph::build(&insns, &BTreeSet::from([0, 1]));
        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.block_at(4), Some(2));
        assert_eq!(cfg.block(2).unwrap().predecessors.as_slice(), &[0, 1]);
    }

    #[test]
    fn indirect_branch_is_unresolved() {
        let insns = map(vec![insn(0, 2, FlowKind::UnconditionalBranch, None)]);
        let cfg = ControlFlowGraph::build(&insns, &BTreeSet::from([0]));
        assert_eq!(
            cfg.edges(),
            &[Edge {
                from: 0,
                to: None,
                kind: EdgeKind::IndirectUnresolved
            }]
        );
    }

    #[test]
    fn fallthrough_past_decoded_code_is_unresolved() {
        // 0: nop | 1: nop, then nothing decoded at 2
        let insns = map(vec![
            insn(0, 1, FlowKind::Sequential, None),
            insn(1, 1, FlowKind::Invalid, None),
        ]);
        let cfg = ControlFlowGraph::build(&insns, &BTreeSet::from([0]));
        assert_eq!(cfg.len(), 1);
        assert_eq!(
            cfg.edges(),
            &[Edge {
                from: 0,
                to: None,
                kind: EdgeKind::IndirectUnresolved
            }]
        );
        assert!(cfg.block(0).unwrap().successors.is_empty());
    }

    #[test]
    fn returns_link_to_call_sites() {
        // 0: call 8 | 5: ret | 8: ret
        let insns = map(vec![
            insn(0, 5, FlowKind::Call, Some(8)),
            insn(5, 1, FlowKind::Return, None),
            insn(8, 1, FlowKind::Return, None),
        ]);
        let mut cfg = ControlFlowGraph::build(&insns, &BTreeSet::from([0, 8]));
        let callee = Function {
            name: "sub_8".to_string(),
            address: 8,
            entry: 2,
            blocks: vec![2],
        };
        cfg.link_returns(&[callee]);
        assert!(cfg.edges().contains(&Edge {
            from: 2,
            to: Some(1),
            kind: EdgeKind::Return
        }));
        // Return edges are not local successors.
        assert!(cfg.block(2).unwrap().successors.is_empty());
    }
}
