//! Control Flow Structuring
//!
//! Recovers loops, two-way conditionals and multi-way branches from a
//! function's blocks and emits a [`StructuredTree`].
//!
//! # Algorithm
//! 1. Build the function-local graph, dominators and post-dominators
//! 2. Find natural loops: a back edge `u -> h` where `h` dominates `u`; the body
//!    is `h` plus every block that reaches `u` without passing through `h`.
//!    Loops sharing a header are merged
//! 3. Walk from the entry emitting a sequence:
//!    - an unvisited loop header opens a `Loop` whose follow is its exit with the
//!      lowest RPO number; reaching the header again is `Continue`, reaching the
//!      follow is `Break`
//!    - a two-way block becomes `If`, both arms stopping at its immediate
//!      post-dominator, where the sequence resumes
//!    - a block with more than two distinct successors becomes `Switch`
//!    - reaching a block that was already emitted becomes `Goto`, and a label is
//!      placed in front of the target
//!
//! Every block is emitted at most once, so the walk terminates on any graph,
//! irreducible ones included.

use super::dominators::{post_dominators, Dominators, LocalGraph};
use crate::disasm::{BlockId, ControlFlowGraph, EdgeKind, Function};
use bitvec::prelude::*;
use rayon::prelude::*;
use std::collections::BTreeSet;

/// Node of a structured function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredNode {
    /// Straight-line contents of a block
    Block(BlockId),
    /// Jump target for a `Goto`, placed right before the block it names
    Label(BlockId),
    /// Two-way branch at the end of block `cond`
    If {
        cond: BlockId,
        /// Executed when the branch is taken
        then_branch: Vec<StructuredNode>,
        /// Executed on fallthrough
        else_branch: Vec<StructuredNode>,
    },
    /// Endless loop; exits are explicit `Break`s
    Loop {
        header: BlockId,
        body: Vec<StructuredNode>,
    },
    /// Multi-way branch at the end of `block`, one case per target
    Switch {
        block: BlockId,
        cases: Vec<(BlockId, Vec<StructuredNode>)>,
    },
    Break,
    Continue,
    Goto(BlockId),
}

/// Structured body of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredTree {
    pub name: String,
    pub address: u64,
    pub nodes: Vec<StructuredNode>,
}

struct LoopFrame {
    header: usize,
    follow: Option<usize>,
    body: BitVec,
}

struct Structurer<'a> {
    cfg: &'a ControlFlowGraph,
    graph: LocalGraph,
    doms: Dominators,
    ipdom: Vec<Option<usize>>,
    /// Loop body per header (merged over all back edges into it)
    loops: Vec<Option<BitVec>>,
    emitted: BitVec,
    labels: BTreeSet<BlockId>,
    frames: Vec<LoopFrame>,
}

impl<'a> Structurer<'a> {
    fn new(cfg: &'a ControlFlowGraph, function: &Function) -> Self {
        let graph = LocalGraph::new(cfg, function);
        let doms = Dominators::compute(graph.entry, &graph.succs, &graph.preds);
        let ipdom: Vec<Option<usize>> = post_dominators(&graph);
        let n: usize = graph.len();
        let mut s = Self {
            cfg,
            graph,
            doms,
            ipdom,
            loops: vec![None; n],
            emitted: bitvec![0; n],
            labels: BTreeSet::new(),
            frames: Vec::new(),
        };
        s.find_loops();
        s
    }

    fn find_loops(&mut self) {
        let n: usize = self.graph.len();
        for u in 0..n {
            for &h in &self.graph.succs[u] {
                if !self.doms.dominates(h, u) {
                    continue;
                }
                let body = self.loops[h].get_or_insert_with(|| bitvec![0; n]);
                body.set(h, true);
                let mut work: Vec<usize> = vec![u];
                while let Some(b) = work.pop() {
                    if body[b] {
                        continue;
                    }
                    body.set(b, true);
                    work.extend(self.graph.preds[b].iter().copied());
                }
            }
        }
        let count: usize = self.loops.iter().filter(|l| l.is_some()).count();
        if count > 0 {
            log::debug!("found {} natural loop(s)", count);
        }
    }

    fn id(&self, local: usize) -> BlockId {
        self.graph.blocks[local]
    }

    /// Exit of the loop with the lowest RPO number.
    fn follow_of(&self, body: &BitVec) -> Option<usize> {
        body.iter_ones()
            .flat_map(|b| self.graph.succs[b].iter().copied())
            .filter(|&s| !body[s])
            .min_by_key(|&s| self.doms.rpo_number(s).unwrap_or(usize::MAX))
    }

    fn emit_sequence(
        &mut self,
        mut cur: Option<usize>,
        stop: Option<usize>,
        out: &mut Vec<StructuredNode>,
    ) {
        while let Some(b) = cur {
            if Some(b) == stop {
                return;
            }
            if let Some(frame) = self.frames.last() {
                if b == frame.header {
                    out.push(StructuredNode::Continue);
                    return;
                }
                if Some(b) == frame.follow {
                    out.push(StructuredNode::Break);
                    return;
                }
            }
            // Leaving several loops at once
            let outer_exit: bool = self
                .frames
                .iter()
                .rev()
                .skip(1)
                .any(|f| f.follow == Some(b));
            if self.emitted[b] || outer_exit {
                out.push(StructuredNode::Goto(self.id(b)));
                self.labels.insert(self.id(b));
                return;
            }
            if self.loops[b].is_some() {
                cur = self.emit_loop(b, out);
                continue;
            }
            self.emitted.set(b, true);
            out.push(StructuredNode::Block(self.id(b)));
            cur = self.emit_successors(b, stop, out);
        }
    }

    /// Immediate post-dominator of `b`, if it lies inside the innermost loop.
    ///
    /// A join outside the loop is reached through `Break` instead.
    fn join_of(&self, b: usize) -> Option<usize> {
        self.ipdom[b].filter(|&j| self.frames.last().map_or(true, |f| f.body[j]))
    }

    /// Emit the branch at the end of `b`. Returns where the sequence resumes.
    fn emit_successors(
        &mut self,
        b: usize,
        stop: Option<usize>,
        out: &mut Vec<StructuredNode>,
    ) -> Option<usize> {
        let succs: Vec<usize> = self.graph.succs[b].to_vec();
        match succs.len() {
            0 => None,
            1 => Some(succs[0]),
            2 => {
                let id: BlockId = self.id(b);
                let local = |kind: EdgeKind| {
                    self.cfg
                        .local_target(id, kind)
                        .and_then(|t| self.graph.local(t))
                };
                let taken: usize = local(EdgeKind::Taken).unwrap_or(succs[0]);
                let fall: usize = local(EdgeKind::Fallthrough)
                    .filter(|&f| f != taken)
                    .unwrap_or(if succs[0] == taken { succs[1] } else { succs[0] });
                let join: Option<usize> = self.join_of(b);
                let arm_stop: Option<usize> = join.or(stop);

                let mut then_branch: Vec<StructuredNode> = Vec::new();
                self.emit_sequence(Some(taken), arm_stop, &mut then_branch);
                let mut else_branch: Vec<StructuredNode> = Vec::new();
                self.emit_sequence(Some(fall), arm_stop, &mut else_branch);
                out.push(StructuredNode::If {
                    cond: id,
                    then_branch,
                    else_branch,
                });
                join
            }
            _ => {
                let join: Option<usize> = self.join_of(b);
                let arm_stop: Option<usize> = join.or(stop);
                let mut cases: Vec<(BlockId, Vec<StructuredNode>)> = Vec::new();
                for s in succs {
                    let mut body: Vec<StructuredNode> = Vec::new();
                    self.emit_sequence(Some(s), arm_stop, &mut body);
                    cases.push((self.id(s), body));
                }
                out.push(StructuredNode::Switch {
                    block: self.id(b),
                    cases,
                });
                join
            }
        }
    }

    /// Emit the loop headed by `h`. Returns the loop follow.
    fn emit_loop(&mut self, h: usize, out: &mut Vec<StructuredNode>) -> Option<usize> {
        let body: BitVec = match self.loops[h].clone() {
            Some(body) => body,
            None => return None,
        };
        let follow: Option<usize> = self.follow_of(&body);
        self.frames.push(LoopFrame {
            header: h,
            follow,
            body,
        });

        let mut nodes: Vec<StructuredNode> = Vec::new();
        self.emitted.set(h, true);
        nodes.push(StructuredNode::Block(self.id(h)));
        let next: Option<usize> = self.emit_successors(h, None, &mut nodes);
        self.emit_sequence(next, None, &mut nodes);
        self.frames.pop();

        strip_trailing_continue(&mut nodes);
        out.push(StructuredNode::Loop {
            header: self.id(h),
            body: nodes,
        });
        follow
    }

    fn run(mut self, function: &Function) -> StructuredTree {
        let mut nodes: Vec<StructuredNode> = Vec::new();
        self.emit_sequence(Some(self.graph.entry), None, &mut nodes);
        let labels: BTreeSet<BlockId> = std::mem::take(&mut self.labels);
        StructuredTree {
            name: function.name.clone(),
            address: function.address,
            nodes: insert_labels(nodes, &labels),
        }
    }
}

/// Drop `Continue`s that end the loop body, including those ending both arms
/// of a final `If`.
fn strip_trailing_continue(nodes: &mut Vec<StructuredNode>) {
    match nodes.last_mut() {
        Some(StructuredNode::Continue) => {
            nodes.pop();
        }
        Some(StructuredNode::If {
            then_branch,
            else_branch,
            ..
        }) => {
            strip_trailing_continue(then_branch);
            strip_trailing_continue(else_branch);
        }
        _ => {}
    }
}

/// Put a `Label` in front of every block some `Goto` targets.
fn insert_labels(nodes: Vec<StructuredNode>, labels: &BTreeSet<BlockId>) -> Vec<StructuredNode> {
    if labels.is_empty() {
        return nodes;
    }
    let mut out: Vec<StructuredNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            StructuredNode::Block(b) => {
                if labels.contains(&b) {
                    out.push(StructuredNode::Label(b));
                }
                out.push(StructuredNode::Block(b));
            }
            StructuredNode::If {
                cond,
                then_branch,
                else_branch,
            } => out.push(StructuredNode::If {
                cond,
                then_branch: insert_labels(then_branch, labels),
                else_branch: insert_labels(else_branch, labels),
            }),
            StructuredNode::Loop { header, body } => {
                // A label on the header goes outside the loop.
                if labels.contains(&header) {
                    out.push(StructuredNode::Label(header));
                }
                let body: Vec<StructuredNode> = insert_labels(body, labels)
                    .into_iter()
                    .filter(|n| n != &StructuredNode::Label(header))
                    .collect();
                out.push(StructuredNode::Loop { header, body });
            }
            StructuredNode::Switch { block, cases } => out.push(StructuredNode::Switch {
                block,
                cases: cases
                    .into_iter()
                    .map(|(t, body)| (t, insert_labels(body, labels)))
                    .collect(),
            }),
            other => out.push(other),
        }
    }
    out
}

/// Structure one function.
pub fn structure(cfg: &ControlFlowGraph, function: &Function) -> StructuredTree {
    Structurer::new(cfg, function).run(function)
}

/// Structure every function, in the order given.
///
/// With `parallel`, functions are structured on the rayon pool; the output
/// order does not depend on scheduling.
pub fn structure_all(
    cfg: &ControlFlowGraph,
    functions: &[Function],
    parallel: bool,
) -> Vec<StructuredTree> {
    if parallel {
        functions.par_iter().map(|f| structure(cfg, f)).collect()
    } else {
        functions.iter().map(|f| structure(cfg, f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{FlowKind, Instruction, Operation};
    use smallvec::SmallVec;
    use StructuredNode::*;

    fn insn(address: u64, flow: FlowKind, target: Option<u64>) -> Instruction {
        Instruction {
            address,
            length: 1,
            mnemonic: "x",
            operation: Operation::Other,
            operands: SmallVec::new(),
            flow,
            target,
            bytes: SmallVec::from_slice(&[0]),
            overlapping: false,
            condition: None,
        }
    }

    /// Graph with one block per entry in `edges`; block `i` sits at address `i`.
    fn graph(n: usize, edges: &[(BlockId, BlockId, EdgeKind)]) -> (ControlFlowGraph, Function) {
        let mut cfg = ControlFlowGraph::new();
        for i in 0..n as u64 {
            cfg.add_block(i, vec![insn(i, FlowKind::Sequential, None)]);
        }
        for &(a, b, kind) in edges {
            cfg.add_edge(a, Some(b), kind);
        }
        let function = Function {
            name: "f".to_string(),
            address: 0,
            entry: 0,
            blocks: (0..n as BlockId).collect(),
        };
        (cfg, function)
    }

    use EdgeKind::{Fallthrough as F, Taken as T};

    #[test]
    fn straight_line() {
        let (cfg, f) = graph(2, &[(0, 1, F)]);
        assert_eq!(structure(&cfg, &f).nodes, vec![Block(0), Block(1)]);
    }

    #[test]
    fn if_else_joins_at_post_dominator() {
        let (cfg, f) = graph(4, &[(0, 1, F), (0, 2, T), (1, 3, T), (2, 3, F)]);
        assert_eq!(
            structure(&cfg, &f).nodes,
            vec![
                Block(0),
                If {
                    cond: 0,
                    then_branch: vec![Block(2)],
                    else_branch: vec![Block(1)],
                },
                Block(3),
            ]
        );
    }

    #[test]
    fn self_loop_is_endless_loop() {
        let (cfg, f) = graph(1, &[(0, 0, T)]);
        assert_eq!(
            structure(&cfg, &f).nodes,
            vec![Loop {
                header: 0,
                body: vec![Block(0)],
            }]
        );
    }

    #[test]
    fn while_shape_breaks_to_follow() {
        // 0 -> 1; 1 -T-> 3 (exit), 1 -F-> 2; 2 -> 1
        let (cfg, f) = graph(4, &[(0, 1, F), (1, 3, T), (1, 2, F), (2, 1, T)]);
        assert_eq!(
            structure(&cfg, &f).nodes,
            vec![
                Block(0),
                Loop {
                    header: 1,
                    body: vec![
                        Block(1),
                        If {
                            cond: 1,
                            then_branch: vec![Break],
                            else_branch: vec![Block(2)],
                        },
                    ],
                },
                Block(3),
            ]
        );
    }

    #[test]
    fn irreducible_cycle_uses_goto() {
        // 0 branches into both 1 and 2, which form a cycle with two entries.
        let (cfg, f) = graph(3, &[(0, 1, F), (0, 2, T), (1, 2, F), (2, 1, F)]);
        let tree = structure(&cfg, &f);
        assert!(!tree.nodes.is_empty());

        fn count(nodes: &[StructuredNode], pred: &dyn Fn(&StructuredNode) -> bool) -> usize {
            nodes
                .iter()
                .map(|n| {
                    let inner = match n {
                        If {
                            then_branch,
                            else_branch,
                            ..
                        } => count(then_branch, pred) + count(else_branch, pred),
                        Loop { body, .. } => count(body, pred),
                        _ => 0,
                    };
                    inner + usize::from(pred(n))
                })
                .sum()
        }
        assert!(count(&tree.nodes, &|n| matches!(n, Goto(_))) >= 1);
        assert!(count(&tree.nodes, &|n| matches!(n, Label(_))) >= 1);
        for b in 0..3 {
            assert_eq!(count(&tree.nodes, &|n| n == &Block(b)), 1);
        }
    }

    #[test]
    fn three_way_branch_is_switch() {
        let (cfg, f) = graph(
            5,
            &[(0, 1, T), (0, 2, T), (0, 3, T), (1, 4, F), (2, 4, F), (3, 4, F)],
        );
        let tree = structure(&cfg, &f);
        assert!(matches!(&tree.nodes[1], Switch { block: 0, cases } if cases.len() == 3));
        assert_eq!(tree.nodes.last(), Some(&Block(4)));
    }

    #[test]
    fn parallel_matches_sequential() {
        let (cfg, f) = graph(4, &[(0, 1, F), (0, 2, T), (1, 3, T), (2, 3, F)]);
        let mut g = f.clone();
        g.name = "g".to_string();
        let functions = vec![f, g];
        assert_eq!(
            structure_all(&cfg, &functions, true),
            structure_all(&cfg, &functions, false)
        );
    }
}
