//! Dominator analysis over a function-local graph.
//!
//! # Algorithm
//! Iterative Cooper-Harvey-Kennedy: process blocks in reverse post-order,
//! set each block's immediate dominator to the intersection of its processed
//! predecessors, and repeat until nothing changes. `intersect` walks both
//! fingers up the current tree by RPO number.
//!
//! Post-dominators run the same algorithm on the reversed graph, rooted at a
//! virtual exit that precedes every block without successors.

use crate::disasm::{BlockId, ControlFlowGraph, Function};
use smallvec::SmallVec;
use std::collections::HashMap;

const UNDEFINED: usize = usize::MAX;

pub(crate) type Adjacency = Vec<SmallVec<[usize; 2]>>;

/// One function's blocks with dense local indices.
#[derive(Debug, Clone)]
pub struct LocalGraph {
    /// Global block id of each local index
    pub blocks: Vec<BlockId>,
    pub succs: Adjacency,
    pub preds: Adjacency,
    pub entry: usize,
    index: HashMap<BlockId, usize>,
}

impl LocalGraph {
    /// Restrict the CFG to `function`'s blocks, keeping only local edges
    /// between members.
    pub fn new(cfg: &ControlFlowGraph, function: &Function) -> Self {
        let mut blocks: Vec<BlockId> = function.blocks.clone();
        if !blocks.contains(&function.entry) {
            blocks.push(function.entry);
        }
        let index: HashMap<BlockId, usize> =
            blocks.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let mut succs: Adjacency = vec![SmallVec::new(); blocks.len()];
        let mut preds: Adjacency = vec![SmallVec::new(); blocks.len()];
        for (i, &b) in blocks.iter().enumerate() {
            let Some(block) = cfg.block(b) else {
                continue;
            };
            for s in &block.successors {
                if let Some(&j) = index.get(s) {
                    succs[i].push(j);
                    preds[j].push(i);
                }
            }
        }
        let entry: usize = index.get(&function.entry).copied().unwrap_or(0);
        Self {
            blocks,
            succs,
            preds,
            entry,
            index,
        }
    }

    pub fn local(&self, id: BlockId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

/// Dominator tree.
#[derive(Debug, Clone)]
pub struct Dominators {
    root: usize,
    idom: Vec<usize>,
    rpo: Vec<usize>,
    rpo_number: Vec<usize>,
}

/// Reverse post-order of the nodes reachable from `root`.
fn reverse_post_order(root: usize, succs: &Adjacency) -> Vec<usize> {
    let mut visited: Vec<bool> = vec![false; succs.len()];
    let mut order: Vec<usize> = Vec::with_capacity(succs.len());
    // (node, next successor index)
    let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
    visited[root] = true;
    while let Some(top) = stack.last_mut() {
        let (node, i) = *top;
        if let Some(&s) = succs[node].get(i) {
            top.1 += 1;
            if !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            order.push(node);
            stack.pop();
        }
    }
    order.reverse();
    order
}

impl Dominators {
    pub(crate) fn compute(root: usize, succs: &Adjacency, preds: &Adjacency) -> Self {
        let n: usize = succs.len();
        let rpo: Vec<usize> = reverse_post_order(root, succs);
        let mut rpo_number: Vec<usize> = vec![UNDEFINED; n];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_number[b] = i;
        }

        let mut idom: Vec<usize> = vec![UNDEFINED; n];
        idom[root] = root;
        let mut changed: bool = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: usize = UNDEFINED;
                for &p in &preds[b] {
                    if idom[p] == UNDEFINED {
                        continue;
                    }
                    new_idom = if new_idom == UNDEFINED {
                        p
                    } else {
                        Self::intersect(&idom, &rpo_number, p, new_idom)
                    };
                }
                if new_idom != UNDEFINED && idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }
        Self {
            root,
            idom,
            rpo,
            rpo_number,
        }
    }

    fn intersect(idom: &[usize], rpo_number: &[usize], mut a: usize, mut b: usize) -> usize {
        while a != b {
            while rpo_number[a] > rpo_number[b] {
                a = idom[a];
            }
            while rpo_number[b] > rpo_number[a] {
                b = idom[b];
            }
        }
        a
    }

    /// Immediate dominator; `None` for the root and unreachable nodes.
    pub fn idom(&self, b: usize) -> Option<usize> {
        match self.idom.get(b) {
            Some(&d) if d != UNDEFINED && b != self.root => Some(d),
            _ => None,
        }
    }

    pub fn is_reachable(&self, b: usize) -> bool {
        self.rpo_number.get(b).is_some_and(|&n| n != UNDEFINED)
    }

    /// True if `a` dominates `b` (every node dominates itself).
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur: usize = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(d) => cur = d,
                None => return false,
            }
        }
    }

    /// Nodes reachable from the root, in reverse post-order.
    pub fn rpo(&self) -> &[usize] {
        &self.rpo
    }

    pub fn rpo_number(&self, b: usize) -> Option<usize> {
        self.rpo_number.get(b).copied().filter(|&n| n != UNDEFINED)
    }
}

/// Immediate post-dominators, computed on the reversed graph with a virtual exit.
///
/// `None` means the block joins only at function exit, or it cannot reach an
/// exit at all (inside an infinite loop).
pub fn post_dominators(graph: &LocalGraph) -> Vec<Option<usize>> {
    let n: usize = graph.len();
    let exit: usize = n;
    let mut rsuccs: Adjacency = graph.preds.clone();
    let mut rpreds: Adjacency = graph.succs.clone();
    rsuccs.push(SmallVec::new());
    rpreds.push(SmallVec::new());
    for b in 0..n {
        if graph.succs[b].is_empty() {
            rsuccs[exit].push(b);
            rpreds[b].push(exit);
        }
    }
    let tree = Dominators::compute(exit, &rsuccs, &rpreds);
    (0..n)
        .map(|b| tree.idom(b).filter(|&d| d != exit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn adjacency(n: usize, edges: &[(usize, usize)]) -> (Adjacency, Adjacency) {
        let mut succs: Adjacency = vec![SmallVec::new(); n];
        let mut preds: Adjacency = vec![SmallVec::new(); n];
        for &(a, b) in edges {
            succs[a].push(b);
            preds[b].push(a);
        }
        (succs, preds)
    }

    #[test]
    fn diamond_dominators() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let (succs, preds) = adjacency(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let doms = Dominators::compute(0, &succs, &preds);
        assert_eq!(doms.idom(0), None);
        assert_eq!(doms.idom(1), Some(0));
        assert_eq!(doms.idom(3), Some(0));
        assert!(doms.dominates(0, 3));
        assert!(!doms.dominates(1, 3));
        assert_eq!(doms.rpo()[0], 0);
    }

    #[test]
    fn loop_header_dominates_latch() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let (succs, preds) = adjacency(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let doms = Dominators::compute(0, &succs, &preds);
        assert!(doms.dominates(1, 2));
        assert_eq!(doms.idom(3), Some(2));
    }

    #[test]
    fn unreachable_node_has_no_idom() {
        let (succs, preds) = adjacency(3, &[(0, 1), (2, 1)]);
        let doms = Dominators::compute(0, &succs, &preds);
        assert_eq!(doms.idom(2), None);
        assert!(!doms.is_reachable(2));
        assert_eq!(doms.idom(1), Some(0));
    }

    #[test]
    fn post_dominator_of_diamond_is_join() {
        let (succs, preds) = adjacency(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let graph = LocalGraph {
            blocks: vec![0, 1, 2, 3],
            succs,
            preds,
            entry: 0,
            index: (0..4).map(|i| (i as BlockId, i)).collect(),
        };
        let ipdom = post_dominators(&graph);
        assert_eq!(ipdom, vec![Some(3), Some(3), Some(3), None]);
    }

    #[test]
    fn endless_loop_has_no_post_dominator() {
        let graph = LocalGraph {
            blocks: vec![0],
            succs: vec![smallvec![0]],
            preds: vec![smallvec![0]],
            entry: 0,
            index: HashMap::from([(0, 0)]),
        };
        assert_eq!(post_dominators(&graph), vec![None]);
    }
}
