//! Structural CFG analyses that don't need a dataflow fixed point (§4.4):
//! post/topological order, dominators, the dominator tree, natural-loop
//! extraction, and reducibility. These all operate directly on a CFG's
//! adjacency list (`block_exits`-shaped) rather than on a [`crate::ir::Function`],
//! so they compose freely with anything that can produce one.

use std::collections::{BTreeSet, VecDeque};

use crate::commons::IrError;
use crate::dataflow::predecessors;
use crate::ir::BlockId;

/// Depth-first post-order over `cfg`, retrying every index as a potential
/// unvisited root so unreachable blocks are still included. Explicit-stack
/// rather than native recursion, so a long chain of blocks can't overflow
/// the call stack (§9).
pub fn post_order(cfg: &[Vec<BlockId>]) -> Vec<BlockId> {
    let n = cfg.len();
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);

    for root in 0..n {
        if visited[root] {
            continue;
        }
        let mut stack: Vec<(BlockId, usize)> = vec![(root, 0)];
        visited[root] = true;
        while let Some(&mut (node, ref mut next_child)) = stack.last_mut() {
            if *next_child < cfg[node].len() {
                let succ = cfg[node][*next_child];
                *next_child += 1;
                if !visited[succ] {
                    visited[succ] = true;
                    stack.push((succ, 0));
                }
            } else {
                order.push(node);
                stack.pop();
            }
        }
    }

    order
}

pub fn topological_order(cfg: &[Vec<BlockId>]) -> Vec<BlockId> {
    let mut order = post_order(cfg);
    order.reverse();
    order
}

/// The transpose of `cfg`. A thin re-export of [`crate::dataflow::predecessors`]
/// under the name this family of analyses knows it by.
pub fn predecessor_map(cfg: &[Vec<BlockId>]) -> Vec<Vec<BlockId>> {
    predecessors(cfg)
}

fn intersect(sets: &[&BTreeSet<BlockId>]) -> BTreeSet<BlockId> {
    let mut iter = sets.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    let mut acc = (*first).clone();
    for s in iter {
        acc = acc.intersection(s).copied().collect();
    }
    acc
}

/// Iterative dominator computation (§4.4). `dom[0] = {0}`; every other node
/// starts at the full node set and shrinks to the intersection of its
/// predecessors' dominator sets (plus itself) until a pass changes nothing.
pub fn dominators(cfg: &[Vec<BlockId>]) -> Vec<BTreeSet<BlockId>> {
    let n = cfg.len();
    let all: BTreeSet<BlockId> = (0..n).collect();
    let mut dom: Vec<BTreeSet<BlockId>> = (0..n)
        .map(|i| if i == 0 { BTreeSet::from([0]) } else { all.clone() })
        .collect();
    let preds = predecessor_map(cfg);

    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            if preds[i].is_empty() {
                continue;
            }
            let pred_sets: Vec<&BTreeSet<BlockId>> = preds[i].iter().map(|&p| &dom[p]).collect();
            let mut d = intersect(&pred_sets);
            d.insert(i);
            if d != dom[i] {
                dom[i] = d;
                changed = true;
            }
        }
    }

    dom
}

/// The dominator tree as a parallel list of child sets. Every non-entry
/// node has at most one predecessor that also dominates it; that
/// predecessor is its immediate dominator and parent in the tree.
pub fn dominator_tree(cfg: &[Vec<BlockId>]) -> Result<Vec<BTreeSet<BlockId>>, IrError> {
    let preds = predecessor_map(cfg);
    let dom = dominators(cfg);
    let mut tree = vec![BTreeSet::new(); cfg.len()];

    for (idx, doms) in dom.iter().enumerate() {
        let pred_set: BTreeSet<BlockId> = preds[idx].iter().copied().collect();
        let parent_candidates: BTreeSet<BlockId> = doms.intersection(&pred_set).copied().collect();
        if parent_candidates.len() > 1 {
            return Err(IrError::InvariantViolation(format!(
                "node {idx} has {} dominator-tree parent candidates: {parent_candidates:?}",
                parent_candidates.len()
            )));
        }
        if let Some(&parent) = parent_candidates.iter().next() {
            tree[parent].insert(idx);
        }
    }

    Ok(tree)
}

/// Classifies `cfg`'s edges with an explicit-stack DFS (white/gray/black)
/// and returns every back-edge found, as `(tail, header)` pairs — an edge
/// `tail -> header` where `header` is gray (an ancestor still on the
/// current DFS path) when the edge is traversed.
fn back_edges(cfg: &[Vec<BlockId>]) -> Vec<(BlockId, BlockId)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let n = cfg.len();
    let mut color = vec![Color::White; n];
    let mut edges = Vec::new();

    for root in 0..n {
        if color[root] != Color::White {
            continue;
        }
        let mut stack: Vec<(BlockId, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;
        while let Some(&mut (node, ref mut next_child)) = stack.last_mut() {
            if *next_child < cfg[node].len() {
                let succ = cfg[node][*next_child];
                *next_child += 1;
                match color[succ] {
                    Color::White => {
                        color[succ] = Color::Gray;
                        stack.push((succ, 0));
                    }
                    Color::Gray => edges.push((node, succ)),
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }

    edges
}

/// Given a back-edge `tail -> header`, returns the minimal natural loop
/// (header and every node that can reach `tail` without leaving the loop),
/// or `NotANaturalLoop` if `header` doesn't dominate `tail`.
fn extract_loop(
    doms: &[BTreeSet<BlockId>],
    preds: &[Vec<BlockId>],
    header: BlockId,
    tail: BlockId,
) -> Result<BTreeSet<BlockId>, IrError> {
    if !doms[tail].contains(&header) {
        return Err(IrError::NotANaturalLoop { header, tail });
    }

    let mut loop_nodes = BTreeSet::new();
    let mut queue = VecDeque::from([tail]);
    while let Some(node) = queue.pop_front() {
        if !loop_nodes.insert(node) {
            continue;
        }
        if node == header {
            continue;
        }
        for &pred in &preds[node] {
            if !loop_nodes.contains(&pred) {
                queue.push_back(pred);
            }
        }
    }

    Ok(loop_nodes)
}

/// All natural loops in `cfg`, as `(header, loop_nodes)` pairs — one per
/// back-edge that forms a natural loop. A back-edge whose head doesn't
/// dominate its tail is skipped rather than propagated as an error.
pub fn extract_natural_loops(cfg: &[Vec<BlockId>]) -> Vec<(BlockId, BTreeSet<BlockId>)> {
    let doms = dominators(cfg);
    let preds = predecessor_map(cfg);

    back_edges(cfg)
        .into_iter()
        .filter_map(|(tail, header)| extract_loop(&doms, &preds, header, tail).ok().map(|nodes| (header, nodes)))
        .collect()
}

/// A CFG is reducible iff every back-edge DFS discovers forms a natural
/// loop.
pub fn is_cfg_reducible(cfg: &[Vec<BlockId>]) -> bool {
    let doms = dominators(cfg);
    let preds = predecessor_map(cfg);

    back_edges(cfg)
        .into_iter()
        .all(|(tail, header)| extract_loop(&doms, &preds, header, tail).is_ok())
}
