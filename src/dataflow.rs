//! Generic forward-dataflow worklist solver (§4.3), independent of any
//! particular analysis. [`reaching_defs`] is the one concrete instance this
//! crate ships; liveness or available-expressions would be additional
//! `DataflowAnalysis` impls that never have to touch [`solve`] itself.

use std::collections::VecDeque;

use crate::ir::Function;

pub mod reaching_defs;

/// A forward dataflow analysis over a [`Function`]'s CFG: a lattice fact
/// type, plus the three operations the worklist solver needs to drive it to
/// a fixed point.
pub trait DataflowAnalysis {
    type Fact: Clone + PartialEq;

    /// The starting fact for every block, before any iteration.
    fn init(&self, func: &Function) -> Self::Fact;

    /// Computes the out-fact of a block from its in-fact.
    fn transfer(&self, func: &Function, block_idx: usize, in_fact: &Self::Fact) -> Self::Fact;

    /// Combines the out-facts of a block's predecessors (plus its current
    /// in-fact) into a new in-fact.
    fn merge(&self, vals: &[&Self::Fact]) -> Self::Fact;

    /// Runs [`solve`] for this analysis.
    fn solve(&self, func: &Function) -> Vec<Self::Fact>
    where
        Self: Sized,
    {
        solve(self, func)
    }
}

/// The transpose of `block_exits`: `preds[b]` lists every block with an edge
/// into `b`. Out-of-range successors (there shouldn't be any once a
/// [`Function`] has gone through its sentinel-block construction) are
/// ignored rather than indexed.
pub fn predecessors(block_exits: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = block_exits.len();
    let mut preds = vec![Vec::new(); n];
    for (b, exits) in block_exits.iter().enumerate() {
        for &succ in exits {
            if succ < n {
                preds[succ].push(b);
            }
        }
    }
    preds
}

/// Solves `analysis` over `func` with the classic worklist algorithm
/// (§4.3): seed every block, repeatedly merge-then-transfer, and requeue
/// successors whenever a block's out-fact changes, until the queue drains.
///
/// Termination depends on `merge`/`transfer` being monotone over a
/// finite-height lattice — the caller's analysis is responsible for that,
/// the solver itself has no way to check it.
pub fn solve<A: DataflowAnalysis + ?Sized>(analysis: &A, func: &Function) -> Vec<A::Fact> {
    let n = func.blocks.len();
    let preds = predecessors(&func.block_exits);

    let mut in_facts: Vec<A::Fact> = (0..n).map(|_| analysis.init(func)).collect();
    let mut out_facts: Vec<A::Fact> = (0..n).map(|_| analysis.init(func)).collect();

    let mut queued = vec![true; n];
    let mut worklist: VecDeque<usize> = (0..n).collect();
    let mut visits = 0usize;

    while let Some(b) = worklist.pop_front() {
        queued[b] = false;
        visits += 1;
        log::trace!("dataflow: visiting block {b} ({} left in worklist)", worklist.len());

        let mut merge_inputs: Vec<&A::Fact> = preds[b].iter().map(|&p| &out_facts[p]).collect();
        merge_inputs.push(&in_facts[b]);
        let new_in = analysis.merge(&merge_inputs);
        in_facts[b] = new_in;

        let new_out = analysis.transfer(func, b, &in_facts[b]);
        if new_out != out_facts[b] {
            out_facts[b] = new_out;
            for &succ in &func.block_exits[b] {
                if succ < n && !queued[succ] {
                    queued[succ] = true;
                    worklist.push_back(succ);
                }
            }
        }
    }

    log::debug!("dataflow: reached fixed point after {visits} block visits");
    out_facts
}
