//! Reaching definitions: the one concrete [`DataflowAnalysis`] instance this
//! crate ships. The lattice is a map from variable name to the set of
//! definition sites that could still reach a use of it; join is pointwise
//! union.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{DefSite, Function};

use super::DataflowAnalysis;

/// var name -> set of definition sites that may reach this point.
pub type Fact = BTreeMap<String, BTreeSet<DefSite>>;

pub struct ReachingDefs;

impl DataflowAnalysis for ReachingDefs {
    type Fact = Fact;

    fn init(&self, func: &Function) -> Fact {
        func.params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), BTreeSet::from([DefSite::Param(i)])))
            .collect()
    }

    fn transfer(&self, func: &Function, block_idx: usize, in_fact: &Fact) -> Fact {
        let mut out = in_fact.clone();
        for (instr_idx, instr) in func.blocks[block_idx].iter().enumerate() {
            if let Some(dest) = instr.dest() {
                // kill-then-gen: the new definition replaces whatever
                // reached this point before it.
                out.insert(
                    dest.to_string(),
                    BTreeSet::from([DefSite::Instr(block_idx, instr_idx)]),
                );
            }
        }
        out
    }

    fn merge(&self, vals: &[&Fact]) -> Fact {
        let mut merged: Fact = BTreeMap::new();
        for val in vals {
            for (var, defs) in val.iter() {
                merged.entry(var.clone()).or_default().extend(defs.iter().copied());
            }
        }
        merged
    }
}

/// Reaching definitions at the end (`out`) of every block of `func`.
pub fn reaching_defs(func: &Function) -> Vec<Fact> {
    ReachingDefs.solve(func)
}

/// Reaching definitions at the start (`in`) of every block of `func`. Built
/// from the already-converged `out` facts with one extra merge pass rather
/// than threading a second set of facts through [`super::solve`] — at a
/// fixed point `in[b]` is exactly the merge of every predecessor's `out`.
pub fn reaching_defs_in(func: &Function) -> Vec<Fact> {
    let out = reaching_defs(func);
    let preds = super::predecessors(&func.block_exits);
    let analysis = ReachingDefs;

    (0..func.blocks.len())
        .map(|b| {
            if preds[b].is_empty() {
                analysis.init(func)
            } else {
                let refs: Vec<&Fact> = preds[b].iter().map(|&p| &out[p]).collect();
                analysis.merge(&refs)
            }
        })
        .collect()
}
