//! Dead code elimination (§4.6): a whole-function "unused definition" pass
//! run to convergence, followed by a block-local "dead store" pass also run
//! to convergence. Unlike [`crate::licm`], this is not gated on
//! [`Instruction::can_have_side_effects`] — that predicate exists to keep
//! speculative *hoisting* safe; a definition nobody reads is dead code
//! regardless of what computing it might have done.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{Function, Instruction};

/// One left-to-right scan over every block in order. `used` accumulates
/// every variable name read as an `arg` so far; `candidates` holds the
/// latest not-yet-used definition site of each name, overwritten whenever
/// that name is redefined. A name that's appeared in `used` even once is
/// exempt from candidacy for the rest of the scan, even across later
/// redefinitions — this is what keeps a back-edge, where a use can
/// textually precede the definition it targets within the same linear
/// scan, from being misread as dead.
fn global_dce_pass(func: &Function) -> BTreeSet<(usize, usize)> {
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut candidates: BTreeMap<String, (usize, usize)> = BTreeMap::new();

    for (block_idx, block) in func.blocks.iter().enumerate() {
        for (instr_idx, instr) in block.iter().enumerate() {
            for arg in instr.args() {
                used.insert(arg.clone());
                candidates.remove(arg.as_str());
            }
            if let Some(dest) = instr.dest() {
                if !used.contains(dest) {
                    candidates.insert(dest.to_string(), (block_idx, instr_idx));
                }
            }
        }
    }

    candidates.into_values().collect()
}

fn global_dce_to_fixed_point(func: &Function) -> Function {
    let mut current = func.copy();
    let mut round = 0usize;

    loop {
        round += 1;
        let dead = global_dce_pass(&current);
        if dead.is_empty() {
            log::debug!("dce: `{}` global pass reached fixed point after {round} round(s)", func.name);
            return current;
        }
        log::debug!("dce: `{}` global pass round {round} removed {} instruction(s)", func.name, dead.len());
        current = current.filter_copy(&dead);
    }
}

/// Within one block, a definition overwritten before any use of it is a
/// dead store. A single forward scan catches chains of these:
/// `x = 1; x = 2; x = 3;` marks both `x = 1` and `x = 2` dead in one pass,
/// since each redefinition both records the kill of the previous one and
/// becomes the new unconsumed definition in turn.
fn local_dead_stores(block: &[Instruction]) -> BTreeSet<usize> {
    let mut dead = BTreeSet::new();
    let mut unread_def: BTreeMap<&str, usize> = BTreeMap::new();

    for (idx, instr) in block.iter().enumerate() {
        for arg in instr.args() {
            unread_def.remove(arg.as_str());
        }
        if let Some(dest) = instr.dest() {
            if let Some(&prev_idx) = unread_def.get(dest) {
                dead.insert(prev_idx);
            }
            unread_def.insert(dest, idx);
        }
    }

    dead
}

fn local_dce_to_fixed_point(func: &Function) -> Function {
    let mut current = func.copy();
    let mut round = 0usize;

    loop {
        round += 1;
        let mut dead: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (block_idx, block) in current.blocks.iter().enumerate() {
            for instr_idx in local_dead_stores(block) {
                dead.insert((block_idx, instr_idx));
            }
        }

        if dead.is_empty() {
            log::debug!("dce: `{}` local pass reached fixed point after {round} round(s)", func.name);
            return current;
        }
        log::debug!("dce: `{}` local pass round {round} removed {} instruction(s)", func.name, dead.len());
        current = current.filter_copy(&dead);
    }
}

/// Runs global dead-definition elimination to convergence, then local
/// dead-store elimination to convergence (§4.6's composition order — the
/// local pass runs second because it catches same-block shadowing the
/// global pass's name-level bookkeeping can lose track of).
pub fn dead_code_elimination(func: &Function) -> Function {
    let after_global = global_dce_to_fixed_point(func);
    local_dce_to_fixed_point(&after_global)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::ir::{ConstInstr, EffectInstr, Param, ValueInstr};

    fn value(dest: &str, op: &str, args: &[&str]) -> Instruction {
        Instruction::Value(ValueInstr {
            dest: dest.to_string(),
            ty: serde_json::json!("int"),
            op: op.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            funcs: Vec::new(),
        })
    }

    fn constant(dest: &str, v: i64) -> Instruction {
        Instruction::Const(ConstInstr {
            dest: dest.to_string(),
            ty: serde_json::json!("int"),
            value: serde_json::json!(v),
        })
    }

    fn effect(op: &str, args: &[&str], labels: &[&str]) -> Instruction {
        Instruction::Effect(EffectInstr {
            op: op.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            funcs: Vec::new(),
        })
    }

    // `a=1; a=2; b=3; a=add a a; b=id a; print b`
    // collapses to `a=2; a=add a a; b=id a; print b`.
    #[test]
    fn s5_dead_stores_and_unused_definition_removed() {
        let instrs = vec![
            constant("a", 1),
            constant("a", 2),
            constant("b", 3),
            value("a", "add", &["a", "a"]),
            value("b", "id", &["a"]),
            effect("print", &["b"], &[]),
            effect("ret", &[], &[]),
        ];
        let f = Function::new("main", vec![], instrs).unwrap();
        let out = dead_code_elimination(&f);
        let block = &out.blocks[0];

        let as_: Vec<&Instruction> = block.iter().filter(|i| i.dest() == Some("a")).collect();
        assert_eq!(as_.len(), 2);
        assert_eq!(as_[0].args(), &Vec::<String>::new());
        assert_eq!(as_[1].op(), Some("add"));

        let bs: Vec<&Instruction> = block.iter().filter(|i| i.dest() == Some("b")).collect();
        assert_eq!(bs.len(), 1);
        assert_eq!(bs[0].op(), Some("id"));
    }

    #[test]
    fn unused_side_effecting_value_op_is_still_removed() {
        // can_have_side_effects only gates LICM's speculative hoisting; an
        // unused result is dead code regardless of what computing it did.
        let instrs = vec![
            constant("zero", 0),
            value("q", "div", &["zero", "zero"]),
            effect("ret", &[], &[]),
        ];
        let f = Function::new("main", vec![], instrs).unwrap();
        let out = dead_code_elimination(&f);
        assert!(!out.blocks[0].iter().any(|i| i.dest() == Some("q")));
    }

    #[test]
    fn dce_is_idempotent() {
        let instrs = vec![
            constant("unused", 1),
            constant("x", 1),
            value("y", "id", &["x"]),
            effect("print", &["y"], &[]),
            effect("ret", &[], &[]),
        ];
        let f = Function::new("main", vec![], instrs).unwrap();
        let once = dead_code_elimination(&f);
        let twice = dead_code_elimination(&once);
        assert_eq!(once.blocks, twice.blocks);
    }

    #[test]
    fn cross_block_unused_definition_is_removed() {
        let instrs = vec![
            constant("unused", 7),
            crate::ir::mkjmp("next"),
            crate::ir::mklabel("next"),
            effect("ret", &[], &[]),
        ];
        let f = Function::new("main", vec![], instrs).unwrap();
        let out = dead_code_elimination(&f);
        assert!(!out.to_instrs().iter().any(|i| i.dest() == Some("unused")));
    }

    #[test]
    fn use_preceding_definition_across_a_back_edge_is_not_mistaken_for_dead() {
        // `v` is read in the header before the body's `jmp` back to it
        // redefines it — textually the read comes first in the scan order,
        // but `v` must survive because the loop does eventually read it.
        let instrs = vec![
            constant("v", 0),
            crate::ir::mkjmp("loop"),
            crate::ir::mklabel("loop"),
            effect("print", &["v"], &[]),
            value("cond", "id", &["v"]),
            effect("br", &["cond"], &["body", "exit"]),
            crate::ir::mklabel("body"),
            value("v", "add", &["v", "v"]),
            crate::ir::mkjmp("loop"),
            crate::ir::mklabel("exit"),
            effect("ret", &[], &[]),
        ];
        let f = Function::new("main", vec![], instrs).unwrap();
        let out = dead_code_elimination(&f);
        assert!(out.to_instrs().iter().any(|i| i.dest() == Some("v") && i.op() == Some("add")));
    }

    #[test]
    fn unused_param_is_not_a_candidate_for_removal() {
        // Params have no defining instruction of their own; DCE only ever
        // considers instructions, so an unused parameter is simply left alone.
        let instrs = vec![effect("ret", &[], &[])];
        let f = Function::new(
            "main",
            vec![Param { name: "unused".to_string(), ty: serde_json::json!("int") }],
            instrs,
        )
        .unwrap();
        let out = dead_code_elimination(&f);
        assert_eq!(out.params.len(), 1);
    }
}
