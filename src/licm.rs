//! Loop-invariant code motion (§4.7): find natural loops, mark
//! loop-invariant instructions to a fixed point, keep the subset that's
//! safe to hoist, and splice a preheader block in front of the loop to hold
//! them.
//!
//! This is the one pass in the crate that mutates structure rather than
//! just instruction lists — it appends a preheader block as a new trailing
//! block, so every other block keeps its index. It only ever operates on a
//! [`Function`] it already owns a clone of; nothing here mutates a caller's
//! function in place.

use std::collections::{BTreeMap, BTreeSet};

use crate::dataflow::reaching_defs::{reaching_defs_in, Fact as ReachingFact};
use crate::global_analysis;
use crate::ir::{mkjmp, mklabel, BlockId, DefSite, Function, Instruction, LabelName};

/// Runs LICM in a single pass (§4.7's algorithm is a one-shot traversal of
/// the natural loops found in the cloned function, not a repeated
/// whole-function fixed point): dominators, reaching-defs and the loop list
/// are all computed once up front, then each loop is hoisted from in turn,
/// splicing its preheader into the function as it goes. A later loop's
/// recorded block indices stay valid across an earlier loop's splice
/// because [`splice_preheader`] only ever appends a trailing block — it
/// never renumbers existing ones.
pub fn loop_invariant_code_motion(func: &Function) -> Function {
    let mut current = func.copy();
    let dom = global_analysis::dominators(&current.block_exits);
    let in_facts = reaching_defs_in(&current);
    let loops = global_analysis::extract_natural_loops(&current.block_exits);

    for (header, nodes) in &loops {
        let Some(header_label) = header_label_of(&current, *header) else {
            continue;
        };

        let before = facts_before_each_instr(&current, nodes, &in_facts);
        let li = mark_loop_invariant(&current, nodes, &before);
        let def_uses = collect_loop_def_uses(&current, nodes, &before);
        let movable = filter_movable(&current, &li, &def_uses, &dom);

        if movable.is_empty() {
            continue;
        }

        let order = global_analysis::topological_order(&current.block_exits);
        let rank: BTreeMap<BlockId, usize> = order.iter().enumerate().map(|(r, &b)| (b, r)).collect();
        let mut ordered: Vec<(BlockId, usize)> = movable.iter().copied().collect();
        ordered.sort_by_key(|&(b, i)| (rank[&b], i));
        let hoisted_instrs: Vec<Instruction> = ordered.iter().map(|&(b, i)| current.blocks[b][i].clone()).collect();

        log::info!(
            "licm: hoisted {} instruction(s) out of loop `{header_label}` in `{}`",
            hoisted_instrs.len(),
            current.name
        );
        current = splice_preheader(&current, *header, hoisted_instrs);
    }

    current
}

fn header_label_of(func: &Function, header: BlockId) -> Option<LabelName> {
    func.label_index.iter().find(|(_, &idx)| idx == header).map(|(name, _)| name.clone())
}

/// The reaching-definitions fact in effect immediately before each
/// instruction inside the loop, derived by replaying each block's own
/// kill-then-gen transfer instruction-by-instruction from its (already
/// fixed-point) in-fact. Shared between [`mark_loop_invariant`] (to decide
/// whether an argument's reaching defs are all loop-external or already
/// invariant) and [`collect_loop_def_uses`] (to attribute each use to the
/// specific definition site(s) it can see, per §4.7.3).
fn facts_before_each_instr(
    func: &Function,
    loop_nodes: &BTreeSet<BlockId>,
    in_facts: &[ReachingFact],
) -> BTreeMap<(BlockId, usize), ReachingFact> {
    let mut before: BTreeMap<(BlockId, usize), ReachingFact> = BTreeMap::new();
    for &b in loop_nodes {
        let mut running = in_facts[b].clone();
        for (i, instr) in func.blocks[b].iter().enumerate() {
            before.insert((b, i), running.clone());
            if let Some(dest) = instr.dest() {
                running.insert(dest.to_string(), BTreeSet::from([DefSite::Instr(b, i)]));
            }
        }
    }
    before
}

/// An instruction is loop-invariant if every argument it reads is either a
/// parameter, defined outside the loop, or itself already known
/// loop-invariant. Computed as a fixed point since invariance can chain
/// (`a` invariant lets a use of `a` be invariant too).
fn mark_loop_invariant(
    func: &Function,
    loop_nodes: &BTreeSet<BlockId>,
    before: &BTreeMap<(BlockId, usize), ReachingFact>,
) -> BTreeSet<(BlockId, usize)> {
    let mut li: BTreeSet<(BlockId, usize)> = BTreeSet::new();
    let mut changed = true;
    while changed {
        changed = false;
        for &b in loop_nodes {
            for (i, instr) in func.blocks[b].iter().enumerate() {
                if li.contains(&(b, i)) || instr.dest().is_none() {
                    continue;
                }
                let fact = &before[&(b, i)];
                let all_invariant = instr.args().iter().all(|arg| {
                    fact.get(arg).is_some_and(|defs| {
                        defs.iter().all(|d| match d {
                            DefSite::Param(_) => true,
                            DefSite::Instr(db, di) => !loop_nodes.contains(db) || li.contains(&(*db, *di)),
                        })
                    })
                });
                if all_invariant {
                    li.insert((b, i));
                    changed = true;
                }
            }
        }
    }

    li
}

/// For every in-loop use of an argument, attributes that use to whichever
/// in-loop definition site(s) reach it there (§4.7.3's `var_uses[(db, di,
/// a)]`, collapsed to keying on the def site alone since a site's own
/// instruction already fixes which variable `a` it defines). A variable
/// with more than one reaching def at a use site (a real possibility in
/// this non-SSA IR once a block has been re-entered) attributes that use to
/// every one of them, which only makes each candidate definition's
/// dominance requirement stricter, never unsound.
fn collect_loop_def_uses(
    func: &Function,
    loop_nodes: &BTreeSet<BlockId>,
    before: &BTreeMap<(BlockId, usize), ReachingFact>,
) -> BTreeMap<(BlockId, usize), BTreeSet<BlockId>> {
    let mut uses: BTreeMap<(BlockId, usize), BTreeSet<BlockId>> = BTreeMap::new();
    for &b in loop_nodes {
        for (i, instr) in func.blocks[b].iter().enumerate() {
            let fact = &before[&(b, i)];
            for arg in instr.args() {
                let Some(defs) = fact.get(arg) else { continue };
                for d in defs {
                    if let DefSite::Instr(db, di) = d {
                        if loop_nodes.contains(db) {
                            uses.entry((*db, *di)).or_default().insert(b);
                        }
                    }
                }
            }
        }
    }
    uses
}

/// Of the loop-invariant instructions, only those that (a) can't have a
/// side effect, (b) have at least one use inside the loop, and (c) are
/// defined in a block that dominates every one of those in-loop uses are
/// safe to hoist — (c) is what guarantees moving the definition to the
/// preheader doesn't change which value reaches a use.
fn filter_movable(
    func: &Function,
    li: &BTreeSet<(BlockId, usize)>,
    def_uses: &BTreeMap<(BlockId, usize), BTreeSet<BlockId>>,
    dom: &[BTreeSet<BlockId>],
) -> BTreeSet<(BlockId, usize)> {
    let mut movable = BTreeSet::new();
    for &(b, i) in li {
        let instr = &func.blocks[b][i];
        if instr.can_have_side_effects() {
            continue;
        }
        if instr.dest().is_none() {
            continue;
        }
        let Some(uses) = def_uses.get(&(b, i)) else { continue };
        if uses.is_empty() {
            continue;
        }
        if uses.iter().all(|&ub| dom[ub].contains(&b)) {
            movable.insert((b, i));
        }
    }
    movable
}

/// Builds the `__preheader_<header label>` block, copies `hoisted_instrs`
/// into it in dependency order followed by a jump to the header, and
/// appends it as a new trailing block (§4.7.6, matching the reference
/// `_add_preheader_block`'s `func.blocks.append(preheader)`) rather than
/// inserting it before `header` — every other block keeps its index, which
/// is what lets a single LICM pass splice several loops' preheaders in
/// turn without invalidating the next loop's recorded block indices. Every
/// predecessor of the header — including the loop's own back-edge(s) — is
/// redirected to the new preheader instead; the originals of
/// `hoisted_instrs` are left untouched in the loop body.
fn splice_preheader(func: &Function, header: BlockId, hoisted_instrs: Vec<Instruction>) -> Function {
    let header_label = header_label_of(func, header).expect("a natural loop's header always carries a label");
    let preheader_label = format!("__preheader_{header_label}");

    // The hoisted instructions are copied into the preheader; their
    // originals are left in place in the loop body (§4.7.5), so this
    // splices against an unmodified clone rather than a filtered one.
    let cloned = func.copy();
    let mut blocks = cloned.blocks;
    let mut block_exits = cloned.block_exits;
    let mut label_index = cloned.label_index;

    // Every predecessor of the header is retargeted, including the loop's
    // own back-edge(s) — §4.7.6 applies to "every existing block ending in
    // jmp or br", with no loop-membership filter.
    let all_preds: Vec<BlockId> = crate::dataflow::predecessors(&block_exits)[header].clone();

    let preheader_id = blocks.len();
    let mut preheader_body = Vec::with_capacity(hoisted_instrs.len() + 2);
    preheader_body.push(mklabel(preheader_label.clone()));
    preheader_body.extend(hoisted_instrs);
    preheader_body.push(mkjmp(header_label.clone()));

    for &pred in &all_preds {
        for e in block_exits[pred].iter_mut() {
            if *e == header {
                *e = preheader_id;
            }
        }
        retarget_labels(&mut blocks[pred], &header_label, &preheader_label);
    }

    blocks.push(preheader_body);
    block_exits.push(vec![header]);
    label_index.insert(preheader_label, preheader_id);

    Function { name: cloned.name, params: cloned.params, blocks, label_index, block_exits }
}

fn retarget_labels(block: &mut [Instruction], old: &str, new: &str) {
    for instr in block.iter_mut() {
        if let Instruction::Effect(e) = instr {
            for label in e.labels.iter_mut() {
                if label == old {
                    *label = new.to_string();
                }
            }
        }
    }
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

    // `inv = add a b` only reads things defined outside
    // the loop, so a copy of it should be hoisted into a fresh preheader
    // (the original stays in the body — §4.7.5 never removes it); `bad =
    // div x y` is flagged side-effecting and must stay put even though it's
    // otherwise loop-invariant by the same reasoning.
    fn loop_with_invariant_and_side_effecting() -> Function {
        let instrs = vec![
            constant("a", 1),
            constant("b", 2),
            constant("x", 10),
            constant("y", 2),
            constant("i", 0),
            mkjmp("loop"),
            mklabel("loop"),
            value("cond", "lt", &["i", "x"]),
            effect("br", &["cond"], &["body", "exit"]),
            mklabel("body"),
            value("inv", "add", &["a", "b"]),
            value("bad", "div", &["x", "y"]),
            value("sum", "add", &["inv", "bad"]),
            value("i", "add", &["i", "a"]),
            mkjmp("loop"),
            mklabel("exit"),
            effect("print", &["sum"], &[]),
            effect("ret", &[], &[]),
        ];
        Function::new("main", vec![], instrs).unwrap()
    }

    #[test]
    fn s7_invariant_addition_is_hoisted_into_a_preheader() {
        let f = loop_with_invariant_and_side_effecting();
        let out = loop_invariant_code_motion(&f);

        let preheader_label = "__preheader_loop";
        assert!(out.label_index.contains_key(preheader_label));
        let preheader = &out.blocks[out.label_index[preheader_label]];
        assert!(preheader.iter().any(|i| i.dest() == Some("inv")));

        // §4.7.5: removal is not performed by this pass — the original
        // hoisted instruction remains in the loop body.
        let body = &out.blocks[out.label_index["body"]];
        assert!(body.iter().any(|i| i.dest() == Some("inv")));
    }

    #[test]
    fn s7_side_effecting_division_is_never_hoisted() {
        let f = loop_with_invariant_and_side_effecting();
        let out = loop_invariant_code_motion(&f);

        let body = &out.blocks[out.label_index["body"]];
        assert!(body.iter().any(|i| i.dest() == Some("bad")));

        if let Some(preheader_idx) = out.label_index.get("__preheader_loop") {
            assert!(!out.blocks[*preheader_idx].iter().any(|i| i.dest() == Some("bad")));
        }
    }

    #[test]
    fn preheader_unconditionally_jumps_to_the_header() {
        let f = loop_with_invariant_and_side_effecting();
        let out = loop_invariant_code_motion(&f);

        let preheader_idx = out.label_index["__preheader_loop"];
        let header_idx = out.label_index["loop"];
        assert_eq!(out.block_exits[preheader_idx], vec![header_idx]);
    }

    #[test]
    fn function_without_loops_is_unchanged() {
        let instrs = vec![constant("x", 1), effect("print", &["x"], &[]), effect("ret", &[], &[])];
        let f = Function::new("straight_line", vec![], instrs).unwrap();
        let out = loop_invariant_code_motion(&f);
        assert_eq!(out.blocks, f.blocks);
        assert_eq!(out.block_exits, f.block_exits);
    }

    #[test]
    fn loop_with_nothing_invariant_is_left_alone() {
        let instrs = vec![
            constant("i", 0),
            constant("n", 10),
            mkjmp("loop"),
            mklabel("loop"),
            value("cond", "lt", &["i", "n"]),
            effect("br", &["cond"], &["body", "exit"]),
            mklabel("body"),
            value("i", "add", &["i", "i"]),
            mkjmp("loop"),
            mklabel("exit"),
            effect("ret", &[], &[]),
        ];
        let f = Function::new("counter", vec![], instrs).unwrap();
        let out = loop_invariant_code_motion(&f);
        assert!(!out.label_index.contains_key("__preheader_loop"));
        assert_eq!(out.num_blocks(), f.num_blocks());
    }

    #[test]
    fn hoisted_parameter_derived_constant_respects_dependency_order() {
        // `k = add a a` then `m = add k k`: both invariant, `m` depends on
        // `k`, so `k` must land before `m` in the preheader.
        let instrs = vec![
            constant("a", 3),
            constant("i", 0),
            constant("n", 5),
            mkjmp("loop"),
            mklabel("loop"),
            value("cond", "lt", &["i", "n"]),
            effect("br", &["cond"], &["body", "exit"]),
            mklabel("body"),
            value("k", "add", &["a", "a"]),
            value("m", "add", &["k", "k"]),
            value("i", "add", &["i", "m"]),
            mkjmp("loop"),
            mklabel("exit"),
            effect("ret", &[], &[]),
        ];
        let f = Function::new("f", vec![Param { name: "a".to_string(), ty: serde_json::json!("int") }], instrs)
            .unwrap();
        let out = loop_invariant_code_motion(&f);

        let preheader = &out.blocks[out.label_index["__preheader_loop"]];
        let k_pos = preheader.iter().position(|i| i.dest() == Some("k"));
        let m_pos = preheader.iter().position(|i| i.dest() == Some("m"));
        if let (Some(k_pos), Some(m_pos)) = (k_pos, m_pos) {
            assert!(k_pos < m_pos);
        }
    }
}
