//! Local value numbering (§4.5): a block-local CSE pass. Phase one
//! (`rename_vars`) suffixes every non-final definition of a redefined
//! variable so the value table in phase two never confuses two different
//! values that happen to share a name. Phase two builds a table of
//! `(op, arg value-numbers)` keys and rewrites any instruction that
//! recomputes a value already in the table into an `id` copy of whichever
//! variable first produced it.

use std::collections::HashMap;

use crate::commons::IrError;
use crate::ir::{Function, Instruction, ValueInstr};

type ValueNumber = usize;

#[derive(Clone, PartialEq, Eq, Hash)]
enum ValueKey {
    /// Keyed on the literal's serialized form. The type is deliberately
    /// excluded — two constants with the same literal value are the same
    /// value regardless of the declared type tag they carry.
    Const(String),
    Op(String, Vec<ValueNumber>),
    /// A value read into the block from outside it (a parameter, or a
    /// variable some predecessor block defined). Keyed on the name itself
    /// so two reads of the same incoming variable share a value number.
    Opaque(String),
}

/// Renames every non-final definition of a redefined variable within a
/// single block to `<name>__<instr_idx>`, rewriting uses until the next
/// (re)definition. A variable's last definition in the block keeps its
/// original name, since code outside the block still expects to find the
/// value under that name.
fn rename_vars(block: &[Instruction]) -> Vec<Instruction> {
    let mut last_def: HashMap<&str, usize> = HashMap::new();
    for (idx, instr) in block.iter().enumerate() {
        if let Some(dest) = instr.dest() {
            last_def.insert(dest, idx);
        }
    }

    let mut current_name: HashMap<String, String> = HashMap::new();
    let mut renamed = Vec::with_capacity(block.len());

    for (idx, instr) in block.iter().enumerate() {
        let mut instr = instr.clone();
        rewrite_args(&mut instr, &current_name);

        if let Some(dest) = instr.dest().map(str::to_string) {
            let is_final = last_def.get(dest.as_str()) == Some(&idx);
            let new_name = if is_final { dest.clone() } else { format!("{dest}__{idx}") };
            current_name.insert(dest, new_name.clone());
            set_dest(&mut instr, new_name);
        }

        renamed.push(instr);
    }

    renamed
}

fn rewrite_args(instr: &mut Instruction, current_name: &HashMap<String, String>) {
    let rewrite = |args: &mut Vec<String>| {
        for arg in args.iter_mut() {
            if let Some(renamed) = current_name.get(arg) {
                *arg = renamed.clone();
            }
        }
    };
    match instr {
        Instruction::Value(v) => rewrite(&mut v.args),
        Instruction::Effect(e) => rewrite(&mut e.args),
        Instruction::Const(_) | Instruction::Label(_) => {}
    }
}

fn set_dest(instr: &mut Instruction, name: String) {
    match instr {
        Instruction::Const(c) => c.dest = name,
        Instruction::Value(v) => v.dest = name,
        Instruction::Effect(_) | Instruction::Label(_) => {}
    }
}

/// Value numbers a single renamed block, returning its rewritten
/// instructions. An argument that is neither a parameter nor a destination
/// defined earlier in this same block is a malformed block (§4.5) — this
/// pass is purely local and has no notion of "defined by some predecessor
/// block", so a multi-block function that wants LVN applied has to ensure
/// every block's inputs are locally visible (parameters, or prior
/// same-block definitions) before calling it.
fn number_block(block: &[Instruction], params: &[String]) -> Result<Vec<Instruction>, IrError> {
    let mut table: HashMap<ValueKey, ValueNumber> = HashMap::new();
    let mut homes: HashMap<ValueNumber, String> = HashMap::new();
    let mut env: HashMap<String, ValueNumber> = HashMap::new();
    let mut next_vn: ValueNumber = 0;

    for p in params {
        let key = ValueKey::Opaque(p.clone());
        table.insert(key, next_vn);
        homes.insert(next_vn, p.clone());
        env.insert(p.clone(), next_vn);
        next_vn += 1;
    }

    let vn_of = |arg: &str, env: &HashMap<String, ValueNumber>| -> Result<ValueNumber, IrError> {
        env.get(arg).copied().ok_or_else(|| {
            IrError::MalformedIr(format!(
                "block references `{arg}`, which is neither a parameter nor defined earlier in this block"
            ))
        })
    };

    let mut out = Vec::with_capacity(block.len());

    for instr in block {
        let mut instr = instr.clone();

        match &mut instr {
            Instruction::Label(_) => {}

            Instruction::Const(c) => {
                let key = ValueKey::Const(serde_json::to_string(&c.value).unwrap_or_default());
                if let Some(&vn) = table.get(&key) {
                    let home = homes[&vn].clone();
                    env.insert(c.dest.clone(), vn);
                    instr = Instruction::Value(ValueInstr {
                        dest: c.dest.clone(),
                        ty: c.ty.clone(),
                        op: "id".to_string(),
                        args: vec![home],
                        funcs: Vec::new(),
                    });
                } else {
                    let vn = next_vn;
                    next_vn += 1;
                    table.insert(key, vn);
                    homes.insert(vn, c.dest.clone());
                    env.insert(c.dest.clone(), vn);
                }
            }

            Instruction::Value(v) => {
                let mut arg_vns = Vec::with_capacity(v.args.len());
                for arg in v.args.iter() {
                    arg_vns.push(vn_of(arg, &env)?);
                }
                let canonical_args: Vec<String> = arg_vns.iter().map(|vn| homes[vn].clone()).collect();

                if v.op == "id" {
                    let vn = arg_vns[0];
                    env.insert(v.dest.clone(), vn);
                    v.args = canonical_args;
                } else {
                    let key = ValueKey::Op(format!("{}|{}", v.op, v.funcs.join(",")), arg_vns);
                    if let Some(&vn) = table.get(&key) {
                        let home = homes[&vn].clone();
                        env.insert(v.dest.clone(), vn);
                        instr = Instruction::Value(ValueInstr {
                            dest: v.dest.clone(),
                            ty: v.ty.clone(),
                            op: "id".to_string(),
                            args: vec![home],
                            funcs: Vec::new(),
                        });
                    } else {
                        let vn = next_vn;
                        next_vn += 1;
                        table.insert(key, vn);
                        homes.insert(vn, v.dest.clone());
                        env.insert(v.dest.clone(), vn);
                        v.args = canonical_args;
                    }
                }
            }

            Instruction::Effect(e) => {
                let mut canonical_args = Vec::with_capacity(e.args.len());
                for arg in e.args.iter() {
                    let vn = vn_of(arg, &env)?;
                    canonical_args.push(homes[&vn].clone());
                }
                e.args = canonical_args;
            }
        }

        out.push(instr);
    }

    Ok(out)
}

/// Runs local value numbering over every block of `func` independently,
/// returning a new function with redundant recomputation rewritten into
/// `id` copies. Block boundaries, the label index, and the CFG are
/// untouched — only instructions within a block ever change.
pub fn local_value_numbering(func: &Function) -> Result<Function, IrError> {
    let param_names: Vec<String> = func.params.iter().map(|p| p.name.clone()).collect();
    let mut blocks = Vec::with_capacity(func.blocks.len());

    for (idx, block) in func.blocks.iter().enumerate() {
        let renamed = rename_vars(block);
        let numbered = number_block(&renamed, &param_names)?;
        log::debug!("lvn: block {idx} of `{}` rewritten ({} instrs)", func.name, numbered.len());
        blocks.push(numbered);
    }

    Ok(Function {
        name: func.name.clone(),
        params: func.params.clone(),
        blocks,
        label_index: func.label_index.clone(),
        block_exits: func.block_exits.clone(),
    })
}
