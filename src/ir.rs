//! The instruction/function/program data model.
//!
//! Instructions are a tagged enum of small per-shape structs rather than a
//! single record of optional fields — see [`RawInstruction`] for the one
//! place a record-of-optionals is allowed to exist, which is purely the
//! `serde` wire shape. Everything downstream (CFG construction, dataflow,
//! LVN, DCE, LICM) works against the enum.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::commons::IrError;

/// Index of a basic block within a [`Function`].
pub type BlockId = usize;
/// A variable name, as it appears in `dest`/`args`.
pub type VarName = String;
/// A label name, as it appears in `label`/`labels`.
pub type LabelName = String;
/// An opaque type descriptor (`"int"`, `"bool"`, or a nested shape for
/// pointer/array types in the wider IR family this toolkit targets). This
/// crate does no type inference or type-directed optimization, so it never
/// interprets this beyond threading it through unchanged.
pub type TypeDesc = serde_json::Value;
/// An opaque constant literal (`4`, `true`, ...).
pub type Literal = serde_json::Value;

/// A reaching-definition site: either a function parameter, or a specific
/// instruction. Modeled as a sum so there is no nullable block index lurking
/// anywhere in the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DefSite {
    Param(usize),
    Instr(BlockId, usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelInstr {
    pub label: LabelName,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstInstr {
    pub dest: VarName,
    pub ty: TypeDesc,
    pub value: Literal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValueInstr {
    pub dest: VarName,
    pub ty: TypeDesc,
    pub op: String,
    pub args: Vec<VarName>,
    /// Direct-call callee names, carried opaquely (no interprocedural
    /// reasoning is performed over them — see Non-goals).
    pub funcs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EffectInstr {
    pub op: String,
    pub args: Vec<VarName>,
    pub labels: Vec<LabelName>,
    pub funcs: Vec<String>,
}

/// A single IR instruction: a label, a constant, a value-producing op, or an
/// effect op (which includes the two terminators, `jmp` and `br`).
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Label(LabelInstr),
    Const(ConstInstr),
    Value(ValueInstr),
    Effect(EffectInstr),
}

impl Instruction {
    pub fn is_value_op(&self) -> bool {
        matches!(self, Instruction::Const(_) | Instruction::Value(_))
    }

    pub fn is_effect_op(&self) -> bool {
        matches!(self, Instruction::Effect(_))
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Instruction::Label(_))
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Instruction::Effect(e) if e.op == "jmp" || e.op == "br")
    }

    /// The name this instruction assigns to, if it's a value-op.
    pub fn dest(&self) -> Option<&str> {
        match self {
            Instruction::Const(c) => Some(&c.dest),
            Instruction::Value(v) => Some(&v.dest),
            Instruction::Label(_) | Instruction::Effect(_) => None,
        }
    }

    /// The argument names this instruction reads, uniformly across shapes
    /// (constants and labels always read none).
    pub fn args(&self) -> &[VarName] {
        match self {
            Instruction::Value(v) => &v.args,
            Instruction::Effect(e) => &e.args,
            Instruction::Const(_) | Instruction::Label(_) => &[],
        }
    }

    /// The jump targets this instruction carries (only terminators have any).
    pub fn labels(&self) -> &[LabelName] {
        match self {
            Instruction::Effect(e) => &e.labels,
            _ => &[],
        }
    }

    pub fn op(&self) -> Option<&str> {
        match self {
            Instruction::Const(_) => Some("const"),
            Instruction::Value(v) => Some(&v.op),
            Instruction::Effect(e) => Some(&e.op),
            Instruction::Label(_) => None,
        }
    }

    /// True for effect-ops, and for value-ops whose operator can trap or
    /// otherwise depend on machine state. Gates speculative hoisting in
    /// [`crate::licm`].
    pub fn can_have_side_effects(&self) -> bool {
        match self {
            Instruction::Effect(_) => true,
            Instruction::Value(v) => matches!(v.op.as_str(), "div" | "mod" | "load"),
            Instruction::Const(_) | Instruction::Label(_) => false,
        }
    }
}

pub fn mklabel(name: impl Into<String>) -> Instruction {
    Instruction::Label(LabelInstr { label: name.into() })
}

pub fn mkjmp(target: impl Into<String>) -> Instruction {
    Instruction::Effect(EffectInstr {
        op: "jmp".to_string(),
        args: Vec::new(),
        labels: vec![target.into()],
        funcs: Vec::new(),
    })
}

/// A function parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: VarName,
    pub ty: TypeDesc,
}

/// A function lowered into basic blocks with a computed CFG.
///
/// Once constructed, a `Function` is immutable as far as every analysis and
/// pass is concerned (`&Function` in, `Function` out); [`crate::licm`] is the
/// one exception, and it only ever mutates a clone it already owns.
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    /// Ordered basic blocks; block `i`'s instructions in program order.
    pub blocks: Vec<Vec<Instruction>>,
    /// Label name -> index of the block whose first instruction is that label.
    pub label_index: BTreeMap<LabelName, BlockId>,
    /// `block_exits[i]` is the successor block indices of block `i`, always
    /// in-range (see the sentinel handling in [`build_cfg`]).
    pub block_exits: Vec<Vec<BlockId>>,
}

impl Function {
    /// Lowers a flat instruction stream into blocks and a CFG.
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        instrs: Vec<Instruction>,
    ) -> Result<Self, IrError> {
        let (blocks, label_index) = make_blocks(instrs)?;
        let block_exits = build_cfg(&blocks, &label_index)?;
        Ok(Function {
            name: name.into(),
            params,
            blocks,
            label_index,
            block_exits,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Flattens the blocks back into a single instruction stream, preserving
    /// label instructions at block heads. The inverse of [`Function::new`].
    pub fn to_instrs(&self) -> Vec<Instruction> {
        self.blocks.iter().flatten().cloned().collect()
    }

    /// Deep-clones this function, omitting every instruction whose
    /// `(block_idx, instr_idx)` is in `exclude`. Block boundaries, the label
    /// index, and the CFG edges are preserved exactly — excluded
    /// instructions leave their block shorter, not removed.
    ///
    /// This is the one primitive both DCE passes are built on.
    pub fn filter_copy(
        &self,
        exclude: &std::collections::BTreeSet<(BlockId, usize)>,
    ) -> Function {
        let blocks = self
            .blocks
            .iter()
            .enumerate()
            .map(|(block_idx, block)| {
                block
                    .iter()
                    .enumerate()
                    .filter(|(instr_idx, _)| !exclude.contains(&(block_idx, *instr_idx)))
                    .map(|(_, instr)| instr.clone())
                    .collect()
            })
            .collect();

        Function {
            name: self.name.clone(),
            params: self.params.clone(),
            blocks,
            label_index: self.label_index.clone(),
            block_exits: self.block_exits.clone(),
        }
    }

    pub fn copy(&self) -> Function {
        self.filter_copy(&std::collections::BTreeSet::new())
    }
}

/// Partitions a flat instruction stream into basic blocks, recording where
/// each label lands. See §4.2: a label or a terminator closes the current
/// block; a label also opens the next one.
fn make_blocks(
    instrs: Vec<Instruction>,
) -> Result<(Vec<Vec<Instruction>>, BTreeMap<LabelName, BlockId>), IrError> {
    let mut blocks: Vec<Vec<Instruction>> = Vec::new();
    let mut label_index: BTreeMap<LabelName, BlockId> = BTreeMap::new();
    let mut curr: Vec<Instruction> = Vec::new();

    for instr in instrs {
        let label_name = match &instr {
            Instruction::Label(l) => Some(l.label.clone()),
            _ => None,
        };
        let closes_block = label_name.is_some() || instr.is_terminator();

        if label_name.is_none() {
            curr.push(instr);
        }

        if closes_block {
            if !curr.is_empty() {
                blocks.push(std::mem::take(&mut curr));
            }
            if let Some(name) = label_name {
                if label_index.insert(name.clone(), blocks.len()).is_some() {
                    return Err(IrError::MalformedIr(format!("duplicate label `{name}`")));
                }
                curr.push(instr);
            }
        }
    }

    if !curr.is_empty() {
        blocks.push(curr);
    }

    Ok((blocks, label_index))
}

/// Computes successor edges for each block. A terminator's successors are
/// its labels resolved through `label_index`; otherwise the successor is
/// `[i+1]`. If the final block falls through, an empty sentinel block is
/// appended so every index stays in-range (§4.2, §9).
fn build_cfg(
    blocks: &[Vec<Instruction>],
    label_index: &BTreeMap<LabelName, BlockId>,
) -> Result<Vec<Vec<BlockId>>, IrError> {
    let mut exits: Vec<Vec<BlockId>> = Vec::with_capacity(blocks.len());

    for (i, block) in blocks.iter().enumerate() {
        let last = block.last();
        let targets = match last {
            Some(instr) if instr.is_terminator() => {
                let mut targets = Vec::with_capacity(instr.labels().len());
                for label in instr.labels() {
                    let idx = *label_index.get(label).ok_or_else(|| {
                        IrError::MalformedIr(format!("`{}` targets undefined label `{label}`", instr.op().unwrap_or("?")))
                    })?;
                    targets.push(idx);
                }
                targets
            }
            _ => vec![i + 1],
        };
        exits.push(targets);
    }

    if exits.last().map(|t| t.as_slice()) == Some(&[blocks.len()]) {
        exits.push(Vec::new());
    }

    Ok(exits)
}

/// An ordered collection of functions. Order is preserved (but not otherwise
/// meaningful) so re-emission is stable.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new(functions: Vec<Function>) -> Self {
        Program { functions }
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// The one whole-program check not already implied by each `Function`
    /// being individually well-formed: function names must be unique.
    pub fn validate(self) -> Result<crate::commons::Valid<Program>, IrError> {
        let mut seen = std::collections::BTreeSet::new();
        for f in &self.functions {
            if !seen.insert(f.name.as_str()) {
                return Err(IrError::MalformedIr(format!(
                    "duplicate function `{}`",
                    f.name
                )));
            }
        }
        Ok(crate::commons::Valid(self))
    }
}

// SECTION: serde wire format.
//
// `RawInstruction`/`RawParam`/`RawFunction` are the one place a
// record-of-optional-fields is allowed to exist (§9): they are the literal
// JSON shape from §6, converted to/from the typed `Instruction`/`Function`
// enums at the boundary and never touched by an analysis.

#[derive(Serialize, Deserialize)]
struct RawInstruction {
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dest: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    ty: Option<TypeDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Literal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    funcs: Vec<String>,
}

impl From<&Instruction> for RawInstruction {
    fn from(instr: &Instruction) -> Self {
        match instr {
            Instruction::Label(l) => RawInstruction {
                label: Some(l.label.clone()),
                op: None,
                dest: None,
                ty: None,
                value: None,
                args: Vec::new(),
                labels: Vec::new(),
                funcs: Vec::new(),
            },
            Instruction::Const(c) => RawInstruction {
                label: None,
                op: Some("const".to_string()),
                dest: Some(c.dest.clone()),
                ty: Some(c.ty.clone()),
                value: Some(c.value.clone()),
                args: Vec::new(),
                labels: Vec::new(),
                funcs: Vec::new(),
            },
            Instruction::Value(v) => RawInstruction {
                label: None,
                op: Some(v.op.clone()),
                dest: Some(v.dest.clone()),
                ty: Some(v.ty.clone()),
                value: None,
                args: v.args.clone(),
                labels: Vec::new(),
                funcs: v.funcs.clone(),
            },
            Instruction::Effect(e) => RawInstruction {
                label: None,
                op: Some(e.op.clone()),
                dest: None,
                ty: None,
                value: None,
                args: e.args.clone(),
                labels: e.labels.clone(),
                funcs: e.funcs.clone(),
            },
        }
    }
}

impl TryFrom<RawInstruction> for Instruction {
    type Error = IrError;

    fn try_from(raw: RawInstruction) -> Result<Self, IrError> {
        if let Some(label) = raw.label {
            return Ok(Instruction::Label(LabelInstr { label }));
        }

        let op = raw
            .op
            .ok_or_else(|| IrError::MalformedIr("instruction has neither `label` nor `op`".to_string()))?;

        if op == "const" {
            let dest = raw
                .dest
                .ok_or_else(|| IrError::MalformedIr("`const` missing `dest`".to_string()))?;
            let ty = raw
                .ty
                .ok_or_else(|| IrError::MalformedIr("`const` missing `type`".to_string()))?;
            let value = raw
                .value
                .ok_or_else(|| IrError::MalformedIr("`const` missing `value`".to_string()))?;
            return Ok(Instruction::Const(ConstInstr { dest, ty, value }));
        }

        if let Some(dest) = raw.dest {
            let ty = raw.ty.ok_or_else(|| {
                IrError::MalformedIr(format!("value-op `{op}` missing `type`"))
            })?;
            return Ok(Instruction::Value(ValueInstr {
                dest,
                ty,
                op,
                args: raw.args,
                funcs: raw.funcs,
            }));
        }

        let expected_labels = match op.as_str() {
            "jmp" => Some(1),
            "br" => Some(2),
            _ => None,
        };
        if let Some(n) = expected_labels {
            if raw.labels.len() != n {
                return Err(IrError::MalformedIr(format!(
                    "`{op}` requires exactly {n} label(s), got {}",
                    raw.labels.len()
                )));
            }
        }

        Ok(Instruction::Effect(EffectInstr {
            op,
            args: raw.args,
            labels: raw.labels,
            funcs: raw.funcs,
        }))
    }
}

impl Serialize for Instruction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawInstruction::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Instruction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawInstruction::deserialize(deserializer)?;
        Instruction::try_from(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct RawParam {
    name: String,
    #[serde(rename = "type")]
    ty: TypeDesc,
}

#[derive(Serialize)]
struct RawFunctionOut<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<RawParam>,
    instrs: Vec<Instruction>,
}

#[derive(Deserialize)]
struct RawFunctionIn {
    name: String,
    #[serde(default)]
    args: Vec<RawParam>,
    instrs: Vec<Instruction>,
}

impl Serialize for Function {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let args = self
            .params
            .iter()
            .map(|p| RawParam {
                name: p.name.clone(),
                ty: p.ty.clone(),
            })
            .collect();
        RawFunctionOut {
            name: &self.name,
            args,
            instrs: self.to_instrs(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Function {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawFunctionIn::deserialize(deserializer)?;
        let params = raw
            .args
            .into_iter()
            .map(|p| Param {
                name: p.name,
                ty: p.ty,
            })
            .collect();
        Function::new(raw.name, params, raw.instrs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

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

    // Three non-sentinel blocks, one fallthrough edge collapsing into the
    // jump target, label_index = {somewhere: 2}.
    #[test]
    fn s1_block_partitioning() {
        let instrs = vec![
            constant("v", 4),
            mkjmp("somewhere"),
            constant("v", 2),
            mklabel("somewhere"),
            effect("print", &["v"], &[]),
        ];
        let f = Function::new("main", vec![], instrs.clone()).unwrap();

        assert_eq!(f.blocks.len(), 4);
        assert_eq!(f.blocks[0], vec![instrs[0].clone(), instrs[1].clone()]);
        assert_eq!(f.blocks[1], vec![instrs[2].clone()]);
        assert_eq!(f.blocks[2], vec![instrs[3].clone(), instrs[4].clone()]);
        assert_eq!(f.blocks[3], Vec::<Instruction>::new());

        assert_eq!(f.label_index.get("somewhere"), Some(&2));
        assert_eq!(f.block_exits, vec![vec![2], vec![2], vec![3], vec![]]);

        assert_eq!(f.to_instrs(), instrs);
    }

    #[test]
    fn undefined_label_is_malformed() {
        let instrs = vec![mkjmp("nowhere")];
        let err = Function::new("f", vec![], instrs).unwrap_err();
        assert!(matches!(err, IrError::MalformedIr(_)));
    }

    #[test]
    fn duplicate_label_is_malformed() {
        let instrs = vec![mklabel("again"), mklabel("again")];
        let err = Function::new("f", vec![], instrs).unwrap_err();
        assert!(matches!(err, IrError::MalformedIr(_)));
    }

    #[test]
    fn filter_copy_preserves_block_shape() {
        let instrs = vec![constant("a", 1), value("b", "id", &["a"]), effect("print", &["b"], &[])];
        let f = Function::new("f", vec![], instrs).unwrap();

        let mut exclude = std::collections::BTreeSet::new();
        exclude.insert((0usize, 0usize));
        let g = f.filter_copy(&exclude);

        assert_eq!(g.blocks.len(), f.blocks.len());
        assert_eq!(g.blocks[0].len(), 1);
        assert_eq!(g.blocks[0][0].dest(), Some("b"));
        assert_eq!(g.block_exits, f.block_exits);
        assert_eq!(g.label_index, f.label_index);
    }

    #[test]
    fn instruction_json_round_trip() {
        let instrs = vec![
            mklabel("top"),
            constant("x", 4),
            value("y", "add", &["x", "x"]),
            effect("br", &["y"], &["top", "done"]),
        ];
        for instr in instrs {
            let json = serde_json::to_string(&instr).unwrap();
            let back: Instruction = serde_json::from_str(&json).unwrap();
            assert_eq!(instr, back);
        }
    }

    #[test]
    fn br_with_wrong_label_count_is_malformed() {
        let json = serde_json::json!({"op": "br", "args": ["c"], "labels": ["only_one"]});
        let result: Result<Instruction, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn program_round_trip_through_json() {
        let instrs = vec![constant("x", 1), effect("ret", &[], &[])];
        let f = Function::new(
            "main",
            vec![Param { name: "n".to_string(), ty: serde_json::json!("int") }],
            instrs,
        )
        .unwrap();
        let program = Program::new(vec![f.clone()]);

        let json = serde_json::to_string(&program).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back.functions.len(), 1);
        assert_eq!(back.functions[0].name, "main");
        assert_eq!(back.functions[0].to_instrs(), f.to_instrs());
    }

    #[test]
    fn program_rejects_duplicate_function_names() {
        let f1 = Function::new("main", vec![], vec![]).unwrap();
        let f2 = Function::new("main", vec![], vec![]).unwrap();
        let err = Program::new(vec![f1, f2]).validate().unwrap_err();
        assert!(matches!(err, IrError::MalformedIr(_)));
    }
}
