//! Core analyses and transformations for a small SSA-adjacent IR.
//!
//! This crate is deliberately a library, not a driver: it turns an
//! already-parsed program into basic blocks and a CFG, runs dataflow and
//! structural analyses over that CFG, and implements a handful of classic
//! optimization passes (local value numbering, dead-code elimination,
//! loop-invariant code motion). Parsing text into [`ir::Instruction`]s,
//! shelling out to an external frontend, and rendering a CFG to DOT are all
//! someone else's problem.

#![allow(dead_code)]

pub mod commons;
pub mod ir;
pub mod dataflow;
pub mod global_analysis;
pub mod lvn;
pub mod dce;
pub mod licm;

pub use commons::{IrError, Valid};
pub use ir::{Instruction, Function, Program};
