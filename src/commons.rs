//! Shared small types used across the analysis and transformation modules:
//! the error enum, and the `Valid<T>` marker that distinguishes a [`Program`]
//! that has passed construction-time structural checks from one that hasn't.

use derive_more::Display;

use crate::ir::BlockId;

/// Everything that can go wrong while building or analyzing a program.
///
/// `NotANaturalLoop` is an internal control-flow signal: [`global_analysis`]
/// catches it itself and never lets it escape a public function. Callers
/// only ever see `MalformedIr` and `InvariantViolation`.
///
/// [`global_analysis`]: crate::global_analysis
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum IrError {
    #[display(fmt = "malformed IR: {}", _0)]
    MalformedIr(String),

    #[display(fmt = "back-edge {:?} -> {:?} is not a natural loop (header does not dominate tail)", tail, header)]
    NotANaturalLoop { header: BlockId, tail: BlockId },

    #[display(fmt = "invariant violation: {}", _0)]
    InvariantViolation(String),
}

impl std::error::Error for IrError {}

/// Marks a value that has passed the structural checks `T` defines for
/// itself (see [`Program::validate`](crate::ir::Program::validate)).
///
/// Analyses and passes that assume a well-formed CFG take `&Valid<Program>`
/// rather than `&Program` so that "did someone check this" is a type-level
/// fact instead of a convention.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);

impl<T> std::ops::Deref for Valid<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
