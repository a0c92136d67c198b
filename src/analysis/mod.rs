//! Control and data flow analysis over method bodies
//!
//! Everything here is derived from a [`Code`](crate::jvm::code::Code) and never mutates it. The
//! results describe the code as it was when the analysis ran, so a transformer which edits a
//! method has to analyze it again before relying on flow facts.
//!
//!   - [`ControlFlowGraph`] splits the element list into basic blocks connected by fall-through,
//!     branch, and exception edges
//!   - [`Dataflow`] is a forward fixed-point over abstract frames, tracking the verification
//!     type of every stack slot and local along with constant values where they are known
//!   - [`ClassHierarchy`] answers subtyping questions for the classes being processed (and a
//!     handful of well-known library classes)
//!   - [`heuristics`] summarizes how obfuscated a class looks

mod cfg;
mod dataflow;
pub mod heuristics;
mod hierarchy;

pub use cfg::*;
pub use dataflow::*;
pub use hierarchy::*;

use crate::jvm::code::Label;
use crate::jvm::ClassFormatError;
use thiserror::Error;

/// Errors produced while analyzing a method
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// The fixed-point did not settle within its step budget
    #[error("dataflow did not converge within {0} steps")]
    NonConvergence(usize),

    #[error("method uses subroutines (jsr/ret)")]
    Subroutine,

    #[error("label {0:?} is used but not placed exactly once")]
    BadLabel(Label),

    #[error("{kind} (at element {element})")]
    Type {
        element: usize,
        kind: VerifierErrorKind,
    },

    #[error("bad constant: {0}")]
    BadConstant(#[from] ClassFormatError),
}

impl AnalysisError {
    /// Should the method be reported as `UnanalyzableMethod` (as opposed to broken)?
    pub fn is_unanalyzable(&self) -> bool {
        matches!(
            self,
            AnalysisError::NonConvergence(_) | AnalysisError::Subroutine
        )
    }
}

/// Ways in which an instruction does not fit the frame it executes in
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifierErrorKind {
    #[error("pop from an empty stack")]
    EmptyStack,

    #[error("operand has the wrong type")]
    InvalidType,

    #[error("operand has width {0}")]
    InvalidWidth(usize),

    #[error("local variable index is out of range")]
    InvalidIndex,

    #[error("stack depth {0} exceeds max_stack")]
    StackOverflow(usize),

    #[error("incompatible stack heights at a merge point")]
    StackHeightMismatch,

    #[error("frame is incompatible with the declared stack map frame")]
    FrameMismatch,

    #[error("return does not match the method descriptor")]
    BadReturn,

    #[error("execution falls off the end of the code")]
    FallsOffEnd,

    #[error("block needs a stack map frame but declares none")]
    MissingFrame,

    #[error("descriptor {0:?} does not parse")]
    BadDescriptor(String),
}
