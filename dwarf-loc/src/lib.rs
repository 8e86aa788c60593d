//! DWARF location expression engine
//!
//! This crate evaluates DWARF expressions and location descriptions on behalf of
//! a debugger. The debugger provides access to target memory, registers, frames
//! and pre-decoded debug information through the traits in [`services`], and gets
//! back either a plain value, a location, or a list of pieces that together make
//! up a composite value.
//!
//! Besides the interpreter, the crate contains
//! - the bit-level accessor for composite ("pieced") values,
//! - the entry value resolver, which recovers parameter values at function entry
//!   from call site information recorded in the caller,
//! - a compiler from DWARF expressions to agent expressions, for evaluation
//!   outside of the debugger,
//! - register set transfer tables between OS register buffers and a register cache.

/// Compilation of DWARF expressions into agent expression bytecode.
pub mod agent;
/// Bit-granular copies between byte buffers.
pub(crate) mod bits;
/// Bounds checked decoding of DWARF expression bytecode.
pub mod bytecode;
/// Call site information recorded by the compiler.
pub mod call_site;
/// Read and write access to values composed of several pieces.
pub mod composite;
/// Evaluation settings.
pub mod config;
/// The evaluation context, which owns the value stack and the pieces.
pub mod context;
/// Resolution of `DW_OP_entry_value` and friends through the call site graph.
pub mod entry_value;
/// The stack machine.
mod interpreter;
/// Materialisation of location descriptions into values.
pub mod location;
/// Pieces of a composite location.
pub mod piece;
/// Register set layouts and the register cache.
pub mod regset;
/// Interfaces to the collaborators that own the target and the debug information.
pub mod services;
/// The value stack.
pub mod stack;
/// Typed scalar values.
pub mod value;

#[cfg(test)]
pub(crate) mod test;

pub use self::{
    config::{ByteOrder, EvaluationConfig},
    context::{ExpressionContext, ExpressionResult, ResultLocation},
    location::{evaluate_location_description, Lvalue, TypeKind, Value, ValueType},
    piece::{LocationKind, Piece, PieceLocation},
    services::{ExpressionServices, FrameId},
    value::{BaseType, BaseTypeEncoding, TypedValue},
};

use gimli::DwOp;

/// An error occurred while evaluating a DWARF expression.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    /// An operation needed more values than the stack holds.
    #[error("DWARF expression stack underflow: {operation} needs {needed} values, stack has {available}")]
    StackUnderflow {
        /// The operation that accessed the stack.
        operation: &'static str,
        /// Number of stack entries the operation needed.
        needed: usize,
        /// Number of entries that were on the stack.
        available: usize,
    },
    /// An operand could not be decoded before the end of the bytecode.
    #[error("DWARF expression ended unexpectedly at offset {offset}")]
    BufferOverrun {
        /// Offset in the bytecode where decoding failed.
        offset: usize,
    },
    /// An operand was malformed.
    #[error("Malformed DWARF expression operand at offset {offset}")]
    Decode {
        /// Offset in the bytecode where decoding failed.
        offset: usize,
        /// The decoding error.
        #[source]
        source: gimli::Error,
    },
    /// The opcode is not known or not handled by the interpreter.
    #[error("Unhandled DWARF expression opcode {0}")]
    UnknownOpcode(DwOp),
    /// A binary operation was applied to values of different base types.
    #[error("Incompatible types on DWARF stack")]
    TypeMismatch,
    /// The operation only works on integral values.
    #[error("Integral type expected in DWARF expression")]
    IntegralTypeExpected,
    /// Division of an integral value by zero.
    #[error("Division by zero")]
    DivisionByZero,
    /// Nested evaluations went deeper than the configured limit.
    #[error("DWARF expression error: loop detected ({0})")]
    RecursionLimitExceeded(u32),
    /// The operation needs something the current context cannot provide, e.g. a frame.
    #[error("{0}")]
    UnsupportedInContext(String),
    /// An entry value could not be determined.
    ///
    /// Callers printing values are expected to show these as optimized out.
    #[error("{0}")]
    NoEntryValue(String),
    /// An access through a synthetic pointer or a composite value was out of bounds.
    #[error("access outside bounds of object referenced via synthetic pointer")]
    InvalidSyntheticPointer,
    /// The operation has no agent expression translation.
    #[error("DWARF operator {0} cannot be translated to an agent expression")]
    Unimplemented(DwOp),
    /// Memory or a register is not available, e.g. not collected in a trace frame.
    #[error("{0}")]
    NotAvailable(String),
    /// The value was not saved by the callee, or is otherwise gone.
    #[error("{0}")]
    OptimizedOut(String),
    /// The expression is structurally invalid.
    #[error("DWARF expression error: {0}")]
    InvalidExpression(String),
    /// A `DW_OP_piece` or `DW_OP_bit_piece` of zero bits.
    #[error("DWARF expression error: zero-sized piece at offset {offset}")]
    EmptyPiece {
        /// Offset of the piece operation in the bytecode.
        offset: usize,
    },
    /// A `DW_OP_skip` or `DW_OP_bra` jumps outside of the bytecode.
    #[error("DWARF expression branch at offset {offset} targets {target}, outside of the expression")]
    BadBranchTarget {
        /// Offset of the branch operation.
        offset: usize,
        /// The computed target offset.
        target: i64,
    },
    /// The agent expression back end can only compose a single machine word.
    #[error("Expression pieces exceed word size")]
    PiecesExceedWordSize,
    /// Some other error occurred.
    #[error("{0}")]
    Other(String),
}

impl ExpressionError {
    /// Whether this is an entry value failure, which is shown as "optimized out".
    pub fn is_no_entry_value(&self) -> bool {
        matches!(self, ExpressionError::NoEntryValue(_))
    }

    /// Whether this error reports unavailable target state rather than a failure.
    pub fn is_not_available(&self) -> bool {
        matches!(self, ExpressionError::NotAvailable(_))
    }

    pub(crate) fn no_entry_value(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::debug!("entry value: {message}");
        ExpressionError::NoEntryValue(message)
    }
}
