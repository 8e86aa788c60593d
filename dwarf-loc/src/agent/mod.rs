//! Agent expressions are a small stack bytecode that a remote stub evaluates on
//! its own, e.g. to collect data at a tracepoint without stopping the target.
//!
//! [`compile_expression`] translates the DWARF operations that need no debugger
//! support into this bytecode. The result records which registers the code reads,
//! so the stub knows what to collect.

/// Compilation of DWARF expressions.
pub mod compile;
/// The agent bytecode and its encoder.
pub mod expr;

pub use self::{
    compile::{access_memory, compile_expression, AgentValue},
    expr::{AgentExpr, AgentOp},
};
