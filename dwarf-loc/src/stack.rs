use crate::{value::TypedValue, ExpressionError};

/// One entry of the DWARF value stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    /// The value.
    pub value: TypedValue,
    /// Whether the value is known to be an address on the stack of the debuggee.
    pub in_stack_memory: bool,
}

/// The value stack of the DWARF stack machine.
///
/// Index 0 of the accessors is the top of the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStack {
    entries: Vec<StackEntry>,
}

impl ValueStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the stack holds no values.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a value.
    pub fn push(&mut self, value: TypedValue, in_stack_memory: bool) {
        self.entries.push(StackEntry {
            value,
            in_stack_memory,
        });
    }

    /// Push an existing entry.
    pub fn push_entry(&mut self, entry: StackEntry) {
        self.entries.push(entry);
    }

    fn underflow(&self, operation: &'static str, needed: usize) -> ExpressionError {
        ExpressionError::StackUnderflow {
            operation,
            needed,
            available: self.entries.len(),
        }
    }

    /// Remove and return the top entry.
    pub fn pop(&mut self, operation: &'static str) -> Result<StackEntry, ExpressionError> {
        let underflow = self.underflow(operation, 1);
        self.entries.pop().ok_or(underflow)
    }

    /// The entry `n` places below the top.
    pub fn fetch(&self, n: usize, operation: &'static str) -> Result<&StackEntry, ExpressionError> {
        self.entries
            .len()
            .checked_sub(n + 1)
            .and_then(|index| self.entries.get(index))
            .ok_or_else(|| self.underflow(operation, n + 1))
    }

    /// Swap the two topmost entries.
    pub fn swap(&mut self, operation: &'static str) -> Result<(), ExpressionError> {
        let len = self.require(2, operation)?;
        self.entries.swap(len - 1, len - 2);
        Ok(())
    }

    /// Rotate the three topmost entries: the top moves to the third position.
    pub fn rot(&mut self, operation: &'static str) -> Result<(), ExpressionError> {
        let len = self.require(3, operation)?;
        self.entries[len - 3..].rotate_right(1);
        Ok(())
    }

    fn require(&self, needed: usize, operation: &'static str) -> Result<usize, ExpressionError> {
        if self.entries.len() < needed {
            Err(self.underflow(operation, needed))
        } else {
            Ok(self.entries.len())
        }
    }

    /// Remove all entries, returning them.
    pub fn take(&mut self) -> ValueStack {
        std::mem::take(self)
    }
}
