use gimli::DebugInfoOffset;

use crate::value::TypedValue;

/// Where the result of an expression, or of one piece of it, lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationKind {
    /// The top of the stack is an address in memory.
    #[default]
    Memory,
    /// The top of the stack is a register number.
    Register,
    /// The top of the stack is the value itself.
    StackValue,
    /// The value is a literal block of bytes from the expression.
    Literal,
    /// The value is gone.
    OptimizedOut,
    /// The value is a pointer to a variable that has no address.
    ImplicitPointer,
}

/// The storage backing a [`Piece`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceLocation {
    /// A memory range.
    Memory {
        /// Start address.
        address: u64,
        /// Whether the address is known to be on the stack.
        in_stack_memory: bool,
    },
    /// A DWARF register.
    Register(u16),
    /// A value computed by the expression.
    StackValue(TypedValue),
    /// Bytes embedded in the expression (`DW_OP_implicit_value`).
    Literal(Vec<u8>),
    /// The piece is optimized out.
    OptimizedOut,
    /// A synthetic pointer to the variable `die`, offset by `offset` bytes.
    ImplicitPointer {
        /// The variable pointed at.
        die: DebugInfoOffset,
        /// Byte offset into the variable.
        offset: i64,
    },
}

impl PieceLocation {
    /// The kind of location.
    pub fn kind(&self) -> LocationKind {
        match self {
            PieceLocation::Memory { .. } => LocationKind::Memory,
            PieceLocation::Register(_) => LocationKind::Register,
            PieceLocation::StackValue(_) => LocationKind::StackValue,
            PieceLocation::Literal(_) => LocationKind::Literal,
            PieceLocation::OptimizedOut => LocationKind::OptimizedOut,
            PieceLocation::ImplicitPointer { .. } => LocationKind::ImplicitPointer,
        }
    }
}

/// One part of a composite value, created by `DW_OP_piece` or `DW_OP_bit_piece`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    /// Where the bits come from.
    pub location: PieceLocation,
    /// Size of the piece in bits.
    pub size_bits: u64,
    /// Position of the piece within the composite value, in bits.
    pub offset_bits: u64,
    /// Offset into the location where the piece starts (the `DW_OP_bit_piece` offset operand).
    pub location_offset_bits: u64,
}

/// Total size of a list of pieces, in bits.
pub fn total_bits(pieces: &[Piece]) -> u64 {
    pieces.iter().map(|piece| piece.size_bits).sum()
}
