use gimli::DebugInfoOffset;

use crate::{
    config::EvaluationConfig,
    piece::{LocationKind, Piece, PieceLocation},
    services::{ExpressionServices, FrameId},
    stack::ValueStack,
    value::{BaseType, TypedValue},
    ExpressionError,
};

/// Where an evaluated expression says the value is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLocation {
    /// The whole value lives in one place.
    Single(PieceLocation),
    /// The value is assembled from pieces, in order.
    Pieces(Vec<Piece>),
}

/// The outcome of a complete evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionResult {
    /// The location of the value.
    pub location: ResultLocation,
    /// `false` if the expression ended in `DW_OP_GNU_uninit`.
    pub initialized: bool,
}

/// State of one top level evaluation.
///
/// Nested evaluations (frame base, `DW_OP_call*`, entry values) run on the same context, and
/// restore whatever they change before returning.
pub struct ExpressionContext<'s> {
    pub(crate) services: &'s mut dyn ExpressionServices,
    pub(crate) frame: Option<FrameId>,
    pub(crate) config: EvaluationConfig,
    pub(crate) stack: ValueStack,
    pub(crate) recursion_depth: u32,
    pub(crate) location: LocationKind,
    pub(crate) literal: Vec<u8>,
    pub(crate) implicit_pointer_die: Option<DebugInfoOffset>,
    pub(crate) pieces: Vec<Piece>,
    pub(crate) initialized: bool,
    pub(crate) object_address: Option<u64>,
    pub(crate) frame_base_cache: Option<(FrameId, Vec<u8>)>,
}

impl std::fmt::Debug for ExpressionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionContext")
            .field("frame", &self.frame)
            .field("config", &self.config)
            .field("stack", &self.stack)
            .field("recursion_depth", &self.recursion_depth)
            .field("location", &self.location)
            .field("pieces", &self.pieces)
            .finish_non_exhaustive()
    }
}

impl<'s> ExpressionContext<'s> {
    /// Create a context evaluating in `frame`, or without a frame for static expressions.
    pub fn new(
        services: &'s mut dyn ExpressionServices,
        config: EvaluationConfig,
        frame: Option<FrameId>,
    ) -> Self {
        Self {
            services,
            frame,
            config,
            stack: ValueStack::new(),
            recursion_depth: 0,
            location: LocationKind::Memory,
            literal: Vec::new(),
            implicit_pointer_die: None,
            pieces: Vec::new(),
            initialized: true,
            object_address: None,
            frame_base_cache: None,
        }
    }

    /// Set the address pushed by `DW_OP_push_object_address`.
    pub fn with_object_address(mut self, address: u64) -> Self {
        self.object_address = Some(address);
        self
    }

    /// The evaluation settings.
    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// The frame the expression is evaluated in.
    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    /// The location kind set by the last operation.
    pub fn location(&self) -> LocationKind {
        self.location
    }

    /// The value stack.
    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    /// The pieces produced so far.
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// The untyped address type of this unit.
    pub fn generic_type(&self) -> BaseType {
        BaseType::generic(self.config.address_size)
    }

    /// A value of the generic type.
    pub(crate) fn generic(&self, value: u64) -> TypedValue {
        TypedValue::from_bits(self.generic_type(), value)
    }

    /// Push a value.
    pub fn push(&mut self, value: TypedValue, in_stack_memory: bool) {
        self.stack.push(value, in_stack_memory);
    }

    /// Push an address of the generic type.
    pub fn push_address(&mut self, address: u64, in_stack_memory: bool) {
        let value = self.generic(address);
        self.stack.push(value, in_stack_memory);
    }

    /// The value `n` entries below the top of the stack.
    pub fn fetch(&self, n: usize) -> Result<TypedValue, ExpressionError> {
        self.stack.fetch(n, "fetch").map(|entry| entry.value)
    }

    /// The value `n` entries below the top of the stack, as an address.
    pub fn fetch_address(&self, n: usize) -> Result<u64, ExpressionError> {
        let value = self.fetch(n)?;
        if !value.ty().is_integral() {
            return Err(ExpressionError::IntegralTypeExpected);
        }
        Ok(value.as_u64())
    }

    /// Whether the entry `n` below the top is known to point into the stack.
    pub fn fetch_in_stack_memory(&self, n: usize) -> Result<bool, ExpressionError> {
        self.stack
            .fetch(n, "fetch")
            .map(|entry| entry.in_stack_memory)
    }

    pub(crate) fn require_frame(&self, what: &str) -> Result<FrameId, ExpressionError> {
        self.frame.ok_or_else(|| {
            ExpressionError::UnsupportedInContext(format!("{what} evaluation requires a frame."))
        })
    }

    /// Read a register of the current frame as an address.
    pub(crate) fn read_register_address(&mut self, register: u16) -> Result<u64, ExpressionError> {
        let frame = self.require_frame("Register")?;
        let bytes = self.services.read_register(frame, register)?;
        Ok(TypedValue::from_bytes(BaseType::unsigned(8), &bytes, self.config.byte_order).as_u64())
    }

    /// Read the low `ty.byte_size` bytes of a register of the current frame.
    pub(crate) fn read_register_typed(
        &mut self,
        register: u16,
        ty: BaseType,
    ) -> Result<TypedValue, ExpressionError> {
        let frame = self.require_frame("Register")?;
        let bytes = self.services.read_register(frame, register)?;
        let size = usize::from(ty.byte_size);
        if bytes.len() < size {
            return Err(ExpressionError::InvalidExpression(format!(
                "register {register} has {} bytes, type needs {size}",
                bytes.len()
            )));
        }
        let low = if self.config.byte_order.is_big() {
            &bytes[bytes.len() - size..]
        } else {
            &bytes[..size]
        };
        Ok(TypedValue::from_bytes(ty, low, self.config.byte_order))
    }

    /// Record a piece from the current location, as `DW_OP_piece`/`DW_OP_bit_piece` do.
    pub(crate) fn add_piece(
        &mut self,
        size_bits: u64,
        location_offset_bits: u64,
    ) -> Result<(), ExpressionError> {
        let location = match self.location {
            LocationKind::Literal => PieceLocation::Literal(self.literal.clone()),
            _ if self.stack.is_empty() => {
                self.location = LocationKind::OptimizedOut;
                PieceLocation::OptimizedOut
            }
            LocationKind::Memory => PieceLocation::Memory {
                address: self.fetch_address(0)?,
                in_stack_memory: self.fetch_in_stack_memory(0)?,
            },
            LocationKind::ImplicitPointer => PieceLocation::ImplicitPointer {
                die: self.implicit_pointer_die.ok_or_else(|| {
                    ExpressionError::InvalidExpression("implicit pointer without a target".into())
                })?,
                offset: self.fetch(0)?.as_i64(),
            },
            LocationKind::Register => PieceLocation::Register(self.fetch_register_number(0)?),
            LocationKind::StackValue => PieceLocation::StackValue(self.fetch(0)?),
            LocationKind::OptimizedOut => PieceLocation::OptimizedOut,
        };
        let offset_bits = crate::piece::total_bits(&self.pieces);
        self.pieces.push(Piece {
            location,
            size_bits,
            offset_bits,
            location_offset_bits,
        });
        Ok(())
    }

    pub(crate) fn fetch_register_number(&self, n: usize) -> Result<u16, ExpressionError> {
        let value = self.fetch(n)?.as_u64();
        u16::try_from(value).map_err(|_| {
            ExpressionError::InvalidExpression(format!("register number {value} out of range"))
        })
    }

    /// Consume the context and report where the value is.
    pub fn finish(mut self) -> Result<ExpressionResult, ExpressionError> {
        if self.pieces.is_empty() && self.location == LocationKind::ImplicitPointer {
            let size_bits = 8 * u64::from(self.config.address_size);
            self.add_piece(size_bits, 0)?;
        }
        let location = if !self.pieces.is_empty() {
            ResultLocation::Pieces(std::mem::take(&mut self.pieces))
        } else {
            ResultLocation::Single(match self.location {
                LocationKind::Memory => PieceLocation::Memory {
                    address: self.fetch_address(0)?,
                    in_stack_memory: self.fetch_in_stack_memory(0)?,
                },
                LocationKind::Register => PieceLocation::Register(self.fetch_register_number(0)?),
                LocationKind::StackValue => PieceLocation::StackValue(self.fetch(0)?),
                LocationKind::Literal => PieceLocation::Literal(std::mem::take(&mut self.literal)),
                LocationKind::OptimizedOut | LocationKind::ImplicitPointer => {
                    PieceLocation::OptimizedOut
                }
            })
        };
        Ok(ExpressionResult {
            location,
            initialized: self.initialized,
        })
    }
}
