use crate::{
    composite::{BitMask, PiecedValue},
    config::{ByteOrder, EvaluationConfig},
    context::{ExpressionContext, ExpressionResult, ResultLocation},
    entry_value::EntryDataValue,
    piece::{total_bits, PieceLocation},
    services::{ExpressionServices, FrameId},
    value::{BaseType, TypedValue},
    ExpressionError,
};

/// The shape of a value's type, as far as location handling cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    /// Anything that is not dereferenced.
    Scalar,
    /// A pointer to the given type.
    Pointer(Box<ValueType>),
    /// A C++ reference to the given type.
    Reference(Box<ValueType>),
}

/// The type of a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueType {
    /// Size of the type in bytes.
    pub byte_size: u64,
    /// What kind of type it is.
    pub kind: TypeKind,
}

impl ValueType {
    /// A plain type of `byte_size` bytes.
    pub fn scalar(byte_size: u64) -> Self {
        Self {
            byte_size,
            kind: TypeKind::Scalar,
        }
    }

    /// A pointer of `byte_size` bytes to `target`.
    pub fn pointer(byte_size: u64, target: ValueType) -> Self {
        Self {
            byte_size,
            kind: TypeKind::Pointer(Box::new(target)),
        }
    }

    /// A reference of `byte_size` bytes to `target`.
    pub fn reference(byte_size: u64, target: ValueType) -> Self {
        Self {
            byte_size,
            kind: TypeKind::Reference(Box::new(target)),
        }
    }

    /// The type pointed or referred to.
    pub fn target(&self) -> Option<&ValueType> {
        match &self.kind {
            TypeKind::Pointer(target) | TypeKind::Reference(target) => Some(target),
            TypeKind::Scalar => None,
        }
    }

    fn len(&self) -> usize {
        self.byte_size as usize
    }
}

/// A part of a larger object, selected by a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subobject {
    /// The type of the part.
    pub ty: ValueType,
    /// Offset of the part in the object.
    pub byte_offset: i64,
}

/// Where a value can be written back to.
#[derive(Debug, Clone)]
pub enum Lvalue {
    /// The value has no storage, e.g. it was computed.
    NotLvalue,
    /// The value is in target memory.
    Memory {
        /// Address of the value.
        address: u64,
        /// Whether the address is known to be on the stack.
        in_stack_memory: bool,
    },
    /// The value is in a register of a frame.
    Register {
        /// The frame whose register holds the value.
        frame: FrameId,
        /// DWARF register number.
        register: u16,
        /// Offset of the value within the register contents.
        offset: usize,
    },
    /// The value is assembled from pieces.
    Computed(PiecedValue),
    /// A reference parameter at function entry, whose target is resolved on dereference.
    EntryData(EntryDataValue),
}

/// A value with its contents, storage and availability.
#[derive(Debug, Clone)]
pub struct Value {
    ty: ValueType,
    lval: Lvalue,
    byte_order: ByteOrder,
    /// `None` while the value is lazy.
    contents: Option<Vec<u8>>,
    unavailable: BitMask,
    optimized_out: BitMask,
    initialized: bool,
}

impl Value {
    fn with_lval(ty: ValueType, lval: Lvalue, byte_order: ByteOrder, contents: Option<Vec<u8>>) -> Self {
        let bits = 8 * ty.len();
        Self {
            ty,
            lval,
            byte_order,
            contents,
            unavailable: BitMask::repeat(false, bits),
            optimized_out: BitMask::repeat(false, bits),
            initialized: true,
        }
    }

    /// A value that is not an lvalue, with the given contents.
    pub fn from_bytes(ty: ValueType, bytes: Vec<u8>, byte_order: ByteOrder) -> Self {
        Self::with_lval(ty, Lvalue::NotLvalue, byte_order, Some(bytes))
    }

    /// A value whose every bit is optimized out.
    pub fn optimized_out(ty: ValueType, byte_order: ByteOrder) -> Self {
        let mut value = Self::from_bytes(ty.clone(), vec![0; ty.len()], byte_order);
        value.optimized_out.fill(true);
        value
    }

    /// A value whose every bit is unavailable.
    pub fn unavailable(ty: ValueType, byte_order: ByteOrder) -> Self {
        let mut value = Self::from_bytes(ty.clone(), vec![0; ty.len()], byte_order);
        value.unavailable.fill(true);
        value
    }

    /// A value in memory, read on first use.
    pub fn lazy_memory(ty: ValueType, address: u64, in_stack_memory: bool, byte_order: ByteOrder) -> Self {
        Self::with_lval(
            ty,
            Lvalue::Memory {
                address,
                in_stack_memory,
            },
            byte_order,
            None,
        )
    }

    pub(crate) fn lazy_computed(ty: ValueType, pieces: PiecedValue, byte_order: ByteOrder) -> Self {
        Self::with_lval(ty, Lvalue::Computed(pieces), byte_order, None)
    }

    pub(crate) fn entry_data(
        ty: ValueType,
        reference: Vec<u8>,
        entry: EntryDataValue,
        byte_order: ByteOrder,
    ) -> Self {
        Self::with_lval(ty, Lvalue::EntryData(entry), byte_order, Some(reference))
    }

    /// The type of the value.
    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    /// Where the value lives.
    pub fn lval(&self) -> &Lvalue {
        &self.lval
    }

    /// The address of a value in memory.
    pub fn address(&self) -> Option<u64> {
        match self.lval {
            Lvalue::Memory { address, .. } => Some(address),
            _ => None,
        }
    }

    /// Whether the contents still have to be fetched.
    pub fn is_lazy(&self) -> bool {
        self.contents.is_none()
    }

    /// `false` if the location expression ended in `DW_OP_GNU_uninit`.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// The contents, if already fetched.
    pub fn contents(&self) -> Option<&[u8]> {
        self.contents.as_deref()
    }

    /// Bits that could not be read.
    pub fn unavailable_bits(&self) -> &BitMask {
        &self.unavailable
    }

    /// Bits that are optimized out.
    pub fn optimized_out_bits(&self) -> &BitMask {
        &self.optimized_out
    }

    /// Whether any of `len_bits` bits at `offset_bits` is optimized out.
    ///
    /// Lazy pieced values answer from their pieces without fetching.
    pub fn bits_any_optimized_out(&self, offset_bits: u64, len_bits: u64) -> bool {
        match (&self.lval, &self.contents) {
            (Lvalue::Computed(pieces), None) => pieces.bits_any_optimized_out(offset_bits, len_bits),
            _ => mask_any(&self.optimized_out, offset_bits, len_bits),
        }
    }

    /// Whether the whole value is optimized out.
    pub fn is_optimized_out(&self) -> bool {
        match (&self.lval, &self.contents) {
            (Lvalue::Computed(pieces), None) => !pieces.bits_any_available(0, 8 * self.ty.byte_size),
            _ => self.optimized_out.all() && !self.optimized_out.is_empty(),
        }
    }

    /// Whether every bit of a fetched value could be read.
    pub fn is_entirely_available(&self) -> bool {
        self.unavailable.not_any()
    }

    /// Whether the bits are a synthetic pointer, which has no contents of its own.
    pub fn bits_synthetic_pointer(&self, offset_bits: u64, len_bits: u64) -> bool {
        match &self.lval {
            Lvalue::Computed(pieces) => pieces.bits_synthetic_pointer(offset_bits, len_bits),
            _ => false,
        }
    }

    /// Read the contents of a lazy value.
    pub fn fetch(&mut self, services: &mut dyn ExpressionServices) -> Result<(), ExpressionError> {
        if self.contents.is_some() {
            return Ok(());
        }
        let len = self.ty.len();
        let mut bytes = vec![0; len];
        match &self.lval {
            Lvalue::Memory { address, .. } => match services.read_memory(*address, &mut bytes) {
                Ok(()) => {}
                Err(ExpressionError::NotAvailable(message)) => {
                    tracing::debug!("value at {address:#x} is unavailable: {message}");
                    self.unavailable.fill(true);
                    bytes.fill(0);
                }
                Err(error) => return Err(error),
            },
            Lvalue::Register {
                frame,
                register,
                offset,
            } => {
                let register_bytes = services.read_register(*frame, *register)?;
                let end = offset + len;
                if end > register_bytes.len() {
                    return Err(ExpressionError::InvalidExpression(format!(
                        "register {register} is too small for a {len} byte value"
                    )));
                }
                bytes.copy_from_slice(&register_bytes[*offset..end]);
            }
            Lvalue::Computed(pieces) => {
                let read = pieces.read(services, len)?;
                bytes = read.bytes;
                self.unavailable = read.unavailable;
                self.optimized_out = read.optimized_out;
            }
            Lvalue::NotLvalue | Lvalue::EntryData(_) => {}
        }
        self.contents = Some(bytes);
        Ok(())
    }

    /// The contents, fetching them first if needed.
    pub fn bytes(&mut self, services: &mut dyn ExpressionServices) -> Result<&[u8], ExpressionError> {
        self.fetch(services)?;
        Ok(self.contents.as_deref().unwrap_or_default())
    }

    /// Interpret the contents as an unsigned address.
    pub fn as_address(&mut self, services: &mut dyn ExpressionServices) -> Result<u64, ExpressionError> {
        let byte_order = self.byte_order;
        let size = self.ty.byte_size.clamp(1, 8) as u8;
        self.fetch(services)?;
        if self.optimized_out.any() {
            return Err(ExpressionError::OptimizedOut(
                "value has been optimized out".to_string(),
            ));
        }
        if self.unavailable.any() {
            return Err(ExpressionError::NotAvailable("value is not available".to_string()));
        }
        let bytes = self.contents.as_deref().unwrap_or_default();
        Ok(TypedValue::from_bytes(BaseType::unsigned(size), bytes, byte_order).as_u64())
    }

    /// Write `data` to the storage of the value and update its contents.
    pub fn assign(
        &mut self,
        services: &mut dyn ExpressionServices,
        data: &[u8],
    ) -> Result<(), ExpressionError> {
        if data.len() != self.ty.len() {
            return Err(ExpressionError::Other(format!(
                "Cannot assign {} bytes to a value of {} bytes",
                data.len(),
                self.ty.byte_size
            )));
        }
        match &self.lval {
            Lvalue::NotLvalue => {
                return Err(ExpressionError::Other(
                    "Left operand of assignment is not an lvalue.".to_string(),
                ))
            }
            Lvalue::EntryData(_) => {
                return Err(ExpressionError::Other(
                    "Cannot assign to a parameter value at function entry.".to_string(),
                ))
            }
            Lvalue::Memory { address, .. } => services.write_memory(*address, data)?,
            Lvalue::Register {
                frame,
                register,
                offset,
            } => {
                let mut register_bytes = services.read_register(*frame, *register)?;
                let end = offset + data.len();
                if end > register_bytes.len() {
                    return Err(ExpressionError::InvalidExpression(format!(
                        "register {register} is too small for a {} byte value",
                        data.len()
                    )));
                }
                register_bytes[*offset..end].copy_from_slice(data);
                services.write_register(*frame, *register, &register_bytes)?;
            }
            Lvalue::Computed(pieces) => {
                let optimized_out = pieces.write(services, data)?;
                if optimized_out.any() {
                    tracing::warn!("assignment could not write {} bits", optimized_out.count_ones());
                }
                self.optimized_out = optimized_out;
            }
        }
        self.contents = Some(data.to_vec());
        self.unavailable.fill(false);
        Ok(())
    }

    /// The value a pointer or reference refers to.
    ///
    /// Synthetic pointers are followed to the variable they point at, entry value references
    /// resolve their target in the caller, anything else is a lazy value in memory.
    pub fn deref(&mut self, services: &mut dyn ExpressionServices) -> Result<Value, ExpressionError> {
        let Some(target) = self.ty.target().cloned() else {
            return Err(ExpressionError::Other(
                "Attempt to take contents of a non-pointer value.".to_string(),
            ));
        };

        if let Lvalue::EntryData(entry) = &mut self.lval {
            return entry.resolve(services).cloned();
        }

        if let Lvalue::Computed(pieces) = &self.lval {
            if pieces.bits_synthetic_pointer(0, 8 * self.ty.byte_size) {
                let pieces = pieces.clone();
                let ty = self.ty.clone();
                let contents = self.bytes(services)?.to_vec();
                if let Some(value) = pieces.indirect(services, &ty, &contents)? {
                    return Ok(value);
                }
            }
        }

        let address = self.as_address(services)?;
        Ok(Value::lazy_memory(target, address, false, self.byte_order))
    }

    /// Dereference the value if it is a reference.
    pub fn coerce_ref(&mut self, services: &mut dyn ExpressionServices) -> Result<Option<Value>, ExpressionError> {
        match self.ty.kind {
            TypeKind::Reference(_) => self.deref(services).map(Some),
            _ => Ok(None),
        }
    }
}

fn mask_any(mask: &BitMask, offset_bits: u64, len_bits: u64) -> bool {
    let start = (offset_bits as usize).min(mask.len());
    let end = (start + len_bits as usize).min(mask.len());
    mask[start..end].any()
}

fn run(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    frame: Option<FrameId>,
    bytecode: &[u8],
) -> Result<ExpressionResult, ExpressionError> {
    let mut context = ExpressionContext::new(services, config, frame);
    context.evaluate(bytecode)?;
    context.finish()
}

/// Evaluate a location description and turn its result into a [`Value`] of type `ty`.
///
/// With a `subobject`, the returned value is the part of the object at its byte offset, as
/// used when following synthetic pointers. Unavailable target state yields an unavailable
/// value, and a failed entry value yields an optimized out value.
pub fn evaluate_location_description(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    frame: Option<FrameId>,
    bytecode: &[u8],
    ty: &ValueType,
    subobject: Option<Subobject>,
) -> Result<Value, ExpressionError> {
    let Subobject {
        ty: subobject_ty,
        byte_offset,
    } = subobject.unwrap_or_else(|| Subobject {
        ty: ty.clone(),
        byte_offset: 0,
    });
    let byte_offset = u64::try_from(byte_offset).map_err(|_| ExpressionError::InvalidSyntheticPointer)?;
    let byte_order = config.byte_order;

    if bytecode.is_empty() {
        return Ok(Value::optimized_out(subobject_ty, byte_order));
    }

    let result = match run(services, config, frame, bytecode) {
        Ok(result) => result,
        Err(ExpressionError::NotAvailable(message)) => {
            tracing::debug!("location is unavailable: {message}");
            return Ok(Value::unavailable(subobject_ty, byte_order));
        }
        Err(ExpressionError::NoEntryValue(message)) => {
            tracing::debug!("location needs an entry value: {message}");
            return Ok(Value::optimized_out(subobject_ty, byte_order));
        }
        Err(error) => return Err(error),
    };

    let len = subobject_ty.len();
    let mut value = match result.location {
        ResultLocation::Pieces(pieces) => {
            if total_bits(&pieces) > 8 * ty.byte_size {
                return Err(ExpressionError::InvalidSyntheticPointer);
            }
            let pieces = PiecedValue::new(pieces, frame, config).subvalue(byte_offset);
            Value::lazy_computed(subobject_ty, pieces, byte_order)
        }
        ResultLocation::Single(PieceLocation::Register(register)) => {
            if byte_offset != 0 {
                return Err(ExpressionError::Other(
                    "cannot use offset on synthetic pointer to register".to_string(),
                ));
            }
            let frame = frame.ok_or_else(|| {
                ExpressionError::UnsupportedInContext(
                    "Register locations need a frame.".to_string(),
                )
            })?;
            match services.read_register(frame, register) {
                Ok(register_bytes) => {
                    if register_bytes.len() < len {
                        return Err(ExpressionError::InvalidExpression(format!(
                            "register {register} is too small for a {len} byte value"
                        )));
                    }
                    // The value occupies the low end of the register.
                    let offset = if byte_order.is_big() {
                        register_bytes.len() - len
                    } else {
                        0
                    };
                    let lval = Lvalue::Register {
                        frame,
                        register,
                        offset,
                    };
                    let contents = register_bytes[offset..offset + len].to_vec();
                    Value::with_lval(subobject_ty, lval, byte_order, Some(contents))
                }
                Err(ExpressionError::OptimizedOut(_)) => {
                    let mut value = Value::optimized_out(subobject_ty, byte_order);
                    value.lval = Lvalue::Register {
                        frame,
                        register,
                        offset: 0,
                    };
                    value
                }
                Err(ExpressionError::NotAvailable(_)) => {
                    let mut value = Value::unavailable(subobject_ty, byte_order);
                    value.lval = Lvalue::Register {
                        frame,
                        register,
                        offset: 0,
                    };
                    value
                }
                Err(error) => return Err(error),
            }
        }
        ResultLocation::Single(PieceLocation::Memory {
            address,
            in_stack_memory,
        }) => Value::lazy_memory(
            subobject_ty,
            address.wrapping_add(byte_offset),
            in_stack_memory,
            byte_order,
        ),
        ResultLocation::Single(PieceLocation::StackValue(stack_value)) => {
            let start = byte_offset as usize;
            if start + len > ty.len() {
                return Err(ExpressionError::InvalidSyntheticPointer);
            }
            let bytes = extend_to(stack_value, ty.len(), byte_order);
            Value::from_bytes(subobject_ty, bytes[start..start + len].to_vec(), byte_order)
        }
        ResultLocation::Single(PieceLocation::Literal(data)) => {
            let start = byte_offset as usize;
            if start + len > data.len() {
                return Err(ExpressionError::InvalidSyntheticPointer);
            }
            Value::from_bytes(subobject_ty, data[start..start + len].to_vec(), byte_order)
        }
        ResultLocation::Single(PieceLocation::OptimizedOut)
        | ResultLocation::Single(PieceLocation::ImplicitPointer { .. }) => {
            Value::optimized_out(subobject_ty, byte_order)
        }
    };
    value.initialized = result.initialized;
    Ok(value)
}

/// Encode a stack value in `size` bytes, extending by its signedness or truncating high bytes.
fn extend_to(value: TypedValue, size: usize, byte_order: ByteOrder) -> Vec<u8> {
    let mut bytes = value.to_bytes(byte_order);
    let negative = value.ty().is_signed() && !value.ty().is_float() && value.as_i64() < 0;
    let fill = if negative { 0xff } else { 0 };
    if byte_order.is_big() {
        if bytes.len() < size {
            let mut extended = vec![fill; size - bytes.len()];
            extended.extend_from_slice(&bytes);
            bytes = extended;
        } else {
            bytes.drain(..bytes.len() - size);
        }
    } else {
        bytes.resize(size, fill);
    }
    bytes
}

#[cfg(test)]
mod test {
    use gimli::DebugInfoOffset;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        services::SyntheticPointerTarget,
        test::{init_logging, Asm, MockFrame, MockTarget},
    };

    fn target_with_frame() -> (MockTarget, FrameId) {
        let mut target = MockTarget::default();
        let frame = target.add_frame(
            MockFrame::default()
                .with_register(0, 0x1000)
                .with_register(1, 0x0102_0304_0506_0708),
        );
        target.memory.add_range(0x1000, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        (target, frame)
    }

    fn evaluate(
        target: &mut MockTarget,
        frame: FrameId,
        bytecode: &[u8],
        ty: &ValueType,
    ) -> Result<Value, ExpressionError> {
        init_logging();
        evaluate_location_description(target, EvaluationConfig::default(), Some(frame), bytecode, ty, None)
    }

    #[test]
    fn empty_expression_is_optimized_out() {
        let (mut target, frame) = target_with_frame();
        let value = evaluate(&mut target, frame, &[], &ValueType::scalar(4)).unwrap();
        assert!(value.is_optimized_out());
    }

    #[test]
    fn memory_location_is_lazy() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new().op(gimli::DW_OP_breg0).sleb(2).build();
        let mut value = evaluate(&mut target, frame, &bytecode, &ValueType::scalar(2)).unwrap();
        assert!(value.is_lazy());
        assert_eq!(value.address(), Some(0x1002));
        assert_eq!(value.bytes(&mut target).unwrap(), &[0x33, 0x44]);

        value.assign(&mut target, &[0xab, 0xcd]).unwrap();
        assert_eq!(target.memory.bytes(0x1000, 4), vec![0x11, 0x22, 0xab, 0xcd]);
    }

    #[test]
    fn unreadable_memory_is_unavailable() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new().op(gimli::DW_OP_addr).u64(0x9000).build();
        let mut value = evaluate(&mut target, frame, &bytecode, &ValueType::scalar(4)).unwrap();
        value.fetch(&mut target).unwrap();
        assert!(!value.is_entirely_available());
        assert!(value.unavailable_bits().all());
    }

    #[test]
    fn register_location_uses_low_bytes() {
        let (mut target, frame) = target_with_frame();
        let mut value = evaluate(&mut target, frame, &[gimli::DW_OP_reg1.0], &ValueType::scalar(4)).unwrap();
        assert_eq!(value.contents(), Some(&[0x08, 0x07, 0x06, 0x05][..]));

        value.assign(&mut target, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            target.register(frame, 1),
            vec![1, 2, 3, 4, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn missing_register_is_unavailable() {
        let (mut target, frame) = target_with_frame();
        let value = evaluate(&mut target, frame, &[gimli::DW_OP_reg7.0], &ValueType::scalar(8)).unwrap();
        assert!(value.unavailable_bits().all());
    }

    #[test]
    fn stack_value_is_extended_to_the_type() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new()
            .op(gimli::DW_OP_lit1)
            .op(gimli::DW_OP_neg)
            .op(gimli::DW_OP_stack_value)
            .build();
        let value = evaluate(&mut target, frame, &bytecode, &ValueType::scalar(16)).unwrap();
        assert_eq!(value.contents(), Some(&[0xff; 16][..]));

        let bytecode = Asm::new()
            .op(gimli::DW_OP_const2u)
            .u16(0x1234)
            .op(gimli::DW_OP_stack_value)
            .build();
        let value = evaluate(&mut target, frame, &bytecode, &ValueType::scalar(1)).unwrap();
        assert_eq!(value.contents(), Some(&[0x34][..]));
    }

    #[test]
    fn subobject_of_literal_is_bounds_checked() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new()
            .op(gimli::DW_OP_implicit_value)
            .uleb(4)
            .bytes(&[1, 2, 3, 4])
            .build();
        let ty = ValueType::scalar(4);
        let part = evaluate_location_description(
            &mut target,
            EvaluationConfig::default(),
            Some(frame),
            &bytecode,
            &ty,
            Some(Subobject {
                ty: ValueType::scalar(2),
                byte_offset: 2,
            }),
        )
        .unwrap();
        assert_eq!(part.contents(), Some(&[3, 4][..]));

        let error = evaluate_location_description(
            &mut target,
            EvaluationConfig::default(),
            Some(frame),
            &bytecode,
            &ty,
            Some(Subobject {
                ty: ValueType::scalar(2),
                byte_offset: 3,
            }),
        )
        .unwrap_err();
        assert!(matches!(error, ExpressionError::InvalidSyntheticPointer));
    }

    #[test]
    fn oversized_pieces_are_rejected() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new()
            .op(gimli::DW_OP_reg0)
            .op(gimli::DW_OP_piece)
            .uleb(8)
            .build();
        let error = evaluate(&mut target, frame, &bytecode, &ValueType::scalar(4)).unwrap_err();
        assert!(matches!(error, ExpressionError::InvalidSyntheticPointer));
    }

    #[test]
    fn pieced_value_is_fetched_from_pieces() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new()
            .op(gimli::DW_OP_reg1)
            .op(gimli::DW_OP_piece)
            .uleb(2)
            .op(gimli::DW_OP_piece)
            .uleb(2)
            .build();
        let mut value = evaluate(&mut target, frame, &bytecode, &ValueType::scalar(4)).unwrap();
        assert!(value.bits_any_optimized_out(16, 16));
        assert!(!value.bits_any_optimized_out(0, 16));
        value.fetch(&mut target).unwrap();
        assert_eq!(value.contents(), Some(&[0x08, 0x07, 0, 0][..]));
    }

    #[test]
    fn uninit_is_reported() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new()
            .op(gimli::DW_OP_breg0)
            .sleb(0)
            .op(crate::bytecode::DW_OP_GNU_UNINIT)
            .build();
        let value = evaluate(&mut target, frame, &bytecode, &ValueType::scalar(4)).unwrap();
        assert!(!value.initialized());
    }

    #[test]
    fn implicit_pointer_is_followed() {
        let (mut target, frame) = target_with_frame();
        target.synthetic_pointers.insert(
            DebugInfoOffset(0x80),
            SyntheticPointerTarget::Location {
                expression: vec![gimli::DW_OP_breg0.0, 0],
                byte_size: 8,
            },
        );
        target
            .synthetic_pointers
            .insert(DebugInfoOffset(0x90), SyntheticPointerTarget::ConstValue(vec![5, 6, 7]));

        let pointer_to = |die: u32, offset: i64| {
            Asm::new()
                .op(gimli::DW_OP_implicit_pointer)
                .u32(die)
                .sleb(offset)
                .build()
        };
        let ty = ValueType::pointer(8, ValueType::scalar(2));

        let mut pointer = evaluate(&mut target, frame, &pointer_to(0x80, 4), &ty).unwrap();
        assert!(pointer.bits_synthetic_pointer(0, 64));
        let mut pointee = pointer.deref(&mut target).unwrap();
        assert_eq!(pointee.address(), Some(0x1004));
        assert_eq!(pointee.bytes(&mut target).unwrap(), &[0x55, 0x66]);

        let mut pointer = evaluate(&mut target, frame, &pointer_to(0x90, 1), &ty).unwrap();
        let pointee = pointer.deref(&mut target).unwrap();
        assert_eq!(pointee.contents(), Some(&[6, 7][..]));

        let mut pointer = evaluate(&mut target, frame, &pointer_to(0x90, 2), &ty).unwrap();
        assert!(matches!(
            pointer.deref(&mut target),
            Err(ExpressionError::InvalidSyntheticPointer)
        ));

        let mut pointer = evaluate(&mut target, frame, &pointer_to(0xa0, 0), &ty).unwrap();
        assert!(pointer.deref(&mut target).unwrap().is_optimized_out());
    }

    #[test]
    fn ordinary_pointer_dereferences_memory() {
        let (mut target, frame) = target_with_frame();
        let bytecode = Asm::new()
            .op(gimli::DW_OP_breg0)
            .sleb(4)
            .op(gimli::DW_OP_stack_value)
            .build();
        let mut pointer = evaluate(
            &mut target,
            frame,
            &bytecode,
            &ValueType::pointer(8, ValueType::scalar(1)),
        )
        .unwrap();
        let mut pointee = pointer.deref(&mut target).unwrap();
        assert_eq!(pointee.bytes(&mut target).unwrap(), &[0x55]);
    }
}
