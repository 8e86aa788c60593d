use gimli::{DebugInfoOffset, DwOp, UnitOffset};

use crate::{
    bytecode::{self, op_name, require_composition, OpReader},
    call_site::ParameterKind,
    context::ExpressionContext,
    piece::LocationKind,
    services::DieReference,
    value::{BaseType, BaseTypeEncoding, TypedValue},
    ExpressionError,
};

impl ExpressionContext<'_> {
    /// Evaluate `bytecode` on this context.
    ///
    /// Nested evaluations count against the recursion limit of the context.
    pub fn evaluate(&mut self, bytecode: &[u8]) -> Result<(), ExpressionError> {
        if self.recursion_depth >= self.config.max_recursion_depth {
            return Err(ExpressionError::RecursionLimitExceeded(self.recursion_depth));
        }
        self.recursion_depth += 1;
        let result = self.execute_stack_op(bytecode);
        self.recursion_depth -= 1;
        result
    }

    fn lookup_base_type(&mut self, offset: u64) -> Result<BaseType, ExpressionError> {
        self.services
            .base_type(UnitOffset(offset as usize))?
            .validate()
    }

    fn frame_base_expression(&mut self) -> Result<Vec<u8>, ExpressionError> {
        let frame = self.require_frame("DW_OP_fbreg")?;
        if let Some((cached, expression)) = &self.frame_base_cache {
            if *cached == frame {
                return Ok(expression.clone());
            }
        }
        let expression = self.services.frame_base_expression(frame)?;
        self.frame_base_cache = Some((frame, expression.clone()));
        Ok(expression)
    }

    fn read_die_offset(&self, reader: &mut OpReader<'_>, op: DwOp) -> Result<u64, ExpressionError> {
        match self.config.ref_address_size {
            Some(size) => reader.read_sized(size),
            None => Err(ExpressionError::UnsupportedInContext(format!(
                "{} is not allowed in frame context",
                op_name(op)
            ))),
        }
    }

    fn binary_op(&mut self, op: DwOp) -> Result<TypedValue, ExpressionError> {
        let name = op_name(op);
        let second = self.stack.pop(name)?.value;
        let first = self.stack.pop(name)?.value;
        if !first.ty().compatible_with(second.ty()) {
            return Err(ExpressionError::TypeMismatch);
        }
        let truth = |value: bool| self.generic(u64::from(value));
        let result = match op {
            gimli::DW_OP_and => first.and(second)?,
            gimli::DW_OP_div => first.div(second)?,
            gimli::DW_OP_minus => first.sub(second)?,
            gimli::DW_OP_mod => {
                // Untyped values use unsigned arithmetic.
                if first.ty().encoding == BaseTypeEncoding::Generic {
                    let unsigned = first.ty().to_unsigned();
                    let result = first
                        .convert(unsigned)
                        .rem(second.convert(unsigned))?;
                    TypedValue::from_bits(first.ty(), result.as_u64())
                } else {
                    first.rem(second)?
                }
            }
            gimli::DW_OP_mul => first.mul(second)?,
            gimli::DW_OP_or => first.or(second)?,
            gimli::DW_OP_plus => first.add(second)?,
            gimli::DW_OP_shl => first.shl(second)?,
            gimli::DW_OP_shr => first.shr(second)?,
            gimli::DW_OP_shra => first.shra(second)?,
            gimli::DW_OP_xor => first.xor(second)?,
            // A <= B is !(B < A).
            gimli::DW_OP_le => truth(!second.less_than(&first)?),
            // A >= B is !(A < B).
            gimli::DW_OP_ge => truth(!first.less_than(&second)?),
            gimli::DW_OP_eq => truth(first.equals(&second)?),
            gimli::DW_OP_lt => truth(first.less_than(&second)?),
            // A > B is B < A.
            gimli::DW_OP_gt => truth(second.less_than(&first)?),
            gimli::DW_OP_ne => truth(!first.equals(&second)?),
            _ => return Err(ExpressionError::UnknownOpcode(op)),
        };
        Ok(result)
    }

    fn dereference(
        &mut self,
        op: DwOp,
        size: u8,
        ty: Option<BaseType>,
    ) -> Result<TypedValue, ExpressionError> {
        if !(1..=8).contains(&size) {
            return Err(ExpressionError::InvalidExpression(format!(
                "{} of {size} bytes",
                op_name(op)
            )));
        }
        let address = self.fetch_address(0)?;
        self.stack.pop(op_name(op))?;
        let mut buffer = vec![0; usize::from(size)];
        self.services.read_memory(address, &mut buffer)?;
        let raw = TypedValue::from_bytes(BaseType::unsigned(8), &buffer, self.config.byte_order);
        Ok(match ty {
            // Typed loads of signed bases keep the sign of the loaded bytes.
            Some(ty) if ty.is_signed() && !ty.is_float() => {
                TypedValue::from_bytes(ty, &buffer, self.config.byte_order)
            }
            Some(ty) => TypedValue::from_bits(ty, raw.as_u64()),
            None => self.generic(raw.as_u64()),
        })
    }

    fn execute_stack_op(&mut self, expression: &[u8]) -> Result<(), ExpressionError> {
        let mut reader = OpReader::new(expression, self.config.endian());
        self.location = LocationKind::Memory;
        self.initialized = true;

        while !reader.is_empty() {
            let op_offset = reader.offset();
            let op = reader.read_op()?;
            tracing::trace!("{:#06x}: {}", op_offset, op_name(op));

            // Operations that re-enter the interpreter stay out of the large dispatch frame,
            // which keeps the stack used per nesting level small.
            match op {
                gimli::DW_OP_fbreg => self.execute_fbreg(&mut reader)?,
                gimli::DW_OP_call2 | gimli::DW_OP_call4 | gimli::DW_OP_call_ref => {
                    self.execute_call(&mut reader, op)?
                }
                gimli::DW_OP_entry_value | bytecode::DW_OP_GNU_ENTRY_VALUE => {
                    self.execute_entry_value(&mut reader)?
                }
                bytecode::DW_OP_GNU_PARAMETER_REF => {
                    let offset = reader.read_u32()?;
                    self.push_entry_value(ParameterKind::ParamOffset(UnitOffset(offset as usize)), None)?;
                }
                _ => self.execute_simple_op(&mut reader, op_offset, op)?,
            }
        }

        Ok(())
    }

    fn execute_fbreg(&mut self, reader: &mut OpReader<'_>) -> Result<(), ExpressionError> {
        let offset = reader.read_sleb128()?;
        let expression = self.frame_base_expression()?;

        // Evaluate the frame base on an empty stack, then put the original one back.
        let saved_stack = self.stack.take();
        self.evaluate(&expression)?;
        let base = match self.location {
            LocationKind::Memory => self.fetch_address(0)?,
            LocationKind::Register => {
                let reg = self.fetch_register_number(0)?;
                self.read_register_address(reg)?
            }
            _ => {
                return Err(ExpressionError::InvalidExpression(
                    "Not implemented: computing frame base using explicit value operator".to_string(),
                ))
            }
        };
        self.stack = saved_stack;
        self.location = LocationKind::Memory;
        let address = self.generic(base.wrapping_add(offset as u64));
        self.push(address, true);
        Ok(())
    }

    fn execute_call(&mut self, reader: &mut OpReader<'_>, op: DwOp) -> Result<(), ExpressionError> {
        let die = match op {
            gimli::DW_OP_call2 => DieReference::Unit(UnitOffset(usize::from(reader.read_u16()?))),
            gimli::DW_OP_call4 => DieReference::Unit(UnitOffset(reader.read_u32()? as usize)),
            _ => DieReference::DebugInfo(DebugInfoOffset(self.read_die_offset(reader, op)? as usize)),
        };
        let expression = self.services.subroutine_location(die)?;
        self.evaluate(&expression)
    }

    fn execute_entry_value(&mut self, reader: &mut OpReader<'_>) -> Result<(), ExpressionError> {
        let len = reader.read_uleb128()?;
        let block = reader.read_bytes(len).map_err(|_| {
            ExpressionError::InvalidExpression("DW_OP_entry_value: too few bytes available.".to_string())
        })?;
        if let Some(reg) = bytecode::block_to_dwarf_reg(block) {
            self.push_entry_value(ParameterKind::DwarfReg(gimli::Register(reg)), None)
        } else if let Some((reg, size)) = bytecode::block_to_dwarf_reg_deref(block, self.config.address_size) {
            self.push_entry_value(ParameterKind::DwarfReg(gimli::Register(reg)), Some(size))
        } else {
            Err(ExpressionError::InvalidExpression(
                "DW_OP_entry_value is supported only for single DW_OP_reg* or for DW_OP_breg*(0)+DW_OP_deref*"
                    .to_string(),
            ))
        }
    }

    /// One operation that does not nest another evaluation.
    #[inline(never)]
    fn execute_simple_op(
        &mut self,
        reader: &mut OpReader<'_>,
        op_offset: usize,
        op: DwOp,
    ) -> Result<(), ExpressionError> {
        // Only operations that know better mark their result as a stack address.
        let mut in_stack_memory = false;

        let result = match op {
            DwOp(lit) if (gimli::DW_OP_lit0.0..=gimli::DW_OP_lit31.0).contains(&lit) => {
                Some(self.generic(u64::from(lit - gimli::DW_OP_lit0.0)))
            }
            gimli::DW_OP_addr => {
                let address = reader.read_sized(self.config.address_size)?;
                Some(self.generic(address.wrapping_add(self.config.base_offset)))
            }
            gimli::DW_OP_addrx | bytecode::DW_OP_GNU_ADDR_INDEX => {
                let index = reader.read_uleb128()?;
                let address = self.services.address_index(index)?;
                Some(self.generic(address.wrapping_add(self.config.base_offset)))
            }
            gimli::DW_OP_constx | bytecode::DW_OP_GNU_CONST_INDEX => {
                let index = reader.read_uleb128()?;
                let value = self.services.address_index(index)?;
                Some(self.generic(value))
            }
            gimli::DW_OP_const1u => Some(self.generic(u64::from(reader.read_u8()?))),
            gimli::DW_OP_const1s => Some(self.generic(i64::from(reader.read_i8()?) as u64)),
            gimli::DW_OP_const2u => Some(self.generic(u64::from(reader.read_u16()?))),
            gimli::DW_OP_const2s => Some(self.generic(i64::from(reader.read_i16()?) as u64)),
            gimli::DW_OP_const4u => Some(self.generic(u64::from(reader.read_u32()?))),
            gimli::DW_OP_const4s => Some(self.generic(i64::from(reader.read_i32()?) as u64)),
            gimli::DW_OP_const8u => Some(self.generic(reader.read_u64()?)),
            gimli::DW_OP_const8s => Some(self.generic(reader.read_i64()? as u64)),
            gimli::DW_OP_constu => Some(self.generic(reader.read_uleb128()?)),
            gimli::DW_OP_consts => Some(self.generic(reader.read_sleb128()? as u64)),

            DwOp(reg) if (gimli::DW_OP_reg0.0..=gimli::DW_OP_reg31.0).contains(&reg) => {
                require_composition(reader.remaining(), op)?;
                self.location = LocationKind::Register;
                Some(self.generic(u64::from(reg - gimli::DW_OP_reg0.0)))
            }
            gimli::DW_OP_regx => {
                let reg = reader.read_uleb128()?;
                require_composition(reader.remaining(), op)?;
                self.location = LocationKind::Register;
                Some(self.generic(reg))
            }
            gimli::DW_OP_implicit_value => {
                let len = reader.read_uleb128()?;
                self.literal = reader.read_bytes(len)?.to_vec();
                self.location = LocationKind::Literal;
                require_composition(reader.remaining(), op)?;
                None
            }
            gimli::DW_OP_stack_value => {
                self.location = LocationKind::StackValue;
                require_composition(reader.remaining(), op)?;
                None
            }
            gimli::DW_OP_implicit_pointer | bytecode::DW_OP_GNU_IMPLICIT_POINTER => {
                let die = self.read_die_offset(reader, op)?;
                let offset = reader.read_sleb128()?;
                self.implicit_pointer_die = Some(DebugInfoOffset(die as usize));
                self.location = LocationKind::ImplicitPointer;
                require_composition(reader.remaining(), op)?;
                // The byte offset is kept on the stack for the piece.
                Some(self.generic(offset as u64))
            }

            DwOp(breg) if (gimli::DW_OP_breg0.0..=gimli::DW_OP_breg31.0).contains(&breg) => {
                let offset = reader.read_sleb128()?;
                let base = self.read_register_address(u16::from(breg - gimli::DW_OP_breg0.0))?;
                Some(self.generic(base.wrapping_add(offset as u64)))
            }
            gimli::DW_OP_bregx => {
                let reg = reader.read_uleb128()?;
                let offset = reader.read_sleb128()?;
                let reg = u16::try_from(reg).map_err(|_| {
                    ExpressionError::InvalidExpression(format!("register number {reg} out of range"))
                })?;
                let base = self.read_register_address(reg)?;
                Some(self.generic(base.wrapping_add(offset as u64)))
            }

            gimli::DW_OP_dup => {
                let entry = *self.stack.fetch(0, op_name(op))?;
                in_stack_memory = entry.in_stack_memory;
                Some(entry.value)
            }
            gimli::DW_OP_drop => {
                self.stack.pop(op_name(op))?;
                None
            }
            gimli::DW_OP_pick => {
                let index = reader.read_u8()?;
                let entry = *self.stack.fetch(usize::from(index), op_name(op))?;
                in_stack_memory = entry.in_stack_memory;
                Some(entry.value)
            }
            gimli::DW_OP_over => {
                let entry = *self.stack.fetch(1, op_name(op))?;
                in_stack_memory = entry.in_stack_memory;
                Some(entry.value)
            }
            gimli::DW_OP_swap => {
                self.stack.swap(op_name(op))?;
                None
            }
            gimli::DW_OP_rot => {
                self.stack.rot(op_name(op))?;
                None
            }

            gimli::DW_OP_deref => {
                let size = self.config.address_size;
                Some(self.dereference(op, size, None)?)
            }
            gimli::DW_OP_deref_size => {
                let size = reader.read_u8()?;
                Some(self.dereference(op, size, None)?)
            }
            gimli::DW_OP_deref_type | bytecode::DW_OP_GNU_DEREF_TYPE => {
                let size = reader.read_u8()?;
                let ty = self.lookup_base_type(reader.read_uleb128()?)?;
                Some(self.dereference(op, size, Some(ty))?)
            }

            gimli::DW_OP_abs | gimli::DW_OP_neg | gimli::DW_OP_not | gimli::DW_OP_plus_uconst => {
                let value = self.stack.pop(op_name(op))?.value;
                Some(match op {
                    gimli::DW_OP_abs => value.abs(),
                    gimli::DW_OP_neg => value.neg(),
                    gimli::DW_OP_not => value.not()?,
                    _ => {
                        if !value.ty().is_integral() {
                            return Err(ExpressionError::IntegralTypeExpected);
                        }
                        let addend = reader.read_uleb128()?;
                        self.generic((value.as_integer() as u64).wrapping_add(addend))
                    }
                })
            }

            gimli::DW_OP_and
            | gimli::DW_OP_div
            | gimli::DW_OP_minus
            | gimli::DW_OP_mod
            | gimli::DW_OP_mul
            | gimli::DW_OP_or
            | gimli::DW_OP_plus
            | gimli::DW_OP_shl
            | gimli::DW_OP_shr
            | gimli::DW_OP_shra
            | gimli::DW_OP_xor
            | gimli::DW_OP_le
            | gimli::DW_OP_ge
            | gimli::DW_OP_eq
            | gimli::DW_OP_lt
            | gimli::DW_OP_gt
            | gimli::DW_OP_ne => Some(self.binary_op(op)?),

            gimli::DW_OP_call_frame_cfa => {
                let frame = self.require_frame("DW_OP_call_frame_cfa")?;
                let cfa = self.services.call_frame_cfa(frame)?;
                in_stack_memory = true;
                Some(self.generic(cfa))
            }
            gimli::DW_OP_form_tls_address | bytecode::DW_OP_GNU_PUSH_TLS_ADDRESS => {
                let offset = self.stack.pop(op_name(op))?.value.as_u64();
                let address = self.services.tls_address(self.frame, offset)?;
                Some(self.generic(address))
            }
            gimli::DW_OP_push_object_address => {
                let address = self.object_address.ok_or_else(|| {
                    ExpressionError::UnsupportedInContext("Location address is not set.".to_string())
                })?;
                Some(self.generic(address))
            }

            gimli::DW_OP_skip => {
                let displacement = reader.read_i16()?;
                reader.jump(op_offset, displacement)?;
                None
            }
            gimli::DW_OP_bra => {
                let displacement = reader.read_i16()?;
                let condition = self.stack.pop(op_name(op))?.value;
                if !condition.ty().is_integral() {
                    return Err(ExpressionError::IntegralTypeExpected);
                }
                if condition.is_true() {
                    reader.jump(op_offset, displacement)?;
                }
                None
            }
            gimli::DW_OP_nop => None,

            gimli::DW_OP_piece | gimli::DW_OP_bit_piece => {
                let (size_bits, offset_bits) = if op == gimli::DW_OP_piece {
                    (reader.read_uleb128()?.saturating_mul(8), 0)
                } else {
                    (reader.read_uleb128()?, reader.read_uleb128()?)
                };
                if size_bits == 0 {
                    return Err(ExpressionError::EmptyPiece { offset: op_offset });
                }
                self.add_piece(size_bits, offset_bits)?;
                // Pop the address or register number, and start the next piece in memory.
                if !matches!(self.location, LocationKind::Literal | LocationKind::OptimizedOut) {
                    self.stack.pop(op_name(op))?;
                }
                self.location = LocationKind::Memory;
                None
            }

            bytecode::DW_OP_GNU_UNINIT => {
                if !reader.is_empty() {
                    return Err(ExpressionError::InvalidExpression(
                        "DW_OP_GNU_uninit must always be the last operation".to_string(),
                    ));
                }
                self.initialized = false;
                None
            }

            gimli::DW_OP_const_type | bytecode::DW_OP_GNU_CONST_TYPE => {
                let ty = self.lookup_base_type(reader.read_uleb128()?)?;
                let len = reader.read_u8()?;
                let data = reader.read_bytes(u64::from(len))?;
                if ty.byte_size != len {
                    return Err(ExpressionError::InvalidExpression(
                        "DW_OP_const_type has different sizes for type and data".to_string(),
                    ));
                }
                Some(TypedValue::from_bytes(ty, data, self.config.byte_order))
            }
            gimli::DW_OP_regval_type | bytecode::DW_OP_GNU_REGVAL_TYPE => {
                let reg = reader.read_uleb128()?;
                let ty = self.lookup_base_type(reader.read_uleb128()?)?;
                let reg = u16::try_from(reg).map_err(|_| {
                    ExpressionError::InvalidExpression(format!("register number {reg} out of range"))
                })?;
                Some(self.read_register_typed(reg, ty)?)
            }
            gimli::DW_OP_convert
            | bytecode::DW_OP_GNU_CONVERT
            | gimli::DW_OP_reinterpret
            | bytecode::DW_OP_GNU_REINTERPRET => {
                let offset = reader.read_uleb128()?;
                let ty = if offset == 0 {
                    self.generic_type()
                } else {
                    self.lookup_base_type(offset)?
                };
                let value = self.stack.pop(op_name(op))?.value;
                Some(match op {
                    gimli::DW_OP_convert | bytecode::DW_OP_GNU_CONVERT => value.convert(ty),
                    _ if value.ty() == ty => value,
                    _ => value.reinterpret(ty)?,
                })
            }

            _ => return Err(ExpressionError::UnknownOpcode(op)),
        };

        if let Some(value) = result {
            self.stack.push(value, in_stack_memory);
        }
        Ok(())
    }
}
