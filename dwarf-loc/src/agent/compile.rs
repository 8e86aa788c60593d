use gimli::{DwOp, UnitOffset};

use crate::{
    agent::expr::{AgentExpr, AgentOp},
    bytecode::{self, op_name, require_composition, OpReader},
    config::{ByteOrder, EvaluationConfig},
    services::{CfaRule, DieReference, ExpressionServices},
    ExpressionError,
};

/// What the compiled code leaves on the agent stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentValue {
    /// The address of the value in memory.
    Memory,
    /// Nothing; the value lives in this agent register.
    Register(u16),
    /// The value itself.
    Rvalue,
}

impl AgentValue {
    /// Emit code that replaces the location with the `bits` wide value it holds.
    pub fn require_rvalue(
        self,
        expr: &mut AgentExpr,
        config: &EvaluationConfig,
        bits: u32,
    ) -> Result<(), ExpressionError> {
        match self {
            AgentValue::Memory => access_memory(expr, config.byte_order, bits),
            AgentValue::Register(register) => {
                expr.reg(register);
                Ok(())
            }
            AgentValue::Rvalue => Ok(()),
        }
    }
}

/// Read `bits` bits from the address on top of the agent stack.
pub fn access_memory(expr: &mut AgentExpr, byte_order: ByteOrder, bits: u32) -> Result<(), ExpressionError> {
    let bytes = bits.div_ceil(8);
    if !(1..=8).contains(&bytes) {
        return Err(ExpressionError::Other(format!("cannot read {bits} bits from memory")));
    }
    if expr.is_tracing() {
        expr.trace_quick(u64::from(bytes))?;
    }
    expr.simple(match bits {
        0..=8 => AgentOp::Ref8,
        9..=16 => AgentOp::Ref16,
        17..=32 => AgentOp::Ref32,
        _ => AgentOp::Ref64,
    });
    if 8 * bytes == bits {
        return Ok(());
    }
    // Keep the bits nearest to the start of the object.
    if byte_order.is_big() {
        expr.const_l(i64::from(8 * bytes - bits))?;
        expr.simple(AgentOp::RshUnsigned);
        Ok(())
    } else {
        expr.zero_ext(bits)
    }
}

/// Compile `bytecode` into `expr`, for evaluation by an agent at `expr.scope()`.
///
/// Only the subset of DWARF that needs neither a debugger nor type information
/// can be translated. Anything else fails with [`ExpressionError::Unimplemented`].
pub fn compile_expression(
    services: &mut dyn ExpressionServices,
    config: &EvaluationConfig,
    expr: &mut AgentExpr,
    bytecode: &[u8],
) -> Result<AgentValue, ExpressionError> {
    let mut compiler = Compiler {
        services,
        config: *config,
        expr,
        depth: 0,
    };
    compiler.compile(bytecode)
}

struct Compiler<'a> {
    services: &'a mut dyn ExpressionServices,
    config: EvaluationConfig,
    expr: &'a mut AgentExpr,
    depth: u32,
}

struct PendingJump {
    op_offset: usize,
    patch: usize,
    target: usize,
}

struct OpsState {
    location: AgentValue,
    jumps: Vec<PendingJump>,
    previous_piece: usize,
    bits_collected: u64,
}

impl Compiler<'_> {
    fn address_bits(&self) -> u32 {
        8 * u32::from(self.config.address_size)
    }

    fn compile(&mut self, bytecode: &[u8]) -> Result<AgentValue, ExpressionError> {
        if self.depth >= self.config.max_recursion_depth {
            return Err(ExpressionError::RecursionLimitExceeded(self.depth));
        }
        self.depth += 1;
        let result = self.compile_ops(bytecode);
        self.depth -= 1;
        result
    }

    fn signed_compare(&mut self, swap_before: bool, last: &[AgentOp]) -> Result<(), ExpressionError> {
        let bits = self.address_bits();
        self.expr.ext(bits)?;
        self.expr.simple(AgentOp::Swap);
        self.expr.ext(bits)?;
        if swap_before {
            self.expr.simple(AgentOp::Swap);
        }
        for op in last {
            self.expr.simple(*op);
        }
        Ok(())
    }

    fn add_offset(&mut self, offset: i64) -> Result<(), ExpressionError> {
        if offset != 0 {
            self.expr.const_l(offset)?;
            self.expr.simple(AgentOp::Add);
        }
        Ok(())
    }

    fn register(&mut self, dwarf_register: u64) -> Result<u16, ExpressionError> {
        let register = u16::try_from(dwarf_register).map_err(|_| {
            ExpressionError::InvalidExpression(format!("register number {dwarf_register} out of range"))
        })?;
        self.services.target_register(register)
    }

    fn compile_ops(&mut self, bytecode: &[u8]) -> Result<AgentValue, ExpressionError> {
        let mut reader = OpReader::new(bytecode, self.config.endian());
        // Agent offset of each DWARF operation, for resolving branches.
        let mut offsets = vec![None; bytecode.len() + 1];
        let mut state = OpsState {
            location: AgentValue::Memory,
            jumps: Vec::new(),
            previous_piece: 0,
            bits_collected: 0,
        };

        while !reader.is_empty() {
            let op_offset = reader.offset();
            offsets[op_offset] = Some(self.expr.len());
            let op = reader.read_op()?;
            tracing::trace!("{:#06x}: {}", op_offset, op_name(op));

            // Operations that compile nested expressions stay out of the large dispatch frame,
            // which keeps the stack used per nesting level small.
            match op {
                gimli::DW_OP_fbreg => state.location = self.compile_fbreg(&mut reader)?,
                gimli::DW_OP_call_frame_cfa => {
                    self.compile_cfa()?;
                    state.location = AgentValue::Memory;
                }
                gimli::DW_OP_call2 | gimli::DW_OP_call4 => state.location = self.compile_call(&mut reader, op)?,
                _ => self.compile_simple_op(&mut reader, op_offset, op, &mut state)?,
            }
        }
        offsets[bytecode.len()] = Some(self.expr.len());

        for jump in state.jumps {
            let target = offsets[jump.target].ok_or(ExpressionError::BadBranchTarget {
                offset: jump.op_offset,
                target: jump.target as i64,
            })?;
            self.expr.label(jump.patch, target)?;
        }

        // Composed pieces leave the assembled value.
        if state.bits_collected > 0 {
            Ok(AgentValue::Rvalue)
        } else {
            Ok(state.location)
        }
    }

    fn compile_fbreg(&mut self, reader: &mut OpReader<'_>) -> Result<AgentValue, ExpressionError> {
        let offset = reader.read_sleb128()?;
        let frame_base = self.services.frame_base_expression_at(self.expr.scope())?;
        // The frame base is compiled in place so that its code is emitted only once.
        let base = self.compile(&frame_base)?;
        if let AgentValue::Register(_) = base {
            base.require_rvalue(self.expr, &self.config, self.address_bits())?;
        }
        self.add_offset(offset)?;
        Ok(AgentValue::Memory)
    }

    fn compile_call(&mut self, reader: &mut OpReader<'_>, op: DwOp) -> Result<AgentValue, ExpressionError> {
        let offset = if op == gimli::DW_OP_call2 {
            usize::from(reader.read_u16()?)
        } else {
            reader.read_u32()? as usize
        };
        let body = self
            .services
            .subroutine_location(DieReference::Unit(UnitOffset(offset)))?;
        self.compile(&body)
    }

    /// One operation that does not compile a nested expression.
    #[inline(never)]
    fn compile_simple_op(
        &mut self,
        reader: &mut OpReader<'_>,
        op_offset: usize,
        op: DwOp,
        state: &mut OpsState,
    ) -> Result<(), ExpressionError> {
        match op {
            DwOp(lit) if (gimli::DW_OP_lit0.0..=gimli::DW_OP_lit31.0).contains(&lit) => {
                self.expr.const_l(i64::from(lit - gimli::DW_OP_lit0.0))?;
            }
            gimli::DW_OP_addr => {
                let mut address = reader.read_sized(self.config.address_size)?;
                // Followed by a TLS operation the operand is an offset, not an address.
                if reader.peek_op() != Some(bytecode::DW_OP_GNU_PUSH_TLS_ADDRESS) {
                    address = address.wrapping_add(self.config.base_offset);
                }
                self.expr.const_l(address as i64)?;
            }
            gimli::DW_OP_addrx | bytecode::DW_OP_GNU_ADDR_INDEX => {
                let index = reader.read_uleb128()?;
                let address = self.services.address_index(index)?;
                self.expr.const_l(address.wrapping_add(self.config.base_offset) as i64)?;
            }
            gimli::DW_OP_constx | bytecode::DW_OP_GNU_CONST_INDEX => {
                let index = reader.read_uleb128()?;
                let value = self.services.address_index(index)?;
                self.expr.const_l(value as i64)?;
            }
            gimli::DW_OP_const1u => self.expr.const_l(i64::from(reader.read_u8()?))?,
            gimli::DW_OP_const1s => self.expr.const_l(i64::from(reader.read_i8()?))?,
            gimli::DW_OP_const2u => self.expr.const_l(i64::from(reader.read_u16()?))?,
            gimli::DW_OP_const2s => self.expr.const_l(i64::from(reader.read_i16()?))?,
            gimli::DW_OP_const4u => self.expr.const_l(i64::from(reader.read_u32()?))?,
            gimli::DW_OP_const4s => self.expr.const_l(i64::from(reader.read_i32()?))?,
            gimli::DW_OP_const8u => self.expr.const_l(reader.read_u64()? as i64)?,
            gimli::DW_OP_const8s => self.expr.const_l(reader.read_i64()?)?,
            gimli::DW_OP_constu => self.expr.const_l(reader.read_uleb128()? as i64)?,
            gimli::DW_OP_consts => self.expr.const_l(reader.read_sleb128()?)?,

            DwOp(reg) if (gimli::DW_OP_reg0.0..=gimli::DW_OP_reg31.0).contains(&reg) => {
                require_composition(reader.remaining(), op)?;
                state.location = AgentValue::Register(self.register(u64::from(reg - gimli::DW_OP_reg0.0))?);
            }
            gimli::DW_OP_regx => {
                let register = reader.read_uleb128()?;
                require_composition(reader.remaining(), op)?;
                state.location = AgentValue::Register(self.register(register)?);
            }
            gimli::DW_OP_implicit_value => {
                let len = reader.read_uleb128()?;
                if len > 8 {
                    return Err(ExpressionError::Other(format!(
                        "Cannot translate DW_OP_implicit_value of {len} bytes"
                    )));
                }
                let data = reader.read_bytes(len)?;
                let value = match self.config.byte_order {
                    ByteOrder::Little => data.iter().rev().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
                    ByteOrder::Big => data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
                };
                self.expr.const_l(value as i64)?;
                require_composition(reader.remaining(), op)?;
                state.location = AgentValue::Rvalue;
            }
            gimli::DW_OP_stack_value => {
                state.location = AgentValue::Rvalue;
            }

            DwOp(reg) if (gimli::DW_OP_breg0.0..=gimli::DW_OP_breg31.0).contains(&reg) => {
                let offset = reader.read_sleb128()?;
                let register = self.register(u64::from(reg - gimli::DW_OP_breg0.0))?;
                self.expr.reg(register);
                self.add_offset(offset)?;
            }
            gimli::DW_OP_bregx => {
                let register = reader.read_uleb128()?;
                let offset = reader.read_sleb128()?;
                let register = self.register(register)?;
                self.expr.reg(register);
                self.add_offset(offset)?;
            }
            gimli::DW_OP_dup => self.expr.simple(AgentOp::Dup),
            gimli::DW_OP_drop => self.expr.simple(AgentOp::Pop),
            gimli::DW_OP_pick => {
                let depth = reader.read_u8()?;
                self.expr.pick(depth);
            }
            gimli::DW_OP_swap => self.expr.simple(AgentOp::Swap),
            gimli::DW_OP_over => self.expr.pick(1),
            gimli::DW_OP_rot => self.expr.simple(AgentOp::Rot),

            gimli::DW_OP_deref | gimli::DW_OP_deref_size => {
                let size = if op == gimli::DW_OP_deref_size {
                    reader.read_u8()?
                } else {
                    self.config.address_size
                };
                if ![1, 2, 4, 8].contains(&size) {
                    return Err(ExpressionError::Other(format!(
                        "Unsupported size {size} in {}",
                        op_name(op)
                    )));
                }
                access_memory(self.expr, self.config.byte_order, 8 * u32::from(size))?;
            }

            gimli::DW_OP_abs => {
                self.expr.ext(self.address_bits())?;
                self.expr.simple(AgentOp::Dup);
                self.expr.const_l(0)?;
                self.expr.simple(AgentOp::LessSigned);
                self.expr.simple(AgentOp::LogNot);
                let patch = self.expr.goto(AgentOp::IfGoto);
                // Negative: 0 - X.
                self.expr.const_l(0)?;
                self.expr.simple(AgentOp::Swap);
                self.expr.simple(AgentOp::Sub);
                self.expr.label(patch, self.expr.len())?;
            }
            gimli::DW_OP_neg => {
                self.expr.const_l(0)?;
                self.expr.simple(AgentOp::Swap);
                self.expr.simple(AgentOp::Sub);
            }
            gimli::DW_OP_not => {
                self.expr.ext(self.address_bits())?;
                self.expr.simple(AgentOp::BitNot);
            }
            gimli::DW_OP_plus_uconst => {
                let addend = reader.read_uleb128()?;
                self.add_offset(addend as i64)?;
            }
            gimli::DW_OP_div => {
                let bits = self.address_bits();
                self.expr.ext(bits)?;
                self.expr.simple(AgentOp::Swap);
                self.expr.ext(bits)?;
                self.expr.simple(AgentOp::Swap);
                self.expr.simple(AgentOp::DivSigned);
            }
            gimli::DW_OP_and => self.expr.simple(AgentOp::BitAnd),
            gimli::DW_OP_minus => self.expr.simple(AgentOp::Sub),
            gimli::DW_OP_mod => self.expr.simple(AgentOp::RemUnsigned),
            gimli::DW_OP_mul => self.expr.simple(AgentOp::Mul),
            gimli::DW_OP_or => self.expr.simple(AgentOp::BitOr),
            gimli::DW_OP_plus => self.expr.simple(AgentOp::Add),
            gimli::DW_OP_shl => self.expr.simple(AgentOp::Lsh),
            gimli::DW_OP_shr => self.expr.simple(AgentOp::RshUnsigned),
            gimli::DW_OP_shra => self.expr.simple(AgentOp::RshSigned),
            gimli::DW_OP_xor => self.expr.simple(AgentOp::BitXor),

            // a <= b is !(b < a).
            gimli::DW_OP_le => self.signed_compare(false, &[AgentOp::LessSigned, AgentOp::LogNot])?,
            gimli::DW_OP_ge => self.signed_compare(true, &[AgentOp::LessSigned, AgentOp::LogNot])?,
            gimli::DW_OP_eq => self.signed_compare(false, &[AgentOp::Equal])?,
            gimli::DW_OP_lt => self.signed_compare(true, &[AgentOp::LessSigned])?,
            gimli::DW_OP_gt => self.signed_compare(false, &[AgentOp::LessSigned])?,
            gimli::DW_OP_ne => self.signed_compare(false, &[AgentOp::Equal, AgentOp::LogNot])?,

            gimli::DW_OP_nop => {}

            gimli::DW_OP_piece | gimli::DW_OP_bit_piece => {
                let (size, bit_offset) = if op == gimli::DW_OP_piece {
                    (8 * reader.read_uleb128()?, 0)
                } else {
                    (reader.read_uleb128()?, reader.read_uleb128()?)
                };
                if state.previous_piece == op_offset {
                    return Err(ExpressionError::EmptyPiece { offset: op_offset });
                }
                state.previous_piece = reader.offset();
                if size == 0 {
                    return Err(ExpressionError::EmptyPiece { offset: op_offset });
                }
                if state.bits_collected + size > 64 {
                    return Err(ExpressionError::PiecesExceedWordSize);
                }
                self.compile_piece(state.location, size, bit_offset, op)?;
                if state.bits_collected > 0 {
                    if self.config.bits_big_endian {
                        // Earlier pieces are the high order bits.
                        self.expr.simple(AgentOp::Swap);
                        self.expr.const_l(size as i64)?;
                    } else {
                        self.expr.const_l(state.bits_collected as i64)?;
                    }
                    self.expr.simple(AgentOp::Lsh);
                    self.expr.simple(AgentOp::BitOr);
                }
                state.bits_collected += size;
                // The next piece starts over in memory.
                state.location = AgentValue::Memory;
            }

            gimli::DW_OP_skip => {
                let target = reader.read_branch_target(op_offset)?;
                let patch = self.expr.goto(AgentOp::Goto);
                state.jumps.push(PendingJump {
                    op_offset,
                    patch,
                    target,
                });
            }
            gimli::DW_OP_bra => {
                let target = reader.read_branch_target(op_offset)?;
                self.expr.zero_ext(self.address_bits())?;
                let patch = self.expr.goto(AgentOp::IfGoto);
                state.jumps.push(PendingJump {
                    op_offset,
                    patch,
                    target,
                });
            }

            _ => return Err(ExpressionError::Unimplemented(op)),
        }
        Ok(())
    }

    fn compile_piece(
        &mut self,
        location: AgentValue,
        size: u64,
        bit_offset: u64,
        op: DwOp,
    ) -> Result<(), ExpressionError> {
        match location {
            AgentValue::Register(register) => {
                // Bits are counted from the least significant end of the register.
                self.expr.reg(register);
                if bit_offset != 0 {
                    self.expr.const_l(bit_offset as i64)?;
                    self.expr.simple(AgentOp::RshUnsigned);
                }
                if size < 64 {
                    self.expr.zero_ext(size as u32)?;
                }
            }
            AgentValue::Memory => {
                if bit_offset % 8 != 0 {
                    return Err(ExpressionError::Unimplemented(op));
                }
                self.add_offset((bit_offset / 8) as i64)?;
                access_memory(self.expr, self.config.byte_order, size as u32)?;
            }
            AgentValue::Rvalue => {}
        }
        Ok(())
    }

    fn compile_cfa(&mut self) -> Result<(), ExpressionError> {
        match self.services.cfa_rule_at(self.expr.scope())? {
            CfaRule::RegisterOffset { register, offset } => {
                let register = self.services.target_register(register)?;
                self.expr.reg(register);
                self.add_offset(offset)
            }
            CfaRule::Expression(cfa) => {
                // The value left on the stack is the CFA itself.
                if let register @ AgentValue::Register(_) = self.compile(&cfa)? {
                    register.require_rvalue(self.expr, &self.config, self.address_bits())?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test::{Asm, MockTarget};

    const SCOPE: u64 = 0x4010;

    fn compile_with(target: &mut MockTarget, bytecode: &[u8]) -> Result<(AgentValue, AgentExpr), ExpressionError> {
        let mut expr = AgentExpr::new(SCOPE);
        let value = compile_expression(target, &EvaluationConfig::default(), &mut expr, bytecode)?;
        Ok((value, expr))
    }

    fn compile(bytecode: &[u8]) -> Result<(AgentValue, AgentExpr), ExpressionError> {
        compile_with(&mut MockTarget::default(), bytecode)
    }

    #[test]
    fn register_with_offset() {
        let bytecode = Asm::new().op(gimli::DW_OP_breg7).sleb(-16).build();
        let (value, expr) = compile(&bytecode).unwrap();
        assert_eq!(value, AgentValue::Memory);
        assert_eq!(expr.registers().collect::<Vec<_>>(), vec![7]);
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 7
        0003: const8 240
        0005: ext 8
        0007: add
        ");
    }

    #[test]
    fn bare_register() {
        let (value, expr) = compile(&[gimli::DW_OP_reg3.0]).unwrap();
        assert_eq!(value, AgentValue::Register(3));
        assert!(expr.is_empty());
    }

    #[test]
    fn frame_base_in_a_register_is_read() {
        let mut target = MockTarget::default();
        target.frame_bases_at.insert(SCOPE, vec![gimli::DW_OP_reg6.0]);
        let bytecode = Asm::new().op(gimli::DW_OP_fbreg).sleb(8).build();
        let (value, expr) = compile_with(&mut target, &bytecode).unwrap();
        assert_eq!(value, AgentValue::Memory);
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 6
        0003: const8 8
        0005: add
        ");
    }

    #[test]
    fn frame_base_from_cfa() {
        let mut target = MockTarget::default();
        target
            .frame_bases_at
            .insert(SCOPE, vec![gimli::DW_OP_call_frame_cfa.0]);
        target.cfa_rules_at.insert(
            SCOPE,
            CfaRule::RegisterOffset {
                register: 7,
                offset: 16,
            },
        );
        let bytecode = Asm::new().op(gimli::DW_OP_fbreg).sleb(-20).op(gimli::DW_OP_deref_size).u8(4).build();
        let (value, expr) = compile_with(&mut target, &bytecode).unwrap();
        assert_eq!(value, AgentValue::Memory);
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 7
        0003: const8 16
        0005: add
        0006: const8 236
        0008: ext 8
        000a: add
        000b: ref32
        ");
    }

    #[test]
    fn cfa_expression() {
        let mut target = MockTarget::default();
        target.cfa_rules_at.insert(
            SCOPE,
            CfaRule::Expression(Asm::new().op(gimli::DW_OP_breg7).sleb(8).op(gimli::DW_OP_deref).build()),
        );
        let (_, expr) = compile_with(&mut target, &[gimli::DW_OP_call_frame_cfa.0]).unwrap();
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 7
        0003: const8 8
        0005: add
        0006: ref64
        ");
    }

    #[test]
    fn traced_reads() {
        let bytecode = Asm::new().op(gimli::DW_OP_breg0).sleb(0).op(gimli::DW_OP_deref).build();
        let mut expr = AgentExpr::new(SCOPE).with_tracing();
        compile_expression(&mut MockTarget::default(), &EvaluationConfig::default(), &mut expr, &bytecode).unwrap();
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 0
        0003: trace_quick 8
        0005: ref64
        ");
    }

    #[test]
    fn absolute_value() {
        let (_, expr) = compile(&[gimli::DW_OP_lit1.0, gimli::DW_OP_abs.0]).unwrap();
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: const8 1
        0002: ext 64
        0004: dup
        0005: const8 0
        0007: less_signed
        0008: log_not
        0009: if_goto 16
        000c: const8 0
        000e: swap
        000f: sub
        ");
    }

    #[test]
    fn register_pieces_are_combined() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_reg0)
            .op(gimli::DW_OP_piece)
            .uleb(4)
            .op(gimli::DW_OP_reg1)
            .op(gimli::DW_OP_piece)
            .uleb(4)
            .build();
        let (value, expr) = compile(&bytecode).unwrap();
        assert_eq!(value, AgentValue::Rvalue);
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 0
        0003: zero_ext 32
        0005: reg 1
        0008: zero_ext 32
        000a: const8 32
        000c: lsh
        000d: bit_or
        ");
    }

    #[test]
    fn register_bit_piece_is_shifted_and_masked() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_reg0)
            .op(gimli::DW_OP_bit_piece)
            .uleb(8)
            .uleb(8)
            .build();
        let (value, expr) = compile(&bytecode).unwrap();
        assert_eq!(value, AgentValue::Rvalue);
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 0
        0003: const8 8
        0005: rsh_unsigned
        0006: zero_ext 8
        ");
    }

    #[test]
    fn memory_pieces_are_each_loaded() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_breg0)
            .sleb(4)
            .op(gimli::DW_OP_piece)
            .uleb(4)
            .op(gimli::DW_OP_breg1)
            .sleb(0)
            .op(gimli::DW_OP_piece)
            .uleb(4)
            .build();
        let (value, expr) = compile(&bytecode).unwrap();
        assert_eq!(value, AgentValue::Rvalue);
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 0
        0003: const8 4
        0005: add
        0006: ref32
        0007: reg 1
        000a: ref32
        000b: const8 32
        000d: lsh
        000e: bit_or
        ");
    }

    #[test]
    fn memory_piece_reads_its_size() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_breg5)
            .sleb(0)
            .op(gimli::DW_OP_bit_piece)
            .uleb(12)
            .uleb(0)
            .build();
        let (_, expr) = compile(&bytecode).unwrap();
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 5
        0003: ref16
        0004: zero_ext 12
        ");
    }

    #[test]
    fn branches_are_resolved() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_lit0)
            .branch(gimli::DW_OP_bra, "end")
            .op(gimli::DW_OP_lit7)
            .label("end")
            .build();
        let (_, expr) = compile(&bytecode).unwrap();
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: const8 0
        0002: zero_ext 64
        0004: if_goto 9
        0007: const8 7
        ");
    }

    #[test]
    fn branch_into_an_operand_is_rejected() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_skip)
            .u16(1)
            .op(gimli::DW_OP_const1u)
            .u8(0)
            .build();
        assert!(matches!(
            compile(&bytecode),
            Err(ExpressionError::BadBranchTarget { offset: 0, target: 4 })
        ));
    }

    #[test]
    fn calls_are_inlined() {
        let mut target = MockTarget::default();
        target
            .subroutines
            .insert(DieReference::Unit(UnitOffset(0x30)), vec![gimli::DW_OP_lit2.0, gimli::DW_OP_mul.0]);
        let bytecode = Asm::new().op(gimli::DW_OP_lit3).op(gimli::DW_OP_call2).u16(0x30).build();
        let (_, expr) = compile_with(&mut target, &bytecode).unwrap();
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: const8 3
        0002: const8 2
        0004: mul
        ");
    }

    #[test]
    fn recursive_calls_are_bounded() {
        let mut target = MockTarget::default();
        let call = Asm::new().op(gimli::DW_OP_call2).u16(0x30).build();
        target.subroutines.insert(DieReference::Unit(UnitOffset(0x30)), call.clone());
        assert!(matches!(
            compile_with(&mut target, &call),
            Err(ExpressionError::RecursionLimitExceeded(256))
        ));
    }

    #[test]
    fn empty_piece() {
        let bytecode = Asm::new().op(gimli::DW_OP_piece).uleb(4).build();
        assert!(matches!(compile(&bytecode), Err(ExpressionError::EmptyPiece { offset: 0 })));

        let bytecode = Asm::new()
            .op(gimli::DW_OP_reg0)
            .op(gimli::DW_OP_piece)
            .uleb(4)
            .op(gimli::DW_OP_piece)
            .uleb(4)
            .build();
        assert!(matches!(compile(&bytecode), Err(ExpressionError::EmptyPiece { offset: 3 })));
    }

    #[test]
    fn pieces_wider_than_a_word() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_reg0)
            .op(gimli::DW_OP_piece)
            .uleb(8)
            .op(gimli::DW_OP_reg1)
            .op(gimli::DW_OP_piece)
            .uleb(1)
            .build();
        assert!(matches!(compile(&bytecode), Err(ExpressionError::PiecesExceedWordSize)));
    }

    #[test]
    fn large_implicit_value() {
        let bytecode = Asm::new()
            .op(gimli::DW_OP_implicit_value)
            .uleb(16)
            .bytes(&[0; 16])
            .build();
        let error = compile(&bytecode).unwrap_err();
        assert_eq!(error.to_string(), "Cannot translate DW_OP_implicit_value of 16 bytes");
    }

    #[test]
    fn unsupported_deref_size() {
        let error = compile(&[gimli::DW_OP_lit0.0, gimli::DW_OP_deref_size.0, 3]).unwrap_err();
        assert_eq!(error.to_string(), "Unsupported size 3 in DW_OP_deref_size");
    }

    #[test]
    fn operations_needing_the_debugger() {
        for op in [
            gimli::DW_OP_entry_value,
            gimli::DW_OP_form_tls_address,
            gimli::DW_OP_push_object_address,
            bytecode::DW_OP_GNU_UNINIT,
        ] {
            assert!(
                matches!(compile(&[gimli::DW_OP_lit0.0, op.0, 0]), Err(ExpressionError::Unimplemented(o)) if o == op),
                "{op}"
            );
        }
    }
}
