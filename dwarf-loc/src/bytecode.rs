use gimli::{DwOp, EndianSlice, Reader, RunTimeEndian};

use crate::ExpressionError;

/// `DW_OP_GNU_push_tls_address`
pub const DW_OP_GNU_PUSH_TLS_ADDRESS: DwOp = DwOp(0xe0);
/// `DW_OP_GNU_uninit`
pub const DW_OP_GNU_UNINIT: DwOp = DwOp(0xf0);
/// `DW_OP_GNU_encoded_addr`
pub const DW_OP_GNU_ENCODED_ADDR: DwOp = DwOp(0xf1);
/// `DW_OP_GNU_implicit_pointer`
pub const DW_OP_GNU_IMPLICIT_POINTER: DwOp = DwOp(0xf2);
/// `DW_OP_GNU_entry_value`
pub const DW_OP_GNU_ENTRY_VALUE: DwOp = DwOp(0xf3);
/// `DW_OP_GNU_const_type`
pub const DW_OP_GNU_CONST_TYPE: DwOp = DwOp(0xf4);
/// `DW_OP_GNU_regval_type`
pub const DW_OP_GNU_REGVAL_TYPE: DwOp = DwOp(0xf5);
/// `DW_OP_GNU_deref_type`
pub const DW_OP_GNU_DEREF_TYPE: DwOp = DwOp(0xf6);
/// `DW_OP_GNU_convert`
pub const DW_OP_GNU_CONVERT: DwOp = DwOp(0xf7);
/// `DW_OP_GNU_reinterpret`
pub const DW_OP_GNU_REINTERPRET: DwOp = DwOp(0xf9);
/// `DW_OP_GNU_parameter_ref`
pub const DW_OP_GNU_PARAMETER_REF: DwOp = DwOp(0xfa);
/// `DW_OP_GNU_addr_index`
pub const DW_OP_GNU_ADDR_INDEX: DwOp = DwOp(0xfb);
/// `DW_OP_GNU_const_index`
pub const DW_OP_GNU_CONST_INDEX: DwOp = DwOp(0xfc);
/// `DW_OP_GNU_variable_value`
pub const DW_OP_GNU_VARIABLE_VALUE: DwOp = DwOp(0xfd);

/// A printable name for an opcode, including the GNU extensions.
pub fn op_name(op: DwOp) -> &'static str {
    match op {
        DW_OP_GNU_PUSH_TLS_ADDRESS => "DW_OP_GNU_push_tls_address",
        DW_OP_GNU_UNINIT => "DW_OP_GNU_uninit",
        DW_OP_GNU_ENCODED_ADDR => "DW_OP_GNU_encoded_addr",
        DW_OP_GNU_IMPLICIT_POINTER => "DW_OP_GNU_implicit_pointer",
        DW_OP_GNU_ENTRY_VALUE => "DW_OP_GNU_entry_value",
        DW_OP_GNU_CONST_TYPE => "DW_OP_GNU_const_type",
        DW_OP_GNU_REGVAL_TYPE => "DW_OP_GNU_regval_type",
        DW_OP_GNU_DEREF_TYPE => "DW_OP_GNU_deref_type",
        DW_OP_GNU_CONVERT => "DW_OP_GNU_convert",
        DW_OP_GNU_REINTERPRET => "DW_OP_GNU_reinterpret",
        DW_OP_GNU_PARAMETER_REF => "DW_OP_GNU_parameter_ref",
        DW_OP_GNU_ADDR_INDEX => "DW_OP_GNU_addr_index",
        DW_OP_GNU_CONST_INDEX => "DW_OP_GNU_const_index",
        DW_OP_GNU_VARIABLE_VALUE => "DW_OP_GNU_variable_value",
        _ => op.static_string().unwrap_or("<unknown DW_OP>"),
    }
}

/// A bounds checked cursor over DWARF expression bytecode.
#[derive(Debug, Clone)]
pub struct OpReader<'a> {
    bytes: &'a [u8],
    input: EndianSlice<'a, RunTimeEndian>,
    endian: RunTimeEndian,
}

impl<'a> OpReader<'a> {
    /// Start reading at the beginning of `bytes`.
    pub fn new(bytes: &'a [u8], endian: RunTimeEndian) -> Self {
        Self {
            bytes,
            input: EndianSlice::new(bytes, endian),
            endian,
        }
    }

    /// The offset of the next byte to be read.
    pub fn offset(&self) -> usize {
        self.bytes.len() - self.input.len()
    }

    /// Returns `true` once all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// The bytes not read yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.input.slice()
    }

    /// The whole bytecode.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Continue reading at `offset`.
    pub fn seek(&mut self, offset: usize) -> Result<(), ExpressionError> {
        let rest = self
            .bytes
            .get(offset..)
            .ok_or(ExpressionError::BufferOverrun { offset })?;
        self.input = EndianSlice::new(rest, self.endian);
        Ok(())
    }

    /// The opcode at the current position, without consuming it.
    pub fn peek_op(&self) -> Option<DwOp> {
        self.remaining().first().map(|byte| DwOp(*byte))
    }

    fn map_error(&self, offset: usize, error: gimli::Error) -> ExpressionError {
        match error {
            gimli::Error::UnexpectedEof(_) => ExpressionError::BufferOverrun { offset },
            source => ExpressionError::Decode { offset, source },
        }
    }

    fn read<T>(
        &mut self,
        f: impl FnOnce(&mut EndianSlice<'a, RunTimeEndian>) -> gimli::Result<T>,
    ) -> Result<T, ExpressionError> {
        let offset = self.offset();
        let mut input = self.input;
        match f(&mut input) {
            Ok(value) => {
                self.input = input;
                Ok(value)
            }
            Err(error) => Err(self.map_error(offset, error)),
        }
    }

    /// Read the next opcode.
    pub fn read_op(&mut self) -> Result<DwOp, ExpressionError> {
        self.read_u8().map(DwOp)
    }

    /// Read a 1-byte unsigned operand.
    pub fn read_u8(&mut self) -> Result<u8, ExpressionError> {
        self.read(|r| r.read_u8())
    }

    /// Read a 1-byte signed operand.
    pub fn read_i8(&mut self) -> Result<i8, ExpressionError> {
        self.read(|r| r.read_i8())
    }

    /// Read a 2-byte unsigned operand.
    pub fn read_u16(&mut self) -> Result<u16, ExpressionError> {
        self.read(|r| r.read_u16())
    }

    /// Read a 2-byte signed operand.
    pub fn read_i16(&mut self) -> Result<i16, ExpressionError> {
        self.read(|r| r.read_i16())
    }

    /// Read a 4-byte unsigned operand.
    pub fn read_u32(&mut self) -> Result<u32, ExpressionError> {
        self.read(|r| r.read_u32())
    }

    /// Read a 4-byte signed operand.
    pub fn read_i32(&mut self) -> Result<i32, ExpressionError> {
        self.read(|r| r.read_i32())
    }

    /// Read an 8-byte unsigned operand.
    pub fn read_u64(&mut self) -> Result<u64, ExpressionError> {
        self.read(|r| r.read_u64())
    }

    /// Read an 8-byte signed operand.
    pub fn read_i64(&mut self) -> Result<i64, ExpressionError> {
        self.read(|r| r.read_i64())
    }

    /// Read an unsigned LEB128 operand.
    pub fn read_uleb128(&mut self) -> Result<u64, ExpressionError> {
        self.read(|r| r.read_uleb128())
    }

    /// Read a signed LEB128 operand.
    pub fn read_sleb128(&mut self) -> Result<i64, ExpressionError> {
        self.read(|r| r.read_sleb128())
    }

    /// Read an unsigned operand of `size` bytes.
    pub fn read_sized(&mut self, size: u8) -> Result<u64, ExpressionError> {
        match size {
            1 => self.read_u8().map(u64::from),
            2 => self.read_u16().map(u64::from),
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            other => Err(ExpressionError::InvalidExpression(format!(
                "unsupported operand size {other}"
            ))),
        }
    }

    /// Read `len` bytes of block data.
    pub fn read_bytes(&mut self, len: u64) -> Result<&'a [u8], ExpressionError> {
        let offset = self.offset();
        let len = usize::try_from(len).map_err(|_| ExpressionError::BufferOverrun { offset })?;
        let block = self
            .remaining()
            .get(..len)
            .ok_or(ExpressionError::BufferOverrun { offset })?;
        self.input.skip(len).map_err(|e| self.map_error(offset, e))?;
        Ok(block)
    }

    /// Read a 2-byte branch displacement and compute the absolute target.
    pub fn read_branch_target(&mut self, op_offset: usize) -> Result<usize, ExpressionError> {
        let displacement = self.read_i16()?;
        self.branch_target(op_offset, displacement)
    }

    /// The target of a branch at `op_offset` whose operand has just been read.
    pub fn branch_target(&self, op_offset: usize, displacement: i16) -> Result<usize, ExpressionError> {
        let target = self.offset() as i64 + i64::from(displacement);
        if target < 0 || target > self.bytes.len() as i64 {
            return Err(ExpressionError::BadBranchTarget {
                offset: op_offset,
                target,
            });
        }
        Ok(target as usize)
    }

    /// Continue after a taken branch.
    pub fn jump(&mut self, op_offset: usize, displacement: i16) -> Result<(), ExpressionError> {
        let target = self.branch_target(op_offset, displacement)?;
        self.seek(target)
    }
}

/// Check that a register location is either the whole expression or followed by a piece.
pub fn require_composition(remaining: &[u8], op: DwOp) -> Result<(), ExpressionError> {
    match remaining.first().map(|byte| DwOp(*byte)) {
        None | Some(gimli::DW_OP_piece | gimli::DW_OP_bit_piece | DW_OP_GNU_UNINIT) => Ok(()),
        Some(_) => Err(ExpressionError::InvalidExpression(format!(
            "'{}' operations must be used either alone or in conjunction with DW_OP_piece or DW_OP_bit_piece.",
            op_name(op)
        ))),
    }
}

fn register_operand(
    reader: &mut OpReader<'_>,
    op: DwOp,
    base: DwOp,
    extended: DwOp,
) -> Result<Option<u16>, ExpressionError> {
    if (base.0..base.0 + 32).contains(&op.0) {
        return Ok(Some(u16::from(op.0 - base.0)));
    }
    if op != extended {
        return Ok(None);
    }
    let reg = reader.read_uleb128()?;
    u16::try_from(reg)
        .map(Some)
        .map_err(|_| ExpressionError::InvalidExpression(format!("register number {reg} out of range")))
}

/// If `block` is exactly `DW_OP_regN` or `DW_OP_regx N`, return N.
pub fn block_to_dwarf_reg(block: &[u8]) -> Option<u16> {
    let mut reader = OpReader::new(block, RunTimeEndian::Little);
    let op = reader.read_op().ok()?;
    let reg = register_operand(&mut reader, op, gimli::DW_OP_reg0, gimli::DW_OP_regx).ok()??;
    reader.is_empty().then_some(reg)
}

/// If `block` is `DW_OP_bregN 0` followed by `DW_OP_deref` or `DW_OP_deref_size`, return N and the
/// dereference size.
pub fn block_to_dwarf_reg_deref(block: &[u8], address_size: u8) -> Option<(u16, u8)> {
    let mut reader = OpReader::new(block, RunTimeEndian::Little);
    let op = reader.read_op().ok()?;
    let reg = register_operand(&mut reader, op, gimli::DW_OP_breg0, gimli::DW_OP_bregx).ok()??;
    if reader.read_sleb128().ok()? != 0 {
        return None;
    }
    let size = match reader.read_op().ok()? {
        gimli::DW_OP_deref => address_size,
        gimli::DW_OP_deref_size => reader.read_u8().ok()?,
        _ => return None,
    };
    reader.is_empty().then_some((reg, size))
}

/// If `block` is exactly `DW_OP_fbreg N`, return N.
pub fn block_to_fb_offset(block: &[u8]) -> Option<i64> {
    let mut reader = OpReader::new(block, RunTimeEndian::Little);
    if reader.read_op().ok()? != gimli::DW_OP_fbreg {
        return None;
    }
    let offset = reader.read_sleb128().ok()?;
    reader.is_empty().then_some(offset)
}

/// If `block` is exactly `DW_OP_bregN M` with N the stack pointer, return M.
pub fn block_to_sp_offset(block: &[u8], stack_pointer: u16) -> Option<i64> {
    let mut reader = OpReader::new(block, RunTimeEndian::Little);
    let op = reader.read_op().ok()?;
    let reg = register_operand(&mut reader, op, gimli::DW_OP_breg0, gimli::DW_OP_bregx).ok()??;
    if reg != stack_pointer {
        return None;
    }
    let offset = reader.read_sleb128().ok()?;
    reader.is_empty().then_some(offset)
}

#[cfg(test)]
mod test {
    use gimli::leb128;
    use test_case::test_case;

    use super::*;

    fn uleb(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        leb128::write::unsigned(&mut out, value).unwrap();
        out
    }

    fn sleb(value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        leb128::write::signed(&mut out, value).unwrap();
        out
    }

    #[test_case(0; "zero")]
    #[test_case(127; "one byte max")]
    #[test_case(128; "two bytes")]
    #[test_case(u64::MAX; "max")]
    fn uleb128_decodes(value: u64) {
        let bytes = uleb(value);
        let mut reader = OpReader::new(&bytes, RunTimeEndian::Little);
        assert_eq!(reader.read_uleb128().unwrap(), value);
        assert!(reader.is_empty());
    }

    #[test_case(0; "zero")]
    #[test_case(-1; "minus one")]
    #[test_case(-129; "two bytes negative")]
    #[test_case(i64::MIN; "min")]
    #[test_case(i64::MAX; "max")]
    fn sleb128_decodes(value: i64) {
        let bytes = sleb(value);
        let mut reader = OpReader::new(&bytes, RunTimeEndian::Little);
        assert_eq!(reader.read_sleb128().unwrap(), value);
    }

    #[test]
    fn truncated_leb128_is_an_overrun() {
        let mut bytes = uleb(1 << 40);
        bytes.pop();
        let mut reader = OpReader::new(&bytes, RunTimeEndian::Little);
        assert!(matches!(
            reader.read_uleb128(),
            Err(ExpressionError::BufferOverrun { offset: 0 })
        ));
    }

    #[test]
    fn truncated_fixed_operand_is_an_overrun() {
        let bytes = [0x01, 0x02, 0x03];
        let mut reader = OpReader::new(&bytes, RunTimeEndian::Little);
        assert!(matches!(
            reader.read_u32(),
            Err(ExpressionError::BufferOverrun { .. })
        ));
        // Nothing was consumed.
        assert_eq!(reader.offset(), 0);
        assert_eq!(reader.read_u16().unwrap(), 0x0201);
    }

    #[test]
    fn block_decoders() {
        assert_eq!(block_to_dwarf_reg(&[gimli::DW_OP_reg5.0]), Some(5));
        let mut regx = vec![gimli::DW_OP_regx.0];
        regx.extend(uleb(40));
        assert_eq!(block_to_dwarf_reg(&regx), Some(40));
        assert_eq!(block_to_dwarf_reg(&[gimli::DW_OP_reg5.0, 0]), None);

        let deref = [gimli::DW_OP_breg3.0, 0, gimli::DW_OP_deref_size.0, 4];
        assert_eq!(block_to_dwarf_reg_deref(&deref, 8), Some((3, 4)));
        let nonzero = [gimli::DW_OP_breg3.0, 1, gimli::DW_OP_deref.0];
        assert_eq!(block_to_dwarf_reg_deref(&nonzero, 8), None);

        let mut fbreg = vec![gimli::DW_OP_fbreg.0];
        fbreg.extend(sleb(-16));
        assert_eq!(block_to_fb_offset(&fbreg), Some(-16));

        let sp = [gimli::DW_OP_breg7.0, 8];
        assert_eq!(block_to_sp_offset(&sp, 7), Some(8));
        assert_eq!(block_to_sp_offset(&sp, 6), None);
    }

    #[test]
    fn composition_rules() {
        assert!(require_composition(&[], gimli::DW_OP_reg0).is_ok());
        assert!(require_composition(&[gimli::DW_OP_piece.0, 4], gimli::DW_OP_reg0).is_ok());
        assert!(matches!(
            require_composition(&[gimli::DW_OP_lit1.0], gimli::DW_OP_reg0),
            Err(ExpressionError::InvalidExpression(_))
        ));
    }

    #[test]
    fn branch_targets_are_checked() {
        let bytes = [0x00, 0x00, 0x10, 0x00];
        let mut reader = OpReader::new(&bytes, RunTimeEndian::Little);
        assert_eq!(reader.read_branch_target(0).unwrap(), 2);
        assert!(matches!(
            reader.read_branch_target(2),
            Err(ExpressionError::BadBranchTarget { target: 20, .. })
        ));
    }
}
