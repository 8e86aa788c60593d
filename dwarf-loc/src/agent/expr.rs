use std::fmt;

use bitvec::prelude::*;

use crate::ExpressionError;

macro_rules! agent_ops {
    (
        $( #[$enum_attr:meta] )*
        $enum_vis:vis enum $enum_name:ident {
            $(
                $name:ident = $id:literal, $text:literal, $operand:literal;
            )+
        }
    ) => {
        $( #[$enum_attr] )*
        $enum_vis enum $enum_name {
            $(
                #[doc = concat!("`", $text, "`")]
                $name = $id,
            )+
        }

        impl $enum_name {
            /// Decode an opcode byte.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $( $id => Some(Self::$name), )+
                    _ => None,
                }
            }

            /// The mnemonic of the opcode.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$name => $text, )+
                }
            }

            /// Number of operand bytes following the opcode.
            pub fn operand_size(self) -> usize {
                match self {
                    $( Self::$name => $operand, )+
                }
            }
        }
    };
}

agent_ops! {
    /// Opcodes of the agent expression bytecode evaluated by a remote stub.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(u8)]
    pub enum AgentOp {
        Float = 0x01, "float", 0;
        Add = 0x02, "add", 0;
        Sub = 0x03, "sub", 0;
        Mul = 0x04, "mul", 0;
        DivSigned = 0x05, "div_signed", 0;
        DivUnsigned = 0x06, "div_unsigned", 0;
        RemSigned = 0x07, "rem_signed", 0;
        RemUnsigned = 0x08, "rem_unsigned", 0;
        Lsh = 0x09, "lsh", 0;
        RshSigned = 0x0a, "rsh_signed", 0;
        RshUnsigned = 0x0b, "rsh_unsigned", 0;
        Trace = 0x0c, "trace", 0;
        TraceQuick = 0x0d, "trace_quick", 1;
        LogNot = 0x0e, "log_not", 0;
        BitAnd = 0x0f, "bit_and", 0;
        BitOr = 0x10, "bit_or", 0;
        BitXor = 0x11, "bit_xor", 0;
        BitNot = 0x12, "bit_not", 0;
        Equal = 0x13, "equal", 0;
        LessSigned = 0x14, "less_signed", 0;
        LessUnsigned = 0x15, "less_unsigned", 0;
        Ext = 0x16, "ext", 1;
        Ref8 = 0x17, "ref8", 0;
        Ref16 = 0x18, "ref16", 0;
        Ref32 = 0x19, "ref32", 0;
        Ref64 = 0x1a, "ref64", 0;
        RefFloat = 0x1b, "ref_float", 0;
        RefDouble = 0x1c, "ref_double", 0;
        RefLongDouble = 0x1d, "ref_long_double", 0;
        LToD = 0x1e, "l_to_d", 0;
        DToL = 0x1f, "d_to_l", 0;
        IfGoto = 0x20, "if_goto", 2;
        Goto = 0x21, "goto", 2;
        Const8 = 0x22, "const8", 1;
        Const16 = 0x23, "const16", 2;
        Const32 = 0x24, "const32", 4;
        Const64 = 0x25, "const64", 8;
        Reg = 0x26, "reg", 2;
        End = 0x27, "end", 0;
        Dup = 0x28, "dup", 0;
        Pop = 0x29, "pop", 0;
        ZeroExt = 0x2a, "zero_ext", 1;
        Swap = 0x2b, "swap", 0;
        Getv = 0x2c, "getv", 2;
        Setv = 0x2d, "setv", 2;
        Tracev = 0x2e, "tracev", 2;
        Tracenz = 0x2f, "tracenz", 0;
        Trace16 = 0x30, "trace16", 2;
        Pick = 0x32, "pick", 1;
        Rot = 0x33, "rot", 0;
        Printf = 0x34, "printf", 0;
    }
}

/// An agent expression under construction.
///
/// Operands are stored big endian, as the remote side expects them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentExpr {
    scope: u64,
    tracing: bool,
    bytes: Vec<u8>,
    reg_mask: BitVec<u64, Lsb0>,
}

impl AgentExpr {
    /// An empty expression for code at `scope`.
    pub fn new(scope: u64) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Emit `trace_quick` before memory reads, so the stub records what the expression reads.
    pub fn with_tracing(mut self) -> Self {
        self.tracing = true;
        self
    }

    /// The PC the expression is compiled for.
    pub fn scope(&self) -> u64 {
        self.scope
    }

    /// Whether memory reads are traced.
    pub fn is_tracing(&self) -> bool {
        self.tracing
    }

    /// The bytecode.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the bytecode.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The registers the expression reads.
    pub fn registers(&self) -> impl Iterator<Item = u16> + '_ {
        self.reg_mask.iter_ones().map(|register| register as u16)
    }

    /// Record that the expression needs `register`.
    pub fn mark_register(&mut self, register: u16) {
        let index = usize::from(register);
        if index >= self.reg_mask.len() {
            self.reg_mask.resize(index + 1, false);
        }
        self.reg_mask.set(index, true);
    }

    fn append_const(&mut self, value: u64, size: usize) {
        self.bytes.extend_from_slice(&value.to_be_bytes()[8 - size..]);
    }

    /// Emit an operation without operands.
    pub fn simple(&mut self, op: AgentOp) {
        self.bytes.push(op as u8);
    }

    fn ext_op(&mut self, op: AgentOp, bits: u32) -> Result<(), ExpressionError> {
        let bits = u8::try_from(bits).map_err(|_| {
            ExpressionError::Other(format!("bit count {bits} out of range for {}", op.name()))
        })?;
        self.bytes.extend_from_slice(&[op as u8, bits]);
        Ok(())
    }

    /// Sign extend the top of the stack from `bits` bits.
    pub fn ext(&mut self, bits: u32) -> Result<(), ExpressionError> {
        self.ext_op(AgentOp::Ext, bits)
    }

    /// Zero extend the top of the stack from `bits` bits.
    pub fn zero_ext(&mut self, bits: u32) -> Result<(), ExpressionError> {
        self.ext_op(AgentOp::ZeroExt, bits)
    }

    /// Record `size` bytes at the address on top of the stack.
    pub fn trace_quick(&mut self, size: u64) -> Result<(), ExpressionError> {
        let size = u8::try_from(size).map_err(|_| {
            ExpressionError::Other(format!("size {size} out of range for trace_quick"))
        })?;
        self.bytes.extend_from_slice(&[AgentOp::TraceQuick as u8, size]);
        Ok(())
    }

    /// Copy the stack entry `depth` below the top.
    pub fn pick(&mut self, depth: u8) {
        self.bytes.extend_from_slice(&[AgentOp::Pick as u8, depth]);
    }

    /// Emit a jump with a placeholder target, returning the position to patch with [`Self::label`].
    pub fn goto(&mut self, op: AgentOp) -> usize {
        self.bytes.extend_from_slice(&[op as u8, 0, 0]);
        self.bytes.len() - 2
    }

    /// Point the jump operand at `patch` to `target`.
    pub fn label(&mut self, patch: usize, target: usize) -> Result<(), ExpressionError> {
        let target = u16::try_from(target)
            .ok()
            .filter(|target| *target != u16::MAX)
            .ok_or_else(|| ExpressionError::Other(format!("jump target {target} out of range")))?;
        self.bytes[patch..patch + 2].copy_from_slice(&target.to_be_bytes());
        Ok(())
    }

    /// Push a constant using the shortest encoding that sign extends back to `value`.
    pub fn const_l(&mut self, value: i64) -> Result<(), ExpressionError> {
        let (op, bits) = [
            (AgentOp::Const8, 8usize),
            (AgentOp::Const16, 16),
            (AgentOp::Const32, 32),
        ]
        .into_iter()
        .find(|(_, bits)| {
            let limit = 1i64 << (bits - 1);
            (-limit..limit).contains(&value)
        })
        .unwrap_or((AgentOp::Const64, 64));

        self.simple(op);
        self.append_const(value as u64, bits / 8);
        // The constant operations zero extend.
        if value < 0 && bits < 64 {
            self.ext(bits as u32)?;
        }
        Ok(())
    }

    /// Push the value of a register.
    pub fn reg(&mut self, register: u16) {
        self.simple(AgentOp::Reg);
        self.append_const(u64::from(register), 2);
        self.mark_register(register);
    }
}

impl fmt::Display for AgentExpr {
    /// One line per instruction: offset, mnemonic and operand.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut offset = 0;
        while offset < self.bytes.len() {
            if offset > 0 {
                writeln!(f)?;
            }
            let byte = self.bytes[offset];
            let Some(op) = AgentOp::from_u8(byte) else {
                write!(f, "{offset:04x}: <bad opcode {byte:02x}>")?;
                offset += 1;
                continue;
            };
            let size = op.operand_size();
            if offset + 1 + size > self.bytes.len() {
                write!(f, "{offset:04x}: <incomplete opcode {}>", op.name())?;
                break;
            }
            write!(f, "{offset:04x}: {}", op.name())?;
            if size > 0 {
                let operand = self.bytes[offset + 1..offset + 1 + size]
                    .iter()
                    .fold(0u64, |value, byte| (value << 8) | u64::from(*byte));
                write!(f, " {}", operand as i64)?;
            }
            offset += 1 + size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(5, &[0x22, 0x05]; "small positive")]
    #[test_case(-1, &[0x22, 0xff, 0x16, 0x08]; "small negative")]
    #[test_case(128, &[0x23, 0x00, 0x80]; "needs sixteen bits")]
    #[test_case(-129, &[0x23, 0xff, 0x7f, 0x16, 0x10]; "negative sixteen bits")]
    #[test_case(0x1234_5678, &[0x24, 0x12, 0x34, 0x56, 0x78]; "needs thirty two bits")]
    #[test_case(0x1_2345_6789, &[0x25, 0, 0, 0, 0x01, 0x23, 0x45, 0x67, 0x89]; "needs sixty four bits")]
    #[test_case(i64::MIN, &[0x25, 0x80, 0, 0, 0, 0, 0, 0, 0]; "most negative")]
    fn shortest_constants(value: i64, expected: &[u8]) {
        let mut expr = AgentExpr::new(0);
        expr.const_l(value).unwrap();
        assert_eq!(expr.bytes(), expected);
    }

    #[test]
    fn registers_are_collected() {
        let mut expr = AgentExpr::new(0);
        expr.reg(6);
        expr.reg(70);
        expr.reg(6);
        assert_eq!(expr.registers().collect::<Vec<_>>(), vec![6, 70]);
        assert_eq!(&expr.bytes()[..3], &[0x26, 0x00, 0x06]);
    }

    #[test]
    fn jumps_are_patched() {
        let mut expr = AgentExpr::new(0);
        let patch = expr.goto(AgentOp::IfGoto);
        expr.simple(AgentOp::Dup);
        expr.label(patch, expr.len()).unwrap();
        assert_eq!(expr.bytes(), &[0x20, 0x00, 0x04, 0x28]);
        assert!(expr.label(patch, 0x1_0000).is_err());
    }

    #[test]
    fn disassembly() {
        let mut expr = AgentExpr::new(0x4000);
        expr.reg(7);
        expr.const_l(-8).unwrap();
        expr.simple(AgentOp::Add);
        expr.simple(AgentOp::Ref64);
        expr.simple(AgentOp::End);
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: reg 7
        0003: const8 248
        0005: ext 8
        0007: add
        0008: ref64
        0009: end
        ");
    }

    #[test]
    fn disassembly_of_broken_bytecode() {
        let expr = AgentExpr {
            bytes: vec![0xee, 0x25, 0x01],
            ..Default::default()
        };
        insta::assert_snapshot!(expr.to_string(), @r"
        0000: <bad opcode ee>
        0001: <incomplete opcode const64>
        ");
    }
}
