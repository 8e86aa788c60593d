use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{config::ByteOrder, ExpressionError};

/// The encoding of a base type (`DW_AT_encoding`), reduced to what the stack machine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseTypeEncoding {
    /// The untyped address-sized integer of DWARF 2 style expressions. It is signed.
    Generic,
    /// `DW_ATE_signed`
    Signed,
    /// `DW_ATE_unsigned`
    Unsigned,
    /// `DW_ATE_signed_char`
    SignedChar,
    /// `DW_ATE_unsigned_char`
    UnsignedChar,
    /// `DW_ATE_boolean`
    Boolean,
    /// `DW_ATE_float`
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeClass {
    Integer,
    Boolean,
    Float,
}

/// A base type as referenced by the typed DWARF operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseType {
    /// Size in bytes.
    pub byte_size: u8,
    /// How the bits are interpreted.
    pub encoding: BaseTypeEncoding,
}

impl BaseType {
    /// The generic type for an address size in bytes.
    pub fn generic(address_size: u8) -> Self {
        Self {
            byte_size: address_size,
            encoding: BaseTypeEncoding::Generic,
        }
    }

    /// Shorthand for an unsigned integer type.
    pub fn unsigned(byte_size: u8) -> Self {
        Self {
            byte_size,
            encoding: BaseTypeEncoding::Unsigned,
        }
    }

    /// Shorthand for a signed integer type.
    pub fn signed(byte_size: u8) -> Self {
        Self {
            byte_size,
            encoding: BaseTypeEncoding::Signed,
        }
    }

    /// Check that values of this type fit the stack machine.
    pub fn validate(self) -> Result<Self, ExpressionError> {
        let valid = match self.encoding {
            BaseTypeEncoding::Float => matches!(self.byte_size, 4 | 8),
            _ => matches!(self.byte_size, 1..=8),
        };
        if valid {
            Ok(self)
        } else {
            Err(ExpressionError::InvalidExpression(format!(
                "unsupported base type of {} bytes ({:?})",
                self.byte_size, self.encoding
            )))
        }
    }

    /// Whether the value is signed.
    pub fn is_signed(self) -> bool {
        matches!(
            self.encoding,
            BaseTypeEncoding::Generic | BaseTypeEncoding::Signed | BaseTypeEncoding::SignedChar
        ) || self.is_float()
    }

    /// Whether the type is a floating point type.
    pub fn is_float(self) -> bool {
        self.encoding == BaseTypeEncoding::Float
    }

    /// Whether bitwise operations are allowed on the type.
    pub fn is_integral(self) -> bool {
        !self.is_float()
    }

    /// The unsigned type of the same size, for integral types.
    pub fn to_unsigned(self) -> Self {
        match self.encoding {
            BaseTypeEncoding::Generic | BaseTypeEncoding::Signed => BaseType::unsigned(self.byte_size),
            BaseTypeEncoding::SignedChar => Self {
                byte_size: self.byte_size,
                encoding: BaseTypeEncoding::UnsignedChar,
            },
            _ => self,
        }
    }

    fn class(self) -> TypeClass {
        match self.encoding {
            BaseTypeEncoding::Boolean => TypeClass::Boolean,
            BaseTypeEncoding::Float => TypeClass::Float,
            _ => TypeClass::Integer,
        }
    }

    /// Whether two types may be combined by a binary operation.
    ///
    /// This is structural, so the generic type matches a signed integer of the same size.
    pub fn compatible_with(self, other: BaseType) -> bool {
        self.class() == other.class()
            && self.is_signed() == other.is_signed()
            && self.byte_size == other.byte_size
    }

    pub(crate) fn bit_size(self) -> u32 {
        u32::from(self.byte_size.min(8)) * 8
    }

    pub(crate) fn mask(self) -> u64 {
        match self.bit_size() {
            64 => u64::MAX,
            bits => (1u64 << bits) - 1,
        }
    }
}

/// A scalar on the DWARF stack: raw bits plus a base type.
///
/// Bits above the type size are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedValue {
    ty: BaseType,
    bits: u64,
}

impl TypedValue {
    /// Create a value from raw bits, truncated to the type size.
    pub fn from_bits(ty: BaseType, bits: u64) -> Self {
        Self {
            ty,
            bits: bits & ty.mask(),
        }
    }

    /// Create a value of type `ty` from a signed integer.
    pub fn from_i64(ty: BaseType, value: i64) -> Self {
        Self::from_bits(ty, value as u64)
    }

    /// Create a floating point value.
    pub fn from_f64(ty: BaseType, value: f64) -> Self {
        if ty.byte_size == 4 {
            Self::from_bits(ty, u64::from((value as f32).to_bits()))
        } else {
            Self::from_bits(ty, value.to_bits())
        }
    }

    /// Decode a value from target memory or register contents.
    ///
    /// Shorter inputs are extended according to the signedness of `ty`.
    pub fn from_bytes(ty: BaseType, bytes: &[u8], byte_order: ByteOrder) -> Self {
        let len = bytes.len().min(8);
        let mut raw = 0u64;
        let ordered: Box<dyn Iterator<Item = &u8>> = match byte_order {
            ByteOrder::Little => Box::new(bytes[..len].iter().rev()),
            ByteOrder::Big => Box::new(bytes[bytes.len() - len..].iter()),
        };
        for byte in ordered {
            raw = (raw << 8) | u64::from(*byte);
        }
        if ty.is_signed() && !ty.is_float() && len > 0 && len < 8 {
            let shift = 64 - 8 * len as u32;
            raw = (((raw << shift) as i64) >> shift) as u64;
        }
        Self::from_bits(ty, raw)
    }

    /// Encode the value in target byte order, `byte_size` bytes long.
    pub fn to_bytes(&self, byte_order: ByteOrder) -> Vec<u8> {
        let size = usize::from(self.ty.byte_size.min(8));
        let le = self.bits.to_le_bytes();
        let mut bytes = le[..size].to_vec();
        if byte_order.is_big() {
            bytes.reverse();
        }
        bytes
    }

    /// The base type of the value.
    pub fn ty(&self) -> BaseType {
        self.ty
    }

    /// The raw bits, zero extended.
    pub fn as_u64(&self) -> u64 {
        self.bits
    }

    /// The raw bits, sign extended from the type size.
    pub fn as_i64(&self) -> i64 {
        let shift = 64 - self.ty.bit_size();
        ((self.bits << shift) as i64) >> shift
    }

    /// The value as an integer, sign extended for signed types.
    pub fn as_integer(&self) -> i128 {
        if self.ty.is_signed() {
            i128::from(self.as_i64())
        } else {
            i128::from(self.bits)
        }
    }

    fn as_f64(&self) -> f64 {
        if self.ty.byte_size == 4 {
            f64::from(f32::from_bits(self.bits as u32))
        } else {
            f64::from_bits(self.bits)
        }
    }

    /// Whether the value is nonzero, as tested by `DW_OP_bra`.
    pub fn is_true(&self) -> bool {
        self.bits != 0
    }

    fn require_integral(&self) -> Result<(), ExpressionError> {
        if self.ty.is_integral() {
            Ok(())
        } else {
            Err(ExpressionError::IntegralTypeExpected)
        }
    }

    fn require_compatible(&self, other: &TypedValue) -> Result<(), ExpressionError> {
        if self.ty.compatible_with(other.ty) {
            Ok(())
        } else {
            Err(ExpressionError::TypeMismatch)
        }
    }

    fn arith(
        self,
        other: TypedValue,
        int_op: impl Fn(u64, u64) -> u64,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> Result<TypedValue, ExpressionError> {
        self.require_compatible(&other)?;
        if self.ty.is_float() {
            Ok(TypedValue::from_f64(self.ty, float_op(self.as_f64(), other.as_f64())))
        } else {
            Ok(TypedValue::from_bits(self.ty, int_op(self.bits, other.bits)))
        }
    }

    /// `self + other`, wrapping.
    pub fn add(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.arith(other, u64::wrapping_add, |a, b| a + b)
    }

    /// `self - other`, wrapping.
    pub fn sub(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.arith(other, u64::wrapping_sub, |a, b| a - b)
    }

    /// `self * other`, wrapping.
    pub fn mul(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.arith(other, u64::wrapping_mul, |a, b| a * b)
    }

    /// `self / other`, truncating towards zero. Signed for signed types.
    pub fn div(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.require_compatible(&other)?;
        if self.ty.is_float() {
            return Ok(TypedValue::from_f64(self.ty, self.as_f64() / other.as_f64()));
        }
        if other.bits == 0 {
            return Err(ExpressionError::DivisionByZero);
        }
        let quotient = if self.ty.is_signed() {
            self.as_i64().wrapping_div(other.as_i64()) as u64
        } else {
            self.bits / other.bits
        };
        Ok(TypedValue::from_bits(self.ty, quotient))
    }

    /// Floored modulo, the result has the sign of `other`. `x mod 0` is `x`.
    pub fn rem(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.require_compatible(&other)?;
        self.require_integral()?;
        if other.bits == 0 {
            return Ok(self);
        }
        let result = if self.ty.is_signed() {
            let (a, b) = (self.as_i64(), other.as_i64());
            let r = a.wrapping_rem(b);
            if r != 0 && ((r < 0) != (b < 0)) {
                r.wrapping_add(b) as u64
            } else {
                r as u64
            }
        } else {
            self.bits % other.bits
        };
        Ok(TypedValue::from_bits(self.ty, result))
    }

    fn bitwise(
        self,
        other: TypedValue,
        op: impl Fn(u64, u64) -> u64,
    ) -> Result<TypedValue, ExpressionError> {
        self.require_compatible(&other)?;
        self.require_integral()?;
        Ok(TypedValue::from_bits(self.ty, op(self.bits, other.bits)))
    }

    /// Bitwise and.
    pub fn and(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.bitwise(other, |a, b| a & b)
    }

    /// Bitwise or.
    pub fn or(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.bitwise(other, |a, b| a | b)
    }

    /// Bitwise exclusive or.
    pub fn xor(self, other: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.bitwise(other, |a, b| a ^ b)
    }

    /// Shift left. Shifting by the type width or more yields zero.
    pub fn shl(self, amount: TypedValue) -> Result<TypedValue, ExpressionError> {
        let bits = self.ty.bit_size();
        self.bitwise(amount, |a, b| if b >= u64::from(bits) { 0 } else { a << b })
    }

    /// Logical shift right, also for signed types.
    pub fn shr(self, amount: TypedValue) -> Result<TypedValue, ExpressionError> {
        let bits = self.ty.bit_size();
        self.bitwise(amount, |a, b| if b >= u64::from(bits) { 0 } else { a >> b })
    }

    /// Arithmetic shift right, filling with the sign bit.
    pub fn shra(self, amount: TypedValue) -> Result<TypedValue, ExpressionError> {
        self.require_compatible(&amount)?;
        self.require_integral()?;
        let shift = amount.bits.min(63) as u32;
        Ok(TypedValue::from_i64(self.ty, self.as_i64() >> shift))
    }

    /// Bitwise complement.
    pub fn not(self) -> Result<TypedValue, ExpressionError> {
        self.require_integral()?;
        Ok(TypedValue::from_bits(self.ty, !self.bits))
    }

    /// Two's complement negation.
    pub fn neg(self) -> TypedValue {
        if self.ty.is_float() {
            TypedValue::from_f64(self.ty, -self.as_f64())
        } else {
            TypedValue::from_bits(self.ty, self.bits.wrapping_neg())
        }
    }

    /// Negate if the value is less than zero.
    pub fn abs(self) -> TypedValue {
        let negative = if self.ty.is_float() {
            self.as_f64() < 0.0
        } else {
            self.ty.is_signed() && self.as_i64() < 0
        };
        if negative {
            self.neg()
        } else {
            self
        }
    }

    /// `self < other` in the value's own type.
    pub fn less_than(&self, other: &TypedValue) -> Result<bool, ExpressionError> {
        self.require_compatible(other)?;
        let ordering = if self.ty.is_float() {
            self.as_f64().partial_cmp(&other.as_f64())
        } else if self.ty.is_signed() {
            Some(self.as_i64().cmp(&other.as_i64()))
        } else {
            Some(self.bits.cmp(&other.bits))
        };
        Ok(ordering == Some(Ordering::Less))
    }

    /// `self == other` in the value's own type.
    pub fn equals(&self, other: &TypedValue) -> Result<bool, ExpressionError> {
        self.require_compatible(other)?;
        if self.ty.is_float() {
            Ok(self.as_f64() == other.as_f64())
        } else {
            Ok(self.bits == other.bits)
        }
    }

    /// Convert the value to another type, preserving the numeric value where possible.
    pub fn convert(self, ty: BaseType) -> TypedValue {
        match (self.ty.is_float(), ty.is_float()) {
            (true, true) => TypedValue::from_f64(ty, self.as_f64()),
            (true, false) => {
                let value = self.as_f64();
                if ty.is_signed() {
                    TypedValue::from_i64(ty, value as i64)
                } else {
                    TypedValue::from_bits(ty, value as u64)
                }
            }
            (false, true) => {
                let value = if self.ty.is_signed() {
                    self.as_i64() as f64
                } else {
                    self.bits as f64
                };
                TypedValue::from_f64(ty, value)
            }
            (false, false) => {
                let extended = if self.ty.is_signed() {
                    self.as_i64() as u64
                } else {
                    self.bits
                };
                TypedValue::from_bits(ty, extended)
            }
        }
    }

    /// Reinterpret the bits of the value as another type of the same size.
    pub fn reinterpret(self, ty: BaseType) -> Result<TypedValue, ExpressionError> {
        if ty.byte_size != self.ty.byte_size {
            return Err(ExpressionError::InvalidExpression(
                "DW_OP_reinterpret has wrong size".to_string(),
            ));
        }
        Ok(TypedValue::from_bits(ty, self.bits))
    }
}
