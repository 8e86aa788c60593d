use std::sync::Arc;

use bitvec::prelude::*;

use crate::{
    bits::{bits_to_bytes, copy_bitwise},
    config::EvaluationConfig,
    location::{evaluate_location_description, Subobject, TypeKind, Value, ValueType},
    piece::{Piece, PieceLocation},
    services::{ExpressionServices, FrameId, SyntheticPointerTarget},
    value::{BaseType, TypedValue},
    ExpressionError,
};

/// A bit mask over the contents of a value.
pub type BitMask = BitVec<u8, Lsb0>;

/// Contents read from a composite value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceContents {
    /// The bytes of the value. Bits that could not be read are zero.
    pub bytes: Vec<u8>,
    /// Bits whose storage was not available.
    pub unavailable: BitMask,
    /// Bits that are optimized out.
    pub optimized_out: BitMask,
}

impl PieceContents {
    fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            unavailable: BitMask::repeat(false, 8 * len),
            optimized_out: BitMask::repeat(false, 8 * len),
        }
    }
}

fn mark(mask: &mut BitMask, offset: u64, len: u64) {
    let start = offset as usize;
    let end = (start + len as usize).min(mask.len());
    if start < end {
        mask[start..end].fill(true);
    }
}

/// The direction of a transfer between a value and its pieces.
enum Access<'a> {
    Read(&'a mut PieceContents),
    Write {
        from: &'a [u8],
        optimized_out: &'a mut BitMask,
    },
}

impl Access<'_> {
    fn mark_optimized_out(&mut self, offset: u64, len: u64) {
        match self {
            Access::Read(contents) => mark(&mut contents.optimized_out, offset, len),
            Access::Write { optimized_out, .. } => mark(optimized_out, offset, len),
        }
    }
}

/// A value whose storage is a list of pieces.
///
/// Several values may view the same pieces at different offsets, e.g. the elements of an
/// array. The piece list lives as long as the last value referencing it.
#[derive(Debug, Clone)]
pub struct PiecedValue {
    pieces: Arc<[Piece]>,
    frame: Option<FrameId>,
    config: EvaluationConfig,
    offset_bits: u64,
}

impl PiecedValue {
    /// Wrap the pieces produced by an evaluation in `frame`.
    pub fn new(pieces: Vec<Piece>, frame: Option<FrameId>, config: EvaluationConfig) -> Self {
        Self {
            pieces: pieces.into(),
            frame,
            config,
            offset_bits: 0,
        }
    }

    /// A view of the same pieces starting `byte_offset` bytes further in.
    pub fn subvalue(&self, byte_offset: u64) -> Self {
        Self {
            offset_bits: self.offset_bits + 8 * byte_offset,
            ..self.clone()
        }
    }

    /// The pieces.
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Whether `other` views the same piece list.
    pub fn shares_pieces_with(&self, other: &PiecedValue) -> bool {
        Arc::ptr_eq(&self.pieces, &other.pieces)
    }

    /// Read `len` bytes of the value.
    pub fn read(
        &self,
        services: &mut dyn ExpressionServices,
        len: usize,
    ) -> Result<PieceContents, ExpressionError> {
        let mut contents = PieceContents::new(len);
        self.transfer(services, 8 * len as u64, Access::Read(&mut contents))?;
        Ok(contents)
    }

    /// Write `from` into the pieces.
    ///
    /// Pieces that cannot be written are not an error, their bits are returned as optimized out.
    pub fn write(
        &self,
        services: &mut dyn ExpressionServices,
        from: &[u8],
    ) -> Result<BitMask, ExpressionError> {
        let mut optimized_out = BitMask::repeat(false, 8 * from.len());
        self.transfer(
            services,
            8 * from.len() as u64,
            Access::Write {
                from,
                optimized_out: &mut optimized_out,
            },
        )?;
        Ok(optimized_out)
    }

    fn transfer(
        &self,
        services: &mut dyn ExpressionServices,
        max_offset: u64,
        mut access: Access<'_>,
    ) -> Result<(), ExpressionError> {
        let mut bits_to_skip = self.offset_bits;
        let mut first = 0;
        while first < self.pieces.len() && bits_to_skip >= self.pieces[first].size_bits {
            bits_to_skip -= self.pieces[first].size_bits;
            first += 1;
        }

        let mut offset = 0;
        for piece in &self.pieces[first..] {
            if offset >= max_offset {
                break;
            }
            let size_bits = (piece.size_bits - bits_to_skip).min(max_offset - offset);

            match &piece.location {
                PieceLocation::Register(register) => self.transfer_register(
                    services,
                    *register,
                    piece,
                    bits_to_skip,
                    offset,
                    size_bits,
                    &mut access,
                )?,
                PieceLocation::Memory { address, .. } => self.transfer_memory(
                    services,
                    *address,
                    bits_to_skip + piece.location_offset_bits,
                    offset,
                    size_bits,
                    &mut access,
                )?,
                PieceLocation::StackValue(value) => match &mut access {
                    Access::Read(contents) => {
                        let bytes = value.to_bytes(self.config.byte_order);
                        let value_bits = 8 * bytes.len() as u64;
                        // Zeros if the piece reaches beyond the value.
                        if piece.location_offset_bits + piece.size_bits <= value_bits {
                            // The piece is anchored at the least significant end.
                            let skip = if self.config.byte_order.is_big() {
                                bits_to_skip + value_bits - piece.location_offset_bits - piece.size_bits
                            } else {
                                bits_to_skip + piece.location_offset_bits
                            };
                            copy_bitwise(
                                &mut contents.bytes,
                                offset,
                                &bytes,
                                skip,
                                size_bits,
                                self.config.bits_big_endian,
                            );
                        }
                    }
                    Access::Write { .. } => access.mark_optimized_out(offset, size_bits),
                },
                PieceLocation::Literal(data) => match &mut access {
                    Access::Read(contents) => {
                        let literal_bits = 8 * data.len() as u64;
                        let skip = bits_to_skip + piece.location_offset_bits;
                        // Cut off at the end of the literal.
                        if skip < literal_bits {
                            copy_bitwise(
                                &mut contents.bytes,
                                offset,
                                data,
                                skip,
                                size_bits.min(literal_bits - skip),
                                self.config.bits_big_endian,
                            );
                        }
                    }
                    Access::Write { .. } => access.mark_optimized_out(offset, size_bits),
                },
                // Synthetic pointers read as zeros, but are not optimized out.
                PieceLocation::ImplicitPointer { .. } => {
                    if let Access::Write { .. } = access {
                        access.mark_optimized_out(offset, size_bits);
                    }
                }
                PieceLocation::OptimizedOut => access.mark_optimized_out(offset, size_bits),
            }

            offset += size_bits;
            bits_to_skip = 0;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer_register(
        &self,
        services: &mut dyn ExpressionServices,
        register: u16,
        piece: &Piece,
        bits_to_skip: u64,
        offset: u64,
        size_bits: u64,
        access: &mut Access<'_>,
    ) -> Result<(), ExpressionError> {
        let frame = self.frame.ok_or_else(|| {
            ExpressionError::UnsupportedInContext(
                "Register pieces need a frame to be accessed.".to_string(),
            )
        })?;

        let whole_register = if matches!(access, Access::Write { .. })
            && bits_to_skip == 0
            && piece.location_offset_bits == 0
            && size_bits == piece.size_bits
        {
            services
                .register_size(frame, register)
                .filter(|bytes| 8 * *bytes as u64 == size_bits)
        } else {
            None
        };
        // A write of every bit of the register does not need its old contents.
        let read = match whole_register {
            Some(bytes) => Ok(vec![0; bytes]),
            None => services.read_register(frame, register),
        };
        let mut register_bytes = match (read, &mut *access) {
            (Ok(bytes), _) => bytes,
            (Err(ExpressionError::OptimizedOut(_)), Access::Read(contents)) => {
                mark(&mut contents.optimized_out, offset, size_bits);
                return Ok(());
            }
            (Err(ExpressionError::NotAvailable(_)), Access::Read(contents)) => {
                mark(&mut contents.unavailable, offset, size_bits);
                return Ok(());
            }
            (Err(ExpressionError::OptimizedOut(_)), Access::Write { .. }) => {
                return Err(ExpressionError::OptimizedOut(
                    "Can't do read-modify-write to update bitfield; containing word has been optimized out"
                        .to_string(),
                ))
            }
            (Err(ExpressionError::NotAvailable(_)), Access::Write { .. }) => {
                return Err(ExpressionError::NotAvailable(
                    "Can't do read-modify-write to update bitfield; containing word is unavailable"
                        .to_string(),
                ))
            }
            (Err(error), _) => return Err(error),
        };

        let register_bits = 8 * register_bytes.len() as u64;
        let end_in_register = piece.location_offset_bits + piece.size_bits;
        let skip = if self.config.bits_big_endian && end_in_register < register_bits {
            // Less than the full register, taken from the other end.
            bits_to_skip + register_bits - end_in_register
        } else {
            bits_to_skip + piece.location_offset_bits
        };

        let start = (skip / 8) as usize;
        let len = bits_to_bytes(skip, size_bits);
        if start + len > register_bytes.len() {
            return Err(ExpressionError::InvalidExpression(format!(
                "Bad debug information detected: Attempt to read {len} bytes from register {register}."
            )));
        }

        match access {
            Access::Read(contents) => copy_bitwise(
                &mut contents.bytes,
                offset,
                &register_bytes[start..start + len],
                skip % 8,
                size_bits,
                self.config.bits_big_endian,
            ),
            Access::Write { from, .. } => {
                copy_bitwise(
                    &mut register_bytes[start..start + len],
                    skip % 8,
                    from,
                    offset,
                    size_bits,
                    self.config.bits_big_endian,
                );
                services.write_register(frame, register, &register_bytes)?;
            }
        }
        Ok(())
    }

    fn transfer_memory(
        &self,
        services: &mut dyn ExpressionServices,
        address: u64,
        skip: u64,
        offset: u64,
        size_bits: u64,
        access: &mut Access<'_>,
    ) -> Result<(), ExpressionError> {
        let start_address = address.wrapping_add(skip / 8);
        let aligned = skip % 8 == 0 && size_bits % 8 == 0 && offset % 8 == 0;

        match access {
            Access::Read(contents) => {
                if aligned {
                    let range = (offset / 8) as usize..((offset + size_bits) / 8) as usize;
                    match services.read_memory(start_address, &mut contents.bytes[range]) {
                        Err(ExpressionError::NotAvailable(_)) => {
                            mark(&mut contents.unavailable, offset, size_bits)
                        }
                        other => other?,
                    }
                    return Ok(());
                }
                let mut buffer = vec![0; bits_to_bytes(skip, size_bits)];
                match services.read_memory(start_address, &mut buffer) {
                    Ok(()) => copy_bitwise(
                        &mut contents.bytes,
                        offset,
                        &buffer,
                        skip % 8,
                        size_bits,
                        self.config.bits_big_endian,
                    ),
                    Err(ExpressionError::NotAvailable(_)) => {
                        mark(&mut contents.unavailable, offset, size_bits)
                    }
                    Err(error) => return Err(error),
                }
            }
            Access::Write { from, .. } => {
                if aligned {
                    let range = (offset / 8) as usize..((offset + size_bits) / 8) as usize;
                    return services.write_memory(start_address, &from[range]);
                }
                let len = bits_to_bytes(skip, size_bits);
                let mut buffer = vec![0; len];
                if len <= 8 {
                    services.read_memory(start_address, &mut buffer)?;
                } else {
                    // Only the first and last bytes can keep any of their bits.
                    services.read_memory(start_address, &mut buffer[..1])?;
                    services.read_memory(start_address + len as u64 - 1, &mut buffer[len - 1..])?;
                }
                copy_bitwise(
                    &mut buffer,
                    skip % 8,
                    from,
                    offset,
                    size_bits,
                    self.config.bits_big_endian,
                );
                services.write_memory(start_address, &buffer)?;
            }
        }
        Ok(())
    }

    /// The pieces overlapping `len_bits` bits at `offset_bits` of this value.
    fn pieces_in_range(&self, offset_bits: u64, len_bits: u64) -> Vec<&Piece> {
        let mut bit_offset = self.offset_bits + offset_bits;
        let mut remaining = len_bits;
        let mut overlapping = Vec::new();
        for piece in self.pieces.iter() {
            if remaining == 0 {
                break;
            }
            if bit_offset >= piece.size_bits {
                bit_offset -= piece.size_bits;
                continue;
            }
            remaining -= (piece.size_bits - bit_offset).min(remaining);
            bit_offset = 0;
            overlapping.push(piece);
        }
        overlapping
    }

    /// Whether any bit in the range is optimized out.
    pub fn bits_any_optimized_out(&self, offset_bits: u64, len_bits: u64) -> bool {
        self.pieces_in_range(offset_bits, len_bits)
            .iter()
            .any(|piece| piece.location == PieceLocation::OptimizedOut)
    }

    /// Whether any bit in the range has storage.
    pub fn bits_any_available(&self, offset_bits: u64, len_bits: u64) -> bool {
        self.pieces_in_range(offset_bits, len_bits)
            .iter()
            .any(|piece| piece.location != PieceLocation::OptimizedOut)
    }

    /// Whether the range is made up entirely of synthetic pointers.
    pub fn bits_synthetic_pointer(&self, offset_bits: u64, len_bits: u64) -> bool {
        self.pieces_in_range(offset_bits, len_bits)
            .iter()
            .all(|piece| matches!(piece.location, PieceLocation::ImplicitPointer { .. }))
    }

    /// Follow a pointer or reference whose whole contents are a single synthetic pointer piece.
    ///
    /// Returns `None` if the value is not such a pointer. `contents` is the pointer value
    /// read from this composite, and holds a byte offset relative to the piece offset.
    pub fn indirect(
        &self,
        services: &mut dyn ExpressionServices,
        ty: &ValueType,
        contents: &[u8],
    ) -> Result<Option<Value>, ExpressionError> {
        let (TypeKind::Pointer(target) | TypeKind::Reference(target)) = &ty.kind else {
            return Ok(None);
        };

        let mut bit_offset = self.offset_bits;
        let mut remaining = 8 * ty.byte_size;
        let mut found = None;
        for piece in self.pieces.iter() {
            if remaining == 0 {
                break;
            }
            if bit_offset >= piece.size_bits {
                bit_offset -= piece.size_bits;
                continue;
            }
            remaining = remaining.saturating_sub(piece.size_bits - bit_offset);
            bit_offset = 0;
            let PieceLocation::ImplicitPointer { die, offset } = piece.location else {
                return Ok(None);
            };
            if remaining != 0 {
                return Err(ExpressionError::InvalidExpression(
                    "Invalid use of DW_OP_implicit_pointer".to_string(),
                ));
            }
            found = Some((die, offset));
        }
        let Some((die, piece_offset)) = found else {
            return Ok(None);
        };

        // The pointer contents are an offset, sign extended from the pointer width.
        let pointer = TypedValue::from_bytes(
            BaseType::signed(ty.byte_size.min(8) as u8),
            contents,
            self.config.byte_order,
        );
        let byte_offset = pointer.as_i64().wrapping_add(piece_offset);

        tracing::debug!("following synthetic pointer to {die:?} at offset {byte_offset}");
        let target_value = match services.synthetic_pointer_target(die)? {
            Some(SyntheticPointerTarget::Location {
                expression,
                byte_size,
            }) => evaluate_location_description(
                services,
                self.config,
                self.frame,
                &expression,
                &ValueType::scalar(byte_size),
                Some(Subobject {
                    ty: (**target).clone(),
                    byte_offset,
                }),
            )?,
            Some(SyntheticPointerTarget::ConstValue(bytes)) => {
                let size = target.byte_size;
                let start = u64::try_from(byte_offset)
                    .map_err(|_| ExpressionError::InvalidSyntheticPointer)?;
                if start + size > bytes.len() as u64 {
                    return Err(ExpressionError::InvalidSyntheticPointer);
                }
                Value::from_bytes(
                    (**target).clone(),
                    bytes[start as usize..(start + size) as usize].to_vec(),
                    self.config.byte_order,
                )
            }
            None => Value::optimized_out((**target).clone(), self.config.byte_order),
        };
        Ok(Some(target_value))
    }
}
