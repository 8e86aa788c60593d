use bitvec::prelude::*;

/// Copy `bit_count` bits from `source` at bit `source_offset` into `dest` at bit `dest_offset`.
///
/// With `bits_big_endian`, bit 0 of a byte is its most significant bit.
pub(crate) fn copy_bitwise(
    dest: &mut [u8],
    dest_offset: u64,
    source: &[u8],
    source_offset: u64,
    bit_count: u64,
    bits_big_endian: bool,
) {
    if bit_count == 0 {
        return;
    }
    let (dest_offset, source_offset, bit_count) =
        (dest_offset as usize, source_offset as usize, bit_count as usize);
    let dest_range = dest_offset..dest_offset + bit_count;
    let source_range = source_offset..source_offset + bit_count;
    if bits_big_endian {
        dest.view_bits_mut::<Msb0>()[dest_range]
            .copy_from_bitslice(&source.view_bits::<Msb0>()[source_range]);
    } else {
        dest.view_bits_mut::<Lsb0>()[dest_range]
            .copy_from_bitslice(&source.view_bits::<Lsb0>()[source_range]);
    }
}

/// Number of bytes touched by `bit_count` bits starting at bit `start`.
pub(crate) fn bits_to_bytes(start: u64, bit_count: u64) -> usize {
    ((start % 8 + bit_count + 7) / 8) as usize
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(false, [0b1011_0000, 0b0000_0010]; "little endian bits")]
    #[test_case(true, [0b0000_1010, 0b1100_0000]; "big endian bits")]
    fn copies_across_byte_boundaries(bits_big_endian: bool, expected: [u8; 2]) {
        let source = [0b1101_0110u8];
        let mut dest = [0u8; 2];
        // Bits 1..6 of the source land at bits 4..9 of the destination.
        copy_bitwise(&mut dest, 4, &source, 1, 6, bits_big_endian);
        assert_eq!(dest, expected);
    }

    #[test]
    fn leaves_other_bits_alone() {
        let mut dest = [0xffu8];
        copy_bitwise(&mut dest, 2, &[0u8], 0, 3, false);
        assert_eq!(dest, [0b1110_0011]);
    }

    #[test]
    fn byte_counts() {
        assert_eq!(bits_to_bytes(0, 8), 1);
        assert_eq!(bits_to_bytes(7, 2), 2);
        assert_eq!(bits_to_bytes(12, 20), 3);
    }
}
