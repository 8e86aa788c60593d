use gimli::RunTimeEndian;
use serde::{Deserialize, Serialize};

/// Byte order of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// Returns `true` for big endian targets.
    pub fn is_big(self) -> bool {
        self == ByteOrder::Big
    }
}

impl From<ByteOrder> for RunTimeEndian {
    fn from(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Little => RunTimeEndian::Little,
            ByteOrder::Big => RunTimeEndian::Big,
        }
    }
}

/// Settings for evaluating DWARF expressions of one compilation unit on one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Size of a target address in bytes.
    pub address_size: u8,
    /// Size of a `DW_FORM_ref_addr` reference, or `None` where references to other
    /// DIEs make no sense (e.g. CFA expressions).
    pub ref_address_size: Option<u8>,
    /// Byte order of the target.
    pub byte_order: ByteOrder,
    /// Bit numbering inside bytes when pieces are narrower than their location.
    ///
    /// Architectures decide this separately from the byte order.
    pub bits_big_endian: bool,
    /// Relocation added to addresses from `DW_OP_addr` and `DW_OP_addrx`.
    pub base_offset: u64,
    /// Maximum nesting of evaluations (frame base, calls, entry values).
    pub max_recursion_depth: u32,
    /// DWARF number of the stack pointer, used to recognise stack based call site parameters.
    pub stack_pointer_register: Option<u16>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            address_size: 8,
            ref_address_size: Some(4),
            byte_order: ByteOrder::Little,
            bits_big_endian: false,
            base_offset: 0,
            max_recursion_depth: 256,
            stack_pointer_register: None,
        }
    }
}

impl EvaluationConfig {
    /// Mask with the low `address_size` bytes set.
    pub fn address_mask(&self) -> u64 {
        match self.address_size {
            8.. => u64::MAX,
            size => (1u64 << (8 * u32::from(size))) - 1,
        }
    }

    /// The endianity in gimli terms.
    pub fn endian(&self) -> RunTimeEndian {
        self.byte_order.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = EvaluationConfig::default();
        assert_eq!(config.max_recursion_depth, 256);
        assert_eq!(config.address_mask(), u64::MAX);
    }

    #[test]
    fn address_mask_for_32_bit_targets() {
        let config = EvaluationConfig {
            address_size: 4,
            ..Default::default()
        };
        assert_eq!(config.address_mask(), 0xffff_ffff);
    }
}
