use gimli::{Register, UnitOffset};

use crate::bytecode::{block_to_dwarf_reg, block_to_sp_offset};

/// Where the callee finds a parameter, as recorded at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// The parameter is passed in a DWARF register.
    DwarfReg(Register),
    /// The parameter is passed on the stack, at this offset from the caller's stack pointer.
    ///
    /// From the callee it is the same as `DW_OP_fbreg` with this offset.
    FrameBaseOffset(i64),
    /// The parameter is identified by its DIE in the callee (`DW_AT_call_parameter`).
    ParamOffset(UnitOffset),
}

impl ParameterKind {
    /// Classify the `DW_AT_location` of a `DW_TAG_call_site_parameter`.
    pub fn from_location(block: &[u8], stack_pointer: Option<u16>) -> Option<Self> {
        if let Some(reg) = block_to_dwarf_reg(block) {
            return Some(ParameterKind::DwarfReg(Register(reg)));
        }
        stack_pointer
            .and_then(|sp| block_to_sp_offset(block, sp))
            .map(ParameterKind::FrameBaseOffset)
    }
}

/// A `DW_TAG_call_site_parameter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteParameter {
    /// How the callee refers to the parameter.
    pub kind: ParameterKind,
    /// `DW_AT_call_value`: computes the value in the caller's frame.
    pub value: Vec<u8>,
    /// `DW_AT_call_data_value`: computes the value the parameter points to, for references.
    pub data_value: Option<Vec<u8>>,
}

/// Where a call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSiteTarget {
    /// A fixed address, before relocation.
    Address(u64),
    /// A function name, resolved through the symbol tables.
    Symbol(String),
    /// A DWARF expression evaluated in the caller's frame.
    Expression(Vec<u8>),
    /// The compiler did not record a target.
    Unknown,
}

/// A `DW_TAG_call_site`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// The return address of the call.
    pub pc: u64,
    /// Whether the call is a tail call.
    pub tail_call: bool,
    /// The called function.
    pub target: CallSiteTarget,
    /// Parameters whose entry values can be recovered.
    pub parameters: Vec<CallSiteParameter>,
    /// Address size of the unit holding the call site.
    pub address_size: u8,
    /// Relocation of the unit holding the call site.
    pub text_offset: u64,
}

impl CallSite {
    /// Create a call site without parameters.
    pub fn new(pc: u64, target: CallSiteTarget) -> Self {
        Self {
            pc,
            tail_call: false,
            target,
            parameters: Vec::new(),
            address_size: 8,
            text_offset: 0,
        }
    }

    /// Mark the call site as a tail call.
    pub fn tail_call(mut self) -> Self {
        self.tail_call = true;
        self
    }

    /// Add a parameter.
    pub fn with_parameter(mut self, parameter: CallSiteParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// The recorded parameter for `kind`.
    pub fn parameter(&self, kind: ParameterKind) -> Option<&CallSiteParameter> {
        self.parameters.iter().find(|parameter| parameter.kind == kind)
    }
}

/// The call sites that certainly lie between a caller and a callee.
///
/// `call_sites` is one path found; only its first `callers` and last `callees` entries are
/// common to every path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteChain {
    /// The tail call sites of one path, from the caller towards the callee.
    pub call_sites: Vec<CallSite>,
    /// Number of leading call sites shared by all paths.
    pub callers: usize,
    /// Number of trailing call sites shared by all paths.
    pub callees: usize,
}
