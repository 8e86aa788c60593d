use gimli::{DebugInfoOffset, UnitOffset};

use crate::{call_site::CallSite, value::BaseType, ExpressionError};

/// Identifies a stack frame of the debuggee, as numbered by the frame service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub usize);

/// What produced a frame during unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    /// A regular frame with its own stack storage.
    #[default]
    Normal,
    /// A frame for an inlined function, sharing the registers of the outer frame.
    Inline,
    /// A frame reconstructed from tail call information.
    TailCall,
}

/// An opaque architecture identifier. Two frames with different ids cannot share call site data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArchId(pub u32);

/// A reference to a debugging information entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DieReference {
    /// Offset relative to the current compilation unit (`DW_OP_call2`, `DW_OP_call4`).
    Unit(UnitOffset),
    /// Offset into `.debug_info` (`DW_OP_call_ref`, `DW_OP_implicit_pointer`).
    DebugInfo(DebugInfoOffset),
}

/// What a synthetic pointer points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticPointerTarget {
    /// The referenced variable has a location description.
    Location {
        /// The location expression of the variable.
        expression: Vec<u8>,
        /// Size of the variable's type in bytes.
        byte_size: u64,
    },
    /// The referenced variable is a constant with the given bytes.
    ConstValue(Vec<u8>),
}

/// How the canonical frame address is computed at some PC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfaRule {
    /// The CFA is a register plus an offset.
    RegisterOffset {
        /// DWARF register number.
        register: u16,
        /// Offset added to the register value.
        offset: i64,
    },
    /// The CFA is computed by a DWARF expression.
    Expression(Vec<u8>),
}

fn unsupported<T>(what: &str) -> Result<T, ExpressionError> {
    Err(ExpressionError::UnsupportedInContext(format!(
        "{what} is not supported in this context"
    )))
}

/// Access to target memory.
pub trait MemoryAccess {
    /// Read `data.len()` bytes starting at `address`.
    ///
    /// Memory that exists but was not collected should be reported with
    /// [`ExpressionError::NotAvailable`].
    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), ExpressionError>;

    /// Write `data` to target memory at `address`.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), ExpressionError> {
        let _ = (address, data);
        unsupported("Writing memory")
    }
}

/// Access to unwound frames and their registers.
pub trait FrameAccess {
    /// Read the raw bytes of a register, in target byte order.
    fn read_register(&mut self, frame: FrameId, register: u16) -> Result<Vec<u8>, ExpressionError>;

    /// Write the raw bytes of a register, in target byte order.
    fn write_register(
        &mut self,
        frame: FrameId,
        register: u16,
        data: &[u8],
    ) -> Result<(), ExpressionError> {
        let _ = (frame, register, data);
        unsupported("Writing registers")
    }

    /// The size in bytes of a register, when known without reading it.
    fn register_size(&mut self, frame: FrameId, register: u16) -> Option<usize> {
        let _ = (frame, register);
        None
    }

    /// The frame base (`DW_AT_frame_base`) expression of the function of `frame`.
    fn frame_base_expression(&mut self, frame: FrameId) -> Result<Vec<u8>, ExpressionError> {
        let _ = frame;
        unsupported("DW_OP_fbreg")
    }

    /// The canonical frame address of `frame`.
    fn call_frame_cfa(&mut self, frame: FrameId) -> Result<u64, ExpressionError> {
        let _ = frame;
        unsupported("DW_OP_call_frame_cfa")
    }

    /// The program counter of `frame`.
    fn frame_pc(&mut self, frame: FrameId) -> Result<u64, ExpressionError>;

    /// The frame that called `frame`, if it could be unwound.
    fn caller_frame(&mut self, frame: FrameId) -> Result<Option<FrameId>, ExpressionError> {
        let _ = frame;
        Ok(None)
    }

    /// How `frame` was produced.
    fn frame_kind(&self, frame: FrameId) -> FrameKind {
        let _ = frame;
        FrameKind::Normal
    }

    /// Entry address of the function executing in `frame`.
    fn frame_function(&mut self, frame: FrameId) -> Result<Option<u64>, ExpressionError> {
        let _ = frame;
        Ok(None)
    }

    /// Architecture of `frame`.
    fn frame_arch(&self, frame: FrameId) -> ArchId {
        let _ = frame;
        ArchId::default()
    }

    /// Architecture of the caller of `frame`, as determined by the unwinder.
    fn unwound_arch(&self, frame: FrameId) -> ArchId {
        self.frame_arch(frame)
    }

    /// Translate a thread local storage offset into an address.
    fn tls_address(&mut self, frame: Option<FrameId>, offset: u64) -> Result<u64, ExpressionError> {
        let _ = (frame, offset);
        unsupported("DW_OP_form_tls_address")
    }
}

/// Access to pre-decoded debugging information.
pub trait DebugInfoAccess {
    /// Look up the base type DIE at `offset` in the current unit.
    fn base_type(&mut self, offset: UnitOffset) -> Result<BaseType, ExpressionError> {
        let _ = offset;
        unsupported("Typed DWARF operations")
    }

    /// The location expression of the DIE called by `DW_OP_call2`, `DW_OP_call4` or `DW_OP_call_ref`.
    fn subroutine_location(&mut self, die: DieReference) -> Result<Vec<u8>, ExpressionError> {
        let _ = die;
        unsupported("DW_OP_call")
    }

    /// Entry `index` of the `.debug_addr` table of the current unit.
    fn address_index(&mut self, index: u64) -> Result<u64, ExpressionError> {
        let _ = index;
        unsupported("DW_OP_addrx")
    }

    /// The variable a synthetic pointer refers to, or `None` if it has neither a location nor a value.
    fn synthetic_pointer_target(
        &mut self,
        die: DebugInfoOffset,
    ) -> Result<Option<SyntheticPointerTarget>, ExpressionError> {
        let _ = die;
        unsupported("DW_OP_implicit_pointer")
    }

    /// The call site whose return address is `pc`.
    fn call_site_at(&mut self, pc: u64) -> Result<Option<CallSite>, ExpressionError> {
        let _ = pc;
        Ok(None)
    }

    /// All call sites in the function starting at `function` that are tail calls.
    fn tail_call_sites(&mut self, function: u64) -> Result<Vec<CallSite>, ExpressionError> {
        let _ = function;
        Ok(Vec::new())
    }

    /// Entry address of the function containing `pc`.
    fn function_start(&mut self, pc: u64) -> Result<Option<u64>, ExpressionError> {
        let _ = pc;
        Ok(None)
    }

    /// Resolve a function symbol to its entry address.
    fn lookup_function(&mut self, name: &str) -> Result<Option<u64>, ExpressionError> {
        let _ = name;
        Ok(None)
    }

    /// The frame base expression of the function containing `pc`, without a live frame.
    fn frame_base_expression_at(&mut self, pc: u64) -> Result<Vec<u8>, ExpressionError> {
        let _ = pc;
        unsupported("DW_OP_fbreg")
    }

    /// The CFA rule at `pc`, without a live frame.
    fn cfa_rule_at(&mut self, pc: u64) -> Result<CfaRule, ExpressionError> {
        let _ = pc;
        unsupported("DW_OP_call_frame_cfa")
    }

    /// Map a DWARF register number to the register number of the agent.
    fn target_register(&self, dwarf_register: u16) -> Result<u16, ExpressionError> {
        Ok(dwarf_register)
    }
}

/// Everything the evaluator needs from the debugger.
pub trait ExpressionServices: MemoryAccess + FrameAccess + DebugInfoAccess {}

impl<T: MemoryAccess + FrameAccess + DebugInfoAccess> ExpressionServices for T {}
