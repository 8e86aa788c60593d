//! Helpers for testing the crate

use std::collections::{BTreeMap, HashMap, HashSet};

use gimli::{leb128, DebugInfoOffset, DwOp, UnitOffset};
use tracing_subscriber::EnvFilter;

use crate::{
    call_site::CallSite,
    services::{
        ArchId, CfaRule, DebugInfoAccess, DieReference, FrameAccess, FrameId, FrameKind,
        MemoryAccess, SyntheticPointerTarget,
    },
    value::BaseType,
    ExpressionError,
};

/// Route `tracing` output of a test through the test harness.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
pub(crate) struct MockMemory {
    /// Sorted list of ranges
    values: Vec<(u64, Vec<u8>)>,
}

impl MockMemory {
    pub(crate) fn add_range(&mut self, address: u64, data: Vec<u8>) {
        assert!(!data.is_empty());

        match self
            .values
            .binary_search_by_key(&address, |(addr, _data)| *addr)
        {
            Ok(index) => {
                panic!(
                    "Failed to add data at {:#010x} - {:#010x}, already exists at {:#010x} - {:#010x}",
                    address,
                    address + data.len() as u64,
                    self.values[index].0,
                    self.values[index].0 + self.values[index].1.len() as u64
                );
            }
            Err(index) => {
                // Check both neighbours for overlap before inserting.
                if index > 0 {
                    let previous_entry = &self.values[index - 1];

                    assert!(
                        previous_entry.0 + previous_entry.1.len() as u64 <= address,
                        "Failed to add data at {:#010x}, overlaps with existing entry at {:#010x}",
                        address,
                        previous_entry.0,
                    );
                }

                if index < self.values.len() {
                    let next_entry = &self.values[index];

                    assert!(
                        next_entry.0 >= address + data.len() as u64,
                        "Failed to add data at {:#010x}, overlaps with existing entry at {:#010x}",
                        address,
                        next_entry.0,
                    );
                }

                self.values.insert(index, (address, data));
            }
        }
    }

    /// The stored range containing `address..address + len`, and the offset into it.
    fn locate(&mut self, address: u64, len: usize) -> Result<(&mut Vec<u8>, usize), ExpressionError> {
        let index = match self
            .values
            .binary_search_by_key(&address, |(addr, _data)| *addr)
        {
            Ok(index) => index,
            Err(0) => return Err(missing_range(address, len)),
            Err(index) => index - 1,
        };
        let (start, data) = &mut self.values[index];
        let offset = (address - *start) as usize;
        if offset + len > data.len() {
            return Err(missing_range(address, len));
        }
        Ok((data, offset))
    }

    pub(crate) fn bytes(&mut self, address: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.read(address, &mut data).unwrap();
        data
    }

    fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), ExpressionError> {
        let (stored, offset) = self.locate(address, data.len())?;
        data.copy_from_slice(&stored[offset..offset + data.len()]);
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), ExpressionError> {
        let (stored, offset) = self.locate(address, data.len())?;
        stored[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

fn missing_range(address: u64, len: usize) -> ExpressionError {
    ExpressionError::NotAvailable(format!(
        "No entry for range {:#010x} - {:#010x}",
        address,
        address + len as u64
    ))
}

/// A frame of [`MockTarget`].
#[derive(Debug, Default, Clone)]
pub(crate) struct MockFrame {
    /// Registers in target byte order. Missing registers are unavailable.
    pub registers: BTreeMap<u16, Vec<u8>>,
    /// Registers the callee did not save.
    pub optimized_out: HashSet<u16>,
    pub pc: u64,
    pub function: Option<u64>,
    pub frame_base: Option<Vec<u8>>,
    pub cfa: u64,
    pub kind: FrameKind,
    pub arch: ArchId,
    pub unwound_arch: Option<ArchId>,
    pub caller: Option<FrameId>,
}

impl MockFrame {
    /// Set a 64 bit little endian register.
    pub(crate) fn with_register(mut self, register: u16, value: u64) -> Self {
        self.registers.insert(register, value.to_le_bytes().to_vec());
        self
    }
}

/// A fake debuggee with memory, frames and debug information.
#[derive(Debug, Default)]
pub(crate) struct MockTarget {
    pub memory: MockMemory,
    pub frames: Vec<MockFrame>,
    pub base_types: HashMap<usize, BaseType>,
    pub subroutines: HashMap<DieReference, Vec<u8>>,
    pub addresses: Vec<u64>,
    pub synthetic_pointers: HashMap<DebugInfoOffset, SyntheticPointerTarget>,
    /// Call sites by return address.
    pub call_sites: HashMap<u64, CallSite>,
    /// Tail call sites by function entry address.
    pub tail_calls: HashMap<u64, Vec<CallSite>>,
    pub functions: HashMap<String, u64>,
    /// Address ranges of functions, for finding a function by PC.
    pub function_ranges: Vec<std::ops::Range<u64>>,
    pub frame_bases_at: HashMap<u64, Vec<u8>>,
    pub cfa_rules_at: HashMap<u64, CfaRule>,
    pub tls_base: Option<u64>,
}

impl MockTarget {
    /// Add a frame, returning its id.
    pub(crate) fn add_frame(&mut self, frame: MockFrame) -> FrameId {
        self.frames.push(frame);
        FrameId(self.frames.len() - 1)
    }

    fn frame(&self, frame: FrameId) -> Result<&MockFrame, ExpressionError> {
        self.frames
            .get(frame.0)
            .ok_or_else(|| ExpressionError::Other(format!("no frame {}", frame.0)))
    }

    fn frame_mut(&mut self, frame: FrameId) -> Result<&mut MockFrame, ExpressionError> {
        self.frames
            .get_mut(frame.0)
            .ok_or_else(|| ExpressionError::Other(format!("no frame {}", frame.0)))
    }

    pub(crate) fn register(&self, frame: FrameId, register: u16) -> Vec<u8> {
        self.frames[frame.0].registers[&register].clone()
    }
}

impl MemoryAccess for MockTarget {
    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), ExpressionError> {
        self.memory.read(address, data)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), ExpressionError> {
        self.memory.write(address, data)
    }
}

impl FrameAccess for MockTarget {
    fn read_register(&mut self, frame: FrameId, register: u16) -> Result<Vec<u8>, ExpressionError> {
        let frame = self.frame(frame)?;
        if frame.optimized_out.contains(&register) {
            return Err(ExpressionError::OptimizedOut(format!(
                "register {register} was not saved"
            )));
        }
        frame
            .registers
            .get(&register)
            .cloned()
            .ok_or_else(|| ExpressionError::NotAvailable(format!("register {register} is not available")))
    }

    fn write_register(
        &mut self,
        frame: FrameId,
        register: u16,
        data: &[u8],
    ) -> Result<(), ExpressionError> {
        let frame = self.frame_mut(frame)?;
        let stored = frame
            .registers
            .get_mut(&register)
            .ok_or_else(|| ExpressionError::NotAvailable(format!("register {register} is not available")))?;
        assert_eq!(stored.len(), data.len(), "register writes are whole registers");
        stored.copy_from_slice(data);
        Ok(())
    }

    fn register_size(&mut self, frame: FrameId, register: u16) -> Option<usize> {
        self.frame(frame).ok()?.registers.get(&register).map(Vec::len)
    }

    fn frame_base_expression(&mut self, frame: FrameId) -> Result<Vec<u8>, ExpressionError> {
        self.frame(frame)?
            .frame_base
            .clone()
            .ok_or_else(|| ExpressionError::Other("no frame base".to_string()))
    }

    fn call_frame_cfa(&mut self, frame: FrameId) -> Result<u64, ExpressionError> {
        Ok(self.frame(frame)?.cfa)
    }

    fn frame_pc(&mut self, frame: FrameId) -> Result<u64, ExpressionError> {
        Ok(self.frame(frame)?.pc)
    }

    fn caller_frame(&mut self, frame: FrameId) -> Result<Option<FrameId>, ExpressionError> {
        Ok(self.frame(frame)?.caller)
    }

    fn frame_kind(&self, frame: FrameId) -> FrameKind {
        self.frames[frame.0].kind
    }

    fn frame_function(&mut self, frame: FrameId) -> Result<Option<u64>, ExpressionError> {
        Ok(self.frame(frame)?.function)
    }

    fn frame_arch(&self, frame: FrameId) -> ArchId {
        self.frames[frame.0].arch
    }

    fn unwound_arch(&self, frame: FrameId) -> ArchId {
        let frame = &self.frames[frame.0];
        frame.unwound_arch.unwrap_or(frame.arch)
    }

    fn tls_address(&mut self, _frame: Option<FrameId>, offset: u64) -> Result<u64, ExpressionError> {
        self.tls_base
            .map(|base| base + offset)
            .ok_or_else(|| ExpressionError::UnsupportedInContext("no TLS".to_string()))
    }
}

impl DebugInfoAccess for MockTarget {
    fn base_type(&mut self, offset: UnitOffset) -> Result<BaseType, ExpressionError> {
        self.base_types
            .get(&offset.0)
            .copied()
            .ok_or_else(|| ExpressionError::Other(format!("no base type at {:#x}", offset.0)))
    }

    fn subroutine_location(&mut self, die: DieReference) -> Result<Vec<u8>, ExpressionError> {
        self.subroutines
            .get(&die)
            .cloned()
            .ok_or_else(|| ExpressionError::Other(format!("no DIE {die:?}")))
    }

    fn address_index(&mut self, index: u64) -> Result<u64, ExpressionError> {
        self.addresses
            .get(index as usize)
            .copied()
            .ok_or_else(|| ExpressionError::Other(format!("no address index {index}")))
    }

    fn synthetic_pointer_target(
        &mut self,
        die: DebugInfoOffset,
    ) -> Result<Option<SyntheticPointerTarget>, ExpressionError> {
        Ok(self.synthetic_pointers.get(&die).cloned())
    }

    fn call_site_at(&mut self, pc: u64) -> Result<Option<CallSite>, ExpressionError> {
        Ok(self.call_sites.get(&pc).cloned())
    }

    fn tail_call_sites(&mut self, function: u64) -> Result<Vec<CallSite>, ExpressionError> {
        Ok(self.tail_calls.get(&function).cloned().unwrap_or_default())
    }

    fn function_start(&mut self, pc: u64) -> Result<Option<u64>, ExpressionError> {
        Ok(self
            .function_ranges
            .iter()
            .find(|range| range.contains(&pc))
            .map(|range| range.start))
    }

    fn lookup_function(&mut self, name: &str) -> Result<Option<u64>, ExpressionError> {
        Ok(self.functions.get(name).copied())
    }

    fn frame_base_expression_at(&mut self, pc: u64) -> Result<Vec<u8>, ExpressionError> {
        self.frame_bases_at
            .get(&pc)
            .cloned()
            .ok_or_else(|| ExpressionError::Other(format!("no frame base at {pc:#x}")))
    }

    fn cfa_rule_at(&mut self, pc: u64) -> Result<CfaRule, ExpressionError> {
        self.cfa_rules_at
            .get(&pc)
            .cloned()
            .ok_or_else(|| ExpressionError::Other(format!("no CFA rule at {pc:#x}")))
    }
}

/// Assembler for DWARF expressions in tests.
#[derive(Debug, Default)]
pub(crate) struct Asm {
    bytes: Vec<u8>,
    labels: HashMap<&'static str, usize>,
    fixups: Vec<(usize, &'static str)>,
}

impl Asm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn op(mut self, op: DwOp) -> Self {
        self.bytes.push(op.0);
        self
    }

    pub(crate) fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub(crate) fn u16(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u32(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u64(mut self, value: u64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn uleb(mut self, value: u64) -> Self {
        leb128::write::unsigned(&mut self.bytes, value).unwrap();
        self
    }

    pub(crate) fn sleb(mut self, value: i64) -> Self {
        leb128::write::signed(&mut self.bytes, value).unwrap();
        self
    }

    pub(crate) fn bytes(mut self, data: &[u8]) -> Self {
        self.bytes.extend_from_slice(data);
        self
    }

    pub(crate) fn label(mut self, name: &'static str) -> Self {
        self.labels.insert(name, self.bytes.len());
        self
    }

    /// Emit a branch operation to `label`.
    pub(crate) fn branch(mut self, op: DwOp, label: &'static str) -> Self {
        self.bytes.push(op.0);
        self.fixups.push((self.bytes.len(), label));
        self.bytes.extend_from_slice(&[0, 0]);
        self
    }

    pub(crate) fn build(mut self) -> Vec<u8> {
        for (position, label) in &self.fixups {
            let target = self.labels[label] as i64;
            let displacement = (target - (*position as i64 + 2)) as i16;
            self.bytes[*position..*position + 2].copy_from_slice(&displacement.to_le_bytes());
        }
        self.bytes
    }
}
