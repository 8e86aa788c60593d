use std::collections::HashSet;

use gimli::Register;

use crate::{
    bytecode::{block_to_dwarf_reg, block_to_fb_offset},
    call_site::{CallSite, CallSiteChain, CallSiteParameter, CallSiteTarget, ParameterKind},
    config::EvaluationConfig,
    context::ExpressionContext,
    location::{evaluate_location_description, TypeKind, Value, ValueType},
    piece::LocationKind,
    services::{ExpressionServices, FrameId, FrameKind},
    ExpressionError,
};

/// A call site parameter matched to the callee frame that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryParameter {
    /// The frame that made the call.
    pub caller: FrameId,
    /// The call site in the caller.
    pub call_site: CallSite,
    /// The matching parameter of the call site.
    pub parameter: CallSiteParameter,
}

impl EntryParameter {
    /// Settings for evaluating the caller side expressions, which belong to the unit of the call site.
    pub fn caller_config(&self, config: EvaluationConfig) -> EvaluationConfig {
        EvaluationConfig {
            address_size: self.call_site.address_size,
            base_offset: self.call_site.text_offset,
            ..config
        }
    }
}

fn call_site_for_pc(
    services: &mut dyn ExpressionServices,
    pc: u64,
) -> Result<CallSite, ExpressionError> {
    services.call_site_at(pc)?.ok_or_else(|| {
        ExpressionError::no_entry_value(format!(
            "DW_OP_entry_value resolving cannot find DW_TAG_call_site {pc:#x}"
        ))
    })
}

/// The address a call site calls.
///
/// Expression targets need the caller frame, which is not known for frames reconstructed
/// from tail calls.
pub fn call_site_target_address(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    call_site: &CallSite,
    caller: Option<FrameId>,
) -> Result<u64, ExpressionError> {
    match &call_site.target {
        CallSiteTarget::Address(address) => Ok(address.wrapping_add(call_site.text_offset)),
        CallSiteTarget::Symbol(name) => services.lookup_function(name)?.ok_or_else(|| {
            ExpressionError::no_entry_value(format!(
                "Cannot find function \"{name}\" for a call site target"
            ))
        }),
        CallSiteTarget::Expression(expression) => {
            let Some(caller) = caller else {
                return Err(ExpressionError::no_entry_value(
                    "DW_AT_call_target DWARF block resolving requires known frame which is currently not an unwound one",
                ));
            };
            let config = EvaluationConfig {
                address_size: call_site.address_size,
                base_offset: call_site.text_offset,
                ..config
            };
            let ty = ValueType::scalar(u64::from(call_site.address_size));
            let mut target =
                evaluate_location_description(services, config, Some(caller), expression, &ty, None)?;
            // A memory location means its address, anything else is the address itself.
            match target.address() {
                Some(address) => Ok(address),
                None => target.as_address(services),
            }
        }
        CallSiteTarget::Unknown => Err(ExpressionError::no_entry_value(
            "DW_AT_call_target is not specified at DW_TAG_call_site",
        )),
    }
}

/// Fail if `function` can reach itself through tail calls only.
///
/// Parameters of such a function may have been changed by the time a frame for it is seen,
/// so its entry values cannot be trusted.
pub fn verify_no_self_tail_call(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    function: u64,
) -> Result<(), ExpressionError> {
    let mut todo = vec![function];
    let mut visited = HashSet::new();

    while let Some(address) = todo.pop() {
        for call_site in services.tail_call_sites(address)? {
            let target = call_site_target_address(services, config, &call_site, None)?;
            if target == function {
                return Err(ExpressionError::no_entry_value(format!(
                    "DW_OP_entry_value resolving has found function at {function:#x} can call itself via tail calls"
                )));
            }
            if visited.insert(target) {
                todo.push(target);
            }
        }
    }
    Ok(())
}

/// Find the call site parameter of `kind` recorded by the caller of `frame`.
pub fn entry_parameter(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    frame: FrameId,
    kind: ParameterKind,
) -> Result<EntryParameter, ExpressionError> {
    let mut frame = frame;
    while services.frame_kind(frame) == FrameKind::Inline {
        frame = services.caller_frame(frame)?.ok_or_else(|| {
            ExpressionError::no_entry_value("DW_OP_entry_value resolving cannot find the frame of an inlined function")
        })?;
    }

    let function = services.frame_function(frame)?.ok_or_else(|| {
        ExpressionError::no_entry_value(format!(
            "DW_OP_entry_value resolving cannot find the function of frame {}",
            frame.0
        ))
    })?;

    let (callee_arch, caller_arch) = (services.frame_arch(frame), services.unwound_arch(frame));
    if callee_arch != caller_arch {
        return Err(ExpressionError::no_entry_value(format!(
            "DW_OP_entry_value resolving callee architecture {} of function at {function:#x} does not match caller architecture {}",
            callee_arch.0, caller_arch.0
        )));
    }

    let caller = services.caller_frame(frame)?.ok_or_else(|| {
        ExpressionError::no_entry_value(format!(
            "DW_OP_entry_value resolving requires caller of function at {function:#x}"
        ))
    })?;
    let caller_pc = services.frame_pc(caller)?;
    let call_site = call_site_for_pc(services, caller_pc)?;

    let target = call_site_target_address(services, config, &call_site, Some(caller))?;
    if target != function {
        return Err(ExpressionError::no_entry_value(format!(
            "DW_OP_entry_value resolving expects callee at {target:#x} but the called frame is for the function at {function:#x}"
        )));
    }

    verify_no_self_tail_call(services, config, function)?;

    let parameter = call_site.parameter(kind).cloned().ok_or_else(|| {
        ExpressionError::no_entry_value(format!(
            "Cannot find matching parameter at DW_TAG_call_site {caller_pc:#x}"
        ))
    })?;
    tracing::debug!("entry value for {kind:?} found at call site {caller_pc:#x}");

    Ok(EntryParameter {
        caller,
        call_site,
        parameter,
    })
}

fn parameter_to_value(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    caller: FrameId,
    expression: &[u8],
    ty: &ValueType,
) -> Result<Value, ExpressionError> {
    let mut bytecode = expression.to_vec();
    bytecode.push(gimli::DW_OP_stack_value.0);
    evaluate_location_description(services, config, Some(caller), &bytecode, ty, None)
}

/// The target of a reference parameter at function entry.
///
/// The target is computed from `DW_AT_call_data_value` in the caller when first dereferenced.
#[derive(Debug, Clone)]
pub struct EntryDataValue {
    caller: FrameId,
    config: EvaluationConfig,
    expression: Vec<u8>,
    ty: ValueType,
    resolved: Option<Box<Value>>,
}

impl EntryDataValue {
    /// The type of the referenced value.
    pub fn target_type(&self) -> &ValueType {
        &self.ty
    }

    /// Whether the referenced value has been computed.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub(crate) fn resolve(
        &mut self,
        services: &mut dyn ExpressionServices,
    ) -> Result<&Value, ExpressionError> {
        let value = match self.resolved.take() {
            Some(value) => value,
            None => Box::new(parameter_to_value(
                services,
                self.config,
                self.caller,
                &self.expression,
                &self.ty,
            )?),
        };
        Ok(&**self.resolved.insert(value))
    }
}

/// The value of a parameter of `frame` at the time its function was entered.
///
/// For references, dereferencing the returned value gives the referenced object at entry.
pub fn value_of_entry_parameter(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    frame: FrameId,
    kind: ParameterKind,
    ty: &ValueType,
) -> Result<Value, ExpressionError> {
    let entry = entry_parameter(services, config, frame, kind)?;
    let caller_config = entry.caller_config(config);
    let mut outer = parameter_to_value(services, caller_config, entry.caller, &entry.parameter.value, ty)?;

    let TypeKind::Reference(target) = &ty.kind else {
        return Ok(outer);
    };
    let Some(expression) = entry.parameter.data_value.clone() else {
        return Err(ExpressionError::no_entry_value(
            "Cannot resolve DW_AT_call_data_value",
        ));
    };

    let reference = outer.bytes(services)?.to_vec();
    let entry_data = EntryDataValue {
        caller: entry.caller,
        config: caller_config,
        expression,
        ty: (**target).clone(),
        resolved: None,
    };
    Ok(Value::entry_data(ty.clone(), reference, entry_data, config.byte_order))
}

/// The value at function entry of a parameter whose location is `block`.
///
/// Only parameters in a single register or at a frame base offset can be resolved.
pub fn value_at_entry(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    frame: FrameId,
    block: &[u8],
    ty: &ValueType,
) -> Result<Value, ExpressionError> {
    if let Some(register) = block_to_dwarf_reg(block) {
        return value_of_entry_parameter(
            services,
            config,
            frame,
            ParameterKind::DwarfReg(Register(register)),
            ty,
        );
    }
    if let Some(offset) = block_to_fb_offset(block) {
        return value_of_entry_parameter(services, config, frame, ParameterKind::FrameBaseOffset(offset), ty);
    }
    Err(ExpressionError::no_entry_value(
        "DWARF-2 expression error: DW_OP_entry_value is supported only for single DW_OP_reg* or for DW_OP_fbreg(*)",
    ))
}

impl ExpressionContext<'_> {
    /// Push the value a parameter had on entry to the function of the current frame.
    ///
    /// With `deref_size`, the value the parameter pointed to is pushed instead.
    pub(crate) fn push_entry_value(
        &mut self,
        kind: ParameterKind,
        deref_size: Option<u8>,
    ) -> Result<(), ExpressionError> {
        let frame = self.require_frame("DW_OP_entry_value")?;
        let entry = entry_parameter(&mut *self.services, self.config, frame, kind)?;
        let expression = match deref_size {
            None => entry.parameter.value.clone(),
            Some(_) => entry.parameter.data_value.clone().ok_or_else(|| {
                ExpressionError::no_entry_value("Cannot resolve DW_AT_call_data_value")
            })?,
        };

        let saved = (self.frame, self.config, self.object_address.take(), self.location);
        self.frame = Some(entry.caller);
        self.config = entry.caller_config(self.config);
        self.location = LocationKind::Memory;

        let result = self.evaluate(&expression).and_then(|()| {
            if self.location == LocationKind::Register {
                let register = self.fetch_register_number(0)?;
                self.stack.pop("DW_OP_entry_value")?;
                let value = self.read_register_address(register)?;
                self.push_address(value, false);
            }
            Ok(())
        });

        (self.frame, self.config, self.object_address, self.location) = saved;
        result
    }
}

struct ChainSearch<'a> {
    services: &'a mut dyn ExpressionServices,
    config: EvaluationConfig,
    callee: u64,
    chain: Vec<CallSite>,
    visited: HashSet<u64>,
    result: Option<CallSiteChain>,
}

impl ChainSearch<'_> {
    /// Walk the tail calls reachable from `call_site`. Returns `false` once the result is ambiguous.
    fn visit(&mut self, call_site: &CallSite) -> Result<bool, ExpressionError> {
        let target = call_site_target_address(&mut *self.services, self.config, call_site, None)?;
        if target == self.callee {
            // The callee is not entered twice, so its own tail calls are not followed.
            return Ok(self.add_candidate());
        }

        for next in self.services.tail_call_sites(target)? {
            if !self.visited.insert(next.pc) {
                continue;
            }
            self.chain.push(next.clone());
            let keep_going = self.visit(&next)?;
            self.chain.pop();
            self.visited.remove(&next.pc);
            if !keep_going {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Intersect the current path with the paths found so far.
    fn add_candidate(&mut self) -> bool {
        let Some(result) = self.result.as_mut() else {
            tracing::trace!("first call chain of {} tail calls", self.chain.len());
            self.result = Some(CallSiteChain {
                call_sites: self.chain.clone(),
                callers: self.chain.len(),
                callees: self.chain.len(),
            });
            return true;
        };

        result.callers = result
            .call_sites
            .iter()
            .zip(&self.chain)
            .take(result.callers)
            .take_while(|(known, found)| known.pc == found.pc)
            .count();
        result.callees = result
            .call_sites
            .iter()
            .rev()
            .zip(self.chain.iter().rev())
            .take(result.callees)
            .take_while(|(known, found)| known.pc == found.pc)
            .count();

        // A direct call may have no common call sites; a second path without any is ambiguous.
        let ambiguous = result.callers == 0 && result.callees == 0;
        if ambiguous {
            self.result = None;
        }
        !ambiguous
    }
}

/// Determine the tail call sites that certainly lie between a call at `caller_pc` and the
/// function containing `callee_pc`.
pub fn call_site_find_chain(
    services: &mut dyn ExpressionServices,
    config: EvaluationConfig,
    caller_pc: u64,
    callee_pc: u64,
) -> Result<CallSiteChain, ExpressionError> {
    let callee = services.function_start(callee_pc)?.ok_or_else(|| {
        ExpressionError::no_entry_value(format!("Unable to find function for PC {callee_pc:#x}"))
    })?;
    let call_site = call_site_for_pc(services, caller_pc)?;

    let mut search = ChainSearch {
        services,
        config,
        callee,
        chain: Vec::new(),
        visited: HashSet::new(),
        result: None,
    };
    search.visit(&call_site)?;

    search.result.ok_or_else(|| {
        ExpressionError::no_entry_value(format!(
            "There are no unambiguously determinable intermediate callers or callees between caller at {caller_pc:#x} and callee function at {callee:#x}"
        ))
    })
}
