use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::{DebugInfo, EndianRcSlice};
use crate::debugger::error::Error;
use crate::debugger::register::DwarfRegisterMap;
use crate::debugger::TargetMemory;
use gimli::{AttributeValue, EvaluationResult, Expression, Location, Unit, Value};

/// Everything a location expression may ask for at evaluation time.
pub struct EvaluationContext<'a> {
    pub debug_info: &'a DebugInfo,
    pub memory: &'a dyn TargetMemory,
    pub registers: DwarfRegisterMap,
    pub pc: GlobalAddress,
    pub mapping_offset: usize,
}

/// Result of a location expression: either a place in debugee memory or an
/// immediate value.
#[derive(Debug, Clone, Copy)]
pub enum EvalResult {
    Address(RelocatedAddress),
    Value(u64),
}

impl EvalResult {
    pub fn into_address(self) -> Result<RelocatedAddress, Error> {
        match self {
            EvalResult::Address(addr) => Ok(addr),
            EvalResult::Value(_) => Err(Error::EvalUnsupportedRequire("memory location")),
        }
    }
}

/// Evaluate a location expression against a live, suspended debugee.
pub fn evaluate(
    ctx: &EvaluationContext,
    unit: &Unit<EndianRcSlice>,
    expr: Expression<EndianRcSlice>,
) -> Result<EvalResult, Error> {
    let mut eval = expr.evaluation(unit.encoding());
    let mut result = eval.evaluate()?;

    loop {
        match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let bytes = ctx
                    .memory
                    .read_memory(RelocatedAddress::from(address as usize), size as usize)?;
                let mut buf = [0u8; 8];
                let len = bytes.len().min(8);
                buf[..len].copy_from_slice(&bytes[..len]);
                result = eval.resume_with_memory(Value::Generic(u64::from_le_bytes(buf)))?;
            }
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = ctx.registers.value(register)?;
                result = eval.resume_with_register(Value::Generic(value))?;
            }
            EvaluationResult::RequiresCallFrameCfa => {
                let cfa = ctx.debug_info.frame_table.cfa(ctx.pc, &ctx.registers)?;
                result = eval.resume_with_call_frame_cfa(cfa.as_u64())?;
            }
            EvaluationResult::RequiresFrameBase => {
                let frame_base = function_frame_base(ctx, unit)?;
                result = eval.resume_with_frame_base(frame_base)?;
            }
            EvaluationResult::RequiresRelocatedAddress(addr) => {
                result = eval.resume_with_relocated_address(addr + ctx.mapping_offset as u64)?;
            }
            EvaluationResult::RequiresEntryValue(_) => {
                return Err(Error::EvalUnsupportedRequire("entry value"))
            }
            EvaluationResult::RequiresTls(_) => {
                return Err(Error::EvalUnsupportedRequire("thread local storage"))
            }
            _ => return Err(Error::EvalUnsupportedRequire("unsupported requirement")),
        }
    }

    let pieces = eval.result();
    let piece = pieces
        .first()
        .ok_or(Error::EvalUnsupportedRequire("empty evaluation result"))?;

    match piece.location {
        Location::Address { address } => Ok(EvalResult::Address(RelocatedAddress::from(
            address as usize,
        ))),
        Location::Value { value } => Ok(EvalResult::Value(value.to_u64(u64::MAX)?)),
        Location::Register { register } => Ok(EvalResult::Value(ctx.registers.value(register)?)),
        _ => Err(Error::EvalUnsupportedRequire("composite location")),
    }
}

/// Evaluate the frame base expression of the function covering `ctx.pc`.
fn function_frame_base(
    ctx: &EvaluationContext,
    unit: &Unit<EndianRcSlice>,
) -> Result<u64, Error> {
    let (parsed_unit, function) = ctx
        .debug_info
        .find_function_by_pc(ctx.pc)
        .ok_or(Error::FunctionByAddressNotFound(ctx.pc))?;

    let entry = parsed_unit.entry(function.offset)?;
    let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_frame_base)? else {
        return Err(Error::EvalOptionRequired("frame base expression"));
    };

    match evaluate(ctx, unit, expr)? {
        EvalResult::Address(addr) => Ok(addr.as_u64()),
        EvalResult::Value(value) => Ok(value),
    }
}

/// Evaluate an expression that must not depend on a process state. Used for
/// static (global) variable locations, which are a single address operation.
pub fn evaluate_static_address(
    expr: Expression<EndianRcSlice>,
    unit: &Unit<EndianRcSlice>,
) -> Result<GlobalAddress, Error> {
    let mut eval = expr.evaluation(unit.encoding());
    let mut result = eval.evaluate()?;

    loop {
        match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRelocatedAddress(addr) => {
                result = eval.resume_with_relocated_address(addr)?;
            }
            _ => return Err(Error::EvalUnsupportedRequire("static location")),
        }
    }

    let pieces = eval.result();
    match pieces.first().map(|p| &p.location) {
        Some(Location::Address { address }) => Ok(GlobalAddress::from(*address as usize)),
        _ => Err(Error::EvalUnsupportedRequire("static address location")),
    }
}
