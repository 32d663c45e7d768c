//! Instruction stream decoding: bytes to the editable instruction list.
//!
//! This module turns a raw method body into a `Vec<Instruction>` ready for
//! rewriting. It implements the strict-forward decode loop, offset-to-index
//! resolution by binary search, exception clause attachment as block markers,
//! the empty-body call-through trampoline, and the branch-to-label lifting
//! that makes the list safely editable.
//!
//! # Architecture
//!
//! Decoding is a two-phase process:
//!
//! 1. **Forward scan** - each instruction's offset is recorded before its
//!    operand is decoded; branch displacements are converted to absolute byte
//!    offsets and parked until the stream is complete.
//! 2. **Resolution** - parked branch offsets and exception clause boundaries
//!    are resolved to instruction indices by binary search over the
//!    offset-sorted stream. An offset landing strictly inside an instruction
//!    is a malformed body; the end-of-handler boundary intentionally matches
//!    the *last byte* of an instruction instead of its first.
//!
//! [`lift_branches`] then replaces index operands with labels attached to the
//! target instructions, so later list edits cannot invalidate control flow.
//!
//! # Key Components
//!
//! - [`decode_body`] - full pipeline from [`crate::metadata::FunctionBody`] to
//!   the labeled stream
//! - [`find_instruction`] - offset-to-index binary search
//! - [`find_matching_begin`] / [`find_matching_end`] - nesting-aware marker
//!   pairing used by the rewrite layers

use crate::assembly::instruction::{
    Argument, ExceptionBlock, ExceptionBlockType, Immediate, Instruction, Label, LabelGen, Operand,
    OperandType,
};
use crate::assembly::opcodes::{self, FE_PREFIX};
use crate::file::Parser;
use crate::metadata::{
    ExceptionClauseFlags, FunctionBody, FunctionId, FunctionSig, SymbolResolver, Token,
};
use crate::Result;

/// Decode a function body into the editable, label-lifted instruction stream.
///
/// An empty code buffer decodes to a call-through trampoline: every declared
/// argument (including `this`) is loaded and forwarded to the resolver's
/// extern-call stub, whose result is returned.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for undefined opcodes, truncated
/// operands, or branch/clause offsets that do not land on an instruction
/// boundary, and propagates resolver failures for string tokens and the
/// extern-call stub.
pub fn decode_body(
    id: &FunctionId,
    sig: &FunctionSig,
    body: &FunctionBody,
    resolver: &dyn SymbolResolver,
    labels: &mut LabelGen,
) -> Result<Vec<Instruction>> {
    if body.code.is_empty() {
        return trampoline(id, sig, resolver);
    }

    let mut instructions = decode_stream(&body.code, resolver)?;
    resolve_exception_clauses(&mut instructions, body)?;
    lift_branches(&mut instructions, labels);

    Ok(instructions)
}

/// Decode a raw byte stream into instructions with branch operands resolved
/// to stream indices. No labels, no exception markers.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for undefined opcodes, truncated
/// operands or branch targets inside an instruction.
pub fn decode_stream(code: &[u8], resolver: &dyn SymbolResolver) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();
    // Branches cannot resolve until every offset is known; park them as
    // (stream index, absolute target offsets).
    let mut pending: Vec<(usize, Vec<u32>)> = Vec::new();

    while parser.has_more_data() {
        let offset = u32::try_from(parser.pos())
            .map_err(|_| malformed_error!("Method body larger than 4 GiB"))?;

        let first = parser.read_le::<u8>()?;
        let (prefix, opcode) = if first == FE_PREFIX {
            (FE_PREFIX, parser.read_le::<u8>()?)
        } else {
            (0, first)
        };

        let Some(spec) = opcodes::lookup(prefix, opcode) else {
            return Err(malformed_error!(
                "Undefined opcode {:#04x} (prefix {:#04x}) at offset {:#x}",
                opcode,
                prefix,
                offset
            ));
        };

        let operand = match spec.operand {
            OperandType::None => Operand::None,
            OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
            OperandType::UInt8 => Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)),
            OperandType::Int16 => Operand::Immediate(Immediate::Int16(parser.read_le::<i16>()?)),
            OperandType::UInt16 => Operand::Immediate(Immediate::UInt16(parser.read_le::<u16>()?)),
            OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
            OperandType::UInt32 => Operand::Immediate(Immediate::UInt32(parser.read_le::<u32>()?)),
            OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
            OperandType::UInt64 => Operand::Immediate(Immediate::UInt64(parser.read_le::<u64>()?)),
            OperandType::Float32 => {
                Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?))
            }
            OperandType::Float64 => {
                Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?))
            }
            OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
            OperandType::Switch => {
                let count = parser.read_le::<u32>()?;
                let mut displacements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    displacements.push(parser.read_le::<i32>()?);
                }
                let next = u32::try_from(parser.pos()).map_err(|_| crate::Error::OutOfBounds)?;
                let targets = displacements
                    .iter()
                    .map(|disp| absolute_target(next, *disp, offset))
                    .collect::<Result<Vec<u32>>>()?;
                pending.push((instructions.len(), targets));
                // Placeholder of the right arity; replaced during resolution.
                Operand::Switch(vec![0; count as usize])
            }
        };

        let mut instruction = Instruction::new(prefix, opcode, operand)?;
        instruction.offset = offset;

        if spec.flow.is_branch() {
            let next = u32::try_from(parser.pos()).map_err(|_| crate::Error::OutOfBounds)?;
            if let Operand::Immediate(imm) = &instruction.operand {
                if let Some(disp) = imm.as_displacement() {
                    pending.push((instructions.len(), vec![absolute_target(next, disp, offset)?]));
                }
            }
        }

        if let Operand::Token(token) = &instruction.operand {
            instruction.argument = resolve_token(*token, resolver)?;
        }

        instructions.push(instruction);
    }

    for (index, targets) in pending {
        let resolved = targets
            .iter()
            .map(|target| find_instruction(&instructions, *target, false))
            .collect::<Result<Vec<usize>>>()?;

        instructions[index].operand = match &instructions[index].operand {
            Operand::Switch(_) => Operand::Switch(resolved),
            _ => Operand::Target(resolved[0]),
        };
    }

    Ok(instructions)
}

fn absolute_target(next: u32, displacement: i32, at: u32) -> Result<u32> {
    let target = i64::from(next) + i64::from(displacement);
    u32::try_from(target)
        .map_err(|_| malformed_error!("Branch at offset {:#x} leaves the method body", at))
}

fn resolve_token(token: Token, resolver: &dyn SymbolResolver) -> Result<Argument> {
    if token.is_user_string() {
        let text = resolver.user_string(token)?;
        return Ok(Argument::String(text.into()));
    }
    Ok(resolver
        .member(token)
        .map_or(Argument::None, Argument::Member))
}

/// Locate the instruction at `offset` by binary search over the sorted stream.
///
/// With `at_end` set, the offset must be the *last byte* of the instruction
/// instead of its first; exception handler ranges end on last bytes.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] when the offset is past the stream or
/// lands strictly inside an instruction.
pub fn find_instruction(instructions: &[Instruction], offset: u32, at_end: bool) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = instructions.len();

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let instr = &instructions[mid];
        let start = instr.offset;
        let end = start + instr.size();

        if offset < start {
            hi = mid;
        } else if offset >= end {
            lo = mid + 1;
        } else {
            let expected = if at_end { end - 1 } else { start };
            if offset == expected {
                return Ok(mid);
            }
            return Err(malformed_error!(
                "Offset {:#x} falls inside the instruction at {:#x}",
                offset,
                start
            ));
        }
    }

    Err(malformed_error!(
        "Offset {:#x} is outside the method body",
        offset
    ))
}

fn resolve_exception_clauses(instructions: &mut [Instruction], body: &FunctionBody) -> Result<()> {
    for clause in &body.exceptions {
        if clause.try_length == 0 || clause.handler_length == 0 {
            return Err(malformed_error!(
                "Exception clause at {:#x} has a zero-length region",
                clause.try_offset
            ));
        }

        let try_index = find_instruction(instructions, clause.try_offset, false)?;
        instructions[try_index]
            .attach_block(ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock));

        let handler_begin = if clause.flags.contains(ExceptionClauseFlags::FILTER) {
            let filter_index = find_instruction(instructions, clause.filter_offset, false)?;
            instructions[filter_index]
                .attach_block(ExceptionBlock::new(ExceptionBlockType::BeginFilterBlock));
            ExceptionBlock::catch(None)
        } else if clause.flags.contains(ExceptionClauseFlags::FINALLY) {
            ExceptionBlock::new(ExceptionBlockType::BeginFinallyBlock)
        } else if clause.flags.contains(ExceptionClauseFlags::FAULT) {
            ExceptionBlock::new(ExceptionBlockType::BeginFaultBlock)
        } else {
            ExceptionBlock::catch(clause.catch_type)
        };

        let handler_index = find_instruction(instructions, clause.handler_offset, false)?;
        instructions[handler_index].attach_block(handler_begin);

        let end_index = find_instruction(instructions, clause.handler_end() - 1, true)?;
        instructions[end_index]
            .attach_block(ExceptionBlock::new(ExceptionBlockType::EndExceptionBlock));
    }

    Ok(())
}

/// Replace resolved index operands with labels attached to their targets.
///
/// Each distinct target gets one label shared by all branches pointing at it.
pub fn lift_branches(instructions: &mut [Instruction], labels: &mut LabelGen) {
    let mut assigned: std::collections::HashMap<usize, Label> = std::collections::HashMap::new();

    let branch_targets: Vec<(usize, Vec<usize>)> = instructions
        .iter()
        .enumerate()
        .filter_map(|(index, instr)| match &instr.operand {
            Operand::Target(target) => Some((index, vec![*target])),
            Operand::Switch(targets) => Some((index, targets.clone())),
            _ => None,
        })
        .collect();

    for (index, targets) in branch_targets {
        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            let label = *assigned.entry(target).or_insert_with(|| labels.fresh());
            instructions[target].attach_label(label);
            resolved.push(label);
        }

        instructions[index].operand = match &instructions[index].operand {
            Operand::Switch(_) => Operand::SwitchLabels(resolved),
            _ => Operand::Label(resolved[0]),
        };
    }
}

fn trampoline(
    id: &FunctionId,
    sig: &FunctionSig,
    resolver: &dyn SymbolResolver,
) -> Result<Vec<Instruction>> {
    let stub = resolver.extern_stub(id)?;

    let mut instructions = Vec::with_capacity(sig.arg_count() as usize + 2);
    for slot in 0..sig.arg_count() {
        instructions.push(Instruction::load_arg(slot));
    }
    instructions.push(Instruction::with_token(opcodes::CALL, stub));
    instructions.push(Instruction::op(opcodes::RET));

    Ok(instructions)
}

/// Scan backward from the end marker at `end_index` to its matching begin
/// marker, honoring nesting.
///
/// The depth counter increments on every end marker and decrements on every
/// begin marker passed on the way; the begin that brings it to zero is the
/// match.
#[must_use]
pub fn find_matching_begin(instructions: &[Instruction], end_index: usize) -> Option<usize> {
    let mut depth = 0i32;

    for index in (0..=end_index).rev() {
        for block in instructions[index].blocks.iter().rev() {
            if block.block_type == ExceptionBlockType::EndExceptionBlock {
                depth += 1;
            } else if block.block_type == ExceptionBlockType::BeginExceptionBlock {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
        }
    }

    None
}

/// Scan forward from the begin marker at `begin_index` to its matching end
/// marker, honoring nesting. The forward dual of [`find_matching_begin`].
#[must_use]
pub fn find_matching_end(instructions: &[Instruction], begin_index: usize) -> Option<usize> {
    let mut depth = 0i32;

    for (index, instr) in instructions.iter().enumerate().skip(begin_index) {
        for block in &instr.blocks {
            if block.block_type == ExceptionBlockType::BeginExceptionBlock {
                depth += 1;
            } else if block.block_type == ExceptionBlockType::EndExceptionBlock {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
        }
    }

    None
}
