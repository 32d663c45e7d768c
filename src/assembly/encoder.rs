//! Instruction stream encoding: the editable list back to bytes.
//!
//! The encoder lowers a label-lifted stream into an encoded body: offsets are
//! assigned as a prefix sum, label operands become relative displacements,
//! short branches that can no longer reach their target are widened to their
//! long forms, and the exception clause table is rebuilt from the block
//! markers the stream carries.
//!
//! # Architecture
//!
//! Encoding runs in three passes:
//!
//! 1. **Sizing** - offsets are recomputed and every short-form branch whose
//!    displacement no longer fits in an `i8` is widened; widening changes
//!    sizes, so the pass repeats until no opcode changes. The loop terminates
//!    because widening is one-way.
//! 2. **Emission** - opcode bytes and operands are written out; switch
//!    displacements are relative to the end of the whole instruction.
//! 3. **Clause rebuild** - begin/catch/finally/fault/filter/end markers are
//!    paired on a stack and flattened back into byte-offset clauses.

use crate::assembly::instruction::{
    ExceptionBlockType, Immediate, Instruction, Label, Operand, OperandType,
};
use crate::assembly::opcodes::FE_PREFIX;
use crate::file::io::write_le;
use crate::metadata::{ExceptionClause, ExceptionClauseFlags, FunctionBody, Token, TypeSig};
use crate::Result;

/// Encode a label-lifted stream into a function body.
///
/// Offsets are written back into `instructions`, so afterwards the stream and
/// the produced bytes agree. `locals` and `max_stack` are carried through
/// into the body unchanged.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] when a branch references a label no
/// instruction carries, when the stream still contains unlifted index
/// operands, or when the markers are not properly nested.
pub fn encode_body(
    instructions: &mut [Instruction],
    locals: Vec<TypeSig>,
    max_stack: u16,
) -> Result<FunctionBody> {
    assign_offsets(instructions)?;

    let mut code = Vec::new();
    for index in 0..instructions.len() {
        emit_instruction(instructions, index, &mut code)?;
    }

    let exceptions = rebuild_clauses(instructions)?;

    Ok(FunctionBody {
        code,
        locals,
        exceptions,
        max_stack,
    })
}

/// Recompute every instruction's offset, widening short branches that cannot
/// reach their target. Converges because widening never reverses.
fn assign_offsets(instructions: &mut [Instruction]) -> Result<()> {
    loop {
        let mut offset = 0u32;
        for instr in instructions.iter_mut() {
            instr.offset = offset;
            offset += instr.size();
        }

        let mut widened = false;
        for index in 0..instructions.len() {
            if !instructions[index].is_short_branch() {
                continue;
            }
            let Operand::Label(label) = &instructions[index].operand else {
                continue;
            };

            let target = find_label(instructions, *label)?;
            let next = instructions[index].offset + instructions[index].size();
            let displacement =
                i64::from(instructions[target].offset) - i64::from(next);

            if i8::try_from(displacement).is_err() {
                instructions[index].widen_branch();
                widened = true;
            }
        }

        if !widened {
            return Ok(());
        }
    }
}

fn find_label(instructions: &[Instruction], label: Label) -> Result<usize> {
    instructions
        .iter()
        .position(|instr| instr.labels.contains(&label))
        .ok_or_else(|| malformed_error!("Branch references the unattached label {:?}", label))
}

fn emit_instruction(instructions: &[Instruction], index: usize, code: &mut Vec<u8>) -> Result<()> {
    let instr = &instructions[index];

    if instr.prefix == FE_PREFIX {
        code.push(FE_PREFIX);
    }
    code.push(instr.opcode);

    match &instr.operand {
        Operand::None => {}
        Operand::Immediate(imm) => emit_immediate(code, *imm),
        Operand::Token(token) => write_le(code, token.value()),
        Operand::Label(label) => {
            let target = find_label(instructions, *label)?;
            let next = instr.offset + instr.size();
            let displacement = i64::from(instructions[target].offset) - i64::from(next);

            if instr.operand_type == OperandType::Int8 {
                let short = i8::try_from(displacement).map_err(|_| {
                    malformed_error!(
                        "Short branch at {:#x} cannot reach its target",
                        instr.offset
                    )
                })?;
                write_le(code, short);
            } else {
                let long = i32::try_from(displacement)
                    .map_err(|_| malformed_error!("Branch displacement overflows i32"))?;
                write_le(code, long);
            }
        }
        Operand::SwitchLabels(targets) => {
            let count = u32::try_from(targets.len())
                .map_err(|_| malformed_error!("Switch table too large"))?;
            write_le(code, count);

            let next = instr.offset + instr.size();
            for label in targets {
                let target = find_label(instructions, *label)?;
                let displacement = i64::from(instructions[target].offset) - i64::from(next);
                let long = i32::try_from(displacement)
                    .map_err(|_| malformed_error!("Switch displacement overflows i32"))?;
                write_le(code, long);
            }
        }
        Operand::Target(_) | Operand::Switch(_) => {
            return Err(malformed_error!(
                "Instruction at {:#x} still carries an index operand; lift branches before encoding",
                instr.offset
            ));
        }
    }

    Ok(())
}

fn emit_immediate(code: &mut Vec<u8>, imm: Immediate) {
    match imm {
        Immediate::Int8(v) => write_le(code, v),
        Immediate::UInt8(v) => write_le(code, v),
        Immediate::Int16(v) => write_le(code, v),
        Immediate::UInt16(v) => write_le(code, v),
        Immediate::Int32(v) => write_le(code, v),
        Immediate::UInt32(v) => write_le(code, v),
        Immediate::Int64(v) => write_le(code, v),
        Immediate::UInt64(v) => write_le(code, v),
        Immediate::Float32(v) => write_le(code, v),
        Immediate::Float64(v) => write_le(code, v),
    }
}

struct OpenRegion {
    try_offset: u32,
    try_length: Option<u32>,
    flags: ExceptionClauseFlags,
    catch_type: Option<Token>,
    handler_offset: u32,
    filter_offset: u32,
}

fn rebuild_clauses(instructions: &[Instruction]) -> Result<Vec<ExceptionClause>> {
    let mut stack: Vec<OpenRegion> = Vec::new();
    let mut clauses = Vec::new();

    for instr in instructions {
        for block in &instr.blocks {
            match block.block_type {
                ExceptionBlockType::BeginExceptionBlock => {
                    stack.push(OpenRegion {
                        try_offset: instr.offset,
                        try_length: None,
                        flags: ExceptionClauseFlags::EXCEPTION,
                        catch_type: None,
                        handler_offset: 0,
                        filter_offset: 0,
                    });
                }
                ExceptionBlockType::BeginFilterBlock => {
                    let region = open_region(&mut stack, instr.offset)?;
                    region.try_length = Some(instr.offset - region.try_offset);
                    region.flags = ExceptionClauseFlags::FILTER;
                    region.filter_offset = instr.offset;
                }
                ExceptionBlockType::BeginCatchBlock => {
                    let region = open_region(&mut stack, instr.offset)?;
                    if region.flags != ExceptionClauseFlags::FILTER {
                        region.try_length = Some(instr.offset - region.try_offset);
                        region.catch_type = block.catch_type;
                    }
                    region.handler_offset = instr.offset;
                }
                ExceptionBlockType::BeginFinallyBlock => {
                    let region = open_region(&mut stack, instr.offset)?;
                    region.try_length = Some(instr.offset - region.try_offset);
                    region.flags = ExceptionClauseFlags::FINALLY;
                    region.handler_offset = instr.offset;
                }
                ExceptionBlockType::BeginFaultBlock => {
                    let region = open_region(&mut stack, instr.offset)?;
                    region.try_length = Some(instr.offset - region.try_offset);
                    region.flags = ExceptionClauseFlags::FAULT;
                    region.handler_offset = instr.offset;
                }
                ExceptionBlockType::EndExceptionBlock => {
                    let Some(region) = stack.pop() else {
                        return Err(malformed_error!(
                            "End marker at {:#x} without an open protected region",
                            instr.offset
                        ));
                    };
                    let Some(try_length) = region.try_length else {
                        return Err(malformed_error!(
                            "Protected region at {:#x} closed without a handler",
                            region.try_offset
                        ));
                    };

                    let handler_end = instr.offset + instr.size();
                    clauses.push(ExceptionClause {
                        flags: region.flags,
                        try_offset: region.try_offset,
                        try_length,
                        handler_offset: region.handler_offset,
                        handler_length: handler_end - region.handler_offset,
                        catch_type: region.catch_type,
                        filter_offset: region.filter_offset,
                    });
                }
            }
        }
    }

    if let Some(open) = stack.pop() {
        return Err(malformed_error!(
            "Protected region at {:#x} is never closed",
            open.try_offset
        ));
    }

    Ok(clauses)
}

fn open_region<'a>(stack: &'a mut Vec<OpenRegion>, at: u32) -> Result<&'a mut OpenRegion> {
    stack
        .last_mut()
        .ok_or_else(|| malformed_error!("Handler marker at {:#x} without an open region", at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::decoder::decode_stream;
    use crate::assembly::instruction::{ExceptionBlock, LabelGen};
    use crate::assembly::{decoder, opcodes};
    use crate::metadata::{
        FunctionBody, FunctionId, FunctionSig, MemberHandle, SymbolResolver,
    };

    struct NullResolver;

    impl SymbolResolver for NullResolver {
        fn signature(&self, _id: &FunctionId) -> Result<FunctionSig> {
            Err(crate::Error::NotSupported)
        }
        fn body(&self, _id: &FunctionId) -> Result<FunctionBody> {
            Err(crate::Error::NotSupported)
        }
        fn user_string(&self, token: Token) -> Result<String> {
            Ok(token.row().to_string())
        }
        fn member(&self, _token: Token) -> Option<MemberHandle> {
            None
        }
        fn extern_stub(&self, _id: &FunctionId) -> Result<Token> {
            Err(crate::Error::NotSupported)
        }
        fn native_entry(&self, _id: &FunctionId) -> Result<usize> {
            Err(crate::Error::NotSupported)
        }
    }

    fn round_trip(code: &[u8]) -> Vec<u8> {
        let mut labels = LabelGen::new();
        let mut instrs = decode_stream(code, &NullResolver).unwrap();
        decoder::lift_branches(&mut instrs, &mut labels);
        encode_body(&mut instrs, vec![], 8).unwrap().code
    }

    #[test]
    fn untouched_stream_is_byte_identical() {
        let code = vec![0x02, 0x1F, 0x0A, 0x58, 0x2A];
        assert_eq!(round_trip(&code), code);
    }

    #[test]
    fn branches_survive_round_trip() {
        // ldc.i4.0; brfalse.s +1; nop; br +0; ret
        let mut code = vec![0x16, 0x2C, 0x01, 0x00, 0x38];
        code.extend_from_slice(&0i32.to_le_bytes());
        code.push(0x2A);

        assert_eq!(round_trip(&code), code);
    }

    #[test]
    fn switch_survives_round_trip() {
        let mut code = vec![0x16, 0x45, 0x02, 0x00, 0x00, 0x00];
        code.extend_from_slice(&1i32.to_le_bytes());
        code.extend_from_slice(&0i32.to_le_bytes());
        code.extend_from_slice(&[0x00, 0x00, 0x2A]);

        assert_eq!(round_trip(&code), code);
    }

    #[test]
    fn short_branch_widens_when_out_of_reach() {
        let mut labels = LabelGen::new();
        let target_label = labels.fresh();

        let mut instrs = Vec::new();
        instrs.push(Instruction::branch(opcodes::BR_S, target_label));
        for _ in 0..200 {
            instrs.push(Instruction::nop());
        }
        let mut ret = Instruction::op(opcodes::RET);
        ret.attach_label(target_label);
        instrs.push(ret);

        let body = encode_body(&mut instrs, vec![], 8).unwrap();

        assert_eq!(instrs[0].opcode, opcodes::BR);
        assert_eq!(body.code.len(), 5 + 200 + 1);
        assert_eq!(body.code[0], opcodes::BR);
        assert_eq!(
            i32::from_le_bytes(body.code[1..5].try_into().unwrap()),
            200
        );
    }

    #[test]
    fn clause_table_round_trips() {
        let original = ExceptionClause {
            flags: ExceptionClauseFlags::FINALLY,
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 1,
            catch_type: None,
            filter_offset: 0,
        };
        let body = FunctionBody {
            code: vec![0x00, 0xDE, 0x01, 0xDC, 0x2A],
            exceptions: vec![original.clone()],
            ..Default::default()
        };

        let mut labels = LabelGen::new();
        let id = FunctionId::new(Token::new(0x0600_0001), "Test::Finally");
        let sig = FunctionSig {
            has_this: false,
            params: vec![],
            return_type: TypeSig::Void,
        };
        let mut instrs =
            decoder::decode_body(&id, &sig, &body, &NullResolver, &mut labels).unwrap();

        let encoded = encode_body(&mut instrs, vec![], 8).unwrap();
        assert_eq!(encoded.code, body.code);
        assert_eq!(encoded.exceptions, vec![original]);
    }

    #[test]
    fn unattached_label_is_rejected() {
        let mut labels = LabelGen::new();
        let dangling = labels.fresh();
        let mut instrs = vec![
            Instruction::branch(opcodes::BR, dangling),
            Instruction::op(opcodes::RET),
        ];

        assert!(matches!(
            encode_body(&mut instrs, vec![], 8),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn unbalanced_markers_are_rejected() {
        let mut open = Instruction::nop();
        open.attach_block(ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock));
        let mut instrs = vec![open, Instruction::op(opcodes::RET)];

        assert!(matches!(
            encode_body(&mut instrs, vec![], 8),
            Err(crate::Error::Malformed { .. })
        ));
    }
}
