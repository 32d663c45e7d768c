//! Fault-region lowering.
//!
//! A fault handler runs only on exceptional exit from its protected region.
//! Some code generators refuse fault clauses outright, so before synthesis
//! every fault-only region is rewritten into plain catch/finally form:
//!
//! ```text
//! try { BODY } fault { F }
//! ```
//!
//! becomes
//!
//! ```text
//! try {
//!     try { BODY } catch { failed = true; rethrow }
//! } finally {
//!     if failed { F }
//! }
//! ```
//!
//! The catch arm records the failure and rethrows, so the finally arm runs
//! the old fault body exactly when the region exited exceptionally. The
//! failure flag becomes a fresh boolean local, initialized at the front of
//! the stream.

use crate::assembly::{ExceptionBlock, ExceptionBlockType, Instruction, Label, LabelGen, Operand};
use crate::assembly::opcodes;
use crate::metadata::TypeSig;
use crate::Result;

/// Rewrite every fault region in `instructions` into catch/finally form,
/// appending one boolean flag local per region to `locals`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] when a fault marker is not enclosed
/// by a properly paired begin/end region.
pub fn rewrite_fault_blocks(
    instructions: &mut Vec<Instruction>,
    locals: &mut Vec<TypeSig>,
    labels: &mut LabelGen,
) -> Result<()> {
    loop {
        let Some(fault) = instructions.iter().position(|instr| {
            instr
                .blocks
                .iter()
                .any(|b| b.block_type == ExceptionBlockType::BeginFaultBlock)
        }) else {
            return Ok(());
        };

        let Some(begin) = enclosing_begin(instructions, fault) else {
            return Err(malformed_error!(
                "Fault handler at stream index {} has no enclosing protected region",
                fault
            ));
        };
        let Some(end) = enclosing_end(instructions, fault) else {
            return Err(malformed_error!(
                "Fault handler at stream index {} has no region end",
                fault
            ));
        };

        #[allow(clippy::cast_possible_truncation)]
        let flag = locals.len() as u16;
        locals.push(TypeSig::Boolean);

        rewrite_one(instructions, labels, flag, fault, begin, end);
    }
}

fn rewrite_one(
    instructions: &mut Vec<Instruction>,
    labels: &mut LabelGen,
    flag: u16,
    fault: usize,
    begin: usize,
    end: usize,
) {
    // The outer region must open before the inner one on the same
    // instruction; insert its begin marker ahead of the existing one.
    let begin_pos = instructions[begin]
        .blocks
        .iter()
        .position(|b| b.block_type == ExceptionBlockType::BeginExceptionBlock)
        .unwrap_or(0);
    instructions[begin].blocks.insert(
        begin_pos,
        ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock),
    );

    // The fault marker itself disappears; the old fault body becomes the
    // guarded tail of the outer finally.
    instructions[fault]
        .blocks
        .retain(|b| b.block_type != ExceptionBlockType::BeginFaultBlock);

    let done: Label = labels.fresh();
    instructions[end].attach_label(done);

    // catch { failed = true; rethrow } closing the inner region, then the
    // outer finally opening with the flag check.
    let mut record = Instruction::ldc_i4(1);
    record.attach_block(ExceptionBlock::catch(None));

    let mut rethrow = Instruction::new(opcodes::FE_PREFIX, opcodes::FE_RETHROW, Operand::None)
        .unwrap_or_else(|_| Instruction::nop());
    rethrow.attach_block(ExceptionBlock::new(ExceptionBlockType::EndExceptionBlock));

    let mut check = Instruction::load_local(flag);
    check.attach_block(ExceptionBlock::new(ExceptionBlockType::BeginFinallyBlock));

    instructions.splice(
        fault..fault,
        [
            record,
            Instruction::store_local(flag),
            rethrow,
            check,
            Instruction::branch(opcodes::BRFALSE, done),
        ],
    );

    // Flag initialization sits ahead of everything, outside any region.
    instructions.splice(
        0..0,
        [Instruction::ldc_i4(0), Instruction::store_local(flag)],
    );
}

/// Backward scan from a handler marker to the begin of its enclosing region.
/// Complete inner regions pass as balanced end/begin pairs.
fn enclosing_begin(instructions: &[Instruction], from: usize) -> Option<usize> {
    let mut depth = 0i32;

    for index in (0..=from).rev() {
        for block in instructions[index].blocks.iter().rev() {
            if block.block_type == ExceptionBlockType::EndExceptionBlock {
                depth += 1;
            } else if block.block_type == ExceptionBlockType::BeginExceptionBlock {
                if depth == 0 {
                    return Some(index);
                }
                depth -= 1;
            }
        }
    }

    None
}

/// Forward dual of [`enclosing_begin`].
fn enclosing_end(instructions: &[Instruction], from: usize) -> Option<usize> {
    let mut depth = 0i32;

    for (index, instr) in instructions.iter().enumerate().skip(from) {
        for block in &instr.blocks {
            if block.block_type == ExceptionBlockType::BeginExceptionBlock {
                depth += 1;
            } else if block.block_type == ExceptionBlockType::EndExceptionBlock {
                if depth == 0 {
                    return Some(index);
                }
                depth -= 1;
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::encoder::encode_body;

    /// try { nop; leave done } fault { nop; endfinally } done: ret
    fn fault_region(labels: &mut LabelGen) -> Vec<Instruction> {
        let done = labels.fresh();

        let mut guarded = Instruction::nop();
        guarded.attach_block(ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock));

        let mut handler = Instruction::nop();
        handler.attach_block(ExceptionBlock::new(ExceptionBlockType::BeginFaultBlock));

        let mut endfinally = Instruction::op(opcodes::ENDFINALLY);
        endfinally.attach_block(ExceptionBlock::new(ExceptionBlockType::EndExceptionBlock));

        let mut ret = Instruction::op(opcodes::RET);
        ret.attach_label(done);

        vec![
            guarded,
            Instruction::branch(opcodes::LEAVE, done),
            handler,
            endfinally,
            ret,
        ]
    }

    fn block_types(instr: &Instruction) -> Vec<ExceptionBlockType> {
        instr.blocks.iter().map(|b| b.block_type).collect()
    }

    #[test]
    fn fault_becomes_catch_plus_finally() {
        let mut labels = LabelGen::new();
        let mut code = fault_region(&mut labels);
        let mut locals = vec![TypeSig::I4];

        rewrite_fault_blocks(&mut code, &mut locals, &mut labels).unwrap();

        assert_eq!(locals, vec![TypeSig::I4, TypeSig::Boolean]);

        // [init, init, try-head, leave, catch-record, store, rethrow,
        //  finally-check, brfalse, old-fault-nop, endfinally, ret]
        assert_eq!(code.len(), 12);
        assert_eq!(
            block_types(&code[2]),
            vec![
                ExceptionBlockType::BeginExceptionBlock,
                ExceptionBlockType::BeginExceptionBlock
            ]
        );
        assert_eq!(
            block_types(&code[4]),
            vec![ExceptionBlockType::BeginCatchBlock]
        );
        assert_eq!(
            block_types(&code[6]),
            vec![ExceptionBlockType::EndExceptionBlock]
        );
        assert_eq!(
            block_types(&code[7]),
            vec![ExceptionBlockType::BeginFinallyBlock]
        );
        assert_eq!(
            block_types(&code[10]),
            vec![ExceptionBlockType::EndExceptionBlock]
        );
        assert!(code
            .iter()
            .all(|i| !i.blocks.iter().any(|b| b.block_type == ExceptionBlockType::BeginFaultBlock)));

        // The flag local is the appended slot.
        assert_eq!(code[1].mnemonic, "stloc.1");
    }

    #[test]
    fn rewritten_region_still_encodes() {
        let mut labels = LabelGen::new();
        let mut code = fault_region(&mut labels);
        let mut locals = Vec::new();

        rewrite_fault_blocks(&mut code, &mut locals, &mut labels).unwrap();

        let body = encode_body(&mut code, locals, 2).unwrap();
        assert_eq!(body.exceptions.len(), 2);

        let fault_free = body.exceptions.iter().all(|clause| {
            !clause
                .flags
                .contains(crate::metadata::ExceptionClauseFlags::FAULT)
        });
        assert!(fault_free);

        let has_finally = body.exceptions.iter().any(|clause| {
            clause
                .flags
                .contains(crate::metadata::ExceptionClauseFlags::FINALLY)
        });
        assert!(has_finally);
    }

    #[test]
    fn stream_without_faults_is_untouched() {
        let mut labels = LabelGen::new();
        let mut code = vec![Instruction::nop(), Instruction::op(opcodes::RET)];
        let mut locals = Vec::new();

        rewrite_fault_blocks(&mut code, &mut locals, &mut labels).unwrap();
        assert_eq!(code.len(), 2);
        assert!(locals.is_empty());
    }

    #[test]
    fn orphan_fault_marker_is_malformed() {
        let mut labels = LabelGen::new();
        let mut orphan = Instruction::nop();
        orphan.attach_block(ExceptionBlock::new(ExceptionBlockType::BeginFaultBlock));
        let mut code = vec![orphan, Instruction::op(opcodes::RET)];
        let mut locals = Vec::new();

        assert!(rewrite_fault_blocks(&mut code, &mut locals, &mut labels).is_err());
    }
}
