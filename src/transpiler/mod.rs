//! The rewrite-pass chain: canonical and foreign transpilers.
//!
//! Registered transpiler patches rewrite the original instruction stream
//! before synthesis. Passes come in two shapes:
//!
//! - **Canonical** passes consume and produce [`Instruction`] lists directly.
//! - **Foreign** passes declare a [`FieldMap`] describing their own
//!   instruction layout; the executor projects each instruction into a
//!   [`ForeignInstruction`] record under the pass's field names, runs the
//!   pass, and reconciles the result back.
//!
//! # Architecture
//!
//! Projection is lossless even when the foreign layout is narrower than the
//! canonical one: every canonical field the map does not name is parked in an
//! *unassigned side table* keyed by the instruction's stable [`InstrId`] and
//! re-applied during reconciliation. Short branches are widened to their long
//! forms on the way out, since a pass may move code beyond an `i8`
//! displacement.
//!
//! A pass may duplicate instructions (same id appearing twice). Re-applying
//! parked exception markers to every copy would corrupt region nesting, so
//! [`should_add_exception_info`] checks, per occurrence, whether the
//! instructions that originally sat between the marker and its pairing
//! marker are still between them at that occurrence. When the situation is
//! unclear the marker is kept — losing one corrupts the body, duplicating
//! one is detected later by the encoder's nesting checks.
//!
//! The final [`shift_arguments`] pass renumbers argument accesses when the
//! target's calling convention grows a hidden leading return-buffer pointer;
//! slot 0 (`this`) never moves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::assembly::{
    ArgAccess, Argument, ExceptionBlock, ExceptionBlockType, InstrId, Instruction, Label, LabelGen,
    Operand,
};
use crate::assembly::opcodes;
use crate::metadata::FunctionId;
use crate::Result;

/// What the executor hands to every pass: the identity of the function being
/// rewritten and the label generator for any new branch targets.
pub struct TranspileContext<'a> {
    /// The function whose body is being rewritten
    pub function: &'a FunctionId,
    /// Allocator for fresh branch labels
    pub labels: &'a mut LabelGen,
}

/// The canonical instruction fields a foreign layout can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    /// Prefix and opcode bytes
    Opcode,
    /// Operand plus its derived argument
    Operand,
    /// Attached branch labels
    Labels,
    /// Attached exception-region markers
    Blocks,
}

impl CanonicalField {
    const ALL: [CanonicalField; 4] = [
        CanonicalField::Opcode,
        CanonicalField::Operand,
        CanonicalField::Labels,
        CanonicalField::Blocks,
    ];
}

/// Declares how a foreign pass names the canonical fields. Fields left
/// unmapped are invisible to the pass and carried through unchanged.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    renames: Vec<(CanonicalField, String)>,
}

impl FieldMap {
    /// An empty map; every field is unassigned.
    #[must_use]
    pub fn new() -> Self {
        FieldMap::default()
    }

    /// Name a canonical field in the foreign layout.
    #[must_use]
    pub fn map(mut self, field: CanonicalField, foreign: impl Into<String>) -> Self {
        self.renames.push((field, foreign.into()));
        self
    }

    fn foreign_name(&self, field: CanonicalField) -> Option<&str> {
        self.renames
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, name)| name.as_str())
    }
}

/// A canonical field's value, as carried through projection.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Prefix and opcode bytes
    Opcode {
        /// `0` or the two-byte prefix
        prefix: u8,
        /// Opcode byte
        opcode: u8,
    },
    /// Operand with its derived argument
    Operand {
        /// The operand
        operand: Operand,
        /// The derived consumer value
        argument: Argument,
    },
    /// Attached labels
    Labels(Vec<Label>),
    /// Attached exception markers
    Blocks(Vec<ExceptionBlock>),
}

/// An instruction as a foreign pass sees it: its stable id plus whichever
/// fields the pass's layout names.
#[derive(Debug, Clone)]
pub struct ForeignInstruction {
    /// Stable identity; duplicated by cloning, fresh for new instructions
    pub id: InstrId,
    /// Field values under the pass's own names
    pub fields: BTreeMap<String, FieldValue>,
}

impl ForeignInstruction {
    /// A new, empty foreign instruction with a fresh id. Reconciles to a
    /// `nop` unless the pass fills in an opcode field.
    #[must_use]
    pub fn new() -> Self {
        ForeignInstruction {
            id: InstrId::fresh(),
            fields: BTreeMap::new(),
        }
    }
}

impl Default for ForeignInstruction {
    fn default() -> Self {
        ForeignInstruction::new()
    }
}

/// One rewrite pass over a function body.
///
/// Implement [`TranspilerPass::transpile`] for canonical passes; return a
/// [`FieldMap`] from [`TranspilerPass::foreign_layout`] and implement
/// [`TranspilerPass::transpile_foreign`] for passes with their own
/// instruction shape.
pub trait TranspilerPass: Send + Sync {
    /// Name used in diagnostics and errors.
    fn name(&self) -> &str;

    /// The foreign field layout, or `None` for a canonical pass.
    fn foreign_layout(&self) -> Option<&FieldMap> {
        None
    }

    /// Rewrite the canonical stream. Default: identity.
    fn transpile(&self, ctx: &mut TranspileContext<'_>, code: Vec<Instruction>) -> Vec<Instruction> {
        let _ = ctx;
        code
    }

    /// Rewrite the projected stream. Default: identity.
    fn transpile_foreign(
        &self,
        ctx: &mut TranspileContext<'_>,
        code: Vec<ForeignInstruction>,
    ) -> Vec<ForeignInstruction> {
        let _ = ctx;
        code
    }
}

/// Run the sorted transpiler chain over a decoded body.
///
/// An empty chain returns the stream unchanged, instruction for instruction.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] when a foreign pass writes an opcode
/// byte that is not defined.
pub fn run_chain(
    ctx: &mut TranspileContext<'_>,
    passes: &[Arc<dyn TranspilerPass>],
    mut code: Vec<Instruction>,
) -> Result<Vec<Instruction>> {
    for pass in passes {
        code = if let Some(map) = pass.foreign_layout() {
            run_foreign(ctx, pass.as_ref(), map, code)?
        } else {
            pass.transpile(ctx, code)
        };
    }
    Ok(code)
}

fn run_foreign(
    ctx: &mut TranspileContext<'_>,
    pass: &dyn TranspilerPass,
    map: &FieldMap,
    code: Vec<Instruction>,
) -> Result<Vec<Instruction>> {
    let mut unassigned: HashMap<InstrId, Vec<FieldValue>> = HashMap::new();
    let original_ids: Vec<InstrId> = code.iter().map(|instr| instr.id).collect();

    let foreign: Vec<ForeignInstruction> = code
        .into_iter()
        .map(|mut instr| {
            if instr.is_short_branch() {
                instr.widen_branch();
            }
            project(instr, map, &mut unassigned)
        })
        .collect();

    let result = pass.transpile_foreign(ctx, foreign);

    reconcile(result, map, &unassigned, &original_ids)
}

fn project(
    instr: Instruction,
    map: &FieldMap,
    unassigned: &mut HashMap<InstrId, Vec<FieldValue>>,
) -> ForeignInstruction {
    let id = instr.id;
    let mut fields = BTreeMap::new();

    for field in CanonicalField::ALL {
        let value = match field {
            CanonicalField::Opcode => FieldValue::Opcode {
                prefix: instr.prefix,
                opcode: instr.opcode,
            },
            CanonicalField::Operand => FieldValue::Operand {
                operand: instr.operand.clone(),
                argument: instr.argument.clone(),
            },
            CanonicalField::Labels => FieldValue::Labels(instr.labels.clone()),
            CanonicalField::Blocks => FieldValue::Blocks(instr.blocks.clone()),
        };

        if let Some(name) = map.foreign_name(field) {
            fields.insert(name.to_string(), value);
        } else if !is_empty_value(&value) {
            unassigned.entry(id).or_default().push(value);
        }
    }

    ForeignInstruction { id, fields }
}

fn is_empty_value(value: &FieldValue) -> bool {
    match value {
        FieldValue::Opcode { .. } => false,
        FieldValue::Operand { operand, argument } => {
            *operand == Operand::None && *argument == Argument::None
        }
        FieldValue::Labels(labels) => labels.is_empty(),
        FieldValue::Blocks(blocks) => blocks.is_empty(),
    }
}

fn reconcile(
    result: Vec<ForeignInstruction>,
    map: &FieldMap,
    unassigned: &HashMap<InstrId, Vec<FieldValue>>,
    original_ids: &[InstrId],
) -> Result<Vec<Instruction>> {
    let new_ids: Vec<InstrId> = result.iter().map(|f| f.id).collect();
    let mut out = Vec::with_capacity(result.len());

    for (op_index, foreign) in result.into_iter().enumerate() {
        let mut instr = Instruction::nop();
        instr.id = foreign.id;

        for field in CanonicalField::ALL {
            if let Some(name) = map.foreign_name(field) {
                if let Some(value) = foreign.fields.get(name) {
                    apply_field(&mut instr, value)?;
                }
            }
        }

        if let Some(values) = unassigned.get(&foreign.id) {
            let add_blocks = should_add_exception_info(
                foreign.id,
                op_index,
                original_ids,
                &new_ids,
                unassigned,
            );
            for value in values {
                if matches!(value, FieldValue::Blocks(_)) && !add_blocks {
                    continue;
                }
                apply_field(&mut instr, &value)?;
            }
        }

        out.push(instr);
    }

    Ok(out)
}

fn apply_field(instr: &mut Instruction, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Opcode { prefix, opcode } => {
            let Some(spec) = opcodes::lookup(*prefix, *opcode) else {
                return Err(malformed_error!(
                    "Rewrite pass produced the undefined opcode {:#04x} (prefix {:#04x})",
                    opcode,
                    prefix
                ));
            };
            instr.prefix = *prefix;
            instr.opcode = *opcode;
            instr.mnemonic = spec.mnemonic;
            instr.operand_type = spec.operand;
            instr.flow = spec.flow;
        }
        FieldValue::Operand { operand, argument } => {
            instr.operand = operand.clone();
            instr.argument = argument.clone();
        }
        FieldValue::Labels(labels) => {
            instr.labels = labels.clone();
        }
        FieldValue::Blocks(blocks) => {
            instr.blocks = blocks.clone();
        }
    }
    Ok(())
}

fn has_unassigned_blocks(id: InstrId, unassigned: &HashMap<InstrId, Vec<FieldValue>>) -> bool {
    unassigned.get(&id).is_some_and(|values| {
        values
            .iter()
            .any(|value| matches!(value, FieldValue::Blocks(blocks) if !blocks.is_empty()))
    })
}

fn unassigned_blocks(
    id: InstrId,
    unassigned: &HashMap<InstrId, Vec<FieldValue>>,
) -> Vec<ExceptionBlock> {
    unassigned
        .get(&id)
        .into_iter()
        .flatten()
        .filter_map(|value| match value {
            FieldValue::Blocks(blocks) => Some(blocks.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Decide whether the occurrence of `id` at `op_index` in the new stream
/// should receive the parked exception markers.
///
/// For a unique occurrence the answer is always yes. For duplicates, the
/// instructions that originally sat between this marker and its pairing
/// marker must still sit between them at this occurrence; an occurrence that
/// lost them is a copy outside the region. Unclear cases keep the marker.
fn should_add_exception_info(
    id: InstrId,
    op_index: usize,
    original_ids: &[InstrId],
    new_ids: &[InstrId],
    unassigned: &HashMap<InstrId, Vec<FieldValue>>,
) -> bool {
    let Some(original_index) = original_ids.iter().position(|&o| o == id) else {
        return false; // new instruction, nothing parked for it
    };

    let blocks = unassigned_blocks(id, unassigned);
    if blocks.is_empty() {
        return false;
    }

    let dup_count = new_ids.iter().filter(|&&n| n == id).count();
    if dup_count <= 1 {
        return true;
    }

    let has_start = blocks.iter().any(|b| b.block_type.is_begin());
    let has_end = blocks
        .iter()
        .any(|b| b.block_type == ExceptionBlockType::EndExceptionBlock);

    if has_start && !has_end {
        // Pair with the next marker-carrying instruction, in both streams.
        let original_pair = original_ids
            .iter()
            .skip(original_index + 1)
            .position(|&o| has_unassigned_blocks(o, unassigned))
            .map(|p| original_index + 1 + p);
        if let Some(pair) = original_pair {
            let original_between =
                between_forward(original_ids, original_index, pair, new_ids);

            let new_pair = new_ids
                .iter()
                .skip(op_index + 1)
                .position(|&n| has_unassigned_blocks(n, unassigned))
                .map(|p| op_index + 1 + p);
            if let Some(new_pair) = new_pair {
                let new_between = slice_range(new_ids, op_index + 1, new_pair.saturating_sub(1));
                return original_between
                    .iter()
                    .all(|needed| new_between.contains(needed));
            }
        }
    }

    if !has_start && has_end {
        // Pair with the previous marker-carrying instruction, in both streams.
        let original_pair = original_ids[..original_index]
            .iter()
            .rposition(|&o| has_unassigned_blocks(o, unassigned));
        if let Some(pair) = original_pair {
            let original_between: Vec<InstrId> = original_ids[pair..original_index]
                .iter()
                .copied()
                .filter(|o| new_ids.contains(o))
                .collect();

            let new_pair = new_ids[..op_index]
                .iter()
                .rposition(|&n| has_unassigned_blocks(n, unassigned));
            if let Some(new_pair) = new_pair {
                let new_between = &new_ids[new_pair..op_index];
                return original_between
                    .iter()
                    .all(|needed| new_between.contains(needed));
            }
        }
    }

    // Unclear or unexpected case; keeping the marker is the safe direction.
    true
}

/// The ids strictly between `from` and the instruction before `pair`,
/// filtered to those that survived into the new stream.
fn between_forward(
    original_ids: &[InstrId],
    from: usize,
    pair: usize,
    new_ids: &[InstrId],
) -> Vec<InstrId> {
    slice_range(original_ids, from + 1, pair.saturating_sub(1))
        .iter()
        .copied()
        .filter(|o| new_ids.contains(o))
        .collect()
}

fn slice_range(ids: &[InstrId], start: usize, end: usize) -> &[InstrId] {
    if end <= start || start >= ids.len() {
        return &[];
    }
    &ids[start..end.min(ids.len())]
}

/// Renumber argument accesses for the hidden return-buffer parameter: every
/// access to a slot above zero moves up by one; slot 0 (`this`) stays.
///
/// Identity, labels and markers of the rewritten instructions are preserved.
pub fn shift_arguments(instructions: &mut [Instruction]) {
    for instr in instructions.iter_mut() {
        let Some((access, index)) = instr.arg_access() else {
            continue;
        };
        if index == 0 {
            continue;
        }

        let replacement = match access {
            ArgAccess::Load => Instruction::load_arg(index + 1),
            ArgAccess::LoadAddr => Instruction::load_arg_addr(index + 1),
            ArgAccess::Store => Instruction::store_arg(index + 1),
        };

        instr.prefix = replacement.prefix;
        instr.opcode = replacement.opcode;
        instr.mnemonic = replacement.mnemonic;
        instr.operand_type = replacement.operand_type;
        instr.flow = replacement.flow;
        instr.operand = replacement.operand;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::opcodes;
    use crate::metadata::Token;

    fn context_parts() -> (FunctionId, LabelGen) {
        (
            FunctionId::new(Token::new(0x0600_0001), "Test::Target"),
            LabelGen::new(),
        )
    }

    struct Identity;
    impl TranspilerPass for Identity {
        fn name(&self) -> &str {
            "identity"
        }
    }

    struct ConstantDoubler;
    impl TranspilerPass for ConstantDoubler {
        fn name(&self) -> &str {
            "constant_doubler"
        }
        fn transpile(
            &self,
            _ctx: &mut TranspileContext<'_>,
            code: Vec<Instruction>,
        ) -> Vec<Instruction> {
            code.into_iter()
                .map(|instr| {
                    if instr.opcode == opcodes::LDC_I4_2 {
                        let mut doubled = Instruction::ldc_i4(4);
                        doubled.id = instr.id;
                        doubled.labels = instr.labels;
                        doubled.blocks = instr.blocks;
                        doubled
                    } else {
                        instr
                    }
                })
                .collect()
        }
    }

    fn sample_code() -> Vec<Instruction> {
        vec![
            Instruction::op(opcodes::LDC_I4_2),
            Instruction::op(opcodes::DUP),
            Instruction::op(opcodes::ADD),
            Instruction::op(opcodes::RET),
        ]
    }

    #[test]
    fn empty_chain_is_identity() {
        let (function, mut labels) = context_parts();
        let mut ctx = TranspileContext {
            function: &function,
            labels: &mut labels,
        };

        let code = sample_code();
        let ids: Vec<InstrId> = code.iter().map(|i| i.id).collect();
        let mnemonics: Vec<&str> = code.iter().map(|i| i.mnemonic).collect();

        let out = run_chain(&mut ctx, &[], code).unwrap();
        assert_eq!(out.iter().map(|i| i.id).collect::<Vec<_>>(), ids);
        assert_eq!(out.iter().map(|i| i.mnemonic).collect::<Vec<_>>(), mnemonics);
    }

    #[test]
    fn identity_pass_changes_nothing() {
        let (function, mut labels) = context_parts();
        let mut ctx = TranspileContext {
            function: &function,
            labels: &mut labels,
        };

        let code = sample_code();
        let ids: Vec<InstrId> = code.iter().map(|i| i.id).collect();

        let passes: Vec<Arc<dyn TranspilerPass>> = vec![Arc::new(Identity)];
        let out = run_chain(&mut ctx, &passes, code).unwrap();
        assert_eq!(out.iter().map(|i| i.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn canonical_pass_rewrites_in_place() {
        let (function, mut labels) = context_parts();
        let mut ctx = TranspileContext {
            function: &function,
            labels: &mut labels,
        };

        let passes: Vec<Arc<dyn TranspilerPass>> = vec![Arc::new(ConstantDoubler)];
        let out = run_chain(&mut ctx, &passes, sample_code()).unwrap();

        assert_eq!(out[0].mnemonic, "ldc.i4.4");
        assert_eq!(out[1].mnemonic, "dup");
    }

    struct OpcodeOnly {
        layout: FieldMap,
    }

    impl OpcodeOnly {
        fn new() -> Self {
            OpcodeOnly {
                layout: FieldMap::new()
                    .map(CanonicalField::Opcode, "code")
                    .map(CanonicalField::Operand, "value"),
            }
        }
    }

    impl TranspilerPass for OpcodeOnly {
        fn name(&self) -> &str {
            "opcode_only"
        }
        fn foreign_layout(&self) -> Option<&FieldMap> {
            Some(&self.layout)
        }
        fn transpile_foreign(
            &self,
            _ctx: &mut TranspileContext<'_>,
            code: Vec<ForeignInstruction>,
        ) -> Vec<ForeignInstruction> {
            code
        }
    }

    #[test]
    fn foreign_identity_preserves_unmapped_fields() {
        let (function, mut labels) = context_parts();

        let mut code = sample_code();
        let label = labels.fresh();
        code[3].attach_label(label);
        code[0].attach_block(ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock));
        code[3].attach_block(ExceptionBlock::new(ExceptionBlockType::EndExceptionBlock));

        let mut ctx = TranspileContext {
            function: &function,
            labels: &mut labels,
        };
        let passes: Vec<Arc<dyn TranspilerPass>> = vec![Arc::new(OpcodeOnly::new())];
        let out = run_chain(&mut ctx, &passes, code).unwrap();

        assert_eq!(out.len(), 4);
        assert!(out[3].labels.contains(&label));
        assert_eq!(
            out[0].blocks[0].block_type,
            ExceptionBlockType::BeginExceptionBlock
        );
        assert_eq!(
            out[3].blocks[0].block_type,
            ExceptionBlockType::EndExceptionBlock
        );
    }

    struct TailDuplicator {
        layout: FieldMap,
    }

    impl TailDuplicator {
        fn new() -> Self {
            TailDuplicator {
                layout: FieldMap::new().map(CanonicalField::Opcode, "code"),
            }
        }
    }

    impl TranspilerPass for TailDuplicator {
        fn name(&self) -> &str {
            "tail_duplicator"
        }
        fn foreign_layout(&self) -> Option<&FieldMap> {
            Some(&self.layout)
        }
        fn transpile_foreign(
            &self,
            _ctx: &mut TranspileContext<'_>,
            mut code: Vec<ForeignInstruction>,
        ) -> Vec<ForeignInstruction> {
            let last = code.last().cloned();
            code.push(ForeignInstruction::new());
            if let Some(last) = last {
                code.push(last);
            }
            code
        }
    }

    #[test]
    fn duplicated_end_marker_stays_on_intact_region() {
        let (function, mut labels) = context_parts();

        let mut code = sample_code();
        code[0].attach_block(ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock));
        code[3].attach_block(ExceptionBlock::new(ExceptionBlockType::EndExceptionBlock));

        let mut ctx = TranspileContext {
            function: &function,
            labels: &mut labels,
        };
        let passes: Vec<Arc<dyn TranspilerPass>> = vec![Arc::new(TailDuplicator::new())];
        let out = run_chain(&mut ctx, &passes, code).unwrap();

        // [orig0, orig1, orig2, orig3, fresh-nop, orig3-copy]
        assert_eq!(out.len(), 6);
        assert_eq!(
            out[3].blocks.first().map(|b| b.block_type),
            Some(ExceptionBlockType::EndExceptionBlock)
        );
        assert!(out[5].blocks.is_empty());
        assert!(out[4].blocks.is_empty());
    }

    #[test]
    fn short_branches_are_widened_for_foreign_passes() {
        let (function, mut labels) = context_parts();

        let label = labels.fresh();
        let mut code = vec![
            Instruction::new(
                0,
                opcodes::BR_S,
                Operand::Label(label),
            )
            .unwrap(),
            Instruction::op(opcodes::RET),
        ];
        code[1].attach_label(label);

        let mut ctx = TranspileContext {
            function: &function,
            labels: &mut labels,
        };
        let passes: Vec<Arc<dyn TranspilerPass>> = vec![Arc::new(OpcodeOnly::new())];
        let out = run_chain(&mut ctx, &passes, code).unwrap();

        assert_eq!(out[0].opcode, opcodes::BR);
    }

    #[test]
    fn argument_shift_skips_slot_zero() {
        let mut code = vec![
            Instruction::load_arg(0),
            Instruction::load_arg(1),
            Instruction::load_arg(3),
            Instruction::store_arg(2),
            Instruction::load_arg_addr(1),
            Instruction::load_local(1),
        ];

        shift_arguments(&mut code);

        assert_eq!(code[0].arg_access(), Some((ArgAccess::Load, 0)));
        assert_eq!(code[1].arg_access(), Some((ArgAccess::Load, 2)));
        assert_eq!(code[2].arg_access(), Some((ArgAccess::Load, 4)));
        assert_eq!(code[3].arg_access(), Some((ArgAccess::Store, 3)));
        assert_eq!(code[4].arg_access(), Some((ArgAccess::LoadAddr, 2)));
        assert_eq!(code[5].arg_access(), None);
        assert_eq!(code[5].mnemonic, "ldloc.1");
    }
}
