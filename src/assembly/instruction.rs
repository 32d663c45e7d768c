//! Canonical instruction representation for decoding, rewriting and encoding.
//!
//! This module defines the editable form of a method body: a flat
//! `Vec<Instruction>` where every element carries its opcode, decoded operand,
//! derived argument, attached branch labels and exception-region markers.
//!
//! # Architecture
//!
//! Three design points shape the model:
//!
//! - **Stable identity** - every [`Instruction`] is stamped with an
//!   [`InstrId`] at construction. `Clone` preserves the id, so a rewrite pass
//!   that duplicates an instruction produces two elements with the same id,
//!   which is exactly what the duplicate-handling heuristic and the final
//!   original-to-replacement index map key on.
//! - **Labels over offsets** - branch operands are lifted from byte offsets to
//!   [`Label`]s attached to their target instruction, so list edits never
//!   invalidate control flow. Offsets are recomputed by the encoder.
//! - **Markers over clause tables** - exception regions travel as
//!   begin/catch/finally/fault/filter/end markers attached to instructions;
//!   the encoder rebuilds the flat clause table at the end.
//!
//! # Thread Safety
//!
//! Instructions are plain owned data. The id counter is a process-wide atomic,
//! so construction is safe from any thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use strum::Display;

use crate::assembly::opcodes::{self, FE_PREFIX};
use crate::metadata::{MemberHandle, Token};

/// Stable identity of an instruction, assigned at construction and preserved
/// by `Clone`. Two stream elements with the same id are duplicates of one
/// original instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u64);

static NEXT_INSTR_ID: AtomicU64 = AtomicU64::new(1);

impl InstrId {
    /// Allocate a fresh, process-unique id.
    #[must_use]
    pub fn fresh() -> Self {
        InstrId(NEXT_INSTR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A branch target marker. Labels are attached to the instruction they point
/// at and referenced by branch operands; they carry no position of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Allocates labels for one synthesis run.
#[derive(Debug, Default)]
pub struct LabelGen {
    next: u32,
}

impl LabelGen {
    /// Create a generator starting at label 0.
    #[must_use]
    pub fn new() -> Self {
        LabelGen::default()
    }

    /// Allocate the next label.
    pub fn fresh(&mut self) -> Label {
        let label = Label(self.next);
        self.next += 1;
        label
    }
}

/// Shape of the encoded operand that follows an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand bytes
    None,
    /// Signed 8-bit immediate (also short branch displacements)
    Int8,
    /// Unsigned 8-bit immediate (short variable/argument indices)
    UInt8,
    /// Signed 16-bit immediate
    Int16,
    /// Unsigned 16-bit immediate (long variable/argument indices)
    UInt16,
    /// Signed 32-bit immediate (also long branch displacements)
    Int32,
    /// Unsigned 32-bit immediate
    UInt32,
    /// Signed 64-bit immediate
    Int64,
    /// Unsigned 64-bit immediate
    UInt64,
    /// 32-bit float immediate
    Float32,
    /// 64-bit float immediate
    Float64,
    /// 32-bit metadata token
    Token,
    /// Switch table: u32 count followed by that many i32 displacements
    Switch,
}

impl OperandType {
    /// Encoded operand size in bytes, `None` for the variable-length switch.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 => Some(1),
            OperandType::Int16 | OperandType::UInt16 => Some(2),
            OperandType::Int32 | OperandType::UInt32 | OperandType::Float32 | OperandType::Token => {
                Some(4)
            }
            OperandType::Int64 | OperandType::UInt64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// Effect of an instruction on control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Branches or falls through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls and returns here
    Call,
    /// Returns from the method
    Return,
    /// Multi-way branch or fall through
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally or fault handler
    EndFinally,
    /// Ends a filter expression
    EndFilter,
    /// Exits a protected region
    Leave,
}

impl FlowType {
    /// `true` for the flows whose operand is a branch displacement.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave
        )
    }
}

/// A decoded immediate operand value, tagged with its encoded width.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl Immediate {
    /// The value as an unsigned 16-bit index, for variable/argument operands.
    #[must_use]
    pub fn as_index(&self) -> Option<u16> {
        match self {
            Immediate::UInt8(v) => Some(u16::from(*v)),
            Immediate::UInt16(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a branch displacement, for `Int8`/`Int32` operands.
    #[must_use]
    pub fn as_displacement(&self) -> Option<i32> {
        match self {
            Immediate::Int8(v) => Some(i32::from(*v)),
            Immediate::Int32(v) => Some(*v),
            _ => None,
        }
    }
}

/// A decoded instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Immediate value
    Immediate(Immediate),
    /// Metadata token
    Token(Token),
    /// Branch target as an index into the decoded stream (pre-lifting)
    Target(usize),
    /// Branch target as a label (post-lifting, the editable form)
    Label(Label),
    /// Switch targets as indices into the decoded stream (pre-lifting)
    Switch(Vec<usize>),
    /// Switch targets as labels (post-lifting)
    SwitchLabels(Vec<Label>),
}

/// Derived consumer value of an operand: what the token or immediate *means*,
/// as far as the resolver could tell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Argument {
    /// Nothing derived
    #[default]
    None,
    /// Resolved user string for `ldstr`
    String(std::sync::Arc<str>),
    /// Resolved member for call/field/type tokens
    Member(MemberHandle),
}

/// Kind of exception-region marker attached to an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ExceptionBlockType {
    /// Opens a protected region
    BeginExceptionBlock,
    /// Opens a typed catch handler
    BeginCatchBlock,
    /// Opens a finally handler
    BeginFinallyBlock,
    /// Opens a fault handler
    BeginFaultBlock,
    /// Opens a filter expression
    BeginFilterBlock,
    /// Closes the whole protected region
    EndExceptionBlock,
}

impl ExceptionBlockType {
    /// `true` for every marker except [`ExceptionBlockType::EndExceptionBlock`].
    #[must_use]
    pub fn is_begin(&self) -> bool {
        !matches!(self, ExceptionBlockType::EndExceptionBlock)
    }
}

/// An exception-region marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionBlock {
    /// Marker kind
    pub block_type: ExceptionBlockType,
    /// Caught type for catch markers
    pub catch_type: Option<Token>,
}

impl ExceptionBlock {
    /// Create a marker of the given kind without a catch type.
    #[must_use]
    pub fn new(block_type: ExceptionBlockType) -> Self {
        ExceptionBlock {
            block_type,
            catch_type: None,
        }
    }

    /// Create a typed catch marker.
    #[must_use]
    pub fn catch(catch_type: Option<Token>) -> Self {
        ExceptionBlock {
            block_type: ExceptionBlockType::BeginCatchBlock,
            catch_type,
        }
    }
}

/// How an instruction accesses an argument slot, for the shift pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAccess {
    /// Loads the value
    Load,
    /// Loads the address
    LoadAddr,
    /// Stores the value
    Store,
}

/// One instruction of the editable stream.
///
/// `offset` is only meaningful directly after decoding or encoding; list
/// edits do not maintain it.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Stable identity, preserved by `Clone`
    pub id: InstrId,
    /// `0` or [`FE_PREFIX`]
    pub prefix: u8,
    /// Opcode byte (second byte for prefixed opcodes)
    pub opcode: u8,
    /// Canonical mnemonic
    pub mnemonic: &'static str,
    /// Shape of the encoded operand
    pub operand_type: OperandType,
    /// Control-flow effect
    pub flow: FlowType,
    /// Decoded operand
    pub operand: Operand,
    /// Derived consumer value of the operand
    pub argument: Argument,
    /// Labels attached to this instruction (branch targets pointing here)
    pub labels: Vec<Label>,
    /// Exception-region markers attached to this instruction
    pub blocks: Vec<ExceptionBlock>,
    /// Byte offset within the stream, as of the last decode or encode
    pub offset: u32,
}

impl Instruction {
    /// Create an instruction from its opcode bytes and operand.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for an opcode byte that is not
    /// defined by ECMA-335.
    pub fn new(prefix: u8, opcode: u8, operand: Operand) -> crate::Result<Self> {
        let Some(spec) = opcodes::lookup(prefix, opcode) else {
            return Err(malformed_error!(
                "Unknown opcode {:#04x} (prefix {:#04x})",
                opcode,
                prefix
            ));
        };

        Ok(Instruction {
            id: InstrId::fresh(),
            prefix,
            opcode,
            mnemonic: spec.mnemonic,
            operand_type: spec.operand,
            flow: spec.flow,
            operand,
            argument: Argument::None,
            labels: Vec::new(),
            blocks: Vec::new(),
            offset: 0,
        })
    }

    /// Create a single-byte instruction without an operand.
    ///
    /// Intended for known-good opcode constants; an undefined byte produces a
    /// placeholder `nop`-shaped entry rather than a panic.
    #[must_use]
    pub fn op(opcode: u8) -> Self {
        Instruction::new(0, opcode, Operand::None).unwrap_or_else(|_| Instruction::nop())
    }

    /// Create a `nop`.
    #[must_use]
    pub fn nop() -> Self {
        Instruction {
            id: InstrId::fresh(),
            prefix: 0,
            opcode: opcodes::NOP,
            mnemonic: "nop",
            operand_type: OperandType::None,
            flow: FlowType::Sequential,
            operand: Operand::None,
            argument: Argument::None,
            labels: Vec::new(),
            blocks: Vec::new(),
            offset: 0,
        }
    }

    /// Create a single-byte instruction with a token operand.
    #[must_use]
    pub fn with_token(opcode: u8, token: Token) -> Self {
        Instruction::new(0, opcode, Operand::Token(token)).unwrap_or_else(|_| Instruction::nop())
    }

    /// Create a branch instruction targeting `label`. Always uses the long
    /// form; the encoder keeps it as is.
    #[must_use]
    pub fn branch(opcode: u8, label: Label) -> Self {
        let long = opcodes::long_branch_form(opcode).unwrap_or(opcode);
        Instruction::new(0, long, Operand::Label(label)).unwrap_or_else(|_| Instruction::nop())
    }

    /// Load a 32-bit constant, using the shortest encoding.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        match value {
            -1 => Instruction::op(opcodes::LDC_I4_M1),
            0..=8 => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Instruction::op(opcodes::LDC_I4_0 + value as u8)
            }
            -128..=127 =>
            {
                #[allow(clippy::cast_possible_truncation)]
                Instruction::new(
                    0,
                    opcodes::LDC_I4_S,
                    Operand::Immediate(Immediate::Int8(value as i8)),
                )
                .unwrap_or_else(|_| Instruction::nop())
            }
            _ => Instruction::new(
                0,
                opcodes::LDC_I4,
                Operand::Immediate(Immediate::Int32(value)),
            )
            .unwrap_or_else(|_| Instruction::nop()),
        }
    }

    /// Load local `slot`, using the shortest encoding.
    #[must_use]
    pub fn load_local(slot: u16) -> Self {
        Instruction::var_access(
            slot,
            opcodes::LDLOC_0,
            Some(opcodes::LDLOC_S),
            opcodes::FE_LDLOC,
        )
    }

    /// Store into local `slot`, using the shortest encoding.
    #[must_use]
    pub fn store_local(slot: u16) -> Self {
        Instruction::var_access(
            slot,
            opcodes::STLOC_0,
            Some(opcodes::STLOC_S),
            opcodes::FE_STLOC,
        )
    }

    /// Load the address of local `slot`.
    #[must_use]
    pub fn load_local_addr(slot: u16) -> Self {
        if let Ok(slot8) = u8::try_from(slot) {
            Instruction::new(
                0,
                opcodes::LDLOCA_S,
                Operand::Immediate(Immediate::UInt8(slot8)),
            )
            .unwrap_or_else(|_| Instruction::nop())
        } else {
            Instruction::new(
                FE_PREFIX,
                opcodes::FE_LDLOCA,
                Operand::Immediate(Immediate::UInt16(slot)),
            )
            .unwrap_or_else(|_| Instruction::nop())
        }
    }

    /// Load argument `slot`, using the shortest encoding.
    #[must_use]
    pub fn load_arg(slot: u16) -> Self {
        Instruction::var_access(
            slot,
            opcodes::LDARG_0,
            Some(opcodes::LDARG_S),
            opcodes::FE_LDARG,
        )
    }

    /// Load the address of argument `slot`.
    #[must_use]
    pub fn load_arg_addr(slot: u16) -> Self {
        if let Ok(slot8) = u8::try_from(slot) {
            Instruction::new(
                0,
                opcodes::LDARGA_S,
                Operand::Immediate(Immediate::UInt8(slot8)),
            )
            .unwrap_or_else(|_| Instruction::nop())
        } else {
            Instruction::new(
                FE_PREFIX,
                opcodes::FE_LDARGA,
                Operand::Immediate(Immediate::UInt16(slot)),
            )
            .unwrap_or_else(|_| Instruction::nop())
        }
    }

    /// Store into argument `slot`, using the shortest encoding.
    #[must_use]
    pub fn store_arg(slot: u16) -> Self {
        if let Ok(slot8) = u8::try_from(slot) {
            Instruction::new(
                0,
                opcodes::STARG_S,
                Operand::Immediate(Immediate::UInt8(slot8)),
            )
            .unwrap_or_else(|_| Instruction::nop())
        } else {
            Instruction::new(
                FE_PREFIX,
                opcodes::FE_STARG,
                Operand::Immediate(Immediate::UInt16(slot)),
            )
            .unwrap_or_else(|_| Instruction::nop())
        }
    }

    fn var_access(slot: u16, shorthand_base: u8, short_form: Option<u8>, long_form: u8) -> Self {
        if slot < 4 {
            #[allow(clippy::cast_possible_truncation)]
            return Instruction::op(shorthand_base + slot as u8);
        }
        if let (Some(short), Ok(slot8)) = (short_form, u8::try_from(slot)) {
            return Instruction::new(0, short, Operand::Immediate(Immediate::UInt8(slot8)))
                .unwrap_or_else(|_| Instruction::nop());
        }
        Instruction::new(
            FE_PREFIX,
            long_form,
            Operand::Immediate(Immediate::UInt16(slot)),
        )
        .unwrap_or_else(|_| Instruction::nop())
    }

    /// Encoded size in bytes: opcode byte(s) plus operand.
    #[must_use]
    pub fn size(&self) -> u32 {
        let opcode_len: u32 = if self.prefix == FE_PREFIX { 2 } else { 1 };

        let operand_len: u32 = match &self.operand {
            Operand::Switch(targets) => 4 + 4 * u32::try_from(targets.len()).unwrap_or(u32::MAX / 4),
            Operand::SwitchLabels(targets) => {
                4 + 4 * u32::try_from(targets.len()).unwrap_or(u32::MAX / 4)
            }
            _ => match self.operand_type.size() {
                Some(n) => u32::try_from(n).unwrap_or(0),
                // A switch shape with a non-switch operand cannot be encoded;
                // the encoder rejects it before sizes matter.
                Option::None => 4,
            },
        };

        opcode_len + operand_len
    }

    /// `true` when the operand is a branch displacement, target or label.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.flow.is_branch()
    }

    /// `true` for a short-form branch that may need widening before encoding.
    #[must_use]
    pub fn is_short_branch(&self) -> bool {
        self.is_branch() && self.operand_type == OperandType::Int8
    }

    /// Rewrite a short-form branch into its long form in place.
    pub fn widen_branch(&mut self) {
        if let Some(long) = opcodes::long_branch_form(self.opcode) {
            if let Some(spec) = opcodes::lookup(0, long) {
                self.opcode = long;
                self.mnemonic = spec.mnemonic;
                self.operand_type = spec.operand;
            }
        }
    }

    /// The argument-slot access this instruction performs, if any, together
    /// with the slot index. Recognizes the shorthand forms.
    #[must_use]
    pub fn arg_access(&self) -> Option<(ArgAccess, u16)> {
        if self.prefix == FE_PREFIX {
            let index = match &self.operand {
                Operand::Immediate(imm) => imm.as_index()?,
                _ => return Option::None,
            };
            return match self.opcode {
                opcodes::FE_LDARG => Some((ArgAccess::Load, index)),
                opcodes::FE_LDARGA => Some((ArgAccess::LoadAddr, index)),
                opcodes::FE_STARG => Some((ArgAccess::Store, index)),
                _ => Option::None,
            };
        }

        match self.opcode {
            opcodes::LDARG_0..=opcodes::LDARG_3 => {
                Some((ArgAccess::Load, u16::from(self.opcode - opcodes::LDARG_0)))
            }
            opcodes::LDARG_S => {
                let index = self.immediate_index()?;
                Some((ArgAccess::Load, index))
            }
            opcodes::LDARGA_S => {
                let index = self.immediate_index()?;
                Some((ArgAccess::LoadAddr, index))
            }
            opcodes::STARG_S => {
                let index = self.immediate_index()?;
                Some((ArgAccess::Store, index))
            }
            _ => Option::None,
        }
    }

    fn immediate_index(&self) -> Option<u16> {
        match &self.operand {
            Operand::Immediate(imm) => imm.as_index(),
            _ => Option::None,
        }
    }

    /// Attach a label to this instruction.
    pub fn attach_label(&mut self, label: Label) {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
    }

    /// Attach an exception-region marker to this instruction.
    pub fn attach_block(&mut self, block: ExceptionBlock) {
        self.blocks.push(block);
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.mnemonic)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(imm) => write!(f, " {imm:?}"),
            Operand::Token(token) => match &self.argument {
                Argument::String(s) => write!(f, " \"{s}\""),
                Argument::Member(m) => write!(f, " {}", m.name),
                Argument::None => write!(f, " {token}"),
            },
            Operand::Target(index) => write!(f, " -> [{index}]"),
            Operand::Label(label) => write!(f, " -> {label:?}"),
            Operand::Switch(targets) => write!(f, " {targets:?}"),
            Operand::SwitchLabels(targets) => write!(f, " {targets:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_preserves_id() {
        let instr = Instruction::op(opcodes::DUP);
        let copy = instr.clone();
        assert_eq!(instr.id, copy.id);

        let fresh = Instruction::op(opcodes::DUP);
        assert_ne!(instr.id, fresh.id);
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        assert!(Instruction::new(0, 0x24, Operand::None).is_err());
        assert!(Instruction::new(FE_PREFIX, 0xFF, Operand::None).is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!(Instruction::op(opcodes::NOP).size(), 1);
        assert_eq!(Instruction::op(opcodes::RET).size(), 1);
        assert_eq!(
            Instruction::with_token(opcodes::CALL, Token::new(0x0A00_0001)).size(),
            5
        );
        assert_eq!(
            Instruction::new(FE_PREFIX, opcodes::FE_CEQ, Operand::None)
                .unwrap()
                .size(),
            2
        );

        let switch = Instruction::new(0, opcodes::SWITCH, Operand::Switch(vec![1, 2, 3])).unwrap();
        assert_eq!(switch.size(), 1 + 4 + 12);
    }

    #[test]
    fn ldc_shortest_forms() {
        assert_eq!(Instruction::ldc_i4(0).opcode, opcodes::LDC_I4_0);
        assert_eq!(Instruction::ldc_i4(8).opcode, opcodes::LDC_I4_8);
        assert_eq!(Instruction::ldc_i4(-1).opcode, opcodes::LDC_I4_M1);
        assert_eq!(Instruction::ldc_i4(100).opcode, opcodes::LDC_I4_S);
        assert_eq!(Instruction::ldc_i4(1000).opcode, opcodes::LDC_I4);
    }

    #[test]
    fn local_access_shortest_forms() {
        assert_eq!(Instruction::load_local(2).opcode, opcodes::LDLOC_2);
        assert_eq!(Instruction::load_local(4).opcode, opcodes::LDLOC_S);
        assert_eq!(Instruction::load_local(300).prefix, FE_PREFIX);
        assert_eq!(Instruction::store_local(0).opcode, opcodes::STLOC_0);
        assert_eq!(Instruction::load_local_addr(1).opcode, opcodes::LDLOCA_S);
    }

    #[test]
    fn arg_access_recognition() {
        assert_eq!(
            Instruction::load_arg(1).arg_access(),
            Some((ArgAccess::Load, 1))
        );
        assert_eq!(
            Instruction::load_arg(7).arg_access(),
            Some((ArgAccess::Load, 7))
        );
        assert_eq!(
            Instruction::store_arg(2).arg_access(),
            Some((ArgAccess::Store, 2))
        );
        assert_eq!(
            Instruction::load_arg_addr(3).arg_access(),
            Some((ArgAccess::LoadAddr, 3))
        );
        assert_eq!(Instruction::load_local(1).arg_access(), None);
    }

    #[test]
    fn branch_widening() {
        let mut branch = Instruction::new(
            0,
            opcodes::BR_S,
            Operand::Immediate(Immediate::Int8(5)),
        )
        .unwrap();
        assert!(branch.is_short_branch());

        branch.widen_branch();
        assert_eq!(branch.opcode, opcodes::BR);
        assert_eq!(branch.operand_type, OperandType::Int32);
        assert!(!branch.is_short_branch());
    }

    #[test]
    fn labels_deduplicate() {
        let mut gen = LabelGen::new();
        let label = gen.fresh();
        let mut instr = Instruction::nop();

        instr.attach_label(label);
        instr.attach_label(label);
        assert_eq!(instr.labels.len(), 1);

        instr.attach_label(gen.fresh());
        assert_eq!(instr.labels.len(), 2);
    }
}
