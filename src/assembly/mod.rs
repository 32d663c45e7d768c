//! Instruction-level machinery: opcode tables, the editable instruction
//! model, and the decoder/encoder pair.
//!
//! # Key Components
//!
//! - [`crate::assembly::opcodes`] - CIL opcode constants and dispatch tables
//! - [`crate::assembly::Instruction`] - editable instruction with labels and
//!   exception-region markers
//! - [`crate::assembly::decoder`] - bytes to the label-lifted stream
//! - [`crate::assembly::encoder`] - the stream back to bytes and clauses

pub mod decoder;
pub mod encoder;
mod instruction;
pub mod opcodes;

pub use instruction::{
    ArgAccess, Argument, ExceptionBlock, ExceptionBlockType, FlowType, Immediate, InstrId,
    Instruction, Label, LabelGen, Operand, OperandType,
};
