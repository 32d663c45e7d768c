//! # cilhook Prelude
//!
//! This module provides a convenient prelude for the most commonly used types
//! and traits from the cilhook library. Import this module to get quick access
//! to the essential types for registering and applying method patches.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilhook operations
pub use crate::Error;

/// The result type used throughout cilhook
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The patching pipeline and its per-application outcome
pub use crate::{ApplyOutcome, PatchContext};

/// Low-level byte parsing utilities
pub use crate::Parser;

// ================================================================================================
// Metadata and Embedder Traits
// ================================================================================================

/// Metadata token type for referencing runtime entities
pub use crate::metadata::Token;

/// Type signatures, function identity and function shape
pub use crate::metadata::{FunctionBody, FunctionId, FunctionSig, TypeSig};

/// Exception clause table rows of an encoded body
pub use crate::metadata::{ExceptionClause, ExceptionClauseFlags};

/// Traits the host runtime implements, and the opaque member handle
pub use crate::metadata::{CodeGenerator, MemberHandle, PatchStateStore, SymbolResolver};

// ================================================================================================
// Instruction Streams
// ================================================================================================

/// A decoded instruction and its stable identity
pub use crate::assembly::{InstrId, Instruction};

/// Instruction operands and control-flow classification
pub use crate::assembly::{Argument, FlowType, Immediate, Operand, OperandType};

/// Symbolic branch targets
pub use crate::assembly::{Label, LabelGen};

/// Exception-region markers attached to instructions
pub use crate::assembly::{ExceptionBlock, ExceptionBlockType};

/// Decoding and encoding of complete function bodies
pub use crate::assembly::{decoder::decode_body, encoder::encode_body};

// ================================================================================================
// Patch Registration and Ordering
// ================================================================================================

/// Patch registration: descriptors, roles and role-separated sets
pub use crate::patch::{PatchDescriptor, PatchImpl, PatchRole, PatchSet};

/// Hook method shape and parameter bindings
pub use crate::patch::{HookMethod, HookParam, ParamBinding};

/// Ordering weight and the constraint-respecting sorter
pub use crate::patch::{PatchSorter, Priority};

// ================================================================================================
// Transpilers
// ================================================================================================

/// The rewrite-pass trait and its per-run context
pub use crate::transpiler::{TranspileContext, TranspilerPass};

/// Foreign instruction layouts for passes written against another shape
pub use crate::transpiler::{CanonicalField, FieldMap, FieldValue, ForeignInstruction};

/// Chain execution and calling-convention argument shifting
pub use crate::transpiler::{run_chain, shift_arguments};

// ================================================================================================
// Synthesis and Redirection
// ================================================================================================

/// Replacement-body synthesis
pub use crate::synthesizer::{synthesize, SynthesisConfig, SynthesizedBody};

/// Native entry-point redirection
pub use crate::detour::{encode_jump, needs_return_buffer, peek_jump, JUMP_SIZE};
