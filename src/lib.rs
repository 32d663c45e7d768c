#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # cilhook
//!
//! A runtime method-patching library for CIL (Common Intermediate Language)
//! programs. `cilhook` decodes the bytecode of a compiled function, runs it
//! through registered rewrite passes, weaves prefix, postfix and finalizer
//! hooks around it, and redirects the original native entry point to the
//! synthesized replacement - all without touching the original body.
//!
//! ## Features
//!
//! - **Full CIL decode/encode** - Table-driven instruction decoding with
//!   branch lifting, exception-region markers and short-form re-compaction
//! - **Composable patches** - Any number of owners can stack prefixes,
//!   postfixes, finalizers and transpilers on the same function
//! - **Deterministic ordering** - Priorities plus before/after constraints
//!   produce the same patch order on every run
//! - **Exception-safe synthesis** - Finalizers run inside a generated
//!   try/catch; fault handlers are lowered to catch/finally form
//! - **Native redirection** - Entry points are overwritten with an absolute
//!   jump; existing jump chains are collapsed rather than stacked
//! - **Embedder-defined backend** - Metadata lookup, code generation and
//!   state storage happen behind traits the host runtime implements
//!
//! ## Quick Start
//!
//! Add `cilhook` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! cilhook = "0.1"
//! ```
//!
//! Building and encoding an instruction stream directly:
//!
//! ```rust
//! use cilhook::assembly::{encoder::encode_body, opcodes, Instruction};
//!
//! let mut code = vec![Instruction::ldc_i4(100), Instruction::op(opcodes::RET)];
//! let body = encode_body(&mut code, Vec::new(), 1)?;
//!
//! assert_eq!(body.code, vec![opcodes::LDC_I4_S, 100, opcodes::RET]);
//! # Ok::<(), cilhook::Error>(())
//! ```
//!
//! Registering patches against a function:
//!
//! ```rust
//! use cilhook::metadata::{Token, TypeSig};
//! use cilhook::patch::{
//!     HookMethod, HookParam, ParamBinding, PatchDescriptor, PatchRole, PatchSet, Priority,
//! };
//!
//! let prefix = HookMethod {
//!     token: Token::new(0x0600_0042),
//!     params: vec![HookParam::new(ParamBinding::Instance, TypeSig::Object)],
//!     return_type: TypeSig::Boolean, // returning false vetoes the original
//! };
//!
//! let mut set = PatchSet::new();
//! set.add(
//!     PatchDescriptor::hook("mod.tracing", 0, PatchRole::Prefix, prefix)
//!         .with_priority(Priority::HIGH),
//! );
//! assert!(!set.is_empty());
//! ```
//!
//! Applying a [`PatchSet`](patch::PatchSet) goes through [`PatchContext`],
//! which drives the whole pipeline: decode, transpile, sort, synthesize,
//! materialize, detour. The context is constructed from the host runtime's
//! [`metadata::SymbolResolver`] and [`metadata::CodeGenerator`]
//! implementations.
//!
//! ## Architecture
//!
//! The pipeline stages map one-to-one onto the top-level modules:
//!
//! 1. [`assembly`] decodes the original body into [`assembly::Instruction`]
//!    values with stable identities, label-based branches and exception
//!    markers, and encodes the synthesized stream back to bytes.
//! 2. [`transpiler`] runs registered [`transpiler::TranspilerPass`] rewrites
//!    over the decoded stream, including passes that view instructions
//!    through a foreign field layout.
//! 3. [`patch`] holds registrations and sorts each role's patches into a
//!    deterministic execution order.
//! 4. [`synthesizer`] weaves the sorted hooks and the transpiled stream into
//!    a replacement body.
//! 5. [`detour`] redirects the original native entry to the materialized
//!    replacement.
//!
//! [`metadata`] carries the vocabulary shared by all stages (tokens, type
//! signatures, function identities) and the traits the embedder implements.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result) with the failure site
//! captured for malformed bytecode:
//!
//! ```rust
//! use cilhook::{assembly::decoder, Error};
//!
//! match decoder::find_instruction(&[], 0x10, false) {
//!     Err(Error::Malformed { message, .. }) => println!("bad stream: {message}"),
//!     other => println!("{other:?}"),
//! }
//! ```

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used
/// types from across the library, allowing for convenient glob imports.
///
/// # Example
///
/// ```rust
/// use cilhook::prelude::*;
///
/// let set = PatchSet::new();
/// assert!(set.is_empty());
/// ```
pub mod prelude;

/// CIL instruction decoding and encoding.
///
/// This module provides the instruction-level substrate the rest of the
/// pipeline works on. It includes:
///
/// - **Instruction Decoding**: Parse CIL opcodes with full operand support
/// - **Branch Lifting**: Replace raw displacements with symbolic labels
/// - **Exception Regions**: Clause tables lifted to begin/end markers on
///   instructions and rebuilt on encode
/// - **Encoding**: Serialize a stream back to bytes, re-compacting branches
///   to their short forms where the displacement allows
///
/// # Key Types
///
/// - [`assembly::Instruction`] - A decoded instruction with a stable identity
/// - [`assembly::Operand`] - Instruction operands (immediates, tokens, labels)
/// - [`assembly::ExceptionBlock`] - A region marker attached to an instruction
/// - [`assembly::FlowType`] - How an instruction affects control flow
///
/// # Main Functions
///
/// - [`assembly::decoder::decode_body`] - Decode a function body
/// - [`assembly::encoder::encode_body`] - Encode a stream back to a body
///
/// # Examples
///
/// ```rust
/// use cilhook::assembly::{opcodes, Instruction};
///
/// let instr = Instruction::ldc_i4(3);
/// assert_eq!(instr.mnemonic, "ldc.i4.3");
/// assert_eq!(instr.opcode, opcodes::LDC_I4_3);
/// ```
pub mod assembly;

/// Redirection of native entry points.
///
/// Pure jump encoding and recognition plus the platform-specific write that
/// installs a jump over a compiled function's first bytes.
///
/// # Key Functions
///
/// - [`detour::encode_jump`] - Encode an absolute jump for this target
/// - [`detour::peek_jump`] - Recognize a jump already sitting at an address
/// - [`detour::install`] - Overwrite an entry point (unsafe)
/// - [`detour::needs_return_buffer`] - Hidden return-pointer calling
///   convention probe
///
/// # Examples
///
/// ```rust
/// use cilhook::detour::{encode_jump, peek_jump, JUMP_SIZE};
///
/// let code = encode_jump(0x1234_5678);
/// assert_eq!(code.len(), JUMP_SIZE);
/// assert_eq!(peek_jump(0x1000, &code), Some(0x1234_5678));
/// ```
pub mod detour;

/// Shared vocabulary and the embedder-facing traits.
///
/// # Key Components
///
/// ## Identity and Types
/// - [`metadata::Token`] - A metadata token (table tag plus row index)
/// - [`metadata::TypeSig`] - The type-signature subset the pipeline consumes
/// - [`metadata::FunctionId`] - Token plus display name of a function
///
/// ## Function Shape
/// - [`metadata::FunctionSig`] - Calling shape: instance flag, parameters,
///   return type
/// - [`metadata::FunctionBody`] - Encoded bytes, locals, exception clauses
/// - [`metadata::ExceptionClause`] - One row of the encoded clause table
///
/// ## Embedder Traits
/// - [`metadata::SymbolResolver`] - Metadata lookup against the host runtime
/// - [`metadata::CodeGenerator`] - Materializes a synthesized body to native
///   code
/// - [`metadata::PatchStateStore`] - Optional persisted patch-state blobs
pub mod metadata;

/// Patch registration, priorities and deterministic ordering.
///
/// # Key Types
///
/// - [`patch::PatchDescriptor`] - One registered patch with its constraints
/// - [`patch::PatchSet`] - Role-separated registrations for one function
/// - [`patch::Priority`] - Ordering weight with named bands
/// - [`patch::PatchSorter`] - Constraint-respecting stable sort
///
/// # Examples
///
/// ```rust
/// use cilhook::patch::Priority;
///
/// assert!(Priority::FIRST > Priority::NORMAL);
/// assert!(Priority::NORMAL > Priority::LAST);
/// ```
pub mod patch;

/// Replacement-body synthesis.
///
/// Weaves sorted prefix, postfix and finalizer hooks around the transpiled
/// original stream and encodes the result.
///
/// # Key Components
///
/// - [`synthesizer::SynthesisConfig`] - Per-run inputs: function identity,
///   signature, sorted hooks, calling-convention flags
/// - [`synthesizer::synthesize`] - The synthesis entry point
/// - [`synthesizer::SynthesizedBody`] - Encoded result plus the map from
///   original instruction identities to emitted offsets
pub mod synthesizer;

/// Instruction-stream rewrite passes.
///
/// # Key Components
///
/// - [`transpiler::TranspilerPass`] - The pass trait; implement `transpile`
///   for canonical passes or `transpile_foreign` with a
///   [`transpiler::FieldMap`] for passes written against a foreign
///   instruction layout
/// - [`transpiler::run_chain`] - Runs every registered pass in sorted order
/// - [`transpiler::shift_arguments`] - Argument-slot shift for hidden
///   return-buffer calling conventions
pub mod transpiler;

mod context;

/// `cilhook` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type
/// is always [`Error`]. Used consistently throughout the crate for all
/// fallible operations.
///
/// # Examples
///
/// ```rust
/// use cilhook::{assembly::Instruction, Result};
///
/// fn first_mnemonic(stream: &[Instruction]) -> Result<&'static str> {
///     stream.first().map(|i| i.mnemonic).ok_or(cilhook::Error::Empty)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `cilhook` Error type
///
/// The main error type for all operations in this crate. Carries the failure
/// site for malformed bytecode, the rejected registration for configuration
/// errors and the faulting address for installation failures.
///
/// # Examples
///
/// ```rust
/// use cilhook::{assembly::decoder, Error};
///
/// match decoder::find_instruction(&[], 0, false) {
///     Err(Error::Malformed { message, .. }) => println!("{message}"),
///     _ => {}
/// }
/// ```
pub use error::Error;

/// The patching pipeline and its per-application outcome.
///
/// [`PatchContext`] is the main entry point: construct it from the host
/// runtime's resolver and code generator, then call
/// [`PatchContext::apply`] with a function identity and a
/// [`PatchSet`](patch::PatchSet).
pub use context::{ApplyOutcome, PatchContext};

/// Provides access to low-level byte parsing utilities.
///
/// The [`Parser`] type is a bounds-checked little-endian cursor used for
/// decoding CIL bytecode.
///
/// # Example
///
/// ```rust
/// use cilhook::Parser;
///
/// let code = [0x2A];
/// let mut parser = Parser::new(&code);
/// assert_eq!(parser.read_le::<u8>()?, 0x2A);
/// # Ok::<(), cilhook::Error>(())
/// ```
pub use file::Parser;
