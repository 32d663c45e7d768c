//! Replacement-body synthesis.
//!
//! Takes the sorted hook arrays and the transpiled original stream and
//! produces the encoded replacement body the code generator materializes.
//!
//! # Key Components
//!
//! - [`crate::synthesizer::SynthesisConfig`] / [`crate::synthesizer::LocalTable`] -
//!   per-run inputs and synthesized local slots
//! - [`crate::synthesizer::synthesize`] - the prefix/original/postfix/finalizer
//!   state machine
//! - [`crate::synthesizer::rewrite_fault_blocks`] - fault regions lowered to
//!   catch/finally form before synthesis

mod config;
mod creator;
mod rewriter;

pub use config::{LocalKind, LocalTable, SynthesisConfig};
pub use creator::{synthesize, SynthesizedBody};
pub use rewriter::rewrite_fault_blocks;
