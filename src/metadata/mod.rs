//! Function metadata and the trait seams to the owning runtime.
//!
//! # Key Components
//!
//! - [`crate::metadata::Token`] - 32-bit metadata token (table tag + row)
//! - [`crate::metadata::TypeSig`] - minimal type shapes for locals and parameters
//! - [`crate::metadata::FunctionId`] / [`crate::metadata::FunctionSig`] /
//!   [`crate::metadata::FunctionBody`] - what the pipeline knows about a target
//! - [`crate::metadata::SymbolResolver`], [`crate::metadata::CodeGenerator`],
//!   [`crate::metadata::PatchStateStore`] - collaborator traits

mod function;
mod resolver;
pub mod token;
mod typesig;

pub use function::{ExceptionClause, ExceptionClauseFlags, FunctionBody, FunctionId, FunctionSig};
pub use resolver::{CodeGenerator, MemberHandle, PatchStateStore, SymbolResolver};
pub use token::Token;
pub use typesig::TypeSig;
