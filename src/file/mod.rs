//! Binary input handling for method body streams.
//!
//! Method bodies arrive as raw byte slices through the resolver seam; this
//! module provides the bounds-checked primitives the decoder and encoder use
//! to read and write them.
//!
//! # Key Components
//!
//! - [`crate::file::parser::Parser`] - Cursor-based reader over a body's bytes
//! - [`crate::file::io`] - Little-endian primitive conversion helpers

pub(crate) mod io;
mod parser;

pub use parser::Parser;
