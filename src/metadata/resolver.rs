//! Trait seams to the owning runtime.
//!
//! The pipeline deliberately knows nothing about assemblies, metadata tables
//! or JIT compilation. Everything it needs from the outside world crosses one
//! of three traits:
//!
//! - [`crate::metadata::SymbolResolver`] - signatures, bodies, token
//!   interpretation and stable native entry addresses
//! - [`crate::metadata::CodeGenerator`] - turns a synthesized body into a
//!   callable native entry point
//! - [`crate::metadata::PatchStateStore`] - optional opaque version blobs so
//!   repeated runs can detect an already-installed patch set
//!
//! # Thread Safety
//!
//! All three traits require `Send + Sync`; the context shares them behind
//! `Arc` and may call them from any thread holding the per-function entry.

use std::sync::Arc;

use crate::metadata::function::{FunctionBody, FunctionId, FunctionSig};
use crate::metadata::token::Token;
use crate::metadata::typesig::TypeSig;
use crate::Result;

/// A resolved member reference, the derived value of a token operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberHandle {
    /// The token that was resolved
    pub token: Token,
    /// Fully qualified display name of the member
    pub name: Arc<str>,
}

/// Access to the owning runtime's metadata and compiled code.
///
/// Implementations must hand out *stable* native entry addresses: the address
/// returned by [`SymbolResolver::native_entry`] has to remain the function's
/// real entry point until the process exits (i.e. the implementation forces
/// compilation and pins the result before returning).
pub trait SymbolResolver: Send + Sync {
    /// The calling signature of `id`.
    ///
    /// # Errors
    /// Returns an error if the function is unknown to the runtime.
    fn signature(&self, id: &FunctionId) -> Result<FunctionSig>;

    /// The raw compiled body of `id`. An empty code buffer means the function
    /// has no body available.
    ///
    /// # Errors
    /// Returns an error if the function is unknown to the runtime.
    fn body(&self, id: &FunctionId) -> Result<FunctionBody>;

    /// The string behind a user-string heap token.
    ///
    /// # Errors
    /// Returns an error if the token does not reference a valid string.
    fn user_string(&self, token: Token) -> Result<String>;

    /// The member behind a non-string token operand, if the runtime can name
    /// it. `None` leaves the operand uninterpreted, which is not an error.
    fn member(&self, token: Token) -> Option<MemberHandle>;

    /// The call-stub token to substitute for a function without a body.
    ///
    /// # Errors
    /// Returns an error if no stub can be provided, which makes the empty
    /// body fatal.
    fn extern_stub(&self, id: &FunctionId) -> Result<Token>;

    /// The token to use when boxing a value of type `ty` into the arguments
    /// array. `None` skips boxing for that slot.
    fn boxing_token(&self, ty: &TypeSig) -> Option<Token> {
        ty.token()
    }

    /// The stable native entry address of `id`.
    ///
    /// # Errors
    /// Returns an error if the function cannot be compiled or pinned.
    fn native_entry(&self, id: &FunctionId) -> Result<usize>;
}

/// Materializes a synthesized body into executable code.
pub trait CodeGenerator: Send + Sync {
    /// Compile `body` under the calling signature `sig` and return the native
    /// entry address of the result.
    ///
    /// # Errors
    /// Returns an error if code generation fails; composition aborts and
    /// nothing is installed.
    fn materialize(&self, id: &FunctionId, sig: &FunctionSig, body: &FunctionBody)
        -> Result<usize>;
}

/// Optional persistence of per-function patch-set versions.
///
/// The blob is opaque to this crate: callers serialize whatever identifies
/// their patch-set version, and the context only ever compares blobs for
/// equality to decide whether a function is already patched to that version.
pub trait PatchStateStore: Send + Sync {
    /// The stored blob for `id`, if any.
    fn load(&self, id: &FunctionId) -> Option<Vec<u8>>;

    /// Record `blob` as the installed version for `id`.
    fn store(&self, id: &FunctionId, blob: &[u8]);
}
