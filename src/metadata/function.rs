//! Function identity, signature and raw body descriptions.
//!
//! These are the inputs the pipeline receives from the resolver: who a
//! function is ([`crate::metadata::FunctionId`]), what it looks like to a
//! caller ([`crate::metadata::FunctionSig`]) and the raw material of its
//! compiled body ([`crate::metadata::FunctionBody`]) including the exception
//! clause table the decoder turns into block markers.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::metadata::token::Token;
use crate::metadata::typesig::TypeSig;

/// Identity of a patchable function.
///
/// Equality and hashing use the metadata token only; the display name exists
/// for diagnostics and error messages.
#[derive(Debug, Clone)]
pub struct FunctionId {
    token: Token,
    name: Arc<str>,
}

impl FunctionId {
    /// Create a new identity from a method token and a display name.
    #[must_use]
    pub fn new(token: Token, name: impl Into<Arc<str>>) -> Self {
        FunctionId {
            token,
            name: name.into(),
        }
    }

    /// The method token.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// The display name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for FunctionId {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for FunctionId {}

impl std::hash::Hash for FunctionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.token)
    }
}

/// Calling signature of a function, as far as synthesis needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSig {
    /// `true` when an implicit `this` occupies argument slot zero
    pub has_this: bool,
    /// Declared parameter types in order, excluding `this`
    pub params: Vec<TypeSig>,
    /// Declared return type
    pub return_type: TypeSig,
}

impl FunctionSig {
    /// Total number of argument slots including the implicit `this`.
    #[must_use]
    pub fn arg_count(&self) -> u16 {
        let this = u16::from(self.has_this);
        #[allow(clippy::cast_possible_truncation)]
        {
            this + self.params.len() as u16
        }
    }

    /// The argument slot of declared parameter `index`, accounting for `this`.
    #[must_use]
    pub fn arg_slot(&self, index: u16) -> u16 {
        index + u16::from(self.has_this)
    }
}

bitflags! {
    /// Flags describing the kind of an exception clause, ECMA-335 II.25.4.6.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionClauseFlags: u32 {
        /// Typed exception handler clause
        const EXCEPTION = 0x0000;
        /// Filter-based exception handler clause
        const FILTER = 0x0001;
        /// Finally clause, runs on every exit
        const FINALLY = 0x0002;
        /// Fault clause, runs only on exceptional exit
        const FAULT = 0x0004;
    }
}

/// One entry of a body's exception clause table, in byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionClause {
    /// Clause kind
    pub flags: ExceptionClauseFlags,
    /// Offset of the first byte of the protected region
    pub try_offset: u32,
    /// Length of the protected region in bytes
    pub try_length: u32,
    /// Offset of the first byte of the handler
    pub handler_offset: u32,
    /// Length of the handler in bytes
    pub handler_length: u32,
    /// Caught exception type for typed clauses
    pub catch_type: Option<Token>,
    /// Offset of the filter expression for filter clauses
    pub filter_offset: u32,
}

impl ExceptionClause {
    /// Offset of the first byte past the protected region.
    #[must_use]
    pub fn try_end(&self) -> u32 {
        self.try_offset + self.try_length
    }

    /// Offset of the first byte past the handler.
    #[must_use]
    pub fn handler_end(&self) -> u32 {
        self.handler_offset + self.handler_length
    }
}

/// The raw compiled body of a function.
///
/// An empty `code` buffer is legal and means the function has no available
/// body (an extern or runtime-provided method); the decoder substitutes a
/// call-through trampoline for it.
#[derive(Debug, Clone, Default)]
pub struct FunctionBody {
    /// The encoded instruction stream
    pub code: Vec<u8>,
    /// Declared local variable types in slot order
    pub locals: Vec<TypeSig>,
    /// Exception clause table
    pub exceptions: Vec<ExceptionClause>,
    /// Declared operand stack depth
    pub max_stack: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_compares_by_token() {
        let a = FunctionId::new(Token::new(0x0600_0001), "Demo::First");
        let b = FunctionId::new(Token::new(0x0600_0001), "renamed");
        let c = FunctionId::new(Token::new(0x0600_0002), "Demo::First");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn arg_slots_account_for_this() {
        let static_sig = FunctionSig {
            has_this: false,
            params: vec![TypeSig::I4, TypeSig::String],
            return_type: TypeSig::Void,
        };
        let instance_sig = FunctionSig {
            has_this: true,
            params: vec![TypeSig::I4],
            return_type: TypeSig::I4,
        };

        assert_eq!(static_sig.arg_count(), 2);
        assert_eq!(static_sig.arg_slot(0), 0);
        assert_eq!(instance_sig.arg_count(), 2);
        assert_eq!(instance_sig.arg_slot(0), 1);
    }

    #[test]
    fn clause_ranges() {
        let clause = ExceptionClause {
            flags: ExceptionClauseFlags::FINALLY,
            try_offset: 4,
            try_length: 10,
            handler_offset: 14,
            handler_length: 6,
            catch_type: None,
            filter_offset: 0,
        };

        assert_eq!(clause.try_end(), 14);
        assert_eq!(clause.handler_end(), 20);
    }
}
