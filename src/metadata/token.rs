//! Metadata token type used by instruction operands and hook declarations.

use std::fmt;

/// Tag byte of the user-string heap, the only token table the decoder
/// interprets itself; everything else goes through the resolver.
pub const TABLE_USER_STRING: u8 = 0x70;

/// A metadata token referencing an entry in the owning runtime's tables.
///
/// Tokens are 32-bit values where the high byte (bits 24-31) indicates the
/// table and the low 24 bits indicate the row index within that table. The
/// patching pipeline never walks metadata tables itself; tokens are either
/// handed to the [`crate::metadata::SymbolResolver`] for interpretation or
/// carried through unchanged into the synthesized body.
///
/// # Examples
///
/// ```rust
/// use cilhook::metadata::Token;
///
/// let token = Token::new(0x0600_0001);
/// assert_eq!(token.table(), 0x06);
/// assert_eq!(token.row(), 1);
/// assert!(!token.is_null());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u32);

impl Token {
    /// Create a new token from its raw 32-bit value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// The raw 32-bit token value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table tag, i.e. the high byte of the token.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The row index within the table, i.e. the low 24 bits.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// `true` if the row index is zero, the conventional null reference.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.row() == 0
    }

    /// `true` if this token points into the user-string heap.
    #[must_use]
    pub fn is_user_string(&self) -> bool {
        self.table() == TABLE_USER_STRING
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:#010x})", self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_and_row_split() {
        let token = Token::new(0x0A00_0123);
        assert_eq!(token.table(), 0x0A);
        assert_eq!(token.row(), 0x123);
        assert_eq!(token.value(), 0x0A00_0123);
    }

    #[test]
    fn null_detection() {
        assert!(Token::new(0x0600_0000).is_null());
        assert!(!Token::new(0x0600_0001).is_null());
    }

    #[test]
    fn user_string_table() {
        assert!(Token::new(0x7000_0001).is_user_string());
        assert!(!Token::new(0x0600_0001).is_user_string());
    }

    #[test]
    fn display_format() {
        assert_eq!(Token::new(0x0600_0001).to_string(), "0x06000001");
        assert_eq!(format!("{:?}", Token::new(1)), "Token(0x00000001)");
    }
}
