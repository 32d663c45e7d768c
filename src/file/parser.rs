//! Low-level byte stream parser for CIL instruction decoding.
//!
//! This module provides the [`crate::file::parser::Parser`] type, a cursor-based binary data
//! parser for reading method body bytes. It offers bounds-checked access to binary data in
//! little-endian format, which is the only byte order that occurs inside an instruction stream.
//!
//! # Architecture
//!
//! The parser is built around a simple cursor-based model that maintains a position within
//! a byte slice:
//!
//! - **Position tracking** - Maintains current offset for sequential parsing operations
//! - **Bounds checking** - All operations validate data availability before reading
//! - **Type-safe reading** - Strongly typed methods for the operand primitive types
//!
//! # Usage Examples
//!
//! ```rust
//! use cilhook::Parser;
//!
//! let data = [0x01, 0x02, 0x03, 0x04];
//! let mut parser = Parser::new(&data);
//!
//! let value = parser.read_le::<u16>()?;
//! assert_eq!(value, 0x0201);
//! # Ok::<(), cilhook::Error>(())
//! ```

use crate::{file::io::read_le_at, file::io::CilIO, Result};

/// A cursor-based reader over a method body's byte stream.
///
/// `Parser` provides bounds-checked sequential and random access over a byte
/// slice. The decoder drives it strictly forward; `seek` exists for callers
/// that need to re-read a region, such as the exception clause walker.
///
/// # Examples
///
/// ```rust,no_run
/// use cilhook::Parser;
///
/// let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
/// let mut parser = Parser::new(&data);
///
/// let first = parser.read_le::<u32>()?;
/// assert_eq!(first, 0x04030201);
///
/// parser.seek(6)?;
/// let last_bytes = parser.read_le::<u16>()?;
/// assert_eq!(last_bytes, 0x0807);
/// # Ok::<(), cilhook::Error>(())
/// ```
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    ///
    /// # Arguments
    /// * `data` - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Returns the current position of the cursor.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Move the current position to the specified index.
    ///
    /// # Arguments
    /// * `pos` - The position to move the cursor to
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if position is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos >= self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by one byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the advance would leave the buffer.
    pub fn advance(&mut self) -> Result<()> {
        if self.position + 1 > self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        self.position += 1;
        Ok(())
    }

    /// Move the position forward by the specified amount of bytes.
    ///
    /// # Arguments
    /// * `count` - The amount of bytes to advance
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the advance would leave the buffer.
    pub fn advance_by(&mut self, count: usize) -> Result<()> {
        if self.position + count > self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        self.position += count;
        Ok(())
    }

    /// Peek at the current byte without advancing the cursor.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the cursor is at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        if self.position >= self.data.len() {
            return Err(crate::Error::OutOfBounds);
        }

        Ok(self.data[self.position])
    }

    /// Read a value of type `T` at the current position, advancing past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()`
    /// bytes remain.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at(self.data, &mut self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.read_le::<u32>().unwrap(), 0x0403_0201);
        assert_eq!(parser.pos(), 4);
        assert_eq!(parser.read_le::<u16>().unwrap(), 0x0605);
        assert!(parser.has_more_data());
        assert_eq!(parser.read_le::<u16>().unwrap(), 0x0807);
        assert!(!parser.has_more_data());
    }

    #[test]
    fn seek_and_peek() {
        let data = [0xAA, 0xBB, 0xCC];
        let mut parser = Parser::new(&data);

        parser.seek(2).unwrap();
        assert_eq!(parser.peek_byte().unwrap(), 0xCC);
        assert_eq!(parser.pos(), 2);

        assert!(parser.seek(3).is_err());
    }

    #[test]
    fn bounds_are_enforced() {
        let data = [0x01];
        let mut parser = Parser::new(&data);

        assert!(parser.read_le::<u32>().is_err());
        assert!(parser.advance_by(2).is_err());

        parser.advance().unwrap();
        assert!(parser.peek_byte().is_err());
        assert!(parser.advance().is_err());
    }

    #[test]
    fn empty_input() {
        let parser = Parser::new(&[]);
        assert!(parser.is_empty());
        assert!(!parser.has_more_data());
        assert_eq!(parser.len(), 0);
    }
}
