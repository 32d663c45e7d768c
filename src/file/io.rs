//! Endian-aware primitive reading and writing for instruction streams.
//!
//! Everything a method body contains is little-endian, so this module only
//! carries the little-endian half of the usual pair: bounds-checked reads with
//! offset tracking for the decoder, and `Vec`-appending writes for the encoder.
//!
//! # Key Components
//!
//! - [`crate::file::io::CilIO`] - Trait unifying byte conversion for the primitive types
//! - [`crate::file::io::read_le_at`] - Read a value at an offset, advancing the offset
//! - [`crate::file::io::write_le`] - Append a value to an output buffer
//!
//! # Thread Safety
//!
//! All functions are pure operations over caller-owned buffers and are safe to
//! call concurrently.

use crate::{Error::OutOfBounds, Result};

/// Trait for implementing type-specific safe binary data access.
///
/// Abstracts the conversion between primitive values and their fixed-size
/// little-endian byte representation. Implemented for the integer and
/// floating-point types that occur as instruction operands.
pub trait CilIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]> + AsRef<[u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $len:literal),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io! {
    u8 => 1, i8 => 1,
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4,
    u64 => 8, i64 => 8,
    f32 => 4, f64 => 8,
}

/// Reads a value of type `T` at the given offset, advancing the offset.
///
/// # Arguments
/// * `data` - The buffer to read from
/// * `offset` - Position to read at; advanced past the value on success
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes
/// remain at `offset`.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    if (type_len + *offset) > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..*offset + type_len].try_into() else {
        return Err(OutOfBounds);
    };

    *offset += type_len;

    Ok(T::from_le_bytes(read))
}

/// Appends a value of type `T` to the output buffer in little-endian order.
pub fn write_le<T: CilIO>(out: &mut Vec<u8>, value: T) {
    out.extend_from_slice(value.to_le_bytes().as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_le_at_advances_offset() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00];
        let mut offset = 0;

        let first: u16 = read_le_at(&data, &mut offset).unwrap();
        let second: u16 = read_le_at(&data, &mut offset).unwrap();
        let third: u32 = read_le_at(&data, &mut offset).unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 3);
        assert_eq!(offset, 8);
    }

    #[test]
    fn read_le_at_out_of_bounds() {
        let data = [0x01, 0x02];
        let mut offset = 1;

        assert!(matches!(
            read_le_at::<u32>(&data, &mut offset),
            Err(OutOfBounds)
        ));
        assert_eq!(offset, 1);
    }

    #[test]
    fn write_le_round_trips() {
        let mut out = Vec::new();
        write_le(&mut out, 0x1122_3344_u32);
        write_le(&mut out, -2_i8);

        assert_eq!(out, [0x44, 0x33, 0x22, 0x11, 0xFE]);

        let mut offset = 0;
        assert_eq!(read_le_at::<u32>(&out, &mut offset).unwrap(), 0x1122_3344);
        assert_eq!(read_le_at::<i8>(&out, &mut offset).unwrap(), -2);
    }
}
