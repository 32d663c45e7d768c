//! Minimal type shapes for locals, parameters and return values.
//!
//! The synthesizer needs just enough type information to allocate local slots,
//! pick default initializers, decide whether a hook parameter can influence the
//! original invocation, and classify value-type returns for the hidden
//! return-buffer convention. [`crate::metadata::TypeSig`] carries exactly that;
//! full signature blobs stay on the resolver side.

use crate::metadata::token::Token;

/// The shape of a local, parameter or return value.
///
/// Value types carry their metadata token and flattened size so the
/// return-buffer classification and boxing support can work without a type
/// system; reference types are opaque beyond their token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSig {
    /// No value, only valid as a return type
    Void,
    /// Boolean, 1 byte on the stack frame
    Boolean,
    /// UTF-16 code unit
    Char,
    /// Signed 8-bit integer
    I1,
    /// Unsigned 8-bit integer
    U1,
    /// Signed 16-bit integer
    I2,
    /// Unsigned 16-bit integer
    U2,
    /// Signed 32-bit integer
    I4,
    /// Unsigned 32-bit integer
    U4,
    /// Signed 64-bit integer
    I8,
    /// Unsigned 64-bit integer
    U8,
    /// 32-bit floating point
    R4,
    /// 64-bit floating point
    R8,
    /// Native-width signed integer
    I,
    /// Native-width unsigned integer
    U,
    /// `System.Object`
    Object,
    /// `System.String`
    String,
    /// A reference type identified by its token
    Class(Token),
    /// A value type with its token and flattened byte size
    ValueType {
        /// Metadata token of the value type definition
        token: Token,
        /// Total size of the flattened instance in bytes
        size: u32,
    },
    /// A managed reference to the inner type
    ByRef(Box<TypeSig>),
}

impl TypeSig {
    /// `true` for [`TypeSig::Void`].
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    /// `true` for [`TypeSig::ByRef`].
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeSig::ByRef(_))
    }

    /// `true` for primitive and user-defined value types, which copy by value
    /// and therefore cannot leak writes back to the caller.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        !matches!(
            self,
            TypeSig::Object | TypeSig::String | TypeSig::Class(_) | TypeSig::ByRef(_)
        )
    }

    /// The referenced type for [`TypeSig::ByRef`], otherwise `self`.
    #[must_use]
    pub fn strip_by_ref(&self) -> &TypeSig {
        match self {
            TypeSig::ByRef(inner) => inner,
            other => other,
        }
    }

    /// The flattened size in bytes for multi-field value-type returns.
    ///
    /// Only [`TypeSig::ValueType`] reports a size; primitives return through
    /// registers on every supported platform and reference types are pointer
    /// sized, so neither participates in return-buffer classification.
    #[must_use]
    pub fn value_size(&self) -> Option<u32> {
        match self {
            TypeSig::ValueType { size, .. } => Some(*size),
            _ => None,
        }
    }

    /// The metadata token for types that carry one.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self {
            TypeSig::Class(token) | TypeSig::ValueType { token, .. } => Some(*token),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_classification() {
        assert!(TypeSig::I4.is_value_type());
        assert!(TypeSig::Boolean.is_value_type());
        assert!(TypeSig::ValueType {
            token: Token::new(0x0200_0001),
            size: 12
        }
        .is_value_type());
        assert!(!TypeSig::Object.is_value_type());
        assert!(!TypeSig::String.is_value_type());
        assert!(!TypeSig::ByRef(Box::new(TypeSig::I4)).is_value_type());
    }

    #[test]
    fn by_ref_stripping() {
        let by_ref = TypeSig::ByRef(Box::new(TypeSig::I8));
        assert!(by_ref.is_by_ref());
        assert_eq!(*by_ref.strip_by_ref(), TypeSig::I8);
        assert_eq!(*TypeSig::I8.strip_by_ref(), TypeSig::I8);
    }

    #[test]
    fn only_value_types_report_sizes() {
        assert_eq!(TypeSig::I4.value_size(), None);
        assert_eq!(TypeSig::Object.value_size(), None);
        assert_eq!(
            TypeSig::ValueType {
                token: Token::new(0x0200_0002),
                size: 6
            }
            .value_size(),
            Some(6)
        );
    }
}
