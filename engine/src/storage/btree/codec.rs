//! Byte codecs for tree keys and values.

use crate::storage::btree::error::CodecError;

/// Converts values to and from the bytes stored in serialized nodes.
///
/// Fixed-size codecs must always produce exactly `fixed_length()` bytes and
/// reject any other input length when decoding.
pub trait Codec<T> {
    /// Encoded length, if every value encodes to the same number of bytes.
    fn fixed_length(&self) -> Option<usize>;

    fn is_fixed_size(&self) -> bool {
        self.fixed_length().is_some()
    }

    fn serialize(&self, value: &T) -> Vec<u8>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

macro_rules! le_integer_codec {
    ($(#[$meta:meta])* $name:ident, $ty:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Codec<$ty> for $name {
            fn fixed_length(&self) -> Option<usize> {
                Some(std::mem::size_of::<$ty>())
            }

            fn serialize(&self, value: &$ty) -> Vec<u8> {
                value.to_le_bytes().to_vec()
            }

            fn deserialize(&self, bytes: &[u8]) -> Result<$ty, CodecError> {
                let array = bytes.try_into().map_err(|_| CodecError::LengthMismatch {
                    expected: std::mem::size_of::<$ty>(),
                    actual: bytes.len(),
                })?;
                Ok(<$ty>::from_le_bytes(array))
            }
        }
    };
}

le_integer_codec!(
    /// Little-endian `u32`.
    U32Codec,
    u32
);
le_integer_codec!(
    /// Little-endian `i32`.
    I32Codec,
    i32
);
le_integer_codec!(
    /// Little-endian `i64`.
    I64Codec,
    i64
);

/// UTF-8 strings (variable size).
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn fixed_length(&self) -> Option<usize> {
        None
    }

    fn serialize(&self, value: &String) -> Vec<u8> {
        value.as_bytes().to_vec()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}
