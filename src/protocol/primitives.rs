//! Primitive wire types.
//!
//! All integers are encoded big-endian ("network byte order"). Strings carry
//! an `Int16` length prefix and UTF-8 payload, byte blobs an `Int32` prefix,
//! arrays an `Int32` element count. A length of `-1` encodes null for the
//! nullable variants.

use std::io::{Read, Write};

#[cfg(test)]
use proptest::prelude::*;

use super::traits::{ReadError, ReadType, WriteError, WriteType};

/// Upper bound for up-front allocations based on untrusted length prefixes.
///
/// Larger claims are still honored, the buffer just grows as bytes actually
/// arrive instead of trusting the prefix.
const PREALLOC_LIMIT: usize = 1024 * 1024;

/// Read exactly `len` bytes without trusting `len` for pre-allocation.
pub(crate) fn read_exact_vec<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, ReadError>
where
    R: Read,
{
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    let read = reader.take(len as u64).read_to_end(&mut buf)?;
    if read != len {
        return Err(ReadError::IO(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        )));
    }
    Ok(buf)
}

/// Represents an integer between `-2^7` and `2^7-1` inclusive.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Int8(pub i8);

/// Represents an integer between `-2^15` and `2^15-1` inclusive.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Int16(pub i16);

/// Represents an integer between `-2^31` and `2^31-1` inclusive.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Int32(pub i32);

/// Represents an integer between `-2^63` and `2^63-1` inclusive.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Int64(pub i64);

macro_rules! impl_int {
    ($t:ty, $inner:ty, $size:expr) => {
        impl<R> ReadType<R> for $t
        where
            R: Read,
        {
            fn read(reader: &mut R) -> Result<Self, ReadError> {
                let mut buf = [0u8; $size];
                reader.read_exact(&mut buf)?;
                Ok(Self(<$inner>::from_be_bytes(buf)))
            }
        }

        impl<W> WriteType<W> for $t
        where
            W: Write,
        {
            fn write(&self, writer: &mut W) -> Result<(), WriteError> {
                writer.write_all(&self.0.to_be_bytes())?;
                Ok(())
            }
        }
    };
}

impl_int!(Int8, i8, 1);
impl_int!(Int16, i16, 2);
impl_int!(Int32, i32, 4);
impl_int!(Int64, i64, 8);

/// Represents a sequence of characters.
///
/// First the length N is given as an INT16, then N bytes of UTF-8 follow.
/// The length must not be negative.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct String_(pub String);

impl<R> ReadType<R> for String_
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = Int16::read(reader)?;
        let len = usize::try_from(len.0).map_err(|e| ReadError::Malformed(Box::new(e)))?;
        let buf = read_exact_vec(reader, len)?;
        let s = String::from_utf8(buf).map_err(|e| ReadError::Malformed(Box::new(e)))?;
        Ok(Self(s))
    }
}

impl<W> WriteType<W> for String_
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        let len = i16::try_from(self.0.len()).map_err(WriteError::Overflow)?;
        Int16(len).write(writer)?;
        writer.write_all(self.0.as_bytes())?;
        Ok(())
    }
}

/// Represents a sequence of characters or null.
///
/// A null value is encoded with length of -1 and there are no following bytes.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct NullableString(pub Option<String>);

impl<R> ReadType<R> for NullableString
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = Int16::read(reader)?;
        match len.0 {
            l if l < -1 => Err(ReadError::Malformed(
                format!("Invalid negative length for nullable string: {l}").into(),
            )),
            -1 => Ok(Self(None)),
            l => {
                let buf = read_exact_vec(reader, l as usize)?;
                let s = String::from_utf8(buf).map_err(|e| ReadError::Malformed(Box::new(e)))?;
                Ok(Self(Some(s)))
            }
        }
    }
}

impl<W> WriteType<W> for NullableString
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match &self.0 {
            Some(s) => {
                let len = i16::try_from(s.len()).map_err(WriteError::Overflow)?;
                Int16(len).write(writer)?;
                writer.write_all(s.as_bytes())?;
                Ok(())
            }
            None => Int16(-1).write(writer),
        }
    }
}

/// Represents a raw sequence of bytes or null.
///
/// For non-null values, first the length N is given as an INT32, then N bytes
/// follow. A null value is encoded with length of -1.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct NullableBytes(pub Option<Vec<u8>>);

impl<R> ReadType<R> for NullableBytes
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = Int32::read(reader)?;
        match len.0 {
            l if l < -1 => Err(ReadError::Malformed(
                format!("Invalid negative length for nullable bytes: {l}").into(),
            )),
            -1 => Ok(Self(None)),
            l => Ok(Self(Some(read_exact_vec(reader, l as usize)?))),
        }
    }
}

impl<W> WriteType<W> for NullableBytes
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match &self.0 {
            Some(b) => {
                let len = i32::try_from(b.len()).map_err(WriteError::Overflow)?;
                Int32(len).write(writer)?;
                writer.write_all(b)?;
                Ok(())
            }
            None => Int32(-1).write(writer),
        }
    }
}

/// Represents a sequence of objects of a given type T.
///
/// First the length N is given as an INT32, then N instances of T follow. A
/// null array is represented with a length of -1.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Array<T>(pub Option<Vec<T>>);

impl<R, T> ReadType<R> for Array<T>
where
    R: Read,
    T: ReadType<R>,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = Int32::read(reader)?;
        match len.0 {
            l if l < -1 => Err(ReadError::Malformed(
                format!("Invalid negative length for array: {l}").into(),
            )),
            -1 => Ok(Self(None)),
            l => {
                let len = l as usize;
                let mut res = Vec::with_capacity(len.min(PREALLOC_LIMIT / 16));
                for _ in 0..len {
                    res.push(T::read(reader)?);
                }
                Ok(Self(Some(res)))
            }
        }
    }
}

impl<W, T> WriteType<W> for Array<T>
where
    W: Write,
    T: WriteType<W>,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match &self.0 {
            None => Int32(-1).write(writer),
            Some(inner) => {
                let len = i32::try_from(inner.len()).map_err(WriteError::Overflow)?;
                Int32(len).write(writer)?;

                for element in inner {
                    element.write(writer)?;
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::protocol::test_utils::test_roundtrip;

    use super::*;

    use assert_matches::assert_matches;

    test_roundtrip!(Int8, test_int8_roundtrip);

    test_roundtrip!(Int16, test_int16_roundtrip);

    test_roundtrip!(Int32, test_int32_roundtrip);

    test_roundtrip!(Int64, test_int64_roundtrip);

    test_roundtrip!(String_, test_string_roundtrip);

    test_roundtrip!(NullableString, test_nullable_string_roundtrip);

    test_roundtrip!(NullableBytes, test_nullable_bytes_roundtrip);

    test_roundtrip!(Array<Int32>, test_array_roundtrip);

    #[test]
    fn test_nullable_string_read_negative_length() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        Int16(-2).write(&mut buf).unwrap();
        buf.set_position(0);

        let err = NullableString::read(&mut buf).unwrap_err();
        assert_matches!(err, ReadError::Malformed(_));
        assert_eq!(
            err.to_string(),
            "Malformed data: Invalid negative length for nullable string: -2"
        );
    }

    #[test]
    fn test_nullable_bytes_read_negative_length() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        Int32(-2).write(&mut buf).unwrap();
        buf.set_position(0);

        let err = NullableBytes::read(&mut buf).unwrap_err();
        assert_matches!(err, ReadError::Malformed(_));
        assert_eq!(
            err.to_string(),
            "Malformed data: Invalid negative length for nullable bytes: -2"
        );
    }

    #[test]
    fn test_huge_length_prefix_does_not_allocate() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        Int32(i32::MAX).write(&mut buf).unwrap();
        buf.set_position(0);

        let err = NullableBytes::read(&mut buf).unwrap_err();
        assert_matches!(err, ReadError::IO(_));
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        Int16(2).write(&mut buf).unwrap();
        buf.get_mut().extend_from_slice(&[0xff, 0xfe]);
        buf.set_position(0);

        let err = String_::read(&mut buf).unwrap_err();
        assert_matches!(err, ReadError::Malformed(_));
    }
}
