//! The Binary SpacetimeDB Algebraic Type Notation.
//!
//! BSATN is a compact, non-self-describing encoding: scalars are fixed-width
//! little-endian, strings and arrays carry a `u32` element count, sums are a
//! one-byte tag followed by the variant payload, and products are the plain
//! concatenation of their fields. Because the format is not self-describing,
//! decoding is always directed by an [`AlgebraicType`].

use crate::algebraic_type::{AlgebraicType, ProductType};
use crate::algebraic_value::{AlgebraicValue, ProductValue, SumValue};
use crate::identity::{ConnectionId, Identity};
use crate::timestamp::{TimeDuration, Timestamp};
use ethnum::{i256, u256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer has no room to decode {ty}: needed {needed} bytes, {remaining} remaining")]
    BufferLength {
        ty: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("unknown tag {tag:#x} while decoding sum type {sum}")]
    InvalidTag { tag: u8, sum: String },
    #[error("invalid bool byte {byte:#x}")]
    InvalidBool { byte: u8 },
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("{remaining} trailing bytes left after decoding {ty}")]
    TrailingBytes { ty: &'static str, remaining: usize },
}

/// A cursor over a byte slice being decoded.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Byte offset of the cursor from the start of the buffer.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The sub-slice spanning `[start, self.pos())`.
    ///
    /// Lets callers recover the exact bytes a decode consumed, which is how
    /// rows without a primary key derive their cache key.
    pub fn consumed_since(&self, start: usize) -> &'a [u8] {
        &self.buf[start..self.pos]
    }

    pub fn get_slice(&mut self, len: usize, ty: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::BufferLength {
                ty,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.get_slice(1, "u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.get_slice(2, "u16")?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.get_slice(4, "u32")?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.get_slice(8, "u64")?.try_into().unwrap()))
    }

    pub fn get_u128(&mut self) -> Result<u128, DecodeError> {
        Ok(u128::from_le_bytes(self.get_slice(16, "u128")?.try_into().unwrap()))
    }

    pub fn get_u256(&mut self) -> Result<u256, DecodeError> {
        Ok(u256::from_le_bytes(self.get_slice(32, "u256")?.try_into().unwrap()))
    }

    pub fn get_i8(&mut self) -> Result<i8, DecodeError> {
        self.get_u8().map(|b| b as i8)
    }

    pub fn get_i16(&mut self) -> Result<i16, DecodeError> {
        self.get_u16().map(|v| v as i16)
    }

    pub fn get_i32(&mut self) -> Result<i32, DecodeError> {
        self.get_u32().map(|v| v as i32)
    }

    pub fn get_i64(&mut self) -> Result<i64, DecodeError> {
        self.get_u64().map(|v| v as i64)
    }

    pub fn get_i128(&mut self) -> Result<i128, DecodeError> {
        self.get_u128().map(|v| v as i128)
    }

    pub fn get_i256(&mut self) -> Result<i256, DecodeError> {
        Ok(i256::from_le_bytes(self.get_slice(32, "i256")?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self) -> Result<bool, DecodeError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            byte => Err(DecodeError::InvalidBool { byte }),
        }
    }

    /// A `u32` element count, widened for use as a length.
    pub fn get_len(&mut self) -> Result<usize, DecodeError> {
        Ok(self.get_u32()? as usize)
    }

    pub fn get_str(&mut self) -> Result<Box<str>, DecodeError> {
        let len = self.get_len()?;
        let bytes = self.get_slice(len, "string")?;
        std::str::from_utf8(bytes)
            .map(Into::into)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn get_identity(&mut self) -> Result<Identity, DecodeError> {
        self.get_u256().map(Identity::from_u256)
    }

    pub fn get_connection_id(&mut self) -> Result<ConnectionId, DecodeError> {
        self.get_u128().map(ConnectionId::from_u128)
    }

    pub fn get_byte_array(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.get_len()?;
        Ok(self.get_slice(len, "byte array")?.to_vec())
    }
}

// Writer-side helpers. Encoding is infallible, so the writer is a bare
// `Vec<u8>` plus these free functions.

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u128(buf: &mut Vec<u8>, v: u128) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u256(buf: &mut Vec<u8>, v: u256) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

pub fn put_len(buf: &mut Vec<u8>, len: usize) {
    put_u32(buf, len as u32);
}

pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

pub fn put_byte_array(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_len(buf, bytes.len());
    buf.extend_from_slice(bytes);
}

impl AlgebraicValue {
    /// Append the BSATN encoding of `self` to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            AlgebraicValue::Bool(v) => put_bool(buf, *v),
            AlgebraicValue::I8(v) => put_u8(buf, *v as u8),
            AlgebraicValue::U8(v) => put_u8(buf, *v),
            AlgebraicValue::I16(v) => put_u16(buf, *v as u16),
            AlgebraicValue::U16(v) => put_u16(buf, *v),
            AlgebraicValue::I32(v) => put_u32(buf, *v as u32),
            AlgebraicValue::U32(v) => put_u32(buf, *v),
            AlgebraicValue::I64(v) => put_u64(buf, *v as u64),
            AlgebraicValue::U64(v) => put_u64(buf, *v),
            AlgebraicValue::I128(v) => put_u128(buf, *v as u128),
            AlgebraicValue::U128(v) => put_u128(buf, *v),
            AlgebraicValue::I256(v) => buf.extend_from_slice(&v.to_le_bytes()),
            AlgebraicValue::U256(v) => put_u256(buf, *v),
            AlgebraicValue::F32(v) => put_u32(buf, v.to_bits()),
            AlgebraicValue::F64(v) => put_u64(buf, v.to_bits()),
            AlgebraicValue::String(s) => put_str(buf, s),
            AlgebraicValue::Array(elems) => {
                put_len(buf, elems.len());
                for elem in elems {
                    elem.encode(buf);
                }
            }
            AlgebraicValue::OptionSome(inner) => {
                put_u8(buf, 0);
                inner.encode(buf);
            }
            AlgebraicValue::OptionNone => put_u8(buf, 1),
            AlgebraicValue::Product(p) => p.encode(buf),
            AlgebraicValue::Sum(sum) => {
                put_u8(buf, sum.tag);
                sum.value.encode(buf);
            }
            AlgebraicValue::Identity(id) => buf.extend_from_slice(&id.to_le_byte_array()),
            AlgebraicValue::ConnectionId(id) => put_u128(buf, id.as_u128()),
            AlgebraicValue::Timestamp(t) => put_i64(buf, t.microseconds),
            AlgebraicValue::TimeDuration(d) => put_i64(buf, d.microseconds),
        }
    }

    /// Decode one value of type `ty` from `reader`.
    pub fn decode(ty: &AlgebraicType, reader: &mut Reader<'_>) -> Result<AlgebraicValue, DecodeError> {
        Ok(match ty {
            AlgebraicType::Bool => AlgebraicValue::Bool(reader.get_bool()?),
            AlgebraicType::I8 => AlgebraicValue::I8(reader.get_i8()?),
            AlgebraicType::U8 => AlgebraicValue::U8(reader.get_u8()?),
            AlgebraicType::I16 => AlgebraicValue::I16(reader.get_i16()?),
            AlgebraicType::U16 => AlgebraicValue::U16(reader.get_u16()?),
            AlgebraicType::I32 => AlgebraicValue::I32(reader.get_i32()?),
            AlgebraicType::U32 => AlgebraicValue::U32(reader.get_u32()?),
            AlgebraicType::I64 => AlgebraicValue::I64(reader.get_i64()?),
            AlgebraicType::U64 => AlgebraicValue::U64(reader.get_u64()?),
            AlgebraicType::I128 => AlgebraicValue::I128(reader.get_i128()?),
            AlgebraicType::U128 => AlgebraicValue::U128(reader.get_u128()?),
            AlgebraicType::I256 => AlgebraicValue::I256(reader.get_i256()?),
            AlgebraicType::U256 => AlgebraicValue::U256(reader.get_u256()?),
            AlgebraicType::F32 => AlgebraicValue::F32(f32::from_bits(reader.get_u32()?)),
            AlgebraicType::F64 => AlgebraicValue::F64(f64::from_bits(reader.get_u64()?)),
            AlgebraicType::String => AlgebraicValue::String(reader.get_str()?),
            AlgebraicType::Array(elem_ty) => {
                let len = reader.get_len()?;
                let mut elems = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    elems.push(AlgebraicValue::decode(elem_ty, reader)?);
                }
                AlgebraicValue::Array(elems)
            }
            AlgebraicType::Option(inner) => match reader.get_u8()? {
                0 => AlgebraicValue::OptionSome(Box::new(AlgebraicValue::decode(inner, reader)?)),
                1 => AlgebraicValue::OptionNone,
                tag => {
                    return Err(DecodeError::InvalidTag {
                        tag,
                        sum: "option".into(),
                    });
                }
            },
            AlgebraicType::Product(product) => AlgebraicValue::Product(ProductValue::decode(product, reader)?),
            AlgebraicType::Sum(sum) => {
                let tag = reader.get_u8()?;
                let variant = sum.variants.get(tag as usize).ok_or_else(|| DecodeError::InvalidTag {
                    tag,
                    sum: format!("{sum:?}"),
                })?;
                let value = AlgebraicValue::decode(&variant.algebraic_type, reader)?;
                AlgebraicValue::Sum(SumValue {
                    tag,
                    value: Box::new(value),
                })
            }
            AlgebraicType::Identity => AlgebraicValue::Identity(reader.get_identity()?),
            AlgebraicType::ConnectionId => AlgebraicValue::ConnectionId(reader.get_connection_id()?),
            AlgebraicType::Timestamp => AlgebraicValue::Timestamp(Timestamp::from_micros(reader.get_i64()?)),
            AlgebraicType::TimeDuration => AlgebraicValue::TimeDuration(TimeDuration::from_micros(reader.get_i64()?)),
        })
    }
}

impl ProductValue {
    /// Append the BSATN encoding of `self` to `buf`.
    ///
    /// Products have no header; fields are simply concatenated.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        for elem in &self.elements {
            elem.encode(buf);
        }
    }

    /// Decode an instance of `ty` from `reader`.
    pub fn decode(ty: &ProductType, reader: &mut Reader<'_>) -> Result<ProductValue, DecodeError> {
        let mut elements = Vec::with_capacity(ty.elements.len());
        for elem_ty in &ty.elements {
            elements.push(AlgebraicValue::decode(&elem_ty.algebraic_type, reader)?);
        }
        Ok(ProductValue { elements })
    }

    /// Decode an instance of `ty` from the entirety of `bytes`,
    /// rejecting trailing garbage.
    pub fn decode_exact(ty: &ProductType, bytes: &[u8]) -> Result<ProductValue, DecodeError> {
        let mut reader = Reader::new(bytes);
        let row = ProductValue::decode(ty, &mut reader)?;
        if reader.remaining() != 0 {
            return Err(DecodeError::TrailingBytes {
                ty: "product",
                remaining: reader.remaining(),
            });
        }
        Ok(row)
    }
}

/// Encode `value` into a fresh buffer.
pub fn to_vec(value: &AlgebraicValue) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebraic_type::ProductType;
    use pretty_assertions::assert_eq;

    #[test]
    fn scalars_are_little_endian() {
        assert_eq!(to_vec(&AlgebraicValue::U32(0x0403_0201)), [1, 2, 3, 4]);
        assert_eq!(to_vec(&AlgebraicValue::I16(-2)), [0xfe, 0xff]);
        assert_eq!(to_vec(&AlgebraicValue::Bool(true)), [1]);
    }

    #[test]
    fn string_has_u32_length_prefix() {
        assert_eq!(to_vec(&AlgebraicValue::String("hi".into())), [2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn sum_is_tag_then_payload() {
        let v = AlgebraicValue::Sum(SumValue {
            tag: 1,
            value: Box::new(AlgebraicValue::U8(7)),
        });
        assert_eq!(to_vec(&v), [1, 7]);
    }

    #[test]
    fn decode_rejects_bad_bool() {
        let err = AlgebraicValue::decode(&AlgebraicType::Bool, &mut Reader::new(&[2])).unwrap_err();
        assert_eq!(err, DecodeError::InvalidBool { byte: 2 });
    }

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let ty = ProductType::new([("x", AlgebraicType::U8)]);
        let err = ProductValue::decode_exact(&ty, &[1, 2]).unwrap_err();
        assert!(matches!(err, DecodeError::TrailingBytes { remaining: 1, .. }));
    }

    #[test]
    fn truncated_buffer_reports_needed_bytes() {
        let err = AlgebraicValue::decode(&AlgebraicType::U64, &mut Reader::new(&[0; 3])).unwrap_err();
        assert_eq!(
            err,
            DecodeError::BufferLength {
                ty: "u64",
                needed: 8,
                remaining: 3
            }
        );
    }
}
