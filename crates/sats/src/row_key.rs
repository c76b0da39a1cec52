//! Stable, hashable row identities for the client cache.
//!
//! A cached row needs a key that is equal for "the same logical row" across
//! messages. For tables with a primary key, that is the decoded primary-key
//! column, restricted to types with sensible equality (no floats, no
//! aggregates). For tables without one, the row's exact encoded bytes stand in
//! for its identity, lifted through base-64 so the key is a cheap comparable
//! string rather than a byte vector of arbitrary content.

use crate::algebraic_value::AlgebraicValue;
use crate::identity::{ConnectionId, Identity};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ethnum::{i256, u256};
use thiserror::Error;

/// The key under which a row lives in its table's cache.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RowKey {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    I128(i128),
    U128(u128),
    I256(i256),
    U256(u256),
    String(Box<str>),
    Identity(Identity),
    ConnectionId(ConnectionId),
    /// The tag of a payload-free enum variant.
    SimpleEnum(u8),
    /// Base-64 of the row's BSATN encoding, for tables without a primary key.
    RowBytes(Box<str>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("type unusable as a primary key: {value:?}")]
pub struct InvalidKeyType {
    pub value: Box<str>,
}

impl RowKey {
    /// Project a decoded primary-key column into the key domain.
    ///
    /// Admits booleans, all integer widths, strings, `Identity`,
    /// `ConnectionId` and payload-free enums. Anything else in a primary-key
    /// column indicates a module-binding bug.
    pub fn from_primary_key(value: &AlgebraicValue) -> Result<RowKey, InvalidKeyType> {
        Ok(match value {
            AlgebraicValue::Bool(v) => RowKey::Bool(*v),
            AlgebraicValue::I8(v) => RowKey::I8(*v),
            AlgebraicValue::U8(v) => RowKey::U8(*v),
            AlgebraicValue::I16(v) => RowKey::I16(*v),
            AlgebraicValue::U16(v) => RowKey::U16(*v),
            AlgebraicValue::I32(v) => RowKey::I32(*v),
            AlgebraicValue::U32(v) => RowKey::U32(*v),
            AlgebraicValue::I64(v) => RowKey::I64(*v),
            AlgebraicValue::U64(v) => RowKey::U64(*v),
            AlgebraicValue::I128(v) => RowKey::I128(*v),
            AlgebraicValue::U128(v) => RowKey::U128(*v),
            AlgebraicValue::I256(v) => RowKey::I256(*v),
            AlgebraicValue::U256(v) => RowKey::U256(*v),
            AlgebraicValue::String(s) => RowKey::String(s.clone()),
            AlgebraicValue::Identity(id) => RowKey::Identity(*id),
            AlgebraicValue::ConnectionId(id) => RowKey::ConnectionId(*id),
            AlgebraicValue::Sum(sum) if sum.value.as_product().is_some_and(|p| p.elements.is_empty()) => {
                RowKey::SimpleEnum(sum.tag)
            }
            other => {
                return Err(InvalidKeyType {
                    value: format!("{other:?}").into(),
                });
            }
        })
    }

    /// Key a row by its exact encoded bytes.
    pub fn from_row_bytes(bytes: &[u8]) -> RowKey {
        RowKey::RowBytes(BASE64.encode(bytes).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebraic_value::SumValue;

    #[test]
    fn identical_bytes_collide() {
        assert_eq!(RowKey::from_row_bytes(&[1, 2, 3]), RowKey::from_row_bytes(&[1, 2, 3]));
        assert_ne!(RowKey::from_row_bytes(&[1, 2, 3]), RowKey::from_row_bytes(&[1, 2]));
    }

    #[test]
    fn simple_enum_keys_on_tag() {
        let v = AlgebraicValue::Sum(SumValue::simple_enum(2));
        assert_eq!(RowKey::from_primary_key(&v).unwrap(), RowKey::SimpleEnum(2));
    }

    #[test]
    fn payload_carrying_sum_is_rejected() {
        let v = AlgebraicValue::Sum(SumValue {
            tag: 0,
            value: Box::new(AlgebraicValue::U32(9)),
        });
        assert!(RowKey::from_primary_key(&v).is_err());
    }

    #[test]
    fn float_is_rejected() {
        assert!(RowKey::from_primary_key(&AlgebraicValue::F64(1.0)).is_err());
    }
}
