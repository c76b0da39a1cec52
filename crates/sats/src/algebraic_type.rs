//! The runtime type model used to drive row decoding.
//!
//! Unlike the server, the client never infers or checks types; it is handed an
//! `AlgebraicType` per table row and per reducer argument list by the
//! generated module bindings and trusts it. The wire format carries no type
//! information, so decoding is always directed by one of these.

use std::fmt;

/// A type in the algebraic type system.
///
/// Scalars are encoded as fixed-width little-endian values, strings and arrays
/// with a `u32` length prefix, sums with a one-byte tag, and products as the
/// concatenation of their fields. See [`crate::bsatn`].
#[derive(Clone, PartialEq, Eq)]
pub enum AlgebraicType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    I128,
    U128,
    I256,
    U256,
    F32,
    F64,
    String,
    /// A homogeneous variable-length array.
    Array(Box<AlgebraicType>),
    /// `Option<T>`, encoded as a sum with tag 0 = some, 1 = none.
    Option(Box<AlgebraicType>),
    Product(ProductType),
    Sum(SumType),
    /// A 256-bit principal identifier. Encoded as 32 bytes, little-endian.
    Identity,
    /// A 128-bit session identifier. Encoded as 16 bytes, little-endian.
    /// The all-zeros value is a sentinel meaning "no connection id".
    ConnectionId,
    /// Microseconds since the Unix epoch, encoded as `i64`.
    Timestamp,
    /// A signed microsecond delta, encoded as `i64`.
    TimeDuration,
}

impl AlgebraicType {
    pub fn option(inner: AlgebraicType) -> Self {
        AlgebraicType::Option(Box::new(inner))
    }

    pub fn array(elem: AlgebraicType) -> Self {
        AlgebraicType::Array(Box::new(elem))
    }

    pub fn product<S: Into<Box<str>>>(elements: impl IntoIterator<Item = (S, AlgebraicType)>) -> Self {
        AlgebraicType::Product(ProductType::new(elements))
    }

    pub fn simple_enum<'a>(variants: impl IntoIterator<Item = &'a str>) -> Self {
        AlgebraicType::Sum(SumType {
            variants: variants
                .into_iter()
                .map(|name| SumTypeVariant {
                    name: name.into(),
                    algebraic_type: AlgebraicType::Product(ProductType::unit()),
                })
                .collect(),
        })
    }

    /// True for sums all of whose variants carry no payload.
    ///
    /// Simple enums are the only sum types admitted as primary keys.
    pub fn is_simple_enum(&self) -> bool {
        match self {
            AlgebraicType::Sum(sum) => sum.variants.iter().all(|v| v.is_unit()),
            _ => false,
        }
    }
}

impl fmt::Debug for AlgebraicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgebraicType::Bool => f.write_str("Bool"),
            AlgebraicType::I8 => f.write_str("I8"),
            AlgebraicType::U8 => f.write_str("U8"),
            AlgebraicType::I16 => f.write_str("I16"),
            AlgebraicType::U16 => f.write_str("U16"),
            AlgebraicType::I32 => f.write_str("I32"),
            AlgebraicType::U32 => f.write_str("U32"),
            AlgebraicType::I64 => f.write_str("I64"),
            AlgebraicType::U64 => f.write_str("U64"),
            AlgebraicType::I128 => f.write_str("I128"),
            AlgebraicType::U128 => f.write_str("U128"),
            AlgebraicType::I256 => f.write_str("I256"),
            AlgebraicType::U256 => f.write_str("U256"),
            AlgebraicType::F32 => f.write_str("F32"),
            AlgebraicType::F64 => f.write_str("F64"),
            AlgebraicType::String => f.write_str("String"),
            AlgebraicType::Array(elem) => write!(f, "Array({elem:?})"),
            AlgebraicType::Option(inner) => write!(f, "Option({inner:?})"),
            AlgebraicType::Product(p) => p.fmt(f),
            AlgebraicType::Sum(s) => s.fmt(f),
            AlgebraicType::Identity => f.write_str("Identity"),
            AlgebraicType::ConnectionId => f.write_str("ConnectionId"),
            AlgebraicType::Timestamp => f.write_str("Timestamp"),
            AlgebraicType::TimeDuration => f.write_str("TimeDuration"),
        }
    }
}

/// A product type: an ordered list of named fields.
///
/// Table row types are always products; the column order here is the order the
/// columns are encoded in on the wire.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ProductType {
    pub elements: Vec<ProductTypeElement>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProductTypeElement {
    pub name: Box<str>,
    pub algebraic_type: AlgebraicType,
}

impl ProductType {
    pub fn new<S: Into<Box<str>>>(elements: impl IntoIterator<Item = (S, AlgebraicType)>) -> Self {
        ProductType {
            elements: elements
                .into_iter()
                .map(|(name, algebraic_type)| ProductTypeElement {
                    name: name.into(),
                    algebraic_type,
                })
                .collect(),
        }
    }

    /// The empty product, i.e. the unit type.
    pub fn unit() -> Self {
        ProductType::default()
    }

    /// Position of the column named `name`, if any.
    pub fn index_of_field(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|elem| &*elem.name == name)
    }
}

/// A sum type: a closed set of named, possibly payload-carrying variants.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SumType {
    pub variants: Vec<SumTypeVariant>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SumTypeVariant {
    pub name: Box<str>,
    pub algebraic_type: AlgebraicType,
}

impl SumTypeVariant {
    /// True if the variant carries no payload.
    pub fn is_unit(&self) -> bool {
        matches!(&self.algebraic_type, AlgebraicType::Product(p) if p.elements.is_empty())
    }
}
