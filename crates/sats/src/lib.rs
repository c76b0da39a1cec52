//! Client-side subset of the Spacetime Algebraic Type System.
//!
//! The server describes every table row and reducer argument list with an
//! [`AlgebraicType`]. Clients receive those descriptions from generated module
//! bindings and use them to drive BSATN decoding of the raw row bytes carried
//! by the WebSocket protocol. This crate holds the runtime type model, the
//! dynamically-typed [`AlgebraicValue`] tree, the BSATN reader/writer, and the
//! small special-purpose types (`Identity`, `ConnectionId`, `Timestamp`,
//! `TimeDuration`) that appear inside rows and protocol messages.

pub use ethnum;

pub mod algebraic_type;
pub mod algebraic_value;
pub mod bsatn;
pub mod identity;
pub mod row_key;
pub mod timestamp;

pub use algebraic_type::{AlgebraicType, ProductType, ProductTypeElement, SumType, SumTypeVariant};
pub use algebraic_value::{AlgebraicValue, ProductValue, SumValue};
pub use bsatn::{DecodeError, Reader};
pub use identity::{ConnectionId, Identity};
pub use row_key::RowKey;
pub use timestamp::{TimeDuration, Timestamp};
