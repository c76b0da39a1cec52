//! Principal and session identifiers.

use ethnum::u256;
use std::fmt;

/// A 256-bit identifier for a principal: a user or a database.
///
/// Displayed as 64 hex digits, most significant byte first. On the wire it is
/// encoded as 32 little-endian bytes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity {
    __identity__: u256,
}

#[derive(thiserror::Error, Debug)]
#[error("invalid hex identifier: {0}")]
pub struct ParseHexError(&'static str);

impl Identity {
    pub const ZERO: Self = Identity {
        __identity__: u256::ZERO,
    };

    pub fn from_u256(v: u256) -> Self {
        Identity { __identity__: v }
    }

    pub fn to_u256(self) -> u256 {
        self.__identity__
    }

    pub fn from_le_byte_array(bytes: [u8; 32]) -> Self {
        Identity {
            __identity__: u256::from_le_bytes(bytes),
        }
    }

    pub fn to_le_byte_array(self) -> [u8; 32] {
        self.__identity__.to_le_bytes()
    }

    pub fn from_be_byte_array(bytes: [u8; 32]) -> Self {
        Identity {
            __identity__: u256::from_be_bytes(bytes),
        }
    }

    pub fn from_hex(hex: &str) -> Result<Self, ParseHexError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex, &mut bytes).map_err(|_| ParseHexError("identity"))?;
        Ok(Self::from_be_byte_array(bytes))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.__identity__.to_be_bytes())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

/// A 128-bit identifier for one client-to-server WebSocket session.
///
/// The all-zeros value is a sentinel meaning "no connection id"; servers use
/// it for transactions not attributable to any live connection.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    __connection_id__: u128,
}

impl ConnectionId {
    pub const ZERO: Self = ConnectionId { __connection_id__: 0 };

    pub fn from_u128(v: u128) -> Self {
        ConnectionId { __connection_id__: v }
    }

    pub fn as_u128(self) -> u128 {
        self.__connection_id__
    }

    /// A freshly generated random id for a new physical connection.
    pub fn generate() -> Self {
        Self::from_u128(rand::random())
    }

    /// `None` for the all-zeros sentinel.
    pub fn none_if_zero(self) -> Option<Self> {
        (self != Self::ZERO).then_some(self)
    }

    pub fn from_hex(hex: &str) -> Result<Self, ParseHexError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(hex, &mut bytes).map_err(|_| ParseHexError("connection id"))?;
        Ok(Self::from_u128(u128::from_be_bytes(bytes)))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.__connection_id__.to_be_bytes())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}
