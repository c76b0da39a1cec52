//! Schemas of the messages sent over SpacetimeDB's WebSocket API.

pub mod energy;
pub mod websocket;
