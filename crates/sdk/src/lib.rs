//! A client SDK for SpacetimeDB.
//!
//! The SDK maintains a consistent, reference-counted in-memory view of a
//! remote database over a single WebSocket: it decodes the binary protocol,
//! mirrors subscribed rows into per-table caches, multiplexes any number of
//! subscriptions over the one socket, and dispatches row-change and reducer
//! events to user callbacks in a deterministic order.
//!
//! Most applications use this crate through bindings generated from their
//! module's schema; the generated code supplies a [`ModuleDef`] and typed
//! wrappers, while everything here is schema-driven at runtime.
//!
//! ```no_run
//! use spacetimedb_client_sdk::{DbConnection, ModuleDef};
//!
//! # fn main() -> Result<(), spacetimedb_client_sdk::SdkError> {
//! # let module = ModuleDef::default();
//! let conn = DbConnection::builder(module)
//!     .with_uri("https://testnet.spacetimedb.com")
//!     .with_module_name("quickstart-chat")
//!     .on_connect(|_conn, identity, _token| println!("connected as {identity}"))
//!     .build()?;
//! conn.subscription_builder()
//!     .on_applied(|_ctx| println!("subscription live"))
//!     .subscribe(["SELECT * FROM message"])?;
//! # Ok(()) }
//! ```

pub mod callbacks;
pub mod client_cache;
pub mod db_connection;
pub mod error;
pub mod event;
pub mod module;
pub mod pool;
pub mod subscription;
pub mod websocket;

pub use callbacks::CallbackId;
pub use client_cache::{IndexBound, IndexRange};
pub use db_connection::{BTreeIndexHandle, DbConnection, DbConnectionBuilder, TableHandle, UniqueIndexHandle};
pub use error::SdkError;
pub use event::{Event, EventContext, ReducerCall, ReducerEvent, Status};
pub use module::{ModuleDef, ReducerRuntimeInfo, TableRuntimeInfo};
pub use pool::{ConnectionPool, ConnectionSnapshot, PoolKey};
pub use subscription::{SubscriptionBuilder, SubscriptionHandle};
pub use websocket::WsError;

pub use spacetimedb_client_api_messages::websocket::{CallReducerFlags, Compression};
pub use spacetimedb_sats::{AlgebraicType, AlgebraicValue, ConnectionId, Identity, ProductValue, RowKey, Timestamp};
