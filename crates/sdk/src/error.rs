//! The error surface of the SDK.

use crate::websocket::WsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdkError {
    /// The connection has terminated, or was never established.
    #[error("connection is not active")]
    Disconnected,

    /// [`crate::SubscriptionBuilder::subscribe`] was called with no queries.
    #[error("cannot subscribe to an empty set of queries")]
    EmptyQuerySet,

    /// `unsubscribe` was called on a subscription that is already ending or
    /// has ended.
    #[error("subscription {query_id} has already been unsubscribed or has ended")]
    AlreadyUnsubscribed { query_id: u32 },

    /// The builder was asked to connect without a URI.
    #[error("DbConnectionBuilder requires a URI; call with_uri before build")]
    MissingUri,

    /// The builder was asked to connect without a database name or address.
    #[error("DbConnectionBuilder requires a database name or address; call with_module_name before build")]
    MissingModuleName,

    /// The module schema does not define the named table.
    #[error("no such table {table_name}")]
    UnknownTable { table_name: Box<str> },

    /// The named table has no index with the given name, or the index is of
    /// the wrong kind for the accessor used.
    #[error("no such index {index_name} on table {table_name}")]
    UnknownIndex {
        table_name: Box<str>,
        index_name: Box<str>,
    },

    #[error("failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Ws(#[from] WsError),
}
