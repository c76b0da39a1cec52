//! Messages sent over the SpacetimeDB WebSocket protocol.
//!
//! Client -> Server messages are encoded as [`ClientMessage`].
//! Server -> Client messages are encoded as [`ServerMessage`].
//!
//! The encoding is BSATN (see [`spacetimedb_sats::bsatn`]): each message is a
//! sum value whose tag byte selects the variant. Any change to the layout of
//! these types is a wire protocol change and must be paired with changes to
//! every SDK and to the server.
//!
//! Inside a [`TableUpdate`], row payloads may additionally be compressed on a
//! per-query-update basis, independently of whole-frame compression. Clients
//! negotiate `gzip` or `none` via the subscribe URL; Brotli exists in the
//! protocol but this implementation rejects it with a descriptive error.

use bytes::Bytes;
use spacetimedb_sats::bsatn::{self, DecodeError, Reader};
use spacetimedb_sats::{ConnectionId, Identity, TimeDuration, Timestamp};
use std::io::Read;
use thiserror::Error;

use crate::energy::EnergyQuanta;

/// The WebSocket subprotocol for BSATN-encoded messages.
pub const BIN_PROTOCOL: &str = "v1.bsatn.spacetimedb";

/// First byte of every server frame: the payload that follows is uncompressed.
pub const SERVER_MSG_COMPRESSION_TAG_NONE: u8 = 0;
/// First byte of every server frame: the payload is Brotli-compressed.
/// Recognized but unsupported.
pub const SERVER_MSG_COMPRESSION_TAG_BROTLI: u8 = 1;
/// First byte of every server frame: the payload is gzip-compressed.
pub const SERVER_MSG_COMPRESSION_TAG_GZIP: u8 = 2;

/// Frame compression requested from the server at connect time.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    /// The value of the `compression` query parameter on the subscribe URL.
    pub fn as_query_param(self) -> &'static str {
        match self {
            Compression::None => "None",
            Compression::Gzip => "Gzip",
        }
    }
}

/// Assorted flags the client can pass when calling a reducer.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum CallReducerFlags {
    /// Notify the caller of the transaction as usual.
    #[default]
    FullUpdate,
    /// Suppress the success notification if the caller is not subscribed to
    /// any query the reducer's transaction touches.
    NoSuccessNotify,
}

impl CallReducerFlags {
    pub fn to_u8(self) -> u8 {
        match self {
            CallReducerFlags::FullUpdate => 0,
            CallReducerFlags::NoSuccessNotify => 1,
        }
    }

    pub fn from_u8(flags: u8) -> Result<Self, DecodeError> {
        match flags {
            0 => Ok(CallReducerFlags::FullUpdate),
            1 => Ok(CallReducerFlags::NoSuccessNotify),
            tag => Err(DecodeError::InvalidTag {
                tag,
                sum: "CallReducerFlags".into(),
            }),
        }
    }
}

/// An identifier for a subscription, allocated by the client.
///
/// Monotonically increasing within one connection and never reused, so every
/// applied/error message can be routed to exactly one subscription.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct QueryId {
    pub id: u32,
}

impl QueryId {
    pub fn new(id: u32) -> Self {
        QueryId { id }
    }
}

fn put_option_u32(buf: &mut Vec<u8>, v: Option<u32>) {
    match v {
        Some(v) => {
            bsatn::put_u8(buf, 0);
            bsatn::put_u32(buf, v);
        }
        None => bsatn::put_u8(buf, 1),
    }
}

fn get_option_u32(reader: &mut Reader<'_>) -> Result<Option<u32>, DecodeError> {
    match reader.get_u8()? {
        0 => Ok(Some(reader.get_u32()?)),
        1 => Ok(None),
        tag => Err(DecodeError::InvalidTag {
            tag,
            sum: "Option<u32>".into(),
        }),
    }
}

// ClientMessage

/// Messages sent from the client to the server.
#[derive(Clone, PartialEq, Debug, derive_more::From)]
pub enum ClientMessage {
    /// Request a reducer run.
    CallReducer(CallReducer),
    /// Register a set of SQL queries on which to receive updates.
    SubscribeMulti(SubscribeMulti),
    /// Cancel a previously registered subscription.
    UnsubscribeMulti(UnsubscribeMulti),
}

impl ClientMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ClientMessage::CallReducer(msg) => {
                bsatn::put_u8(buf, 0);
                bsatn::put_str(buf, &msg.reducer);
                bsatn::put_byte_array(buf, &msg.args);
                bsatn::put_u32(buf, msg.request_id);
                bsatn::put_u8(buf, msg.flags.to_u8());
            }
            ClientMessage::SubscribeMulti(msg) => {
                bsatn::put_u8(buf, 1);
                bsatn::put_len(buf, msg.query_strings.len());
                for query in &msg.query_strings {
                    bsatn::put_str(buf, query);
                }
                bsatn::put_u32(buf, msg.request_id);
                bsatn::put_u32(buf, msg.query_id.id);
            }
            ClientMessage::UnsubscribeMulti(msg) => {
                bsatn::put_u8(buf, 2);
                bsatn::put_u32(buf, msg.request_id);
                bsatn::put_u32(buf, msg.query_id.id);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(match reader.get_u8()? {
            0 => CallReducer {
                reducer: reader.get_str()?,
                args: Bytes::from(reader.get_byte_array()?),
                request_id: reader.get_u32()?,
                flags: CallReducerFlags::from_u8(reader.get_u8()?)?,
            }
            .into(),
            1 => {
                let len = reader.get_len()?;
                let mut query_strings = Vec::with_capacity(len);
                for _ in 0..len {
                    query_strings.push(reader.get_str()?);
                }
                SubscribeMulti {
                    query_strings,
                    request_id: reader.get_u32()?,
                    query_id: QueryId::new(reader.get_u32()?),
                }
                .into()
            }
            2 => UnsubscribeMulti {
                request_id: reader.get_u32()?,
                query_id: QueryId::new(reader.get_u32()?),
            }
            .into(),
            tag => {
                return Err(DecodeError::InvalidTag {
                    tag,
                    sum: "ClientMessage".into(),
                });
            }
        })
    }
}

/// Request a reducer run.
#[derive(Clone, PartialEq, Debug)]
pub struct CallReducer {
    /// The name of the reducer to call.
    pub reducer: Box<str>,
    /// The arguments to the reducer: a BSATN-encoded product value
    /// which meets the reducer's argument schema.
    pub args: Bytes,
    /// An identifier for a client request.
    pub request_id: u32,
    pub flags: CallReducerFlags,
}

/// Sent by the client to register a set of queries, about which the client
/// will receive `TransactionUpdate`s.
#[derive(Clone, PartialEq, Debug)]
pub struct SubscribeMulti {
    /// A sequence of SQL queries, each a single `SELECT` statement.
    pub query_strings: Vec<Box<str>>,
    /// An identifier for a client request.
    pub request_id: u32,
    /// An identifier for this subscription, which should not be used for any
    /// other subscription on the same connection.
    pub query_id: QueryId,
}

/// Sent by the client to cancel the subscription identified by `query_id`.
#[derive(Clone, PartialEq, Debug)]
pub struct UnsubscribeMulti {
    /// An identifier for a client request.
    pub request_id: u32,
    /// The id used in the corresponding [`SubscribeMulti`] message.
    pub query_id: QueryId,
}

// ServerMessage

/// Messages sent from the server to the client.
#[derive(Clone, PartialEq, Debug, derive_more::From)]
pub enum ServerMessage {
    /// Response to the first subscription of a connection.
    InitialSubscription(InitialSubscription),
    /// Upon reducer run.
    TransactionUpdate(TransactionUpdate),
    /// Upon reducer run, in light mode.
    TransactionUpdateLight(TransactionUpdateLight),
    /// After connecting, to inform the client of its identity.
    IdentityToken(IdentityToken),
    /// Response to a one-off SQL query. This client never sends one-off
    /// queries, so receiving this is a protocol error; the body is not
    /// decoded.
    OneOffQueryResponse,
    /// Response to [`SubscribeMulti`] containing the initial matching rows.
    SubscribeMultiApplied(SubscribeMultiApplied),
    /// Acknowledgement of an [`UnsubscribeMulti`], containing the rows to drop.
    UnsubscribeMultiApplied(UnsubscribeMultiApplied),
    /// An error at any point of the subscription lifecycle.
    SubscriptionError(SubscriptionError),
}

impl ServerMessage {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ServerMessage::InitialSubscription(msg) => {
                bsatn::put_u8(buf, 0);
                msg.database_update.encode(buf);
                bsatn::put_u32(buf, msg.request_id);
                bsatn::put_i64(buf, msg.total_host_execution_duration.microseconds);
            }
            ServerMessage::TransactionUpdate(msg) => {
                bsatn::put_u8(buf, 1);
                msg.status.encode(buf);
                bsatn::put_i64(buf, msg.timestamp.microseconds);
                buf.extend_from_slice(&msg.caller_identity.to_le_byte_array());
                bsatn::put_u128(buf, msg.caller_connection_id.as_u128());
                msg.reducer_call.encode(buf);
                bsatn::put_u128(buf, msg.energy_quanta_used.get());
                bsatn::put_i64(buf, msg.total_host_execution_duration.microseconds);
            }
            ServerMessage::TransactionUpdateLight(msg) => {
                bsatn::put_u8(buf, 2);
                bsatn::put_u32(buf, msg.request_id);
                msg.update.encode(buf);
            }
            ServerMessage::IdentityToken(msg) => {
                bsatn::put_u8(buf, 3);
                buf.extend_from_slice(&msg.identity.to_le_byte_array());
                bsatn::put_str(buf, &msg.token);
                bsatn::put_u128(buf, msg.connection_id.as_u128());
            }
            ServerMessage::OneOffQueryResponse => bsatn::put_u8(buf, 4),
            ServerMessage::SubscribeMultiApplied(msg) => {
                bsatn::put_u8(buf, 5);
                bsatn::put_u32(buf, msg.request_id);
                bsatn::put_i64(buf, msg.total_host_execution_duration.microseconds);
                bsatn::put_u32(buf, msg.query_id.id);
                msg.update.encode(buf);
            }
            ServerMessage::UnsubscribeMultiApplied(msg) => {
                bsatn::put_u8(buf, 6);
                bsatn::put_u32(buf, msg.request_id);
                bsatn::put_i64(buf, msg.total_host_execution_duration.microseconds);
                bsatn::put_u32(buf, msg.query_id.id);
                msg.update.encode(buf);
            }
            ServerMessage::SubscriptionError(msg) => {
                bsatn::put_u8(buf, 7);
                bsatn::put_i64(buf, msg.total_host_execution_duration.microseconds);
                put_option_u32(buf, msg.request_id);
                put_option_u32(buf, msg.query_id.map(|q| q.id));
                bsatn::put_str(buf, &msg.error);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(match reader.get_u8()? {
            0 => InitialSubscription {
                database_update: DatabaseUpdate::decode(reader)?,
                request_id: reader.get_u32()?,
                total_host_execution_duration: TimeDuration::from_micros(reader.get_i64()?),
            }
            .into(),
            1 => TransactionUpdate {
                status: UpdateStatus::decode(reader)?,
                timestamp: Timestamp::from_micros(reader.get_i64()?),
                caller_identity: reader.get_identity()?,
                caller_connection_id: reader.get_connection_id()?,
                reducer_call: ReducerCallInfo::decode(reader)?,
                energy_quanta_used: EnergyQuanta::new(reader.get_u128()?),
                total_host_execution_duration: TimeDuration::from_micros(reader.get_i64()?),
            }
            .into(),
            2 => TransactionUpdateLight {
                request_id: reader.get_u32()?,
                update: DatabaseUpdate::decode(reader)?,
            }
            .into(),
            3 => IdentityToken {
                identity: reader.get_identity()?,
                token: reader.get_str()?,
                connection_id: reader.get_connection_id()?,
            }
            .into(),
            4 => ServerMessage::OneOffQueryResponse,
            5 => SubscribeMultiApplied {
                request_id: reader.get_u32()?,
                total_host_execution_duration: TimeDuration::from_micros(reader.get_i64()?),
                query_id: QueryId::new(reader.get_u32()?),
                update: DatabaseUpdate::decode(reader)?,
            }
            .into(),
            6 => UnsubscribeMultiApplied {
                request_id: reader.get_u32()?,
                total_host_execution_duration: TimeDuration::from_micros(reader.get_i64()?),
                query_id: QueryId::new(reader.get_u32()?),
                update: DatabaseUpdate::decode(reader)?,
            }
            .into(),
            7 => SubscriptionError {
                total_host_execution_duration: TimeDuration::from_micros(reader.get_i64()?),
                request_id: get_option_u32(reader)?,
                query_id: get_option_u32(reader)?.map(QueryId::new),
                error: reader.get_str()?,
            }
            .into(),
            tag => {
                return Err(DecodeError::InvalidTag {
                    tag,
                    sum: "ServerMessage".into(),
                });
            }
        })
    }
}

/// Response to the first [`SubscribeMulti`] of a connection, containing every
/// current row matching the subscribed queries.
#[derive(Clone, PartialEq, Debug)]
pub struct InitialSubscription {
    pub database_update: DatabaseUpdate,
    /// An identifier sent by the client in requests. The server will include
    /// the same `request_id` in the response.
    pub request_id: u32,
    /// The overall time between the server receiving a request and sending
    /// the response.
    pub total_host_execution_duration: TimeDuration,
}

/// Received by the client upon a reducer run.
///
/// Clients receive `TransactionUpdate`s only for reducers which update at
/// least one of their subscribed rows, or for their own `Failed` or
/// `OutOfEnergy` reducer invocations.
#[derive(Clone, PartialEq, Debug)]
pub struct TransactionUpdate {
    /// The status of the transaction. Contains the updated rows, if committed.
    pub status: UpdateStatus,
    /// The time when the reducer started.
    pub timestamp: Timestamp,
    /// The identity of the user who requested the reducer run. For scheduled
    /// reducers, it is the identity of the database owner.
    pub caller_identity: Identity,
    /// The connection id of the caller. The all-zeros sentinel denotes no
    /// connection id, e.g. for scheduled reducers.
    pub caller_connection_id: ConnectionId,
    /// The original request that triggered this reducer.
    pub reducer_call: ReducerCallInfo,
    /// The amount of energy credits consumed by running the reducer.
    pub energy_quanta_used: EnergyQuanta,
    /// How long the reducer took to run.
    pub total_host_execution_duration: TimeDuration,
}

/// Received by the client upon a reducer run when the connection is in light
/// mode: no caller metadata, just the row changes.
#[derive(Clone, PartialEq, Debug)]
pub struct TransactionUpdateLight {
    /// An identifier for a client request.
    pub request_id: u32,
    pub update: DatabaseUpdate,
}

/// The first message sent on every new WebSocket connection, informing the
/// client of its identity, token and connection id.
#[derive(Clone, PartialEq, Debug)]
pub struct IdentityToken {
    pub identity: Identity,
    pub token: Box<str>,
    pub connection_id: ConnectionId,
}

/// Response to [`SubscribeMulti`] containing the initial matching rows.
#[derive(Clone, PartialEq, Debug)]
pub struct SubscribeMultiApplied {
    /// The `request_id` of the corresponding [`SubscribeMulti`] message.
    pub request_id: u32,
    pub total_host_execution_duration: TimeDuration,
    /// The subscription id sent by the client.
    pub query_id: QueryId,
    /// The matching rows for this subscription's queries.
    pub update: DatabaseUpdate,
}

/// Acknowledgement of an [`UnsubscribeMulti`] request, containing the rows
/// which left the client's subscribed set.
#[derive(Clone, PartialEq, Debug)]
pub struct UnsubscribeMultiApplied {
    /// The `request_id` of the corresponding [`UnsubscribeMulti`] message.
    pub request_id: u32,
    pub total_host_execution_duration: TimeDuration,
    /// The id included in the [`SubscribeMulti`] and [`UnsubscribeMulti`]
    /// messages.
    pub query_id: QueryId,
    pub update: DatabaseUpdate,
}

/// An error at any point of the subscription lifecycle.
///
/// If `query_id` is absent, the error applies to every subscription on the
/// connection.
#[derive(Clone, PartialEq, Debug)]
pub struct SubscriptionError {
    pub total_host_execution_duration: TimeDuration,
    /// Provided by the client via a [`SubscribeMulti`] message.
    /// [`None`] if this occurred as the result of a [`TransactionUpdate`].
    pub request_id: Option<u32>,
    /// [`None`] if the error is connection-scoped rather than tied to one
    /// subscription.
    pub query_id: Option<QueryId>,
    /// An error message describing the failure, for diagnostic purposes.
    /// It need not have a predictable format.
    pub error: Box<str>,
}

/// The original `CallReducer` request that triggered a [`TransactionUpdate`].
#[derive(Clone, PartialEq, Debug)]
pub struct ReducerCallInfo {
    /// The name of the reducer that ran. The sentinel `"<none>"` marks a
    /// transaction not attributable to any reducer.
    pub reducer_name: Box<str>,
    /// An identifier for a client request.
    pub request_id: u32,
    /// The BSATN-encoded arguments to the reducer.
    pub args: Bytes,
}

impl ReducerCallInfo {
    fn encode(&self, buf: &mut Vec<u8>) {
        bsatn::put_str(buf, &self.reducer_name);
        bsatn::put_u32(buf, self.request_id);
        bsatn::put_byte_array(buf, &self.args);
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(ReducerCallInfo {
            reducer_name: reader.get_str()?,
            request_id: reader.get_u32()?,
            args: Bytes::from(reader.get_byte_array()?),
        })
    }
}

/// The status of a committed, failed or aborted transaction.
#[derive(Clone, PartialEq, Debug)]
pub enum UpdateStatus {
    /// The reducer ran successfully and its changes were committed to the
    /// database. The altered subscribed rows are recorded in the
    /// [`DatabaseUpdate`].
    Committed(DatabaseUpdate),
    /// The reducer errored, and any changes it attempted were rolled back.
    /// This is the error message.
    Failed(Box<str>),
    /// The reducer was interrupted due to insufficient energy, and any
    /// changes it attempted were rolled back.
    OutOfEnergy,
}

impl UpdateStatus {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            UpdateStatus::Committed(update) => {
                bsatn::put_u8(buf, 0);
                update.encode(buf);
            }
            UpdateStatus::Failed(message) => {
                bsatn::put_u8(buf, 1);
                bsatn::put_str(buf, message);
            }
            UpdateStatus::OutOfEnergy => bsatn::put_u8(buf, 2),
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(match reader.get_u8()? {
            0 => UpdateStatus::Committed(DatabaseUpdate::decode(reader)?),
            1 => UpdateStatus::Failed(reader.get_str()?),
            2 => UpdateStatus::OutOfEnergy,
            tag => {
                return Err(DecodeError::InvalidTag {
                    tag,
                    sum: "UpdateStatus".into(),
                });
            }
        })
    }
}

/// All the row changes of one transaction or subscription application,
/// grouped per table.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct DatabaseUpdate {
    pub tables: Vec<TableUpdate>,
}

impl DatabaseUpdate {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        bsatn::put_len(buf, self.tables.len());
        for table in &self.tables {
            table.encode(buf);
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = reader.get_len()?;
        let mut tables = Vec::with_capacity(len);
        for _ in 0..len {
            tables.push(TableUpdate::decode(reader)?);
        }
        Ok(DatabaseUpdate { tables })
    }
}

impl FromIterator<TableUpdate> for DatabaseUpdate {
    fn from_iter<T: IntoIterator<Item = TableUpdate>>(iter: T) -> Self {
        DatabaseUpdate {
            tables: iter.into_iter().collect(),
        }
    }
}

/// Alterations to a single table.
///
/// A table may appear with several [`CompressableQueryUpdate`]s in one
/// message when multiple subscribed queries of the same transaction touch it.
#[derive(Clone, PartialEq, Debug)]
pub struct TableUpdate {
    pub table_name: Box<str>,
    pub updates: Vec<CompressableQueryUpdate>,
}

impl TableUpdate {
    fn encode(&self, buf: &mut Vec<u8>) {
        bsatn::put_str(buf, &self.table_name);
        bsatn::put_len(buf, self.updates.len());
        for update in &self.updates {
            update.encode(buf);
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let table_name = reader.get_str()?;
        let len = reader.get_len()?;
        let mut updates = Vec::with_capacity(len);
        for _ in 0..len {
            updates.push(CompressableQueryUpdate::decode(reader)?);
        }
        Ok(TableUpdate { table_name, updates })
    }
}

/// A [`QueryUpdate`], possibly compressed independently of the enclosing
/// frame.
#[derive(Clone, PartialEq, Debug)]
pub enum CompressableQueryUpdate {
    Uncompressed(QueryUpdate),
    /// Unsupported; [`Self::maybe_decompress`] fails on it.
    Brotli(Bytes),
    Gzip(Bytes),
}

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("received a Brotli-compressed query update, but Brotli is unsupported; negotiate Gzip or None")]
    BrotliUnsupported,
    #[error("failed to inflate gzip-compressed query update: {0}")]
    Gzip(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl CompressableQueryUpdate {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            CompressableQueryUpdate::Uncompressed(update) => {
                bsatn::put_u8(buf, 0);
                update.encode(buf);
            }
            CompressableQueryUpdate::Brotli(bytes) => {
                bsatn::put_u8(buf, 1);
                bsatn::put_byte_array(buf, bytes);
            }
            CompressableQueryUpdate::Gzip(bytes) => {
                bsatn::put_u8(buf, 2);
                bsatn::put_byte_array(buf, bytes);
            }
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(match reader.get_u8()? {
            0 => CompressableQueryUpdate::Uncompressed(QueryUpdate::decode(reader)?),
            1 => CompressableQueryUpdate::Brotli(Bytes::from(reader.get_byte_array()?)),
            2 => CompressableQueryUpdate::Gzip(Bytes::from(reader.get_byte_array()?)),
            tag => {
                return Err(DecodeError::InvalidTag {
                    tag,
                    sum: "CompressableQueryUpdate".into(),
                });
            }
        })
    }

    /// Recover the inner [`QueryUpdate`], inflating it if necessary.
    pub fn maybe_decompress(&self) -> Result<QueryUpdate, CompressionError> {
        match self {
            CompressableQueryUpdate::Uncompressed(update) => Ok(update.clone()),
            CompressableQueryUpdate::Brotli(_) => Err(CompressionError::BrotliUnsupported),
            CompressableQueryUpdate::Gzip(bytes) => {
                let mut inflated = Vec::new();
                flate2::read::GzDecoder::new(&bytes[..]).read_to_end(&mut inflated)?;
                let mut reader = Reader::new(&inflated);
                Ok(QueryUpdate::decode(&mut reader)?)
            }
        }
    }
}

/// The row changes one query contributed: rows leaving the result set and
/// rows entering it.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct QueryUpdate {
    pub deletes: BsatnRowList,
    pub inserts: BsatnRowList,
}

impl QueryUpdate {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        self.deletes.encode(buf);
        self.inserts.encode(buf);
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(QueryUpdate {
            deletes: BsatnRowList::decode(reader)?,
            inserts: BsatnRowList::decode(reader)?,
        })
    }
}

/// A list of BSATN-encoded rows, each carried as its own length-prefixed
/// byte string so rows can be decoded lazily.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct BsatnRowList {
    rows: Vec<Bytes>,
}

impl BsatnRowList {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: impl Into<Bytes>) {
        self.rows.push(row.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.rows.iter()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        bsatn::put_len(buf, self.rows.len());
        for row in &self.rows {
            bsatn::put_byte_array(buf, row);
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = reader.get_len()?;
        let mut rows = Vec::with_capacity(len);
        for _ in 0..len {
            rows.push(Bytes::from(reader.get_byte_array()?));
        }
        Ok(BsatnRowList { rows })
    }
}

impl FromIterator<Bytes> for BsatnRowList {
    fn from_iter<T: IntoIterator<Item = Bytes>>(iter: T) -> Self {
        BsatnRowList {
            rows: iter.into_iter().collect(),
        }
    }
}
