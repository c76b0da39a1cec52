//! The connection to a remote database: builder, message dispatch, and the
//! public handle.
//!
//! All inbound traffic funnels through one receiver task per connection.
//! Each frame is decoded, its row lists parsed and keyed, and only then are
//! cache mutations applied, so a frame that fails to parse never leaves the
//! cache half-updated. Within one server message the order is fixed: every
//! cache mutation first, then subscription lifecycle callbacks, then the row
//! callbacks those mutations staged.

use crate::callbacks::{CallbackId, CallbackMap, DbCallbacks, ReducerCallbacks};
use crate::client_cache::{ClientCache, IndexRange, PendingRowCallback, RowCallback, RowOp, RowOpKind};
use crate::error::SdkError;
use crate::event::{Event, EventContext, ReducerCall, ReducerEvent, Status};
use crate::module::{IndexRuntimeInfo, ModuleDef, TableRuntimeInfo};
use crate::subscription::{
    AppliedCallback, EndCallback, ErrorCallback, SubscriptionBuilder, SubscriptionHandle, SubscriptionManager,
};
use crate::websocket::{TransportEvent, WsConfig, WsConnection, WsSend};
use bytes::Bytes;
use futures::StreamExt;
use futures_channel::mpsc;
use http::Uri;
use spacetimedb_client_api_messages::websocket::{
    CallReducer, CallReducerFlags, ClientMessage, Compression, DatabaseUpdate, QueryId, ServerMessage,
    SubscribeMulti, TransactionUpdate, UnsubscribeMulti, UpdateStatus,
};
use spacetimedb_sats::bsatn::Reader;
use spacetimedb_sats::{AlgebraicValue, ConnectionId, Identity, ProductValue};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::{self, Builder, Runtime};

/// Reducer name the server uses for transactions no reducer is responsible
/// for.
const NO_SUCH_REDUCER: &str = "<none>";

pub(crate) type ConnectCallbackFn = dyn Fn(&DbConnection, Identity, &str) + Send + Sync;
pub(crate) type DisconnectCallbackFn = dyn Fn(&DbConnection, Option<&SdkError>) + Send + Sync;
pub(crate) type ConnectErrorCallbackFn = dyn Fn(&DbConnection, &SdkError) + Send + Sync;
pub(crate) type SubscriptionAppliedCallbackFn = dyn Fn(&EventContext) + Send + Sync;

#[derive(Default)]
struct ConnectionCallbacks {
    on_connect: CallbackMap<ConnectCallbackFn>,
    on_disconnect: CallbackMap<DisconnectCallbackFn>,
    on_connect_error: CallbackMap<ConnectErrorCallbackFn>,
    /// Fired when the legacy `InitialSubscription` message applies.
    on_subscription_applied: CallbackMap<SubscriptionAppliedCallbackFn>,
}

struct ConnectionState {
    is_active: bool,
    /// Set on close, transport error or `disconnect()`; no message is
    /// processed afterwards.
    terminated: bool,
    close_requested: bool,
    identity: Option<Identity>,
    token: Option<Box<str>>,
    connection_id: ConnectionId,
    connection_error: Option<Box<str>>,
}

pub(crate) struct ConnectionInner {
    module: Arc<ModuleDef>,
    state: Mutex<ConnectionState>,
    client_cache: Mutex<ClientCache>,
    subscriptions: Mutex<SubscriptionManager>,
    db_callbacks: Mutex<DbCallbacks>,
    reducer_callbacks: Mutex<ReducerCallbacks>,
    connection_callbacks: Mutex<ConnectionCallbacks>,
    send_chan: mpsc::UnboundedSender<WsSend>,
    next_request_id: AtomicU32,
}

/// A shared handle to one connection.
///
/// Cheap to clone; every clone views the same connection. User callbacks
/// receive one inside their [`EventContext`].
#[derive(Clone)]
pub struct DbConnection {
    inner: Arc<ConnectionInner>,
    // `Some` only on handles returned from `build`, so that tasks holding
    // context handles can never be the ones to drop the runtime.
    runtime: Option<Arc<Runtime>>,
}

// When called from within an async context, return a handle to it (and no
// `Runtime`), otherwise create a fresh `Runtime` and return it along with a
// handle to it.
fn enter_or_create_runtime() -> Result<(Option<Runtime>, runtime::Handle), SdkError> {
    match runtime::Handle::try_current() {
        Err(e) if e.is_missing_context() => {
            let rt = Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("spacetimedb-background-connection")
                .build()?;
            let handle = rt.handle().clone();
            Ok((Some(rt), handle))
        }
        Ok(handle) => Ok((None, handle)),
        Err(e) => Err(SdkError::Runtime(std::io::Error::other(e))),
    }
}

/// Fluent configuration for a new connection.
pub struct DbConnectionBuilder {
    module: ModuleDef,
    uri: Option<String>,
    module_name: Option<String>,
    token: Option<String>,
    compression: Compression,
    light: bool,
    confirmed: Option<bool>,
    on_connect: Vec<Arc<ConnectCallbackFn>>,
    on_disconnect: Vec<Arc<DisconnectCallbackFn>>,
    on_connect_error: Vec<Arc<ConnectErrorCallbackFn>>,
}

impl DbConnectionBuilder {
    fn new(module: ModuleDef) -> Self {
        DbConnectionBuilder {
            module,
            uri: None,
            module_name: None,
            token: None,
            compression: Compression::default(),
            light: false,
            confirmed: None,
            on_connect: Vec::new(),
            on_disconnect: Vec::new(),
            on_connect_error: Vec::new(),
        }
    }

    /// The root URI of the SpacetimeDB instance, e.g.
    /// `https://testnet.spacetimedb.com`. `http`/`https` schemes are
    /// rewritten to `ws`/`wss` for the subscription socket.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// The name or hex address of the database to connect to.
    pub fn with_module_name(mut self, name_or_address: impl Into<String>) -> Self {
        self.module_name = Some(name_or_address.into());
        self
    }

    /// A pre-minted auth token identifying this client. Without one, the
    /// server generates a fresh identity.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Frame compression to request from the server.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Request light-mode transaction updates: no caller metadata, just rows.
    pub fn with_light_mode(mut self, light: bool) -> Self {
        self.light = light;
        self
    }

    /// Request confirmed reads. Semantics are server-defined; the flag is
    /// passed through on the subscribe URL.
    pub fn with_confirmed_reads(mut self, confirmed: bool) -> Self {
        self.confirmed = Some(confirmed);
        self
    }

    /// Invoked once the server reports this connection's identity.
    pub fn on_connect(mut self, callback: impl Fn(&DbConnection, Identity, &str) + Send + Sync + 'static) -> Self {
        self.on_connect.push(Arc::new(callback));
        self
    }

    /// Invoked when the connection closes.
    pub fn on_disconnect(
        mut self,
        callback: impl Fn(&DbConnection, Option<&SdkError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect.push(Arc::new(callback));
        self
    }

    /// Invoked on a fatal transport condition.
    pub fn on_connect_error(mut self, callback: impl Fn(&DbConnection, &SdkError) + Send + Sync + 'static) -> Self {
        self.on_connect_error.push(Arc::new(callback));
        self
    }

    /// Open the WebSocket, start the dispatch task, and hand back the
    /// connection. Blocks until the socket is open.
    pub fn build(self) -> Result<DbConnection, SdkError> {
        let uri: Uri = self
            .uri
            .ok_or(SdkError::MissingUri)?
            .parse()
            .map_err(crate::websocket::WsError::Uri)?;
        let module_name = self.module_name.ok_or(SdkError::MissingModuleName)?;
        let connection_id = ConnectionId::generate();
        let config = WsConfig {
            compression: self.compression,
            light: self.light,
            confirmed: self.confirmed,
        };

        let (runtime, handle) = enter_or_create_runtime()?;
        // `block_in_place` is required here, as tokio won't allow us to call
        // `block_on` if it would block the current thread of an outer runtime.
        let ws = tokio::task::block_in_place(|| {
            handle.block_on(WsConnection::connect(
                uri,
                &module_name,
                self.token.as_deref(),
                connection_id,
                config,
            ))
        })?;
        let (_loop_handle, event_recv, send_chan) = ws.spawn_message_loop(&handle);

        let mut connection_callbacks = ConnectionCallbacks::default();
        for callback in self.on_connect {
            connection_callbacks.on_connect.insert(callback);
        }
        for callback in self.on_disconnect {
            connection_callbacks.on_disconnect.insert(callback);
        }
        for callback in self.on_connect_error {
            connection_callbacks.on_connect_error.insert(callback);
        }

        let module = Arc::new(self.module);
        let inner = Arc::new(ConnectionInner {
            module: module.clone(),
            state: Mutex::new(ConnectionState {
                // The transport is open; the connection is live even before
                // the server's IdentityToken arrives.
                is_active: true,
                terminated: false,
                close_requested: false,
                identity: None,
                token: self.token.map(Into::into),
                connection_id,
                connection_error: None,
            }),
            client_cache: Mutex::new(ClientCache::new(module)),
            subscriptions: Mutex::new(SubscriptionManager::default()),
            db_callbacks: Mutex::new(DbCallbacks::default()),
            reducer_callbacks: Mutex::new(ReducerCallbacks::default()),
            connection_callbacks: Mutex::new(connection_callbacks),
            send_chan,
            next_request_id: AtomicU32::new(1),
        });

        handle.spawn(receiver_loop(
            event_recv,
            DbConnection {
                inner: inner.clone(),
                runtime: None,
            },
        ));

        Ok(DbConnection {
            inner,
            runtime: runtime.map(Arc::new),
        })
    }
}

/// Drives one connection: applies every transport event in arrival order.
async fn receiver_loop(mut events: mpsc::UnboundedReceiver<TransportEvent>, conn: DbConnection) {
    while let Some(event) = events.next().await {
        match event {
            TransportEvent::Message(payload) => conn.handle_frame(&payload),
            TransportEvent::Error(e) => {
                conn.handle_transport_error(e);
                break;
            }
            TransportEvent::Closed => {
                conn.handle_closed();
                break;
            }
        }
    }
}

impl DbConnection {
    /// Start configuring a connection for the module described by `module`.
    pub fn builder(module: ModuleDef) -> DbConnectionBuilder {
        DbConnectionBuilder::new(module)
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().is_active
    }

    /// The identity reported by the server, once `IdentityToken` has arrived.
    pub fn identity(&self) -> Option<Identity> {
        self.lock_state().identity
    }

    /// The auth token for this connection: the configured one, or the one
    /// minted by the server for an anonymous connection.
    pub fn token(&self) -> Option<Box<str>> {
        self.lock_state().token.clone()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.lock_state().connection_id
    }

    /// The fatal transport condition that ended the connection, if any.
    pub fn connection_error(&self) -> Option<Box<str>> {
        self.lock_state().connection_error.clone()
    }

    /// Invoke the reducer `reducer` with the given pre-encoded arguments.
    pub fn call_reducer(
        &self,
        reducer: &str,
        args: impl Into<Bytes>,
        flags: CallReducerFlags,
    ) -> Result<(), SdkError> {
        let msg = ClientMessage::from(CallReducer {
            reducer: reducer.into(),
            args: args.into(),
            request_id: self.next_request_id(),
            flags,
        });
        self.send_message(&msg)
    }

    pub fn subscription_builder(&self) -> SubscriptionBuilder {
        SubscriptionBuilder::new(self.clone())
    }

    /// Close the connection. In-flight dispatch completes; no further
    /// messages are delivered.
    pub fn disconnect(&self) -> Result<(), SdkError> {
        {
            let mut state = self.lock_state();
            if !state.is_active || state.close_requested {
                return Err(SdkError::Disconnected);
            }
            state.close_requested = true;
            // Frames racing the close handshake are ignored.
            state.terminated = true;
        }
        self.inner
            .send_chan
            .unbounded_send(WsSend::Close)
            .map_err(|_| SdkError::Disconnected)
    }

    /// Register `callback` to run on every `reducer` invocation reported to
    /// this connection.
    pub fn on_reducer(
        &self,
        reducer: &str,
        callback: impl Fn(&EventContext, &ProductValue) + Send + Sync + 'static,
    ) -> CallbackId {
        self.lock_reducer_callbacks().register(reducer, Arc::new(callback))
    }

    pub fn remove_on_reducer(&self, reducer: &str, callback_id: CallbackId) -> bool {
        self.lock_reducer_callbacks().remove(reducer, callback_id)
    }

    pub fn on_connect(&self, callback: impl Fn(&DbConnection, Identity, &str) + Send + Sync + 'static) -> CallbackId {
        self.lock_connection_callbacks().on_connect.insert(Arc::new(callback))
    }

    pub fn remove_on_connect(&self, callback_id: CallbackId) -> bool {
        self.lock_connection_callbacks().on_connect.remove(callback_id)
    }

    pub fn on_disconnect(
        &self,
        callback: impl Fn(&DbConnection, Option<&SdkError>) + Send + Sync + 'static,
    ) -> CallbackId {
        self.lock_connection_callbacks().on_disconnect.insert(Arc::new(callback))
    }

    pub fn remove_on_disconnect(&self, callback_id: CallbackId) -> bool {
        self.lock_connection_callbacks().on_disconnect.remove(callback_id)
    }

    pub fn on_connect_error(&self, callback: impl Fn(&DbConnection, &SdkError) + Send + Sync + 'static) -> CallbackId {
        self.lock_connection_callbacks()
            .on_connect_error
            .insert(Arc::new(callback))
    }

    pub fn remove_on_connect_error(&self, callback_id: CallbackId) -> bool {
        self.lock_connection_callbacks().on_connect_error.remove(callback_id)
    }

    /// Register `callback` to run when the connection-wide
    /// `InitialSubscription` has been applied.
    pub fn on_subscription_applied(&self, callback: impl Fn(&EventContext) + Send + Sync + 'static) -> CallbackId {
        self.lock_connection_callbacks()
            .on_subscription_applied
            .insert(Arc::new(callback))
    }

    pub fn remove_on_subscription_applied(&self, callback_id: CallbackId) -> bool {
        self.lock_connection_callbacks().on_subscription_applied.remove(callback_id)
    }

    /// A handle onto the client cache of `table_name`.
    pub fn table(&self, table_name: &str) -> Result<TableHandle, SdkError> {
        let info = self
            .inner
            .module
            .table(table_name)
            .ok_or_else(|| SdkError::UnknownTable {
                table_name: table_name.into(),
            })?
            .clone();
        Ok(TableHandle {
            conn: self.clone(),
            info,
        })
    }

    // Subscription plumbing, called from `subscription.rs`.

    pub(crate) fn register_subscription(
        &self,
        query_sqls: Vec<Box<str>>,
        on_applied: Option<AppliedCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Result<SubscriptionHandle, SdkError> {
        if !self.is_active() {
            return Err(SdkError::Disconnected);
        }
        let query_id = self
            .lock_subscriptions()
            .register(query_sqls.clone(), on_applied, on_error);
        let msg = ClientMessage::from(SubscribeMulti {
            query_strings: query_sqls,
            request_id: self.next_request_id(),
            query_id,
        });
        if let Err(e) = self.send_message(&msg) {
            self.lock_subscriptions().abort_register(query_id);
            return Err(e);
        }
        Ok(SubscriptionHandle {
            conn: self.clone(),
            query_id,
        })
    }

    pub(crate) fn unsubscribe(&self, query_id: QueryId) -> Result<(), SdkError> {
        if !self.is_active() {
            return Err(SdkError::Disconnected);
        }
        self.lock_subscriptions().start_unsubscribe(query_id)?;
        let msg = ClientMessage::from(UnsubscribeMulti {
            request_id: self.next_request_id(),
            query_id,
        });
        self.send_message(&msg)
    }

    pub(crate) fn set_subscription_on_end(&self, query_id: QueryId, on_end: EndCallback) {
        self.lock_subscriptions().set_on_end(query_id, on_end);
    }

    pub(crate) fn subscription_is_active(&self, query_id: QueryId) -> bool {
        self.lock_subscriptions().is_active(query_id)
    }

    pub(crate) fn subscription_is_ended(&self, query_id: QueryId) -> bool {
        self.lock_subscriptions().is_ended(query_id)
    }

    fn next_request_id(&self) -> u32 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The runtime this connection's tasks run on, when one is reachable.
    pub(crate) fn runtime_handle(&self) -> Option<runtime::Handle> {
        self.runtime
            .as_ref()
            .map(|rt| rt.handle().clone())
            .or_else(|| runtime::Handle::try_current().ok())
    }

    fn send_message(&self, msg: &ClientMessage) -> Result<(), SdkError> {
        if !self.is_active() {
            return Err(SdkError::Disconnected);
        }
        self.inner
            .send_chan
            .unbounded_send(WsSend::Message(msg.to_vec()))
            .map_err(|_| SdkError::Disconnected)
    }

    // Inbound dispatch. Runs on the receiver task.

    pub(crate) fn handle_frame(&self, payload: &[u8]) {
        if self.lock_state().terminated {
            return;
        }
        let mut reader = Reader::new(payload);
        match ServerMessage::decode(&mut reader) {
            Ok(msg) => self.handle_message(msg),
            // A frame we can't decode is dropped whole; the cache was not
            // touched, so subsequent frames remain meaningful.
            Err(e) => log::error!("Error decoding ServerMessage: {e}"),
        }
    }

    pub(crate) fn handle_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::IdentityToken(msg) => {
                let (token, identity) = {
                    let mut state = self.lock_state();
                    state.identity = Some(msg.identity);
                    if state.token.is_none() {
                        state.token = Some(msg.token.clone());
                    }
                    state.connection_id = msg.connection_id;
                    (state.token.clone().unwrap_or(msg.token), msg.identity)
                };
                let callbacks = self.lock_connection_callbacks().on_connect.snapshot();
                for callback in callbacks {
                    callback(self, identity, &token);
                }
            }

            ServerMessage::InitialSubscription(msg) => {
                let Some(pending) = self.parse_and_apply(msg.database_update) else {
                    return;
                };
                let ctx = self.event_context(Event::SubscribeApplied);
                let callbacks = self.lock_connection_callbacks().on_subscription_applied.snapshot();
                for callback in callbacks {
                    callback(&ctx);
                }
                self.fire_row_callbacks(&ctx, pending);
            }

            ServerMessage::TransactionUpdateLight(msg) => {
                let Some(pending) = self.parse_and_apply(msg.update) else {
                    return;
                };
                let ctx = self.event_context(Event::UnknownTransaction);
                self.fire_row_callbacks(&ctx, pending);
            }

            ServerMessage::TransactionUpdate(msg) => self.handle_transaction_update(msg),

            ServerMessage::SubscribeMultiApplied(msg) => {
                // Bind before matching so the manager lock is released before
                // any user callback runs.
                let applied = self.lock_subscriptions().applied(msg.query_id);
                let Some(on_applied) = applied else {
                    log::error!(
                        "Received SubscribeMultiApplied for unknown query id {}",
                        msg.query_id.id
                    );
                    return;
                };
                let Some(pending) = self.parse_and_apply(msg.update) else {
                    return;
                };
                let ctx = self.event_context(Event::SubscribeApplied);
                if let Some(callback) = on_applied {
                    callback(&ctx);
                }
                self.fire_row_callbacks(&ctx, pending);
            }

            ServerMessage::UnsubscribeMultiApplied(msg) => {
                let unsubscribed = self.lock_subscriptions().unsubscribe_applied(msg.query_id);
                let Some(on_end) = unsubscribed else {
                    log::error!(
                        "Received UnsubscribeMultiApplied for unknown query id {}",
                        msg.query_id.id
                    );
                    return;
                };
                let Some(pending) = self.parse_and_apply(msg.update) else {
                    return;
                };
                let ctx = self.event_context(Event::UnsubscribeApplied);
                if let Some(callback) = on_end {
                    callback(&ctx);
                }
                self.fire_row_callbacks(&ctx, pending);
            }

            ServerMessage::SubscriptionError(msg) => {
                let ctx = self.event_context(Event::SubscriptionError(msg.error.clone()));
                match msg.query_id {
                    Some(query_id) => {
                        let removed = self.lock_subscriptions().error(query_id);
                        match removed {
                            None => log::error!("Received SubscriptionError for unknown query id {}", query_id.id),
                            Some(on_error) => {
                                if let Some(callback) = on_error {
                                    callback(&ctx, &msg.error);
                                }
                            }
                        }
                    }
                    None => {
                        // Connection-scoped: the cache may now be divergent.
                        // Following the reference behavior, report on every
                        // subscription and keep the connection open.
                        log::error!("Received connection-scoped SubscriptionError: {}", msg.error);
                        let callbacks = self.lock_subscriptions().broadcast_error();
                        for callback in callbacks {
                            callback(&ctx, &msg.error);
                        }
                    }
                }
            }

            ServerMessage::OneOffQueryResponse => {
                log::error!("Received OneOffQueryResponse, but this client never sends one-off queries");
            }
        }
    }

    fn handle_transaction_update(&self, msg: TransactionUpdate) {
        if &*msg.reducer_call.reducer_name == NO_SUCH_REDUCER {
            let detail: &str = match &msg.status {
                UpdateStatus::Failed(message) => message,
                _ => "no error message",
            };
            log::error!("Received TransactionUpdate with reducer `{NO_SUCH_REDUCER}`: {detail}");
            return;
        }

        let update = match &msg.status {
            UpdateStatus::Committed(update) => update.clone(),
            UpdateStatus::Failed(_) | UpdateStatus::OutOfEnergy => DatabaseUpdate::default(),
        };

        // An unknown reducer or undecodable arguments downgrade the event to
        // an unattributed transaction; the row changes still apply.
        let reducer_name = msg.reducer_call.reducer_name.clone();
        let decoded_args = self
            .inner
            .module
            .reducer(&reducer_name)
            .and_then(|reducer| match ProductValue::decode_exact(&reducer.args_type, &msg.reducer_call.args) {
                Ok(args) => Some(args),
                Err(e) => {
                    log::error!("Failed to decode arguments to reducer {reducer_name}: {e}");
                    None
                }
            });

        let Some(pending) = self.parse_and_apply(update) else {
            return;
        };

        match decoded_args {
            Some(args) => {
                let event = ReducerEvent {
                    timestamp: msg.timestamp,
                    status: Status::from_update_status(&msg.status),
                    caller_identity: msg.caller_identity,
                    caller_connection_id: msg.caller_connection_id.none_if_zero(),
                    energy_consumed: msg.energy_quanta_used,
                    reducer: ReducerCall {
                        reducer_name: reducer_name.clone(),
                        args: args.clone(),
                    },
                };
                let ctx = self.event_context(Event::Reducer(event));
                let callbacks = self.lock_reducer_callbacks().snapshot(&reducer_name);
                for callback in callbacks {
                    callback(&ctx, &args);
                }
                self.fire_row_callbacks(&ctx, pending);
            }
            None => {
                let ctx = self.event_context(Event::UnknownTransaction);
                self.fire_row_callbacks(&ctx, pending);
            }
        }
    }

    /// Parse every row of `update` and apply the result to the cache,
    /// returning the staged row callbacks.
    ///
    /// Parsing happens entirely before the first mutation, so a message the
    /// client cannot decode is dropped without touching the cache. `None`
    /// means exactly that; an error has already been logged.
    fn parse_and_apply(&self, update: DatabaseUpdate) -> Option<Vec<PendingRowCallback>> {
        let parsed = self.parse_database_update(update)?;
        let mut pending = Vec::new();
        let mut cache = self.lock_client_cache();
        for (info, ops) in parsed {
            // The table was resolved during parsing, so the cache knows it.
            if let Some(table) = cache.table(&info.table_name) {
                table.apply_operations(ops, &mut pending);
            }
        }
        Some(pending)
    }

    fn parse_database_update(&self, update: DatabaseUpdate) -> Option<Vec<(Arc<TableRuntimeInfo>, Vec<RowOp>)>> {
        let mut parsed = Vec::with_capacity(update.tables.len());
        for table_update in update.tables {
            let Some(info) = self.inner.module.table(&table_update.table_name) else {
                log::error!("TableUpdate for table {} not in the module", table_update.table_name);
                continue;
            };
            let mut ops = Vec::new();
            for compressable in &table_update.updates {
                let query_update = match compressable.maybe_decompress() {
                    Ok(query_update) => query_update,
                    Err(e) => {
                        log::error!(
                            "Dropping message with undecodable QueryUpdate for table {}: {e}",
                            table_update.table_name
                        );
                        return None;
                    }
                };
                for row in query_update.deletes.iter() {
                    match info.decode_row(row) {
                        Ok((row, key)) => ops.push(RowOp {
                            kind: RowOpKind::Delete,
                            key,
                            row,
                        }),
                        Err(e) => log::error!("Error while deserializing row: {e}"),
                    }
                }
                for row in query_update.inserts.iter() {
                    match info.decode_row(row) {
                        Ok((row, key)) => ops.push(RowOp {
                            kind: RowOpKind::Insert,
                            key,
                            row,
                        }),
                        Err(e) => log::error!("Error while deserializing row: {e}"),
                    }
                }
            }
            parsed.push((info.clone(), ops));
        }
        Some(parsed)
    }

    fn fire_row_callbacks(&self, ctx: &EventContext, pending: Vec<PendingRowCallback>) {
        for staged in pending {
            match staged.callback {
                RowCallback::Insert(row) => {
                    let callbacks = {
                        let registry = self.lock_db_callbacks();
                        registry
                            .get_table(&staged.table_name)
                            .map(|table| table.on_insert.snapshot())
                            .unwrap_or_default()
                    };
                    for callback in callbacks {
                        callback(ctx, &row);
                    }
                }
                RowCallback::Delete(row) => {
                    let callbacks = {
                        let registry = self.lock_db_callbacks();
                        registry
                            .get_table(&staged.table_name)
                            .map(|table| table.on_delete.snapshot())
                            .unwrap_or_default()
                    };
                    for callback in callbacks {
                        callback(ctx, &row);
                    }
                }
                RowCallback::Update { old, new } => {
                    let callbacks = {
                        let registry = self.lock_db_callbacks();
                        registry
                            .get_table(&staged.table_name)
                            .map(|table| table.on_update.snapshot())
                            .unwrap_or_default()
                    };
                    for callback in callbacks {
                        callback(ctx, &old, &new);
                    }
                }
            }
        }
    }

    fn handle_transport_error(&self, error: SdkError) {
        {
            let mut state = self.lock_state();
            state.is_active = false;
            state.terminated = true;
            state.connection_error = Some(error.to_string().into());
        }
        let callbacks = self.lock_connection_callbacks().on_connect_error.snapshot();
        for callback in callbacks {
            callback(self, &error);
        }
    }

    fn handle_closed(&self) {
        {
            let mut state = self.lock_state();
            state.is_active = false;
            state.terminated = true;
        }
        let callbacks = self.lock_connection_callbacks().on_disconnect.snapshot();
        for callback in callbacks {
            callback(self, None);
        }
    }

    fn event_context(&self, event: Event) -> EventContext {
        EventContext {
            db: DbConnection {
                inner: self.inner.clone(),
                runtime: None,
            },
            event,
        }
    }

    // Lock helpers. Each lock is held only for the enclosed mutation or
    // snapshot, never across user callbacks.

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.inner.state.lock().expect("ConnectionState Mutex is poisoned")
    }

    fn lock_client_cache(&self) -> std::sync::MutexGuard<'_, ClientCache> {
        self.inner.client_cache.lock().expect("ClientCache Mutex is poisoned")
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, SubscriptionManager> {
        self.inner
            .subscriptions
            .lock()
            .expect("SubscriptionManager Mutex is poisoned")
    }

    fn lock_db_callbacks(&self) -> std::sync::MutexGuard<'_, DbCallbacks> {
        self.inner.db_callbacks.lock().expect("DbCallbacks Mutex is poisoned")
    }

    fn lock_reducer_callbacks(&self) -> std::sync::MutexGuard<'_, ReducerCallbacks> {
        self.inner
            .reducer_callbacks
            .lock()
            .expect("ReducerCallbacks Mutex is poisoned")
    }

    fn lock_connection_callbacks(&self) -> std::sync::MutexGuard<'_, ConnectionCallbacks> {
        self.inner
            .connection_callbacks
            .lock()
            .expect("ConnectionCallbacks Mutex is poisoned")
    }
}

/// A view onto the client cache of one table.
#[derive(Clone)]
pub struct TableHandle {
    conn: DbConnection,
    info: Arc<TableRuntimeInfo>,
}

impl TableHandle {
    pub fn table_name(&self) -> &str {
        &self.info.table_name
    }

    /// The number of subscribed rows currently resident.
    pub fn count(&self) -> usize {
        self.conn
            .lock_client_cache()
            .get_table(&self.info.table_name)
            .map(|table| table.count())
            .unwrap_or(0)
    }

    /// Snapshots of all resident rows.
    pub fn iter(&self) -> impl Iterator<Item = ProductValue> + use<> {
        self.conn
            .lock_client_cache()
            .get_table(&self.info.table_name)
            .map(|table| table.values())
            .unwrap_or_default()
            .into_iter()
    }

    pub fn on_insert(&self, callback: impl Fn(&EventContext, &ProductValue) + Send + Sync + 'static) -> CallbackId {
        self.conn
            .lock_db_callbacks()
            .table(&self.info.table_name)
            .on_insert
            .insert(Arc::new(callback))
    }

    pub fn remove_on_insert(&self, callback_id: CallbackId) -> bool {
        self.conn
            .lock_db_callbacks()
            .table(&self.info.table_name)
            .on_insert
            .remove(callback_id)
    }

    pub fn on_delete(&self, callback: impl Fn(&EventContext, &ProductValue) + Send + Sync + 'static) -> CallbackId {
        self.conn
            .lock_db_callbacks()
            .table(&self.info.table_name)
            .on_delete
            .insert(Arc::new(callback))
    }

    pub fn remove_on_delete(&self, callback_id: CallbackId) -> bool {
        self.conn
            .lock_db_callbacks()
            .table(&self.info.table_name)
            .on_delete
            .remove(callback_id)
    }

    /// Only tables with a primary key produce update events.
    pub fn on_update(
        &self,
        callback: impl Fn(&EventContext, &ProductValue, &ProductValue) + Send + Sync + 'static,
    ) -> CallbackId {
        self.conn
            .lock_db_callbacks()
            .table(&self.info.table_name)
            .on_update
            .insert(Arc::new(callback))
    }

    pub fn remove_on_update(&self, callback_id: CallbackId) -> bool {
        self.conn
            .lock_db_callbacks()
            .table(&self.info.table_name)
            .on_update
            .remove(callback_id)
    }

    /// A point-lookup handle through the named unique index.
    pub fn unique_index(&self, index_name: &str) -> Result<UniqueIndexHandle, SdkError> {
        let index = self.lookup_index(index_name, true)?;
        Ok(UniqueIndexHandle {
            conn: self.conn.clone(),
            info: self.info.clone(),
            index,
        })
    }

    /// A range-scan handle through the named B-tree index.
    pub fn btree_index(&self, index_name: &str) -> Result<BTreeIndexHandle, SdkError> {
        let index = self.lookup_index(index_name, false)?;
        Ok(BTreeIndexHandle {
            conn: self.conn.clone(),
            info: self.info.clone(),
            index,
        })
    }

    fn lookup_index(&self, index_name: &str, require_unique: bool) -> Result<IndexRuntimeInfo, SdkError> {
        self.info
            .index(index_name)
            .filter(|index| index.unique || !require_unique)
            .cloned()
            .ok_or_else(|| SdkError::UnknownIndex {
                table_name: self.info.table_name.clone(),
                index_name: index_name.into(),
            })
    }
}

/// Point lookups through a unique index.
#[derive(Clone)]
pub struct UniqueIndexHandle {
    conn: DbConnection,
    info: Arc<TableRuntimeInfo>,
    index: IndexRuntimeInfo,
}

impl UniqueIndexHandle {
    /// The unique row whose indexed columns equal `key`, if resident.
    pub fn find(&self, key: &[AlgebraicValue]) -> Option<ProductValue> {
        self.conn
            .lock_client_cache()
            .get_table(&self.info.table_name)
            .and_then(|table| table.find_unique(&self.index, key))
    }
}

/// Range scans through a non-unique B-tree index.
#[derive(Clone)]
pub struct BTreeIndexHandle {
    conn: DbConnection,
    info: Arc<TableRuntimeInfo>,
    index: IndexRuntimeInfo,
}

impl BTreeIndexHandle {
    /// All resident rows matching `range`.
    pub fn filter(&self, range: &IndexRange) -> Vec<ProductValue> {
        self.conn
            .lock_client_cache()
            .get_table(&self.info.table_name)
            .map(|table| table.scan_index(&self.index, range))
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(module: ModuleDef) -> (DbConnection, mpsc::UnboundedReceiver<WsSend>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (send_chan, send_recv) = mpsc::unbounded();
    let module = Arc::new(module);
    let inner = Arc::new(ConnectionInner {
        module: module.clone(),
        state: Mutex::new(ConnectionState {
            is_active: true,
            terminated: false,
            close_requested: false,
            identity: None,
            token: None,
            connection_id: ConnectionId::from_u128(0xabcd),
            connection_error: None,
        }),
        client_cache: Mutex::new(ClientCache::new(module)),
        subscriptions: Mutex::new(SubscriptionManager::default()),
        db_callbacks: Mutex::new(DbCallbacks::default()),
        reducer_callbacks: Mutex::new(ReducerCallbacks::default()),
        connection_callbacks: Mutex::new(ConnectionCallbacks::default()),
        send_chan,
        next_request_id: AtomicU32::new(1),
    });
    (DbConnection { inner, runtime: None }, send_recv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ReducerRuntimeInfo;
    use spacetimedb_client_api_messages::energy::EnergyQuanta;
    use spacetimedb_client_api_messages::websocket::{
        BsatnRowList, CompressableQueryUpdate, IdentityToken, QueryUpdate, ReducerCallInfo, SubscribeMultiApplied,
        SubscriptionError, TableUpdate as WsTableUpdate, UnsubscribeMultiApplied,
    };
    use spacetimedb_sats::algebraic_type::ProductType;
    use spacetimedb_sats::{AlgebraicType, TimeDuration, Timestamp};

    fn module() -> ModuleDef {
        ModuleDef::new(
            [
                TableRuntimeInfo::new(
                    "user",
                    ProductType::new([("id", AlgebraicType::U32), ("name", AlgebraicType::String)]),
                )
                .with_primary_key("id")
                .unwrap(),
                TableRuntimeInfo::new("log", ProductType::new([("msg", AlgebraicType::String)])),
            ],
            [ReducerRuntimeInfo::new(
                "set_name",
                ProductType::new([("name", AlgebraicType::String)]),
            )],
        )
    }

    fn user_row_bytes(id: u32, name: &str) -> Bytes {
        let mut bytes = Vec::new();
        ProductValue::new([AlgebraicValue::U32(id), AlgebraicValue::String(name.into())]).encode(&mut bytes);
        Bytes::from(bytes)
    }

    fn user_update(deletes: Vec<Bytes>, inserts: Vec<Bytes>) -> DatabaseUpdate {
        DatabaseUpdate {
            tables: vec![WsTableUpdate {
                table_name: "user".into(),
                updates: vec![CompressableQueryUpdate::Uncompressed(QueryUpdate {
                    deletes: deletes.into_iter().collect::<BsatnRowList>(),
                    inserts: inserts.into_iter().collect::<BsatnRowList>(),
                })],
            }],
        }
    }

    fn subscribe_applied(query_id: QueryId, update: DatabaseUpdate) -> ServerMessage {
        ServerMessage::SubscribeMultiApplied(SubscribeMultiApplied {
            request_id: 0,
            total_host_execution_duration: TimeDuration::ZERO,
            query_id,
            update,
        })
    }

    fn committed_transaction(reducer_name: &str, args: Bytes, update: DatabaseUpdate) -> ServerMessage {
        ServerMessage::TransactionUpdate(TransactionUpdate {
            status: UpdateStatus::Committed(update),
            timestamp: Timestamp::from_micros(1),
            caller_identity: Identity::ZERO,
            caller_connection_id: ConnectionId::from_u128(5),
            reducer_call: ReducerCallInfo {
                reducer_name: reducer_name.into(),
                request_id: 0,
                args,
            },
            energy_quanta_used: EnergyQuanta::ZERO,
            total_host_execution_duration: TimeDuration::ZERO,
        })
    }

    fn recorded() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone + Send + Sync + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let writer = {
            let log = log.clone();
            move |entry: &str| log.lock().unwrap().push(entry.to_string())
        };
        (log, writer)
    }

    fn sent_client_messages(recv: &mut mpsc::UnboundedReceiver<WsSend>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(Some(send)) = recv.try_next() {
            if let WsSend::Message(bytes) = send {
                out.push(ClientMessage::decode(&mut Reader::new(&bytes)).unwrap());
            }
        }
        out
    }

    #[test]
    fn overlapping_subscriptions_share_rows() {
        let (conn, mut sent) = test_connection(module());
        let (log, record) = recorded();

        let users = conn.table("user").unwrap();
        users.on_insert({
            let record = record.clone();
            move |_, row| record(&format!("insert {:?}", row.field(0).unwrap()))
        });
        users.on_delete({
            let record = record.clone();
            move |_, row| record(&format!("delete {:?}", row.field(0).unwrap()))
        });

        let sub_a = conn
            .subscription_builder()
            .subscribe(["SELECT * FROM user WHERE id = 1"])
            .unwrap();
        let sub_b = conn
            .subscription_builder()
            .subscribe(["SELECT * FROM user WHERE id IN (1, 2)"])
            .unwrap();
        assert_ne!(sub_a.query_id, sub_b.query_id);

        // Both result sets contain row 1; only B contains row 2.
        conn.handle_message(subscribe_applied(
            sub_a.query_id,
            user_update(vec![], vec![user_row_bytes(1, "a")]),
        ));
        conn.handle_message(subscribe_applied(
            sub_b.query_id,
            user_update(vec![], vec![user_row_bytes(1, "a"), user_row_bytes(2, "b")]),
        ));

        assert_eq!(*log.lock().unwrap(), vec!["insert U32(1)", "insert U32(2)"]);
        assert_eq!(users.count(), 2);
        assert!(sub_a.is_active() && sub_b.is_active());

        // Ending the narrower subscription drops its reference to row 1, but
        // the row stays visible through B: no delete callback.
        sub_a.unsubscribe().unwrap();
        conn.handle_message(ServerMessage::UnsubscribeMultiApplied(UnsubscribeMultiApplied {
            request_id: 0,
            total_host_execution_duration: TimeDuration::ZERO,
            query_id: sub_a.query_id,
            update: user_update(vec![user_row_bytes(1, "a")], vec![]),
        }));

        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(users.count(), 2);
        assert!(sub_a.is_ended());
        assert!(!sub_b.is_ended());

        let messages = sent_client_messages(&mut sent);
        assert_eq!(messages.len(), 3);
        assert!(matches!(&messages[2], ClientMessage::UnsubscribeMulti(m) if m.query_id == sub_a.query_id));
    }

    #[test]
    fn primary_key_update_fires_one_update() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();

        let users = conn.table("user").unwrap();
        users.on_insert({
            let record = record.clone();
            move |_, _| record("insert")
        });
        users.on_delete({
            let record = record.clone();
            move |_, _| record("delete")
        });
        users.on_update({
            let record = record.clone();
            move |_, old, new| {
                record(&format!(
                    "update {:?} -> {:?}",
                    old.field(1).unwrap().as_string().unwrap(),
                    new.field(1).unwrap().as_string().unwrap()
                ))
            }
        });

        let sub = conn.subscription_builder().subscribe(["SELECT * FROM user"]).unwrap();
        conn.handle_message(subscribe_applied(
            sub.query_id,
            user_update(vec![], vec![user_row_bytes(1, "A")]),
        ));

        conn.handle_message(committed_transaction(
            "unlisted_reducer",
            Bytes::new(),
            user_update(vec![user_row_bytes(1, "A")], vec![user_row_bytes(1, "B")]),
        ));

        assert_eq!(*log.lock().unwrap(), vec!["insert", "update \"A\" -> \"B\""]);
        let rows: Vec<_> = users.iter().collect();
        assert_eq!(rows, vec![ProductValue::new([
            AlgebraicValue::U32(1),
            AlgebraicValue::String("B".into())
        ])]);
    }

    #[test]
    fn known_reducer_fires_callback_after_lifecycle_and_before_rows() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();

        conn.table("user").unwrap().on_insert({
            let record = record.clone();
            move |ctx, _| {
                assert!(matches!(ctx.event, Event::Reducer(_)));
                record("row");
            }
        });
        conn.on_reducer("set_name", {
            let record = record.clone();
            move |ctx, args| {
                let Event::Reducer(reducer_event) = &ctx.event else {
                    panic!("reducer callback fired with non-reducer event");
                };
                assert!(reducer_event.status.is_committed());
                assert_eq!(reducer_event.caller_connection_id, Some(ConnectionId::from_u128(5)));
                record(&format!("reducer {:?}", args.field(0).unwrap().as_string().unwrap()));
            }
        });

        let mut args = Vec::new();
        ProductValue::new([AlgebraicValue::String("B".into())]).encode(&mut args);
        conn.handle_message(committed_transaction(
            "set_name",
            Bytes::from(args),
            user_update(vec![], vec![user_row_bytes(1, "B")]),
        ));

        assert_eq!(*log.lock().unwrap(), vec!["reducer \"B\"", "row"]);
    }

    #[test]
    fn unknown_reducer_still_applies_rows() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();

        conn.table("user").unwrap().on_insert({
            let record = record.clone();
            move |ctx, _| {
                assert!(matches!(ctx.event, Event::UnknownTransaction));
                record("row");
            }
        });
        conn.on_reducer("set_name", {
            let record = record.clone();
            move |_, _| record("reducer")
        });

        conn.handle_message(committed_transaction(
            "mystery_v2",
            Bytes::new(),
            user_update(vec![], vec![user_row_bytes(1, "x")]),
        ));

        assert_eq!(*log.lock().unwrap(), vec!["row"]);
        assert_eq!(conn.table("user").unwrap().count(), 1);
    }

    #[test]
    fn none_reducer_sentinel_drops_the_whole_message() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();
        conn.table("user").unwrap().on_insert(move |_, _| record("row"));

        conn.handle_message(ServerMessage::TransactionUpdate(TransactionUpdate {
            status: UpdateStatus::Failed("boom".into()),
            timestamp: Timestamp::from_micros(0),
            caller_identity: Identity::ZERO,
            caller_connection_id: ConnectionId::ZERO,
            reducer_call: ReducerCallInfo {
                reducer_name: "<none>".into(),
                request_id: 0,
                args: Bytes::new(),
            },
            energy_quanta_used: EnergyQuanta::ZERO,
            total_host_execution_duration: TimeDuration::ZERO,
        }));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(conn.table("user").unwrap().count(), 0);
    }

    #[test]
    fn frames_dispatch_in_arrival_order() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();
        conn.table("user").unwrap().on_insert(move |_, row| {
            record(&format!("{:?}", row.field(0).unwrap()));
        });

        let m1 = committed_transaction("r", Bytes::new(), user_update(vec![], vec![user_row_bytes(1, "a")]));
        let m2 = committed_transaction("r", Bytes::new(), user_update(vec![], vec![user_row_bytes(2, "b")]));
        conn.handle_frame(&m1.to_vec());
        conn.handle_frame(&m2.to_vec());

        assert_eq!(*log.lock().unwrap(), vec!["U32(1)", "U32(2)"]);
    }

    #[test]
    fn applied_callback_fires_before_staged_row_callbacks() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();

        conn.table("user").unwrap().on_insert({
            let record = record.clone();
            move |_, _| record("row")
        });
        let sub = conn
            .subscription_builder()
            .on_applied({
                let record = record.clone();
                move |_| record("applied")
            })
            .subscribe(["SELECT * FROM user"])
            .unwrap();

        conn.handle_message(subscribe_applied(
            sub.query_id,
            user_update(vec![], vec![user_row_bytes(1, "a")]),
        ));

        assert_eq!(*log.lock().unwrap(), vec!["applied", "row"]);
        assert!(sub.is_active());
    }

    #[test]
    fn targeted_subscription_error_only_hits_its_subscription() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();

        let subscribe = |name: &str| {
            let record = record.clone();
            let name = name.to_string();
            conn.subscription_builder()
                .on_error(move |_, error| record(&format!("{name} error: {error}")))
                .subscribe(["SELECT * FROM user"])
                .unwrap()
        };
        let a = subscribe("a");
        let b = subscribe("b");
        let c = subscribe("c");
        for sub in [&a, &b, &c] {
            conn.handle_message(subscribe_applied(sub.query_id, DatabaseUpdate::default()));
        }

        conn.handle_message(ServerMessage::SubscriptionError(SubscriptionError {
            total_host_execution_duration: TimeDuration::ZERO,
            request_id: None,
            query_id: Some(b.query_id),
            error: "bad query".into(),
        }));

        assert_eq!(*log.lock().unwrap(), vec!["b error: bad query"]);
        assert!(b.is_ended());
        assert!(a.is_active() && c.is_active());

        // The survivors still receive row updates.
        conn.table("user").unwrap().on_insert({
            let record = record.clone();
            move |_, _| record("row")
        });
        conn.handle_message(committed_transaction(
            "r",
            Bytes::new(),
            user_update(vec![], vec![user_row_bytes(7, "g")]),
        ));
        assert!(log.lock().unwrap().contains(&"row".to_string()));
    }

    #[test]
    fn broadcast_subscription_error_hits_every_subscription_but_keeps_them() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();

        for _ in 0..2 {
            let record = record.clone();
            let sub = conn
                .subscription_builder()
                .on_error(move |_, error| record(&format!("error: {error}")))
                .subscribe(["SELECT * FROM user"])
                .unwrap();
            conn.handle_message(subscribe_applied(sub.query_id, DatabaseUpdate::default()));
        }

        conn.handle_message(ServerMessage::SubscriptionError(SubscriptionError {
            total_host_execution_duration: TimeDuration::ZERO,
            request_id: None,
            query_id: None,
            error: "server fell over".into(),
        }));

        assert_eq!(log.lock().unwrap().len(), 2);
        assert!(conn.is_active());
    }

    #[test]
    fn empty_subscription_fails_before_any_network_io() {
        let (conn, mut sent) = test_connection(module());
        let err = conn.subscription_builder().subscribe(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, SdkError::EmptyQuerySet));
        assert!(sent_client_messages(&mut sent).is_empty());
    }

    #[test]
    fn double_unsubscribe_fails_deterministically() {
        let (conn, _sent) = test_connection(module());
        let sub = conn.subscription_builder().subscribe(["SELECT * FROM user"]).unwrap();
        sub.unsubscribe().unwrap();
        let err = sub.unsubscribe().unwrap_err();
        assert!(matches!(err, SdkError::AlreadyUnsubscribed { .. }));
    }

    #[test]
    fn identity_token_stores_credentials_and_fires_connect() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();
        conn.on_connect(move |conn, identity, token| {
            assert!(conn.identity().is_some());
            record(&format!("connect {identity} {token}"));
        });

        let identity = Identity::from_hex(&"11".repeat(32)).unwrap();
        conn.handle_message(ServerMessage::IdentityToken(IdentityToken {
            identity,
            token: "minted".into(),
            connection_id: ConnectionId::from_u128(9),
        }));

        assert_eq!(*log.lock().unwrap(), vec![format!("connect {identity} minted")]);
        assert_eq!(conn.token().as_deref(), Some("minted"));
        assert_eq!(conn.connection_id(), ConnectionId::from_u128(9));
    }

    #[test]
    fn one_off_query_response_is_dropped_without_panicking() {
        let (conn, _sent) = test_connection(module());
        conn.handle_message(ServerMessage::OneOffQueryResponse);
        assert!(conn.is_active());
    }

    #[test]
    fn call_reducer_sends_an_encoded_call() {
        let (conn, mut sent) = test_connection(module());
        conn.call_reducer("set_name", Bytes::from_static(b"\x01\0\0\0B"), CallReducerFlags::NoSuccessNotify)
            .unwrap();
        let messages = sent_client_messages(&mut sent);
        match &messages[..] {
            [ClientMessage::CallReducer(call)] => {
                assert_eq!(&*call.reducer, "set_name");
                assert_eq!(call.flags, CallReducerFlags::NoSuccessNotify);
            }
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[test]
    fn terminated_connections_ignore_frames() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();
        conn.table("user").unwrap().on_insert(move |_, _| record("row"));

        conn.handle_closed();
        assert!(!conn.is_active());

        let msg = committed_transaction("r", Bytes::new(), user_update(vec![], vec![user_row_bytes(1, "a")]));
        conn.handle_frame(&msg.to_vec());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn transport_error_fires_connect_error_and_records_it() {
        let (conn, _sent) = test_connection(module());
        let (log, record) = recorded();
        conn.on_connect_error(move |_, error| record(&format!("error: {error}")));

        conn.handle_transport_error(SdkError::Ws(crate::websocket::WsError::BrotliUnsupported));

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(log.lock().unwrap()[0].contains("Brotli"));
        assert!(!conn.is_active());
        assert!(conn.connection_error().unwrap().contains("Brotli"));
    }
}
