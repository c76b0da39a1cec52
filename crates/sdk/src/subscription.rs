//! Subscription lifecycle management.
//!
//! One WebSocket multiplexes any number of subscriptions, each identified by
//! a client-allocated [`QueryId`]. The manager's map is the authority on
//! which subscriptions exist; [`SubscriptionHandle`]s are view objects keyed
//! by query id. A subscription is `Pending` from the moment `SubscribeMulti`
//! is sent, `Active` once `SubscribeMultiApplied` arrives, and `Ended` after
//! `UnsubscribeMultiApplied` or a `SubscriptionError` naming it.

use crate::db_connection::DbConnection;
use crate::error::SdkError;
use crate::event::EventContext;
use spacetimedb_client_api_messages::websocket::QueryId;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type AppliedCallback = Arc<dyn Fn(&EventContext) + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(&EventContext, &str) + Send + Sync>;
pub(crate) type EndCallback = Arc<dyn Fn(&EventContext) + Send + Sync>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum SubscriptionStatus {
    Pending,
    Active,
}

pub(crate) struct SubscriptionEntry {
    pub(crate) query_sqls: Vec<Box<str>>,
    pub(crate) status: SubscriptionStatus,
    /// Set once `UnsubscribeMulti` has been sent; the entry stays in the map
    /// until the server acknowledges, but a second unsubscribe must fail.
    pub(crate) unsubscribe_sent: bool,
    pub(crate) on_applied: Option<AppliedCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_end: Option<EndCallback>,
}

/// Owns every live subscription of one connection and allocates their ids.
#[derive(Default)]
pub(crate) struct SubscriptionManager {
    entries: HashMap<u32, SubscriptionEntry>,
    /// Monotonic; ids are never reused within a connection.
    next_query_id: u32,
}

impl SubscriptionManager {
    pub(crate) fn register(
        &mut self,
        query_sqls: Vec<Box<str>>,
        on_applied: Option<AppliedCallback>,
        on_error: Option<ErrorCallback>,
    ) -> QueryId {
        self.next_query_id += 1;
        let query_id = QueryId::new(self.next_query_id);
        self.entries.insert(
            query_id.id,
            SubscriptionEntry {
                query_sqls,
                status: SubscriptionStatus::Pending,
                unsubscribe_sent: false,
                on_applied,
                on_error,
                on_end: None,
            },
        );
        query_id
    }

    /// Drop a registration whose `SubscribeMulti` never made it out.
    pub(crate) fn abort_register(&mut self, query_id: QueryId) {
        self.entries.remove(&query_id.id);
    }

    /// Mark that `UnsubscribeMulti` is being sent for `query_id`.
    ///
    /// Fails deterministically if the subscription is unknown, already ended,
    /// or already unsubscribing.
    pub(crate) fn start_unsubscribe(&mut self, query_id: QueryId) -> Result<(), SdkError> {
        let entry = self
            .entries
            .get_mut(&query_id.id)
            .ok_or(SdkError::AlreadyUnsubscribed { query_id: query_id.id })?;
        if entry.unsubscribe_sent {
            return Err(SdkError::AlreadyUnsubscribed { query_id: query_id.id });
        }
        entry.unsubscribe_sent = true;
        Ok(())
    }

    pub(crate) fn set_on_end(&mut self, query_id: QueryId, on_end: EndCallback) {
        if let Some(entry) = self.entries.get_mut(&query_id.id) {
            entry.on_end = Some(on_end);
        }
    }

    /// Handle `SubscribeMultiApplied`. `None` if the id is stale, in which
    /// case the caller must skip the cache mutation too.
    pub(crate) fn applied(&mut self, query_id: QueryId) -> Option<Option<AppliedCallback>> {
        let entry = self.entries.get_mut(&query_id.id)?;
        entry.status = SubscriptionStatus::Active;
        Some(entry.on_applied.clone())
    }

    /// Handle `UnsubscribeMultiApplied`: the subscription is over, remove it.
    pub(crate) fn unsubscribe_applied(&mut self, query_id: QueryId) -> Option<Option<EndCallback>> {
        self.entries.remove(&query_id.id).map(|entry| entry.on_end)
    }

    /// Handle a `SubscriptionError` naming `query_id`: remove the entry and
    /// hand back its error callback.
    pub(crate) fn error(&mut self, query_id: QueryId) -> Option<Option<ErrorCallback>> {
        self.entries.remove(&query_id.id).map(|entry| entry.on_error)
    }

    /// Handle a connection-scoped `SubscriptionError`: every subscription's
    /// error callback fires, but the entries stay.
    ///
    /// The cache may now disagree with the server. Whether the connection
    /// should be torn down instead is an open question; for now this matches
    /// the reference behavior of reporting and carrying on.
    pub(crate) fn broadcast_error(&mut self) -> Vec<ErrorCallback> {
        self.entries.values().filter_map(|entry| entry.on_error.clone()).collect()
    }

    pub(crate) fn is_active(&self, query_id: QueryId) -> bool {
        self.entries
            .get(&query_id.id)
            .is_some_and(|entry| entry.status == SubscriptionStatus::Active && !entry.unsubscribe_sent)
    }

    pub(crate) fn is_ended(&self, query_id: QueryId) -> bool {
        !self.entries.contains_key(&query_id.id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Fluent construction of one subscription.
pub struct SubscriptionBuilder {
    conn: DbConnection,
    on_applied: Option<AppliedCallback>,
    on_error: Option<ErrorCallback>,
}

impl SubscriptionBuilder {
    pub(crate) fn new(conn: DbConnection) -> Self {
        SubscriptionBuilder {
            conn,
            on_applied: None,
            on_error: None,
        }
    }

    /// Invoked when the server has applied the subscription and its initial
    /// rows are in the cache.
    pub fn on_applied(mut self, callback: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_applied = Some(Arc::new(callback));
        self
    }

    /// Invoked if the subscription fails, at registration or later.
    pub fn on_error(mut self, callback: impl Fn(&EventContext, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Register a subscription for the given SQL queries.
    ///
    /// Fails before any network I/O if `queries` is empty.
    pub fn subscribe<S: Into<Box<str>>>(
        self,
        queries: impl IntoIterator<Item = S>,
    ) -> Result<SubscriptionHandle, SdkError> {
        let query_sqls: Vec<Box<str>> = queries.into_iter().map(Into::into).collect();
        if query_sqls.is_empty() {
            return Err(SdkError::EmptyQuerySet);
        }
        self.conn.register_subscription(query_sqls, self.on_applied, self.on_error)
    }

    /// Subscribe to every row of every table.
    pub fn subscribe_to_all_tables(self) -> Result<SubscriptionHandle, SdkError> {
        self.subscribe(["SELECT * FROM *"])
    }
}

/// A view onto one registered subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub(crate) conn: DbConnection,
    pub(crate) query_id: QueryId,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("query_id", &self.query_id)
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    /// True once `SubscribeMultiApplied` has arrived and until the
    /// subscription starts ending.
    pub fn is_active(&self) -> bool {
        self.conn.subscription_is_active(self.query_id)
    }

    /// True once the subscription has ended, by unsubscribe or error.
    pub fn is_ended(&self) -> bool {
        self.conn.subscription_is_ended(self.query_id)
    }

    /// Ask the server to end this subscription.
    ///
    /// Resolution is asynchronous: rows leave the cache and `is_ended`
    /// becomes true only when `UnsubscribeMultiApplied` arrives. Calling this
    /// twice on the same subscription fails.
    pub fn unsubscribe(&self) -> Result<(), SdkError> {
        self.conn.unsubscribe(self.query_id)
    }

    /// Like [`Self::unsubscribe`], but invoke `on_end` once the unsubscribe
    /// has been applied.
    pub fn unsubscribe_then(&self, on_end: impl Fn(&EventContext) + Send + Sync + 'static) -> Result<(), SdkError> {
        self.conn.set_subscription_on_end(self.query_id, Arc::new(on_end));
        self.unsubscribe()
    }
}
