//! Registries of user callbacks.
//!
//! Each event supports any number of listeners; invocation order within one
//! event is registration order, and removal is by the [`CallbackId`] returned
//! at registration. Registries hand out snapshots of their callback lists so
//! that dispatch can run user code without holding any registry lock, which
//! lets callbacks re-register or remove callbacks without deadlocking.

use crate::event::EventContext;
use spacetimedb_sats::ProductValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies one registered callback, for later removal.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CallbackId {
    id: usize,
}

/// An ordered multimap of callbacks for one event.
pub(crate) struct CallbackMap<F: ?Sized> {
    next_id: usize,
    callbacks: Vec<(CallbackId, Arc<F>)>,
}

// Not derived: `F` need not be `Default`.
impl<F: ?Sized> Default for CallbackMap<F> {
    fn default() -> Self {
        CallbackMap {
            next_id: 0,
            callbacks: Vec::new(),
        }
    }
}

impl<F: ?Sized> CallbackMap<F> {
    pub(crate) fn insert(&mut self, callback: Arc<F>) -> CallbackId {
        let id = CallbackId { id: self.next_id };
        self.next_id += 1;
        self.callbacks.push((id, callback));
        id
    }

    /// Returns false if `id` was not present.
    pub(crate) fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(cb_id, _)| *cb_id != id);
        self.callbacks.len() != before
    }

    /// The current callbacks, in registration order, detached from the
    /// registry so they can be invoked without holding its lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

pub(crate) type RowCallbackFn = dyn Fn(&EventContext, &ProductValue) + Send + Sync;
pub(crate) type UpdateCallbackFn = dyn Fn(&EventContext, &ProductValue, &ProductValue) + Send + Sync;
pub(crate) type ReducerCallbackFn = dyn Fn(&EventContext, &ProductValue) + Send + Sync;

/// Row callbacks for one table.
#[derive(Default)]
pub(crate) struct TableCallbacks {
    pub(crate) on_insert: CallbackMap<RowCallbackFn>,
    pub(crate) on_delete: CallbackMap<RowCallbackFn>,
    pub(crate) on_update: CallbackMap<UpdateCallbackFn>,
}

/// Row callbacks for every table, created lazily per table name.
#[derive(Default)]
pub(crate) struct DbCallbacks {
    tables: HashMap<Box<str>, TableCallbacks>,
}

impl DbCallbacks {
    pub(crate) fn table(&mut self, table_name: &str) -> &mut TableCallbacks {
        self.tables.entry(table_name.into()).or_default()
    }

    pub(crate) fn get_table(&self, table_name: &str) -> Option<&TableCallbacks> {
        self.tables.get(table_name)
    }
}

/// Callbacks keyed by reducer name.
#[derive(Default)]
pub(crate) struct ReducerCallbacks {
    reducers: HashMap<Box<str>, CallbackMap<ReducerCallbackFn>>,
}

impl ReducerCallbacks {
    pub(crate) fn register(&mut self, reducer_name: &str, callback: Arc<ReducerCallbackFn>) -> CallbackId {
        self.reducers.entry(reducer_name.into()).or_default().insert(callback)
    }

    pub(crate) fn remove(&mut self, reducer_name: &str, id: CallbackId) -> bool {
        self.reducers.get_mut(reducer_name).is_some_and(|map| map.remove(id))
    }

    pub(crate) fn snapshot(&self, reducer_name: &str) -> Vec<Arc<ReducerCallbackFn>> {
        self.reducers.get(reducer_name).map(|map| map.snapshot()).unwrap_or_default()
    }
}
