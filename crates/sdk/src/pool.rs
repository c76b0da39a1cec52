//! Sharing one physical connection between independent consumers.
//!
//! Several parts of an application may each want a connection to the same
//! database. The pool hands out clones of one [`DbConnection`] per
//! `(uri, module)` key and reference-counts them. Releasing the last
//! reference schedules teardown onto a later turn of the event loop, so a
//! consumer that releases and immediately re-retains (a re-render, say) does
//! not bounce the socket. The pool contains no protocol logic.

use crate::callbacks::{CallbackId, CallbackMap};
use crate::db_connection::DbConnection;
use crate::error::SdkError;
use once_cell::sync::Lazy;
use spacetimedb_sats::{ConnectionId, Identity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// `(uri, database name or address)`.
pub type PoolKey = (Box<str>, Box<str>);

/// The connection state a pool listener observes.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionSnapshot {
    pub is_active: bool,
    pub identity: Option<Identity>,
    pub token: Option<Box<str>>,
    pub connection_id: ConnectionId,
    pub connection_error: Option<Box<str>>,
}

impl ConnectionSnapshot {
    fn of(conn: &DbConnection) -> Self {
        ConnectionSnapshot {
            is_active: conn.is_active(),
            identity: conn.identity(),
            token: conn.token(),
            connection_id: conn.connection_id(),
            connection_error: conn.connection_error(),
        }
    }
}

type SnapshotListenerFn = dyn Fn(&ConnectionSnapshot) + Send + Sync;

struct PoolEntry {
    conn: DbConnection,
    /// A scheduled teardown re-checks this count before acting, so an
    /// interleaved retain cancels it.
    ref_count: usize,
    listeners: CallbackMap<SnapshotListenerFn>,
}

#[derive(Default)]
struct PoolInner {
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
}

/// A reference-counted registry of shared connections.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

static GLOBAL_POOL: Lazy<ConnectionPool> = Lazy::new(ConnectionPool::default);

impl ConnectionPool {
    /// The process-wide pool.
    pub fn global() -> ConnectionPool {
        GLOBAL_POOL.clone()
    }

    /// Get the shared connection for `key`, creating it with `connect` on
    /// first use. Increments the reference count and cancels any teardown
    /// scheduled by an earlier [`Self::release`].
    pub fn retain(
        &self,
        key: PoolKey,
        connect: impl FnOnce() -> Result<DbConnection, SdkError>,
    ) -> Result<DbConnection, SdkError> {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(&key) {
            entry.ref_count += 1;
            return Ok(entry.conn.clone());
        }

        let conn = connect()?;
        self.register_state_hooks(&key, &conn);
        entries.insert(
            key,
            PoolEntry {
                conn: conn.clone(),
                ref_count: 1,
                listeners: CallbackMap::default(),
            },
        );
        Ok(conn)
    }

    /// Drop one reference to `key`'s connection. When the count reaches
    /// zero, teardown is deferred one scheduler turn so an immediate
    /// re-retain keeps the socket.
    pub fn release(&self, key: &PoolKey) {
        let handle = {
            let mut entries = self.lock_entries();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 {
                return;
            }
            entry.conn.runtime_handle()
        };

        let pool = Arc::downgrade(&self.inner);
        let key = key.clone();
        match handle {
            Some(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    Self::finish_release(pool, &key);
                });
            }
            // No event loop to defer to; tear down immediately.
            None => Self::finish_release(pool, &key),
        }
    }

    fn finish_release(pool: Weak<PoolInner>, key: &PoolKey) {
        let Some(pool) = pool.upgrade() else {
            return;
        };
        let mut entries = pool.entries.lock().expect("ConnectionPool Mutex is poisoned");
        // An interleaved retain brought the count back up; keep the socket.
        if !entries.get(key).is_some_and(|entry| entry.ref_count == 0) {
            return;
        }
        if let Some(entry) = entries.remove(key) {
            drop(entries);
            if let Err(e) = entry.conn.disconnect() {
                log::debug!("Releasing pooled connection that is already closed: {e}");
            }
        }
    }

    /// Register a state-change listener on `key`'s connection. Listeners run
    /// synchronously from within the connection's dispatch.
    pub fn subscribe(&self, key: &PoolKey, listener: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static) -> Option<CallbackId> {
        let mut entries = self.lock_entries();
        entries.get_mut(key).map(|entry| entry.listeners.insert(Arc::new(listener)))
    }

    pub fn unsubscribe(&self, key: &PoolKey, callback_id: CallbackId) -> bool {
        let mut entries = self.lock_entries();
        entries
            .get_mut(key)
            .is_some_and(|entry| entry.listeners.remove(callback_id))
    }

    /// The current state of `key`'s connection, if one exists.
    pub fn snapshot(&self, key: &PoolKey) -> Option<ConnectionSnapshot> {
        let entries = self.lock_entries();
        entries.get(key).map(|entry| ConnectionSnapshot::of(&entry.conn))
    }

    /// Wire the connection's lifecycle events into listener notification.
    fn register_state_hooks(&self, key: &PoolKey, conn: &DbConnection) {
        let notify = {
            let pool = Arc::downgrade(&self.inner);
            let key = key.clone();
            move || {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                let (snapshot, listeners) = {
                    let entries = pool.entries.lock().expect("ConnectionPool Mutex is poisoned");
                    let Some(entry) = entries.get(&key) else {
                        return;
                    };
                    (ConnectionSnapshot::of(&entry.conn), entry.listeners.snapshot())
                };
                for listener in listeners {
                    listener(&snapshot);
                }
            }
        };
        let on_connect = notify.clone();
        conn.on_connect(move |_, _, _| on_connect());
        let on_disconnect = notify.clone();
        conn.on_disconnect(move |_, _| on_disconnect());
        conn.on_connect_error(move |_, _| notify());
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, PoolEntry>> {
        self.inner.entries.lock().expect("ConnectionPool Mutex is poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_connection::test_connection;
    use crate::module::ModuleDef;
    use spacetimedb_client_api_messages::websocket::IdentityToken;
    use spacetimedb_client_api_messages::websocket::ServerMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> PoolKey {
        ("ws://localhost:3000".into(), name.into())
    }

    fn connect_counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> Result<DbConnection, SdkError> + '_ {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(test_connection(ModuleDef::default()).0)
        }
    }

    #[tokio::test]
    async fn retain_shares_one_connection() {
        let pool = ConnectionPool::default();
        let connects = Arc::new(AtomicUsize::new(0));
        let key = key("share");

        pool.retain(key.clone(), connect_counting(&connects)).unwrap();
        pool.retain(key.clone(), connect_counting(&connects)).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(pool.snapshot(&key).is_some());
    }

    #[tokio::test]
    async fn release_of_last_reference_tears_down_later() {
        let pool = ConnectionPool::default();
        let connects = Arc::new(AtomicUsize::new(0));
        let key = key("teardown");

        pool.retain(key.clone(), connect_counting(&connects)).unwrap();
        pool.release(&key);
        // Entry survives the synchronous part of release.
        assert!(pool.snapshot(&key).is_some());
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(pool.snapshot(&key).is_none());
    }

    #[tokio::test]
    async fn rapid_release_retain_keeps_the_connection() {
        let pool = ConnectionPool::default();
        let connects = Arc::new(AtomicUsize::new(0));
        let key = key("bounce");

        pool.retain(key.clone(), connect_counting(&connects)).unwrap();
        pool.release(&key);
        pool.retain(key.clone(), connect_counting(&connects)).unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(pool.snapshot(&key).is_some());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listeners_observe_connection_state_changes() {
        let pool = ConnectionPool::default();
        let key = key("listen");
        let conn = pool
            .retain(key.clone(), || Ok(test_connection(ModuleDef::default()).0))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener_seen = seen.clone();
        pool.subscribe(&key, move |snapshot| {
            listener_seen.lock().unwrap().push(snapshot.clone());
        })
        .unwrap();

        conn.handle_message(ServerMessage::IdentityToken(IdentityToken {
            identity: Identity::ZERO,
            token: "tok".into(),
            connection_id: ConnectionId::from_u128(3),
        }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].token.as_deref(), Some("tok"));
        assert_eq!(seen[0].connection_id, ConnectionId::from_u128(3));
    }
}
