//! Connection registry used to interrupt pending and established connections
//!
//! A dialer registers its socket before blocking on connect and removes it
//! once the connect resolves. A controller that wants to abandon every dial
//! in progress calls [`ConnRegistry::close_all`], which closes all members
//! and refuses new registrations until [`ConnRegistry::reset`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Something the registry can close.
///
/// `close` must not block: it is called while the registry lock is held.
pub trait Closeable: Send + Sync {
    fn close(&self) -> std::io::Result<()>;
}

struct RegistryState {
    closed: bool,
    conns: HashMap<usize, Arc<dyn Closeable>>,
}

/// Synchronized, resettable set of connections.
///
/// Members are keyed by the identity of their shared handle, so adding the
/// same `Arc` twice tracks it once.
pub struct ConnRegistry {
    state: Mutex<RegistryState>,
}

fn conn_key<C>(conn: &Arc<C>) -> usize {
    Arc::as_ptr(conn) as *const () as usize
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                closed: false,
                conns: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every critical section leaves the state consistent, so a panic in
        // another holder does not invalidate it
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `conn`. Returns false, without tracking, if the registry is closed.
    ///
    /// A caller that gets false owns the connection's fate and must close it.
    pub fn add<C>(&self, conn: &Arc<C>) -> bool
    where
        C: Closeable + 'static,
    {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state
            .conns
            .insert(conn_key(conn), conn.clone() as Arc<dyn Closeable>);
        true
    }

    /// Stop tracking `conn`. Removing an untracked connection is a no-op.
    pub fn remove<C>(&self, conn: &Arc<C>)
    where
        C: Closeable + 'static,
    {
        self.lock().conns.remove(&conn_key(conn));
    }

    /// Mark the registry closed and close every tracked connection.
    ///
    /// Close failures are logged; the remaining members are still closed.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.closed = true;
        let conns = std::mem::take(&mut state.conns);
        if !conns.is_empty() {
            debug!("Closing {} registered connections", conns.len());
        }
        for conn in conns.into_values() {
            if let Err(e) = conn.close() {
                warn!("Failed to close registered connection: {}", e);
            }
        }
    }

    /// Reopen the registry with no members.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.closed = false;
        state.conns.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ConnRegistry")
            .field("closed", &state.closed)
            .field("members", &state.conns.len())
            .finish()
    }
}
