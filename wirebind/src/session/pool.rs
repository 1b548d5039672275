//! Connection selection for outgoing calls.
//!
//! [`ExclusiveConnection`] is the scheduling core of the session: every
//! outgoing call acquires one, performs its I/O, and releases it on drop.
//! Selection prefers a connection the calling thread already holds, which is
//! what lets a worker issue nested calls over the connection it is serving
//! instead of deadlocking on a free one.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, error};

use super::{Connection, Session};
use crate::error::{Result, RpcError};

/// What an acquired connection will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionUse {
    /// Synchronous call expecting a reply.
    Client,
    /// One-way call; no reply will be read.
    ClientAsync,
    /// Refcount adjustment; small, and allowed to nest.
    ClientRefcount,
}

/// RAII handle to an exclusively held connection.
pub struct ExclusiveConnection {
    session: Arc<Session>,
    connection: Arc<Connection>,
    reentrant: bool,
}

impl ExclusiveConnection {
    /// Selects and locks a connection for `use_`.
    ///
    /// Waits on the session's condition variable while every outgoing
    /// connection is busy. Fails with [`RpcError::WouldBlock`] when the
    /// outgoing pool is empty: then there is nothing to wait for, and a
    /// server-accepted session without a back-channel must not hang.
    pub fn acquire(session: &Arc<Session>, use_: ConnectionUse) -> Result<Self> {
        let tid = thread::current().id();
        let mut inner = session.inner.lock().unwrap();
        inner.waiting_threads += 1;
        let picked = loop {
            let mut exclusive = None;
            let mut available = None;
            scan_pool(
                tid,
                &mut exclusive,
                Some(&mut available),
                &inner.outgoing,
                inner.outgoing_offset,
            );

            // A slow one-way call must not park later synchronous calls
            // behind it on the same connection, so every async acquisition
            // moves the cursor one connection further.
            if use_ == ConnectionUse::ClientAsync
                && (exclusive.is_some() || available.is_some())
            {
                inner.outgoing_offset = (inner.outgoing_offset + 1) % inner.outgoing.len();
            }

            // Nested calls reuse the incoming connection this thread is
            // already serving. One-way calls are excluded: the peer is not
            // obliged to drain an incoming connection promptly.
            if use_ != ConnectionUse::ClientAsync {
                let mut exclusive_incoming = None;
                scan_pool(tid, &mut exclusive_incoming, None, &inner.incoming, 0);
                if let Some(conn) = exclusive_incoming {
                    if conn.allows_nested() {
                        exclusive = Some(conn);
                    } else if use_ == ConnectionUse::ClientRefcount && available.is_none() {
                        // Refcount traffic may piggyback rather than wait
                        // for a free outgoing connection.
                        exclusive = Some(conn);
                    }
                }
            }

            if let Some(conn) = exclusive {
                break Ok((conn, true));
            }
            if let Some(conn) = available {
                conn.set_exclusive_owner(Some(tid));
                break Ok((conn, false));
            }

            if inner.outgoing.is_empty() {
                error!(
                    use_ = ?use_,
                    incoming = inner.incoming.len(),
                    "session has no outgoing connections; a server-accepted session \
                     cannot make non-nested calls without a back-channel"
                );
                break Err(RpcError::WouldBlock);
            }

            debug!(
                outgoing = inner.outgoing.len(),
                incoming = inner.incoming.len(),
                "all connections busy, waiting"
            );
            inner = session.available_cv.wait(inner).unwrap();
        };
        inner.waiting_threads -= 1;
        drop(inner);

        let (connection, reentrant) = picked?;
        Ok(Self {
            session: Arc::clone(session),
            connection,
            reentrant,
        })
    }

    /// The connection this handle holds.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// True when the calling thread already held the connection, in which
    /// case dropping this handle releases nothing.
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

impl Drop for ExclusiveConnection {
    fn drop(&mut self) {
        // A reentrant handle sits above an outer frame that still owns the
        // connection; releasing here would strand that frame.
        if self.reentrant {
            return;
        }
        let inner = self.session.inner.lock().unwrap();
        self.connection.set_exclusive_owner(None);
        let wake = inner.waiting_threads > 0;
        drop(inner);
        if wake {
            self.session.available_cv.notify_one();
        }
    }
}

/// Scans `pool` from `offset`, filling `exclusive` with the first connection
/// already owned by `tid` (and stopping there) and `available` with the
/// first unowned one.
fn scan_pool(
    tid: ThreadId,
    exclusive: &mut Option<Arc<Connection>>,
    mut available: Option<&mut Option<Arc<Connection>>>,
    pool: &[Arc<Connection>],
    offset: usize,
) {
    if exclusive.is_some() || pool.is_empty() {
        return;
    }
    debug_assert!(offset < pool.len(), "offset {offset} out of {}", pool.len());
    for i in 0..pool.len() {
        let conn = &pool[(i + offset) % pool.len()];
        match conn.exclusive_owner() {
            None => {
                if let Some(slot) = available.as_deref_mut() {
                    if slot.is_none() {
                        *slot = Some(Arc::clone(conn));
                    }
                }
            }
            Some(owner) if owner == tid => {
                *exclusive = Some(Arc::clone(conn));
                break;
            }
            Some(_) => {}
        }
    }
}
