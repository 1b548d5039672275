//! A single physical connection and its ownership bookkeeping.

use std::fmt;
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::transport::Transport;

/// One byte-stream transport belonging to a session.
///
/// The connection has no operations of its own; it is purely the unit of
/// exclusion. `exclusive_owner` is only read or written while the session
/// mutex is held.
pub struct Connection {
    id: u64,
    transport: Box<dyn Transport>,
    exclusive_owner: Mutex<Option<ThreadId>>,
    allow_nested: bool,
}

impl Connection {
    pub(crate) fn new(id: u64, transport: Box<dyn Transport>, allow_nested: bool) -> Self {
        Self {
            id,
            transport,
            exclusive_owner: Mutex::new(None),
            allow_nested,
        }
    }

    /// Stable identifier for logs and instrumentation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// True for incoming connections: the owning worker may issue nested
    /// calls on it while serving a command.
    pub fn allows_nested(&self) -> bool {
        self.allow_nested
    }

    /// Thread currently holding this connection, if any.
    pub fn exclusive_owner(&self) -> Option<ThreadId> {
        *self.exclusive_owner.lock().unwrap()
    }

    pub(crate) fn set_exclusive_owner(&self, owner: Option<ThreadId>) {
        *self.exclusive_owner.lock().unwrap() = owner;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("exclusive_owner", &self.exclusive_owner())
            .field("allow_nested", &self.allow_nested)
            .finish()
    }
}
