//! Seam between the session layer and the wire codec.
//!
//! The codec — the RPC state machine — owns all framing after connection
//! establishment: it parses command frames, dispatches them to local
//! objects, and issues replies. The session layer only decides *which*
//! connection a call runs on and hands the codec an exclusively held one.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::session::{Connection, Session};

/// Transaction flag: one-way call, no reply is read.
pub const FLAG_ONEWAY: u32 = 1;

/// Opaque reference to an object hosted by the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Which commands [`CommandCodec::get_and_execute_command`] should process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Process whatever arrives next.
    Any,
    /// Process only full transactions.
    Transaction,
}

/// Wire codec driven by the session.
///
/// Implementations perform all I/O through `connection.transport()` with the
/// session's shutdown trigger, keeping every blocking call interruptible.
/// The connection handed in is exclusively held by the calling thread for
/// the duration of the call, which is what guarantees reply-to-request
/// matching for synchronous transactions.
pub trait CommandCodec: Send + Sync + 'static {
    /// Sends the connection-init frame on a freshly opened outgoing
    /// connection.
    fn send_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
    ) -> Result<()>;

    /// Reads the peer's connection-init frame; the first thing an incoming
    /// worker does.
    fn read_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
    ) -> Result<()>;

    /// Asks the peer for its root object.
    fn get_root_object(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
    ) -> Result<ObjectId>;

    /// Runs one transaction. Unless [`FLAG_ONEWAY`] is set, blocks for the
    /// reply payload, executing any nested commands that arrive while
    /// waiting.
    fn transact(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        object: ObjectId,
        code: u32,
        data: &[u8],
        flags: u32,
    ) -> Result<Vec<u8>>;

    /// Tells the peer to drop one strong reference to `object`.
    fn send_dec_strong(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        object: ObjectId,
    ) -> Result<()>;

    /// Reads and executes the next command addressed to this side.
    fn get_and_execute_command(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        kind: CommandKind,
    ) -> Result<()>;

    /// Drops every remote object reference; called during session shutdown.
    fn clear(&self);
}
