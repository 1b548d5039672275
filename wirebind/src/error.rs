//! Error types for the session layer.

use std::io;

use thiserror::Error;

/// Errors surfaced by session setup, connection acquisition, and transport I/O.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A caller-supplied parameter was invalid (bad protocol version, missing fd).
    #[error("invalid argument: {0}")]
    BadValue(String),

    /// No usable address could be resolved for the requested host.
    #[error("no resolvable address: {0}")]
    NameNotFound(String),

    /// A socket syscall failed. Session state is unchanged.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// The remote peer closed the connection or the transport failed mid-call.
    /// The session itself survives.
    #[error("remote peer is gone")]
    DeadObject,

    /// The shutdown trigger fired while the operation was blocked.
    #[error("interrupted by session shutdown")]
    Cancelled,

    /// An outgoing call was attempted with no outgoing connections to wait for.
    #[error("no outgoing connections")]
    WouldBlock,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// True when the error means the peer went away (or is being torn down)
    /// rather than local misuse.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RpcError::DeadObject | RpcError::Cancelled)
    }
}
