//! wirebind — session layer of a binder-style RPC runtime.
//!
//! A [`Session`] owns the logical relationship between two peers across a
//! pool of byte-stream connections (unix domain socket, vsock, or tcp).
//! Callers issue transactions from any number of threads; the session
//! multiplexes them over *outgoing* connections, while one worker thread per
//! *incoming* connection serves the peer's calls — including calls nested
//! inside a transaction this side started, which are routed back over the
//! connection the worker is already serving.
//!
//! The wire codec that frames and dispatches commands is an external
//! collaborator behind [`CommandCodec`]; transports sit behind
//! [`Transport`], with a plain-socket implementation in-crate.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wirebind::Session;
//!
//! let session = Session::make(codec);
//! session.set_max_threads(2);
//! session.setup_unix_domain_client("/run/app.sock")?;
//!
//! let root = session.get_root_object()?;
//! let reply = session.transact(root, PING, b"hello", 0)?;
//!
//! session.shutdown_and_wait(true);
//! ```

pub mod codec;
pub mod error;
pub mod session;
pub mod transport;
pub mod trigger;
pub mod wire;

pub use codec::{CommandCodec, CommandKind, ObjectId, FLAG_ONEWAY};
pub use error::{Result, RpcError};
pub use session::{
    Connection, ConnectionUse, EventListener, ExclusiveConnection, Role, Session, SessionStats,
    WaitForShutdownListener,
};
pub use transport::{
    CertificateFormat, RawTransport, RawTransportFactory, SocketTarget, Transport,
    TransportFactory,
};
pub use trigger::ShutdownTrigger;
pub use wire::{ConnectionHeader, NewSessionResponse, SessionId, PROTOCOL_VERSION};

/// Version of the wirebind library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
