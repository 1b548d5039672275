//! Byte-stream transport abstraction.
//!
//! A [`Transport`] wraps one connected file descriptor and offers blocking,
//! shutdown-interruptible reads and writes. A [`TransportFactory`] turns a
//! freshly connected fd into a transport; the in-crate
//! [`RawTransportFactory`] does plain socket I/O, while TLS-style factories
//! live outside this crate and expose their identity through
//! [`TransportFactory::certificate`].

mod raw;
mod target;

pub use raw::{RawTransport, RawTransportFactory};
pub use target::SocketTarget;

pub(crate) use target::{connect_interruptible, connect_with_retries};

use std::os::fd::OwnedFd;

use crate::error::Result;
use crate::trigger::ShutdownTrigger;

/// Encoding requested from [`TransportFactory::certificate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateFormat {
    Pem,
    Der,
}

/// One connected byte stream.
///
/// Implementations must honor the trigger on every blocking call. There are
/// no ordering guarantees between distinct transports.
pub trait Transport: Send + Sync {
    /// Reads until `buf` is full, or fails with `Cancelled`, `Io`, or
    /// `DeadObject` (peer closed).
    fn read_fully(&self, trigger: &ShutdownTrigger, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf`, or fails with `Cancelled`, `Io`, or `DeadObject`.
    /// Partial progress made before a cancellation is not retried.
    fn write_fully(&self, trigger: &ShutdownTrigger, buf: &[u8]) -> Result<()>;
}

/// Builds transports for newly connected sockets.
pub trait TransportFactory: Send + Sync {
    /// Wraps a connected fd. `trigger` interrupts any handshake the factory
    /// performs during construction.
    fn new_transport(&self, fd: OwnedFd, trigger: &ShutdownTrigger) -> Result<Box<dyn Transport>>;

    /// Certificate identifying this side, if the transport layer has one.
    fn certificate(&self, format: CertificateFormat) -> Option<Vec<u8>>;
}
