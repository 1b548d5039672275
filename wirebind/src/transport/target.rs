//! Socket addressing and interruptible connect.

use std::fmt;
use std::io;
use std::net;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::trigger::ShutdownTrigger;

/// Connect attempts made before giving up on a peer that keeps resetting.
pub(crate) const CONNECT_ATTEMPTS: usize = 5;

/// Pause between attempts after a connection reset.
pub(crate) const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Address of a peer accepting sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketTarget {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// vsock endpoint.
    Vsock { cid: u32, port: u32 },
    /// Resolved IPv4/IPv6 endpoint.
    Inet(net::SocketAddr),
}

impl SocketTarget {
    fn domain(&self) -> Domain {
        match self {
            SocketTarget::Unix(_) => Domain::UNIX,
            SocketTarget::Vsock { .. } => Domain::VSOCK,
            SocketTarget::Inet(addr) => Domain::for_address(*addr),
        }
    }

    fn sock_addr(&self) -> Result<SockAddr> {
        match self {
            SocketTarget::Unix(path) => SockAddr::unix(path).map_err(RpcError::Io),
            SocketTarget::Vsock { cid, port } => Ok(SockAddr::vsock(*cid, *port)),
            SocketTarget::Inet(addr) => Ok(SockAddr::from(*addr)),
        }
    }
}

impl fmt::Display for SocketTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketTarget::Unix(path) => write!(f, "unix:{}", path.display()),
            SocketTarget::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
            SocketTarget::Inet(addr) => write!(f, "inet:{addr}"),
        }
    }
}

/// Opens a non-blocking stream socket to `target`, parking on the trigger
/// while the connect completes.
pub(crate) fn connect_interruptible(
    target: &SocketTarget,
    trigger: &ShutdownTrigger,
) -> Result<OwnedFd> {
    let socket = Socket::new(target.domain(), Type::STREAM, None).map_err(RpcError::Io)?;
    socket.set_nonblocking(true).map_err(RpcError::Io)?;

    match socket.connect(&target.sock_addr()?) {
        Ok(()) => {}
        // Unix sockets report EAGAIN here, everything else EINPROGRESS; both
        // mean "poll for writability, then ask the socket how it went".
        Err(err) if matches!(err.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EAGAIN)) => {
            trigger.interruptible_poll(socket.as_fd(), libc::POLLOUT)?;
            if let Some(err) = socket.take_error().map_err(RpcError::Io)? {
                return Err(RpcError::Io(err));
            }
        }
        Err(err) => return Err(RpcError::Io(err)),
    }

    debug!(peer = %target, "socket connected");
    Ok(socket.into())
}

/// Runs `connect` until it succeeds, retrying only connection resets.
///
/// A reset usually means the peer's accept queue collapsed while it was
/// restarting; anything else is terminal.
pub(crate) fn connect_with_retries<F>(mut connect: F) -> Result<OwnedFd>
where
    F: FnMut() -> Result<OwnedFd>,
{
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            thread::sleep(CONNECT_RETRY_DELAY);
        }
        match connect() {
            Err(RpcError::Io(err)) if err.raw_os_error() == Some(libc::ECONNRESET) => {
                warn!(attempt, "connection reset while connecting, retrying");
            }
            other => return other,
        }
    }
    warn!("ran out of connect retries");
    Err(RpcError::Io(io::Error::from_raw_os_error(libc::ECONNRESET)))
}
