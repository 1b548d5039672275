//! Plain (non-TLS) socket transport.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use super::{CertificateFormat, Transport, TransportFactory};
use crate::error::{Result, RpcError};
use crate::trigger::ShutdownTrigger;

/// Transport doing raw `read(2)`/`send(2)` on a non-blocking socket.
///
/// Every blocking wait happens inside [`ShutdownTrigger::interruptible_poll`],
/// so a fired trigger unblocks the call at the next suspension point.
pub struct RawTransport {
    fd: OwnedFd,
}

impl RawTransport {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self { fd })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    // SAFETY: fd is owned and valid for fcntl.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(RpcError::Io(io::Error::last_os_error()));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(RpcError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

impl Transport for RawTransport {
    fn read_fully(&self, trigger: &ShutdownTrigger, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            if trigger.is_triggered() {
                return Err(RpcError::Cancelled);
            }
            let rest = &mut buf[done..];
            // SAFETY: `rest` points at rest.len() writable bytes.
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), rest.as_mut_ptr().cast(), rest.len())
            };
            if n > 0 {
                done += n as usize;
                continue;
            }
            if n == 0 {
                return Err(RpcError::DeadObject);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => {
                    trigger.interruptible_poll(self.fd.as_fd(), libc::POLLIN)?;
                }
                Some(libc::EINTR) => {}
                Some(libc::ECONNRESET) => return Err(RpcError::DeadObject),
                _ => return Err(RpcError::Io(err)),
            }
        }
        Ok(())
    }

    fn write_fully(&self, trigger: &ShutdownTrigger, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            if trigger.is_triggered() {
                return Err(RpcError::Cancelled);
            }
            let rest = &buf[done..];
            // MSG_NOSIGNAL: a vanished peer must surface as an error, not SIGPIPE.
            // SAFETY: `rest` points at rest.len() readable bytes.
            let n = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    rest.as_ptr().cast(),
                    rest.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n > 0 {
                done += n as usize;
                continue;
            }
            if n == 0 {
                return Err(RpcError::DeadObject);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => {
                    trigger.interruptible_poll(self.fd.as_fd(), libc::POLLOUT)?;
                }
                Some(libc::EINTR) => {}
                Some(libc::ECONNRESET) | Some(libc::EPIPE) => return Err(RpcError::DeadObject),
                _ => return Err(RpcError::Io(err)),
            }
        }
        Ok(())
    }
}

/// Factory producing [`RawTransport`]s.
pub struct RawTransportFactory;

impl TransportFactory for RawTransportFactory {
    fn new_transport(&self, fd: OwnedFd, _trigger: &ShutdownTrigger) -> Result<Box<dyn Transport>> {
        Ok(Box::new(RawTransport::new(fd)?))
    }

    fn certificate(&self, _format: CertificateFormat) -> Option<Vec<u8>> {
        None
    }
}
