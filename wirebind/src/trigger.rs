//! One-shot shutdown trigger that can interrupt blocking I/O.
//!
//! The trigger owns a pipe. Firing it closes the write end, after which the
//! read end reports `POLLHUP` forever. Every blocking operation in this crate
//! polls its own fd together with that read end, so one `trigger()` call
//! wakes every thread parked in the kernel on any transport of the session.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Result, RpcError};

/// Session-wide, irrevocable cancellation source.
///
/// There is no per-call cancellation; once fired, every interruptible
/// operation referencing this trigger fails with [`RpcError::Cancelled`].
pub struct ShutdownTrigger {
    read_end: OwnedFd,
    write_end: Mutex<Option<OwnedFd>>,
}

impl ShutdownTrigger {
    pub fn new() -> Result<Self> {
        let mut fds = [0; 2];
        // SAFETY: `fds` is a valid buffer for the two descriptors pipe2 writes.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(RpcError::Io(io::Error::last_os_error()));
        }
        // SAFETY: pipe2 succeeded, so both fds are fresh and owned by us.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            read_end,
            write_end: Mutex::new(Some(write_end)),
        })
    }

    /// Fires the trigger. Idempotent.
    pub fn trigger(&self) {
        if self.write_end.lock().unwrap().take().is_some() {
            debug!("shutdown trigger fired");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.write_end.lock().unwrap().is_none()
    }

    /// Blocks until `fd` reports any of `events`, or the trigger fires.
    ///
    /// Returns `Ok(())` on fd readiness and [`RpcError::Cancelled`] once
    /// triggered; cancellation wins when both are ready at the same time.
    pub fn interruptible_poll(&self, fd: BorrowedFd<'_>, events: i16) -> Result<()> {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: fd.as_raw_fd(),
                    events,
                    revents: 0,
                },
                // POLLHUP is delivered regardless of the requested events.
                libc::pollfd {
                    fd: self.read_end.as_raw_fd(),
                    events: 0,
                    revents: 0,
                },
            ];
            // SAFETY: `fds` points at two initialized pollfd entries.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(RpcError::Io(err));
            }
            if fds[1].revents != 0 {
                return Err(RpcError::Cancelled);
            }
            if fds[0].revents != 0 {
                return Ok(());
            }
        }
    }
}
