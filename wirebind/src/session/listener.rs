//! Session lifecycle callbacks.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::warn;

use super::Session;

/// Receives notifications as incoming worker threads wind down.
///
/// An accepting server implements this to learn when one of its sessions has
/// fully drained; client sessions install a [`WaitForShutdownListener`]. The
/// session only holds the listener weakly, so the server side does not form
/// a strong reference cycle through its sessions.
pub trait EventListener: Send + Sync {
    /// The last incoming worker removed its connection from the pool.
    fn on_session_all_incoming_threads_ended(&self, session: &Arc<Session>);

    /// One incoming worker finished its cleanup and is about to exit.
    fn on_session_incoming_thread_ended(&self);
}

/// Listener that lets [`Session::shutdown_and_wait`] block until every
/// incoming worker has ended.
pub struct WaitForShutdownListener {
    ended: Mutex<bool>,
    progress: Condvar,
}

impl WaitForShutdownListener {
    pub fn new() -> Self {
        Self {
            ended: Mutex::new(false),
            progress: Condvar::new(),
        }
    }

    /// Blocks until all incoming threads have ended, complaining after each
    /// second without progress.
    pub fn wait_for_shutdown(&self) {
        let mut ended = self.ended.lock().unwrap();
        while !*ended {
            let (guard, timeout) = self
                .progress
                .wait_timeout(ended, Duration::from_secs(1))
                .unwrap();
            ended = guard;
            if timeout.timed_out() && !*ended {
                warn!("still waiting for the session to shut down (1s without progress)");
            }
        }
    }
}

impl Default for WaitForShutdownListener {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListener for WaitForShutdownListener {
    fn on_session_all_incoming_threads_ended(&self, _session: &Arc<Session>) {
        *self.ended.lock().unwrap() = true;
        self.progress.notify_all();
    }

    fn on_session_incoming_thread_ended(&self) {
        self.progress.notify_all();
    }
}
