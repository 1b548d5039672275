//! Session lifecycle: handshake, connection pools, worker threads, shutdown.
//!
//! ```text
//!  caller threads ──transact──► Session ──acquire──► ExclusiveConnection
//!                                  │                        │
//!                                  │                  codec I/O on the
//!                                  │                  held connection
//!                                  ▼
//!                      incoming worker threads
//!                 (one per incoming connection, each
//!                  looping on get_and_execute_command)
//! ```
//!
//! A session multiplexes calls over two pools of connections: *outgoing*
//! (this side initiates calls) and *incoming* (the peer initiates calls and a
//! dedicated worker thread serves each connection). A single mutex guards
//! all mutable session state; no lock is ever held across transport I/O.

mod connection;
mod listener;
mod pool;

pub use connection::Connection;
pub use listener::{EventListener, WaitForShutdownListener};
pub use pool::{ConnectionUse, ExclusiveConnection};

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, info, warn};

use crate::codec::{CommandCodec, CommandKind, ObjectId, FLAG_ONEWAY};
use crate::error::{Result, RpcError};
use crate::transport::{
    connect_interruptible, connect_with_retries, CertificateFormat, RawTransportFactory,
    SocketTarget, Transport, TransportFactory,
};
use crate::trigger::ShutdownTrigger;
use crate::wire::{
    ConnectionHeader, NewSessionResponse, SessionId, OPT_INCOMING, PROTOCOL_VERSION,
    PROTOCOL_VERSION_EXPERIMENTAL, SESSION_ID_LEN,
};

/// Which side of the relationship this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This side dialed the peer.
    Client,
    /// An accepting server created this session for a dialing peer.
    Server,
}

/// Point-in-time counters for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub outgoing_connections: usize,
    pub available_outgoing: usize,
    pub incoming_connections: usize,
    pub max_incoming_seen: usize,
    pub waiting_threads: usize,
    pub live_workers: usize,
}

pub(crate) struct SessionInner {
    role: Option<Role>,
    session_id: SessionId,
    protocol_version: Option<u32>,
    max_threads: usize,
    remote_max_threads: Option<usize>,
    pub(crate) outgoing: Vec<Arc<Connection>>,
    pub(crate) outgoing_offset: usize,
    pub(crate) incoming: Vec<Arc<Connection>>,
    max_incoming_seen: usize,
    pub(crate) waiting_threads: usize,
    threads: HashMap<ThreadId, JoinHandle<()>>,
    event_listener: Weak<dyn EventListener>,
}

/// The logical bidirectional RPC relationship between two peers, spanning
/// multiple physical connections.
pub struct Session {
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) available_cv: Condvar,
    codec: Arc<dyn CommandCodec>,
    factory: Box<dyn TransportFactory>,
    shutdown_trigger: OnceLock<Arc<ShutdownTrigger>>,
    shutdown_listener: OnceLock<Arc<WaitForShutdownListener>>,
    next_connection_id: AtomicU64,
    next_worker: AtomicU64,
}

struct PreJoinSetup {
    connection: Option<Arc<Connection>>,
    status: Result<()>,
}

impl Session {
    pub const DEFAULT_MAX_THREADS: usize = 1;

    /// Creates a session speaking plain sockets, driven through `codec`.
    pub fn make(codec: Arc<dyn CommandCodec>) -> Arc<Self> {
        Self::make_with_factory(Box::new(RawTransportFactory), codec)
    }

    /// Creates a session with a custom transport factory (e.g. TLS).
    pub fn make_with_factory(
        factory: Box<dyn TransportFactory>,
        codec: Arc<dyn CommandCodec>,
    ) -> Arc<Self> {
        debug!("session created");
        Arc::new(Self {
            inner: Mutex::new(SessionInner {
                role: None,
                session_id: SessionId::ZERO,
                protocol_version: None,
                max_threads: Self::DEFAULT_MAX_THREADS,
                remote_max_threads: None,
                outgoing: Vec::new(),
                outgoing_offset: 0,
                incoming: Vec::new(),
                max_incoming_seen: 0,
                waiting_threads: 0,
                threads: HashMap::new(),
                event_listener: Weak::<WaitForShutdownListener>::new(),
            }),
            available_cv: Condvar::new(),
            codec,
            factory,
            shutdown_trigger: OnceLock::new(),
            shutdown_listener: OnceLock::new(),
            next_connection_id: AtomicU64::new(1),
            next_worker: AtomicU64::new(0),
        })
    }

    // ------------------------------------------------------------------
    // Configuration and introspection
    // ------------------------------------------------------------------

    /// Requested size of the incoming worker pool.
    ///
    /// Must be called before any connection exists; the value is immutable
    /// once setup has begun.
    pub fn set_max_threads(&self, threads: usize) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.outgoing.is_empty() && inner.incoming.is_empty(),
            "max_threads must be set before connections exist ({} outgoing, {} incoming)",
            inner.outgoing.len(),
            inner.incoming.len()
        );
        inner.max_threads = threads;
    }

    pub fn max_threads(&self) -> usize {
        self.inner.lock().unwrap().max_threads
    }

    /// Caps (or records) the wire protocol version.
    ///
    /// Once set, the version may only be lowered: raising it mid-session
    /// would change behavior underneath in-flight callers.
    pub fn set_protocol_version(&self, version: u32) -> Result<()> {
        if version > PROTOCOL_VERSION && version != PROTOCOL_VERSION_EXPERIMENTAL {
            return Err(RpcError::BadValue(format!(
                "unknown protocol version {version} (latest supported is {PROTOCOL_VERSION})"
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.protocol_version {
            if version > current {
                return Err(RpcError::BadValue(format!(
                    "cannot raise protocol version {current} to {version}"
                )));
            }
        }
        inner.protocol_version = Some(version);
        Ok(())
    }

    pub fn protocol_version(&self) -> Option<u32> {
        self.inner.lock().unwrap().protocol_version
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.lock().unwrap().session_id
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.lock().unwrap().role
    }

    /// Thread capacity the peer reported during setup.
    pub fn remote_max_threads(&self) -> Option<usize> {
        self.inner.lock().unwrap().remote_max_threads
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock().unwrap();
        SessionStats {
            outgoing_connections: inner.outgoing.len(),
            available_outgoing: inner
                .outgoing
                .iter()
                .filter(|c| c.exclusive_owner().is_none())
                .count(),
            incoming_connections: inner.incoming.len(),
            max_incoming_seen: inner.max_incoming_seen,
            waiting_threads: inner.waiting_threads,
            live_workers: inner.threads.len(),
        }
    }

    /// This side's transport certificate, if the factory has one.
    pub fn certificate(&self, format: CertificateFormat) -> Option<Vec<u8>> {
        self.factory.certificate(format)
    }

    /// Shutdown trigger honored by every blocking operation of this session.
    ///
    /// Panics before setup has installed one; codecs only ever run on
    /// established sessions.
    pub fn shutdown_trigger(&self) -> &Arc<ShutdownTrigger> {
        self.shutdown_trigger
            .get()
            .expect("shutdown trigger not installed")
    }

    // ------------------------------------------------------------------
    // Client setup
    // ------------------------------------------------------------------

    pub fn setup_unix_domain_client(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<()> {
        self.setup_socket_client(SocketTarget::Unix(path.as_ref().to_path_buf()))
    }

    pub fn setup_vsock_client(self: &Arc<Self>, cid: u32, port: u32) -> Result<()> {
        self.setup_socket_client(SocketTarget::Vsock { cid, port })
    }

    /// Resolves `host:port` and tries every resolved address in order.
    pub fn setup_inet_client(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|err| RpcError::NameNotFound(format!("{host}:{port}: {err}")))?
            .collect();
        if addrs.is_empty() {
            return Err(RpcError::NameNotFound(format!("{host}:{port}")));
        }
        for addr in addrs {
            match self.setup_socket_client(SocketTarget::Inet(addr)) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(%addr, error = %err, "inet setup failed, trying next address");
                }
            }
        }
        Err(RpcError::NameNotFound(format!(
            "no resolved address for {host}:{port} accepted a session"
        )))
    }

    /// Sets up over an already connected fd; `request` supplies fds for the
    /// follow-on connections.
    pub fn setup_preconnected_client<F>(self: &Arc<Self>, fd: OwnedFd, mut request: F) -> Result<()>
    where
        F: FnMut() -> Option<OwnedFd>,
    {
        let mut first = Some(fd);
        self.setup_client(|session_id, incoming| {
            let fd = match first.take().or_else(&mut request) {
                Some(fd) => fd,
                None => {
                    return Err(RpcError::BadValue(
                        "no fd supplied for additional connection".into(),
                    ))
                }
            };
            self.init_and_add_connection(fd, session_id, incoming)
        })
    }

    pub fn setup_socket_client(self: &Arc<Self>, target: SocketTarget) -> Result<()> {
        self.setup_client(|session_id, incoming| {
            let trigger = self.shutdown_trigger();
            let fd = connect_with_retries(|| connect_interruptible(&target, trigger))?;
            self.init_and_add_connection(fd, session_id, incoming)
        })
    }

    fn setup_client(
        self: &Arc<Self>,
        mut connect_and_init: impl FnMut(SessionId, bool) -> Result<()>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            assert!(
                inner.outgoing.is_empty(),
                "session already set up with {} outgoing connections",
                inner.outgoing.len()
            );
            inner.role = Some(Role::Client);
        }
        self.init_shutdown_trigger()?;

        connect_and_init(SessionId::ZERO, false)?;

        // The seed connection now carries the server's half of the
        // handshake: negotiated version, thread capacity, session id.
        let (remote_max_threads, session_id) = {
            let exclusive = ExclusiveConnection::acquire(self, ConnectionUse::Client)?;
            let trigger = self.shutdown_trigger();
            let transport = exclusive.connection().transport();

            let mut version_buf = [0u8; 4];
            transport.read_fully(trigger, &mut version_buf)?;
            let response = NewSessionResponse::decode(&version_buf);
            self.set_protocol_version(response.version)?;

            let mut threads_buf = [0u8; 4];
            transport.read_fully(trigger, &mut threads_buf)?;
            let remote_max_threads = u32::from_le_bytes(threads_buf) as usize;

            let mut id_buf = [0u8; SESSION_ID_LEN];
            transport.read_fully(trigger, &mut id_buf)?;
            (remote_max_threads, SessionId::new(id_buf))
        };

        info!(
            version = ?self.protocol_version(),
            remote_max_threads,
            %session_id,
            "session established"
        );

        {
            let mut inner = self.inner.lock().unwrap();
            inner.session_id = session_id;
            inner.remote_max_threads = Some(remote_max_threads);
        }

        // One outgoing connection already exists; open the rest up to the
        // peer's capacity, then the connections the peer will call us on.
        for _ in 1..remote_max_threads {
            connect_and_init(session_id, false)?;
        }
        for _ in 0..self.max_threads() {
            connect_and_init(session_id, true)?;
        }

        Ok(())
    }

    fn init_shutdown_trigger(&self) -> Result<()> {
        if self.shutdown_trigger.get().is_some() {
            return Ok(());
        }
        let trigger = Arc::new(ShutdownTrigger::new()?);
        let listener = Arc::new(WaitForShutdownListener::new());
        let listener_dyn: Arc<dyn EventListener> = listener.clone();
        {
            let mut inner = self.inner.lock().unwrap();
            let weak: Weak<dyn EventListener> = Arc::downgrade(&listener_dyn);
            inner.event_listener = weak;
        }
        let _ = self.shutdown_listener.set(listener);
        let _ = self.shutdown_trigger.set(trigger);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server setup
    // ------------------------------------------------------------------

    /// Seeds a server-accepted session: shutdown trigger, assigned id, and
    /// the server's event listener (held weakly, so sessions do not keep
    /// their server alive).
    pub fn set_for_server(
        &self,
        listener: &Arc<dyn EventListener>,
        session_id: SessionId,
    ) -> Result<()> {
        let trigger = Arc::new(ShutdownTrigger::new()?);
        assert!(
            self.shutdown_trigger.set(trigger).is_ok(),
            "session already configured"
        );
        let mut inner = self.inner.lock().unwrap();
        inner.role = Some(Role::Server);
        inner.session_id = session_id;
        inner.event_listener = Arc::downgrade(listener);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    /// Wraps `fd`, writes the connection header, and files the connection
    /// into the right pool.
    pub fn init_and_add_connection(
        self: &Arc<Self>,
        fd: OwnedFd,
        session_id: SessionId,
        incoming: bool,
    ) -> Result<()> {
        let trigger = self.shutdown_trigger();
        let transport = self.factory.new_transport(fd, trigger)?;

        let header = ConnectionHeader {
            version: self.protocol_version().unwrap_or(PROTOCOL_VERSION),
            options: if incoming { OPT_INCOMING } else { 0 },
            session_id,
        };
        transport.write_fully(trigger, &header.encode())?;

        if incoming {
            self.add_incoming_connection(transport)
        } else {
            self.add_outgoing_connection(transport, true)
        }
    }

    /// Files a connection this side will issue calls on. With `init`, sends
    /// the codec's connection-init frame before releasing it to the pool.
    pub fn add_outgoing_connection(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
        init: bool,
    ) -> Result<()> {
        let connection = Arc::new(Connection::new(self.next_connection_id(), transport, false));
        {
            let mut inner = self.inner.lock().unwrap();
            // Busy until the init exchange is done, so nobody grabs it early.
            connection.set_exclusive_owner(Some(thread::current().id()));
            inner.outgoing.push(Arc::clone(&connection));
        }
        let result = if init {
            self.codec.send_connection_init(&connection, self)
        } else {
            Ok(())
        };
        {
            let _inner = self.inner.lock().unwrap();
            connection.set_exclusive_owner(None);
        }
        debug!(conn_id = connection.id(), init, "outgoing connection added");
        result
    }

    /// Spawns a worker thread that serves commands arriving on `transport`.
    ///
    /// Returns once the worker has been registered and has read the peer's
    /// connection-init frame, so callers can open follow-on connections in
    /// order.
    pub fn add_incoming_connection(self: &Arc<Self>, transport: Box<dyn Transport>) -> Result<()> {
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let session = Arc::clone(self);
        // Two-step rendezvous: the worker waits until its join handle is
        // registered, and this caller waits until the init frame was read.
        let (registered_tx, registered_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("session-worker-{worker}"))
            .spawn(move || {
                if registered_rx.recv().is_err() {
                    return;
                }
                let setup = session.pre_join_setup(transport);
                let _ = ready_tx.send(());
                Session::join(session, setup);
            })
            .map_err(RpcError::Io)?;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.threads.insert(handle.thread().id(), handle);
        }
        let _ = registered_tx.send(());
        // An error here means the worker already exited; it has still done
        // its own cleanup, so either way the handoff is complete.
        let _ = ready_rx.recv();
        Ok(())
    }

    /// Admission plus init read, run on the worker thread before its loop.
    fn pre_join_setup(self: &Arc<Self>, transport: Box<dyn Transport>) -> PreJoinSetup {
        match self.assign_incoming_connection_to_this_thread(transport) {
            None => PreJoinSetup {
                connection: None,
                status: Err(RpcError::DeadObject),
            },
            Some(connection) => {
                let status = self.codec.read_connection_init(&connection, self);
                PreJoinSetup {
                    connection: Some(connection),
                    status,
                }
            }
        }
    }

    /// Files an incoming connection owned by the calling worker thread.
    ///
    /// Admission is refused at capacity, and also whenever the pool is
    /// smaller than it has ever been: a worker having exited means the
    /// session is draining, and short-lived sessions routinely shut down
    /// while their connections are still being established.
    fn assign_incoming_connection_to_this_thread(
        &self,
        transport: Box<dyn Transport>,
    ) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.incoming.len() >= inner.max_threads {
            error!(
                incoming = inner.incoming.len(),
                max_threads = inner.max_threads,
                "rejecting incoming connection: thread capacity reached"
            );
            return None;
        }
        if inner.incoming.len() < inner.max_incoming_seen {
            debug!(
                incoming = inner.incoming.len(),
                max_incoming_seen = inner.max_incoming_seen,
                "rejecting incoming connection: session is draining"
            );
            return None;
        }
        let connection = Arc::new(Connection::new(self.next_connection_id(), transport, true));
        // The worker keeps exclusive ownership for the connection's whole
        // life; that is what routes its nested calls back onto it.
        connection.set_exclusive_owner(Some(thread::current().id()));
        inner.incoming.push(Arc::clone(&connection));
        inner.max_incoming_seen = inner.incoming.len();
        Some(connection)
    }

    /// Worker body: the command loop, then self-cleanup and notifications.
    fn join(session: Arc<Session>, setup: PreJoinSetup) {
        let PreJoinSetup { connection, status } = setup;
        match status {
            Ok(()) => {
                let conn = connection
                    .as_ref()
                    .expect("setup succeeded without a connection");
                loop {
                    match session
                        .codec
                        .get_and_execute_command(conn, &session, CommandKind::Any)
                    {
                        Ok(()) => {}
                        Err(err) if err.is_disconnect() => {
                            debug!(conn_id = conn.id(), error = %err, "incoming worker closing");
                            break;
                        }
                        Err(err) => {
                            warn!(conn_id = conn.id(), error = %err, "incoming worker closing");
                            break;
                        }
                    }
                }
            }
            Err(err) => error!(error = %err, "incoming connection failed to initialize"),
        }

        let listener = {
            let mut inner = session.inner.lock().unwrap();
            // Dropping the handle detaches the thread: cleanup and the
            // notifications below must complete before this stack unwinds,
            // so nobody can be left joining us.
            let handle = inner
                .threads
                .remove(&thread::current().id())
                .expect("worker thread not registered in session");
            drop(handle);
            inner.event_listener.upgrade()
        };

        if let Some(conn) = connection {
            assert!(
                session.remove_incoming_connection(&conn),
                "incoming connection vanished from the pool"
            );
        }
        drop(session);

        if let Some(listener) = listener {
            listener.on_session_incoming_thread_ended();
        }
    }

    /// Removes `connection` from the incoming pool, notifying the listener
    /// when that empties it.
    fn remove_incoming_connection(self: &Arc<Self>, connection: &Arc<Connection>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner
            .incoming
            .iter()
            .position(|c| Arc::ptr_eq(c, connection))
        else {
            return false;
        };
        inner.incoming.remove(pos);
        if inner.incoming.is_empty() {
            let listener = inner.event_listener.upgrade();
            drop(inner);
            if let Some(listener) = listener {
                listener.on_session_all_incoming_threads_ended(self);
            }
        }
        true
    }

    fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Issues a transaction against `object`, selecting a connection per the
    /// pool policy. [`FLAG_ONEWAY`] requests a one-way call.
    pub fn transact(
        self: &Arc<Self>,
        object: ObjectId,
        code: u32,
        data: &[u8],
        flags: u32,
    ) -> Result<Vec<u8>> {
        let use_ = if flags & FLAG_ONEWAY != 0 {
            ConnectionUse::ClientAsync
        } else {
            ConnectionUse::Client
        };
        let exclusive = ExclusiveConnection::acquire(self, use_)?;
        self.codec
            .transact(exclusive.connection(), self, object, code, data, flags)
    }

    /// Tells the peer to drop a strong reference. May piggyback on an
    /// incoming connection rather than wait for a free outgoing one.
    pub fn send_dec_strong(self: &Arc<Self>, object: ObjectId) -> Result<()> {
        let exclusive = ExclusiveConnection::acquire(self, ConnectionUse::ClientRefcount)?;
        self.codec
            .send_dec_strong(exclusive.connection(), self, object)
    }

    /// Fetches the peer's root object.
    pub fn get_root_object(self: &Arc<Self>) -> Result<ObjectId> {
        let exclusive = ExclusiveConnection::acquire(self, ConnectionUse::Client)?;
        self.codec.get_root_object(exclusive.connection(), self)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Fires the shutdown trigger and, when `wait` is set, blocks until all
    /// incoming workers have ended.
    ///
    /// Cancellation is session-wide and irrevocable: every blocked read,
    /// write, and poll returns `Cancelled`, and acquire waiters observe an
    /// empty outgoing pool.
    pub fn shutdown_and_wait(self: &Arc<Self>, wait: bool) {
        let trigger = self
            .shutdown_trigger
            .get()
            .expect("shutdown requested before the session was set up");
        trigger.trigger();

        if wait {
            let listener = self
                .shutdown_listener
                .get()
                .expect("no shutdown listener installed; only client sessions can wait here");
            listener.wait_for_shutdown();
            let inner = self.inner.lock().unwrap();
            assert!(
                inner.threads.is_empty(),
                "shutdown incomplete: {} workers still registered",
                inner.threads.len()
            );
        }

        self.codec.clear();

        // Drop the outgoing pool so blocked acquirers fail fast instead of
        // waiting for connections that will never free up again.
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            inner.outgoing_offset = 0;
            inner.outgoing.drain(..).collect::<Vec<_>>()
        };
        drop(drained);
        self.available_cv.notify_all();
        info!(wait, "session shut down");
    }
}
