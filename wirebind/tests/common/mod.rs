//! Shared helpers for the integration tests: a minimal framed codec plus a
//! threaded test server that speaks the session handshake.
//!
//! The codec is deliberately tiny — length-prefixed frames with a one-byte
//! kind — but it is a real state machine in the one way that matters here:
//! while waiting for a reply it executes transactions that arrive in the
//! meantime, which is what makes nested calls over a single connection work.

#![allow(dead_code)]

use std::net::TcpListener;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use wirebind::wire::{self, ConnectionHeader, NewSessionResponse, SessionId};
use wirebind::{
    CommandCodec, CommandKind, Connection, EventListener, ObjectId, RawTransport, Result,
    RpcError, Session, Transport, FLAG_ONEWAY,
};

pub const FRAME_INIT: u8 = 0;
pub const FRAME_TRANSACT: u8 = 1;
pub const FRAME_REPLY: u8 = 2;
pub const FRAME_DEC_STRONG: u8 = 3;
pub const FRAME_ROOT_REQUEST: u8 = 4;
pub const FRAME_ROOT_REPLY: u8 = 5;

/// Object id every test server hands out as its root.
pub const ROOT_OBJECT: ObjectId = ObjectId(1);

/// Handler invoked for every transaction served on a session.
pub type Handler = Arc<dyn Fn(&Arc<Session>, u32, &[u8]) -> Vec<u8> + Send + Sync>;

/// One transaction sent by this side, as observed at the codec.
#[derive(Debug, Clone)]
pub struct SentCall {
    pub conn_id: u64,
    pub code: u32,
    /// True when the call went out over an incoming (nest-capable)
    /// connection, i.e. it was a nested call.
    pub over_incoming: bool,
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[..4].try_into().unwrap())
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[..8].try_into().unwrap())
}

fn write_frame(
    transport: &dyn Transport,
    trigger: &wirebind::ShutdownTrigger,
    kind: u8,
    payload: &[u8],
) -> Result<()> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32 + 1).to_le_bytes());
    frame.push(kind);
    frame.extend_from_slice(payload);
    transport.write_fully(trigger, &frame)
}

fn read_frame(
    transport: &dyn Transport,
    trigger: &wirebind::ShutdownTrigger,
) -> Result<(u8, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    transport.read_fully(trigger, &mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(RpcError::BadValue("empty frame".into()));
    }
    let mut body = vec![0u8; len];
    transport.read_fully(trigger, &mut body)?;
    let kind = body[0];
    body.remove(0);
    Ok((kind, body))
}

/// Minimal framed codec implementing [`CommandCodec`].
pub struct FrameCodec {
    handler: Mutex<Option<Handler>>,
    sent: Mutex<Vec<SentCall>>,
    served: Mutex<Vec<(u64, u32)>>,
    dec_strong: Mutex<Vec<ObjectId>>,
}

impl FrameCodec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            served: Mutex::new(Vec::new()),
            dec_strong: Mutex::new(Vec::new()),
        })
    }

    pub fn with_handler(handler: Handler) -> Arc<Self> {
        let codec = Self::new();
        codec.set_handler(handler);
        codec
    }

    pub fn set_handler(&self, handler: Handler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Calls sent by this side, in order.
    pub fn sent(&self) -> Vec<SentCall> {
        self.sent.lock().unwrap().clone()
    }

    /// `(connection id, code)` pairs served on this side, in order.
    pub fn served(&self) -> Vec<(u64, u32)> {
        self.served.lock().unwrap().clone()
    }

    pub fn dec_strong_log(&self) -> Vec<ObjectId> {
        self.dec_strong.lock().unwrap().clone()
    }

    fn run_handler(&self, session: &Arc<Session>, code: u32, data: &[u8]) -> Vec<u8> {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(session, code, data),
            None => Vec::new(),
        }
    }

    fn serve_transact(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() < 16 {
            return Err(RpcError::BadValue("short transact frame".into()));
        }
        let code = read_u32(&payload[8..]);
        let flags = read_u32(&payload[12..]);
        let data = &payload[16..];
        self.served.lock().unwrap().push((connection.id(), code));

        let reply = self.run_handler(session, code, data);
        if flags & FLAG_ONEWAY == 0 {
            write_frame(
                connection.transport(),
                session.shutdown_trigger(),
                FRAME_REPLY,
                &reply,
            )?;
        }
        Ok(())
    }

    /// Reads frames until `want` arrives, serving interleaved commands —
    /// that is how a nested transaction reaches the thread that is blocked
    /// waiting for its own reply.
    fn wait_for_frame(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        want: u8,
    ) -> Result<Vec<u8>> {
        loop {
            let (kind, payload) = read_frame(connection.transport(), session.shutdown_trigger())?;
            if kind == want {
                return Ok(payload);
            }
            match kind {
                FRAME_TRANSACT => self.serve_transact(connection, session, &payload)?,
                FRAME_DEC_STRONG => {
                    self.dec_strong.lock().unwrap().push(ObjectId(read_u64(&payload)));
                }
                other => {
                    return Err(RpcError::BadValue(format!(
                        "unexpected frame {other} while waiting for {want}"
                    )))
                }
            }
        }
    }
}

impl CommandCodec for FrameCodec {
    fn send_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
    ) -> Result<()> {
        write_frame(
            connection.transport(),
            session.shutdown_trigger(),
            FRAME_INIT,
            &[],
        )
    }

    fn read_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
    ) -> Result<()> {
        let (kind, _) = read_frame(connection.transport(), session.shutdown_trigger())?;
        if kind != FRAME_INIT {
            return Err(RpcError::BadValue(format!(
                "expected connection init, got frame {kind}"
            )));
        }
        Ok(())
    }

    fn get_root_object(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
    ) -> Result<ObjectId> {
        write_frame(
            connection.transport(),
            session.shutdown_trigger(),
            FRAME_ROOT_REQUEST,
            &[],
        )?;
        let payload = self.wait_for_frame(connection, session, FRAME_ROOT_REPLY)?;
        Ok(ObjectId(read_u64(&payload)))
    }

    fn transact(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        object: ObjectId,
        code: u32,
        data: &[u8],
        flags: u32,
    ) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(16 + data.len());
        payload.extend_from_slice(&object.0.to_le_bytes());
        payload.extend_from_slice(&code.to_le_bytes());
        payload.extend_from_slice(&flags.to_le_bytes());
        payload.extend_from_slice(data);

        self.sent.lock().unwrap().push(SentCall {
            conn_id: connection.id(),
            code,
            over_incoming: connection.allows_nested(),
        });
        write_frame(
            connection.transport(),
            session.shutdown_trigger(),
            FRAME_TRANSACT,
            &payload,
        )?;

        if flags & FLAG_ONEWAY != 0 {
            return Ok(Vec::new());
        }
        self.wait_for_frame(connection, session, FRAME_REPLY)
    }

    fn send_dec_strong(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        object: ObjectId,
    ) -> Result<()> {
        write_frame(
            connection.transport(),
            session.shutdown_trigger(),
            FRAME_DEC_STRONG,
            &object.0.to_le_bytes(),
        )
    }

    fn get_and_execute_command(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<Session>,
        _kind: CommandKind,
    ) -> Result<()> {
        let (kind, payload) = read_frame(connection.transport(), session.shutdown_trigger())?;
        match kind {
            FRAME_TRANSACT => self.serve_transact(connection, session, &payload),
            FRAME_DEC_STRONG => {
                self.dec_strong.lock().unwrap().push(ObjectId(read_u64(&payload)));
                Ok(())
            }
            FRAME_ROOT_REQUEST => write_frame(
                connection.transport(),
                session.shutdown_trigger(),
                FRAME_ROOT_REPLY,
                &ROOT_OBJECT.0.to_le_bytes(),
            ),
            FRAME_INIT => Ok(()),
            other => Err(RpcError::BadValue(format!("unexpected frame {other}"))),
        }
    }

    fn clear(&self) {
        *self.handler.lock().unwrap() = None;
    }
}

// ---------------------------------------------------------------------
// Test server
// ---------------------------------------------------------------------

/// Listener that ignores all session lifecycle events.
struct NullListener;

impl EventListener for NullListener {
    fn on_session_all_incoming_threads_ended(&self, _session: &Arc<Session>) {}
    fn on_session_incoming_thread_ended(&self) {}
}

enum SocketListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl SocketListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            SocketListener::Unix(listener) => listener.as_fd(),
            SocketListener::Tcp(listener) => listener.as_fd(),
        }
    }

    fn accept_fd(&self) -> std::io::Result<OwnedFd> {
        match self {
            SocketListener::Unix(listener) => listener.accept().map(|(s, _)| OwnedFd::from(s)),
            SocketListener::Tcp(listener) => listener.accept().map(|(s, _)| OwnedFd::from(s)),
        }
    }
}

struct ServerInner {
    trigger: wirebind::ShutdownTrigger,
    codec: Arc<FrameCodec>,
    listener: Arc<dyn EventListener>,
    sessions: Mutex<Vec<Arc<Session>>>,
    max_threads: usize,
    next_session: AtomicU64,
}

/// Accepting side of the tests: creates one server-role [`Session`] per
/// dialing peer and routes accepted connections into it.
pub struct TestServer {
    inner: Arc<ServerInner>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start_unix(
        dir: &Path,
        max_threads: usize,
        codec: Arc<FrameCodec>,
    ) -> (TestServer, PathBuf) {
        let path = dir.join("wirebind.sock");
        let listener = UnixListener::bind(&path).unwrap();
        listener.set_nonblocking(true).unwrap();
        (
            Self::start(SocketListener::Unix(listener), max_threads, codec),
            path,
        )
    }

    pub fn start_tcp(max_threads: usize, codec: Arc<FrameCodec>) -> (TestServer, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();
        (
            Self::start(SocketListener::Tcp(listener), max_threads, codec),
            port,
        )
    }

    fn start(listener: SocketListener, max_threads: usize, codec: Arc<FrameCodec>) -> TestServer {
        let inner = Arc::new(ServerInner {
            trigger: wirebind::ShutdownTrigger::new().unwrap(),
            codec,
            listener: Arc::new(NullListener),
            sessions: Mutex::new(Vec::new()),
            max_threads,
            next_session: AtomicU64::new(1),
        });
        let accept_inner = Arc::clone(&inner);
        let accept_thread = thread::Builder::new()
            .name("test-server-accept".into())
            .spawn(move || accept_loop(accept_inner, listener))
            .unwrap();
        TestServer {
            inner,
            accept_thread: Some(accept_thread),
        }
    }

    /// Hands out the client end of a fresh socket pair whose server end is
    /// treated like an accepted connection, for preconnected setups.
    pub fn preconnect(&self) -> OwnedFd {
        let (client, server) =
            socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None).unwrap();
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || handle_connection(inner, server.into()));
        client.into()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.lock().unwrap().clone()
    }

    /// The session established by the first dialing peer.
    pub fn session(&self) -> Arc<Session> {
        self.sessions().first().cloned().expect("no session established")
    }

    pub fn shutdown(&mut self) {
        self.inner.trigger.trigger();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        for session in self.sessions() {
            session.shutdown_and_wait(false);
        }
        for session in self.sessions() {
            wait_until(Duration::from_secs(5), || session.stats().live_workers == 0);
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(inner: Arc<ServerInner>, listener: SocketListener) {
    loop {
        if inner
            .trigger
            .interruptible_poll(listener.as_fd(), libc::POLLIN)
            .is_err()
        {
            break;
        }
        match listener.accept_fd() {
            Ok(fd) => {
                let conn_inner = Arc::clone(&inner);
                thread::spawn(move || handle_connection(conn_inner, fd));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
    }
}

fn next_session_id(inner: &ServerInner) -> SessionId {
    let n = inner.next_session.fetch_add(1, Ordering::Relaxed);
    let mut bytes = [0u8; wire::SESSION_ID_LEN];
    bytes[..8].copy_from_slice(&n.to_le_bytes());
    SessionId::new(bytes)
}

fn handle_connection(inner: Arc<ServerInner>, fd: OwnedFd) {
    let transport = RawTransport::new(fd).unwrap();
    let mut header_buf = [0u8; wire::CONNECTION_HEADER_LEN];
    if transport.read_fully(&inner.trigger, &mut header_buf).is_err() {
        return;
    }
    let header = ConnectionHeader::decode(&header_buf);

    let session = if header.session_id.is_zero() {
        // First connection of a new session: create it and answer the
        // handshake with version, capacity, and the assigned id.
        let session = Session::make(Arc::clone(&inner.codec) as Arc<dyn CommandCodec>);
        session.set_max_threads(inner.max_threads);
        let id = next_session_id(&inner);
        session.set_for_server(&inner.listener, id).unwrap();
        let version = header.version.min(wire::PROTOCOL_VERSION);
        session.set_protocol_version(version).unwrap();

        let mut reply = Vec::new();
        reply.extend_from_slice(&NewSessionResponse { version }.encode());
        reply.extend_from_slice(&(inner.max_threads as u32).to_le_bytes());
        reply.extend_from_slice(id.as_bytes());
        if transport.write_fully(&inner.trigger, &reply).is_err() {
            return;
        }

        inner.sessions.lock().unwrap().push(Arc::clone(&session));
        session
    } else {
        let sessions = inner.sessions.lock().unwrap();
        match sessions
            .iter()
            .find(|s| s.session_id() == header.session_id)
        {
            Some(session) => Arc::clone(session),
            None => return,
        }
    };

    let transport: Box<dyn Transport> = Box::new(transport);
    let result = if header.is_incoming() {
        // The dialing side serves on this connection, so this side calls on it.
        session.add_outgoing_connection(transport, true)
    } else {
        session.add_incoming_connection(transport)
    };
    if let Err(err) = result {
        eprintln!("test server failed to add connection: {err}");
    }
}

/// Client-side session wired to `codec`.
pub fn client_session(codec: &Arc<FrameCodec>, max_threads: usize) -> Arc<Session> {
    let session = Session::make(Arc::clone(codec) as Arc<dyn CommandCodec>);
    session.set_max_threads(max_threads);
    session
}

pub fn echo_handler() -> Handler {
    Arc::new(|_session, _code, data| data.to_vec())
}
