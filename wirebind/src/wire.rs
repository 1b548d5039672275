//! Connection-establishment wire formats.
//!
//! Every new connection starts with a fixed [`ConnectionHeader`] written by
//! the side that opened it. On the first connection of a session the
//! accepting side answers with a [`NewSessionResponse`], followed by its
//! thread capacity (`u32` little-endian) and the assigned session id
//! (32 raw bytes). All framing after that belongs to the command codec.

use std::fmt;

/// Highest wire protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version value reserved for builds experimenting with unreleased features.
pub const PROTOCOL_VERSION_EXPERIMENTAL: u32 = u32::MAX;

/// Length in bytes of a session identifier.
pub const SESSION_ID_LEN: usize = 32;

/// Header option bit: the opening side will *serve* calls on this connection
/// (it joins the opener's incoming pool).
pub const OPT_INCOMING: u32 = 1 << 0;

/// Encoded size of a [`ConnectionHeader`].
pub const CONNECTION_HEADER_LEN: usize = 8 + SESSION_ID_LEN;

/// Opaque session identifier assigned by the accepting side.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Sentinel used while no id has been assigned yet (first handshake).
    pub const ZERO: SessionId = SessionId([0; SESSION_ID_LEN]);

    pub const fn new(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The leading quarter is enough to tell sessions apart in logs.
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// First bytes on every new connection, client side first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub version: u32,
    pub options: u32,
    pub session_id: SessionId,
}

impl ConnectionHeader {
    pub fn encode(&self) -> [u8; CONNECTION_HEADER_LEN] {
        let mut buf = [0u8; CONNECTION_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.options.to_le_bytes());
        buf[8..].copy_from_slice(self.session_id.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; CONNECTION_HEADER_LEN]) -> Self {
        let version = u32::from_le_bytes(buf[0..4].try_into().expect("slice length is 4"));
        let options = u32::from_le_bytes(buf[4..8].try_into().expect("slice length is 4"));
        let mut session_id = [0u8; SESSION_ID_LEN];
        session_id.copy_from_slice(&buf[8..]);
        Self {
            version,
            options,
            session_id: SessionId::new(session_id),
        }
    }

    /// True when the opening side will serve calls on this connection.
    pub fn is_incoming(&self) -> bool {
        self.options & OPT_INCOMING != 0
    }
}

/// Accepting side's reply on the first connection of a session.
///
/// The carried version is `min(client_proposed, server_supported)`; a server
/// refusing the proposal closes the socket instead of replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSessionResponse {
    pub version: u32,
}

impl NewSessionResponse {
    pub fn encode(&self) -> [u8; 4] {
        self.version.to_le_bytes()
    }

    pub fn decode(buf: &[u8; 4]) -> Self {
        Self {
            version: u32::from_le_bytes(*buf),
        }
    }
}
