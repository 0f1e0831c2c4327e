//! Core types used throughout Ansible.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a remote peer.
///
/// For datagram transports this is the sender's address:port pair; for stream
/// transports it is the remote address of the accepted stream. Either way it
/// is stable for the lifetime of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub SocketAddr);

impl PeerId {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for PeerId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Server-side connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Peer has sent traffic but not `SYS:CONN`.
    PreConnect,
    /// Handshake done, control not yet requested.
    Connected,
    /// Peer holds control.
    Active,
    /// Peer waits for control.
    Queued,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreConnect => write!(f, "PRE_CONNECT"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Queued => write!(f, "QUEUED"),
        }
    }
}

/// Active/queued code carried in `CONTROL_REQ` and `HBEAT` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActiveState {
    Active = 0,
    Queued = 1,
}

impl ActiveState {
    pub fn from_active(active: bool) -> Self {
        if active {
            Self::Active
        } else {
            Self::Queued
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Active),
            1 => Some(Self::Queued),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Queued => write!(f, "QUEUED"),
        }
    }
}

/// Client-side connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    #[default]
    NotConnected,
    Active,
    Queued,
}

impl From<ActiveState> for ClientState {
    fn from(state: ActiveState) -> Self {
        match state {
            ActiveState::Active => Self::Active,
            ActiveState::Queued => Self::Queued,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "NOT_CONNECTED"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Queued => write!(f, "QUEUED"),
        }
    }
}

/// Why a client lost its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    /// Too many consecutive heartbeats went unanswered.
    #[serde(rename = "MISSED_HBEAT")]
    MissedHeartbeat,
    /// Closed on request.
    SocketClosed,
    /// The transport failed.
    SocketError,
}

impl DisconnectReason {
    /// Numeric code reported alongside the reason (0 = clean close).
    pub fn code(self) -> u8 {
        match self {
            Self::SocketClosed => 0,
            Self::MissedHeartbeat | Self::SocketError => 1,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissedHeartbeat => write!(f, "MISSED_HBEAT"),
            Self::SocketClosed => write!(f, "SOCKET_CLOSED"),
            Self::SocketError => write!(f, "SOCKET_ERROR"),
        }
    }
}

/// Why the server removed a peer from its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// Heartbeat deadline elapsed.
    TimedOut,
    /// Peer sent `SYS:CLOSE`.
    Closed,
    /// Stream transport reported the peer gone.
    TransportClosed,
    /// Sending to the peer failed.
    TransportError(String),
    /// Server is shutting down.
    Shutdown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out"),
            Self::Closed => write!(f, "closed"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}
