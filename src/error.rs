//! Error types for Ansible.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::PeerId;

/// Result type alias for Ansible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Ansible.
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    ConnectionTimeout,

    // Client request errors
    #[error("not connected")]
    NotConnected,

    #[error("invalid client state: {0}")]
    InvalidClientState(String),

    #[error("request failed with status {status}")]
    RequestFailed { status: u8 },

    #[error("request timed out (seq {seq})")]
    RequestTimedOut { seq: u8 },

    #[error("sequence number {0} is still awaiting a response")]
    SequenceInUse(u8),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("TCP error: {0}")]
    Tcp(String),
}

/// Packet framing and payload errors.
///
/// The first four variants are the framing failures a decoder reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid packet size: {size} bytes (min {min})")]
    InvalidPacketSize { size: usize, min: usize },

    #[error("invalid header")]
    InvalidHeader,

    #[error("buffer size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("checksum mismatch: expected {expected:#04x}, got {got:#04x}")]
    ChecksumMismatch { expected: u8, got: u8 },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl Error {
    /// Check if error is recoverable (should retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout
                | Error::RequestTimedOut { .. }
                | Error::SequenceInUse(_)
                | Error::Transport(
                    TransportError::SendFailed(_) | TransportError::ReceiveFailed(_)
                )
                | Error::Io(_)
        )
    }

    /// Check if error indicates connection should be reset.
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::ConnectionFailed { .. }
                | Error::NotConnected
        )
    }

    /// The response status carried by a failed request, if any.
    pub fn status(&self) -> Option<u8> {
        match self {
            Error::RequestFailed { status } => Some(*status),
            _ => None,
        }
    }
}
