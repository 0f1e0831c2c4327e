//! Transport layer for Ansible.
//!
//! Carries raw packet bytes between peers over UDP or TCP. Outbound traffic
//! goes through the [`Transport`] trait; inbound traffic is delivered as
//! [`TransportEvent`]s over an mpsc channel so the server and client can
//! consume it inside their own event loops.

mod socket;
mod tcp;
mod udp;

pub use socket::{create_tcp_socket, create_udp_socket, SocketConfig};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::PeerId;

/// Capacity of the inbound event channel.
pub const INBOUND_QUEUE_SIZE: usize = 1024;

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Send buffer size in bytes.
    #[serde(default = "default_send_buffer")]
    pub send_buffer_size: usize,

    /// Receive buffer size in bytes.
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer_size: usize,

    /// Largest datagram read from a UDP socket.
    #[serde(default = "default_max_datagram")]
    pub max_datagram_size: usize,

    /// Connection timeout for stream transports.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Keep-alive interval for TCP.
    #[serde(default = "default_keepalive", with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Outbound packets buffered per stream peer before sends start failing.
    #[serde(default = "default_send_queue")]
    pub send_queue_size: usize,

    /// Longest a single stream write may take before the peer is dropped.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Enable TCP_NODELAY.
    #[serde(default = "default_nodelay")]
    pub tcp_nodelay: bool,

    /// Enable SO_REUSEADDR.
    #[serde(default = "default_reuse_addr")]
    pub reuse_addr: bool,

    /// Enable SO_REUSEPORT (where available).
    #[serde(default)]
    pub reuse_port: bool,
}

fn default_send_buffer() -> usize {
    256 * 1024
}
fn default_recv_buffer() -> usize {
    256 * 1024
}
fn default_max_datagram() -> usize {
    2048
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_keepalive() -> Duration {
    Duration::from_secs(30)
}
fn default_send_queue() -> usize {
    64
}
fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_nodelay() -> bool {
    true
}
fn default_reuse_addr() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: default_send_buffer(),
            recv_buffer_size: default_recv_buffer(),
            max_datagram_size: default_max_datagram(),
            connect_timeout: default_connect_timeout(),
            keepalive_interval: default_keepalive(),
            send_queue_size: default_send_queue(),
            send_timeout: default_send_timeout(),
            tcp_nodelay: default_nodelay(),
            reuse_addr: default_reuse_addr(),
            reuse_port: false,
        }
    }
}

/// Something that happened on the receive side of a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes arrived from a peer. One datagram, or one framed packet of a stream.
    Message { peer: PeerId, data: Bytes },
    /// A stream peer went away.
    Closed { peer: PeerId },
    /// Receiving from a peer failed.
    Error { peer: Option<PeerId>, error: Error },
}

/// Sender half handed to transport receive tasks.
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Receiver half consumed by the server or client loop.
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Outbound side of a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the local address.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Send one encoded packet to a peer.
    async fn send_to(&self, data: &[u8], peer: PeerId) -> Result<usize>;

    /// Forget a peer. Stream transports close its connection.
    async fn disconnect(&self, peer: PeerId) -> Result<()>;

    /// Stop receiving and release the socket(s).
    async fn close(&self) -> Result<()>;

    /// Get transport type name.
    fn transport_type(&self) -> &'static str;
}

/// Transport protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl std::str::FromStr for TransportProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => Err(Error::InvalidConfig(format!("unknown protocol: {other}"))),
        }
    }
}

/// Bind a listening transport (server side).
pub async fn bind(
    protocol: TransportProtocol,
    bind_addr: SocketAddr,
    config: &TransportConfig,
) -> Result<(Arc<dyn Transport>, EventReceiver)> {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
    let transport: Arc<dyn Transport> = match protocol {
        TransportProtocol::Udp => Arc::new(UdpTransport::bind(bind_addr, config, tx)?),
        TransportProtocol::Tcp => Arc::new(TcpTransport::bind(bind_addr, config, tx)?),
    };
    Ok((transport, rx))
}

/// Connect to a server (client side).
///
/// The server is the only peer of the returned transport; its [`PeerId`] is
/// `remote_addr`.
pub async fn connect(
    protocol: TransportProtocol,
    remote_addr: SocketAddr,
    config: &TransportConfig,
) -> Result<(Arc<dyn Transport>, EventReceiver)> {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
    let transport: Arc<dyn Transport> = match protocol {
        TransportProtocol::Udp => Arc::new(UdpTransport::connect(remote_addr, config, tx).await?),
        TransportProtocol::Tcp => Arc::new(TcpTransport::connect(remote_addr, config, tx).await?),
    };
    Ok((transport, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("UDP".parse::<TransportProtocol>().unwrap(), TransportProtocol::Udp);
        assert_eq!("tcp".parse::<TransportProtocol>().unwrap(), TransportProtocol::Tcp);
        assert!("sctp".parse::<TransportProtocol>().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: TransportConfig = toml::from_str("").unwrap();
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.max_datagram_size, 2048);
        assert_eq!(config.send_queue_size, 64);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
    }
}
