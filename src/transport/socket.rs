//! Low-level socket creation through socket2, so buffer sizes and address
//! reuse can be set before binding.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::TransportConfig;
use crate::error::{Result, TransportError};

/// Backlog of a listening TCP socket.
const LISTEN_BACKLOG: i32 = 128;

/// Socket configuration options.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub nodelay: bool,
    pub keepalive: Option<std::time::Duration>,
}

impl SocketConfig {
    /// Create from transport config.
    pub fn from_transport_config(config: &TransportConfig) -> Self {
        Self {
            send_buffer_size: config.send_buffer_size,
            recv_buffer_size: config.recv_buffer_size,
            reuse_addr: config.reuse_addr,
            reuse_port: config.reuse_port,
            nodelay: config.tcp_nodelay,
            keepalive: Some(config.keepalive_interval).filter(|d| !d.is_zero()),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::from_transport_config(&TransportConfig::default())
    }
}

fn domain_for(addr: SocketAddr) -> Domain {
    if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    }
}

/// Create a bound, non-blocking UDP socket.
pub fn create_udp_socket(addr: SocketAddr, config: &SocketConfig) -> Result<Socket> {
    let socket = Socket::new(domain_for(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    configure_socket(&socket, config)?;

    // For IPv6, allow IPv4 mapped addresses
    if addr.is_ipv6() {
        socket
            .set_only_v6(false)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    debug!("Created UDP socket on {}", addr);
    Ok(socket)
}

/// Create a bound, listening, non-blocking TCP socket.
pub fn create_tcp_socket(addr: SocketAddr, config: &SocketConfig) -> Result<Socket> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    configure_socket(&socket, config)?;

    if config.nodelay {
        socket
            .set_nodelay(true)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
    }

    if let Some(keepalive) = config.keepalive {
        let ka = socket2::TcpKeepalive::new()
            .with_time(keepalive)
            .with_interval(keepalive / 3);

        socket
            .set_tcp_keepalive(&ka)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
    }

    if addr.is_ipv6() {
        socket
            .set_only_v6(false)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        })?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    debug!("Created TCP listener on {}", addr);
    Ok(socket)
}

/// Apply common socket configuration.
fn configure_socket(socket: &Socket, config: &SocketConfig) -> Result<()> {
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set send buffer: {e}")))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set recv buffer: {e}")))?;

    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::SocketError(format!("set reuse addr: {e}")))?;
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    if config.reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(|e| TransportError::SocketError(format!("set reuse port: {e}")))?;
    }

    Ok(())
}
