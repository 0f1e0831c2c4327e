//! UDP transport.
//!
//! One datagram carries one packet. A bound transport serves many peers, each
//! identified by its source address; a connected transport talks to a single
//! server.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{EventSender, SocketConfig, Transport, TransportConfig, TransportEvent};
use crate::error::{Result, TransportError};
use crate::types::PeerId;

/// UDP transport.
pub struct UdpTransport {
    socket: Arc<TokioUdpSocket>,
    remote_addr: Option<SocketAddr>,
    recv_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind to a local address and start receiving.
    pub fn bind(addr: SocketAddr, config: &TransportConfig, events: EventSender) -> Result<Self> {
        let socket = Self::open(addr, config)?;
        let recv_task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            None,
            config.max_datagram_size,
            events,
        ));

        debug!("UDP transport listening on {:?}", socket.local_addr().ok());
        Ok(Self {
            socket,
            remote_addr: None,
            recv_task,
        })
    }

    /// Create a socket connected to `remote_addr` and start receiving.
    pub async fn connect(
        remote_addr: SocketAddr,
        config: &TransportConfig,
        events: EventSender,
    ) -> Result<Self> {
        let bind = if remote_addr.is_ipv6() {
            SocketAddr::from(([0u8; 16], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };

        let socket = Self::open(bind, config)?;
        socket
            .connect(remote_addr)
            .await
            .map_err(|e| crate::Error::ConnectionFailed {
                addr: remote_addr,
                reason: e.to_string(),
            })?;

        let recv_task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            Some(remote_addr),
            config.max_datagram_size,
            events,
        ));

        Ok(Self {
            socket,
            remote_addr: Some(remote_addr),
            recv_task,
        })
    }

    fn open(addr: SocketAddr, config: &TransportConfig) -> Result<Arc<TokioUdpSocket>> {
        let socket_config = SocketConfig::from_transport_config(config);
        let std_socket = super::socket::create_udp_socket(addr, &socket_config)?;

        let socket =
            TokioUdpSocket::from_std(std_socket.into()).map_err(|e| TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            })?;
        Ok(Arc::new(socket))
    }
}

/// Forward every received datagram until the event receiver goes away.
async fn recv_loop(
    socket: Arc<TokioUdpSocket>,
    remote: Option<SocketAddr>,
    max_datagram_size: usize,
    events: EventSender,
) {
    let mut buf = vec![0u8; max_datagram_size];

    loop {
        let received = match remote {
            Some(addr) => socket.recv(&mut buf).await.map(|len| (len, addr)),
            None => socket.recv_from(&mut buf).await,
        };

        let event = match received {
            Ok((len, addr)) => {
                trace!("Received {} bytes from {}", len, addr);
                TransportEvent::Message {
                    peer: PeerId::new(addr),
                    data: Bytes::copy_from_slice(&buf[..len]),
                }
            }
            Err(e) => {
                // ICMP errors surface here; the socket itself stays usable
                warn!("UDP receive error: {}", e);
                TransportEvent::Error {
                    peer: remote.map(PeerId::new),
                    error: TransportError::ReceiveFailed(e.to_string()).into(),
                }
            }
        };

        if events.send(event).await.is_err() {
            debug!("UDP event receiver dropped, stopping receive loop");
            break;
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()).into())
    }

    async fn send_to(&self, data: &[u8], peer: PeerId) -> Result<usize> {
        let sent = match self.remote_addr {
            Some(remote) if remote == peer.addr() => self.socket.send(data).await,
            Some(_) => return Err(TransportError::UnknownPeer(peer).into()),
            None => self.socket.send_to(data, peer.addr()).await,
        };
        sent.map_err(|e| TransportError::SendFailed(e.to_string()).into())
    }

    async fn disconnect(&self, peer: PeerId) -> Result<()> {
        // Nothing to tear down for a connectionless peer
        trace!("Forgetting UDP peer {}", peer);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.recv_task.abort();
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "udp"
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}
