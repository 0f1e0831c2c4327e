//! TCP transport.
//!
//! Each accepted stream is one peer. Packets are delimited by their own
//! length fields, so the read side runs the stream through a packet framer
//! and forwards one event per packet. Writes go through a bounded per-peer
//! queue drained by a writer task, so a peer that stops reading can only
//! stall its own stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{BytesCodec, Decoder, FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use super::{EventSender, SocketConfig, Transport, TransportConfig, TransportEvent};
use crate::error::{Result, TransportError};
use crate::protocol::{ClientPacketFramer, ServerPacketFramer};
use crate::types::PeerId;

/// One open stream.
struct TcpPeer {
    outbound: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
}

type PeerMap = Arc<DashMap<PeerId, TcpPeer>>;

/// Per-stream settings taken from [`TransportConfig`].
#[derive(Debug, Clone, Copy)]
struct StreamOptions {
    nodelay: bool,
    send_queue_size: usize,
    send_timeout: Duration,
}

impl StreamOptions {
    fn from_transport_config(config: &TransportConfig) -> Self {
        Self {
            nodelay: config.tcp_nodelay,
            send_queue_size: config.send_queue_size.max(1),
            send_timeout: config.send_timeout,
        }
    }
}

/// TCP transport.
pub struct TcpTransport {
    peers: PeerMap,
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Bind a listener and start accepting peers.
    pub fn bind(addr: SocketAddr, config: &TransportConfig, events: EventSender) -> Result<Self> {
        let socket_config = SocketConfig::from_transport_config(config);
        let std_socket = super::socket::create_tcp_socket(addr, &socket_config)?;

        let std_listener: std::net::TcpListener = std_socket.into();
        let listener =
            TcpListener::from_std(std_listener).map_err(|e| TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            })?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        let peers: PeerMap = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&peers),
            StreamOptions::from_transport_config(config),
            events,
        ));

        debug!("TCP transport listening on {}", local_addr);
        Ok(Self {
            peers,
            local_addr,
            accept_task: Some(accept_task),
        })
    }

    /// Connect to a server and start reading its packets.
    pub async fn connect(
        remote_addr: SocketAddr,
        config: &TransportConfig,
        events: EventSender,
    ) -> Result<Self> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(remote_addr))
            .await
            .map_err(|_| crate::Error::ConnectionTimeout)?
            .map_err(|e| crate::Error::ConnectionFailed {
                addr: remote_addr,
                reason: e.to_string(),
            })?;

        let options = StreamOptions::from_transport_config(config);
        if options.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::Tcp(e.to_string()))?;
        }

        let local_addr = stream
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        let peers: PeerMap = Arc::new(DashMap::new());
        let peer = PeerId::new(remote_addr);
        register_peer(
            &peers,
            peer,
            stream,
            ServerPacketFramer::new(),
            events,
            options,
        );

        Ok(Self {
            peers,
            local_addr,
            accept_task: None,
        })
    }

    /// Number of open streams.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: PeerMap,
    options: StreamOptions,
    events: EventSender,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                if events.is_closed() {
                    break;
                }
                continue;
            }
        };

        if options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }
        }

        info!("Accepted TCP peer {}", addr);
        register_peer(
            &peers,
            PeerId::new(addr),
            stream,
            ClientPacketFramer::new(),
            events.clone(),
            options,
        );
    }
}

fn register_peer<D>(
    peers: &PeerMap,
    peer: PeerId,
    stream: TcpStream,
    framer: D,
    events: EventSender,
    options: StreamOptions,
) where
    D: Decoder<Item = Bytes, Error = crate::Error> + Send + 'static,
{
    if let Some((_, stale)) = peers.remove(&peer) {
        stale.reader.abort();
    }

    let (read_half, write_half) = stream.into_split();
    let (outbound, queued) = mpsc::channel(options.send_queue_size);
    tokio::spawn(write_loop(write_half, queued, peer, options.send_timeout));

    // Hold the entry while spawning so the reader cannot remove the peer
    // before it has been inserted.
    let entry = peers.entry(peer);
    let reader = tokio::spawn(read_loop(
        read_half,
        framer,
        peer,
        Arc::clone(peers),
        events,
    ));
    entry.insert(TcpPeer { outbound, reader });
}

/// Forward framed packets until the stream ends, then report the peer closed.
async fn read_loop<D>(
    read_half: OwnedReadHalf,
    framer: D,
    peer: PeerId,
    peers: PeerMap,
    events: EventSender,
) where
    D: Decoder<Item = Bytes, Error = crate::Error>,
{
    let mut frames = FramedRead::new(read_half, framer);

    while let Some(frame) = frames.next().await {
        let event = match frame {
            Ok(data) => {
                trace!("Received {} byte packet from {}", data.len(), peer);
                TransportEvent::Message { peer, data }
            }
            Err(error) => {
                warn!("TCP read from {} failed: {}", peer, error);
                let _ = events
                    .send(TransportEvent::Error {
                        peer: Some(peer),
                        error,
                    })
                    .await;
                break;
            }
        };

        if events.send(event).await.is_err() {
            return;
        }
    }

    debug!("TCP stream from {} ended", peer);
    peers.remove(&peer);
    let _ = events.send(TransportEvent::Closed { peer }).await;
}

/// Drain the peer's send queue into the stream.
///
/// Stops on the first failed or overdue write. Once the queue is dropped the
/// remaining packets are flushed and the write side is shut down.
async fn write_loop(
    write_half: OwnedWriteHalf,
    mut queued: mpsc::Receiver<Bytes>,
    peer: PeerId,
    send_timeout: Duration,
) {
    let mut sink = FramedWrite::new(write_half, BytesCodec::new());

    while let Some(data) = queued.recv().await {
        match timeout(send_timeout, sink.send(data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("TCP write to {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!("TCP write to {} stalled for {:?}", peer, send_timeout);
                return;
            }
        }
    }

    match timeout(send_timeout, SinkExt::<Bytes>::close(&mut sink)).await {
        Ok(Ok(())) => debug!("Closed TCP write side for {}", peer),
        Ok(Err(e)) => debug!("TCP shutdown for {} failed: {}", peer, e),
        Err(_) => debug!("TCP shutdown for {} stalled", peer),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send_to(&self, data: &[u8], peer: PeerId) -> Result<usize> {
        let tcp_peer = self
            .peers
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;

        tcp_peer
            .outbound
            .try_send(Bytes::copy_from_slice(data))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    TransportError::SendFailed(format!("send queue for {peer} is full"))
                }
                TrySendError::Closed(_) => {
                    TransportError::SendFailed(format!("stream to {peer} is closed"))
                }
            })?;
        Ok(data.len())
    }

    async fn disconnect(&self, peer: PeerId) -> Result<()> {
        let Some((_, tcp_peer)) = self.peers.remove(&peer) else {
            return Ok(());
        };

        // Dropping the queue lets the writer flush and shut the stream down.
        tcp_peer.reader.abort();
        debug!("Disconnected TCP peer {}", peer);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(ref task) = self.accept_task {
            task.abort();
        }

        let peers: Vec<PeerId> = self.peers.iter().map(|p| *p.key()).collect();
        for peer in peers {
            self.disconnect(peer).await?;
        }
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(ref task) = self.accept_task {
            task.abort();
        }
        for peer in self.peers.iter() {
            peer.reader.abort();
        }
    }
}
