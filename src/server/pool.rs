//! Connection pool.
//!
//! Owns every [`Connection`], keeps them in arrival order and grants control
//! to the head of that order. All heartbeat and data-request deadlines live in
//! one [`DelayQueue`]; each connection and each pending request holds exactly
//! one key into it.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionEvent};
use super::events::{DataRequest, RequestId, Responder, ServerCommand, ServerEvent};
use crate::commands::{CommandDescriptor, CommandParams, CommandTable};
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{ClientPacket, ServerAsyncPacket, ServerResponsePacket, StatusCode};
use crate::transport::{Transport, TransportEvent};
use crate::types::{PeerId, RemovalReason};

/// Pool timing and version settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle time after which a peer is dropped. Zero disables the check.
    pub heartbeat_timeout: Duration,
    /// How long the application has to answer a data request.
    pub data_required_timeout: Duration,
    /// `(major << 8) | minor`, answered to `SYS:VERS`.
    pub version: u16,
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_timeout: config.server.heartbeat_timeout,
            data_required_timeout: config.server.data_required_timeout,
            version: config.protocol.version(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Deadline kinds held in the pool's delay queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTimer {
    Heartbeat(PeerId),
    DataRequired(RequestId),
}

#[derive(Debug)]
struct PendingData {
    peer: PeerId,
    seq: u8,
    command: Arc<CommandDescriptor>,
    timer: delay_queue::Key,
}

/// Tracks peers and arbitrates which one is active.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    commands: Arc<CommandTable>,
    config: PoolConfig,
    connections: HashMap<PeerId, Connection>,
    /// Arrival order; the head is the active peer.
    order: Vec<PeerId>,
    timers: DelayQueue<PoolTimer>,
    pending: HashMap<RequestId, PendingData>,
    next_request_id: RequestId,
    events: mpsc::UnboundedSender<ServerEvent>,
    responder_tx: mpsc::UnboundedSender<ServerCommand>,
}

impl ConnectionPool {
    /// Create an empty pool.
    ///
    /// Events go to `events`; responders created for data requests send
    /// their answers to `responder_tx`, which the owner feeds back into
    /// [`ConnectionPool::respond`].
    pub fn new(
        transport: Arc<dyn Transport>,
        commands: Arc<CommandTable>,
        config: PoolConfig,
        events: mpsc::UnboundedSender<ServerEvent>,
        responder_tx: mpsc::UnboundedSender<ServerCommand>,
    ) -> Self {
        Self {
            transport,
            commands,
            config,
            connections: HashMap::new(),
            order: Vec::new(),
            timers: DelayQueue::new(),
            pending: HashMap::new(),
            next_request_id: 1,
            events,
            responder_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The peer currently holding control.
    pub fn active_peer(&self) -> Option<PeerId> {
        self.order.first().copied()
    }

    /// Peers in arrival order, active first.
    pub fn peers(&self) -> &[PeerId] {
        &self.order
    }

    pub fn connection(&self, peer: PeerId) -> Option<&Connection> {
        self.connections.get(&peer)
    }

    /// Number of data requests awaiting an answer.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.commands
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("Server event receiver dropped");
        }
    }

    /// Route one transport event.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { peer, data } => self.process_message(&data, peer).await,
            TransportEvent::Closed { peer } => {
                self.remove(peer, RemovalReason::TransportClosed).await;
            }
            TransportEvent::Error {
                peer: Some(peer),
                error,
            } => {
                let reason = RemovalReason::TransportError(error.to_string());
                self.emit(ServerEvent::Error {
                    peer: Some(peer),
                    error,
                });
                self.remove(peer, reason).await;
            }
            TransportEvent::Error { peer: None, error } => {
                warn!("Transport error: {}", error);
                self.emit(ServerEvent::Error { peer: None, error });
            }
        }
    }

    /// Handle raw bytes received from `peer`.
    pub async fn process_message(&mut self, data: &[u8], peer: PeerId) {
        let packet = match ClientPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping packet from {}: {}", peer, e);
                return;
            }
        };

        let command = self.commands.command_for(packet.did, packet.cid).cloned();
        let is_system = command.as_ref().is_some_and(|c| c.is_system());

        if !self.connections.contains_key(&peer) {
            self.add_connection(peer);
        }

        // Device traffic is only accepted from the active peer
        if !is_system && self.active_peer() != Some(peer) {
            debug!(
                "Ignoring DID {:#04x} CID {:#04x} from non-active peer {}",
                packet.did, packet.cid, peer
            );
            return;
        }

        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        let reaction = conn.process_message(&packet, command.as_ref());

        if reaction.rearm_heartbeat {
            self.rearm_heartbeat(peer);
        }

        if let Some(response) = reaction.response {
            if !self.send_response(peer, &response).await {
                return;
            }
        }

        for event in reaction.events {
            self.dispatch(peer, event).await;
        }
    }

    fn add_connection(&mut self, peer: PeerId) {
        let active = self.order.is_empty();
        let mut conn = Connection::new(peer, active, self.config.version);

        if !self.config.heartbeat_timeout.is_zero() {
            let key = self
                .timers
                .insert(PoolTimer::Heartbeat(peer), self.config.heartbeat_timeout);
            conn.set_heartbeat_key(Some(key));
        }

        self.connections.insert(peer, conn);
        self.order.push(peer);
        info!(
            "New connection from {} ({} in pool, {})",
            peer,
            self.order.len(),
            if active { "active" } else { "queued" }
        );
    }

    fn rearm_heartbeat(&mut self, peer: PeerId) {
        if let Some(key) = self.connections.get(&peer).and_then(|c| c.heartbeat_key()) {
            self.timers.reset(key, self.config.heartbeat_timeout);
        }
    }

    async fn dispatch(&mut self, peer: PeerId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { from, to } => {
                self.emit(ServerEvent::StateChanged { peer, from, to });
            }
            ConnectionEvent::DataRequired {
                command,
                params,
                seq,
            } => self.register_data_request(peer, command, params, seq),
            ConnectionEvent::CommandReceived { command, params } => {
                debug!("{} from {}: {}", command, peer, params);
                self.emit(ServerEvent::CommandReceived {
                    peer,
                    command,
                    params,
                });
            }
            ConnectionEvent::Closed => self.remove(peer, RemovalReason::Closed).await,
            ConnectionEvent::TimedOut => self.remove(peer, RemovalReason::TimedOut).await,
        }
    }

    fn register_data_request(
        &mut self,
        peer: PeerId,
        command: Arc<CommandDescriptor>,
        params: CommandParams,
        seq: u8,
    ) {
        let id = self.next_request_id;
        self.next_request_id += 1;

        let timer = self.timers.insert(
            PoolTimer::DataRequired(id),
            self.config.data_required_timeout,
        );
        self.pending.insert(
            id,
            PendingData {
                peer,
                seq,
                command: Arc::clone(&command),
                timer,
            },
        );

        debug!("Data request {} for {} from {}", id, command, peer);
        self.emit(ServerEvent::DataRequired(DataRequest {
            peer,
            command,
            params,
            responder: Responder::new(id, self.responder_tx.clone()),
        }));
    }

    /// Answer a pending data request. Unknown or expired requests are ignored.
    ///
    /// An answer that cannot be encoded is reported and dropped; the request
    /// stays pending and is answered by its deadline instead.
    pub async fn respond(&mut self, id: RequestId, data: Vec<u8>) {
        let Some((peer, seq)) = self.pending.get(&id).map(|p| (p.peer, p.seq)) else {
            debug!("Ignoring late response to data request {}", id);
            return;
        };

        let bytes = match ServerResponsePacket::ok(seq, data).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Rejected answer to data request {} from {}: {}", id, peer, e);
                self.emit(ServerEvent::Error {
                    peer: Some(peer),
                    error: e.into(),
                });
                return;
            }
        };

        if let Some(pending) = self.pending.remove(&id) {
            self.timers.remove(&pending.timer);
        }
        self.send_raw(peer, &bytes).await;
    }

    /// Wait for the next deadline to elapse.
    ///
    /// Never completes while no deadline is armed, so it can sit in a
    /// `select!` next to the other event sources.
    pub async fn next_expired(&mut self) -> PoolTimer {
        poll_fn(|cx| match self.timers.poll_expired(cx) {
            Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
            _ => Poll::Pending,
        })
        .await
    }

    /// Act on an elapsed deadline returned by [`ConnectionPool::next_expired`].
    pub async fn handle_timer(&mut self, timer: PoolTimer) {
        match timer {
            PoolTimer::Heartbeat(peer) => {
                if let Some(conn) = self.connections.get_mut(&peer) {
                    warn!("Connection {} missed its heartbeat deadline", peer);
                    let event = conn.timed_out();
                    self.dispatch(peer, event).await;
                }
            }
            PoolTimer::DataRequired(id) => {
                if let Some(pending) = self.pending.remove(&id) {
                    warn!(
                        "Data request {} for {} from {} timed out",
                        id, pending.command, pending.peer
                    );
                    let response =
                        ServerResponsePacket::status(pending.seq, StatusCode::RequestTimedOut);
                    self.send_response(pending.peer, &response).await;
                }
            }
        }
    }

    /// Send an unsolicited packet to the active peer, or to every peer.
    pub async fn send_async_message(
        &mut self,
        id_code: u8,
        data: Vec<u8>,
        broadcast: bool,
    ) -> Result<()> {
        let encoded = ServerAsyncPacket::new(id_code, data).encode()?;

        let targets: Vec<PeerId> = if broadcast {
            self.order.clone()
        } else {
            self.active_peer().into_iter().collect()
        };

        for peer in targets {
            self.send_raw(peer, &encoded).await;
        }
        Ok(())
    }

    async fn send_response(&mut self, peer: PeerId, response: &ServerResponsePacket) -> bool {
        match response.encode() {
            Ok(bytes) => self.send_raw(peer, &bytes).await,
            Err(e) => {
                error!("Failed to encode response for {}: {}", peer, e);
                self.emit(ServerEvent::Error {
                    peer: Some(peer),
                    error: e.into(),
                });
                false
            }
        }
    }

    /// Send bytes to a peer, tearing it down if the transport fails.
    async fn send_raw(&mut self, peer: PeerId, bytes: &[u8]) -> bool {
        match self.transport.send_to(bytes, peer).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Send to {} failed: {}", peer, e);
                let reason = RemovalReason::TransportError(e.to_string());
                self.emit(ServerEvent::Error {
                    peer: Some(peer),
                    error: e,
                });
                self.remove(peer, reason).await;
                false
            }
        }
    }

    /// Remove a peer, cancel its deadlines and promote the next in line.
    pub async fn remove(&mut self, peer: PeerId, reason: RemovalReason) {
        let Some(conn) = self.connections.remove(&peer) else {
            return;
        };

        if let Some(key) = conn.heartbeat_key() {
            self.timers.remove(key);
        }

        let was_active = self.active_peer() == Some(peer);
        self.order.retain(|p| *p != peer);

        let cancelled: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in cancelled {
            if let Some(pending) = self.pending.remove(&id) {
                self.timers.remove(&pending.timer);
            }
        }

        if let Err(e) = self.transport.disconnect(peer).await {
            debug!("Transport disconnect for {} failed: {}", peer, e);
        }

        info!("Connection {} removed: {}", peer, reason);
        self.emit(ServerEvent::ConnectionClosed { peer, reason });

        if was_active {
            self.promote_head();
        }
    }

    fn promote_head(&mut self) {
        let Some(next) = self.active_peer() else {
            return;
        };
        let Some(conn) = self.connections.get_mut(&next) else {
            return;
        };

        info!("Promoting {} to active", next);
        if let Some(ConnectionEvent::StateChanged { from, to }) = conn.set_active(true) {
            self.emit(ServerEvent::StateChanged {
                peer: next,
                from,
                to,
            });
        }
    }

    /// Remove every peer, back of the queue first so nobody is promoted.
    pub async fn close_all(&mut self) {
        let peers = self.order.clone();
        for peer in peers.into_iter().rev() {
            self.remove(peer, RemovalReason::Shutdown).await;
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("transport", &self.transport.transport_type())
            .field("order", &self.order)
            .field("pending", &self.pending.len())
            .finish()
    }
}
