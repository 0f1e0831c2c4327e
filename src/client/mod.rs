//! Client side of Ansible.
//!
//! [`AnsibleClient`] performs the `CONN` / `CONTROL_REQ` handshake, keeps the
//! connection alive with periodic heartbeats and matches responses to
//! requests by sequence number. State changes, disconnects and async server
//! messages are published as [`ClientEvent`]s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::commands::{CommandDescriptor, CommandTable, ParamValue, SysCommand};
use crate::config::{ClientConfig, Config};
use crate::error::{Error, Result};
use crate::protocol::{ClientPacket, ServerPacket, ServerResponsePacket, StatusCode};
use crate::transport::{self, EventReceiver, Transport, TransportEvent};
use crate::types::{ActiveState, ClientState, DisconnectReason, PeerId};

/// Client timing settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    /// Consecutive heartbeat failures that force a disconnect.
    pub missed_heartbeats: u32,
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            request_timeout: config.request_timeout,
            missed_heartbeats: config.missed_heartbeats,
        }
    }
}

impl ClientOptions {
    /// Reject settings the heartbeat and request timers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "client heartbeat interval must be positive".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "client request timeout must be positive".into(),
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(Error::InvalidConfig(
                "client missed heartbeat limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// Notification from the client to the application.
#[derive(Debug)]
pub enum ClientEvent {
    StateChanged {
        old: ClientState,
        new: ClientState,
    },
    Disconnected {
        code: u8,
        reason: DisconnectReason,
    },
    /// An async packet whose ID code is named in the command table.
    AsyncEvent {
        id_code: u8,
        name: String,
        data: Vec<u8>,
    },
    Error(Error),
}

type Reply = oneshot::Sender<Result<Option<ParamValue>>>;

struct PendingRequest {
    command: Arc<CommandDescriptor>,
    reply: Reply,
}

struct Inner {
    state: ClientState,
    next_seq: u8,
    pending: HashMap<u8, PendingRequest>,
    transport: Option<Arc<dyn Transport>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Inner {
    /// Take the next sequence number, cycling through 1..=255.
    fn advance_seq(&mut self) -> u8 {
        let seq = self.next_seq;
        self.next_seq = if seq == u8::MAX { 1 } else { seq + 1 };
        seq
    }
}

struct Shared {
    inner: Mutex<Inner>,
    server: PeerId,
    commands: Arc<CommandTable>,
    options: ClientOptions,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            trace!("Client event receiver dropped");
        }
    }
}

/// Connection to one Ansible server.
#[derive(Clone)]
pub struct AnsibleClient {
    shared: Arc<Shared>,
}

impl AnsibleClient {
    /// Connect to the configured server.
    pub async fn connect(config: &Config) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let commands = Arc::new(config.command_table()?);
        let server_addr = config.client.server_addr;
        let (transport, inbound) =
            transport::connect(config.client.protocol, server_addr, &config.transport).await?;

        Self::connect_with(
            transport,
            inbound,
            PeerId::new(server_addr),
            commands,
            ClientOptions::from(&config.client),
        )
        .await
    }

    /// Run the handshake over an existing transport whose only peer is `server`.
    pub async fn connect_with(
        transport: Arc<dyn Transport>,
        inbound: EventReceiver,
        server: PeerId,
        commands: Arc<CommandTable>,
        options: ClientOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        if let Err(e) = options.validate() {
            let _ = transport.close().await;
            return Err(e);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ClientState::NotConnected,
                next_seq: 1,
                pending: HashMap::new(),
                transport: Some(transport),
                heartbeat: None,
            }),
            server,
            commands,
            options,
            events: event_tx,
        });

        tokio::spawn(read_loop(Arc::downgrade(&shared), inbound));
        let client = Self { shared };

        if let Err(e) = client.handshake().await {
            warn!("Handshake with {} failed: {}", server, e);
            client.abandon().await;
            return Err(e);
        }

        let heartbeat = tokio::spawn(heartbeat_loop(Arc::downgrade(&client.shared)));
        client.shared.inner.lock().heartbeat = Some(heartbeat);

        info!("Connected to {} as {}", server, client.state());
        Ok((client, event_rx))
    }

    async fn handshake(&self) -> Result<()> {
        self.sys_request(SysCommand::Conn).await?;
        let code = self.sys_request(SysCommand::ControlReq).await?;
        self.apply_active_code(code.as_ref());
        Ok(())
    }

    /// Drop the transport after a failed handshake, without events.
    async fn abandon(&self) {
        let transport = {
            let mut inner = self.shared.inner.lock();
            for (_, pending) in inner.pending.drain() {
                let _ = pending.reply.send(Err(Error::ConnectionClosed));
            }
            inner.transport.take()
        };
        if let Some(transport) = transport {
            let _ = transport.close().await;
        }
    }

    pub fn state(&self) -> ClientState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().transport.is_some()
    }

    /// Address of the server.
    pub fn server_addr(&self) -> SocketAddr {
        self.shared.server.addr()
    }

    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.shared.commands
    }

    /// Call a command by client function name, e.g. `request("set_motor", &[-200])`.
    pub async fn request(&self, function: &str, args: &[i64]) -> Result<Option<ParamValue>> {
        let command = self
            .shared
            .commands
            .descriptor_for_function(function)
            .cloned()
            .ok_or_else(|| Error::UnknownCommand(function.to_string()))?;
        self.send_request(&command, args).await
    }

    /// Call a command by `"DEVICE:COMMAND"` name.
    pub async fn request_command(&self, name: &str, args: &[i64]) -> Result<Option<ParamValue>> {
        let command = self
            .shared
            .commands
            .descriptor(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))?;
        self.send_request(&command, args).await
    }

    /// Ask the server for its protocol version as `(major, minor)`.
    pub async fn get_version(&self) -> Result<(u8, u8)> {
        match self.sys_request(SysCommand::Vers).await? {
            Some(ParamValue::U16(v)) => Ok(((v >> 8) as u8, (v & 0xFF) as u8)),
            other => Err(Error::Internal(format!("unexpected version value: {other:?}"))),
        }
    }

    async fn sys_request(&self, cmd: SysCommand) -> Result<Option<ParamValue>> {
        let command = self
            .shared
            .commands
            .sys(cmd)
            .cloned()
            .ok_or_else(|| Error::UnknownCommand(cmd.to_string()))?;
        self.send_request(&command, &[]).await
    }

    async fn send_request(
        &self,
        command: &Arc<CommandDescriptor>,
        args: &[i64],
    ) -> Result<Option<ParamValue>> {
        let data = command.encode_args(args)?;

        let (seq, transport, bytes, reply) = {
            let mut inner = self.shared.inner.lock();
            let transport = inner.transport.clone().ok_or(Error::NotConnected)?;

            if !command.is_system() && inner.state != ClientState::Active {
                return Err(Error::InvalidClientState(inner.state.to_string()));
            }

            let seq = inner.advance_seq();
            if inner.pending.contains_key(&seq) {
                return Err(Error::SequenceInUse(seq));
            }

            let bytes = ClientPacket::new(command.did, command.cid, seq, data)
                .with_flags(true, true)
                .encode()?;

            let (tx, rx) = oneshot::channel();
            inner.pending.insert(
                seq,
                PendingRequest {
                    command: Arc::clone(command),
                    reply: tx,
                },
            );
            (seq, transport, bytes, rx)
        };

        trace!("Sending {} (seq {})", command, seq);
        if let Err(e) = transport.send_to(&bytes, self.shared.server).await {
            self.shared.inner.lock().pending.remove(&seq);
            return Err(e);
        }

        match timeout(self.shared.options.request_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.shared.inner.lock().pending.remove(&seq);
                Err(Error::RequestTimedOut { seq })
            }
        }
    }

    fn apply_active_code(&self, value: Option<&ParamValue>) {
        let Some(state) = value
            .and_then(ParamValue::as_i64)
            .and_then(|code| u8::try_from(code).ok())
            .and_then(ActiveState::from_code)
            .map(ClientState::from)
        else {
            warn!("Ignoring invalid active state value {:?}", value);
            return;
        };

        let old = {
            let mut inner = self.shared.inner.lock();
            if inner.transport.is_none() {
                return;
            }
            std::mem::replace(&mut inner.state, state)
        };

        if old != state {
            info!("Client state {} -> {}", old, state);
            self.shared
                .emit(ClientEvent::StateChanged { old, new: state });
        }
    }

    /// Send `SYS:CLOSE` and tear the connection down.
    pub async fn close(&self) -> Result<()> {
        let (transport, bytes) = {
            let mut inner = self.shared.inner.lock();
            let transport = inner.transport.clone().ok_or(Error::NotConnected)?;
            let seq = inner.advance_seq();
            let close = SysCommand::Close;
            let bytes = ClientPacket::new(crate::commands::SYS_DID, close.cid(), seq, Vec::new())
                .with_flags(true, true)
                .encode()?;
            (transport, bytes)
        };

        let sent = transport.send_to(&bytes, self.shared.server).await;
        disconnect(&self.shared, DisconnectReason::SocketClosed, true).await;
        sent.map(|_| ())
    }
}

impl std::fmt::Debug for AnsibleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnsibleClient")
            .field("server", &self.shared.server)
            .field("state", &self.state())
            .finish()
    }
}

/// Tear the connection down once; later calls are no-ops.
async fn disconnect(shared: &Shared, reason: DisconnectReason, stop_heartbeat: bool) {
    let (transport, heartbeat, old) = {
        let mut inner = shared.inner.lock();
        let Some(transport) = inner.transport.take() else {
            return;
        };
        for (_, pending) in inner.pending.drain() {
            let _ = pending.reply.send(Err(Error::ConnectionClosed));
        }
        let old = std::mem::replace(&mut inner.state, ClientState::NotConnected);
        (transport, inner.heartbeat.take(), old)
    };

    if stop_heartbeat {
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
    }

    info!("Disconnected from {}: {}", shared.server, reason);
    shared.emit(ClientEvent::Disconnected {
        code: reason.code(),
        reason,
    });
    if old != ClientState::NotConnected {
        shared.emit(ClientEvent::StateChanged {
            old,
            new: ClientState::NotConnected,
        });
    }

    if let Err(e) = transport.close().await {
        debug!("Transport close failed: {}", e);
    }
}

async fn read_loop(shared: Weak<Shared>, mut inbound: EventReceiver) {
    // A stream that ends right after a read error was not closed cleanly
    let mut failed = false;

    while let Some(event) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Message { data, .. } => handle_packet(&shared, &data),
            TransportEvent::Closed { .. } => {
                let reason = if failed {
                    DisconnectReason::SocketError
                } else {
                    DisconnectReason::SocketClosed
                };
                disconnect(&shared, reason, true).await;
            }
            TransportEvent::Error { error, .. } => {
                warn!("Transport error: {}", error);
                failed = true;
                shared.emit(ClientEvent::Error(error));
            }
        }
    }
    trace!("Client read loop finished");
}

fn handle_packet(shared: &Shared, data: &[u8]) {
    let packet = match ServerPacket::decode(data) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Dropping packet from {}: {}", shared.server, e);
            return;
        }
    };

    match packet {
        ServerPacket::Response(response) => complete_request(shared, response),
        ServerPacket::Async(packet) => match shared.commands.async_event_name(packet.id_code) {
            Some(name) => shared.emit(ClientEvent::AsyncEvent {
                id_code: packet.id_code,
                name: name.to_string(),
                data: packet.data,
            }),
            None => warn!("Unknown async event ID code {:#04x}", packet.id_code),
        },
    }
}

fn complete_request(shared: &Shared, response: ServerResponsePacket) {
    let Some(pending) = shared.inner.lock().pending.remove(&response.seq) else {
        warn!("No pending request with sequence number {}", response.seq);
        return;
    };

    let result = if response.mrsp != StatusCode::Ok.code() {
        debug!(
            "{} (seq {}) failed with status {}",
            pending.command, response.seq, response.mrsp
        );
        Err(Error::RequestFailed {
            status: response.mrsp,
        })
    } else {
        pending
            .command
            .decode_return(&response.data)
            .map_err(Error::from)
    };

    // The requester may have timed out already
    let _ = pending.reply.send(result);
}

/// Outcome of one heartbeat, reported back to the heartbeat loop.
type HeartbeatResult = Result<Option<ParamValue>>;

async fn heartbeat_loop(shared: Weak<Shared>) {
    let Some(period) = shared.upgrade().map(|s| s.options.heartbeat_interval) else {
        return;
    };

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<HeartbeatResult>();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let client = AnsibleClient { shared };
                if !client.is_connected() {
                    return;
                }

                // Heartbeats overlap; each reports back when it completes
                let result_tx = result_tx.clone();
                tokio::spawn(async move {
                    let result = client.sys_request(SysCommand::Hbeat).await;
                    let _ = result_tx.send(result);
                });
            }
            Some(result) = result_rx.recv() => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let client = AnsibleClient { shared };

                match result {
                    Ok(value) => {
                        missed = 0;
                        client.apply_active_code(value.as_ref());
                    }
                    Err(Error::NotConnected | Error::ConnectionClosed) => return,
                    Err(e) => {
                        missed += 1;
                        debug!("Missed heartbeat {}/{}: {}", missed, client.shared.options.missed_heartbeats, e);

                        if missed >= client.shared.options.missed_heartbeats {
                            warn!("Too many missed heartbeats");
                            disconnect(&client.shared, DisconnectReason::MissedHeartbeat, false).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}
