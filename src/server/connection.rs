//! Per-peer connection state machine.
//!
//! A [`Connection`] turns one decoded request into a [`Reaction`]: an optional
//! response, the events to publish and whether the request was handled. It
//! performs no I/O and owns no timers; the pool acts on the reaction.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::time::delay_queue;
use tracing::debug;

use crate::commands::{CommandDescriptor, CommandParams, SysCommand};
use crate::protocol::{ClientPacket, ServerResponsePacket, StatusCode};
use crate::types::{ActiveState, ConnectionState, PeerId};

/// Something the pool should publish on behalf of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The application must supply the response for `seq`.
    DataRequired {
        command: Arc<CommandDescriptor>,
        params: CommandParams,
        seq: u8,
    },
    /// A command was acknowledged and should be acted on.
    CommandReceived {
        command: Arc<CommandDescriptor>,
        params: CommandParams,
    },
    /// The peer asked to close.
    Closed,
    /// The heartbeat deadline elapsed.
    TimedOut,
}

/// Outcome of processing one request.
#[derive(Debug, Default)]
pub struct Reaction {
    pub response: Option<ServerResponsePacket>,
    pub events: Vec<ConnectionEvent>,
    /// The request was accepted in the current state.
    pub handled: bool,
    /// The heartbeat deadline should be re-armed.
    pub rearm_heartbeat: bool,
}

impl Reaction {
    fn handled(response: Option<ServerResponsePacket>) -> Self {
        Self {
            response,
            handled: true,
            ..Default::default()
        }
    }

    fn rejected(seq: u8, status: StatusCode) -> Self {
        Self {
            response: Some(ServerResponsePacket::status(seq, status)),
            ..Default::default()
        }
    }

    fn with_event(mut self, event: ConnectionEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Server-side view of one remote peer.
#[derive(Debug)]
pub struct Connection {
    peer: PeerId,
    state: ConnectionState,
    active: bool,
    version: u16,
    heartbeat_key: Option<delay_queue::Key>,
    created_at: Instant,
    last_activity: Instant,
}

impl Connection {
    /// Create a connection in `PreConnect`.
    ///
    /// `version` is the `(major << 8) | minor` value answered to `SYS:VERS`.
    pub fn new(peer: PeerId, active: bool, version: u16) -> Self {
        let now = Instant::now();
        Self {
            peer,
            state: ConnectionState::PreConnect,
            active,
            version,
            heartbeat_key: None,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time of the last handled request.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn heartbeat_key(&self) -> Option<&delay_queue::Key> {
        self.heartbeat_key.as_ref()
    }

    pub(crate) fn set_heartbeat_key(&mut self, key: Option<delay_queue::Key>) {
        self.heartbeat_key = key;
    }

    /// Grant or revoke control. Only the pool calls this.
    ///
    /// A peer already waiting in `Queued` moves straight to `Active`; before
    /// control is requested only the flag changes.
    pub(crate) fn set_active(&mut self, active: bool) -> Option<ConnectionEvent> {
        self.active = active;

        let to = match (self.state, active) {
            (ConnectionState::Queued, true) => ConnectionState::Active,
            (ConnectionState::Active, false) => ConnectionState::Queued,
            _ => return None,
        };
        Some(self.transition(to))
    }

    /// Report that the heartbeat deadline elapsed.
    pub(crate) fn timed_out(&mut self) -> ConnectionEvent {
        self.heartbeat_key = None;
        ConnectionEvent::TimedOut
    }

    fn transition(&mut self, to: ConnectionState) -> ConnectionEvent {
        let from = self.state;
        self.state = to;
        debug!("Connection {} {} -> {}", self.peer, from, to);
        ConnectionEvent::StateChanged { from, to }
    }

    fn active_code(&self) -> Vec<u8> {
        vec![ActiveState::from_active(self.active).code()]
    }

    /// Process a decoded request. `command` is the table entry for its
    /// `(DID, CID)`, if any.
    pub fn process_message(
        &mut self,
        packet: &ClientPacket,
        command: Option<&Arc<CommandDescriptor>>,
    ) -> Reaction {
        let sys = command.and_then(|c| c.sys_command());

        let mut reaction = if sys == Some(SysCommand::Close) {
            Reaction::handled(None).with_event(ConnectionEvent::Closed)
        } else {
            match self.state {
                ConnectionState::PreConnect => self.handle_pre_connect(packet, sys),
                ConnectionState::Connected => self.handle_connected(packet, sys),
                ConnectionState::Active => self.handle_active(packet, command, sys),
                ConnectionState::Queued => self.handle_queued(packet, sys),
            }
        };

        if reaction.handled {
            self.last_activity = Instant::now();
            reaction.rearm_heartbeat = packet.reset_timeout;
        }
        reaction
    }

    fn handle_pre_connect(&mut self, packet: &ClientPacket, sys: Option<SysCommand>) -> Reaction {
        match sys {
            Some(SysCommand::Conn) => {
                let event = self.transition(ConnectionState::Connected);
                Reaction::handled(Some(ServerResponsePacket::ok(packet.seq, Vec::new())))
                    .with_event(event)
            }
            _ => Reaction::rejected(packet.seq, StatusCode::InvalidState),
        }
    }

    fn handle_connected(&mut self, packet: &ClientPacket, sys: Option<SysCommand>) -> Reaction {
        match sys {
            Some(SysCommand::ControlReq) => {
                let to = if self.active {
                    ConnectionState::Active
                } else {
                    ConnectionState::Queued
                };
                let event = self.transition(to);
                Reaction::handled(Some(ServerResponsePacket::ok(
                    packet.seq,
                    self.active_code(),
                )))
                .with_event(event)
            }
            _ => Reaction::rejected(packet.seq, StatusCode::InvalidState),
        }
    }

    fn handle_active(
        &mut self,
        packet: &ClientPacket,
        command: Option<&Arc<CommandDescriptor>>,
        sys: Option<SysCommand>,
    ) -> Reaction {
        if let Some(sys) = sys {
            let data = match sys {
                SysCommand::Hbeat | SysCommand::ControlReq => self.active_code(),
                SysCommand::Vers => self.version.to_be_bytes().to_vec(),
                SysCommand::Conn | SysCommand::Close => {
                    return Reaction::rejected(packet.seq, StatusCode::InvalidState)
                }
            };
            return Reaction::handled(Some(ServerResponsePacket::ok(packet.seq, data)));
        }

        let Some(command) = command else {
            return Reaction::rejected(packet.seq, StatusCode::InvalidCommand);
        };

        let params = match command.decode_params(&packet.data) {
            Ok(params) => params,
            Err(e) => {
                debug!("Rejecting {} from {}: {}", command, self.peer, e);
                return Reaction::rejected(packet.seq, StatusCode::InvalidCommand);
            }
        };

        if command.data_required {
            Reaction::handled(None).with_event(ConnectionEvent::DataRequired {
                command: Arc::clone(command),
                params,
                seq: packet.seq,
            })
        } else {
            Reaction::handled(Some(ServerResponsePacket::ok(packet.seq, Vec::new()))).with_event(
                ConnectionEvent::CommandReceived {
                    command: Arc::clone(command),
                    params,
                },
            )
        }
    }

    /// A waiting peer may only prove it is alive.
    fn handle_queued(&mut self, packet: &ClientPacket, sys: Option<SysCommand>) -> Reaction {
        match sys {
            Some(SysCommand::Hbeat) => Reaction::handled(Some(ServerResponsePacket::ok(
                packet.seq,
                self.active_code(),
            ))),
            _ => Reaction::rejected(packet.seq, StatusCode::InvalidState),
        }
    }
}
