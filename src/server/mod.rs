//! Server side of Ansible.
//!
//! [`AnsibleServer`] wires a transport to a [`ConnectionPool`] and runs a
//! single task that serialises transport events, application commands and
//! timer expirations. Applications observe it through the [`ServerEvent`]
//! receiver and drive it through a clonable [`ServerHandle`].

mod connection;
mod events;
mod pool;

pub use connection::{Connection, ConnectionEvent, Reaction};
pub use events::{DataRequest, RequestId, Responder, ServerCommand, ServerEvent};
pub use pool::{ConnectionPool, PoolConfig, PoolTimer};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::commands::CommandTable;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{self, EventReceiver, Transport};

/// Ansible gateway server.
pub struct AnsibleServer {
    pool: ConnectionPool,
    transport: Arc<dyn Transport>,
    inbound: EventReceiver,
    command_rx: mpsc::UnboundedReceiver<ServerCommand>,
    handle: ServerHandle,
}

impl AnsibleServer {
    /// Bind the configured transport and build the command table.
    pub async fn bind(config: &Config) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>)> {
        let commands = Arc::new(config.command_table()?);
        let (transport, inbound) = transport::bind(
            config.server.protocol,
            config.server.listen_addr,
            &config.transport,
        )
        .await?;

        info!(
            "Ansible server listening on {} ({})",
            transport.local_addr()?,
            transport.transport_type()
        );
        Ok(Self::with_transport(
            transport,
            inbound,
            commands,
            PoolConfig::from_config(config),
        ))
    }

    /// Build a server on an existing transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        inbound: EventReceiver,
        commands: Arc<CommandTable>,
        config: PoolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let pool = ConnectionPool::new(
            Arc::clone(&transport),
            Arc::clone(&commands),
            config,
            event_tx,
            command_tx.clone(),
        );

        let server = Self {
            pool,
            transport,
            inbound,
            command_rx,
            handle: ServerHandle {
                tx: command_tx,
                commands,
            },
        };
        (server, event_rx)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Handle for sending async messages and stopping the server.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run until shut down through a [`ServerHandle`] or the transport stops.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                event = self.inbound.recv() => match event {
                    Some(event) => self.pool.handle_transport_event(event).await,
                    None => {
                        warn!("Transport stopped delivering events");
                        break;
                    }
                },
                command = self.command_rx.recv() => match command {
                    Some(ServerCommand::Respond { id, data }) => {
                        self.pool.respond(id, data).await;
                    }
                    Some(ServerCommand::SendAsync { id_code, data, broadcast }) => {
                        if let Err(e) = self.pool.send_async_message(id_code, data, broadcast).await {
                            warn!("Async message {:#04x} not sent: {}", id_code, e);
                        }
                    }
                    Some(ServerCommand::Shutdown) | None => {
                        debug!("Shutdown requested");
                        break;
                    }
                },
                timer = self.pool.next_expired() => {
                    self.pool.handle_timer(timer).await;
                }
            }
        }

        info!("Ansible server shutting down");
        self.pool.close_all().await;
        self.transport.close().await
    }
}

/// Clonable handle to a running [`AnsibleServer`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerCommand>,
    commands: Arc<CommandTable>,
}

impl ServerHandle {
    fn send(&self, command: ServerCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::Internal("server is not running".into()))
    }

    /// Send an unsolicited message to the active peer, or to every peer when
    /// `broadcast` is set.
    pub fn send_async_message(&self, id_code: u8, data: Vec<u8>, broadcast: bool) -> Result<()> {
        self.send(ServerCommand::SendAsync {
            id_code,
            data,
            broadcast,
        })
    }

    /// Like [`ServerHandle::send_async_message`], naming the event as
    /// configured in the command table.
    pub fn send_async_event(&self, name: &str, data: Vec<u8>, broadcast: bool) -> Result<()> {
        let id_code = self
            .commands
            .async_event_code(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))?;
        self.send_async_message(id_code, data, broadcast)
    }

    /// Stop the server loop.
    pub fn shutdown(&self) -> Result<()> {
        self.send(ServerCommand::Shutdown)
    }

    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.commands
    }
}
