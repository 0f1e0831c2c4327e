//! Events published by the server and commands sent back to it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::commands::{CommandDescriptor, CommandParams};
use crate::error::Error;
use crate::types::{ConnectionState, PeerId, RemovalReason};

/// Identifier of one outstanding data request.
pub type RequestId = u64;

/// Notification from the server to the application.
#[derive(Debug)]
pub enum ServerEvent {
    /// The active peer sent a command whose response data the application
    /// must supply through the enclosed [`Responder`].
    DataRequired(DataRequest),
    /// The active peer sent a command that was acknowledged immediately.
    CommandReceived {
        peer: PeerId,
        command: Arc<CommandDescriptor>,
        params: CommandParams,
    },
    StateChanged {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
    ConnectionClosed {
        peer: PeerId,
        reason: RemovalReason,
    },
    Error {
        peer: Option<PeerId>,
        error: Error,
    },
}

/// A command waiting for application data.
#[derive(Debug)]
pub struct DataRequest {
    pub peer: PeerId,
    pub command: Arc<CommandDescriptor>,
    pub params: CommandParams,
    pub responder: Responder,
}

impl DataRequest {
    /// Answer the request with `data`.
    pub fn respond(self, data: Vec<u8>) {
        self.responder.respond(data);
    }
}

/// One-shot handle for answering a [`DataRequest`].
///
/// Consumed by [`Responder::respond`]. Answers arriving after the deadline
/// are ignored. Dropping the responder, or answering with more data than a
/// response can carry, leaves the request to time out.
pub struct Responder {
    id: RequestId,
    tx: mpsc::UnboundedSender<ServerCommand>,
}

impl Responder {
    pub(crate) fn new(id: RequestId, tx: mpsc::UnboundedSender<ServerCommand>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Send the response data to the peer.
    pub fn respond(self, data: Vec<u8>) {
        if self
            .tx
            .send(ServerCommand::Respond { id: self.id, data })
            .is_err()
        {
            debug!("Server stopped before request {} was answered", self.id);
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

/// Instruction for the server loop.
#[derive(Debug)]
pub enum ServerCommand {
    Respond {
        id: RequestId,
        data: Vec<u8>,
    },
    SendAsync {
        id_code: u8,
        data: Vec<u8>,
        broadcast: bool,
    },
    Shutdown,
}
