//! # Ansible
//!
//! Single-active, multi-peer binary request/response gateway protocol.
//!
//! Many clients may connect to one gateway, but only the first connection in
//! arrival order is *active* and allowed to drive device commands. Everyone
//! else waits in the *queued* state and is promoted when the active peer
//! leaves. Commands flagged as data-required are handed to the application,
//! which has a bounded window to supply the response payload.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Application (DataRequired / async events)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   AnsibleServer loop          │          AnsibleClient          │
//! │  ┌──────────────────────────┐ │  ┌───────────────────────────┐  │
//! │  │ ConnectionPool           │ │  │ request / heartbeat loop  │  │
//! │  │  head = active, rest =   │ │  │ pending by SEQ            │  │
//! │  │  queued, timers          │ │  └───────────────────────────┘  │
//! │  └──────────────────────────┘ │                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Command table (DID/CID, params, return types)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Packet codec (client / response / async frames)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │               Transport (UDP datagrams / TCP streams)           │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Byte constants are clear
#![allow(clippy::cast_possible_truncation)]  // Wire fields are narrowed deliberately
#![allow(clippy::cast_sign_loss)]            // Signed params are re-encoded as raw bytes
#![allow(clippy::cast_possible_wrap)]        // Same, in the other direction
#![allow(clippy::similar_names)]             // did/cid are intentionally named
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::cognitive_complexity)]      // Complex state machines
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::struct_excessive_bools)]    // Boolean config fields are appropriate
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port for the Ansible gateway
pub const DEFAULT_PORT: u16 = 41234;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{AnsibleClient, ClientEvent, ClientOptions};
    pub use crate::commands::{CommandDescriptor, CommandParams, CommandTable, ParamValue};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::protocol::StatusCode;
    pub use crate::server::{AnsibleServer, DataRequest, ServerEvent, ServerHandle};
    pub use crate::transport::{Transport, TransportConfig, TransportProtocol};
    pub use crate::types::*;
}
