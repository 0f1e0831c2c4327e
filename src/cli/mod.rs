//! Command line interface for Ansible.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::transport::TransportProtocol;

/// Ansible - single-active binary request/response gateway
#[derive(Parser, Debug)]
#[command(
    name = "ansible",
    author,
    version,
    about = "Single-active, multi-peer binary request/response gateway",
    long_about = r#"
Ansible connects many clients to one device gateway while letting exactly
one of them drive the devices at a time:

  - Compact checksummed packets over UDP or TCP
  - First connected client is active, the rest queue up in order
  - Automatic promotion when the active client leaves or times out
  - Data-required commands answered by the application within 1500ms
  - Async event push to the active client or to everyone

QUICK START:
  Server:  ansible server --listen 0.0.0.0:41234
  Client:  ansible client --server 127.0.0.1:41234 --call set_motor:-200
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway server
    Server(ServerArgs),

    /// Connect to a gateway and issue requests
    Client(ClientArgs),

    /// List the configured command table
    Commands,

    /// Show example configuration
    Config(ConfigArgs),
}

/// Server command arguments
#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Listen address (overrides the config file)
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Transport protocol (udp, tcp)
    #[arg(short, long)]
    pub protocol: Option<TransportProtocol>,

    /// Drop peers that stay silent this long, e.g. "5s" (0s disables)
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    pub heartbeat_timeout: Option<Duration>,

    /// Byte returned for every data-required command
    #[arg(long, default_value = "0")]
    pub fill: u8,
}

/// Client command arguments
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address (overrides the config file)
    #[arg(short, long)]
    pub server: Option<SocketAddr>,

    /// Transport protocol (udp, tcp)
    #[arg(short, long)]
    pub protocol: Option<TransportProtocol>,

    /// Request to send, as `function:arg,arg` (can be specified multiple times)
    #[arg(long = "call")]
    pub calls: Vec<CallSpec>,

    /// Stay connected and print async events after the calls finish
    #[arg(short, long)]
    pub watch: bool,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print example server config
    #[arg(long)]
    pub server: bool,

    /// Print example client config
    #[arg(long)]
    pub client: bool,

    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// One client request given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    pub function: String,
    pub args: Vec<i64>,
}

impl FromStr for CallSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (function, rest) = match s.split_once(':') {
            Some((function, rest)) => (function.trim(), rest.trim()),
            None => (s.trim(), ""),
        };

        if function.is_empty() {
            return Err(format!("missing function name in '{s}'"));
        }

        let args = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',')
                .map(|arg| {
                    arg.trim()
                        .parse::<i64>()
                        .map_err(|e| format!("invalid argument '{arg}': {e}"))
                })
                .collect::<Result<_, _>>()?
        };

        Ok(Self {
            function: function.to_string(),
            args,
        })
    }
}

impl std::fmt::Display for CallSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        write!(f, "{}({})", self.function, args.join(", "))
    }
}
