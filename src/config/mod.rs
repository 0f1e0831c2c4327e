//! Configuration management for Ansible.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commands::{AsyncEventSpec, CommandSpec, CommandTable, DeviceSpec, ParamSpec, ParamType};
use crate::error::{Error, Result};
use crate::transport::{TransportConfig, TransportProtocol};

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Protocol API version.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Device command definitions.
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceSpec>,

    /// Async event names.
    #[serde(default = "default_async_events")]
    pub async_events: Vec<AsyncEventSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
            protocol: ProtocolConfig::default(),
            devices: default_devices(),
            async_events: default_async_events(),
        }
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        crate::client::ClientOptions::from(&self.client).validate()?;

        if self.server.data_required_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "server data required timeout must be positive".into(),
            ));
        }

        if self.transport.max_datagram_size < crate::protocol::CLIENT_MIN_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max datagram size {} is smaller than any packet",
                self.transport.max_datagram_size
            )));
        }

        if self.transport.send_queue_size == 0 || self.transport.send_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "transport send queue and send timeout must be positive".into(),
            ));
        }

        // Catches DID/CID and name collisions
        self.command_table()?;
        Ok(())
    }

    /// Build the command table from the configured devices and events.
    pub fn command_table(&self) -> Result<CommandTable> {
        CommandTable::from_specs(&self.devices, &self.async_events)
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "ansible", "ansible").map_or_else(
            || PathBuf::from("ansible.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            server: ServerConfig {
                protocol: TransportProtocol::Tcp,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Transport protocol.
    #[serde(default)]
    pub protocol: TransportProtocol,

    /// Drop peers idle for this long (`0s` disables).
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Time the application has to answer a data request.
    #[serde(default = "default_data_required_timeout", with = "humantime_serde")]
    pub data_required_timeout: Duration,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT))
}
fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_data_required_timeout() -> Duration {
    Duration::from_millis(1500)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            protocol: TransportProtocol::default(),
            heartbeat_timeout: default_heartbeat_timeout(),
            data_required_timeout: default_data_required_timeout(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address.
    #[serde(default = "default_server_addr")]
    pub server_addr: SocketAddr,

    /// Transport protocol.
    #[serde(default)]
    pub protocol: TransportProtocol,

    /// Interval between heartbeats.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Time to wait for a response.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Consecutive missed heartbeats before disconnecting.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
}

fn default_server_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT))
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(200)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_missed_heartbeats() -> u32 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            protocol: TransportProtocol::default(),
            heartbeat_interval: default_heartbeat_interval(),
            request_timeout: default_request_timeout(),
            missed_heartbeats: default_missed_heartbeats(),
        }
    }
}

/// Protocol API version reported by `SYS:VERS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_major")]
    pub major: u8,
    #[serde(default)]
    pub minor: u8,
}

fn default_major() -> u8 {
    1
}

impl ProtocolConfig {
    /// `(major << 8) | minor`.
    pub fn version(&self) -> u16 {
        (u16::from(self.major) << 8) | u16::from(self.minor)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            major: default_major(),
            minor: 0,
        }
    }
}

/// The robot controller device the gateway ships with.
pub fn default_devices() -> Vec<DeviceSpec> {
    let port = |ty: ParamType, length: usize| vec![ParamSpec::new("port", 0, length, ty)];

    vec![DeviceSpec {
        name: "ROBOT".into(),
        did: 0x01,
        commands: vec![
            CommandSpec {
                name: "GET_DIGITAL".into(),
                cid: 0x01,
                data_required: true,
                function: Some("get_digital".into()),
                returns: Some(ParamType::U8),
                params: port(ParamType::U8, 1),
            },
            CommandSpec {
                name: "GET_ANALOG".into(),
                cid: 0x02,
                data_required: true,
                function: Some("get_analog".into()),
                returns: Some(ParamType::U16),
                params: port(ParamType::U8, 1),
            },
            CommandSpec {
                name: "SET_MOTOR".into(),
                cid: 0x03,
                data_required: false,
                function: Some("set_motor".into()),
                returns: None,
                params: port(ParamType::I16, 2),
            },
        ],
    }]
}

/// Async events of the robot controller.
pub fn default_async_events() -> Vec<AsyncEventSpec> {
    vec![
        AsyncEventSpec {
            id_code: 0x01,
            name: "DIGITAL_CHANGED".into(),
        },
        AsyncEventSpec {
            id_code: 0x02,
            name: "ANALOG_CHANGED".into(),
        },
    ]
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
