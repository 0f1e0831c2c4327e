//! Command table.
//!
//! Maps `(DID, CID)` pairs to command descriptors, and descriptors back to
//! their `"DEVICE:COMMAND"` and client function names. The `SYS` device is
//! built in; every other device is registered from configuration. The table
//! is read-only once the server or client has been constructed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ProtocolError, Result};

/// Device ID reserved for system commands.
pub const SYS_DID: u8 = 0x00;

/// Device name of the system commands.
pub const SYS_DEVICE: &str = "SYS";

/// Built-in system commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysCommand {
    /// Handshake.
    Conn,
    /// Ask for control of the shared resource.
    ControlReq,
    /// Keep-alive; answered with the current active/queued code.
    Hbeat,
    /// Ask for the protocol API version.
    Vers,
    /// Close the connection.
    Close,
}

impl SysCommand {
    pub const ALL: [SysCommand; 5] = [
        SysCommand::Conn,
        SysCommand::ControlReq,
        SysCommand::Hbeat,
        SysCommand::Vers,
        SysCommand::Close,
    ];

    pub fn cid(self) -> u8 {
        match self {
            Self::Conn => 0x01,
            Self::ControlReq => 0x02,
            Self::Hbeat => 0x03,
            Self::Vers => 0x04,
            Self::Close => 0x05,
        }
    }

    pub fn from_cid(cid: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.cid() == cid)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Conn => "CONN",
            Self::ControlReq => "CONTROL_REQ",
            Self::Hbeat => "HBEAT",
            Self::Vers => "VERS",
            Self::Close => "CLOSE",
        }
    }

    /// Client function name.
    pub fn function_name(self) -> &'static str {
        match self {
            Self::Conn => "send_conn",
            Self::ControlReq => "request_control",
            Self::Hbeat => "send_heartbeat",
            Self::Vers => "get_version",
            Self::Close => "send_close",
        }
    }

    fn return_type(self) -> Option<ParamType> {
        match self {
            Self::ControlReq | Self::Hbeat => Some(ParamType::U8),
            Self::Vers => Some(ParamType::U16),
            Self::Conn | Self::Close => None,
        }
    }

    fn descriptor(self) -> CommandDescriptor {
        CommandDescriptor {
            device: SYS_DEVICE.to_string(),
            name: self.name().to_string(),
            did: SYS_DID,
            cid: self.cid(),
            kind: CommandKind::Sys(self),
            params: Vec::new(),
            data_required: false,
            function_name: Some(self.function_name().to_string()),
            return_type: self.return_type(),
        }
    }
}

impl fmt::Display for SysCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SYS_DEVICE, self.name())
    }
}

/// Whether a command is handled by the protocol itself or by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Sys(SysCommand),
    Device,
}

/// Wire type of a command parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "int16")]
    I16,
    /// Uninterpreted bytes.
    #[default]
    #[serde(rename = "raw")]
    Raw,
}

impl ParamType {
    /// Encoded width, or `None` for raw slices.
    pub fn width(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::Raw => None,
        }
    }

    fn range(self) -> Option<(i64, i64)> {
        match self {
            Self::U8 => Some((u8::MIN as i64, u8::MAX as i64)),
            Self::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::U16 => Some((u16::MIN as i64, u16::MAX as i64)),
            Self::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::Raw => None,
        }
    }

    /// Read a value of this type from the start of `buf`.
    fn read(self, buf: &[u8]) -> ParamValue {
        match self {
            Self::U8 => ParamValue::U8(buf[0]),
            Self::I8 => ParamValue::I8(buf[0] as i8),
            Self::U16 => ParamValue::U16(BigEndian::read_u16(buf)),
            Self::I16 => ParamValue::I16(BigEndian::read_i16(buf)),
            Self::Raw => ParamValue::Raw(buf.to_vec()),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8 => write!(f, "uint8"),
            Self::I8 => write!(f, "int8"),
            Self::U16 => write!(f, "uint16"),
            Self::I16 => write!(f, "int16"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Layout of one parameter inside a command's DATA field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub offset: usize,
    pub length: usize,
    #[serde(rename = "type", default)]
    pub ty: ParamType,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, offset: usize, length: usize, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            offset,
            length,
            ty,
        }
    }

    fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// A decoded parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    Raw(Vec<u8>),
}

impl ParamValue {
    /// Integer value, if this is not a raw slice.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::U8(v) => Some(*v as i64),
            Self::I8(v) => Some(*v as i64),
            Self::U16(v) => Some(*v as i64),
            Self::I16(v) => Some(*v as i64),
            Self::Raw(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::Raw(bytes) => {
                write!(f, "[")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Decoded parameters of one command, in schema order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandParams(Vec<(String, ParamValue)>);

impl CommandParams {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CommandParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "}}")
    }
}

/// Immutable description of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub device: String,
    pub name: String,
    pub did: u8,
    pub cid: u8,
    pub kind: CommandKind,
    pub params: Vec<ParamSpec>,
    /// The application must supply the response data.
    pub data_required: bool,
    pub function_name: Option<String>,
    pub return_type: Option<ParamType>,
}

impl CommandDescriptor {
    /// `"DEVICE:COMMAND"`.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.device, self.name)
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, CommandKind::Sys(_))
    }

    pub fn sys_command(&self) -> Option<SysCommand> {
        match self.kind {
            CommandKind::Sys(cmd) => Some(cmd),
            CommandKind::Device => None,
        }
    }

    /// Bytes needed to hold every parameter.
    pub fn payload_len(&self) -> usize {
        self.params.iter().map(ParamSpec::end).max().unwrap_or(0)
    }

    /// Decode the parameters carried in a request's DATA field.
    pub fn decode_params(&self, data: &[u8]) -> std::result::Result<CommandParams, ProtocolError> {
        let needed = self.payload_len();
        if data.len() < needed {
            return Err(ProtocolError::MalformedPayload(format!(
                "{} needs {} data bytes, got {}",
                self.full_name(),
                needed,
                data.len()
            )));
        }

        let values = self
            .params
            .iter()
            .map(|p| (p.name.clone(), p.ty.read(&data[p.offset..p.end()])))
            .collect();
        Ok(CommandParams(values))
    }

    /// Encode integer arguments, one per parameter, into a DATA field.
    pub fn encode_args(&self, args: &[i64]) -> Result<Vec<u8>> {
        let invalid = |reason: String| Error::InvalidArguments {
            command: self.full_name(),
            reason,
        };

        if args.len() < self.params.len() {
            return Err(invalid(format!(
                "too few arguments: expected {}, got {}",
                self.params.len(),
                args.len()
            )));
        }
        if args.len() > self.params.len() {
            return Err(invalid(format!(
                "too many arguments: expected {}, got {}",
                self.params.len(),
                args.len()
            )));
        }

        let mut buf = vec![0u8; self.payload_len()];
        for (param, &value) in self.params.iter().zip(args) {
            let Some((min, max)) = param.ty.range() else {
                return Err(invalid(format!(
                    "parameter '{}' is raw and cannot be encoded from an integer",
                    param.name
                )));
            };
            if value < min || value > max {
                return Err(invalid(format!(
                    "value {} out of range for {} parameter '{}'",
                    value, param.ty, param.name
                )));
            }

            let slot = &mut buf[param.offset..param.end()];
            match param.ty {
                ParamType::U8 => slot[0] = value as u8,
                ParamType::I8 => slot[0] = value as i8 as u8,
                ParamType::U16 => BigEndian::write_u16(slot, value as u16),
                ParamType::I16 => BigEndian::write_i16(slot, value as i16),
                ParamType::Raw => {}
            }
        }
        Ok(buf)
    }

    /// Decode a response's DATA field according to the declared return type.
    pub fn decode_return(
        &self,
        data: &[u8],
    ) -> std::result::Result<Option<ParamValue>, ProtocolError> {
        let Some(ty) = self.return_type else {
            return Ok(None);
        };

        let width = ty.width().unwrap_or(data.len());
        if data.len() < width {
            return Err(ProtocolError::MalformedPayload(format!(
                "{} returns {}, got {} data bytes",
                self.full_name(),
                ty,
                data.len()
            )));
        }
        Ok(Some(ty.read(&data[..width])))
    }

    fn validate(&self) -> Result<()> {
        for param in &self.params {
            if let Some(width) = param.ty.width() {
                if param.length != width {
                    return Err(Error::InvalidConfig(format!(
                        "{}: parameter '{}' of type {} must be {} bytes long",
                        self.full_name(),
                        param.name,
                        param.ty,
                        width
                    )));
                }
            } else if param.length == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{}: raw parameter '{}' needs a length",
                    self.full_name(),
                    param.name
                )));
            }
        }

        if self.payload_len() > crate::protocol::MAX_SHORT_DATA {
            return Err(Error::InvalidConfig(format!(
                "{}: parameters do not fit in one packet",
                self.full_name()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// One command of a device, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub cid: u8,
    #[serde(default)]
    pub data_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<ParamType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,
}

/// A device and its commands, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub did: u8,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

/// An async event ID code and its name, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncEventSpec {
    pub id_code: u8,
    pub name: String,
}

/// Bidirectional command registry.
#[derive(Debug, Clone)]
pub struct CommandTable {
    commands: Vec<Arc<CommandDescriptor>>,
    by_id: HashMap<(u8, u8), Arc<CommandDescriptor>>,
    by_name: HashMap<String, Arc<CommandDescriptor>>,
    by_function: HashMap<String, Arc<CommandDescriptor>>,
    async_events: HashMap<u8, String>,
}

impl CommandTable {
    /// A table holding only the system commands.
    pub fn new() -> Self {
        let mut table = Self {
            commands: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_function: HashMap::new(),
            async_events: HashMap::new(),
        };
        for cmd in SysCommand::ALL {
            table.insert(cmd.descriptor());
        }
        table
    }

    /// Build a table from device and async event definitions.
    pub fn from_specs(devices: &[DeviceSpec], async_events: &[AsyncEventSpec]) -> Result<Self> {
        let mut table = Self::new();
        for device in devices {
            table.register_device(device)?;
        }
        for event in async_events {
            table.register_async_event(event.id_code, &event.name)?;
        }
        Ok(table)
    }

    fn insert(&mut self, descriptor: CommandDescriptor) {
        let descriptor = Arc::new(descriptor);
        self.by_id
            .insert((descriptor.did, descriptor.cid), descriptor.clone());
        self.by_name
            .insert(descriptor.full_name(), descriptor.clone());
        if let Some(ref function) = descriptor.function_name {
            self.by_function.insert(function.clone(), descriptor.clone());
        }
        self.commands.push(descriptor);
    }

    /// Register every command of a device.
    pub fn register_device(&mut self, device: &DeviceSpec) -> Result<()> {
        if device.did == SYS_DID || device.name == SYS_DEVICE {
            return Err(Error::InvalidConfig(format!(
                "device {} (DID {:#04x}) collides with the system device",
                device.name, device.did
            )));
        }

        for spec in &device.commands {
            let descriptor = CommandDescriptor {
                device: device.name.clone(),
                name: spec.name.clone(),
                did: device.did,
                cid: spec.cid,
                kind: CommandKind::Device,
                params: spec.params.clone(),
                data_required: spec.data_required,
                function_name: spec.function.clone(),
                return_type: spec.returns,
            };
            self.register(descriptor)?;
        }
        Ok(())
    }

    /// Register one device command.
    pub fn register(&mut self, descriptor: CommandDescriptor) -> Result<()> {
        if descriptor.is_system() || descriptor.did == SYS_DID {
            return Err(Error::InvalidConfig(format!(
                "{} uses the system device ID",
                descriptor.full_name()
            )));
        }
        if let Some(existing) = self.by_id.get(&(descriptor.did, descriptor.cid)) {
            return Err(Error::InvalidConfig(format!(
                "{} reuses DID {:#04x} CID {:#04x} of {}",
                descriptor.full_name(),
                descriptor.did,
                descriptor.cid,
                existing.full_name()
            )));
        }
        if self.by_name.contains_key(&descriptor.full_name()) {
            return Err(Error::InvalidConfig(format!(
                "duplicate command {}",
                descriptor.full_name()
            )));
        }
        if let Some(ref function) = descriptor.function_name {
            if self.by_function.contains_key(function) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate client function {function}"
                )));
            }
        }
        descriptor.validate()?;

        self.insert(descriptor);
        Ok(())
    }

    /// Name an async event ID code.
    pub fn register_async_event(&mut self, id_code: u8, name: &str) -> Result<()> {
        if self.async_events.contains_key(&id_code) {
            return Err(Error::InvalidConfig(format!(
                "duplicate async event ID code {id_code:#04x}"
            )));
        }
        self.async_events.insert(id_code, name.to_string());
        Ok(())
    }

    /// Resolve a `(DID, CID)` pair.
    pub fn command_for(&self, did: u8, cid: u8) -> Option<&Arc<CommandDescriptor>> {
        self.by_id.get(&(did, cid))
    }

    /// Resolve a `"DEVICE:COMMAND"` name.
    pub fn descriptor(&self, name: &str) -> Option<&Arc<CommandDescriptor>> {
        self.by_name.get(name)
    }

    /// Resolve a client function name.
    pub fn descriptor_for_function(&self, function: &str) -> Option<&Arc<CommandDescriptor>> {
        self.by_function.get(function)
    }

    /// Descriptor of a built-in system command.
    pub fn sys(&self, cmd: SysCommand) -> Option<&Arc<CommandDescriptor>> {
        self.command_for(SYS_DID, cmd.cid())
    }

    pub fn async_event_name(&self, id_code: u8) -> Option<&str> {
        self.async_events.get(&id_code).map(String::as_str)
    }

    pub fn async_event_code(&self, name: &str) -> Option<u8> {
        self.async_events
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(code, _)| *code)
    }

    /// All commands in registration order.
    pub fn commands(&self) -> impl Iterator<Item = &Arc<CommandDescriptor>> {
        self.commands.iter()
    }

    /// Async events sorted by ID code.
    pub fn async_events(&self) -> Vec<(u8, &str)> {
        let mut events: Vec<_> = self
            .async_events
            .iter()
            .map(|(code, name)| (*code, name.as_str()))
            .collect();
        events.sort_unstable();
        events
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}
