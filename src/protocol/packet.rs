//! Packet structures and their byte-exact encoding.

use byteorder::{BigEndian, ByteOrder};

use crate::error::ProtocolError;

use super::{
    checksum, StatusCode, ASYNC_HEADER_SIZE, ASYNC_MIN_PACKET_SIZE, CHECKSUM_START,
    CLIENT_HEADER_SIZE, CLIENT_MIN_PACKET_SIZE, FLAG_REQUEST_ACK, FLAG_RESET_TIMEOUT,
    MAX_ASYNC_DATA, MAX_SHORT_DATA, RESPONSE_HEADER_SIZE, RESPONSE_MIN_PACKET_SIZE, SOP1,
    SOP2_ASYNC, SOP2_CLIENT_BASE, SOP2_RESPONSE,
};

type Result<T> = std::result::Result<T, ProtocolError>;

/// Where a packet shape keeps its length prefix.
struct Layout {
    min_size: usize,
    header_size: usize,
    dlen_offset: usize,
    wide_dlen: bool,
}

const CLIENT_LAYOUT: Layout = Layout {
    min_size: CLIENT_MIN_PACKET_SIZE,
    header_size: CLIENT_HEADER_SIZE,
    dlen_offset: 5,
    wide_dlen: false,
};

const RESPONSE_LAYOUT: Layout = Layout {
    min_size: RESPONSE_MIN_PACKET_SIZE,
    header_size: RESPONSE_HEADER_SIZE,
    dlen_offset: 4,
    wide_dlen: false,
};

const ASYNC_LAYOUT: Layout = Layout {
    min_size: ASYNC_MIN_PACKET_SIZE,
    header_size: ASYNC_HEADER_SIZE,
    dlen_offset: 3,
    wide_dlen: true,
};

/// Run the framing checks shared by every packet shape and return the DATA
/// range on success.
fn validate(buf: &[u8], layout: &Layout) -> Result<std::ops::Range<usize>> {
    if buf.len() < layout.min_size {
        return Err(ProtocolError::InvalidPacketSize {
            size: buf.len(),
            min: layout.min_size,
        });
    }

    if buf[0] != SOP1 {
        return Err(ProtocolError::InvalidHeader);
    }

    let dlen = if layout.wide_dlen {
        BigEndian::read_u16(&buf[layout.dlen_offset..layout.dlen_offset + 2]) as usize
    } else {
        buf[layout.dlen_offset] as usize
    };

    let expected = layout.header_size + dlen;
    if buf.len() != expected {
        return Err(ProtocolError::SizeMismatch {
            expected,
            got: buf.len(),
        });
    }

    let chk_pos = buf.len() - 1;
    let computed = checksum(&buf[CHECKSUM_START..chk_pos]);
    if buf[chk_pos] != computed {
        return Err(ProtocolError::ChecksumMismatch {
            expected: computed,
            got: buf[chk_pos],
        });
    }

    Ok(layout.header_size..chk_pos)
}

/// Append the checksum of everything after SOP1/SOP2.
fn seal(mut buf: Vec<u8>) -> Vec<u8> {
    let chk = checksum(&buf[CHECKSUM_START..]);
    buf.push(chk);
    buf
}

fn check_data_len(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(ProtocolError::PayloadTooLarge { size: len, max });
    }
    Ok(())
}

/// Request sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientPacket {
    /// Device identifier.
    pub did: u8,
    /// Command identifier.
    pub cid: u8,
    /// Sequence number echoed by the response.
    pub seq: u8,
    /// Command payload.
    pub data: Vec<u8>,
    /// Re-arm the server's heartbeat deadline when handled.
    pub reset_timeout: bool,
    /// Ask for an acknowledgement.
    pub request_ack: bool,
}

impl ClientPacket {
    /// Create a packet with both flags cleared.
    pub fn new(did: u8, cid: u8, seq: u8, data: Vec<u8>) -> Self {
        Self {
            did,
            cid,
            seq,
            data,
            reset_timeout: false,
            request_ack: false,
        }
    }

    /// Set the reset-timeout and request-ack flags.
    pub fn with_flags(mut self, reset_timeout: bool, request_ack: bool) -> Self {
        self.reset_timeout = reset_timeout;
        self.request_ack = request_ack;
        self
    }

    fn sop2(&self) -> u8 {
        let mut sop2 = SOP2_CLIENT_BASE;
        if self.reset_timeout {
            sop2 |= FLAG_RESET_TIMEOUT;
        }
        if self.request_ack {
            sop2 |= FLAG_REQUEST_ACK;
        }
        sop2
    }

    /// Encode packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_data_len(self.data.len(), MAX_SHORT_DATA)?;

        let mut buf = Vec::with_capacity(CLIENT_MIN_PACKET_SIZE + self.data.len());
        buf.extend_from_slice(&[
            SOP1,
            self.sop2(),
            self.did,
            self.cid,
            self.seq,
            (self.data.len() + 1) as u8,
        ]);
        buf.extend_from_slice(&self.data);
        Ok(seal(buf))
    }

    /// Decode packet from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let data = validate(buf, &CLIENT_LAYOUT)?;
        let sop2 = buf[1];

        Ok(Self {
            did: buf[2],
            cid: buf[3],
            seq: buf[4],
            data: buf[data].to_vec(),
            reset_timeout: sop2 & FLAG_RESET_TIMEOUT != 0,
            request_ack: sop2 & FLAG_REQUEST_ACK != 0,
        })
    }
}

/// Response to a client request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerResponsePacket {
    /// Status code.
    pub mrsp: u8,
    /// Sequence number of the request being answered.
    pub seq: u8,
    /// Response payload.
    pub data: Vec<u8>,
}

impl ServerResponsePacket {
    pub fn new(seq: u8, status: StatusCode, data: Vec<u8>) -> Self {
        Self {
            mrsp: status.code(),
            seq,
            data,
        }
    }

    /// An `OK` response carrying `data`.
    pub fn ok(seq: u8, data: Vec<u8>) -> Self {
        Self::new(seq, StatusCode::Ok, data)
    }

    /// A response with no payload.
    pub fn status(seq: u8, status: StatusCode) -> Self {
        Self::new(seq, status, Vec::new())
    }

    /// Interpret the status byte, if it is a known code.
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u8(self.mrsp)
    }

    /// Encode packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_data_len(self.data.len(), MAX_SHORT_DATA)?;

        let mut buf = Vec::with_capacity(RESPONSE_MIN_PACKET_SIZE + self.data.len());
        buf.extend_from_slice(&[
            SOP1,
            SOP2_RESPONSE,
            self.mrsp,
            self.seq,
            (self.data.len() + 1) as u8,
        ]);
        buf.extend_from_slice(&self.data);
        Ok(seal(buf))
    }

    /// Decode packet from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let data = validate(buf, &RESPONSE_LAYOUT)?;

        Ok(Self {
            mrsp: buf[2],
            seq: buf[3],
            data: buf[data].to_vec(),
        })
    }
}

/// Unsolicited server message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerAsyncPacket {
    /// Event identifier.
    pub id_code: u8,
    /// Event payload.
    pub data: Vec<u8>,
}

impl ServerAsyncPacket {
    pub fn new(id_code: u8, data: Vec<u8>) -> Self {
        Self { id_code, data }
    }

    /// Encode packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_data_len(self.data.len(), MAX_ASYNC_DATA)?;

        let mut buf = Vec::with_capacity(ASYNC_MIN_PACKET_SIZE + self.data.len());
        buf.extend_from_slice(&[SOP1, SOP2_ASYNC, self.id_code, 0, 0]);
        BigEndian::write_u16(&mut buf[3..5], (self.data.len() + 1) as u16);
        buf.extend_from_slice(&self.data);
        Ok(seal(buf))
    }

    /// Decode packet from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let data = validate(buf, &ASYNC_LAYOUT)?;

        Ok(Self {
            id_code: buf[2],
            data: buf[data].to_vec(),
        })
    }
}

/// Kind of a server-originated packet, told apart by SOP2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPacketKind {
    Response,
    Async,
}

/// Inspect SOP1/SOP2 of a server packet without validating the rest.
pub fn classify_server_packet(buf: &[u8]) -> Result<ServerPacketKind> {
    if buf.len() < 2 {
        return Err(ProtocolError::InvalidPacketSize {
            size: buf.len(),
            min: RESPONSE_MIN_PACKET_SIZE,
        });
    }
    if buf[0] != SOP1 {
        return Err(ProtocolError::InvalidHeader);
    }
    match buf[1] {
        SOP2_RESPONSE => Ok(ServerPacketKind::Response),
        SOP2_ASYNC => Ok(ServerPacketKind::Async),
        _ => Err(ProtocolError::InvalidHeader),
    }
}

/// Any packet a client can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    Response(ServerResponsePacket),
    Async(ServerAsyncPacket),
}

impl ServerPacket {
    /// Classify and decode a server packet.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        match classify_server_packet(buf)? {
            ServerPacketKind::Response => ServerResponsePacket::decode(buf).map(Self::Response),
            ServerPacketKind::Async => ServerAsyncPacket::decode(buf).map(Self::Async),
        }
    }

    /// Encode packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Response(p) => p.encode(),
            Self::Async(p) => p.encode(),
        }
    }
}
