//! Wire protocol for Ansible.
//!
//! Three packet shapes share a fixed-position header, a length prefix and a
//! trailing checksum byte, so every packet can be verified on its own.
//!
//! ## Packet Format
//!
//! ```text
//! Client request:
//! ┌──────┬──────┬─────┬─────┬─────┬──────┬──────────┬─────┐
//! │ 0xFF │ SOP2 │ DID │ CID │ SEQ │ DLEN │ DATA ... │ CHK │
//! └──────┴──────┴─────┴─────┴─────┴──────┴──────────┴─────┘
//!   SOP2 = 0b1111_11RA  (R = reset timeout, A = request ack)
//!
//! Server response:
//! ┌──────┬──────┬──────┬─────┬──────┬──────────┬─────┐
//! │ 0xFF │ 0xFF │ MRSP │ SEQ │ DLEN │ DATA ... │ CHK │
//! └──────┴──────┴──────┴─────┴──────┴──────────┴─────┘
//!
//! Server async:
//! ┌──────┬──────┬─────────┬───────────┬──────────┬─────┐
//! │ 0xFF │ 0xFE │ ID_CODE │ DLEN (BE) │ DATA ... │ CHK │
//! └──────┴──────┴─────────┴───────────┴──────────┴─────┘
//! ```
//!
//! `DLEN` counts the data bytes plus the checksum byte. The checksum is the
//! one's complement of the byte sum from offset 2 up to (not including) CHK.

mod codec;
mod packet;

use std::fmt;

pub use codec::{ClientPacketFramer, ServerPacketFramer, MAX_FRAME_SIZE};
pub use packet::{
    classify_server_packet, ClientPacket, ServerAsyncPacket, ServerPacket, ServerPacketKind,
    ServerResponsePacket,
};

/// First start-of-packet byte, common to every packet.
pub const SOP1: u8 = 0xFF;

/// Second start-of-packet byte of a server response.
pub const SOP2_RESPONSE: u8 = 0xFF;

/// Second start-of-packet byte of a server async packet.
pub const SOP2_ASYNC: u8 = 0xFE;

/// Fixed high bits of a client packet's SOP2.
pub const SOP2_CLIENT_BASE: u8 = 0xFC;

/// SOP2 bit: the client asks for an acknowledgement.
pub const FLAG_REQUEST_ACK: u8 = 0x01;

/// SOP2 bit: the message should re-arm the heartbeat deadline.
pub const FLAG_RESET_TIMEOUT: u8 = 0x02;

/// Offset of the first checksummed byte.
pub const CHECKSUM_START: usize = 2;

/// Client packet header size (everything before DATA).
pub const CLIENT_HEADER_SIZE: usize = 6;

/// Smallest valid client packet (header + checksum).
pub const CLIENT_MIN_PACKET_SIZE: usize = CLIENT_HEADER_SIZE + 1;

/// Server response header size.
pub const RESPONSE_HEADER_SIZE: usize = 5;

/// Smallest valid server response.
pub const RESPONSE_MIN_PACKET_SIZE: usize = RESPONSE_HEADER_SIZE + 1;

/// Server async header size.
pub const ASYNC_HEADER_SIZE: usize = 5;

/// Smallest valid server async packet.
pub const ASYNC_MIN_PACKET_SIZE: usize = ASYNC_HEADER_SIZE + 1;

/// Largest DATA field of a packet with a one-byte DLEN.
pub const MAX_SHORT_DATA: usize = u8::MAX as usize - 1;

/// Largest DATA field of an async packet (two-byte DLEN).
pub const MAX_ASYNC_DATA: usize = u16::MAX as usize - 1;

/// Compute the packet checksum over `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) ^ 0xFF
}

/// Response status code (MRSP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    InvalidState = 1,
    RequestTimedOut = 2,
    InvalidCommand = 3,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalidState),
            2 => Some(Self::RequestTimedOut),
            3 => Some(Self::InvalidCommand),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::InvalidState => write!(f, "INVALID_STATE"),
            Self::RequestTimedOut => write!(f, "REQUEST_TIMED_OUT"),
            Self::InvalidCommand => write!(f, "INVALID_COMMAND"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&[]), 0xFF);
        assert_eq!(checksum(&[0x00, 0x01, 0x01, 0x01]), 0xFC);
        // Sum wraps at 8 bits before inversion
        assert_eq!(checksum(&[0xFF, 0x02]), 0xFE);
    }

    #[test]
    fn test_status_codes() {
        for code in 0..4 {
            assert_eq!(StatusCode::from_u8(code).unwrap().code(), code);
        }
        assert!(StatusCode::from_u8(4).is_none());
        assert_eq!(StatusCode::RequestTimedOut.to_string(), "REQUEST_TIMED_OUT");
    }
}
