//! Stream framing for packets.
//!
//! Datagram transports deliver one packet per read. Stream transports need the
//! length prefix to find packet boundaries, which is all these framers do: they
//! yield the raw bytes of one packet and leave validation to the packet decoders.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use super::{ASYNC_HEADER_SIZE, CLIENT_HEADER_SIZE, RESPONSE_HEADER_SIZE, SOP1, SOP2_ASYNC};

/// Largest frame any packet shape can produce (async header + 16-bit DLEN).
pub const MAX_FRAME_SIZE: usize = ASYNC_HEADER_SIZE + u16::MAX as usize;

/// Discard leading garbage until the buffer starts with SOP1.
fn resync(src: &mut BytesMut) {
    match src.iter().position(|b| *b == SOP1) {
        Some(0) => {}
        Some(pos) => {
            trace!("Discarding {} bytes before start of packet", pos);
            let _ = src.split_to(pos);
        }
        None => {
            trace!("Discarding {} bytes without start of packet", src.len());
            src.clear();
        }
    }
}

/// Split one frame of `header_size + dlen` bytes, or wait for more input.
///
/// A zero DLEN can never describe a valid packet, so its leading byte is
/// dropped and the scan starts again.
fn split_frame(
    src: &mut BytesMut,
    header_size: usize,
    dlen: impl Fn(&BytesMut) -> usize,
) -> Option<Bytes> {
    loop {
        resync(src);
        if src.len() < header_size {
            return None;
        }

        let len = dlen(src);
        if len == 0 {
            let _ = src.split_to(1);
            continue;
        }

        let total = header_size + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return None;
        }

        return Some(src.split_to(total).freeze());
    }
}

/// Drop a partial packet left behind when the stream ends.
fn discard_tail(src: &mut BytesMut) {
    if !src.is_empty() {
        trace!("Discarding {} trailing bytes at end of stream", src.len());
        src.clear();
    }
}

/// Frames client packets (server side of a stream transport).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientPacketFramer;

impl ClientPacketFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ClientPacketFramer {
    type Item = Bytes;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(split_frame(src, CLIENT_HEADER_SIZE, |buf| {
            buf[CLIENT_HEADER_SIZE - 1] as usize
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() {
            discard_tail(src);
        }
        Ok(frame)
    }
}

/// Frames server packets (client side of a stream transport).
///
/// Responses carry a one-byte DLEN, async packets a two-byte one; SOP2 tells
/// them apart.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerPacketFramer;

impl ServerPacketFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ServerPacketFramer {
    type Item = Bytes;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Both shapes have a five byte header.
        debug_assert_eq!(ASYNC_HEADER_SIZE, RESPONSE_HEADER_SIZE);

        Ok(split_frame(src, RESPONSE_HEADER_SIZE, |buf| {
            if buf[1] == SOP2_ASYNC {
                u16::from_be_bytes([buf[3], buf[4]]) as usize
            } else {
                buf[4] as usize
            }
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() {
            discard_tail(src);
        }
        Ok(frame)
    }
}
