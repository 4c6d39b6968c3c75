//! Framed codec for relay packets.
//!
//! Frame layout: four ASCII hex digits holding `payload.len() + 4`, the raw
//! payload, then a single `\n`. A length field of `0000` (with no payload) is
//! the Flush marker. Works over any AsyncRead/AsyncWrite via `Framed`.
//!
//! Framing does not resynchronize: the first malformed frame ends the stream.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use futures::{Stream, StreamExt};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::Packet;

/// Width of the hex length field.
pub const HEADER_LEN: usize = 4;
/// Largest value the length field can carry.
pub const MAX_FRAME_LEN: usize = 0xFFFF;
/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

const TERMINATOR: u8 = b'\n';
const FLUSH_FRAME: &[u8] = b"0000\n";

/// Malformed input from a peer. Always fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("bad length {0}")]
    BadLength(String),
    #[error("bad terminator {0:#04x}")]
    BadTerminator(u8),
    #[error("unexpected response {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("protocol error")]
    Protocol(#[from] ProtocolError),
    /// Caller tried to send a payload that cannot be framed.
    #[error("packet too large to send: {len} payload bytes (max {MAX_PAYLOAD_LEN})")]
    Encoding { len: usize },
    #[error("i/o error")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Parses the hex length field. Returns the frame length (0 for Flush).
fn parse_length(header: &[u8]) -> Result<usize, ProtocolError> {
    let bad_length =
        || ProtocolError::BadLength(format!("{:?}", header.escape_ascii().to_string()));

    if !header.iter().all(u8::is_ascii_hexdigit) {
        return Err(bad_length());
    }
    let text = std::str::from_utf8(header).map_err(|_| bad_length())?;
    let len = usize::from_str_radix(text, 16).map_err(|_| bad_length())?;

    // Every payload frame counts its own length field, so 1..=3 cannot occur.
    if (1..HEADER_LEN).contains(&len) {
        return Err(bad_length());
    }
    Ok(len)
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the header as soon as it is complete, before waiting on the body.
        let frame_len = parse_length(&src[..HEADER_LEN])?;
        let body_len = frame_len.saturating_sub(HEADER_LEN);
        let total = HEADER_LEN + body_len + 1;

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let terminator = src[total - 1];
        if terminator != TERMINATOR {
            return Err(ProtocolError::BadTerminator(terminator).into());
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        src.advance(1);

        tracing::trace!(frame_len, "Decoded frame");
        if frame_len == 0 {
            Ok(Some(Packet::Flush))
        } else {
            Ok(Some(Packet::Payload(body)))
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            None => Err(ProtocolError::UnexpectedEof.into()),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match packet {
            Packet::Flush => dst.extend_from_slice(FLUSH_FRAME),
            Packet::Payload(body) => {
                // Checked before touching `dst` so a rejected packet writes nothing.
                if body.len() > MAX_PAYLOAD_LEN {
                    return Err(CodecError::Encoding { len: body.len() });
                }
                dst.reserve(HEADER_LEN + body.len() + 1);
                dst.extend_from_slice(format!("{:04x}", body.len() + HEADER_LEN).as_bytes());
                dst.extend_from_slice(&body);
                dst.put_u8(TERMINATOR);
            }
        }
        Ok(())
    }
}

/// Reads exactly one packet. A clean end of stream is still an error here:
/// every caller is waiting on a frame the peer owes it.
pub async fn read_packet<S>(stream: &mut S) -> Result<Packet, CodecError>
where
    S: Stream<Item = Result<Packet, CodecError>> + Unpin,
{
    match stream.next().await {
        Some(result) => result,
        None => Err(ProtocolError::UnexpectedEof.into()),
    }
}
