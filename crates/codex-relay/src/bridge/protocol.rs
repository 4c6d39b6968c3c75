//! Message types exchanged with the controller and the target.
//!
//! The relay is the client of the upstream controller:
//! - relay sends `next`, controller answers `done` or `reset`
//! - after the downstream Flush, relay announces `extend` and streams the
//!   target's answer back until the target's own Flush
//!
//! Every other payload is opaque and forwarded verbatim.

use bytes::Bytes;

use super::codec::ProtocolError;

/// Request for the next unit of work.
pub const NEXT: &[u8] = b"next";
/// Announces that the target's response packets follow.
pub const EXTEND: &[u8] = b"extend";
/// No more work; the relay exits.
pub const DONE: &[u8] = b"done";
/// Start a fresh trial.
pub const RESET: &[u8] = b"reset";

/// One framed message.
///
/// `Flush` is the zero-length frame marking a phase boundary. It is distinct
/// from `Payload` with an empty body, which is a regular four-byte frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Payload(Bytes),
    Flush,
}

impl Packet {
    pub fn payload(data: impl Into<Bytes>) -> Self {
        Self::Payload(data.into())
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Payload(data) => Some(data),
            Self::Flush => None,
        }
    }

    /// Printable form for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Payload(data) => format!("{:?}", data.escape_ascii().to_string()),
            Self::Flush => "<flush>".to_string(),
        }
    }
}

/// Controller's answer to a `next` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResponse {
    Done,
    Reset,
}

impl WorkResponse {
    pub fn parse(packet: &Packet) -> Result<Self, ProtocolError> {
        match packet.as_bytes() {
            Some(token) if token == DONE => Ok(Self::Done),
            Some(token) if token == RESET => Ok(Self::Reset),
            _ => Err(ProtocolError::UnexpectedResponse(packet.describe())),
        }
    }
}
