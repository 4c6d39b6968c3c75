//! Relay-level error taxonomy.
//!
//! Every variant is fatal to the whole run: there is no per-trial recovery, the
//! caller restarts the relay.

use std::io;

use crate::bridge::codec::{CodecError, ProtocolError};
use crate::spawner::SpawnError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Framing or protocol violation on either link, or an oversized outgoing packet.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Missing target binary or boot image, or the target failed to start.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Reading the target's output or writing it to a sink failed.
    #[error("output drain failed")]
    Drain(#[source] io::Error),

    #[error("output drain task failed")]
    DrainTask(#[from] tokio::task::JoinError),

    #[error("{context}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    pub fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { context, source }
    }

    /// The protocol violation behind this error, if that is what it is.
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Codec(CodecError::Protocol(e)) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        Self::Codec(e.into())
    }
}
