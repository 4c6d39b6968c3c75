//! Wire layer shared by the upstream controller link and the downstream target link.
//!
//! # Architecture
//!
//! - **protocol**: `Packet` and the upstream request/response tokens
//! - **codec**: hex-length framing codec for AsyncRead/AsyncWrite
//! - **transport**: Unix socket endpoints (rendezvous listener, upstream connector)

pub mod codec;
pub mod protocol;
pub mod transport;
