//! codex-relay: drives isolated emulator trials for a record/replay controller.
//!
//! The relay sits between an upstream controller and a freshly spawned target
//! per trial, moving framed packets between them and capturing the target's
//! output. It does not interpret payloads.

pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod exec_dir;
pub mod logging;
pub mod spawner;
pub mod tee;

pub use bridge::codec::{CodecError, PacketCodec, ProtocolError};
pub use bridge::protocol::{Packet, WorkResponse};
pub use config::RelayConfig;
pub use controller::{TrialController, TrialOutcome, TrialState, run};
pub use error::RelayError;
pub use exec_dir::{ArtifactPaths, EnvOverlay, ExecDir, TrialIndex};
pub use spawner::{EmulatorSpawner, SpawnError, TargetProcess, TargetSpawner, spawn_target};
