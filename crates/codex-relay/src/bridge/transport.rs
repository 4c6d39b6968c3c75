//! Unix socket transport for both relay links.
//!
//! - **RendezvousListener**: downstream endpoint inside the execution directory.
//!   Bound once at startup; each trial accepts exactly one target connection.
//! - **connect_upstream**: the long-lived controller connection, reused across trials.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;

use super::codec::PacketCodec;

/// A connection carrying relay packets in both directions.
pub type PacketStream<S> = Framed<S, PacketCodec>;

pub struct RendezvousListener {
    path: PathBuf,
    listener: UnixListener,
}

impl RendezvousListener {
    /// Bind the rendezvous socket, replacing a stale socket file left by an earlier run.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale rendezvous socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::debug!(path = %path.display(), "Bound rendezvous socket");
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the target of the current trial to dial in.
    pub async fn accept(&self) -> io::Result<PacketStream<UnixStream>> {
        tracing::trace!(path = %self.path.display(), "Waiting for target connection");
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!("Target connected");
        Ok(Framed::new(stream, PacketCodec::new()))
    }
}

/// Connect to the upstream controller.
pub async fn connect_upstream(path: &Path) -> io::Result<PacketStream<UnixStream>> {
    tracing::debug!(path = %path.display(), "Connecting to controller");
    let stream = UnixStream::connect(path).await?;
    Ok(Framed::new(stream, PacketCodec::new()))
}
