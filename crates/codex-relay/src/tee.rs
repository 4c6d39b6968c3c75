//! Output tee for the target's combined stdout/stderr.
//!
//! Runs as its own task for the lifetime of one trial, copying every chunk
//! read from the target to all sinks (per-trial log file, optionally the
//! console). The control task never touches the pipe while the tee runs.
//!
//! Stopping is two-step: cancel and join the task, then `drain_until_idle`
//! picks up whatever the target wrote between the stop signal and the task
//! exiting. Only after that are the sinks flushed and closed.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::RelayError;

/// Upper bound for a single read from the target.
const READ_CHUNK: usize = 1024;
/// Upper bound for the post-stop drain. One pipe buffer's worth; a target still
/// producing output past this point is about to be killed anyway.
const FINAL_DRAIN_LIMIT: usize = 64 * 1024;

pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

pub struct OutputTee {
    source: pipe::Receiver,
    /// Second handle on the same pipe for the final drain. Reads through it are
    /// plain non-blocking syscalls, independent of the reactor's readiness state.
    drain: File,
    sinks: Vec<Sink>,
    eof: bool,
}

impl OutputTee {
    /// `output` must be the non-blocking read end of a pipe.
    pub fn new(output: OwnedFd, sinks: Vec<Sink>) -> io::Result<Self> {
        let drain = File::from(output.try_clone()?);
        let source = pipe::Receiver::from_owned_fd_unchecked(output)?;
        Ok(Self {
            source,
            drain,
            sinks,
            eof: false,
        })
    }

    /// Start copying on a background task.
    pub fn spawn(self) -> TeeHandle {
        let stop = CancellationToken::new();
        let failed = CancellationToken::new();
        let guard = stop.clone().drop_guard();
        let task = tokio::spawn(self.run(stop.clone(), failed.clone()));
        TeeHandle {
            stop,
            failed,
            task,
            _guard: guard,
        }
    }

    async fn run(self, stop: CancellationToken, failed: CancellationToken) -> io::Result<Self> {
        let result = self.copy_until_stopped(stop).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Output drain failed");
            failed.cancel();
        }
        result
    }

    async fn copy_until_stopped(mut self, stop: CancellationToken) -> io::Result<Self> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                read = self.source.read(&mut buf) => read?,
            };
            if read == 0 {
                tracing::debug!("Target closed its output");
                self.eof = true;
                break;
            }
            self.fan_out(&buf[..read]).await?;
        }
        Ok(self)
    }

    async fn fan_out(&mut self, chunk: &[u8]) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Copy whatever is immediately readable, without waiting for more.
    /// Returns the number of bytes copied.
    pub async fn drain_until_idle(&mut self) -> io::Result<usize> {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut copied = 0;
        while !self.eof && copied < FINAL_DRAIN_LIMIT {
            match self.drain.read(&mut buf) {
                Ok(0) => self.eof = true,
                Ok(read) => {
                    self.fan_out(&buf[..read]).await?;
                    copied += read;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(copied)
    }

    /// Flush and close every sink.
    pub async fn finish(mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }
}

/// Running tee. Dropping the handle without calling `stop` still cancels the task.
pub struct TeeHandle {
    stop: CancellationToken,
    /// Cancelled by the task when it ends on an I/O error.
    failed: CancellationToken,
    task: JoinHandle<io::Result<OutputTee>>,
    _guard: DropGuard,
}

impl TeeHandle {
    /// Run `work` unless the tee fails first. A failed tee aborts the work and
    /// its error is returned instead.
    pub async fn guard<T>(
        &mut self,
        work: impl Future<Output = Result<T, RelayError>>,
    ) -> Result<T, RelayError> {
        let failed = self.failed.clone();
        tokio::select! {
            biased;
            _ = failed.cancelled() => Err(self.failure().await),
            result = work => result,
        }
    }

    async fn failure(&mut self) -> RelayError {
        match (&mut self.task).await {
            Ok(Err(e)) => RelayError::Drain(e),
            Ok(Ok(_)) => RelayError::Drain(io::Error::other("output tee stopped")),
            Err(e) => RelayError::DrainTask(e),
        }
    }

    /// Signal, join, then drain the pipe once more. The tee is returned so the
    /// caller decides when the sinks close.
    pub async fn stop(self) -> Result<OutputTee, RelayError> {
        self.stop.cancel();
        let mut tee = self.task.await?.map_err(RelayError::Drain)?;
        let late = tee.drain_until_idle().await.map_err(RelayError::Drain)?;
        if late > 0 {
            tracing::trace!(bytes = late, "Drained output after stop");
        }
        Ok(tee)
    }
}
