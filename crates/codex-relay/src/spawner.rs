//! Target process supervision.
//!
//! Flow per trial:
//! 1. Create one pipe; the child's stdout and stderr both write into it
//! 2. Spawn the target with stdin on /dev/null and the trial's env overlay
//! 3. Put the read end in non-blocking mode; the output tee takes it from here
//! 4. On teardown: SIGKILL, then reap. The exit status is not inspected.

use std::ffi::OsStr;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::pipe2;
use tokio::process::{Child, Command};

use crate::exec_dir::EnvOverlay;

/// Argument line the emulator is launched with, before `-kernel <boot image>`.
pub const DEFAULT_TARGET_ARGS: &str = "-smp 2 -m 512 -serial mon:stdio -nographic \
    -numa node -numa node -net user -net nic,model=e1000 \
    -redir tcp:2323::23 -redir tcp:8080::80";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn target")]
    Spawn(#[from] io::Error),
    #[error("cannot find {what} ({}){hint}", .path.display())]
    Missing {
        what: &'static str,
        path: PathBuf,
        hint: &'static str,
    },
}

/// Extension point for what gets launched for each trial.
pub trait TargetSpawner: Send + Sync {
    /// Startup check, run once before any socket is bound.
    fn check_preconditions(&self) -> Result<(), SpawnError>;

    /// Program and arguments for one trial. Stdio and environment are set by the caller.
    fn command(&self) -> Command;
}

/// Launches the emulator with a boot image.
#[derive(Debug, Clone)]
pub struct EmulatorSpawner {
    program: PathBuf,
    args: Vec<String>,
    boot_image: PathBuf,
}

impl EmulatorSpawner {
    pub fn new(program: impl Into<PathBuf>, boot_image: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: DEFAULT_TARGET_ARGS
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            boot_image: boot_image.into(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Full argument list, boot image last.
    pub fn argv(&self) -> Vec<&OsStr> {
        self.args
            .iter()
            .map(OsStr::new)
            .chain([OsStr::new("-kernel"), self.boot_image.as_os_str()])
            .collect()
    }
}

impl TargetSpawner for EmulatorSpawner {
    fn check_preconditions(&self) -> Result<(), SpawnError> {
        if !self.program.exists() {
            return Err(SpawnError::Missing {
                what: "target binary",
                path: self.program.clone(),
                hint: ", did you forget to make install?",
            });
        }
        if !self.boot_image.exists() {
            return Err(SpawnError::Missing {
                what: "boot image",
                path: self.boot_image.clone(),
                hint: ", did you forget to run make?",
            });
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.argv());
        command
    }
}

/// A running target and the read end of its combined output.
pub struct TargetProcess {
    child: Child,
    output: Option<OwnedFd>,
}

impl TargetProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking read end of the combined stdout/stderr. Available once.
    pub fn take_output(&mut self) -> Option<OwnedFd> {
        self.output.take()
    }

    /// Kill unconditionally and reap.
    pub async fn terminate(mut self) -> io::Result<ExitStatus> {
        let pid = self.child.id();
        self.child.start_kill()?;
        let status = self.child.wait().await?;
        tracing::debug!(?pid, %status, "Target terminated");
        Ok(status)
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Spawn one trial's target.
///
/// The base environment is inherited; `env` only adds or overrides variables.
pub fn spawn_target(
    spawner: &dyn TargetSpawner,
    env: &EnvOverlay,
    exec_dir: &Path,
) -> Result<TargetProcess, SpawnError> {
    // CLOEXEC keeps later trials' children from inheriting this trial's pipe.
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let stderr_end = write_end.try_clone()?;

    let child = {
        let mut command = spawner.command();
        command
            .current_dir(exec_dir)
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .kill_on_drop(true);
        command.spawn()?
        // Dropping the command closes the parent's copies of the write end,
        // so the reader sees EOF once the child exits.
    };

    set_nonblocking(&read_end)?;

    tracing::info!(pid = ?child.id(), "Spawned target");
    Ok(TargetProcess {
        child,
        output: Some(read_end),
    })
}
