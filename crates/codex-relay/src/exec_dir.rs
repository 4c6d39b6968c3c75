//! Execution directory layout.
//!
//! One directory per relay run holds the rendezvous socket and every trial
//! artifact. Artifact names carry the trial index so trials never collide:
//!
//! ```text
//! {exec_dir}/relay.sock
//! {exec_dir}/log.{i}            combined stdout/stderr of the target
//! {exec_dir}/panic.{i}          panic record written by the target
//! {exec_dir}/replay.{i}.trace   replay trace
//! {exec_dir}/record.{i}.trace   record trace (only when recording)
//! ```
//!
//! The relay never removes the directory; the caller inspects or purges it.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Rendezvous socket path handed to the target.
pub const ENV_SOCKET: &str = "CODEX_RELAY_SOCK";
pub const ENV_PANIC_FILE: &str = "CODEX_PANIC_FILE";
pub const ENV_REPLAY_TRACE: &str = "CODEX_REPLAY_TRACE";
pub const ENV_RECORD_TRACE: &str = "CODEX_RECORD_TRACE";

const SOCKET_NAME: &str = "relay.sock";
const LOG_PREFIX: &str = "log.";
const PANIC_PREFIX: &str = "panic.";
const REPLAY_PREFIX: &str = "replay.";
const RECORD_PREFIX: &str = "record.";
const TRACE_SUFFIX: &str = ".trace";

/// Monotonic per-run trial counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrialIndex(u64);

impl TrialIndex {
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TrialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ExecDir {
    root: PathBuf,
}

impl ExecDir {
    /// Reuse `requested` (creating it if needed) or create a fresh directory under the
    /// system temp dir.
    pub fn create(requested: Option<&Path>) -> io::Result<Self> {
        let root = match requested {
            Some(dir) => dir.to_path_buf(),
            None => std::env::temp_dir().join(format!("codex-relay-{}", uuid::Uuid::new_v4())),
        };
        std::fs::create_dir_all(&root)?;
        tracing::info!(dir = %root.display(), "Using execution directory");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join(SOCKET_NAME)
    }

    pub fn artifacts(&self, trial: TrialIndex, record: bool) -> ArtifactPaths {
        ArtifactPaths {
            trial,
            log: self.root.join(format!("{LOG_PREFIX}{trial}")),
            panic: self.root.join(format!("{PANIC_PREFIX}{trial}")),
            replay_trace: self.root.join(format!("{REPLAY_PREFIX}{trial}{TRACE_SUFFIX}")),
            record_trace: record
                .then(|| self.root.join(format!("{RECORD_PREFIX}{trial}{TRACE_SUFFIX}"))),
        }
    }

    /// Remove artifacts of earlier runs from a reused directory. Files that do not
    /// parse as trial artifacts are left alone. Returns the number removed.
    pub fn purge_stale_artifacts(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if artifact_trial(&name).is_some() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, dir = %self.root.display(), "Purged stale trial artifacts");
        }
        Ok(removed)
    }
}

/// Trial index encoded in an artifact file name, if it is one.
fn artifact_trial(name: &OsStr) -> Option<TrialIndex> {
    let name = name.to_str()?;
    let index = if let Some(rest) = name.strip_prefix(LOG_PREFIX) {
        rest
    } else if let Some(rest) = name.strip_prefix(PANIC_PREFIX) {
        rest
    } else if let Some(rest) = name.strip_prefix(REPLAY_PREFIX) {
        rest.strip_suffix(TRACE_SUFFIX)?
    } else {
        name.strip_prefix(RECORD_PREFIX)?.strip_suffix(TRACE_SUFFIX)?
    };
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok().map(TrialIndex)
}

/// Files produced by one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub trial: TrialIndex,
    pub log: PathBuf,
    pub panic: PathBuf,
    pub replay_trace: PathBuf,
    pub record_trace: Option<PathBuf>,
}

impl ArtifactPaths {
    pub fn env_overlay(&self, socket: &Path) -> EnvOverlay {
        let mut overlay = EnvOverlay::default();
        overlay.insert(ENV_SOCKET, socket);
        overlay.insert(ENV_PANIC_FILE, &self.panic);
        overlay.insert(ENV_REPLAY_TRACE, &self.replay_trace);
        if let Some(record) = &self.record_trace {
            overlay.insert(ENV_RECORD_TRACE, record);
        }
        overlay
    }
}

/// Variables layered over the inherited environment of the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: BTreeMap<&'static str, PathBuf>,
}

impl EnvOverlay {
    pub fn insert(&mut self, name: &'static str, value: impl Into<PathBuf>) {
        self.vars.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.vars.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Path)> {
        self.vars.iter().map(|(k, v)| (*k, v.as_path()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
