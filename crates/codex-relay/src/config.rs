//! Relay configuration.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::spawner::TargetSpawner;

pub const DEFAULT_UPSTREAM_SOCK: &str = "/tmp/codexd.sock";
pub const DEFAULT_TARGET: &str = "~/qemu-bin/bin/qemu-system-x86_64";
pub const DEFAULT_BOOT_IMAGE: &str = "~/xv6/o.qemu/kernel.elf";

pub struct RelayConfig {
    /// Controller socket the relay connects to.
    pub upstream: PathBuf,
    /// Reused when set; otherwise a fresh directory is created per run.
    pub exec_dir: Option<PathBuf>,
    /// Echo target output to stdout in addition to the per-trial log.
    pub echo: bool,
    /// Hand the target a record-trace path.
    pub record: bool,
    /// Remove earlier runs' artifacts from a reused execution directory.
    pub purge_stale: bool,
    pub spawner: Arc<dyn TargetSpawner>,
}

impl RelayConfig {
    pub fn new(spawner: Arc<dyn TargetSpawner>) -> Self {
        Self {
            upstream: PathBuf::from(DEFAULT_UPSTREAM_SOCK),
            exec_dir: None,
            echo: true,
            record: false,
            purge_stale: false,
            spawner,
        }
    }

    pub fn with_upstream(mut self, path: impl Into<PathBuf>) -> Self {
        self.upstream = path.into();
        self
    }

    pub fn with_exec_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.exec_dir = dir;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn with_purge_stale(mut self, purge: bool) -> Self {
        self.purge_stale = purge;
        self
    }
}

/// Expand a leading `~/` against `$HOME` and make the result absolute, so the
/// path still resolves after the target is started in the execution directory.
pub fn resolve_path(path: &Path) -> PathBuf {
    let expanded = expand_home(path, std::env::var_os("HOME").as_deref());
    std::path::absolute(&expanded).unwrap_or(expanded)
}

fn expand_home(path: &Path, home: Option<&OsStr>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => Path::new(home).join(rest),
        _ => path.to_path_buf(),
    }
}
