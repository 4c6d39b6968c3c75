use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use codex_relay::config::{
    DEFAULT_BOOT_IMAGE, DEFAULT_TARGET, DEFAULT_UPSTREAM_SOCK, resolve_path,
};
use codex_relay::{EmulatorSpawner, RelayConfig};

#[derive(Debug, Parser)]
#[command(
    name = "codex-relay",
    version,
    about = "Relay record/replay trials between a controller and a fresh emulator per trial"
)]
struct Cli {
    /// Emulator binary to launch for each trial.
    #[arg(long, env = "CODEX_RELAY_TARGET", default_value = DEFAULT_TARGET)]
    target: PathBuf,

    /// Boot image passed to the emulator as `-kernel`.
    #[arg(long, env = "CODEX_RELAY_BOOT_IMAGE", default_value = DEFAULT_BOOT_IMAGE)]
    boot_image: PathBuf,

    /// Controller socket to connect to.
    #[arg(long, env = "CODEX_RELAY_UPSTREAM", default_value = DEFAULT_UPSTREAM_SOCK)]
    upstream: PathBuf,

    /// Execution directory to reuse. A fresh one is created when omitted.
    #[arg(long, env = "CODEX_RELAY_EXEC_DIR")]
    exec_dir: Option<PathBuf>,

    /// Emulator argument (repeatable). Replaces the default argument line.
    #[arg(long = "target-arg", value_name = "ARG", allow_hyphen_values = true)]
    target_args: Vec<String>,

    /// Do not echo target output to stdout.
    #[arg(long)]
    no_echo: bool,

    /// Also hand the target a record-trace path.
    #[arg(long)]
    record: bool,

    /// Remove trial artifacts left in a reused execution directory.
    #[arg(long)]
    purge_stale: bool,
}

impl Cli {
    /// Custom `--target-arg`s replace the default argument line entirely.
    fn spawner(&self) -> EmulatorSpawner {
        let spawner =
            EmulatorSpawner::new(resolve_path(&self.target), resolve_path(&self.boot_image));
        if self.target_args.is_empty() {
            spawner
        } else {
            spawner.with_args(self.target_args.clone())
        }
    }

    fn into_config(self) -> RelayConfig {
        RelayConfig::new(Arc::new(self.spawner()))
            .with_upstream(resolve_path(&self.upstream))
            .with_exec_dir(self.exec_dir.as_deref().map(resolve_path))
            .with_echo(!self.no_echo)
            .with_record(self.record)
            .with_purge_stale(self.purge_stale)
    }
}

#[tokio::main]
async fn main() {
    codex_relay::logging::init_tracing();

    let config = Cli::parse().into_config();
    if let Err(e) = run(config).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let trials = codex_relay::run(config).await?;
    tracing::info!(trials, "Relay finished");
    Ok(())
}
