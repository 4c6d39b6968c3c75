//! Trial controller - sequences trials between the controller and the target.
//!
//! Flow per trial:
//! 1. Send `next` upstream, read the answer (`done` ends the run)
//! 2. On `reset`: spawn the target, start the output tee, accept its connection
//! 3. Forward upstream packets downstream up to and including a Flush
//! 4. Send `extend` upstream, forward downstream packets up to and including a Flush
//! 5. Tear down: close the target link, stop the tee, kill the target, close sinks
//!
//! Trials never overlap. Any error aborts the run; a trial that fails half-way
//! still kills its target because the process handle kills on drop.

use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::bridge::codec::read_packet;
use crate::bridge::protocol::{EXTEND, NEXT, Packet, WorkResponse};
use crate::bridge::transport::{PacketStream, RendezvousListener, connect_upstream};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::exec_dir::{ExecDir, TrialIndex};
use crate::spawner::{TargetSpawner, spawn_target};
use crate::tee::{OutputTee, Sink};

/// Line printed on stdout after every finished trial.
pub const COMPLETION_LINE: &str = "Finished a run";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    AwaitingWork,
    Running,
    ForwardingRequest,
    ExtendPhase,
    TearingDown,
    Done,
}

impl TrialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingWork => "awaiting_work",
            Self::Running => "running",
            Self::ForwardingRequest => "forwarding_request",
            Self::ExtendPhase => "extend_phase",
            Self::TearingDown => "tearing_down",
            Self::Done => "done",
        }
    }
}

/// Outcome of one `next` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialOutcome {
    Completed(TrialIndex),
    Done,
}

pub struct TrialController<U> {
    upstream: PacketStream<U>,
    listener: RendezvousListener,
    exec_dir: ExecDir,
    spawner: Arc<dyn TargetSpawner>,
    echo: bool,
    record: bool,
    next_trial: TrialIndex,
    state: TrialState,
    completions: Sink,
}

impl<U> TrialController<U>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        upstream: PacketStream<U>,
        listener: RendezvousListener,
        exec_dir: ExecDir,
        config: &RelayConfig,
    ) -> Self {
        Self {
            upstream,
            listener,
            exec_dir,
            spawner: Arc::clone(&config.spawner),
            echo: config.echo,
            record: config.record,
            next_trial: TrialIndex::default(),
            state: TrialState::AwaitingWork,
            completions: Box::new(tokio::io::stdout()),
        }
    }

    /// Where completion lines go. Defaults to stdout.
    pub fn with_completions(mut self, out: Sink) -> Self {
        self.completions = out;
        self
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    fn enter(&mut self, state: TrialState) {
        tracing::debug!(from = self.state.as_str(), to = state.as_str(), "Trial state");
        self.state = state;
    }

    /// Ask for work and, on `reset`, run one full trial.
    pub async fn next(&mut self) -> Result<TrialOutcome, RelayError> {
        self.enter(TrialState::AwaitingWork);
        self.upstream.send(Packet::payload(NEXT)).await?;
        let response = read_packet(&mut self.upstream).await?;

        match WorkResponse::parse(&response)? {
            WorkResponse::Done => {
                self.enter(TrialState::Done);
                Ok(TrialOutcome::Done)
            }
            WorkResponse::Reset => {
                let trial = self.next_trial;
                self.next_trial = trial.next();
                self.run_trial(trial).await?;
                self.enter(TrialState::AwaitingWork);
                Ok(TrialOutcome::Completed(trial))
            }
        }
    }

    /// Run trials until the controller has no more work. Returns the trial count.
    pub async fn run(mut self) -> Result<u64, RelayError> {
        let mut completed = 0;
        while let TrialOutcome::Completed(trial) = self.next().await? {
            completed += 1;
            tracing::info!(%trial, "Trial complete");
            self.completions
                .write_all(format!("{COMPLETION_LINE}\n").as_bytes())
                .await
                .map_err(RelayError::io("write completion line"))?;
            self.completions
                .flush()
                .await
                .map_err(RelayError::io("write completion line"))?;
        }

        tracing::info!(completed, "Controller has no more work");
        self.upstream.close().await?;
        Ok(completed)
    }

    async fn run_trial(&mut self, trial: TrialIndex) -> Result<(), RelayError> {
        self.enter(TrialState::Running);
        let artifacts = self.exec_dir.artifacts(trial, self.record);
        let env = artifacts.env_overlay(self.listener.path());

        let log = tokio::fs::File::create(&artifacts.log)
            .await
            .map_err(RelayError::io("create trial log"))?;
        let mut sinks: Vec<Sink> = Vec::with_capacity(2);
        if self.echo {
            sinks.push(Box::new(tokio::io::stdout()));
        }
        sinks.push(Box::new(log));

        let mut process = spawn_target(self.spawner.as_ref(), &env, self.exec_dir.root())?;
        tracing::info!(
            %trial,
            pid = ?process.pid(),
            log = %artifacts.log.display(),
            "Trial started"
        );

        let output = process.take_output().ok_or_else(|| {
            RelayError::Drain(std::io::Error::other("target output not captured"))
        })?;
        let mut tee = OutputTee::new(output, sinks)
            .map_err(RelayError::Drain)?
            .spawn();

        // A failing tee ends the trial at once, whichever link we are waiting on.
        let mut downstream = tee
            .guard(async {
                self.listener
                    .accept()
                    .await
                    .map_err(RelayError::io("accept target connection"))
            })
            .await?;
        tracing::debug!(%trial, "Target connected");

        self.enter(TrialState::ForwardingRequest);
        let forwarded = tee.guard(self.forward_request(&mut downstream)).await?;
        tracing::debug!(%trial, packets = forwarded, "Request forwarded");

        self.enter(TrialState::ExtendPhase);
        let returned = tee.guard(self.extend(&mut downstream)).await?;
        tracing::debug!(%trial, packets = returned, "Response relayed");

        self.enter(TrialState::TearingDown);
        drop(downstream);
        let tee = tee.stop().await?;
        process
            .terminate()
            .await
            .map_err(RelayError::io("terminate target"))?;
        tee.finish().await.map_err(RelayError::Drain)?;
        Ok(())
    }

    /// Upstream to downstream, through the first Flush. Returns packets relayed.
    async fn forward_request(
        &mut self,
        downstream: &mut PacketStream<UnixStream>,
    ) -> Result<usize, RelayError> {
        let mut relayed = 0;
        loop {
            let packet = read_packet(&mut self.upstream).await?;
            let is_flush = packet.is_flush();
            tracing::trace!(packet = %packet.describe(), "upstream -> target");
            downstream.feed(packet).await?;
            relayed += 1;
            if is_flush {
                downstream.flush().await?;
                return Ok(relayed);
            }
        }
    }

    /// Announce `extend`, then downstream to upstream through the target's Flush.
    async fn extend(
        &mut self,
        downstream: &mut PacketStream<UnixStream>,
    ) -> Result<usize, RelayError> {
        self.upstream.feed(Packet::payload(EXTEND)).await?;
        let mut relayed = 0;
        loop {
            let packet = read_packet(downstream).await?;
            let is_flush = packet.is_flush();
            tracing::trace!(packet = %packet.describe(), "target -> upstream");
            self.upstream.feed(packet).await?;
            relayed += 1;
            if is_flush {
                self.upstream.flush().await?;
                return Ok(relayed);
            }
        }
    }
}

/// Check preconditions, lay out the execution directory, connect both links and
/// run trials until the controller is done. Returns the number of trials run.
pub async fn run(config: RelayConfig) -> Result<u64, RelayError> {
    config.spawner.check_preconditions()?;

    let exec_dir = ExecDir::create(config.exec_dir.as_deref())
        .map_err(RelayError::io("create execution directory"))?;
    if config.purge_stale {
        exec_dir
            .purge_stale_artifacts()
            .map_err(RelayError::io("purge stale artifacts"))?;
    }

    let listener = RendezvousListener::bind(exec_dir.socket_path())
        .map_err(RelayError::io("bind rendezvous socket"))?;
    let upstream = connect_upstream(&config.upstream)
        .await
        .map_err(RelayError::io("connect to controller"))?;

    TrialController::new(upstream, listener, exec_dir, &config)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::process::Command;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::bridge::codec::{CodecError, PacketCodec, ProtocolError};
    use crate::spawner::{EmulatorSpawner, SpawnError};

    /// Runs a shell script as the target and counts spawns.
    struct ShellSpawner {
        script: &'static str,
        spawns: AtomicUsize,
    }

    impl ShellSpawner {
        fn new(script: &'static str) -> Arc<Self> {
            Arc::new(Self {
                script,
                spawns: AtomicUsize::new(0),
            })
        }
    }

    impl TargetSpawner for ShellSpawner {
        fn check_preconditions(&self) -> Result<(), SpawnError> {
            Ok(())
        }

        fn command(&self) -> Command {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(self.script);
            command
        }
    }

    struct Harness {
        controller: TrialController<DuplexStream>,
        upstream: PacketStream<DuplexStream>,
        exec_dir: ExecDir,
        _dir: tempfile::TempDir,
    }

    fn harness(spawner: Arc<ShellSpawner>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let exec_dir = ExecDir::create(Some(dir.path())).unwrap();
        let listener = RendezvousListener::bind(exec_dir.socket_path()).unwrap();
        let (relay_side, controller_side) = tokio::io::duplex(64 * 1024);
        let config = RelayConfig::new(spawner).with_echo(false);

        Harness {
            controller: TrialController::new(
                Framed::new(relay_side, PacketCodec::new()),
                listener,
                exec_dir.clone(),
                &config,
            ),
            upstream: Framed::new(controller_side, PacketCodec::new()),
            exec_dir,
            _dir: dir,
        }
    }

    async fn connect_target(path: PathBuf) -> PacketStream<UnixStream> {
        let stream = UnixStream::connect(path).await.unwrap();
        Framed::new(stream, PacketCodec::new())
    }

    async fn expect(stream: &mut PacketStream<impl AsyncRead + AsyncWrite + Unpin>, want: &str) {
        let got = read_packet(stream).await.unwrap();
        assert_eq!(got, Packet::payload(want.to_string()), "expected {want:?}");
    }

    async fn wait_for_file_containing(path: PathBuf, needle: &str) -> String {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(contents) = tokio::fs::read_to_string(&path).await
                    && contents.contains(needle)
                {
                    return contents;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn runs_one_trial_then_stops() {
        let spawner = ShellSpawner::new("echo \"booted sock=$CODEX_RELAY_SOCK\"; exec sleep 30");
        let Harness {
            mut controller,
            mut upstream,
            exec_dir,
            _dir,
        } = harness(Arc::clone(&spawner));
        let socket = exec_dir.socket_path();
        let log = exec_dir.artifacts(TrialIndex::new(0), false).log;

        let scripted = tokio::spawn(async move {
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("reset")).await.unwrap();
            upstream.feed(Packet::payload("abc")).await.unwrap();
            upstream.feed(Packet::payload("")).await.unwrap();
            upstream.feed(Packet::payload("def")).await.unwrap();
            upstream.send(Packet::Flush).await.unwrap();

            expect(&mut upstream, "extend").await;
            let mut returned = Vec::new();
            loop {
                let packet = read_packet(&mut upstream).await.unwrap();
                if packet.is_flush() {
                    break;
                }
                returned.push(packet);
            }

            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("done")).await.unwrap();
            returned
        });

        let target = tokio::spawn(async move {
            let mut conn = connect_target(socket.clone()).await;
            let mut request = Vec::new();
            loop {
                let packet = read_packet(&mut conn).await.unwrap();
                let done = packet.is_flush();
                request.push(packet);
                if done {
                    break;
                }
            }

            // Output must reach the trial log while the trial is running.
            let contents = wait_for_file_containing(log, "booted").await;
            assert!(contents.contains(&format!("sock={}", socket.display())));

            conn.feed(Packet::payload("r1")).await.unwrap();
            conn.feed(Packet::payload("r2")).await.unwrap();
            conn.send(Packet::Flush).await.unwrap();

            // The relay closes the target link during teardown.
            assert!(matches!(
                read_packet(&mut conn).await,
                Err(CodecError::Protocol(ProtocolError::UnexpectedEof))
            ));
            request
        });

        assert_eq!(
            controller.next().await.unwrap(),
            TrialOutcome::Completed(TrialIndex::new(0))
        );
        assert_eq!(controller.state(), TrialState::AwaitingWork);
        assert_eq!(controller.next().await.unwrap(), TrialOutcome::Done);
        assert_eq!(controller.state(), TrialState::Done);

        let request = target.await.unwrap();
        assert_eq!(
            request,
            vec![
                Packet::payload("abc"),
                Packet::payload(""),
                Packet::payload("def"),
                Packet::Flush,
            ]
        );
        let returned = scripted.await.unwrap();
        assert_eq!(returned, vec![Packet::payload("r1"), Packet::payload("r2")]);
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);

        let artifacts = exec_dir.artifacts(TrialIndex::new(0), false);
        assert!(artifacts.log.exists());
    }

    #[tokio::test]
    async fn trial_indices_advance_and_env_is_per_trial() {
        let spawner = ShellSpawner::new("echo \"panic=$CODEX_PANIC_FILE\"; exec sleep 30");
        let Harness {
            mut controller,
            mut upstream,
            exec_dir,
            _dir,
        } = harness(Arc::clone(&spawner));
        let socket = exec_dir.socket_path();
        let logs: Vec<_> = (0..2)
            .map(|i| exec_dir.artifacts(TrialIndex::new(i), false))
            .collect();

        let scripted = tokio::spawn(async move {
            for _ in 0..2 {
                expect(&mut upstream, "next").await;
                upstream.send(Packet::payload("reset")).await.unwrap();
                upstream.send(Packet::Flush).await.unwrap();
                expect(&mut upstream, "extend").await;
                assert_eq!(read_packet(&mut upstream).await.unwrap(), Packet::Flush);
            }
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("done")).await.unwrap();
        });

        let target_logs = logs.clone();
        let target = tokio::spawn(async move {
            for artifacts in target_logs {
                let mut conn = connect_target(socket.clone()).await;
                assert_eq!(read_packet(&mut conn).await.unwrap(), Packet::Flush);
                let needle = format!("panic={}", artifacts.panic.display());
                wait_for_file_containing(artifacts.log.clone(), &needle).await;
                conn.send(Packet::Flush).await.unwrap();
                assert!(read_packet(&mut conn).await.is_err());
            }
        });

        for i in 0..2 {
            assert_eq!(
                controller.next().await.unwrap(),
                TrialOutcome::Completed(TrialIndex::new(i))
            );
        }
        assert_eq!(controller.next().await.unwrap(), TrialOutcome::Done);

        scripted.await.unwrap();
        target.await.unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);
        assert_ne!(logs[0].log, logs[1].log);
        let first = std::fs::read_to_string(&logs[0].log).unwrap();
        assert!(!first.contains("panic.1"), "{first}");
    }

    #[tokio::test]
    async fn done_before_any_trial_spawns_nothing() {
        let spawner = ShellSpawner::new("exit 0");
        let Harness {
            controller,
            mut upstream,
            _dir,
            ..
        } = harness(Arc::clone(&spawner));

        let scripted = tokio::spawn(async move {
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("done")).await.unwrap();
            // Relay closes its side once done.
            assert!(read_packet(&mut upstream).await.is_err());
        });

        assert_eq!(controller.run().await.unwrap(), 0);
        scripted.await.unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unexpected_response_is_fatal() {
        let spawner = ShellSpawner::new("exit 0");
        let Harness {
            mut controller,
            mut upstream,
            _dir,
            ..
        } = harness(Arc::clone(&spawner));

        let scripted = tokio::spawn(async move {
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("restart")).await.unwrap();
            upstream
        });

        let err = controller.next().await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::UnexpectedResponse(_))
        ));
        insta::assert_snapshot!(format!("{:#}", anyhow::Error::from(err)), @r#"protocol error: unexpected response "restart""#);
        drop(scripted.await.unwrap());
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_closing_after_next_is_unexpected_eof() {
        let spawner = ShellSpawner::new("exit 0");
        let Harness {
            mut controller,
            mut upstream,
            _dir,
            ..
        } = harness(spawner);

        let scripted = tokio::spawn(async move {
            expect(&mut upstream, "next").await;
            drop(upstream);
        });

        let err = controller.next().await.unwrap_err();
        assert!(matches!(err.as_protocol(), Some(ProtocolError::UnexpectedEof)));
        scripted.await.unwrap();
    }

    #[tokio::test]
    async fn target_hanging_up_mid_trial_aborts_the_run() {
        let spawner = ShellSpawner::new("exec sleep 30");
        let Harness {
            mut controller,
            mut upstream,
            exec_dir,
            _dir,
        } = harness(spawner);
        let socket = exec_dir.socket_path();

        let scripted = tokio::spawn(async move {
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("reset")).await.unwrap();
            upstream.send(Packet::Flush).await.unwrap();
            // `extend` is buffered until the target's Flush, which never comes.
            upstream
        });

        let target = tokio::spawn(async move {
            let mut conn = connect_target(socket).await;
            assert_eq!(read_packet(&mut conn).await.unwrap(), Packet::Flush);
            // Half a frame, then hang up.
            conn.get_mut().write_all(b"0009ab").await.unwrap();
        });

        let err = controller.next().await.unwrap_err();
        assert!(matches!(err.as_protocol(), Some(ProtocolError::UnexpectedEof)));
        target.await.unwrap();
        drop(scripted.await.unwrap());
    }

    #[tokio::test]
    async fn run_prints_one_completion_line_per_trial() {
        let spawner = ShellSpawner::new("exec sleep 30");
        let Harness {
            controller,
            mut upstream,
            exec_dir,
            _dir,
        } = harness(Arc::clone(&spawner));
        let socket = exec_dir.socket_path();
        let (out, mut printed) = tokio::io::duplex(1024);

        let scripted = tokio::spawn(async move {
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("reset")).await.unwrap();
            upstream.send(Packet::Flush).await.unwrap();
            expect(&mut upstream, "extend").await;
            assert_eq!(read_packet(&mut upstream).await.unwrap(), Packet::Flush);
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("done")).await.unwrap();
            assert!(read_packet(&mut upstream).await.is_err());
        });

        let target = tokio::spawn(async move {
            let mut conn = connect_target(socket).await;
            assert_eq!(read_packet(&mut conn).await.unwrap(), Packet::Flush);
            conn.send(Packet::Flush).await.unwrap();
            assert!(read_packet(&mut conn).await.is_err());
        });

        let completed = controller
            .with_completions(Box::new(out))
            .run()
            .await
            .unwrap();
        assert_eq!(completed, 1);

        let mut lines = String::new();
        printed.read_to_string(&mut lines).await.unwrap();
        assert_eq!(lines, format!("{COMPLETION_LINE}\n"));

        scripted.await.unwrap();
        target.await.unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_target_fails_before_binding() {
        let dir = tempfile::tempdir().unwrap();
        let exec_dir = dir.path().join("exec");
        let spawner = EmulatorSpawner::new(dir.path().join("qemu"), dir.path().join("kernel"));
        let config = RelayConfig::new(Arc::new(spawner))
            .with_upstream(dir.path().join("controller.sock"))
            .with_exec_dir(Some(exec_dir.clone()));

        let err = run(config).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Spawn(SpawnError::Missing {
                what: "target binary",
                ..
            })
        ));
        assert!(!exec_dir.join("relay.sock").exists());
    }

    #[tokio::test]
    async fn failing_output_sink_aborts_while_waiting_for_the_target() {
        // The target floods its output and never dials back.
        let spawner = ShellSpawner::new("head -c 2000000 /dev/zero; exec sleep 30");
        let Harness {
            mut controller,
            mut upstream,
            exec_dir,
            _dir,
        } = harness(spawner);
        let log = exec_dir.artifacts(TrialIndex::new(0), false).log;
        std::os::unix::fs::symlink("/dev/full", &log).unwrap();

        let scripted = tokio::spawn(async move {
            expect(&mut upstream, "next").await;
            upstream.send(Packet::payload("reset")).await.unwrap();
            upstream
        });

        let err = tokio::time::timeout(Duration::from_secs(10), controller.next())
            .await
            .expect("relay kept waiting after its output sink failed")
            .unwrap_err();
        assert!(
            matches!(&err, RelayError::Drain(e) if e.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32)),
            "{err:?}"
        );
        drop(scripted.await.unwrap());
    }
}
