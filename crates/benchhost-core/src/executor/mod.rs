//! Runs one worker process end to end.
//!
//! The executor owns everything around a [`Broker`] session: spawning the
//! worker with redirected I/O, raising the host-side signals, capturing the
//! streams that do not carry the protocol, and making sure the worker is gone
//! afterwards (waiting for a natural exit first, killing it if it hangs).

pub mod process;

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerOutcome};
use crate::capture::ProcessOutputCapture;
use crate::config::HostConfig;
use crate::diagnoser::{BenchmarkCase, Diagnoser, DiagnoserContext, ResultSink};
use crate::protocol::{BAD_IMAGE_FORMAT_HINT, BAD_IMAGE_FORMAT_MARKER, HostSignal};
#[cfg(unix)]
use crate::transport::{CHANNEL_ENV, ChannelTransport, PipeTransport};

pub use process::{WatchedChild, WorkerStdio};

/// The program a worker runs, plus how to launch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.envs(self.env.iter().map(|(k, v)| (k, v)));
        command
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        if let Some(dir) = &self.working_dir {
            write!(f, " in {}", dir.display())?;
        }
        Ok(())
    }
}

/// Everything known about one worker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecuteResult {
    pub outcome: BrokerOutcome,
    /// `None` when the worker was terminated by a signal.
    pub exit_code: Option<i32>,
    pub process_id: u32,
    pub results: Vec<String>,
    pub prefixed_output: Vec<String>,
    /// Raw stdout; empty over pipes, where stdout carries the protocol.
    pub standard_output: Vec<String>,
    pub standard_error: Vec<String>,
    pub force_killed: bool,
}

impl ExecuteResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

pub struct Executor {
    config: HostConfig,
    diagnoser: Option<Arc<dyn Diagnoser>>,
    results_sink: Option<Arc<dyn ResultSink>>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            diagnoser: None,
            results_sink: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_diagnoser(mut self, diagnoser: Arc<dyn Diagnoser>) -> Self {
        self.diagnoser = Some(diagnoser);
        self
    }

    pub fn with_results_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.results_sink = Some(sink);
        self
    }

    /// Sessions end early with `EarlyProcessExit` once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Run `worker` speaking the protocol over its stdout/stdin.
    #[cfg(unix)]
    pub fn execute_pipe(&self, benchmark: &BenchmarkCase, worker: &WorkerCommand) -> Result<ExecuteResult> {
        let mut command = worker.command();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (child, stdio) = self.start(benchmark, worker, &mut command)?;
        let result = self.drive_pipe(benchmark, &child, stdio);
        self.finish(benchmark, &child, result)
    }

    /// Run `worker` speaking the protocol over a socket it connects back to.
    #[cfg(unix)]
    pub async fn execute_channel(
        &self,
        benchmark: &BenchmarkCase,
        worker: &WorkerCommand,
    ) -> Result<ExecuteResult> {
        let transport = ChannelTransport::bind_temp(self.config.connect_timeout)
            .context("failed to open the worker channel")?;

        let mut command = worker.command();
        command
            .env(CHANNEL_ENV, transport.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (child, stdio) = self.start(benchmark, worker, &mut command)?;
        let result = self.drive_channel(benchmark, &child, stdio, transport).await;
        self.finish(benchmark, &child, result)
    }

    fn start(
        &self,
        benchmark: &BenchmarkCase,
        worker: &WorkerCommand,
        command: &mut Command,
    ) -> Result<(WatchedChild, WorkerStdio)> {
        self.raise(HostSignal::BeforeProcessStart, benchmark, None);
        info!(benchmark = %benchmark.name, "Execute: {worker}");

        match WatchedChild::spawn(command, self.config.poll_interval) {
            Ok((child, stdio)) => {
                self.raise(HostSignal::AfterProcessStart, benchmark, Some(child.id()));
                Ok((child, stdio))
            }
            Err(e) => {
                self.raise(HostSignal::AfterProcessExit, benchmark, None);
                Err(e).with_context(|| format!("failed to start worker {}", worker.program.display()))
            }
        }
    }

    #[cfg(unix)]
    fn drive_pipe(
        &self,
        benchmark: &BenchmarkCase,
        child: &WatchedChild,
        stdio: WorkerStdio,
    ) -> Result<ExecuteResult> {
        let stdin = stdio.stdin.context("worker stdin is not redirected")?;
        let stdout = stdio.stdout.context("worker stdout is not redirected")?;
        let stderr = stdio.stderr.context("worker stderr is not redirected")?;

        let capture = ProcessOutputCapture::new(std::io::empty())
            .with_error(stderr)
            .log_output(true)
            .settle_timeout(self.config.stream_settle_timeout);
        capture.begin_read()?;

        let mut broker = self.broker(benchmark, child);
        let transport = PipeTransport::new(stdout, stdin, self.config.poll_interval);
        let outcome = broker.process_data(transport)?;

        let force_killed = self.settle(child, &capture)?;
        self.collect(broker, child, &capture, outcome, force_killed)
    }

    #[cfg(unix)]
    async fn drive_channel(
        &self,
        benchmark: &BenchmarkCase,
        child: &WatchedChild,
        stdio: WorkerStdio,
        transport: ChannelTransport,
    ) -> Result<ExecuteResult> {
        let stdout = stdio.stdout.context("worker stdout is not redirected")?;
        let stderr = stdio.stderr.context("worker stderr is not redirected")?;

        let capture = ProcessOutputCapture::new(stdout)
            .with_error(stderr)
            .log_output(true)
            .settle_timeout(self.config.stream_settle_timeout);
        capture.begin_read()?;

        let mut broker = self.broker(benchmark, child);
        let outcome = broker.process_data_async(transport).await?;

        let force_killed = match child.wait_timeout_async(self.config.process_exit_timeout).await {
            Some(_) => {
                capture.stop_read()?;
                false
            }
            None => {
                warn!(pid = child.id(), "worker did not quit on time, killing it");
                child.terminate();
                if child
                    .wait_timeout_async(self.config.stream_settle_timeout)
                    .await
                    .is_none()
                {
                    child.force_kill();
                }
                capture.cancel_read()?;
                true
            }
        };
        self.collect(broker, child, &capture, outcome, force_killed)
    }

    fn broker(&self, benchmark: &BenchmarkCase, child: &WatchedChild) -> Broker {
        let mut builder = Broker::builder(benchmark.clone())
            .process(child.id(), child.exit().clone())
            .cancel_with(&self.cancel);
        if let Some(diagnoser) = &self.diagnoser {
            builder = builder.diagnoser(Arc::clone(diagnoser));
        }
        if let Some(sink) = &self.results_sink {
            builder = builder.results_sink(Arc::clone(sink));
        }
        builder.build()
    }

    /// Wait for a natural exit, killing the worker if it hangs. Returns
    /// whether a kill was needed.
    fn settle(&self, child: &WatchedChild, capture: &ProcessOutputCapture) -> Result<bool> {
        if child.wait_timeout(self.config.process_exit_timeout).is_some() {
            capture.stop_read()?;
            return Ok(false);
        }
        warn!(pid = child.id(), "worker did not quit on time, killing it");
        child.terminate();
        if child.wait_timeout(self.config.stream_settle_timeout).is_none() {
            child.force_kill();
        }
        capture.cancel_read()?;
        Ok(true)
    }

    fn collect(
        &self,
        broker: Broker,
        child: &WatchedChild,
        capture: &ProcessOutputCapture,
        outcome: BrokerOutcome,
        force_killed: bool,
    ) -> Result<ExecuteResult> {
        let output = broker.into_output()?;
        let standard_output = capture.output_lines()?;
        let standard_error = capture.error_lines()?;

        if !outcome.is_success()
            && standard_output
                .iter()
                .chain(&standard_error)
                .any(|line| line.contains(BAD_IMAGE_FORMAT_MARKER))
        {
            warn!(pid = child.id(), "{BAD_IMAGE_FORMAT_HINT}");
        }

        Ok(ExecuteResult {
            outcome,
            exit_code: child.exit_code(),
            process_id: child.id(),
            results: output.results,
            prefixed_output: output.prefixed_output,
            standard_output,
            standard_error,
            force_killed,
        })
    }

    /// Always raises `AfterProcessExit` and never leaves the worker running.
    fn finish(
        &self,
        benchmark: &BenchmarkCase,
        child: &WatchedChild,
        result: Result<ExecuteResult>,
    ) -> Result<ExecuteResult> {
        if result.is_err() && child.status().is_none() {
            child.force_kill();
        }
        self.raise(HostSignal::AfterProcessExit, benchmark, None);
        if let Ok(result) = &result {
            info!(
                benchmark = %benchmark.name,
                outcome = %result.outcome,
                exit_code = ?result.exit_code,
                results = result.results.len(),
                "worker finished"
            );
        }
        result
    }

    fn raise(&self, signal: HostSignal, benchmark: &BenchmarkCase, process_id: Option<u32>) {
        if let Some(diagnoser) = &self.diagnoser {
            let context = DiagnoserContext {
                process_id,
                benchmark: benchmark.clone(),
            };
            diagnoser.handle(signal, &context);
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("diagnoser", &self.diagnoser.as_ref().map(|d| d.name().to_owned()))
            .field("has_results_sink", &self.results_sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_display_is_the_execute_line() {
        let worker = WorkerCommand::new("/usr/bin/worker")
            .args(["--benchmark", "3"])
            .working_dir("/tmp/run");
        assert_eq!(worker.to_string(), "/usr/bin/worker --benchmark 3 in /tmp/run");
    }

    #[test]
    fn command_carries_env_and_args() {
        let worker = WorkerCommand::new("sh").arg("-c").arg("x").env("K", "V");
        let command = worker.command();
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-c", "x"]);
        let envs: Vec<(String, Option<String>)> = command
            .get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.map(|v| v.to_string_lossy().into_owned()),
                )
            })
            .collect();
        assert_eq!(envs, vec![("K".to_owned(), Some("V".to_owned()))]);
    }

    #[test]
    fn missing_program_fails_but_raises_exit_signal() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Signals(Mutex<Vec<HostSignal>>);
        impl Diagnoser for Signals {
            fn name(&self) -> &str {
                "signals"
            }
            fn handle(&self, signal: HostSignal, _context: &DiagnoserContext) {
                self.0.lock().unwrap().push(signal);
            }
        }

        let signals = Arc::new(Signals::default());
        let executor = Executor::new(HostConfig::default()).with_diagnoser(signals.clone());
        let err = executor
            .execute_pipe(
                &BenchmarkCase::new(0, "x"),
                &WorkerCommand::new("/nonexistent/benchhost-worker"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("failed to start worker"));
        assert_eq!(
            signals.0.lock().unwrap().as_slice(),
            &[HostSignal::BeforeProcessStart, HostSignal::AfterProcessExit]
        );
    }

    #[test]
    fn result_serializes_for_reports() {
        let result = ExecuteResult {
            outcome: BrokerOutcome::EndOfStream,
            exit_code: Some(1),
            process_id: 42,
            results: vec!["1".into()],
            prefixed_output: Vec::new(),
            standard_output: Vec::new(),
            standard_error: vec!["boom".into()],
            force_killed: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "EndOfStream");
        assert_eq!(json["exit_code"], 1);
        assert_eq!(json["standard_error"][0], "boom");
    }
}
