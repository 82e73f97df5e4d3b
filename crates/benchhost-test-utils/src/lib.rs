//! Shared test utilities for benchhost integration tests.
//!
//! - [`RecordingDiagnoser`]: a diagnoser and result sink that remembers
//!   everything it was handed.
//! - [`Transcript`]: builds worker output line by line, as a memory transport
//!   or as a `/bin/sh` worker that waits for each acknowledgment.
//! - [`write_worker_script`]: drops an executable script into a temp dir.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use benchhost_core::diagnoser::{
    BenchmarkCase, Diagnoser, DiagnoserContext, DiagnoserError, ResultSink,
};
use benchhost_core::protocol::{HEADER_KEY, HostSignal, RESULTS_KEY};
use benchhost_core::transport::MemoryTransport;

/// A payload delivered to [`RecordingDiagnoser`] as a result sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPayload {
    pub diagnoser_index: usize,
    pub benchmark: BenchmarkCase,
    pub payload: String,
}

/// Records signals and payloads. Accepts payloads for indices below the
/// configured diagnoser count and rejects the rest as unknown.
#[derive(Debug)]
pub struct RecordingDiagnoser {
    diagnoser_count: usize,
    signals: Mutex<Vec<(HostSignal, Option<u32>)>>,
    payloads: Mutex<Vec<RecordedPayload>>,
}

impl Default for RecordingDiagnoser {
    fn default() -> Self {
        Self::with_diagnosers(1)
    }
}

impl RecordingDiagnoser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diagnosers(diagnoser_count: usize) -> Self {
        Self {
            diagnoser_count,
            signals: Mutex::new(Vec::new()),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn signals(&self) -> Vec<HostSignal> {
        self.signals.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    /// Signals paired with the process id they were raised with.
    pub fn signals_with_pid(&self) -> Vec<(HostSignal, Option<u32>)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<RecordedPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

impl Diagnoser for RecordingDiagnoser {
    fn name(&self) -> &str {
        "recording"
    }

    fn handle(&self, signal: HostSignal, context: &DiagnoserContext) {
        self.signals
            .lock()
            .unwrap()
            .push((signal, context.process_id));
    }
}

impl ResultSink for RecordingDiagnoser {
    fn deserialize_results(
        &self,
        diagnoser_index: usize,
        benchmark: &BenchmarkCase,
        payload: &str,
    ) -> Result<(), DiagnoserError> {
        if diagnoser_index >= self.diagnoser_count {
            return Err(DiagnoserError::UnknownIndex {
                index: diagnoser_index,
                count: self.diagnoser_count,
            });
        }
        self.payloads.lock().unwrap().push(RecordedPayload {
            diagnoser_index,
            benchmark: benchmark.clone(),
            payload: payload.to_owned(),
        });
        Ok(())
    }
}

/// Worker output under construction.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical run: all four wire signals around `measurements`.
    pub fn full_run(measurements: &[&str]) -> Self {
        let mut transcript = Self::new()
            .signal(HostSignal::BeforeAnythingElse)
            .signal(HostSignal::BeforeActualRun);
        for m in measurements {
            transcript = transcript.line(*m);
        }
        transcript
            .signal(HostSignal::AfterActualRun)
            .signal(HostSignal::AfterAll)
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    /// The wire token of `signal`. Panics for host-side signals.
    pub fn signal(self, signal: HostSignal) -> Self {
        let token = signal
            .token()
            .unwrap_or_else(|| panic!("{signal} has no wire token"));
        self.line(token)
    }

    /// A header followed by one body line per entry of `body`.
    pub fn diagnoser_results(mut self, diagnoser_index: usize, body: &[&str]) -> Self {
        self.lines
            .push(format!("{HEADER_KEY} {diagnoser_index} {}", body.len()));
        for fragment in body {
            self.lines.push(format!("{RESULTS_KEY} {fragment}"));
        }
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Newline-terminated text, as a worker would print it.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    pub fn memory_transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.lines.iter().cloned())
    }

    /// A `/bin/sh` body that prints the transcript over stdout and blocks
    /// on stdin for the acknowledgment after every signal line.
    pub fn pipe_worker_script(&self) -> String {
        let mut script = String::new();
        for line in &self.lines {
            script.push_str(&format!("printf '%s\\n' {}\n", sh_quote(line)));
            if is_signal(line) {
                script.push_str("read ack || exit 3\n");
                script.push_str("[ \"$ack\" = Acknowledgment ] || exit 4\n");
            }
        }
        script
    }
}

fn is_signal(line: &str) -> bool {
    HostSignal::WIRE.iter().any(|s| s.token() == Some(line))
}

/// Single-quote `text` for `/bin/sh`.
pub fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Write an executable `#!/bin/sh` script named `name` into `dir`.
pub fn write_worker_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    path
}

/// A fresh temp dir holding one worker script. Keep the [`tempfile::TempDir`]
/// alive for as long as the script is used.
pub fn worker_script(body: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_worker_script(dir.path(), "worker.sh", body);
    (dir, path)
}
