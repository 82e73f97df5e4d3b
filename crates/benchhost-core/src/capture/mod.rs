//! Background capture of a worker's standard streams.
//!
//! One reader thread per stream appends non-empty lines to an append-only
//! queue. The queues are only handed out once the capture was stopped, so
//! callers always see a settled snapshot.

use std::io::{self, BufRead, BufReader, Read};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::transport::decode_line;

struct CaptureState;
impl CaptureState {
    const CREATED: u8 = 0;
    const STARTED: u8 = 1;
    const STOPPING: u8 = 2;
    const STOPPED: u8 = 3;
    const DISPOSED: u8 = 4;
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("worker {0} is not redirected")]
    NotRedirected(&'static str),

    #[error("output capture can be started only once")]
    AlreadyStarted,

    #[error("only a started output capture can be stopped")]
    NotStarted,

    #[error("output capture must be stopped before its lines are read")]
    NotStopped,

    #[error("failed to start the {stream} reader: {source}")]
    Spawn {
        stream: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Output,
    Error,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Output => "stdout",
            Stream::Error => "stderr",
        }
    }
}

#[derive(Default)]
struct LineQueue {
    lines: Mutex<Vec<String>>,
    detached: AtomicBool,
}

impl LineQueue {
    fn push(&self, line: String) -> bool {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if self.detached.load(Ordering::Acquire) {
            return false;
        }
        lines.push(line);
        true
    }

    /// After this returns no further line is appended.
    fn detach(&self) {
        let _lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        self.detached.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

type Source = Box<dyn Read + Send>;

/// Captures stdout (and optionally stderr) of a worker process.
pub struct ProcessOutputCapture {
    state: AtomicU8,
    output: Arc<LineQueue>,
    error: Arc<LineQueue>,
    sources: Mutex<Vec<(Stream, Source)>>,
    completions: Mutex<Vec<(Stream, Receiver<()>)>>,
    log_output: bool,
    settle_timeout: Duration,
}

impl ProcessOutputCapture {
    pub fn new(output: impl Read + Send + 'static) -> Self {
        Self {
            state: AtomicU8::new(CaptureState::CREATED),
            output: Arc::default(),
            error: Arc::default(),
            sources: Mutex::new(vec![(Stream::Output, Box::new(output) as Source)]),
            completions: Mutex::new(Vec::new()),
            log_output: false,
            settle_timeout: HostConfig::DEFAULT_STREAM_SETTLE_TIMEOUT,
        }
    }

    /// Take the piped stdout (and stderr, if `read_error`) of `child`.
    pub fn from_child(child: &mut Child, read_error: bool) -> Result<Self, CaptureError> {
        let stdout = child
            .stdout
            .take()
            .ok_or(CaptureError::NotRedirected("stdout"))?;
        let capture = Self::new(stdout);
        if !read_error {
            return Ok(capture);
        }
        let stderr = child
            .stderr
            .take()
            .ok_or(CaptureError::NotRedirected("stderr"))?;
        Ok(capture.with_error(stderr))
    }

    pub fn with_error(self, error: impl Read + Send + 'static) -> Self {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Stream::Error, Box::new(error)));
        self
    }

    /// Echo every captured line to the log as it arrives.
    pub fn log_output(mut self, enabled: bool) -> Self {
        self.log_output = enabled;
        self
    }

    pub fn settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub fn begin_read(&self) -> Result<(), CaptureError> {
        self.begin_read_with(|name, body| thread::Builder::new().name(name).spawn(body).map(drop))
    }

    /// Start one reader per source through `spawn`. If a reader cannot be
    /// started the capture ends up disposed and the readers already running
    /// are detached.
    fn begin_read_with<S>(&self, mut spawn: S) -> Result<(), CaptureError>
    where
        S: FnMut(String, Box<dyn FnOnce() + Send>) -> io::Result<()>,
    {
        self.transition(CaptureState::CREATED, CaptureState::STARTED)
            .map_err(|_| CaptureError::AlreadyStarted)?;

        let sources = std::mem::take(
            &mut *self
                .sources
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut completions = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (stream, source) in sources {
            let queue = Arc::clone(self.queue(stream));
            let (done_tx, done_rx) = mpsc::channel();
            let log_output = self.log_output;
            let body = Box::new(move || pump(source, stream, &queue, log_output, done_tx));
            if let Err(source) = spawn(format!("benchhost-{}", stream.name()), body) {
                completions.clear();
                self.output.detach();
                self.error.detach();
                self.state.store(CaptureState::DISPOSED, Ordering::Release);
                return Err(CaptureError::Spawn {
                    stream: stream.name(),
                    source,
                });
            }
            completions.push((stream, done_rx));
        }
        Ok(())
    }

    /// Wait (bounded per stream) for the readers to drain, then detach.
    pub fn stop_read(&self) -> Result<(), CaptureError> {
        self.transition(CaptureState::STARTED, CaptureState::STOPPING)
            .map_err(|_| CaptureError::NotStarted)?;

        let completions = std::mem::take(
            &mut *self
                .completions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (stream, done) in completions {
            match done.recv_timeout(self.settle_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => warn!(
                    stream = stream.name(),
                    timeout_ms = self.settle_timeout.as_millis() as u64,
                    "captured stream did not settle in time"
                ),
            }
        }
        self.finish_stop();
        Ok(())
    }

    /// Stop without waiting for the streams to drain.
    pub fn cancel_read(&self) -> Result<(), CaptureError> {
        self.transition(CaptureState::STARTED, CaptureState::STOPPING)
            .map_err(|_| CaptureError::NotStarted)?;
        self.finish_stop();
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == CaptureState::STOPPED
    }

    pub fn output_lines(&self) -> Result<Vec<String>, CaptureError> {
        self.if_stopped(|| self.output.snapshot())
    }

    pub fn error_lines(&self) -> Result<Vec<String>, CaptureError> {
        self.if_stopped(|| self.error.snapshot())
    }

    pub fn output_and_error_lines(&self) -> Result<Vec<String>, CaptureError> {
        self.if_stopped(|| {
            let mut lines = self.output.snapshot();
            lines.extend(self.error.snapshot());
            lines
        })
    }

    pub fn output_text(&self) -> Result<String, CaptureError> {
        self.if_stopped(|| self.output.snapshot().join("\n"))
    }

    pub fn error_text(&self) -> Result<String, CaptureError> {
        self.if_stopped(|| self.error.snapshot().join("\n"))
    }

    fn queue(&self, stream: Stream) -> &Arc<LineQueue> {
        match stream {
            Stream::Output => &self.output,
            Stream::Error => &self.error,
        }
    }

    fn transition(&self, from: u8, to: u8) -> Result<(), u8> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    fn finish_stop(&self) {
        self.output.detach();
        self.error.detach();
        self.state.store(CaptureState::STOPPED, Ordering::Release);
    }

    fn if_stopped<T>(&self, read: impl FnOnce() -> T) -> Result<T, CaptureError> {
        if self.is_stopped() {
            Ok(read())
        } else {
            Err(CaptureError::NotStopped)
        }
    }
}

impl Drop for ProcessOutputCapture {
    fn drop(&mut self) {
        self.state.store(CaptureState::DISPOSED, Ordering::Release);
        self.output.detach();
        self.error.detach();
    }
}

impl std::fmt::Debug for ProcessOutputCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOutputCapture")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("log_output", &self.log_output)
            .field("settle_timeout", &self.settle_timeout)
            .finish_non_exhaustive()
    }
}

/// Reader thread body. Keeps draining after detach so the worker never
/// blocks on a full pipe.
fn pump(source: Source, stream: Stream, queue: &LineQueue, log_output: bool, done: Sender<()>) {
    let mut reader = BufReader::new(source);
    loop {
        let mut bytes = Vec::new();
        match reader.read_until(b'\n', &mut bytes) {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(bytes);
                if line.is_empty() {
                    continue;
                }
                if log_output {
                    match stream {
                        Stream::Output => info!(target: "benchhost::worker", "{line}"),
                        Stream::Error => warn!(target: "benchhost::worker", "{line}"),
                    }
                }
                queue.push(line);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(stream = stream.name(), error = %e, "captured stream failed");
                break;
            }
        }
    }
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    fn cursor(text: &str) -> Cursor<Vec<u8>> {
        Cursor::new(text.as_bytes().to_vec())
    }

    /// Never produces data within a test's lifetime.
    struct Stall;

    impl Read for Stall {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_secs(30));
            Ok(0)
        }
    }

    #[test]
    fn captures_non_empty_lines_of_both_streams() {
        let capture = ProcessOutputCapture::new(cursor("a\n\nb\r\n"))
            .with_error(cursor("oops\n"));
        capture.begin_read().unwrap();
        capture.stop_read().unwrap();

        assert_eq!(capture.output_lines().unwrap(), vec!["a", "b"]);
        assert_eq!(capture.error_lines().unwrap(), vec!["oops"]);
        assert_eq!(
            capture.output_and_error_lines().unwrap(),
            vec!["a", "b", "oops"]
        );
        assert_eq!(capture.output_text().unwrap(), "a\nb");
        assert_eq!(capture.error_text().unwrap(), "oops");
    }

    #[test]
    fn reading_before_stop_is_rejected() {
        let capture = ProcessOutputCapture::new(cursor("a\n"));
        assert!(matches!(capture.output_lines(), Err(CaptureError::NotStopped)));
        capture.begin_read().unwrap();
        assert!(matches!(capture.output_text(), Err(CaptureError::NotStopped)));
    }

    #[test]
    fn lifecycle_misuse_is_reported() {
        let capture = ProcessOutputCapture::new(cursor(""));
        assert!(matches!(capture.stop_read(), Err(CaptureError::NotStarted)));
        capture.begin_read().unwrap();
        assert!(matches!(capture.begin_read(), Err(CaptureError::AlreadyStarted)));
        capture.stop_read().unwrap();
        assert!(matches!(capture.stop_read(), Err(CaptureError::NotStarted)));
        assert!(matches!(capture.cancel_read(), Err(CaptureError::NotStarted)));
    }

    #[test]
    fn stop_is_bounded_by_the_settle_timeout() {
        let capture = ProcessOutputCapture::new(Stall).settle_timeout(Duration::from_millis(50));
        capture.begin_read().unwrap();

        let started = Instant::now();
        capture.stop_read().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(capture.output_lines().unwrap().is_empty());
    }

    #[test]
    fn cancel_stops_without_waiting() {
        let capture = ProcessOutputCapture::new(Stall);
        capture.begin_read().unwrap();

        let started = Instant::now();
        capture.cancel_read().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(capture.is_stopped());
    }

    #[test]
    fn child_streams_must_be_redirected() {
        let mut child = std::process::Command::new("true")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let err = ProcessOutputCapture::from_child(&mut child, true).unwrap_err();
        assert!(matches!(err, CaptureError::NotRedirected("stderr")));
        child.wait().unwrap();
    }

    #[test]
    fn captures_a_real_child() {
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("echo out; echo err >&2")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let capture = ProcessOutputCapture::from_child(&mut child, true).unwrap();
        capture.begin_read().unwrap();
        child.wait().unwrap();
        capture.stop_read().unwrap();

        assert_eq!(capture.output_lines().unwrap(), vec!["out"]);
        assert_eq!(capture.error_lines().unwrap(), vec!["err"]);
    }

    #[test]
    fn failed_reader_start_leaves_a_terminal_capture() {
        let capture = ProcessOutputCapture::new(cursor("out\n")).with_error(cursor("err\n"));
        let mut started = Vec::new();
        let result = capture.begin_read_with(|name, body| {
            if name.ends_with("stderr") {
                return Err(io::Error::other("no threads left"));
            }
            started.push(thread::spawn(body));
            Ok(())
        });

        assert!(matches!(
            result,
            Err(CaptureError::Spawn { stream: "stderr", .. })
        ));
        for reader in started {
            reader.join().unwrap();
        }
        assert!(!capture.is_stopped());
        assert!(matches!(capture.stop_read(), Err(CaptureError::NotStarted)));
        assert!(matches!(capture.begin_read(), Err(CaptureError::AlreadyStarted)));
        assert!(matches!(capture.output_lines(), Err(CaptureError::NotStopped)));
    }

    #[test]
    fn detached_queue_rejects_late_lines() {
        let queue = LineQueue::default();
        assert!(queue.push("kept".to_owned()));
        queue.detach();
        assert!(!queue.push("late".to_owned()));
        assert_eq!(queue.snapshot(), vec!["kept"]);
    }
}
