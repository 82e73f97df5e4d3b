//! Transport-independent protocol handling for one worker session.
//!
//! [`Session::on_line`] consumes lines in arrival order and tells the driver
//! what to do next. It never touches I/O, which keeps the sync and async
//! drivers in [`super`] down to a read/ack loop.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::diagnoser::{BenchmarkCase, Diagnoser, DiagnoserContext, DiagnoserError, ResultSink};
use crate::protocol::{
    BAD_IMAGE_FORMAT_HINT, BAD_IMAGE_FORMAT_MARKER, FramingError, HostSignal, LineKind,
    ResultAggregator, classify,
};

/// Everything the worker emitted besides protocol control traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectedOutput {
    /// Measurement records, in emission order.
    pub results: Vec<String>,
    /// Unrecognized marker-prefixed lines, verbatim.
    pub prefixed_output: Vec<String>,
}

/// What the driver must do after a line was consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Write the acknowledgment; stop with success afterwards if `terminal`.
    Acknowledge { terminal: bool },
    /// The stream broke framing; the session ends with `InvalidData`.
    Violation(FramingError),
}

pub struct Session {
    benchmark: BenchmarkCase,
    process_id: Option<u32>,
    diagnoser: Option<Arc<dyn Diagnoser>>,
    results_sink: Option<Arc<dyn ResultSink>>,
    aggregator: ResultAggregator,
    output: CollectedOutput,
    hinted_architecture: bool,
}

impl Session {
    pub fn new(
        benchmark: BenchmarkCase,
        process_id: Option<u32>,
        diagnoser: Option<Arc<dyn Diagnoser>>,
        results_sink: Option<Arc<dyn ResultSink>>,
    ) -> Self {
        Self {
            benchmark,
            process_id,
            diagnoser,
            results_sink,
            aggregator: ResultAggregator::new(),
            output: CollectedOutput::default(),
            hinted_architecture: false,
        }
    }

    pub fn context(&self) -> DiagnoserContext {
        DiagnoserContext {
            process_id: self.process_id,
            benchmark: self.benchmark.clone(),
        }
    }

    pub fn benchmark(&self) -> &BenchmarkCase {
        &self.benchmark
    }

    pub fn output(&self) -> &CollectedOutput {
        &self.output
    }

    pub fn take_output(&mut self) -> CollectedOutput {
        std::mem::take(&mut self.output)
    }

    /// Whether the wrong-architecture hint was logged for this session.
    pub fn architecture_hinted(&self) -> bool {
        self.hinted_architecture
    }

    pub fn on_line(&mut self, line: String) -> Step {
        let kind = match classify(&line, self.aggregator.framing_state()) {
            Ok(kind) => kind,
            Err(e) => return Step::Violation(e),
        };

        match kind {
            LineKind::MeasurementRecord => {
                self.check_architecture(&line);
                debug!(target: "benchhost::worker", "{line}");
                self.output.results.push(line);
                Step::Continue
            }
            LineKind::ExtraOutput => {
                self.check_architecture(&line);
                info!(target: "benchhost::worker", "{line}");
                self.output.prefixed_output.push(line);
                Step::Continue
            }
            LineKind::LifecycleSignal(signal) => {
                self.dispatch(signal);
                Step::Acknowledge {
                    terminal: signal.is_terminal(),
                }
            }
            LineKind::DiagnoserResultHeader(header) => {
                if let Err(e) = self.aggregator.begin_block(header) {
                    return Step::Violation(e);
                }
                self.flush_completed()
            }
            LineKind::DiagnoserResultBody(fragment) => {
                if let Err(e) = self.aggregator.feed(fragment) {
                    return Step::Violation(e);
                }
                self.flush_completed()
            }
        }
    }

    /// Drop a block cut short by the end of the session.
    pub fn finish(&mut self) {
        if let Some(header) = self.aggregator.discard() {
            debug!(
                diagnoser_index = header.diagnoser_index,
                line_count = header.line_count,
                "discarding incomplete diagnoser results"
            );
        }
    }

    fn dispatch(&self, signal: HostSignal) {
        if let Some(diagnoser) = &self.diagnoser {
            diagnoser.handle(signal, &self.context());
        }
    }

    fn flush_completed(&mut self) -> Step {
        match self
            .aggregator
            .flush(&self.benchmark, self.results_sink.as_deref())
        {
            Ok(_) => Step::Continue,
            Err(DiagnoserError::UnknownIndex { index, count }) => {
                Step::Violation(FramingError::UnknownDiagnoser { index, count })
            }
            Err(e @ DiagnoserError::RejectedPayload { .. }) => {
                warn!(benchmark = %self.benchmark.name, error = %e, "dropping diagnoser results");
                Step::Continue
            }
        }
    }

    fn check_architecture(&mut self, line: &str) {
        if !self.hinted_architecture && line.contains(BAD_IMAGE_FORMAT_MARKER) {
            self.hinted_architecture = true;
            warn!(benchmark = %self.benchmark.name, "{BAD_IMAGE_FORMAT_HINT}");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("benchmark", &self.benchmark)
            .field("process_id", &self.process_id)
            .field("diagnoser", &self.diagnoser.as_ref().map(|d| d.name().to_owned()))
            .field("has_results_sink", &self.results_sink.is_some())
            .field("framing", &self.aggregator.framing_state())
            .field("output", &self.output)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        signals: Mutex<Vec<HostSignal>>,
        payloads: Mutex<Vec<(usize, String)>>,
    }

    impl Diagnoser for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle(&self, signal: HostSignal, context: &DiagnoserContext) {
            assert_eq!(context.process_id, Some(99));
            self.signals.lock().unwrap().push(signal);
        }
    }

    impl ResultSink for Recorder {
        fn deserialize_results(
            &self,
            diagnoser_index: usize,
            benchmark: &BenchmarkCase,
            payload: &str,
        ) -> Result<(), DiagnoserError> {
            match diagnoser_index {
                0 | 1 => {
                    assert_eq!(benchmark.name, "Demo.Run");
                    self.payloads
                        .lock()
                        .unwrap()
                        .push((diagnoser_index, payload.to_owned()));
                    Ok(())
                }
                2 => Err(DiagnoserError::RejectedPayload {
                    diagnoser: "picky".to_owned(),
                    reason: "bad format".to_owned(),
                }),
                index => Err(DiagnoserError::UnknownIndex { index, count: 3 }),
            }
        }
    }

    fn session() -> (Session, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(
            BenchmarkCase::new(1, "Demo.Run"),
            Some(99),
            Some(recorder.clone()),
            Some(recorder.clone()),
        );
        (session, recorder)
    }

    fn feed(session: &mut Session, lines: &[&str]) -> Vec<Step> {
        lines.iter().map(|l| session.on_line((*l).to_owned())).collect()
    }

    #[test]
    fn signals_are_dispatched_and_acknowledged() {
        let (mut s, rec) = session();
        let steps = feed(&mut s, &["// BeforeActualRun", "// AfterAll"]);
        assert_eq!(
            steps,
            vec![
                Step::Acknowledge { terminal: false },
                Step::Acknowledge { terminal: true },
            ]
        );
        assert_eq!(
            rec.signals.lock().unwrap().as_slice(),
            &[HostSignal::BeforeActualRun, HostSignal::AfterAll]
        );
    }

    #[test]
    fn output_is_split_by_kind() {
        let (mut s, _) = session();
        feed(&mut s, &["42", "// Benchmark: Demo.Run", "43"]);
        assert_eq!(s.output().results, vec!["42", "43"]);
        assert_eq!(s.output().prefixed_output, vec!["// Benchmark: Demo.Run"]);
    }

    #[test]
    fn completed_block_reaches_sink() {
        let (mut s, rec) = session();
        let steps = feed(
            &mut s,
            &[
                "// InProcessDiagnoser 0 2",
                "// InProcessDiagnoserResults a",
                "// InProcessDiagnoserResults b",
                "// InProcessDiagnoser 1 0",
            ],
        );
        assert!(steps.iter().all(|s| *s == Step::Continue));
        assert_eq!(
            rec.payloads.lock().unwrap().as_slice(),
            &[(0, "a\nb".to_owned()), (1, String::new())]
        );
        assert!(s.output().results.is_empty());
    }

    #[test]
    fn unknown_index_is_a_violation() {
        let (mut s, _) = session();
        let steps = feed(&mut s, &["// InProcessDiagnoser 7 1", "// InProcessDiagnoserResults x"]);
        assert_eq!(
            steps[1],
            Step::Violation(FramingError::UnknownDiagnoser { index: 7, count: 3 })
        );
    }

    #[test]
    fn rejected_payload_does_not_end_the_session() {
        let (mut s, _) = session();
        let steps = feed(&mut s, &["// InProcessDiagnoser 2 1", "// InProcessDiagnoserResults x"]);
        assert_eq!(steps[1], Step::Continue);
        assert_eq!(s.on_line("// AfterAll".to_owned()), Step::Acknowledge { terminal: true });
    }

    #[test]
    fn missing_body_marker_is_a_violation() {
        let (mut s, _) = session();
        let steps = feed(&mut s, &["// InProcessDiagnoser 0 2", "oops"]);
        assert!(matches!(steps[1], Step::Violation(FramingError::MissingBodyMarker { .. })));
    }

    #[test]
    fn without_collaborators_signals_are_still_acknowledged() {
        let mut s = Session::new(BenchmarkCase::new(0, "x"), None, None, None);
        assert_eq!(
            s.on_line("// BeforeAnythingElse".to_owned()),
            Step::Acknowledge { terminal: false }
        );
        assert_eq!(s.on_line("// InProcessDiagnoser 0 0".to_owned()), Step::Continue);
    }

    #[test]
    fn finish_discards_partial_block() {
        let (mut s, rec) = session();
        feed(&mut s, &["// InProcessDiagnoser 0 3", "// InProcessDiagnoserResults a"]);
        s.finish();
        assert!(rec.payloads.lock().unwrap().is_empty());
        // framing is reset
        assert_eq!(s.on_line("42".to_owned()), Step::Continue);
    }

    #[test]
    fn take_output_leaves_empty_collection() {
        let (mut s, _) = session();
        feed(&mut s, &["1", "2"]);
        let out = s.take_output();
        assert_eq!(out.results, vec!["1", "2"]);
        assert!(s.output().results.is_empty());
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn architecture_hint_is_logged_once_and_lines_kept() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let (mut s, _) = session();
        let lines = [
            "Unhandled exception. System.BadImageFormatException: bad image",
            "// BadImageFormatException again",
            "42",
        ];
        assert!(!s.architecture_hinted());
        tracing::subscriber::with_default(subscriber, || {
            feed(&mut s, &lines);
        });

        assert!(s.architecture_hinted());
        assert_eq!(s.output().results, vec![lines[0], lines[2]]);
        assert_eq!(s.output().prefixed_output, vec![lines[1]]);

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.matches(BAD_IMAGE_FORMAT_HINT).count(), 1, "{text}");
    }

    #[test]
    fn ordinary_output_gives_no_architecture_hint() {
        let (mut s, _) = session();
        feed(&mut s, &["42", "// Runtime=test", "BadImageFormat"]);
        assert!(!s.architecture_hinted());
    }
}
