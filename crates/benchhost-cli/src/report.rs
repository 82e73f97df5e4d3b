//! Operator-facing rendering of a finished session.

use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use benchhost_core::BrokerOutcome;
use benchhost_core::diagnoser::{
    BenchmarkCase, Diagnoser, DiagnoserContext, DiagnoserError, ResultSink,
};
use benchhost_core::protocol::HostSignal;

/// A diagnoser payload as received, kept for the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnoserPayload {
    pub diagnoser_index: usize,
    pub payload: String,
}

/// Logs every signal and keeps every payload. The CLI has no real collectors
/// to route to, so payloads for any index are accepted.
#[derive(Debug, Default)]
pub struct PayloadCollector {
    payloads: Mutex<Vec<DiagnoserPayload>>,
}

impl PayloadCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<DiagnoserPayload> {
        std::mem::take(&mut *self.payloads.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Diagnoser for PayloadCollector {
    fn name(&self) -> &str {
        "cli"
    }

    fn handle(&self, signal: HostSignal, context: &DiagnoserContext) {
        debug!(%signal, pid = ?context.process_id, "signal");
    }
}

impl ResultSink for PayloadCollector {
    fn deserialize_results(
        &self,
        diagnoser_index: usize,
        _benchmark: &BenchmarkCase,
        payload: &str,
    ) -> Result<(), DiagnoserError> {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DiagnoserPayload {
                diagnoser_index,
                payload: payload.to_owned(),
            });
        Ok(())
    }
}

/// Serializable result plus the payloads collected alongside it.
#[derive(Debug, Serialize)]
pub struct Report<T> {
    pub benchmark: BenchmarkCase,
    #[serde(flatten)]
    pub body: T,
    pub diagnoser_results: Vec<DiagnoserPayload>,
}

/// Human-readable sections of a report.
#[derive(Debug, Default)]
pub struct Summary<'a> {
    pub outcome: Option<BrokerOutcome>,
    pub exit_code: Option<Option<i32>>,
    pub force_killed: bool,
    pub results: &'a [String],
    pub prefixed_output: &'a [String],
    pub standard_output: &'a [String],
    pub standard_error: &'a [String],
}

impl<T: Serialize> Report<T> {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Render `summary` and this report's payloads as plain text.
    pub fn render(&self, summary: &Summary<'_>) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Benchmark: #{} {}\n",
            self.benchmark.id, self.benchmark.name
        ));
        if let Some(outcome) = summary.outcome {
            out.push_str(&format!("Outcome:   {outcome}\n"));
        }
        match summary.exit_code {
            Some(Some(code)) => out.push_str(&format!("Exit code: {code}\n")),
            Some(None) => out.push_str("Exit code: (killed by signal)\n"),
            None => {}
        }
        if summary.force_killed {
            out.push_str("Worker was force-killed after the session.\n");
        }

        section(&mut out, "Results", summary.results);
        section(&mut out, "Worker output", summary.prefixed_output);
        section(&mut out, "Standard output", summary.standard_output);
        section(&mut out, "Standard error", summary.standard_error);

        if !self.diagnoser_results.is_empty() {
            out.push_str(&format!(
                "\nDiagnoser results ({}):\n",
                self.diagnoser_results.len()
            ));
            for result in &self.diagnoser_results {
                out.push_str(&format!("  [{}]\n", result.diagnoser_index));
                for line in result.payload.lines() {
                    out.push_str(&format!("    {line}\n"));
                }
            }
        }
        out
    }
}

fn section(out: &mut String, title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    out.push_str(&format!("\n{title} ({}):\n", lines.len()));
    for line in lines {
        out.push_str(&format!("  {line}\n"));
    }
}
