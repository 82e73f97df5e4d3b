//! `benchhost replay`: feed a recorded worker transcript through the broker.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use benchhost_core::diagnoser::BenchmarkCase;
use benchhost_core::transport::MemoryTransport;
use benchhost_core::{Broker, BrokerOutcome, CollectedOutput};

use crate::report::{DiagnoserPayload, PayloadCollector, Report, Summary};

#[derive(Debug, Serialize)]
pub struct ReplayResult {
    pub outcome: BrokerOutcome,
    #[serde(flatten)]
    pub output: CollectedOutput,
    /// Acknowledgments the broker wrote back.
    pub acknowledgments: usize,
}

/// Replay `transcript` (one worker line per line) for `benchmark`.
pub fn replay(
    benchmark: BenchmarkCase,
    transcript: &str,
) -> Result<(ReplayResult, Vec<DiagnoserPayload>)> {
    let collector = Arc::new(PayloadCollector::new());
    let transport = MemoryTransport::from_transcript(transcript);
    let written = transport.written();

    let mut broker = Broker::builder(benchmark)
        .diagnoser(collector.clone())
        .results_sink(collector.clone())
        .build();
    let outcome = broker.process_data(transport)?;
    let output = broker.into_output()?;

    Ok((
        ReplayResult {
            outcome,
            output,
            acknowledgments: written.len(),
        },
        collector.take(),
    ))
}

/// Execute the `benchhost replay` command.
pub fn cmd_replay(path: &Path, benchmark: BenchmarkCase, json: bool) -> Result<BrokerOutcome> {
    let transcript = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;

    let (result, payloads) = replay(benchmark.clone(), &transcript)?;
    let report = Report {
        benchmark,
        body: &result,
        diagnoser_results: payloads,
    };

    if json {
        println!("{}", report.to_json()?);
    } else {
        let summary = Summary {
            outcome: Some(result.outcome),
            results: &result.output.results,
            prefixed_output: &result.output.prefixed_output,
            ..Summary::default()
        };
        print!("{}", report.render(&summary));
        println!("\nAcknowledgments sent: {}", result.acknowledgments);
    }

    Ok(result.outcome)
}
