//! `benchhost run`: execute one worker and report its session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use benchhost_core::BrokerOutcome;
use benchhost_core::diagnoser::BenchmarkCase;
use benchhost_core::executor::{ExecuteResult, Executor, WorkerCommand};

use crate::config::{BenchhostConfig, TransportKind};
use crate::report::{PayloadCollector, Report, Summary};

/// Everything `benchhost run` needs after argument parsing.
#[derive(Debug)]
pub struct RunOptions {
    pub benchmark: BenchmarkCase,
    pub worker: WorkerCommand,
    pub config: BenchhostConfig,
    pub json: bool,
}

/// Execute the `benchhost run` command. Returns the session outcome so the
/// caller can pick the exit status.
pub async fn cmd_run(options: RunOptions) -> Result<BrokerOutcome> {
    let cancel = CancellationToken::new();
    install_ctrl_c(cancel.clone());

    let (result, payloads) = run_worker(&options, cancel).await?;

    let report = Report {
        benchmark: options.benchmark,
        body: &result,
        diagnoser_results: payloads,
    };
    if options.json {
        println!("{}", report.to_json()?);
    } else {
        let summary = Summary {
            outcome: Some(result.outcome),
            exit_code: Some(result.exit_code),
            force_killed: result.force_killed,
            results: &result.results,
            prefixed_output: &result.prefixed_output,
            standard_output: &result.standard_output,
            standard_error: &result.standard_error,
        };
        print!("{}", report.render(&summary));
    }

    Ok(result.outcome)
}

/// Run the worker over the configured transport. Payloads are returned
/// alongside the result.
pub async fn run_worker(
    options: &RunOptions,
    cancel: CancellationToken,
) -> Result<(ExecuteResult, Vec<crate::report::DiagnoserPayload>)> {
    let collector = Arc::new(PayloadCollector::new());
    let executor = Executor::new(options.config.host.clone())
        .with_diagnoser(collector.clone())
        .with_results_sink(collector.clone())
        .with_cancellation(cancel);

    info!(
        benchmark = %options.benchmark.name,
        transport = ?options.config.transport,
        "starting worker session"
    );

    let result = match options.config.transport {
        TransportKind::Pipe => {
            let benchmark = options.benchmark.clone();
            let worker = options.worker.clone();
            tokio::task::spawn_blocking(move || executor.execute_pipe(&benchmark, &worker))
                .await
                .context("pipe session task failed")??
        }
        TransportKind::Channel => {
            executor
                .execute_channel(&options.benchmark, &options.worker)
                .await?
        }
    };

    Ok((result, collector.take()))
}

/// First Ctrl+C cancels the session; the second exits immediately.
fn install_ctrl_c(cancel: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });
}
