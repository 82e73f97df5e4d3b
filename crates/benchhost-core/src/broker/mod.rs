//! Session coordinator: drives one worker from first line to outcome.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --process_data--> Listening --> Success | EndOfStream | InvalidData | EarlyProcessExit
//!   \
//!    `-- process already gone / cancelled --> EarlyProcessExit (no connection opened)
//! ```
//!
//! A [`Broker`] runs exactly one session. Disposal (explicitly, on drop, or
//! when the bound [`ProcessExit`] fires) cancels every outstanding wait and
//! is idempotent.

pub mod exit;
pub mod session;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnoser::{BenchmarkCase, Diagnoser, ResultSink};
use crate::protocol::ACKNOWLEDGMENT;
use crate::transport::{
    AsyncConnection, AsyncTransport, Connection, Transport, TransportError,
};

pub use exit::{ExitSubscription, ProcessExit};
pub use session::{CollectedOutput, Session, Step};

/// How a session ended. Always a value, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerOutcome {
    /// The terminal signal was received and acknowledged.
    Success,
    /// The stream closed cleanly before the terminal signal.
    EndOfStream,
    /// The stream violated framing.
    InvalidData,
    /// The worker was gone, disconnected, or the session was cancelled.
    EarlyProcessExit,
}

impl BrokerOutcome {
    pub fn is_success(self) -> bool {
        self == BrokerOutcome::Success
    }
}

impl fmt::Display for BrokerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Programming errors. Worker misbehavior is reported as a [`BrokerOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(TransportError),

    #[error("broker session already {0}")]
    AlreadyStarted(&'static str),

    #[error("collected output is not available until the session has ended")]
    SessionNotEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerState {
    Idle,
    Listening,
    Ended(BrokerOutcome),
}

#[derive(Debug)]
struct HandleInner {
    cancel: CancellationToken,
    disposed: AtomicBool,
}

/// Clonable disposal handle, usable from other threads and signal handlers.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    inner: Arc<HandleInner>,
}

impl BrokerHandle {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancel,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Cancel every outstanding wait of the session. Idempotent.
    pub fn dispose(&self) {
        if self
            .inner
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("disposing broker");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

/// Coordinates one worker session over a [`Transport`] or [`AsyncTransport`].
#[derive(Debug)]
pub struct Broker {
    session: Session,
    handle: BrokerHandle,
    exit: Option<ProcessExit>,
    exit_subscription: Option<ExitSubscription>,
    state: BrokerState,
}

impl Broker {
    pub fn new(benchmark: BenchmarkCase) -> Self {
        Self::build(benchmark, None, None, None, CancellationToken::new())
    }

    /// Builder entry point for a broker bound to a running process.
    pub fn builder(benchmark: BenchmarkCase) -> BrokerBuilder {
        BrokerBuilder {
            benchmark,
            process_id: None,
            exit: None,
            diagnoser: None,
            results_sink: None,
            parent: None,
        }
    }

    fn build(
        benchmark: BenchmarkCase,
        process_id: Option<u32>,
        diagnoser: Option<Arc<dyn Diagnoser>>,
        results_sink: Option<Arc<dyn ResultSink>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session: Session::new(benchmark, process_id, diagnoser, results_sink),
            handle: BrokerHandle::new(cancel),
            exit: None,
            exit_subscription: None,
            state: BrokerState::Idle,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Run the session on the calling thread.
    pub fn process_data<T: Transport>(&mut self, transport: T) -> Result<BrokerOutcome, BrokerError> {
        if let Some(outcome) = self.begin()? {
            return Ok(self.end(outcome));
        }
        let cancel = self.handle.cancellation_token();

        let mut connection = match transport.attach(&cancel) {
            Ok(connection) => connection,
            Err(e) => {
                let outcome = self.classify_fault(e)?;
                return Ok(self.end(outcome));
            }
        };

        let outcome = loop {
            let line = match connection.read_line(&cancel) {
                Ok(Some(line)) => line,
                Ok(None) => break BrokerOutcome::EndOfStream,
                Err(e) => break self.classify_fault(e)?,
            };
            match self.session.on_line(line) {
                Step::Continue => {}
                Step::Acknowledge { terminal } => {
                    if let Err(e) = connection.write_line(ACKNOWLEDGMENT, &cancel) {
                        break self.classify_fault(e)?;
                    }
                    if terminal {
                        break BrokerOutcome::Success;
                    }
                }
                Step::Violation(e) => {
                    warn!(error = %e, "worker broke the result framing");
                    break BrokerOutcome::InvalidData;
                }
            }
        };
        Ok(self.end(outcome))
    }

    /// Run the session on the current task.
    pub async fn process_data_async<T: AsyncTransport>(
        &mut self,
        transport: T,
    ) -> Result<BrokerOutcome, BrokerError> {
        if let Some(outcome) = self.begin()? {
            return Ok(self.end(outcome));
        }
        let cancel = self.handle.cancellation_token();

        let mut connection = match transport.accept(&cancel).await {
            Ok(connection) => connection,
            Err(e) => {
                let outcome = self.classify_fault(e)?;
                return Ok(self.end(outcome));
            }
        };

        let outcome = loop {
            let line = match connection.read_line(&cancel).await {
                Ok(Some(line)) => line,
                Ok(None) => break BrokerOutcome::EndOfStream,
                Err(e) => break self.classify_fault(e)?,
            };
            match self.session.on_line(line) {
                Step::Continue => {}
                Step::Acknowledge { terminal } => {
                    if let Err(e) = connection.write_line(ACKNOWLEDGMENT, &cancel).await {
                        break self.classify_fault(e)?;
                    }
                    if terminal {
                        break BrokerOutcome::Success;
                    }
                }
                Step::Violation(e) => {
                    warn!(error = %e, "worker broke the result framing");
                    break BrokerOutcome::InvalidData;
                }
            }
        };
        Ok(self.end(outcome))
    }

    /// The outcome, once the session has ended.
    pub fn outcome(&self) -> Option<BrokerOutcome> {
        match self.state {
            BrokerState::Ended(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn output(&self) -> Result<&CollectedOutput, BrokerError> {
        match self.state {
            BrokerState::Ended(_) => Ok(self.session.output()),
            _ => Err(BrokerError::SessionNotEnded),
        }
    }

    pub fn into_output(mut self) -> Result<CollectedOutput, BrokerError> {
        match self.state {
            BrokerState::Ended(_) => Ok(self.session.take_output()),
            _ => Err(BrokerError::SessionNotEnded),
        }
    }

    /// Cancel outstanding waits and detach from process exit. Idempotent.
    pub fn dispose(&mut self) {
        self.handle.dispose();
        self.exit_subscription = None;
    }

    fn begin(&mut self) -> Result<Option<BrokerOutcome>, BrokerError> {
        match self.state {
            BrokerState::Idle => {}
            BrokerState::Listening => return Err(BrokerError::AlreadyStarted("listening")),
            BrokerState::Ended(_) => return Err(BrokerError::AlreadyStarted("ended")),
        }
        let exited = self.exit.as_ref().is_some_and(ProcessExit::has_exited);
        if exited || self.handle.cancellation_token().is_cancelled() {
            debug!(exited, "worker gone before the session started");
            return Ok(Some(BrokerOutcome::EarlyProcessExit));
        }
        self.state = BrokerState::Listening;
        Ok(None)
    }

    fn end(&mut self, outcome: BrokerOutcome) -> BrokerOutcome {
        self.session.finish();
        self.state = BrokerState::Ended(outcome);

        let benchmark = &self.session.benchmark().name;
        if outcome.is_success() {
            info!(benchmark = %benchmark, %outcome, "worker session finished");
        } else {
            warn!(benchmark = %benchmark, %outcome, "worker session did not complete");
        }
        outcome
    }

    fn classify_fault(&self, error: TransportError) -> Result<BrokerOutcome, BrokerError> {
        match error {
            TransportError::Misconfigured(_) => Err(BrokerError::Transport(error)),
            TransportError::Cancelled => Ok(BrokerOutcome::EarlyProcessExit),
            other => {
                debug!(error = %other, "transport fault");
                Ok(BrokerOutcome::EarlyProcessExit)
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Configures a [`Broker`] before its session starts.
pub struct BrokerBuilder {
    benchmark: BenchmarkCase,
    process_id: Option<u32>,
    exit: Option<ProcessExit>,
    diagnoser: Option<Arc<dyn Diagnoser>>,
    results_sink: Option<Arc<dyn ResultSink>>,
    parent: Option<CancellationToken>,
}

impl BrokerBuilder {
    /// Bind to a running worker. The broker disposes itself when `exit` fires.
    pub fn process(mut self, process_id: u32, exit: ProcessExit) -> Self {
        self.process_id = Some(process_id);
        self.exit = Some(exit);
        self
    }

    pub fn diagnoser(mut self, diagnoser: Arc<dyn Diagnoser>) -> Self {
        self.diagnoser = Some(diagnoser);
        self
    }

    pub fn results_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.results_sink = Some(sink);
        self
    }

    /// Also cancel the session when `parent` is cancelled.
    pub fn cancel_with(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn build(self) -> Broker {
        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let mut broker = Broker::build(
            self.benchmark,
            self.process_id,
            self.diagnoser,
            self.results_sink,
            cancel,
        );
        if let Some(exit) = self.exit {
            let handle = broker.handle();
            broker.exit_subscription = Some(exit.subscribe(move || handle.dispose()));
            broker.exit = Some(exit);
        }
        broker
    }
}
