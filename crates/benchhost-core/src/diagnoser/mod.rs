//! Contracts consumed from diagnostic collectors.
//!
//! A [`Diagnoser`] observes lifecycle signals (for example to start a trace
//! session before the measured loop and stop it after). An
//! [`InProcessDiagnoser`] runs code inside the worker and ships its results
//! back as a framed payload, which the host routes by index through a
//! [`ResultSink`].
//!
//! Both callbacks run on the broker's read loop, which stalls until they
//! return; implementations are expected to be quick and non-blocking.

pub mod composite;

use serde::{Deserialize, Serialize};

use crate::protocol::HostSignal;

pub use composite::{CompositeDiagnoser, CompositeInProcessDiagnoser};

/// The benchmark a worker session measures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BenchmarkCase {
    pub id: u32,
    pub name: String,
}

impl BenchmarkCase {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Passed to [`Diagnoser::handle`] with every signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnoserContext {
    /// OS pid of the worker; `None` before start and after exit.
    pub process_id: Option<u32>,
    pub benchmark: BenchmarkCase,
}

/// Errors reported by result deserialization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiagnoserError {
    #[error("no in-process diagnoser at index {index} ({count} attached)")]
    UnknownIndex { index: usize, count: usize },

    #[error("diagnoser {diagnoser:?} rejected its payload: {reason}")]
    RejectedPayload { diagnoser: String, reason: String },
}

/// Observer of lifecycle signals.
pub trait Diagnoser: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, signal: HostSignal, context: &DiagnoserContext);
}

/// One in-process collector; receives the payload its worker-side half sent.
pub trait InProcessDiagnoser: Send + Sync {
    fn name(&self) -> &str;

    fn deserialize_results(
        &self,
        benchmark: &BenchmarkCase,
        payload: &str,
    ) -> Result<(), DiagnoserError>;
}

/// Entry point for completed payloads, addressed by diagnoser index.
pub trait ResultSink: Send + Sync {
    fn deserialize_results(
        &self,
        diagnoser_index: usize,
        benchmark: &BenchmarkCase,
        payload: &str,
    ) -> Result<(), DiagnoserError>;
}

// All three traits are stored as trait objects.
const _: () = {
    fn _assert_object_safe(_: &dyn Diagnoser, _: &dyn InProcessDiagnoser, _: &dyn ResultSink) {}
};
