//! Reassembly of framed diagnoser payloads.

use tracing::debug;

use super::PAYLOAD_LINE_SEPARATOR;
use super::classifier::{FramingError, FramingState};
use crate::diagnoser::{BenchmarkCase, DiagnoserError, ResultSink};

/// `// InProcessDiagnoser <diagnoser_index> <line_count>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnoserResultHeader {
    pub diagnoser_index: usize,
    pub line_count: usize,
}

/// A fully received payload, ready to be handed to its diagnoser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBlock {
    pub diagnoser_index: usize,
    pub payload: String,
}

#[derive(Debug)]
struct OpenBlock {
    header: DiagnoserResultHeader,
    payload: String,
    received: usize,
}

/// Collects the body lines of at most one in-flight block.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    block: Option<OpenBlock>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `AwaitingBody` while an open block still owes body lines.
    pub fn framing_state(&self) -> FramingState {
        match &self.block {
            Some(block) if block.received < block.header.line_count => FramingState::AwaitingBody,
            _ => FramingState::Idle,
        }
    }

    /// Open a block. A header announcing zero lines is complete immediately.
    pub fn begin_block(&mut self, header: DiagnoserResultHeader) -> Result<(), FramingError> {
        if let Some(open) = &self.block {
            return Err(FramingError::BlockAlreadyOpen {
                remaining: open.header.line_count - open.received,
            });
        }
        self.block = Some(OpenBlock {
            header,
            payload: String::new(),
            received: 0,
        });
        Ok(())
    }

    /// Append one stripped body line.
    pub fn feed(&mut self, body: &str) -> Result<(), FramingError> {
        let block = match &mut self.block {
            Some(block) if block.received < block.header.line_count => block,
            _ => return Err(FramingError::UnexpectedBody),
        };
        if block.received > 0 {
            block.payload.push_str(PAYLOAD_LINE_SEPARATOR);
        }
        block.payload.push_str(body);
        block.received += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.block
            .as_ref()
            .is_some_and(|block| block.received == block.header.line_count)
    }

    /// Remove and return the open block if it is complete.
    pub fn take_completed(&mut self) -> Option<CompletedBlock> {
        if !self.is_complete() {
            return None;
        }
        self.block.take().map(|block| CompletedBlock {
            diagnoser_index: block.header.diagnoser_index,
            payload: block.payload,
        })
    }

    /// Hand a completed block to `sink` and reset the framing state.
    ///
    /// Returns `Ok(false)` when no complete block is pending. Without a sink
    /// the payload is dropped.
    pub fn flush(
        &mut self,
        benchmark: &BenchmarkCase,
        sink: Option<&dyn ResultSink>,
    ) -> Result<bool, DiagnoserError> {
        let Some(done) = self.take_completed() else {
            return Ok(false);
        };
        match sink {
            Some(sink) => sink.deserialize_results(done.diagnoser_index, benchmark, &done.payload)?,
            None => debug!(
                diagnoser_index = done.diagnoser_index,
                "no in-process diagnoser attached, dropping results"
            ),
        }
        Ok(true)
    }

    /// Drop an incomplete block, returning its header. Partial blocks are
    /// never flushed.
    pub fn discard(&mut self) -> Option<DiagnoserResultHeader> {
        self.block.take().map(|block| block.header)
    }
}
