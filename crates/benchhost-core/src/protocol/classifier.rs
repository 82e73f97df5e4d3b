//! Single-line classification.

use super::aggregator::DiagnoserResultHeader;
use super::signals::{HostSignal, try_resolve_signal};
use super::{HEADER_KEY, RESULTS_KEY, is_control_line};

/// What the classifier needs to know about the surrounding frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingState {
    /// No diagnoser block is open.
    Idle,
    /// A header was seen and body lines are still owed.
    AwaitingBody,
}

/// The role of one line in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind<'a> {
    MeasurementRecord,
    LifecycleSignal(HostSignal),
    DiagnoserResultHeader(DiagnoserResultHeader),
    /// Body fragment with the results marker stripped.
    DiagnoserResultBody(&'a str),
    ExtraOutput,
}

/// A deviation from the expected line sequence. Always fatal for the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("expected a diagnoser result body line, got {line:?}")]
    MissingBodyMarker { line: String },

    #[error("malformed diagnoser result header {line:?}: {reason}")]
    MalformedHeader { line: String, reason: String },

    #[error("diagnoser result header while a block is still open ({remaining} body lines owed)")]
    BlockAlreadyOpen { remaining: usize },

    #[error("diagnoser result body line outside of a block")]
    UnexpectedBody,

    #[error("results for unknown diagnoser index {index} ({count} attached)")]
    UnknownDiagnoser { index: usize, count: usize },
}

/// Classify one line, given whether a diagnoser block is open.
///
/// While a block is open every line must be a body line; anything else is a
/// framing violation and the protocol makes no attempt to resynchronize.
pub fn classify(line: &str, state: FramingState) -> Result<LineKind<'_>, FramingError> {
    if state == FramingState::AwaitingBody {
        return strip_body_marker(line)
            .map(LineKind::DiagnoserResultBody)
            .ok_or_else(|| FramingError::MissingBodyMarker {
                line: line.to_owned(),
            });
    }

    if !is_control_line(line) {
        return Ok(LineKind::MeasurementRecord);
    }

    if let Some(signal) = try_resolve_signal(line) {
        return Ok(LineKind::LifecycleSignal(signal));
    }

    if let Some(rest) = header_arguments(line) {
        return parse_header(line, rest).map(LineKind::DiagnoserResultHeader);
    }

    Ok(LineKind::ExtraOutput)
}

/// `"// InProcessDiagnoserResults frag"` -> `"frag"`.
///
/// The marker must be followed by a single space or the end of the line, so
/// an empty fragment is legal but `"// InProcessDiagnoserResultsX"` is not.
fn strip_body_marker(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(RESULTS_KEY)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix(' ')
}

/// Everything after the header keyword, if the line is a header attempt.
fn header_arguments(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(HEADER_KEY)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix(' ')
}

fn parse_header(line: &str, args: &str) -> Result<DiagnoserResultHeader, FramingError> {
    let malformed = |reason: &str| FramingError::MalformedHeader {
        line: line.to_owned(),
        reason: reason.to_owned(),
    };

    let mut parts = args.split(' ');
    let index = parts.next().filter(|p| !p.is_empty());
    let count = parts.next().filter(|p| !p.is_empty());
    let (Some(index), Some(count)) = (index, count) else {
        return Err(malformed("expected a diagnoser index and a line count"));
    };
    if parts.next().is_some() {
        return Err(malformed("unexpected trailing fields"));
    }

    Ok(DiagnoserResultHeader {
        diagnoser_index: parse_non_negative(index)
            .ok_or_else(|| malformed("diagnoser index is not a non-negative integer"))?,
        line_count: parse_non_negative(count)
            .ok_or_else(|| malformed("line count is not a non-negative integer"))?,
    })
}

/// Base-10 digits only; rejects signs, which `str::parse` would accept.
fn parse_non_negative(text: &str) -> Option<usize> {
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}
