//! Wire protocol spoken by benchmark workers.
//!
//! Every line that does not start with [`CONTROL_MARKER`] is a measurement
//! record. Marker-prefixed lines are lifecycle signals, diagnoser result
//! frames, or opaque extra output:
//!
//! ```text
//! 42                                     measurement record
//! // BeforeActualRun                     signal, host replies "Acknowledgment"
//! // InProcessDiagnoser 0 2              header: diagnoser 0, two body lines
//! // InProcessDiagnoserResults line1     body
//! // InProcessDiagnoserResults line2     body
//! // AfterAll                            terminal signal
//! ```

pub mod aggregator;
pub mod classifier;
pub mod signals;

pub use aggregator::{CompletedBlock, DiagnoserResultHeader, ResultAggregator};
pub use classifier::{FramingError, FramingState, LineKind, classify};
pub use signals::{ACKNOWLEDGMENT, HostSignal, try_resolve_signal};

/// Two-character prefix separating control traffic from measurement data.
pub const CONTROL_MARKER: &str = "//";

/// Keyword line announcing a framed diagnoser payload.
pub const HEADER_KEY: &str = "// InProcessDiagnoser";

/// Prefix carried by every body line of a framed diagnoser payload.
pub const RESULTS_KEY: &str = "// InProcessDiagnoserResults";

/// Separator placed between (not after) reassembled body lines.
pub const PAYLOAD_LINE_SEPARATOR: &str = "\n";

/// Worker output containing this text means the worker binary was built for
/// a different architecture than the one it was launched on.
pub const BAD_IMAGE_FORMAT_MARKER: &str = "BadImageFormatException";

/// Operator hint logged when [`BAD_IMAGE_FORMAT_MARKER`] shows up.
pub const BAD_IMAGE_FORMAT_HINT: &str =
    "the worker failed to load an image built for another platform; check that the worker \
     targets the host architecture (e.g. an AnyCPU / matching platform target)";

/// Whether `line` is control traffic rather than a measurement record.
pub fn is_control_line(line: &str) -> bool {
    line.starts_with(CONTROL_MARKER)
}
