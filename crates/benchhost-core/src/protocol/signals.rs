//! Lifecycle signals and their wire tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The line the host writes back for every signal it receives.
pub const ACKNOWLEDGMENT: &str = "Acknowledgment";

/// A lifecycle checkpoint.
///
/// Four of these are announced by the worker over the wire and must be
/// acknowledged; the remaining three are raised by the host itself around
/// process start and exit and never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostSignal {
    /// Host side, before the worker process is started.
    BeforeProcessStart,
    /// Host side, right after the worker process was started.
    AfterProcessStart,
    /// Worker side, before any benchmark code runs.
    BeforeAnythingElse,
    /// Worker side, before the main measurement loop.
    BeforeActualRun,
    /// Worker side, after the main measurement loop.
    AfterActualRun,
    /// Worker side, all phases complete. Ends the session.
    AfterAll,
    /// Host side, after the worker process exited (or was killed).
    AfterProcessExit,
}

impl HostSignal {
    /// Signals that travel over the wire, in emission order.
    pub const WIRE: [HostSignal; 4] = [
        HostSignal::BeforeAnythingElse,
        HostSignal::BeforeActualRun,
        HostSignal::AfterActualRun,
        HostSignal::AfterAll,
    ];

    /// The exact wire token, or `None` for host-side signals.
    pub fn token(self) -> Option<&'static str> {
        match self {
            HostSignal::BeforeAnythingElse => Some("// BeforeAnythingElse"),
            HostSignal::BeforeActualRun => Some("// BeforeActualRun"),
            HostSignal::AfterActualRun => Some("// AfterActualRun"),
            HostSignal::AfterAll => Some("// AfterAll"),
            HostSignal::BeforeProcessStart
            | HostSignal::AfterProcessStart
            | HostSignal::AfterProcessExit => None,
        }
    }

    /// Whether receiving this signal ends the session.
    pub fn is_terminal(self) -> bool {
        self == HostSignal::AfterAll
    }
}

impl fmt::Display for HostSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Resolve a line to a wire signal by exact comparison.
///
/// Never a prefix match: worker output that merely starts with a token is
/// ordinary text.
pub fn try_resolve_signal(line: &str) -> Option<HostSignal> {
    HostSignal::WIRE
        .into_iter()
        .find(|signal| signal.token() == Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_wire_signal_round_trips_through_its_token() {
        for signal in HostSignal::WIRE {
            let token = signal.token().unwrap();
            assert_eq!(try_resolve_signal(token), Some(signal));
        }
    }

    #[test]
    fn host_side_signals_have_no_token() {
        assert!(HostSignal::BeforeProcessStart.token().is_none());
        assert!(HostSignal::AfterProcessStart.token().is_none());
        assert!(HostSignal::AfterProcessExit.token().is_none());
    }

    #[test]
    fn resolution_is_exact_not_prefix() {
        assert_eq!(try_resolve_signal("// AfterAll "), None);
        assert_eq!(try_resolve_signal("// AfterAllDone"), None);
        assert_eq!(try_resolve_signal(" // AfterAll"), None);
        assert_eq!(try_resolve_signal("// afterall"), None);
        assert_eq!(try_resolve_signal("AfterAll"), None);
    }

    #[test]
    fn only_after_all_is_terminal() {
        let terminal: Vec<_> = HostSignal::WIRE.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![HostSignal::AfterAll]);
    }

    #[test]
    fn acknowledgment_is_not_control_traffic() {
        assert!(!super::super::is_control_line(ACKNOWLEDGMENT));
    }
}
