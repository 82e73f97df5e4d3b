//! Fan-out and routing over several diagnosers.

use super::{
    BenchmarkCase, Diagnoser, DiagnoserContext, DiagnoserError, InProcessDiagnoser, ResultSink,
};
use crate::protocol::HostSignal;

/// Forwards every signal to each attached diagnoser, in attach order.
#[derive(Default)]
pub struct CompositeDiagnoser {
    diagnosers: Vec<Box<dyn Diagnoser>>,
}

impl CompositeDiagnoser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, diagnoser: impl Diagnoser + 'static) -> &mut Self {
        self.diagnosers.push(Box::new(diagnoser));
        self
    }

    pub fn len(&self) -> usize {
        self.diagnosers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnosers.is_empty()
    }
}

impl Diagnoser for CompositeDiagnoser {
    fn name(&self) -> &str {
        "composite"
    }

    fn handle(&self, signal: HostSignal, context: &DiagnoserContext) {
        for diagnoser in &self.diagnosers {
            diagnoser.handle(signal, context);
        }
    }
}

impl std::fmt::Debug for CompositeDiagnoser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeDiagnoser")
            .field(
                "diagnosers",
                &self.diagnosers.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Routes completed payloads to the in-process diagnoser at their index.
///
/// The index a worker puts in a header is the attach position here.
#[derive(Default)]
pub struct CompositeInProcessDiagnoser {
    diagnosers: Vec<Box<dyn InProcessDiagnoser>>,
}

impl CompositeInProcessDiagnoser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a diagnoser and return the index its payloads will carry.
    pub fn attach(&mut self, diagnoser: impl InProcessDiagnoser + 'static) -> usize {
        self.diagnosers.push(Box::new(diagnoser));
        self.diagnosers.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&dyn InProcessDiagnoser> {
        self.diagnosers.get(index).map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.diagnosers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnosers.is_empty()
    }
}

impl ResultSink for CompositeInProcessDiagnoser {
    fn deserialize_results(
        &self,
        diagnoser_index: usize,
        benchmark: &BenchmarkCase,
        payload: &str,
    ) -> Result<(), DiagnoserError> {
        let diagnoser = self
            .get(diagnoser_index)
            .ok_or(DiagnoserError::UnknownIndex {
                index: diagnoser_index,
                count: self.len(),
            })?;
        diagnoser.deserialize_results(benchmark, payload)
    }
}

impl std::fmt::Debug for CompositeInProcessDiagnoser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeInProcessDiagnoser")
            .field(
                "diagnosers",
                &self.diagnosers.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Tap {
        name: String,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Diagnoser for Tap {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(&self, signal: HostSignal, _context: &DiagnoserContext) {
            self.seen.lock().unwrap().push(format!("{}:{signal}", self.name));
        }
    }

    impl InProcessDiagnoser for Tap {
        fn name(&self) -> &str {
            &self.name
        }

        fn deserialize_results(
            &self,
            _benchmark: &BenchmarkCase,
            payload: &str,
        ) -> Result<(), DiagnoserError> {
            if payload == "garbage" {
                return Err(DiagnoserError::RejectedPayload {
                    diagnoser: self.name.clone(),
                    reason: "unparseable".to_owned(),
                });
            }
            self.seen.lock().unwrap().push(format!("{}<-{payload}", self.name));
            Ok(())
        }
    }

    fn tap(name: &str, seen: &Arc<Mutex<Vec<String>>>) -> Tap {
        Tap {
            name: name.to_owned(),
            seen: Arc::clone(seen),
        }
    }

    fn context() -> DiagnoserContext {
        DiagnoserContext {
            process_id: Some(1),
            benchmark: BenchmarkCase::new(0, "bench"),
        }
    }

    #[test]
    fn composite_fans_out_in_attach_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeDiagnoser::new();
        composite.attach(tap("a", &seen)).attach(tap("b", &seen));
        assert_eq!(composite.len(), 2);

        composite.handle(HostSignal::BeforeActualRun, &context());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &["a:BeforeActualRun", "b:BeforeActualRun"]
        );
    }

    #[test]
    fn in_process_routes_by_index() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeInProcessDiagnoser::new();
        assert_eq!(composite.attach(tap("first", &seen)), 0);
        assert_eq!(composite.attach(tap("second", &seen)), 1);

        let case = BenchmarkCase::new(0, "bench");
        composite.deserialize_results(1, &case, "x").unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &["second<-x"]);
    }

    #[test]
    fn unknown_index_is_an_error() {
        let composite = CompositeInProcessDiagnoser::new();
        let err = composite
            .deserialize_results(3, &BenchmarkCase::new(0, "b"), "x")
            .unwrap_err();
        assert_eq!(err, DiagnoserError::UnknownIndex { index: 3, count: 0 });
    }

    #[test]
    fn rejected_payload_propagates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeInProcessDiagnoser::new();
        composite.attach(tap("only", &seen));
        let err = composite
            .deserialize_results(0, &BenchmarkCase::new(0, "b"), "garbage")
            .unwrap_err();
        assert!(matches!(err, DiagnoserError::RejectedPayload { .. }));
    }

    #[test]
    fn debug_lists_names() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeDiagnoser::new();
        composite.attach(tap("etw", &seen));
        assert!(format!("{composite:?}").contains("etw"));
    }
}
