//! Thread-safe outcome accumulation for an in-progress run.
//!
//! [`OutcomeCollector::record`] is the only synchronization point between
//! workers: the lock is held for the duration of a single push. Insertion
//! order follows completion order, which with more than one worker can
//! differ from schedule order; the report re-sorts.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::case::Outcome;

/// Accumulates outcomes and an optional run-level fault annotation.
///
/// # Example
///
/// ```
/// use tlib::orchestrator::OutcomeCollector;
///
/// let collector = OutcomeCollector::new();
/// assert!(collector.is_empty());
/// collector.annotate_fault("worker pool closed");
/// assert_eq!(collector.fault().as_deref(), Some("worker pool closed"));
/// ```
#[derive(Debug, Default)]
pub struct OutcomeCollector {
    outcomes: Mutex<Vec<Outcome>>,
    fault: Mutex<Option<String>>,
}

impl OutcomeCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an outcome.
    ///
    /// Never fails: a lock poisoned by a panicking holder is recovered,
    /// since a push cannot leave the vector half-written.
    pub fn record(&self, outcome: Outcome) {
        lock(&self.outcomes).push(outcome);
    }

    /// Returns a copy of all outcomes in insertion order.
    pub fn snapshot(&self) -> Vec<Outcome> {
        lock(&self.outcomes).clone()
    }

    /// Number of outcomes recorded so far.
    pub fn len(&self) -> usize {
        lock(&self.outcomes).len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a fault in the run machinery.
    ///
    /// The fault is kept apart from the outcomes; it is never turned into
    /// a per-test record. The first annotation wins.
    pub fn annotate_fault(&self, message: impl Into<String>) {
        let mut fault = lock(&self.fault);
        if fault.is_none() {
            *fault = Some(message.into());
        }
    }

    /// Returns the run-level fault, if one was annotated.
    pub fn fault(&self) -> Option<String> {
        lock(&self.fault).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::Status;
    use std::sync::Arc;
    use std::time::Duration;

    fn outcome(case_id: &str, sequence: usize) -> Outcome {
        Outcome {
            case_id: case_id.to_string(),
            iteration: 0,
            loop_index: sequence,
            sequence,
            status: Status::Passed,
            started_at: chrono::Utc::now(),
            duration: Duration::ZERO,
            message: String::new(),
            traceback: None,
            captured_output: String::new(),
        }
    }

    #[test]
    fn test_record_preserves_insertion_order() {
        let collector = OutcomeCollector::new();
        collector.record(outcome("b", 1));
        collector.record(outcome("a", 0));
        collector.record(outcome("c", 2));

        let ids: Vec<_> = collector
            .snapshot()
            .into_iter()
            .map(|o| o.case_id)
            .collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(collector.len(), 3);
    }

    #[test]
    fn test_concurrent_record() {
        let collector = Arc::new(OutcomeCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        collector.record(outcome(&format!("t{}", t), i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.len(), 800);
        // per-producer order is preserved
        for t in 0..8 {
            let id = format!("t{}", t);
            let seqs: Vec<_> = snapshot
                .iter()
                .filter(|o| o.case_id == id)
                .map(|o| o.sequence)
                .collect();
            assert_eq!(seqs, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_first_fault_wins() {
        let collector = OutcomeCollector::new();
        assert_eq!(collector.fault(), None);
        collector.annotate_fault("first");
        collector.annotate_fault("second");
        assert_eq!(collector.fault().as_deref(), Some("first"));
        assert!(collector.is_empty());
    }

    #[test]
    fn test_record_survives_poisoned_lock() {
        let collector = Arc::new(OutcomeCollector::new());
        let poisoner = Arc::clone(&collector);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.outcomes.lock().unwrap();
            panic!("poison");
        })
        .join();

        collector.record(outcome("a", 0));
        assert_eq!(collector.len(), 1);
    }
}
