//! Run plans and iteration/loop scheduling.
//!
//! A [`RunPlan`] fixes the case sequence and how often it is replayed. The
//! [`Schedule`] produced from it is a lazy, finite sequence of
//! [`ScheduledItem`]s in this order:
//!
//! ```text
//! for iteration in 0..iterations
//!     for case in case_sequence
//!         for loop_index in 0..loops
//!             yield (case, iteration, loop_index)
//! ```
//!
//! Loop repetitions of a case are contiguous within an iteration, and a
//! case's whole loop block precedes the next case's block.
//!
//! # Example
//!
//! ```
//! use tlib::case::FnCase;
//! use tlib::orchestrator::RunPlan;
//!
//! let cases = vec![
//!     FnCase::new("x", || async { Ok(()) }).into_shared(),
//!     FnCase::new("y", || async { Ok(()) }).into_shared(),
//! ];
//! let plan = RunPlan::new(2, 3, cases)?;
//!
//! let order: Vec<_> = plan
//!     .schedule()
//!     .map(|item| format!("{}{}{}", item.case_id(), item.iteration, item.loop_index))
//!     .collect();
//! assert_eq!(&order[..4], ["x00", "x01", "x02", "y00"]);
//! assert_eq!(order.len(), 12);
//! # Ok::<(), tlib::orchestrator::PlanError>(())
//! ```

use std::collections::HashSet;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;

use crate::case::TestCase;

/// Reasons a run plan is rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// `iterations` was zero.
    #[error("invalid plan: iterations must be at least 1")]
    ZeroIterations,

    /// `loop` was zero.
    #[error("invalid plan: loop must be at least 1")]
    ZeroLoops,

    /// Two cases share an ID, which would merge them in the report.
    #[error("invalid plan: duplicate test case id '{0}'")]
    DuplicateCase(String),

    /// `iterations × loops × cases` does not fit in `usize`.
    #[error("invalid plan: {iterations} iterations x {loops} loops x {cases} cases is too many invocations")]
    TooLarge {
        iterations: usize,
        loops: usize,
        cases: usize,
    },
}

/// The validated schedule parameters of one run.
///
/// Created once per run and read-only afterwards. An empty case sequence
/// is valid and schedules nothing.
#[derive(Clone)]
pub struct RunPlan {
    iterations: usize,
    loops: usize,
    cases: Vec<Arc<dyn TestCase>>,
    len: usize,
}

impl RunPlan {
    /// Creates a plan, rejecting zero counts, duplicate case IDs and
    /// schedules whose length overflows `usize`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when the plan can never describe a sensible run.
    pub fn new(
        iterations: usize,
        loops: usize,
        cases: Vec<Arc<dyn TestCase>>,
    ) -> Result<Self, PlanError> {
        if iterations == 0 {
            return Err(PlanError::ZeroIterations);
        }
        if loops == 0 {
            return Err(PlanError::ZeroLoops);
        }

        let mut seen = HashSet::new();
        for case in &cases {
            if !seen.insert(case.id()) {
                return Err(PlanError::DuplicateCase(case.id().to_string()));
            }
        }

        let len = iterations
            .checked_mul(loops)
            .and_then(|n| n.checked_mul(cases.len()))
            .ok_or(PlanError::TooLarge {
                iterations,
                loops,
                cases: cases.len(),
            })?;

        Ok(Self {
            iterations,
            loops,
            cases,
            len,
        })
    }

    /// Number of passes over the case sequence.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Contiguous repetitions of each case per iteration.
    pub fn loops(&self) -> usize {
        self.loops
    }

    /// The ordered case sequence.
    pub fn cases(&self) -> &[Arc<dyn TestCase>] {
        &self.cases
    }

    /// Total number of scheduled items: `iterations × loops × cases`.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the plan schedules nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a fresh schedule starting from the first item.
    pub fn schedule(&self) -> Schedule<'_> {
        schedule(self)
    }
}

impl fmt::Debug for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.cases.iter().map(|c| c.id()).collect();
        f.debug_struct("RunPlan")
            .field("iterations", &self.iterations)
            .field("loops", &self.loops)
            .field("cases", &ids)
            .finish()
    }
}

/// One `(case, iteration, loop_index)` tuple awaiting execution.
#[derive(Clone)]
pub struct ScheduledItem {
    /// The case to invoke.
    pub case: Arc<dyn TestCase>,

    /// Zero-based iteration index.
    pub iteration: usize,

    /// Zero-based loop index within the iteration.
    pub loop_index: usize,

    /// Position of this item in the schedule.
    pub sequence: usize,
}

impl ScheduledItem {
    /// Returns the ID of the scheduled case.
    pub fn case_id(&self) -> &str {
        self.case.id()
    }
}

impl fmt::Debug for ScheduledItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledItem")
            .field("case", &self.case.id())
            .field("iteration", &self.iteration)
            .field("loop_index", &self.loop_index)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Lazy iterator over the scheduled items of a plan.
///
/// Items are computed from their position, so the schedule holds no
/// buffer. It cannot be rewound; call [`schedule`] again to restart.
#[derive(Debug, Clone)]
pub struct Schedule<'a> {
    plan: &'a RunPlan,
    next: usize,
}

/// Returns the schedule of `plan`, starting from the first item.
pub fn schedule(plan: &RunPlan) -> Schedule<'_> {
    Schedule { plan, next: 0 }
}

impl Iterator for Schedule<'_> {
    type Item = ScheduledItem;

    fn next(&mut self) -> Option<ScheduledItem> {
        if self.next >= self.plan.len() {
            return None;
        }

        let sequence = self.next;
        let loops = self.plan.loops;
        // cannot overflow: bounded by the plan length
        let per_iteration = self.plan.cases.len() * loops;

        let iteration = sequence / per_iteration;
        let within = sequence % per_iteration;
        let case = &self.plan.cases[within / loops];

        self.next += 1;
        Some(ScheduledItem {
            case: Arc::clone(case),
            iteration,
            loop_index: within % loops,
            sequence,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plan.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Schedule<'_> {}

impl FusedIterator for Schedule<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::FnCase;

    fn cases(ids: &[&str]) -> Vec<Arc<dyn TestCase>> {
        ids.iter()
            .map(|id| FnCase::new(*id, || async { Ok(()) }).into_shared())
            .collect()
    }

    fn tuples(plan: &RunPlan) -> Vec<(String, usize, usize)> {
        plan.schedule()
            .map(|item| (item.case_id().to_string(), item.iteration, item.loop_index))
            .collect()
    }

    #[test]
    fn test_case_then_loop_order() {
        let plan = RunPlan::new(2, 3, cases(&["X", "Y"])).unwrap();
        let expected: Vec<(String, usize, usize)> = [
            ("X", 0, 0),
            ("X", 0, 1),
            ("X", 0, 2),
            ("Y", 0, 0),
            ("Y", 0, 1),
            ("Y", 0, 2),
            ("X", 1, 0),
            ("X", 1, 1),
            ("X", 1, 2),
            ("Y", 1, 0),
            ("Y", 1, 1),
            ("Y", 1, 2),
        ]
        .iter()
        .map(|(id, i, j)| (id.to_string(), *i, *j))
        .collect();

        assert_eq!(tuples(&plan), expected);
    }

    #[test]
    fn test_schedule_length_is_product() {
        for iterations in 1..4 {
            for loops in 1..4 {
                for n in 0..4 {
                    let ids: Vec<String> = (0..n).map(|i| format!("case{}", i)).collect();
                    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                    let plan = RunPlan::new(iterations, loops, cases(&refs)).unwrap();

                    let schedule = plan.schedule();
                    assert_eq!(schedule.len(), iterations * loops * n);
                    assert_eq!(schedule.count(), iterations * loops * n);
                }
            }
        }
    }

    #[test]
    fn test_schedule_is_restartable() {
        let plan = RunPlan::new(3, 2, cases(&["a", "b", "c"])).unwrap();
        let first = tuples(&plan);
        let second = tuples(&plan);
        assert_eq!(first, second);
    }

    #[test]
    fn test_sequence_numbers_are_positions() {
        let plan = RunPlan::new(2, 2, cases(&["a", "b"])).unwrap();
        for (pos, item) in plan.schedule().enumerate() {
            assert_eq!(item.sequence, pos);
        }
    }

    #[test]
    fn test_empty_case_sequence() {
        let plan = RunPlan::new(5, 5, Vec::new()).unwrap();
        assert!(plan.is_empty());
        assert!(plan.schedule().next().is_none());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let err = RunPlan::new(0, 1, cases(&["a"])).unwrap_err();
        assert_eq!(err, PlanError::ZeroIterations);
    }

    #[test]
    fn test_zero_loops_rejected() {
        let err = RunPlan::new(1, 0, cases(&["a"])).unwrap_err();
        assert_eq!(err, PlanError::ZeroLoops);
    }

    #[test]
    fn test_duplicate_case_rejected() {
        let err = RunPlan::new(1, 1, cases(&["a", "b", "a"])).unwrap_err();
        assert_eq!(err, PlanError::DuplicateCase("a".to_string()));
    }

    #[test]
    fn test_overflowing_length_rejected() {
        let err = RunPlan::new(usize::MAX / 2, 3, cases(&["a"])).unwrap_err();
        assert!(matches!(err, PlanError::TooLarge { loops: 3, cases: 1, .. }));

        let err = RunPlan::new(usize::MAX, 1, cases(&["a", "b"])).unwrap_err();
        assert!(matches!(err, PlanError::TooLarge { .. }));
    }

    #[test]
    fn test_huge_plan_schedules_lazily() {
        let plan = RunPlan::new(usize::MAX / 2, 2, cases(&["a"])).unwrap();
        assert_eq!(plan.len(), (usize::MAX / 2) * 2);

        let mut schedule = plan.schedule();
        let first = schedule.next().unwrap();
        assert_eq!((first.iteration, first.loop_index), (0, 0));
        let second = schedule.next().unwrap();
        assert_eq!((second.iteration, second.loop_index), (0, 1));
        assert_eq!(schedule.len(), plan.len() - 2);
    }

    #[test]
    fn test_size_hint_shrinks() {
        let plan = RunPlan::new(1, 2, cases(&["a"])).unwrap();
        let mut schedule = plan.schedule();
        assert_eq!(schedule.len(), 2);
        schedule.next();
        assert_eq!(schedule.len(), 1);
        schedule.next();
        assert_eq!(schedule.len(), 0);
        assert!(schedule.next().is_none());
    }
}
