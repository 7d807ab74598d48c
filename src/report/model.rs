//! The report data model and the pure renderer that builds it.
//!
//! [`render`] is a projection: it takes the outcome snapshot of a finished
//! (or stopped) run plus its metadata and derives everything else. Nothing
//! here touches the file system; the artifact writers live in the sibling
//! modules.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::case::{Outcome, Status};

/// Descriptive information about one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    /// Unique identifier of the run.
    pub run_id: String,

    /// Report title.
    pub title: String,

    /// Free-form description.
    pub description: String,

    /// When the run entered `Running`.
    pub started_at: DateTime<Utc>,

    /// When the run entered `Finalizing`.
    pub finished_at: DateTime<Utc>,

    /// Number of items the schedule contained.
    pub planned: usize,

    /// Whether the run was stopped before the schedule was exhausted.
    pub partial: bool,
}

impl RunMetadata {
    /// Creates metadata for a run starting now.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            started_at: now,
            finished_at: now,
            planned: 0,
            partial: false,
        }
    }

    /// Wall-clock duration of the run.
    ///
    /// Zero when the clock went backwards.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Ratio of passed invocations to invocations that counted.
///
/// Skipped invocations do not count. When nothing counted the rate is
/// [`NotApplicable`](Self::NotApplicable) rather than 0% or 100%.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PassRate {
    /// `passed / (total - skipped)`, in `[0.0, 1.0]`.
    Rate(f64),
    /// Every invocation was skipped, or there were none.
    NotApplicable,
}

impl PassRate {
    /// Computes the pass rate from counts.
    ///
    /// ```
    /// use tlib::report::PassRate;
    ///
    /// assert_eq!(PassRate::compute(1, 2, 0), PassRate::Rate(0.5));
    /// assert_eq!(PassRate::compute(0, 3, 3), PassRate::NotApplicable);
    /// assert_eq!(PassRate::compute(0, 0, 0).to_string(), "n/a");
    /// ```
    pub fn compute(passed: usize, total: usize, skipped: usize) -> Self {
        match total.saturating_sub(skipped) {
            0 => PassRate::NotApplicable,
            counted => PassRate::Rate(passed as f64 / counted as f64),
        }
    }

    /// Returns the ratio, if applicable.
    pub fn value(&self) -> Option<f64> {
        match self {
            PassRate::Rate(rate) => Some(*rate),
            PassRate::NotApplicable => None,
        }
    }
}

impl fmt::Display for PassRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassRate::Rate(rate) => write!(f, "{:.1}%", rate * 100.0),
            PassRate::NotApplicable => f.write_str("n/a"),
        }
    }
}

/// Outcome counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl Counts {
    fn record(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Passed => self.passed += 1,
            Status::Failed => self.failed += 1,
            Status::Errored => self.errored += 1,
            Status::Skipped => self.skipped += 1,
        }
    }

    /// Pass rate over these counts.
    pub fn pass_rate(&self) -> PassRate {
        PassRate::compute(self.passed, self.total, self.skipped)
    }
}

/// All outcomes of one case, ordered by `(iteration, loop_index)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub case_id: String,
    pub counts: Counts,
    pub pass_rate: PassRate,

    /// Sum of invocation durations. May exceed the run duration when
    /// invocations overlapped.
    pub busy: Duration,

    pub outcomes: Vec<Outcome>,
}

impl CaseReport {
    fn new(case_id: String) -> Self {
        Self {
            case_id,
            counts: Counts::default(),
            pass_rate: PassRate::NotApplicable,
            busy: Duration::ZERO,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, outcome: Outcome) {
        self.counts.record(outcome.status);
        self.pass_rate = self.counts.pass_rate();
        self.busy += outcome.duration;
        self.outcomes.push(outcome);
    }
}

/// The aggregate view over all outcomes of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub metadata: RunMetadata,
    pub counts: Counts,
    pub pass_rate: PassRate,

    /// Wall-clock duration of the run, not the sum of invocation durations.
    pub duration: Duration,

    /// Per-case groups, ordered by case ID.
    pub cases: Vec<CaseReport>,

    /// Failed and errored outcomes in report order.
    pub failures: Vec<Outcome>,
}

impl Report {
    /// Returns `true` if nothing failed or errored.
    pub fn success(&self) -> bool {
        self.counts.failed == 0 && self.counts.errored == 0
    }

    /// Returns `true` if the run was stopped early.
    pub fn is_partial(&self) -> bool {
        self.metadata.partial
    }

    /// Every outcome that did not pass, in report order.
    pub fn non_passed(&self) -> impl Iterator<Item = &Outcome> {
        self.cases
            .iter()
            .flat_map(|case| &case.outcomes)
            .filter(|o| o.status != Status::Passed)
    }

    /// Returns an appropriate process exit code for this report.
    ///
    /// | Code | Meaning |
    /// |------|---------|
    /// | 0 | Complete run, nothing failed |
    /// | 1 | Some invocations failed or errored |
    /// | 2 | Stopped early, nothing failed so far |
    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.is_partial() {
            2
        } else {
            0
        }
    }
}

/// Builds a report from outcomes in any order.
///
/// Outcomes are sorted by `(case_id, iteration, loop_index)` and grouped by
/// case ID.
///
/// # Example
///
/// ```
/// use tlib::report::{render, PassRate, RunMetadata};
///
/// let report = render(Vec::new(), RunMetadata::new("empty", ""));
/// assert_eq!(report.counts.total, 0);
/// assert_eq!(report.pass_rate, PassRate::NotApplicable);
/// assert!(report.success());
/// ```
pub fn render(mut outcomes: Vec<Outcome>, metadata: RunMetadata) -> Report {
    outcomes.sort_by(|a, b| a.key().cmp(&b.key()));

    let mut counts = Counts::default();
    let mut cases: Vec<CaseReport> = Vec::new();
    let mut failures = Vec::new();

    for outcome in outcomes {
        counts.record(outcome.status);
        if matches!(outcome.status, Status::Failed | Status::Errored) {
            failures.push(outcome.clone());
        }
        match cases.last_mut() {
            Some(case) if case.case_id == outcome.case_id => case.push(outcome),
            _ => {
                let mut case = CaseReport::new(outcome.case_id.clone());
                case.push(outcome);
                cases.push(case);
            }
        }
    }

    Report {
        duration: metadata.duration(),
        pass_rate: counts.pass_rate(),
        metadata,
        counts,
        cases,
        failures,
    }
}
