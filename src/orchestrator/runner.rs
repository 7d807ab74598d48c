//! Execution of single scheduled invocations.
//!
//! The [`TestRunner`] is responsible for running one [`ScheduledItem`]
//! through setup, body and teardown and turning whatever happens into an
//! [`Outcome`]. Nothing a test does escapes [`execute`](TestRunner::execute):
//! returned errors, panics and timeouts all become outcome statuses.
//!
//! # Status Mapping
//!
//! | Event | Status |
//! |-------|--------|
//! | skip predicate set, or step returns [`CaseError::Skip`] | Skipped |
//! | body returns [`CaseError::Assertion`] or panics | Failed |
//! | body returns [`CaseError::Fault`] | Errored |
//! | setup fails or panics | Errored |
//! | teardown fails after a passing body | Errored |
//! | time limit exceeded | Errored (`timeout: ...`) |
//! | skip predicate or timeout hook panics | Errored |
//!
//! Setup and body share one deadline. Teardown always runs after a
//! successful setup and gets a fresh window of the same length, so a timed
//! out body still gets cleaned up.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, warn};

use super::scheduler::ScheduledItem;
use crate::case::{CaseError, CaseResult, Invocation, Outcome, Status};

/// Runs scheduled invocations and converts their results into outcomes.
///
/// # Example
///
/// ```
/// use tlib::case::{CaseError, FnCase, Status};
/// use tlib::orchestrator::{RunPlan, TestRunner};
///
/// # tokio_test::block_on(async {
/// let failing = FnCase::new("y", || async { Err(CaseError::assertion("1 != 2")) });
/// let plan = RunPlan::new(1, 1, vec![failing.into_shared()]).unwrap();
/// let item = plan.schedule().next().unwrap();
///
/// let outcome = TestRunner::new(None).execute(&item).await;
/// assert_eq!(outcome.status, Status::Failed);
/// assert_eq!(outcome.message, "1 != 2");
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct TestRunner {
    default_timeout: Option<Duration>,
}

impl TestRunner {
    /// Creates a runner with the given default time limit.
    ///
    /// Cases returning their own [`timeout`](crate::case::TestCase::timeout)
    /// override the default.
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    /// Executes one scheduled invocation.
    ///
    /// Always returns an outcome.
    pub async fn execute(&self, item: &ScheduledItem) -> Outcome {
        let case = &item.case;
        let started_at = Utc::now();
        let start = Instant::now();

        let skip = match std::panic::catch_unwind(AssertUnwindSafe(|| case.skip_reason())) {
            Ok(skip) => skip,
            Err(payload) => {
                let verdict = hook_panicked("skip predicate", payload.as_ref());
                warn!("[{}] {}", case.id(), verdict.message);
                return verdict.into_outcome(item, started_at, start.elapsed(), String::new());
            }
        };
        if let Some(reason) = skip {
            debug!("[{}] skipped: {}", case.id(), reason);
            let verdict = Verdict::new(Status::Skipped, reason, None);
            return verdict.into_outcome(item, started_at, start.elapsed(), String::new());
        }

        let limit = match std::panic::catch_unwind(AssertUnwindSafe(|| case.timeout())) {
            Ok(limit) => limit.or(self.default_timeout),
            Err(payload) => {
                let verdict = hook_panicked("time limit lookup", payload.as_ref());
                warn!("[{}] {}", case.id(), verdict.message);
                return verdict.into_outcome(item, started_at, start.elapsed(), String::new());
            }
        };
        let deadline = limit.map(|limit| (tokio::time::Instant::now() + limit, limit));
        let mut ctx = Invocation::new(case.id(), item.iteration, item.loop_index);

        let verdict = match guarded(deadline, case.setup(&mut ctx)).await {
            Err(fault) => fault.setup_verdict(),
            Ok(()) => {
                let verdict = match guarded(deadline, case.body(&mut ctx)).await {
                    Ok(()) => Verdict::new(Status::Passed, String::new(), None),
                    Err(fault) => fault.body_verdict(),
                };
                let cleanup = limit.map(|limit| (tokio::time::Instant::now() + limit, limit));
                match guarded(cleanup, case.teardown(&mut ctx)).await {
                    Ok(()) => verdict,
                    Err(fault) => verdict.with_teardown_fault(fault),
                }
            }
        };

        let duration = start.elapsed();
        match verdict.status {
            Status::Errored => warn!(
                "[{}] iteration {} loop {} errored: {}",
                case.id(),
                item.iteration,
                item.loop_index,
                verdict.message
            ),
            status => debug!(
                "[{}] iteration {} loop {} {} in {:?}",
                case.id(),
                item.iteration,
                item.loop_index,
                status,
                duration
            ),
        }

        verdict.into_outcome(item, started_at, duration, ctx.into_output())
    }
}

/// Why one step of an invocation did not complete normally.
#[derive(Debug)]
enum StepFault {
    Case(CaseError),
    Panic(String),
    Timeout(Duration),
}

impl StepFault {
    fn setup_verdict(self) -> Verdict {
        match self {
            StepFault::Case(CaseError::Skip(reason)) => Verdict::new(Status::Skipped, reason, None),
            StepFault::Case(err) => Verdict::new(
                Status::Errored,
                format!("setup failed: {}", err.message()),
                err.traceback().map(str::to_string),
            ),
            StepFault::Panic(payload) => Verdict::new(
                Status::Errored,
                format!("setup panicked: {}", first_line(&payload)),
                Some(payload),
            ),
            StepFault::Timeout(limit) => Verdict::new(
                Status::Errored,
                format!("timeout: setup exceeded {:?}", limit),
                None,
            ),
        }
    }

    fn body_verdict(self) -> Verdict {
        match self {
            StepFault::Case(CaseError::Skip(reason)) => Verdict::new(Status::Skipped, reason, None),
            StepFault::Case(CaseError::Assertion { message, traceback }) => {
                Verdict::new(Status::Failed, message, traceback)
            }
            StepFault::Case(CaseError::Fault { message, traceback }) => {
                Verdict::new(Status::Errored, message, traceback)
            }
            // assert! and friends report through panics
            StepFault::Panic(payload) => {
                Verdict::new(Status::Failed, first_line(&payload).to_string(), Some(payload))
            }
            StepFault::Timeout(limit) => Verdict::new(
                Status::Errored,
                format!("timeout: exceeded {:?}", limit),
                None,
            ),
        }
    }

    fn teardown_summary(&self) -> (String, Option<String>) {
        match self {
            StepFault::Case(err) => (
                format!("teardown failed: {}", err.message()),
                err.traceback().map(str::to_string),
            ),
            StepFault::Panic(payload) => (
                format!("teardown panicked: {}", first_line(payload)),
                Some(payload.clone()),
            ),
            StepFault::Timeout(limit) => (format!("timeout: teardown exceeded {:?}", limit), None),
        }
    }
}

/// Status and diagnostics of an invocation before it becomes an outcome.
#[derive(Debug)]
struct Verdict {
    status: Status,
    message: String,
    traceback: Option<String>,
}

impl Verdict {
    fn new(status: Status, message: String, traceback: Option<String>) -> Self {
        Self {
            status,
            message,
            traceback,
        }
    }

    /// A teardown fault dominates a clean body. After a failed body it is
    /// appended to the diagnostics instead.
    fn with_teardown_fault(self, fault: StepFault) -> Self {
        if matches!(fault, StepFault::Case(CaseError::Skip(_))) {
            return self;
        }
        let (message, detail) = fault.teardown_summary();

        if self.status.is_success() {
            return Verdict::new(Status::Errored, message, detail);
        }

        let mut traceback = self.traceback.unwrap_or_default();
        if !traceback.is_empty() && !traceback.ends_with('\n') {
            traceback.push('\n');
        }
        traceback.push_str(&message);
        if let Some(detail) = detail {
            traceback.push('\n');
            traceback.push_str(&detail);
        }
        Verdict::new(self.status, self.message, Some(traceback))
    }

    fn into_outcome(
        self,
        item: &ScheduledItem,
        started_at: chrono::DateTime<Utc>,
        duration: Duration,
        captured_output: String,
    ) -> Outcome {
        Outcome {
            case_id: item.case_id().to_string(),
            iteration: item.iteration,
            loop_index: item.loop_index,
            sequence: item.sequence,
            status: self.status,
            started_at,
            duration,
            message: self.message,
            traceback: self.traceback,
            captured_output,
        }
    }
}

/// Runs one step, catching panics and enforcing the deadline.
async fn guarded<F>(
    deadline: Option<(tokio::time::Instant, Duration)>,
    step: F,
) -> Result<(), StepFault>
where
    F: Future<Output = CaseResult>,
{
    let step = AssertUnwindSafe(step).catch_unwind();
    let result = match deadline {
        Some((at, limit)) => match tokio::time::timeout_at(at, step).await {
            Ok(result) => result,
            Err(_) => return Err(StepFault::Timeout(limit)),
        },
        None => step.await,
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(StepFault::Case(err)),
        Err(payload) => Err(StepFault::Panic(panic_message(payload.as_ref()))),
    }
}

/// A panic in one of the case's synchronous hooks errors the invocation.
fn hook_panicked(hook: &str, payload: &(dyn Any + Send)) -> Verdict {
    let payload = panic_message(payload);
    Verdict::new(
        Status::Errored,
        format!("{hook} panicked: {}", first_line(&payload)),
        Some(payload),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{FnCase, TestCase};
    use crate::orchestrator::RunPlan;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn run_once(case: impl TestCase + 'static) -> Outcome {
        let case: Arc<dyn TestCase> = Arc::new(case);
        let plan = RunPlan::new(1, 1, vec![case]).unwrap();
        let item = plan.schedule().next().unwrap();
        TestRunner::new(None).execute(&item).await
    }

    #[tokio::test]
    async fn test_passing_case() {
        let outcome = run_once(FnCase::new("x", || async { Ok(()) })).await;
        assert_eq!(outcome.status, Status::Passed);
        assert!(outcome.message.is_empty());
        assert_eq!(outcome.traceback, None);
    }

    #[tokio::test]
    async fn test_assertion_is_failed() {
        let case = FnCase::new("y", || async {
            Err(CaseError::assertion("expected 3").with_traceback("frame 1\nframe 2"))
        });
        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.message, "expected 3");
        assert_eq!(outcome.traceback.as_deref(), Some("frame 1\nframe 2"));
    }

    #[tokio::test]
    async fn test_panicking_body_is_failed() {
        let case = FnCase::new("p", || async {
            assert_eq!(1 + 1, 3, "arithmetic drifted");
            Ok(())
        });
        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Failed);
        assert!(outcome.traceback.unwrap().contains("arithmetic drifted"));
    }

    #[tokio::test]
    async fn test_fault_in_body_is_errored() {
        let case = FnCase::new("f", || async { Err(CaseError::fault("socket closed")) });
        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Errored);
        assert_eq!(outcome.message, "socket closed");
    }

    #[tokio::test]
    async fn test_setup_fault_skips_body_and_teardown() {
        let ran = Arc::new(AtomicUsize::new(0));
        let body_ran = Arc::clone(&ran);
        let teardown_ran = Arc::clone(&ran);
        let case = FnCase::new("s", move || {
            let ran = Arc::clone(&body_ran);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .with_setup(|| async { Err(CaseError::fault("no database")) })
        .with_teardown(move || {
            let ran = Arc::clone(&teardown_ran);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Errored);
        assert_eq!(outcome.message, "setup failed: no database");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_teardown_fault_dominates_pass() {
        let case = FnCase::new("z", || async { Ok(()) })
            .with_teardown(|| async { Err(CaseError::fault("temp dir busy")) });
        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Errored);
        assert_eq!(outcome.message, "teardown failed: temp dir busy");
    }

    #[tokio::test]
    async fn test_teardown_fault_after_failure_keeps_failure() {
        let case = FnCase::new("z", || async { Err(CaseError::assertion("bad value")) })
            .with_teardown(|| async { Err(CaseError::fault("temp dir busy")) });
        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.message, "bad value");
        assert!(
            outcome
                .traceback
                .unwrap()
                .contains("teardown failed: temp dir busy")
        );
    }

    #[tokio::test]
    async fn test_skip_predicate() {
        let case = FnCase::new("k", || async { Err(CaseError::fault("must not run")) })
            .skipped("needs hardware");
        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Skipped);
        assert_eq!(outcome.message, "needs hardware");
    }

    #[tokio::test]
    async fn test_skip_requested_by_body() {
        let case = FnCase::new("k", || async { Err(CaseError::skip("feature flag off")) });
        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Skipped);
        assert_eq!(outcome.message, "feature flag off");
    }

    #[tokio::test]
    async fn test_timeout_is_errored_and_teardown_runs() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleaned);
        let case = FnCase::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .with_teardown(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .with_timeout(Duration::from_millis(20));

        let outcome = run_once(case).await;
        assert_eq!(outcome.status, Status::Errored);
        assert!(outcome.message.starts_with("timeout"));
        assert!(outcome.duration < Duration::from_secs(30));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_timeout_applies() {
        let case = FnCase::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let plan = RunPlan::new(1, 1, vec![case.into_shared()]).unwrap();
        let item = plan.schedule().next().unwrap();

        let outcome = TestRunner::new(Some(Duration::from_millis(20)))
            .execute(&item)
            .await;
        assert_eq!(outcome.status, Status::Errored);
        assert!(outcome.message.starts_with("timeout"));
    }

    struct PanickyHooks {
        in_skip: bool,
    }

    #[async_trait]
    impl TestCase for PanickyHooks {
        fn id(&self) -> &str {
            "hooks"
        }

        async fn body(&self, _ctx: &mut Invocation) -> CaseResult {
            Ok(())
        }

        fn skip_reason(&self) -> Option<String> {
            if self.in_skip {
                panic!("skip predicate exploded");
            }
            None
        }

        fn timeout(&self) -> Option<Duration> {
            if !self.in_skip {
                panic!("timeout lookup exploded");
            }
            None
        }
    }

    #[tokio::test]
    async fn test_panicking_skip_predicate_is_errored() {
        let outcome = run_once(PanickyHooks { in_skip: true }).await;
        assert_eq!(outcome.status, Status::Errored);
        assert_eq!(outcome.message, "skip predicate panicked: skip predicate exploded");
        assert_eq!(outcome.case_id, "hooks");
    }

    #[tokio::test]
    async fn test_panicking_timeout_hook_is_errored() {
        let outcome = run_once(PanickyHooks { in_skip: false }).await;
        assert_eq!(outcome.status, Status::Errored);
        assert_eq!(outcome.message, "time limit lookup panicked: timeout lookup exploded");
    }

    struct Fixtured;

    #[async_trait]
    impl TestCase for Fixtured {
        fn id(&self) -> &str {
            "fixtured"
        }

        async fn setup(&self, ctx: &mut Invocation) -> CaseResult {
            ctx.insert(Vec::<usize>::new());
            Ok(())
        }

        async fn body(&self, ctx: &mut Invocation) -> CaseResult {
            let loop_index = ctx.loop_index();
            let items = ctx
                .get_mut::<Vec<usize>>()
                .ok_or_else(|| CaseError::fault("fixture missing"))?;
            if !items.is_empty() {
                return Err(CaseError::assertion("fixture leaked from a previous loop"));
            }
            items.push(loop_index);
            ctx.capture(&format!("loop {}", loop_index));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fixtures_are_fresh_per_loop() {
        let case: Arc<dyn TestCase> = Arc::new(Fixtured);
        let plan = RunPlan::new(1, 3, vec![case]).unwrap();
        let runner = TestRunner::new(None);
        for item in plan.schedule() {
            let outcome = runner.execute(&item).await;
            assert_eq!(outcome.status, Status::Passed, "{}", outcome.message);
            assert_eq!(outcome.captured_output, format!("loop {}\n", item.loop_index));
        }
    }
}
