//! Test case abstraction and per-invocation outcome types.
//!
//! A test case is anything that exposes the `{setup, body, teardown}`
//! capability set of [`TestCase`]. The engine never inspects what a case
//! does; it invokes the three steps, measures them, and turns whatever
//! happens into an [`Outcome`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TestCase                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  skip_reason() ─── Some ──► Outcome { status: Skipped }      │
//! │        │                                                     │
//! │       None                                                   │
//! │        ▼                                                     │
//! │  setup(&mut Invocation) ─► body(..) ─► teardown(..)          │
//! │                                 │                            │
//! │                                 ▼                            │
//! │                   Outcome { Passed | Failed | Errored }      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every invocation gets a fresh [`Invocation`], so fixture state stored in
//! it during `setup` cannot leak into the next loop repetition.
//!
//! # Built-in Cases
//!
//! | Implementation | Unit of work |
//! |----------------|--------------|
//! | [`FnCase`] | async closures |
//! | [`shell::ShellCase`] | shell commands |
//!
//! # Example
//!
//! ```
//! use tlib::case::{CaseError, FnCase};
//!
//! let case = FnCase::new("math::add", || async {
//!     if 1 + 1 == 2 {
//!         Ok(())
//!     } else {
//!         Err(CaseError::assertion("1 + 1 != 2"))
//!     }
//! })
//! .with_teardown(|| async { Ok(()) });
//! ```

pub mod shell;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Result type returned by every step of a test case.
pub type CaseResult<T = ()> = Result<T, CaseError>;

/// Faults a test case step can report.
///
/// The variant decides the outcome status: an [`Assertion`](Self::Assertion)
/// raised by the body is a failure, a [`Skip`](Self::Skip) opts the
/// invocation out, and a [`Fault`](Self::Fault) is an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaseError {
    /// An expectation of the case did not hold.
    #[error("assertion failed: {message}")]
    Assertion {
        /// Short description of the failed expectation.
        message: String,
        /// Detailed diagnostic text, reported verbatim.
        traceback: Option<String>,
    },

    /// The case opted out of this invocation.
    #[error("skipped: {0}")]
    Skip(String),

    /// Any other fault: fixtures, resources, I/O.
    #[error("{message}")]
    Fault {
        /// Short description of the fault.
        message: String,
        /// Detailed diagnostic text, reported verbatim.
        traceback: Option<String>,
    },
}

impl CaseError {
    /// Creates an assertion failure.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion {
            message: message.into(),
            traceback: None,
        }
    }

    /// Creates a non-assertion fault.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault {
            message: message.into(),
            traceback: None,
        }
    }

    /// Creates a skip request.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    /// Attaches diagnostic text. Has no effect on [`Skip`](Self::Skip).
    pub fn with_traceback(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Self::Assertion { traceback, .. } | Self::Fault { traceback, .. } => {
                *traceback = Some(text.into());
            }
            Self::Skip(_) => {}
        }
        self
    }

    /// Returns the short message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Assertion { message, .. } | Self::Fault { message, .. } => message,
            Self::Skip(reason) => reason,
        }
    }

    /// Returns the diagnostic text, if any.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Self::Assertion { traceback, .. } | Self::Fault { traceback, .. } => {
                traceback.as_deref()
            }
            Self::Skip(_) => None,
        }
    }
}

impl From<std::io::Error> for CaseError {
    fn from(err: std::io::Error) -> Self {
        Self::fault(format!("I/O error: {err}"))
    }
}

impl From<anyhow::Error> for CaseError {
    fn from(err: anyhow::Error) -> Self {
        Self::fault(err.to_string()).with_traceback(format!("{err:?}"))
    }
}

/// Per-invocation context handed to every step of a case.
///
/// Holds the invocation's coordinates, captured output, and typed fixture
/// slots. A new context is created for each scheduled invocation and
/// dropped once its outcome is recorded.
pub struct Invocation {
    case_id: String,
    iteration: usize,
    loop_index: usize,
    output: String,
    fixtures: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Invocation {
    /// Creates an empty context for one invocation.
    pub fn new(case_id: impl Into<String>, iteration: usize, loop_index: usize) -> Self {
        Self {
            case_id: case_id.into(),
            iteration,
            loop_index,
            output: String::new(),
            fixtures: HashMap::new(),
        }
    }

    /// Returns the ID of the case being invoked.
    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// Returns the zero-based iteration index.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Returns the zero-based loop index within the iteration.
    pub fn loop_index(&self) -> usize {
        self.loop_index
    }

    /// Appends text to the captured output, newline-terminated.
    pub fn capture(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.output.push_str(text);
        if !text.ends_with('\n') {
            self.output.push('\n');
        }
    }

    /// Returns the output captured so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Stores a fixture value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send>(&mut self, value: T) {
        self.fixtures.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns a fixture value stored during this invocation.
    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.fixtures
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    /// Returns a mutable reference to a fixture value.
    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.fixtures
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut())
    }

    /// Removes and returns a fixture value.
    pub fn take<T: Any + Send>(&mut self) -> Option<T> {
        self.fixtures
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|v| *v)
    }

    /// Consumes the context, returning the captured output.
    pub fn into_output(self) -> String {
        self.output
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("case_id", &self.case_id)
            .field("iteration", &self.iteration)
            .field("loop_index", &self.loop_index)
            .field("fixtures", &self.fixtures.len())
            .finish()
    }
}

/// A schedulable unit of work.
///
/// Only [`id`](Self::id) and [`body`](Self::body) are required. Setup and
/// teardown run around every single invocation, including each loop
/// repetition of the same case.
///
/// # Thread Safety
///
/// Cases are shared across worker tasks as `Arc<dyn TestCase>`, so they
/// must be `Send + Sync`. A case that cannot run concurrently with itself
/// returns `false` from [`concurrent_safe`](Self::concurrent_safe); the
/// engine then serializes its invocations.
#[async_trait]
pub trait TestCase: Send + Sync {
    /// Unique identifier of this case within a run.
    fn id(&self) -> &str;

    /// Prepares fixtures for one invocation.
    async fn setup(&self, _ctx: &mut Invocation) -> CaseResult {
        Ok(())
    }

    /// The test itself.
    async fn body(&self, ctx: &mut Invocation) -> CaseResult;

    /// Releases fixtures after one invocation.
    ///
    /// Runs whenever setup succeeded, regardless of how the body ended.
    async fn teardown(&self, _ctx: &mut Invocation) -> CaseResult {
        Ok(())
    }

    /// Returns a reason when the case should be skipped.
    fn skip_reason(&self) -> Option<String> {
        None
    }

    /// Whether invocations of this case may overlap each other.
    fn concurrent_safe(&self) -> bool {
        true
    }

    /// Per-invocation time limit overriding the run default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

type StepFn = Arc<dyn Fn() -> BoxFuture<'static, CaseResult> + Send + Sync>;

fn step<F, Fut>(f: F) -> StepFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CaseResult> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// A test case assembled from async closures.
///
/// State that must be shared between the steps is captured by the closures
/// themselves (usually behind an `Arc`).
#[derive(Clone)]
pub struct FnCase {
    id: String,
    setup: Option<StepFn>,
    body: StepFn,
    teardown: Option<StepFn>,
    skip: Option<String>,
    concurrent_safe: bool,
    timeout: Option<Duration>,
}

impl FnCase {
    /// Creates a case with the given ID and body.
    pub fn new<F, Fut>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CaseResult> + Send + 'static,
    {
        Self {
            id: id.into(),
            setup: None,
            body: step(body),
            teardown: None,
            skip: None,
            concurrent_safe: true,
            timeout: None,
        }
    }

    /// Sets the setup step.
    pub fn with_setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CaseResult> + Send + 'static,
    {
        self.setup = Some(step(f));
        self
    }

    /// Sets the teardown step.
    pub fn with_teardown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CaseResult> + Send + 'static,
    {
        self.teardown = Some(step(f));
        self
    }

    /// Marks the case as skipped with the given reason.
    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    /// Forbids overlapping invocations of this case.
    pub fn serial(mut self) -> Self {
        self.concurrent_safe = false;
        self
    }

    /// Sets the per-invocation time limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wraps the case for use in a run.
    pub fn into_shared(self) -> Arc<dyn TestCase> {
        Arc::new(self)
    }
}

impl fmt::Debug for FnCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCase")
            .field("id", &self.id)
            .field("has_setup", &self.setup.is_some())
            .field("has_teardown", &self.teardown.is_some())
            .field("skip", &self.skip)
            .field("concurrent_safe", &self.concurrent_safe)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl TestCase for FnCase {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&self, _ctx: &mut Invocation) -> CaseResult {
        match &self.setup {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    async fn body(&self, _ctx: &mut Invocation) -> CaseResult {
        (self.body)().await
    }

    async fn teardown(&self, _ctx: &mut Invocation) -> CaseResult {
        match &self.teardown {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    fn skip_reason(&self) -> Option<String> {
        self.skip.clone()
    }

    fn concurrent_safe(&self) -> bool {
        self.concurrent_safe
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// The status of one invocation.
///
/// | Status | Meaning | Counts toward pass rate? |
/// |--------|---------|--------------------------|
/// | Passed | Body held, fixtures clean | Yes |
/// | Failed | An assertion in the body did not hold | Yes |
/// | Errored | Setup, teardown, timeout, or other fault | Yes |
/// | Skipped | The case opted out | No |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The invocation succeeded.
    Passed,
    /// An assertion did not hold.
    Failed,
    /// The invocation could not complete normally.
    Errored,
    /// The case opted out.
    Skipped,
}

impl Status {
    /// Returns `true` for statuses that do not fail a run.
    ///
    /// ```
    /// use tlib::case::Status;
    ///
    /// assert!(Status::Passed.is_success());
    /// assert!(Status::Skipped.is_success());
    /// assert!(!Status::Failed.is_success());
    /// assert!(!Status::Errored.is_success());
    /// ```
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Passed | Status::Skipped)
    }

    /// Upper-case label used in console and HTML output.
    pub fn label(&self) -> &'static str {
        match self {
            Status::Passed => "PASS",
            Status::Failed => "FAIL",
            Status::Errored => "ERROR",
            Status::Skipped => "SKIP",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Passed => "passed",
            Status::Failed => "failed",
            Status::Errored => "errored",
            Status::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The recorded result of one scheduled invocation.
///
/// Created by the engine right after the invocation completes and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// ID of the invoked case.
    pub case_id: String,

    /// Zero-based iteration index.
    pub iteration: usize,

    /// Zero-based loop index within the iteration.
    pub loop_index: usize,

    /// Position of the invocation in the schedule.
    pub sequence: usize,

    /// How the invocation ended.
    pub status: Status,

    /// Wall-clock time the invocation started.
    pub started_at: DateTime<Utc>,

    /// Time spent in setup, body and teardown.
    pub duration: Duration,

    /// Human-readable summary; empty for passed invocations.
    pub message: String,

    /// Detailed diagnostics for non-passed invocations.
    pub traceback: Option<String>,

    /// Output captured by the case while it ran.
    #[serde(default)]
    pub captured_output: String,
}

impl Outcome {
    /// Returns `(case_id, iteration, loop_index)` for ordering.
    pub fn key(&self) -> (&str, usize, usize) {
        (&self.case_id, self.iteration, self.loop_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_error_accessors() {
        let err = CaseError::assertion("x != y").with_traceback("at line 3");
        assert_eq!(err.message(), "x != y");
        assert_eq!(err.traceback(), Some("at line 3"));
        assert_eq!(err.to_string(), "assertion failed: x != y");

        let skip = CaseError::skip("not today").with_traceback("ignored");
        assert_eq!(skip.message(), "not today");
        assert_eq!(skip.traceback(), None);
    }

    #[test]
    fn test_io_error_is_fault() {
        let err: CaseError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, CaseError::Fault { .. }));
        assert!(err.message().contains("disk gone"));
    }

    #[test]
    fn test_invocation_fixtures() {
        let mut ctx = Invocation::new("case", 1, 2);
        assert_eq!(ctx.iteration(), 1);
        assert_eq!(ctx.loop_index(), 2);
        assert!(ctx.get::<Vec<u32>>().is_none());

        ctx.insert(vec![1u32, 2]);
        ctx.get_mut::<Vec<u32>>().unwrap().push(3);
        assert_eq!(ctx.get::<Vec<u32>>(), Some(&vec![1, 2, 3]));
        assert_eq!(ctx.take::<Vec<u32>>(), Some(vec![1, 2, 3]));
        assert!(ctx.get::<Vec<u32>>().is_none());
    }

    #[test]
    fn test_invocation_capture_terminates_lines() {
        let mut ctx = Invocation::new("case", 0, 0);
        ctx.capture("first");
        ctx.capture("");
        ctx.capture("second\n");
        assert_eq!(ctx.into_output(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_fn_case_steps() {
        let case = FnCase::new("c", || async { Err(CaseError::assertion("nope")) })
            .with_setup(|| async { Ok(()) })
            .serial()
            .with_timeout(Duration::from_secs(1));
        let mut ctx = Invocation::new("c", 0, 0);

        assert!(case.setup(&mut ctx).await.is_ok());
        assert!(matches!(
            case.body(&mut ctx).await,
            Err(CaseError::Assertion { .. })
        ));
        assert!(case.teardown(&mut ctx).await.is_ok());
        assert!(!case.concurrent_safe());
        assert_eq!(case.timeout(), Some(Duration::from_secs(1)));
        assert_eq!(case.skip_reason(), None);
    }
}
