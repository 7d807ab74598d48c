//! Run orchestration.
//!
//! This module ties the pieces of a run together: it validates the plan,
//! dispatches scheduled items over a bounded worker pool, collects their
//! outcomes, renders the report and hands it to the artifact writers and
//! the notifier.
//!
//! # Architecture
//!
//! ```text
//!   cases + [run] config
//!          │
//!          ▼
//!      RunPlan ──── schedule() ────► ScheduledItem, ScheduledItem, ...
//!                                          │
//!                             Semaphore (workers permits)
//!                                          │
//!                                          ▼
//!                                     TestRunner::execute
//!                                          │
//!                                          ▼
//!                                  OutcomeCollector::record ──► Reporter::on_outcome
//!                                          │
//!                                          ▼ (schedule exhausted or stopped)
//!                                  render() ──► Report
//!                                          │
//!                     ┌────────────────────┼─────────────────────┐
//!                     ▼                    ▼                     ▼
//!               HTML / JUnit / JSON     Notifier         Reporter::on_run_complete
//! ```
//!
//! # Run States
//!
//! ```text
//! Idle ──► Planning ──► Running ──► Finalizing ──► Done
//!   ▲          │           │
//!   └──────────┘           └──► Faulted
//!  (invalid plan)          (engine fault)
//! ```
//!
//! `Done` and `Faulted` are terminal; an orchestrator runs at most once.
//!
//! # Example
//!
//! ```no_run
//! use tlib::case::shell::ShellCase;
//! use tlib::config::load_config;
//! use tlib::orchestrator::Orchestrator;
//! use tlib::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("tlib.toml"))?;
//!     let cases = config
//!         .cases
//!         .iter()
//!         .map(|c| ShellCase::from_config(c).into_shared())
//!         .collect();
//!
//!     let mut orchestrator = Orchestrator::new(config, ConsoleReporter::new(false));
//!     let report = orchestrator.run(cases).await?;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod collector;
pub mod runner;
pub mod scheduler;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::case::{Outcome, TestCase};
use crate::config::Config;
use crate::notify::{Notifier, NullNotifier};
use crate::report::{
    Report, Reporter, RunMetadata, render, render_html, write_html, write_json, write_junit,
};

pub use collector::OutcomeCollector;
pub use runner::TestRunner;
pub use scheduler::{PlanError, RunPlan, Schedule, ScheduledItem, schedule};

type ArtifactWriter = fn(&Report, &Path) -> anyhow::Result<()>;

/// Lifecycle state of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Not started.
    Idle,
    /// Validating the plan.
    Planning,
    /// Dispatching scheduled items.
    Running,
    /// Rendering the report and writing artifacts.
    Finalizing,
    /// The run completed, fully or after a stop request.
    Done,
    /// The run machinery failed.
    Faulted,
}

impl RunState {
    /// Returns `true` if the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Running)
                | (Planning, Idle)
                | (Running, Finalizing)
                | (Running, Faulted)
                | (Finalizing, Done)
        )
    }

    /// Returns `true` for `Done` and `Faulted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Faulted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors that prevent a run from producing a report.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The plan was rejected before anything ran.
    #[error(transparent)]
    InvalidPlan(#[from] PlanError),

    /// The dispatch machinery failed. Remaining items were abandoned.
    #[error("engine fault: {message}")]
    EngineFault {
        /// Description of the fault.
        message: String,
        /// Outcomes recorded before the fault.
        outcomes: Vec<Outcome>,
    },

    /// The orchestrator is not in a state that allows the operation.
    #[error("invalid run state transition from {from} to {to}")]
    InvalidState { from: RunState, to: RunState },
}

/// Drives a single run from plan validation to the finished report.
///
/// The reporter is shared with worker tasks, so it must be `'static`.
pub struct Orchestrator<R> {
    config: Config,
    reporter: Arc<R>,
    notifier: Box<dyn Notifier>,
    stop: CancellationToken,
    state: RunState,
}

impl<R> Orchestrator<R>
where
    R: Reporter + 'static,
{
    /// Creates an orchestrator with the given configuration and reporter.
    ///
    /// Notification is disabled until a notifier is set with
    /// [`with_notifier`](Self::with_notifier).
    pub fn new(config: Config, reporter: R) -> Self {
        Self {
            config,
            reporter: Arc::new(reporter),
            notifier: Box::new(NullNotifier),
            stop: CancellationToken::new(),
            state: RunState::Idle,
        }
    }

    /// Sets the notifier invoked when `[notify]` lists recipients.
    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    /// Uses an externally owned stop signal.
    ///
    /// Cancelling the token stops the dispatch of new items. Items already
    /// running finish and the run completes with a partial report.
    pub fn with_stop_token(mut self, token: CancellationToken) -> Self {
        self.stop = token;
        self
    }

    /// Returns a handle to the stop signal.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) -> Result<(), RunError> {
        if !self.state.can_transition_to(next) {
            return Err(RunError::InvalidState {
                from: self.state,
                to: next,
            });
        }
        debug!("Run state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Runs the cases under the configured schedule.
    ///
    /// # Returns
    ///
    /// The [`Report`] of every run that reached finalization, including
    /// runs stopped through the stop token.
    ///
    /// # Errors
    ///
    /// - [`RunError::InvalidPlan`] if the schedule parameters or case IDs
    ///   are invalid. Nothing runs and the orchestrator returns to `Idle`.
    /// - [`RunError::EngineFault`] if a worker task fails outside a test
    ///   invocation. The orchestrator ends in `Faulted`.
    /// - [`RunError::InvalidState`] if the orchestrator already ran.
    pub async fn run(&mut self, cases: Vec<Arc<dyn TestCase>>) -> Result<Report, RunError> {
        self.transition(RunState::Planning)?;

        let plan = match RunPlan::new(self.config.run.iterations, self.config.run.loops, cases) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Rejected run plan: {}", e);
                self.transition(RunState::Idle)?;
                return Err(e.into());
            }
        };

        self.transition(RunState::Running)?;

        let mut metadata = RunMetadata::new(
            self.config.run.title.clone(),
            self.config.run.description.clone(),
        );
        metadata.planned = plan.len();
        info!(
            "Run {} started: {} cases x {} iterations x {} loops on {} workers",
            metadata.run_id,
            plan.cases().len(),
            plan.iterations(),
            plan.loops(),
            self.config.run.workers.max(1)
        );

        self.reporter.on_run_start(&plan).await;

        let collector = Arc::new(OutcomeCollector::new());
        if let Err(message) = self.dispatch(&plan, &collector).await {
            error!("Engine fault, abandoning run: {}", message);
            collector.annotate_fault(message.clone());
            self.transition(RunState::Faulted)?;
            return Err(RunError::EngineFault {
                message,
                outcomes: collector.snapshot(),
            });
        }

        metadata.finished_at = Utc::now();
        metadata.partial = collector.len() < plan.len();
        if metadata.partial {
            warn!(
                "Run stopped after {} of {} invocations",
                collector.len(),
                plan.len()
            );
        }

        self.transition(RunState::Finalizing)?;

        let report = render(collector.snapshot(), metadata);
        self.write_artifacts(&report);
        self.send_notification(&report).await;
        self.reporter.on_run_complete(&report).await;

        self.transition(RunState::Done)?;
        Ok(report)
    }

    /// Executes the schedule until it is exhausted or the stop token fires.
    ///
    /// Returns the fault message if the machinery failed.
    async fn dispatch(
        &self,
        plan: &RunPlan,
        collector: &Arc<OutcomeCollector>,
    ) -> Result<(), String> {
        let workers = self.config.run.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let runner = Arc::new(TestRunner::new(self.config.run.timeout()));
        let mut ready = ReadyQueue::new(plan, workers - 1);

        let mut tasks = JoinSet::new();

        while let Some((item, serial)) = ready.next(&self.stop).await {
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        let message = format!("worker pool closed: {}", e);
                        return Err(abandon(&mut tasks, message).await);
                    }
                },
            };
            if self.stop.is_cancelled() {
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    return Err(abandon(&mut tasks, worker_fault(e)).await);
                }
            }

            let runner = Arc::clone(&runner);
            let collector = Arc::clone(collector);
            let reporter = Arc::clone(&self.reporter);

            tasks.spawn(async move {
                reporter.on_item_start(&item).await;
                let outcome = runner.execute(&item).await;
                collector.record(outcome.clone());
                reporter.on_outcome(&outcome).await;
                drop(permit);
                drop(serial);
            });
        }

        if self.stop.is_cancelled() {
            info!("Stop requested, waiting for {} in-flight invocations", tasks.len());
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                return Err(abandon(&mut tasks, worker_fault(e)).await);
            }
        }

        Ok(())
    }

    fn write_artifacts(&self, report: &Report) {
        let report_config = &self.config.report;
        let artifacts: [(&str, Option<PathBuf>, ArtifactWriter); 3] = [
            ("HTML", report_config.html_path(), write_html),
            ("JUnit XML", report_config.junit_path(), write_junit),
            ("JSON", report_config.json_path(), write_json),
        ];

        for (kind, path, write) in artifacts {
            let Some(path) = path else { continue };
            match write(report, &path) {
                Ok(()) => info!("{} report written to: {}", kind, path.display()),
                Err(e) => error!("Failed to write {} report: {:#}", kind, e),
            }
        }
    }

    async fn send_notification(&self, report: &Report) {
        let recipients = &self.config.notify.recipients;
        if recipients.is_empty() {
            return;
        }

        let html = match render_html(report) {
            Ok(html) => html,
            Err(e) => {
                warn!("Failed to render report for notification: {:#}", e);
                return;
            }
        };
        if let Err(e) = self.notifier.notify(report, &html, recipients).await {
            warn!("Failed to send report notification: {}", e);
        }
    }
}

/// Hands out scheduled items in schedule order, except that items of a
/// serial case whose previous invocation is still running are set aside so
/// later items can use the free workers.
///
/// At most `lookahead + 1` items are set aside. With one worker nothing is
/// skipped and items start in schedule order. Items of the same serial case
/// always start in schedule order.
struct ReadyQueue<'a> {
    schedule: Schedule<'a>,
    deferred: VecDeque<ScheduledItem>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    lookahead: usize,
}

impl<'a> ReadyQueue<'a> {
    fn new(plan: &'a RunPlan, lookahead: usize) -> Self {
        let locks = plan
            .cases()
            .iter()
            .filter(|case| !concurrent_safe(case.as_ref()))
            .map(|case| (case.id().to_string(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            schedule: plan.schedule(),
            deferred: VecDeque::new(),
            locks,
            lookahead,
        }
    }

    /// Returns the next item to start, holding its case's serial lock if
    /// it has one. `None` once the schedule is drained or `stop` fires.
    async fn next(
        &mut self,
        stop: &CancellationToken,
    ) -> Option<(ScheduledItem, Option<OwnedMutexGuard<()>>)> {
        loop {
            if let Some((item, guard)) = self.take_unblocked() {
                return Some((item, Some(guard)));
            }

            if self.deferred.len() <= self.lookahead {
                if let Some(item) = self.schedule.next() {
                    let Some(lock) = self.locks.get(item.case_id()) else {
                        return Some((item, None));
                    };
                    let queued = self.deferred.iter().any(|d| d.case_id() == item.case_id());
                    if !queued {
                        if let Ok(guard) = Arc::clone(lock).try_lock_owned() {
                            return Some((item, Some(guard)));
                        }
                    }
                    self.deferred.push_back(item);
                    continue;
                }
            }

            let item = self.deferred.pop_front()?;
            let lock = Arc::clone(self.locks.get(item.case_id())?);
            return tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                guard = lock.lock_owned() => Some((item, Some(guard))),
            };
        }
    }

    /// Removes the earliest set-aside item whose serial lock is free.
    fn take_unblocked(&mut self) -> Option<(ScheduledItem, OwnedMutexGuard<()>)> {
        let mut blocked: Vec<&str> = Vec::new();
        let mut found = None;
        for (pos, item) in self.deferred.iter().enumerate() {
            if blocked.contains(&item.case_id()) {
                continue;
            }
            let Some(lock) = self.locks.get(item.case_id()) else {
                continue;
            };
            match Arc::clone(lock).try_lock_owned() {
                Ok(guard) => {
                    found = Some((pos, guard));
                    break;
                }
                Err(_) => blocked.push(item.case_id()),
            }
        }

        let (pos, guard) = found?;
        let item = self.deferred.remove(pos)?;
        Some((item, guard))
    }
}

/// A case whose concurrency flag panics is run serially.
fn concurrent_safe(case: &dyn TestCase) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| case.concurrent_safe())) {
        Ok(safe) => safe,
        Err(_) => {
            warn!("[{}] concurrency flag panicked, running serially", case.id());
            false
        }
    }
}

fn worker_fault(err: JoinError) -> String {
    if err.is_panic() {
        format!("worker task panicked: {}", err)
    } else {
        format!("worker task failed: {}", err)
    }
}

/// Aborts every in-flight task and waits for them to wind down.
async fn abandon(tasks: &mut JoinSet<()>, message: String) -> String {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    message
}
