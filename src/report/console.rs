//! Terminal and log reporters.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Reporter;
use super::model::Report;
use crate::case::{Outcome, Status};
use crate::orchestrator::{RunPlan, ScheduledItem};

/// Prints a summary of the report to the console.
///
/// Displays counts with colored output, then every failed or errored
/// invocation with its message.
pub fn print_summary(report: &Report) {
    let counts = &report.counts;

    println!();
    println!("Test Results:");
    println!("  Total:     {}", counts.total);
    println!("  Passed:    {}", console::style(counts.passed).green());
    println!("  Failed:    {}", console::style(counts.failed).red());
    println!("  Errored:   {}", console::style(counts.errored).red().bold());
    println!("  Skipped:   {}", console::style(counts.skipped).yellow());
    println!("  Pass rate: {}", report.pass_rate);
    println!("  Duration:  {:?}", report.duration);

    if report.is_partial() {
        println!();
        println!(
            "{}",
            console::style(format!(
                "Run stopped early: {} of {} invocations executed.",
                counts.total, report.metadata.planned
            ))
            .yellow()
            .bold()
        );
    }

    if report.success() {
        println!();
        println!("{}", console::style("All tests passed!").green().bold());
        return;
    }

    println!();
    println!("{}", console::style("Some tests failed.").red().bold());
    println!();
    println!("Failed tests:");
    for outcome in &report.failures {
        println!(
            "  - {} (iteration {}, loop {}) {}",
            outcome.case_id,
            outcome.iteration,
            outcome.loop_index,
            status_label(outcome.status)
        );
        if !outcome.message.is_empty() {
            println!("    {}", console::style(&outcome.message).dim());
        }
    }
}

fn status_label(status: Status) -> console::StyledObject<&'static str> {
    let label = status.label();
    match status {
        Status::Passed => console::style(label).green(),
        Status::Failed => console::style(label).red(),
        Status::Errored => console::style(label).red().bold(),
        Status::Skipped => console::style(label).yellow(),
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    ///
    /// With `verbose` every outcome is printed; otherwise only outcomes
    /// that did not pass.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        let guard = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, plan: &RunPlan) {
        println!(
            "Running {} cases x {} iterations x {} loops ({} invocations)",
            plan.cases().len(),
            plan.iterations(),
            plan.loops(),
            plan.len()
        );

        let pb = indicatif::ProgressBar::new(plan.len() as u64);
        match indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            Ok(style) => pb.set_style(style.progress_chars("#>-")),
            Err(e) => debug!("Falling back to the default progress style: {}", e),
        }

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_item_start(&self, item: &ScheduledItem) {
        if self.verbose {
            self.with_progress(|pb| {
                pb.println(format!(
                    "Running: {} (iteration {}, loop {})",
                    item.case_id(),
                    item.iteration,
                    item.loop_index
                ))
            });
        }
    }

    async fn on_outcome(&self, outcome: &Outcome) {
        let verbose = self.verbose;
        self.with_progress(|pb| {
            pb.inc(1);
            if verbose || outcome.status != Status::Passed {
                pb.println(format!(
                    "{} {} [i{}.l{}] {}",
                    status_label(outcome.status),
                    outcome.case_id,
                    outcome.iteration,
                    outcome.loop_index,
                    outcome.message
                ));
            }
        });
    }

    async fn on_run_complete(&self, report: &Report) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }

        print_summary(report);
    }
}

/// Reporter that emits run events as `tracing` events.
///
/// Useful when tlib is embedded in a program that already collects logs.
#[derive(Debug, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn on_run_start(&self, plan: &RunPlan) {
        info!(
            cases = plan.cases().len(),
            iterations = plan.iterations(),
            loops = plan.loops(),
            "Run started with {} scheduled invocations",
            plan.len()
        );
    }

    async fn on_item_start(&self, item: &ScheduledItem) {
        debug!(
            case = item.case_id(),
            iteration = item.iteration,
            loop_index = item.loop_index,
            "Invocation started"
        );
    }

    async fn on_outcome(&self, outcome: &Outcome) {
        match outcome.status {
            Status::Passed | Status::Skipped => info!(
                case = %outcome.case_id,
                iteration = outcome.iteration,
                loop_index = outcome.loop_index,
                status = %outcome.status,
                "Invocation finished in {:?}",
                outcome.duration
            ),
            Status::Failed | Status::Errored => warn!(
                case = %outcome.case_id,
                iteration = outcome.iteration,
                loop_index = outcome.loop_index,
                status = %outcome.status,
                "Invocation finished in {:?}: {}",
                outcome.duration,
                outcome.message
            ),
        }
    }

    async fn on_run_complete(&self, report: &Report) {
        info!(
            run_id = %report.metadata.run_id,
            passed = report.counts.passed,
            failed = report.counts.failed,
            errored = report.counts.errored,
            skipped = report.counts.skipped,
            partial = report.is_partial(),
            "Run complete, pass rate {}",
            report.pass_rate
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{CaseError, FnCase};
    use crate::orchestrator::TestRunner;
    use crate::report::{RunMetadata, render};

    async fn drive(reporter: &dyn Reporter) -> Report {
        let cases = vec![
            FnCase::new("ok", || async { Ok(()) }).into_shared(),
            FnCase::new("bad", || async { Err(CaseError::assertion("1 != 2")) }).into_shared(),
            FnCase::new("off", || async { Ok(()) })
                .skipped("not today")
                .into_shared(),
        ];
        let plan = RunPlan::new(1, 2, cases).unwrap();
        let runner = TestRunner::new(None);

        reporter.on_run_start(&plan).await;
        let mut outcomes = Vec::new();
        for item in plan.schedule() {
            reporter.on_item_start(&item).await;
            let outcome = runner.execute(&item).await;
            reporter.on_outcome(&outcome).await;
            outcomes.push(outcome);
        }

        let mut metadata = RunMetadata::new("console", "");
        metadata.planned = plan.len();
        render(outcomes, metadata)
    }

    #[tokio::test]
    async fn test_console_reporter_tracks_progress() {
        let reporter = ConsoleReporter::new(true);
        let report = drive(&reporter).await;

        let position = reporter
            .progress
            .lock()
            .unwrap()
            .as_ref()
            .map(|pb| (pb.position(), pb.length()));
        assert_eq!(position, Some((6, Some(6))));

        reporter.on_run_complete(&report).await;
        assert!(reporter.progress.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_console_reporter_without_run_start() {
        let reporter = ConsoleReporter::new(false);
        let plan = RunPlan::new(1, 1, vec![FnCase::new("a", || async { Ok(()) }).into_shared()])
            .unwrap();
        let item = plan.schedule().next().unwrap();
        let outcome = TestRunner::new(None).execute(&item).await;

        reporter.on_item_start(&item).await;
        reporter.on_outcome(&outcome).await;
        assert!(reporter.progress.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_reporter_handles_every_status() {
        let report = drive(&LogReporter).await;
        assert_eq!(report.counts.passed, 2);
        assert_eq!(report.counts.failed, 2);
        assert_eq!(report.counts.skipped, 2);
        LogReporter.on_run_complete(&report).await;
    }

    #[test]
    fn test_print_summary_partial_run() {
        let mut metadata = RunMetadata::new("partial", "");
        metadata.planned = 10;
        metadata.partial = true;
        let report = render(Vec::new(), metadata);
        assert!(report.is_partial());
        print_summary(&report);
    }
}
