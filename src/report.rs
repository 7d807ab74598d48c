//! Run events, report rendering and artifact output.
//!
//! Two halves live here:
//!
//! - The [`Reporter`] trait is the injected progress collaborator. The run
//!   driver calls it as the run moves along; implementations print, log, or
//!   ignore the events.
//! - [`render`] turns the outcomes of a run into a [`Report`], which the
//!   artifact writers serialize as HTML, JUnit XML or JSON.
//!
//! # Artifacts
//!
//! | Writer | Format |
//! |--------|--------|
//! | [`write_html`] | self-contained HTML document |
//! | [`write_junit`] | JUnit XML, one testsuite per case |
//! | [`write_json`] | the [`Report`] serialized with serde |

pub mod console;
pub mod html;
pub mod junit;
pub mod model;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::case::Outcome;
use crate::orchestrator::{RunPlan, ScheduledItem};

pub use console::{ConsoleReporter, LogReporter, print_summary};
pub use html::{render_html, write_html};
pub use junit::{generate_xml, write_junit};
pub use model::{CaseReport, Counts, PassRate, Report, RunMetadata, render};

/// Receives events while a run progresses.
///
/// `on_item_start` and `on_outcome` are called from worker tasks and may
/// run concurrently with each other. A panic in a reporter is a fault in
/// the run machinery and aborts the run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the plan is validated, before any item runs.
    async fn on_run_start(&self, plan: &RunPlan);

    /// Called right before an item is executed.
    async fn on_item_start(&self, item: &ScheduledItem);

    /// Called after an outcome has been recorded.
    async fn on_outcome(&self, outcome: &Outcome);

    /// Called once the report has been rendered.
    async fn on_run_complete(&self, report: &Report);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _plan: &RunPlan) {}
    async fn on_item_start(&self, _item: &ScheduledItem) {}
    async fn on_outcome(&self, _outcome: &Outcome) {}
    async fn on_run_complete(&self, _report: &Report) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, plan: &RunPlan) {
        for reporter in &self.reporters {
            reporter.on_run_start(plan).await;
        }
    }

    async fn on_item_start(&self, item: &ScheduledItem) {
        for reporter in &self.reporters {
            reporter.on_item_start(item).await;
        }
    }

    async fn on_outcome(&self, outcome: &Outcome) {
        for reporter in &self.reporters {
            reporter.on_outcome(outcome).await;
        }
    }

    async fn on_run_complete(&self, report: &Report) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

/// Writes the report as pretty-printed JSON.
///
/// Parent directories are created if missing.
pub fn write_json(report: &Report, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    write_artifact(path, json.as_bytes())
}

/// Writes an artifact, creating parent directories first.
pub(crate) fn write_artifact(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write report: {}", path.display()))
}
