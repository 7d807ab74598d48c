//! tlib: a test runner with iteration/loop scheduling and HTML reports.
//!
//! This crate runs a sequence of test cases repeatedly, optionally across
//! a pool of workers, records one outcome per invocation, and renders the
//! outcomes into a report that can be written as HTML, JUnit XML or JSON
//! and mailed to a list of recipients.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Case**: the [`TestCase`](case::TestCase) capability trait, plus
//!   closure-backed and shell-command-backed implementations
//! - **Orchestrator**: schedule, execution engine, outcome collection and
//!   the run state machine
//! - **Report**: event reporters, the report model and artifact writers
//! - **Notify**: report delivery through a sendmail-compatible command
//!
//! # Example
//!
//! ```
//! use tlib::case::{CaseError, FnCase};
//! use tlib::config::Config;
//! use tlib::orchestrator::Orchestrator;
//! use tlib::report::NullReporter;
//!
//! # tokio_test::block_on(async {
//! let mut config = Config::default();
//! config.run.iterations = 2;
//! config.run.loops = 3;
//! config.report.html = false;
//!
//! let cases = vec![
//!     FnCase::new("x", || async { Ok(()) }).into_shared(),
//!     FnCase::new("y", || async { Err(CaseError::assertion("nope")) }).into_shared(),
//! ];
//!
//! let mut orchestrator = Orchestrator::new(config, NullReporter);
//! let report = orchestrator.run(cases).await?;
//! assert_eq!(report.counts.total, 12);
//! assert_eq!(report.counts.failed, 6);
//! # Ok::<(), tlib::orchestrator::RunError>(())
//! # }).unwrap();
//! ```

pub mod case;
pub mod config;
pub mod notify;
pub mod orchestrator;
pub mod report;

// Re-export commonly used types
pub use case::{CaseError, FnCase, Outcome, Status, TestCase};
pub use config::{Config, load_config};
pub use orchestrator::{Orchestrator, RunError, RunState};
pub use report::{Report, Reporter};
