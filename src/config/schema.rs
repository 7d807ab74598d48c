//! Configuration schema definitions for tlib.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig        - [run]: title, iterations, loop, workers, timeout
//! ├── ReportConfig     - [report]: artifact directory and formats
//! ├── NotifyConfig     - [notify]: recipients and mail transport
//! └── Vec<CaseConfig>  - [[cases]]: command-backed test cases
//! ```
//!
//! Every section has defaults, so an empty document is a valid (if
//! uneventful) configuration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Root configuration structure for tlib.
///
/// # TOML Structure
///
/// ```toml
/// [run]
/// title = "Nightly stress"
/// iterations = 2
/// loop = 3
/// workers = 4
///
/// [report]
/// output_dir = "test-results"
/// junit = true
///
/// [notify]
/// recipients = ["qa@example.com"]
///
/// [[cases]]
/// id = "disk_write"
/// setup = "mkdir -p /tmp/tlib-disk"
/// command = "dd if=/dev/zero of=/tmp/tlib-disk/blob bs=1M count=16"
/// teardown = "rm -rf /tmp/tlib-disk"
/// serial = true
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Run schedule and metadata.
    #[serde(default)]
    pub run: RunConfig,

    /// Report artifact settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Report notification settings.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Command-backed test cases, in execution order.
    #[serde(default)]
    pub cases: Vec<CaseConfig>,
}

impl Config {
    /// Checks the configuration for values that can never produce a run.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        if self.run.iterations == 0 {
            bail!("run.iterations must be at least 1");
        }
        if self.run.loops == 0 {
            bail!("run.loop must be at least 1");
        }
        if self.run.workers == 0 {
            bail!("run.workers must be at least 1");
        }

        let mut seen = HashSet::new();
        for case in &self.cases {
            if case.id.trim().is_empty() {
                bail!("cases: every case needs a non-empty id");
            }
            if !seen.insert(case.id.as_str()) {
                bail!("cases: duplicate case id '{}'", case.id);
            }
            if case.command.trim().is_empty() {
                bail!("cases.{}: command must not be empty", case.id);
            }
        }

        if !self.notify.recipients.is_empty() {
            let argv = shell_words::split(&self.notify.sendmail)?;
            if argv.is_empty() {
                bail!("notify.sendmail must name a command");
            }
        }

        Ok(())
    }
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `title` | `"tlib test report"` |
/// | `description` | `""` |
/// | `iterations` | 1 |
/// | `loop` | 1 |
/// | `workers` | 1 (sequential) |
/// | `timeout_secs` | None (no limit) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Report title.
    #[serde(default = "default_title")]
    pub title: String,

    /// Free-form report description.
    #[serde(default)]
    pub description: String,

    /// Number of full passes over the case sequence.
    #[serde(default = "default_one")]
    pub iterations: usize,

    /// Contiguous repetitions of each case within one iteration.
    #[serde(rename = "loop", default = "default_one")]
    pub loops: usize,

    /// Maximum number of invocations in flight.
    ///
    /// With 1 worker the run is sequential and outcome order equals
    /// schedule order.
    #[serde(default = "default_one")]
    pub workers: usize,

    /// Default per-invocation time limit in seconds.
    ///
    /// Cases may override it with their own limit.
    pub timeout_secs: Option<u64>,
}

impl RunConfig {
    /// Returns the default per-invocation time limit.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            description: String::new(),
            iterations: 1,
            loops: 1,
            workers: 1,
            timeout_secs: None,
        }
    }
}

fn default_title() -> String {
    "tlib test report".to_string()
}

fn default_one() -> usize {
    1
}

/// Configuration for report artifacts.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `html` | `true` |
/// | `html_file` | `"report.html"` |
/// | `junit` | `false` |
/// | `junit_file` | `"junit.xml"` |
/// | `json` | `false` |
/// | `json_file` | `"report.json"` |
///
/// `output_dir` may start with `~` or reference environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write the HTML report.
    #[serde(default = "default_true")]
    pub html: bool,

    /// Filename for the HTML report.
    #[serde(default = "default_html_file")]
    pub html_file: String,

    /// Whether to write a JUnit XML report.
    #[serde(default)]
    pub junit: bool,

    /// Filename for the JUnit XML report.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Whether to write a JSON report.
    #[serde(default)]
    pub json: bool,

    /// Filename for the JSON report.
    #[serde(default = "default_json_file")]
    pub json_file: String,
}

impl ReportConfig {
    /// Returns `output_dir` with `~` and environment variables expanded.
    pub fn resolved_output_dir(&self) -> PathBuf {
        let raw = self.output_dir.to_string_lossy();
        match shellexpand::full(&raw) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => self.output_dir.clone(),
        }
    }

    /// Path of the HTML report, if enabled.
    pub fn html_path(&self) -> Option<PathBuf> {
        self.html
            .then(|| self.resolved_output_dir().join(&self.html_file))
    }

    /// Path of the JUnit XML report, if enabled.
    pub fn junit_path(&self) -> Option<PathBuf> {
        self.junit
            .then(|| self.resolved_output_dir().join(&self.junit_file))
    }

    /// Path of the JSON report, if enabled.
    pub fn json_path(&self) -> Option<PathBuf> {
        self.json
            .then(|| self.resolved_output_dir().join(&self.json_file))
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            html: true,
            html_file: default_html_file(),
            junit: false,
            junit_file: default_junit_file(),
            json: false,
            json_file: default_json_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_html_file() -> String {
    "report.html".to_string()
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_json_file() -> String {
    "report.json".to_string()
}

/// Configuration for mailing the HTML report.
///
/// Notification is enabled by listing at least one recipient. The message
/// is piped to `sendmail`, which must accept a complete RFC 5322 message on
/// stdin (`sendmail -t` semantics).
///
/// # Example
///
/// ```toml
/// [notify]
/// recipients = ["qa@example.com", "oncall@example.com"]
/// sendmail = "/usr/sbin/sendmail -t -oi"
/// from = "stress@buildhost"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Addresses that receive the report.
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Mail transport command line.
    ///
    /// Default: `/usr/sbin/sendmail -t -oi`
    #[serde(default = "default_sendmail")]
    pub sendmail: String,

    /// Sender address.
    ///
    /// Default: `tlib@localhost`
    #[serde(default = "default_from")]
    pub from: String,

    /// Subject line. Generated from the report verdict when unset.
    pub subject: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            sendmail: default_sendmail(),
            from: default_from(),
            subject: None,
        }
    }
}

fn default_sendmail() -> String {
    "/usr/sbin/sendmail -t -oi".to_string()
}

fn default_from() -> String {
    "tlib@localhost".to_string()
}

/// A test case defined by shell commands.
///
/// The body `command` passing means exit status 0; any other status is an
/// assertion failure. A non-zero `setup` or `teardown` is an error.
///
/// # Example
///
/// ```toml
/// [[cases]]
/// id = "api_health"
/// command = "curl -fsS http://localhost:8080/health"
/// timeout_secs = 10
///
/// [[cases]]
/// id = "legacy_import"
/// command = "./scripts/import.sh"
/// skip = "importer is being rewritten"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaseConfig {
    /// Unique case identifier.
    pub id: String,

    /// Body command.
    pub command: String,

    /// Command run before every invocation.
    pub setup: Option<String>,

    /// Command run after every invocation whose setup succeeded.
    pub teardown: Option<String>,

    /// Per-invocation time limit in seconds.
    pub timeout_secs: Option<u64>,

    /// Skip the case with this reason.
    pub skip: Option<String>,

    /// Forbid overlapping invocations of this case.
    #[serde(default)]
    pub serial: bool,

    /// Working directory for all commands of this case.
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell used to run the commands (`{shell} -c "{command}"`).
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.run.iterations, 1);
        assert_eq!(config.run.loops, 1);
        assert_eq!(config.run.workers, 1);
        assert_eq!(config.run.timeout(), None);
        assert!(config.report.html);
        assert!(!config.report.junit);
        assert!(config.notify.recipients.is_empty());
        assert!(config.cases.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_case_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[cases]]
            id = "a"
            command = "true"
            "#,
        )
        .unwrap();
        let case = &config.cases[0];
        assert_eq!(case.shell, "/bin/sh");
        assert!(!case.serial);
        assert!(case.setup.is_none());
        assert!(case.env.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_loop() {
        let config: Config = toml::from_str("[run]\nloop = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("run.loop"));
    }

    #[test]
    fn test_validate_rejects_duplicate_case() {
        let config: Config = toml::from_str(
            r#"
            [[cases]]
            id = "a"
            command = "true"

            [[cases]]
            id = "a"
            command = "false"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_report_paths() {
        let config: Config = toml::from_str(
            r#"
            [report]
            output_dir = "out"
            junit = true
            "#,
        )
        .unwrap();
        assert_eq!(
            config.report.html_path(),
            Some(PathBuf::from("out/report.html"))
        );
        assert_eq!(
            config.report.junit_path(),
            Some(PathBuf::from("out/junit.xml"))
        );
        assert_eq!(config.report.json_path(), None);
    }
}
