//! Report notification through an external mail transport.
//!
//! The rendered HTML report is wrapped in a minimal MIME message and piped
//! into a sendmail-compatible command. Delivery is the transport's job:
//! the notifier only checks that the command accepted the message.
//!
//! Notification failures never fail a run. The run driver logs them and
//! finishes normally.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::NotifyConfig;
use crate::report::Report;

/// Errors raised while handing a report to the mail transport.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The transport command line could not be parsed.
    #[error("invalid mail command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    /// The transport could not be started.
    #[error("failed to start mail command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Writing the message or waiting for the transport failed.
    #[error("I/O error talking to mail command: {0}")]
    Io(#[from] io::Error),

    /// The transport rejected the message.
    #[error("mail command exited with {status}: {stderr}")]
    Transport { status: String, stderr: String },
}

/// Delivers a rendered report to a list of recipients.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends the HTML report.
    ///
    /// Implementations return `Ok` without doing anything when there are
    /// no recipients.
    async fn notify(
        &self,
        report: &Report,
        html: &str,
        recipients: &[String],
    ) -> Result<(), NotifyError>;
}

/// A notifier that drops every report.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(
        &self,
        _report: &Report,
        _html: &str,
        _recipients: &[String],
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Pipes the report as a MIME message into a sendmail-compatible command.
///
/// The command must read a complete message, headers included, from
/// stdin. `sendmail -t`, `msmtp -t` and `ssmtp -t` all qualify.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    command: String,
    from: String,
    subject: Option<String>,
}

impl SendmailNotifier {
    /// Creates a notifier that runs `command` and sends as `from`.
    pub fn new(command: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            from: from.into(),
            subject: None,
        }
    }

    /// Creates a notifier from the `[notify]` configuration section.
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            command: config.sendmail.clone(),
            from: config.from.clone(),
            subject: config.subject.clone(),
        }
    }

    /// Overrides the generated subject line.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    fn subject_for(&self, report: &Report) -> String {
        if let Some(subject) = &self.subject {
            return subject.clone();
        }
        let verdict = if !report.success() {
            "FAILED"
        } else if report.is_partial() {
            "STOPPED"
        } else {
            "PASSED"
        };
        format!(
            "[tlib] {}: {} ({}/{} passed, pass rate {})",
            report.metadata.title,
            verdict,
            report.counts.passed,
            report.counts.total,
            report.pass_rate
        )
    }

    /// Builds the complete message handed to the transport.
    pub fn compose(&self, report: &Report, html: &str, recipients: &[String]) -> String {
        let to: Vec<String> = recipients.iter().map(|r| header_value(r)).collect();
        format!(
            "From: {}\nTo: {}\nSubject: {}\nDate: {}\nMIME-Version: 1.0\nContent-Type: text/html; charset=utf-8\nContent-Transfer-Encoding: 8bit\n\n{}\n",
            header_value(&self.from),
            to.join(", "),
            header_value(&self.subject_for(report)),
            chrono::Utc::now().to_rfc2822(),
            html
        )
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn notify(
        &self,
        report: &Report,
        html: &str,
        recipients: &[String],
    ) -> Result<(), NotifyError> {
        if recipients.is_empty() {
            return Ok(());
        }

        let argv = shell_words::split(&self.command).map_err(|e| NotifyError::InvalidCommand {
            command: self.command.clone(),
            reason: e.to_string(),
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(NotifyError::InvalidCommand {
                command: self.command.clone(),
                reason: "empty command".to_string(),
            });
        };

        debug!("Handing report to `{}`", self.command);
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let message = self.compose(report, html, recipients);
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NotifyError::Transport {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("Report sent to {}", recipients.join(", "));
        Ok(())
    }
}

/// Header values must stay on one line.
fn header_value(s: &str) -> String {
    s.chars().map(|c| if c == '\r' || c == '\n' { ' ' } else { c }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{RunMetadata, render};

    fn report() -> Report {
        render(Vec::new(), RunMetadata::new("Nightly", ""))
    }

    #[test]
    fn test_compose_headers() {
        let notifier = SendmailNotifier::new("sendmail -t", "ci@example.com");
        let message = notifier.compose(
            &report(),
            "<html></html>",
            &["a@example.com".to_string(), "b@example.com".to_string()],
        );

        assert!(message.starts_with("From: ci@example.com\n"));
        assert!(message.contains("To: a@example.com, b@example.com\n"));
        assert!(message.contains("Subject: [tlib] Nightly: PASSED (0/0 passed, pass rate n/a)\n"));
        assert!(message.contains("Content-Type: text/html; charset=utf-8\n"));
        assert!(message.ends_with("\n\n<html></html>\n"));
    }

    #[test]
    fn test_subject_override_is_single_line() {
        let notifier =
            SendmailNotifier::new("sendmail -t", "ci@example.com").with_subject("a\nBcc: x");
        let message = notifier.compose(&report(), "", &["a@example.com".to_string()]);
        assert!(message.contains("Subject: a Bcc: x\n"));
    }

    #[tokio::test]
    async fn test_no_recipients_is_noop() {
        let notifier = SendmailNotifier::new("/nonexistent/sendmail", "ci@example.com");
        notifier.notify(&report(), "", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let notifier = SendmailNotifier::new("/nonexistent/sendmail -t", "ci@example.com");
        let err = notifier
            .notify(&report(), "", &["a@example.com".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_unbalanced_quotes_rejected() {
        let notifier = SendmailNotifier::new("sendmail 'oops", "ci@example.com");
        let err = notifier
            .notify(&report(), "", &["a@example.com".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidCommand { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_message_piped_to_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.txt");
        let command = format!("sh -c 'cat > {}'", path.display());
        let notifier = SendmailNotifier::new(command, "ci@example.com");

        notifier
            .notify(&report(), "<p>hi</p>", &["a@example.com".to_string()])
            .await
            .unwrap();

        let mail = std::fs::read_to_string(&path).unwrap();
        assert!(mail.contains("To: a@example.com"));
        assert!(mail.contains("<p>hi</p>"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejecting_transport() {
        let notifier = SendmailNotifier::new("sh -c 'cat >/dev/null; echo refused >&2; exit 75'", "ci@example.com");
        let err = notifier
            .notify(&report(), "", &["a@example.com".to_string()])
            .await
            .unwrap_err();
        match err {
            NotifyError::Transport { stderr, .. } => assert_eq!(stderr, "refused"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
