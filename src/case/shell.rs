//! Test cases backed by shell commands.
//!
//! Each step is run as `{shell} -c "{command}"` in a child process. The
//! command is an opaque unit of work: only its exit status and output
//! matter.
//!
//! | Step | Non-zero exit maps to |
//! |------|-----------------------|
//! | setup | error |
//! | command | failure |
//! | teardown | error |
//!
//! Every command sees `TLIB_CASE_ID`, `TLIB_ITERATION` and `TLIB_LOOP` in
//! its environment. Child processes are killed when an invocation is
//! abandoned (for example on timeout).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{CaseError, CaseResult, Invocation, TestCase};
use crate::config::CaseConfig;

/// Bytes of stderr kept as diagnostic text for a failed command.
const STDERR_TAIL: usize = 8 * 1024;

/// A test case whose steps are shell commands.
#[derive(Debug, Clone)]
pub struct ShellCase {
    id: String,
    command: String,
    setup: Option<String>,
    teardown: Option<String>,
    timeout: Option<Duration>,
    skip: Option<String>,
    serial: bool,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    shell: String,
}

impl ShellCase {
    /// Creates a case that runs `command` with `/bin/sh`.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            setup: None,
            teardown: None,
            timeout: None,
            skip: None,
            serial: false,
            working_dir: None,
            env: HashMap::new(),
            shell: "/bin/sh".to_string(),
        }
    }

    /// Builds a case from its configuration entry.
    pub fn from_config(config: &CaseConfig) -> Self {
        Self {
            id: config.id.clone(),
            command: config.command.clone(),
            setup: config.setup.clone(),
            teardown: config.teardown.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            skip: config.skip.clone(),
            serial: config.serial,
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            shell: config.shell.clone(),
        }
    }

    /// Sets the setup command.
    pub fn with_setup(mut self, command: impl Into<String>) -> Self {
        self.setup = Some(command.into());
        self
    }

    /// Sets the teardown command.
    pub fn with_teardown(mut self, command: impl Into<String>) -> Self {
        self.teardown = Some(command.into());
        self
    }

    /// Sets the per-invocation time limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets an environment variable for all commands.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Wraps the case for use in a run.
    pub fn into_shared(self) -> Arc<dyn TestCase> {
        Arc::new(self)
    }

    /// Runs one step. Returns `None` on exit status 0.
    async fn run_script(
        &self,
        script: &str,
        ctx: &mut Invocation,
    ) -> CaseResult<Option<CommandFailure>> {
        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(script);

        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in &self.env {
            process.env(key, value);
        }
        process
            .env("TLIB_CASE_ID", &self.id)
            .env("TLIB_ITERATION", ctx.iteration().to_string())
            .env("TLIB_LOOP", ctx.loop_index().to_string());

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let output = process.output().await.map_err(|e| {
            CaseError::fault(format!("failed to spawn `{}`: {}", self.shell, e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        ctx.capture(&stdout);
        ctx.capture(&stderr);

        debug!("[{}] `{}` exited with {}", self.id, script, output.status);

        if output.status.success() {
            return Ok(None);
        }
        Ok(Some(CommandFailure {
            status: output.status.to_string(),
            stderr: tail(&stderr, STDERR_TAIL).to_string(),
        }))
    }
}

/// Exit details of a failed command.
struct CommandFailure {
    status: String,
    stderr: String,
}

impl CommandFailure {
    fn into_error(self, step: &str, script: &str, assertion: bool) -> CaseError {
        let message = format!("{step} `{script}` {}", self.status);
        let err = if assertion {
            CaseError::assertion(message)
        } else {
            CaseError::fault(message)
        };
        if self.stderr.trim().is_empty() {
            err
        } else {
            err.with_traceback(self.stderr)
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[async_trait]
impl TestCase for ShellCase {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&self, ctx: &mut Invocation) -> CaseResult {
        let Some(script) = &self.setup else {
            return Ok(());
        };
        match self.run_script(script, ctx).await? {
            None => Ok(()),
            Some(failure) => Err(failure.into_error("setup", script, false)),
        }
    }

    async fn body(&self, ctx: &mut Invocation) -> CaseResult {
        match self.run_script(&self.command, ctx).await? {
            None => Ok(()),
            Some(failure) => Err(failure.into_error("command", &self.command, true)),
        }
    }

    async fn teardown(&self, ctx: &mut Invocation) -> CaseResult {
        let Some(script) = &self.teardown else {
            return Ok(());
        };
        match self.run_script(script, ctx).await? {
            None => Ok(()),
            Some(failure) => Err(failure.into_error("teardown", script, false)),
        }
    }

    fn skip_reason(&self) -> Option<String> {
        self.skip.clone()
    }

    fn concurrent_safe(&self) -> bool {
        !self.serial
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
