//! Subprocess execution with timeouts, output capture, and redaction.
//!
//! Commands are always executed as an argv vector; nothing here ever
//! passes through a shell, so the validation layer in `security::input`
//! is the only line between request data and `execve`. Secret
//! environment values (database passwords handed to mysqldump) are
//! marked as such and never appear in logs or audit events.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::security::audit::{AuditAction, AuditEvent, AuditLogger, AuditResult};

/// Default wall-clock limit for external commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Command timed out after {timeout_secs}s: {program}")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully-resolved external command, ready to execute.
///
/// Built via the chained setters; every argument must already be
/// validated by the caller. `Debug` and [`CommandSpec::display_line`]
/// redact secret environment values.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// (name, value, secret). Secret values never reach logs.
    envs: Vec<(String, String, bool)>,
    /// Feed the child's stdin from this file (mysql restore).
    pub stdin_file: Option<PathBuf>,
    /// Send the child's stdout to this file (mysqldump).
    pub stdout_file: Option<PathBuf>,
    /// Re-exec through `sudo -n` when the daemon is not already root.
    pub elevated: bool,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin_file: None,
            stdout_file: None,
            elevated: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((name.into(), value.into(), false));
        self
    }

    /// Set an environment variable whose value must never be logged.
    pub fn secret_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((name.into(), value.into(), true));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command as a loggable line: program, arguments, and any file
    /// redirections. Secret env values are shown as `NAME=***`.
    pub fn display_line(&self) -> String {
        let mut line = String::new();
        for (name, value, secret) in &self.envs {
            if *secret {
                line.push_str(&format!("{}=*** ", name));
            } else {
                line.push_str(&format!("{}={} ", name, value));
            }
        }
        line.push_str(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(ref path) = self.stdin_file {
            line.push_str(&format!(" < {}", path.display()));
        }
        if let Some(ref path) = self.stdout_file {
            line.push_str(&format!(" > {}", path.display()));
        }
        line
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.display_line())
            .field("elevated", &self.elevated)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code; -1 if the process died on a signal.
    pub exit_code: i32,
    /// stdout followed by stderr, lossily decoded.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Canned successful output, for tests and fakes.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    /// Canned failure, for tests and fakes.
    pub fn err(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }
}

/// Executes [`CommandSpec`]s.
///
/// Orchestration services hold an `Arc<dyn ProcessRunner>` so tests can
/// substitute [`FakeRunner`].
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;
}

// ---------------------------------------------------------------------------
// SystemRunner
// ---------------------------------------------------------------------------

/// Real runner backed by `tokio::process`.
///
/// Enforces the command's timeout by killing the child, and records
/// every invocation (redacted command line plus exit code) with the
/// audit logger.
pub struct SystemRunner {
    audit: Arc<dyn AuditLogger>,
}

impl SystemRunner {
    pub fn new(audit: Arc<dyn AuditLogger>) -> Self {
        Self { audit }
    }

    /// Resolve the (program, args) actually executed, inserting
    /// `sudo -n` for elevated commands when we are not already root.
    fn resolve(spec: &CommandSpec) -> (String, Vec<String>) {
        if spec.elevated && !nix::unistd::Uid::effective().is_root() {
            let mut args = vec!["-n".to_string(), spec.program.clone()];
            args.extend(spec.args.iter().cloned());
            ("sudo".to_string(), args)
        } else {
            (spec.program.clone(), spec.args.clone())
        }
    }

    async fn record(&self, spec: &CommandSpec, result: AuditResult, exit_code: Option<i32>) {
        let mut details = serde_json::json!({ "command": spec.display_line() });
        match exit_code {
            Some(code) => details["exit_code"] = code.into(),
            None => details["error"] = "timeout".into(),
        }
        self.audit
            .log_event(
                &AuditEvent::new(AuditAction::CommandRun, &spec.program)
                    .result(result)
                    .details(details),
            )
            .await;
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        let (program, args) = Self::resolve(spec);
        debug!(command = %spec.display_line(), "Running external command");

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args);
        for (name, value, _) in &spec.envs {
            cmd.env(name, value);
        }
        cmd.kill_on_drop(true);

        cmd.stdin(match spec.stdin_file {
            Some(ref path) => Stdio::from(std::fs::File::open(path)?),
            None => Stdio::null(),
        });
        cmd.stdout(match spec.stdout_file {
            Some(ref path) => Stdio::from(std::fs::File::create(path)?),
            None => Stdio::piped(),
        });
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let wait = async {
            let stdout_pipe = child.stdout.take();
            let stderr_pipe = child.stderr.take();
            let stdout_read = async {
                if let Some(mut pipe) = stdout_pipe {
                    pipe.read_to_end(&mut stdout_buf).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let stderr_read = async {
                if let Some(mut pipe) = stderr_pipe {
                    pipe.read_to_end(&mut stderr_buf).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            tokio::try_join!(stdout_read, stderr_read)?;
            child.wait().await
        };

        let status = match tokio::time::timeout(spec.timeout, wait).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    program = %spec.program,
                    timeout_secs = spec.timeout.as_secs(),
                    "Command timed out, killing"
                );
                let _ = child.kill().await;
                self.record(spec, AuditResult::Failed, None).await;
                return Err(RunnerError::Timeout {
                    program: spec.program.clone(),
                    timeout_secs: spec.timeout.as_secs(),
                });
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        let mut output = String::from_utf8_lossy(&stdout_buf).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr_buf));

        let result = if exit_code == 0 {
            AuditResult::Success
        } else {
            AuditResult::Failed
        };
        self.record(spec, result, Some(exit_code)).await;

        if exit_code == 0 {
            debug!(program = %spec.program, "Command succeeded");
        } else {
            info!(program = %spec.program, exit_code, "Command exited nonzero");
        }

        Ok(CommandOutput { exit_code, output })
    }
}

// ---------------------------------------------------------------------------
// FakeRunner (for tests)
// ---------------------------------------------------------------------------

/// Scripted runner for orchestration tests.
///
/// Responses are queued per program name and consumed in order; programs
/// with no queued response succeed with empty output. Every call is
/// recorded for assertion.
#[derive(Default)]
pub struct FakeRunner {
    responses: Mutex<HashMap<String, Vec<FakeResponse>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

enum FakeResponse {
    Output(CommandOutput),
    Timeout,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for the next invocation of `program`.
    pub fn succeed_with(&self, program: &str, output: impl Into<String>) {
        self.push(program, FakeResponse::Output(CommandOutput::ok(output)));
    }

    /// Queue a failing response for the next invocation of `program`.
    pub fn fail_with(&self, program: &str, exit_code: i32, output: impl Into<String>) {
        self.push(
            program,
            FakeResponse::Output(CommandOutput::err(exit_code, output)),
        );
    }

    /// Queue a timeout for the next invocation of `program`.
    pub fn time_out(&self, program: &str) {
        self.push(program, FakeResponse::Timeout);
    }

    fn push(&self, program: &str, response: FakeResponse) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(program.to_string())
            .or_default()
            .push(response);
    }

    /// All specs run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Specs run for a given program, in order.
    pub fn calls_for(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|spec| spec.program == program)
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(spec.clone());

        let response = {
            let mut responses = self.responses.lock().unwrap_or_else(|p| p.into_inner());
            match responses.get_mut(&spec.program) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        match response {
            Some(FakeResponse::Output(output)) => Ok(output),
            Some(FakeResponse::Timeout) => Err(RunnerError::Timeout {
                program: spec.program.clone(),
                timeout_secs: spec.timeout.as_secs(),
            }),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

/// Create a spec for a quick sanity check that a binary exists, e.g.
/// `certbot --version`.
pub fn version_probe(program: &str) -> CommandSpec {
    CommandSpec::new(program)
        .arg("--version")
        .timeout(Duration::from_secs(5))
}

/// True when `path` names an executable file.
pub fn binary_exists(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::audit::{InMemoryAuditLogger, NullAuditLogger};
    use tempfile::TempDir;

    #[test]
    fn test_display_line_redacts_secrets() {
        let spec = CommandSpec::new("mysqldump")
            .arg("--single-transaction")
            .arg("appdb")
            .secret_env("MYSQL_PWD", "hunter2")
            .env("LANG", "C")
            .stdout_file("/tmp/appdb.sql");

        let line = spec.display_line();
        assert!(line.contains("MYSQL_PWD=***"));
        assert!(!line.contains("hunter2"));
        assert!(line.contains("LANG=C"));
        assert!(line.contains("mysqldump --single-transaction appdb"));
        assert!(line.contains("> /tmp/appdb.sql"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let spec = CommandSpec::new("mysql").secret_env("MYSQL_PWD", "hunter2");
        let debug = format!("{:?}", spec);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_resolve_elevated_prepends_sudo_for_non_root() {
        let spec = CommandSpec::new("ufw").arg("status").elevated();
        let (program, args) = SystemRunner::resolve(&spec);
        if nix::unistd::Uid::effective().is_root() {
            assert_eq!(program, "ufw");
            assert_eq!(args, vec!["status"]);
        } else {
            assert_eq!(program, "sudo");
            assert_eq!(args, vec!["-n", "ufw", "status"]);
        }
    }

    #[tokio::test]
    async fn test_system_runner_captures_merged_output() {
        let runner = SystemRunner::new(Arc::new(NullAuditLogger));
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo out; echo err >&2");
        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[tokio::test]
    async fn test_system_runner_nonzero_exit() {
        let runner = SystemRunner::new(Arc::new(NullAuditLogger));
        let spec = CommandSpec::new("sh").arg("-c").arg("exit 3");
        let output = runner.run(&spec).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_system_runner_timeout_kills_child() {
        let runner = SystemRunner::new(Arc::new(NullAuditLogger));
        let spec = CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(100));
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_spawn_failure() {
        let runner = SystemRunner::new(Arc::new(NullAuditLogger));
        let spec = CommandSpec::new("/nonexistent/binary-xyz");
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_stdout_redirection() {
        let dir = TempDir::new().unwrap();
        let out_path = dir.path().join("captured.txt");
        let runner = SystemRunner::new(Arc::new(NullAuditLogger));
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo redirected")
            .stdout_file(&out_path);

        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        // stdout went to the file, not the captured output.
        assert!(!output.output.contains("redirected"));
        let content = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(content.trim(), "redirected");
    }

    #[tokio::test]
    async fn test_system_runner_stdin_redirection() {
        let dir = TempDir::new().unwrap();
        let in_path = dir.path().join("input.txt");
        std::fs::write(&in_path, "hello stdin\n").unwrap();

        let runner = SystemRunner::new(Arc::new(NullAuditLogger));
        let spec = CommandSpec::new("cat").stdin_file(&in_path);
        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        assert!(output.output.contains("hello stdin"));
    }

    #[tokio::test]
    async fn test_system_runner_audits_invocations() {
        let audit = Arc::new(InMemoryAuditLogger::new());
        let runner = SystemRunner::new(audit.clone());
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("true")
            .secret_env("MYSQL_PWD", "hunter2");
        runner.run(&spec).await.unwrap();

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::CommandRun);
        assert_eq!(events[0].result, AuditResult::Success);
        let details = events[0].details.as_ref().unwrap();
        assert_eq!(details["exit_code"], 0);
        assert!(!details["command"].as_str().unwrap().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_fake_runner_default_success() {
        let runner = FakeRunner::new();
        let output = runner.run(&CommandSpec::new("ufw")).await.unwrap();
        assert!(output.success());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_fake_runner_queued_responses_in_order() {
        let runner = FakeRunner::new();
        runner.succeed_with("certbot", "Congratulations");
        runner.fail_with("certbot", 1, "rate limited");

        let first = runner.run(&CommandSpec::new("certbot")).await.unwrap();
        assert!(first.success());
        assert!(first.output.contains("Congratulations"));

        let second = runner.run(&CommandSpec::new("certbot")).await.unwrap();
        assert!(!second.success());
        assert!(second.output.contains("rate limited"));

        // Queue exhausted: back to default success.
        let third = runner.run(&CommandSpec::new("certbot")).await.unwrap();
        assert!(third.success());
    }

    #[tokio::test]
    async fn test_fake_runner_timeout_injection() {
        let runner = FakeRunner::new();
        runner.time_out("mysqldump");
        let err = runner.run(&CommandSpec::new("mysqldump")).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_fake_runner_records_specs() {
        let runner = FakeRunner::new();
        runner
            .run(&CommandSpec::new("ufw").args(["allow", "22/tcp"]))
            .await
            .unwrap();
        runner.run(&CommandSpec::new("systemctl")).await.unwrap();

        let ufw_calls = runner.calls_for("ufw");
        assert_eq!(ufw_calls.len(), 1);
        assert_eq!(ufw_calls[0].args, vec!["allow", "22/tcp"]);
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists(Path::new("/bin/sh")));
        assert!(!binary_exists(Path::new("/nonexistent/binary-xyz")));
    }
}
