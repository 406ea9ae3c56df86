//! Structured subprocess execution for jail provisioning.
//!
//! Every external command (the jail helper, `git`, `tar`) is described by an
//! [`Invocation`] and run through an [`Executor`]. Nothing is ever passed
//! through a shell; [`Invocation::display`] only renders the argv for the
//! run log.

pub mod checkout;
pub mod env;
pub mod jail;
pub mod overlay;

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::RunnerError;
use crate::runlog::RunLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Append stdout and stderr to this file instead of capturing them.
    pub output: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            output: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn append_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// First argument, which names the helper verb or git subcommand.
    pub fn verb(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Shell-quoted argv, for logs only.
    pub fn display(&self) -> String {
        std::iter::once(shell_quote(&self.program.to_string_lossy()))
            .chain(self.args.iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote `s` for a POSIX shell when it contains anything beyond a safe set.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub trait Executor: Send + Sync {
    fn exec(&self, inv: &Invocation) -> Result<ExecOutput>;
}

/// Runs invocations as child processes with stdin from `/dev/null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn exec(&self, inv: &Invocation) -> Result<ExecOutput> {
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args).stdin(Stdio::null());
        if let Some(cwd) = &inv.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &inv.env {
            cmd.env(k, v);
        }
        let launch = || format!("failed to launch {}", inv.program.display());
        // killed by a signal
        let code = |status: std::process::ExitStatus| status.code().unwrap_or(-1);
        match &inv.output {
            // the jail helper daemonizes; waiting on pipes would block for the
            // whole run, so its output goes straight to the log file
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let status = cmd
                    .stdout(file.try_clone()?)
                    .stderr(file)
                    .status()
                    .with_context(launch)?;
                Ok(ExecOutput {
                    code: code(status),
                    ..Default::default()
                })
            }
            None => {
                let out = cmd.output().with_context(launch)?;
                Ok(ExecOutput {
                    code: code(out.status),
                    stdout: out.stdout,
                    stderr: out.stderr,
                })
            }
        }
    }
}

/// Runs invocations and appends the argv and output to a run log.
pub struct CommandLog<'a> {
    executor: &'a dyn Executor,
    log: &'a mut RunLog,
}

impl<'a> CommandLog<'a> {
    pub fn new(executor: &'a dyn Executor, log: &'a mut RunLog) -> Self {
        Self { executor, log }
    }

    pub fn note(&mut self, line: &str) -> Result<(), RunnerError> {
        self.log.command(line)?;
        Ok(())
    }

    /// Exit status of `inv`. Failing to launch at all is an environment
    /// error; a non-zero status is returned for the caller to judge.
    pub fn run(&mut self, inv: &Invocation) -> Result<i32, RunnerError> {
        self.log.command(&inv.display())?;
        self.log.flush()?;
        let inv = inv.clone().append_output(self.log.path());
        let out = self
            .executor
            .exec(&inv)
            .map_err(|e| RunnerError::env(format!("{e:#}")))?;
        self.log.append(&out.stdout)?;
        self.log.append(&out.stderr)?;
        tracing::debug!(program = %inv.program.display(), verb = ?inv.verb(), code = out.code, "command finished");
        Ok(out.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("jail/pa-jail"), "jail/pa-jail");
        assert_eq!(shell_quote("-T30"), "-T30");
        assert_eq!(shell_quote("make check"), "'make check'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn invocation_builder_and_display() {
        let inv = Invocation::new("git")
            .args(["fetch", "--depth=1"])
            .path_arg(Path::new("/srv/repo 1"))
            .current_dir("/tmp");
        assert_eq!(inv.verb(), Some("fetch"));
        assert_eq!(inv.display(), "git fetch --depth=1 '/srv/repo 1'");
        assert_eq!(inv.cwd.as_deref(), Some(Path::new("/tmp")));
    }

    #[cfg(unix)]
    #[test]
    fn process_executor_captures_status_and_output() {
        let out = ProcessExecutor
            .exec(&Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
        assert!(ProcessExecutor
            .exec(&Invocation::new("/nonexistent/program"))
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn process_executor_appends_to_output_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        std::fs::write(&log, "++ header\n").unwrap();
        let out = ProcessExecutor
            .exec(
                &Invocation::new("sh")
                    .args(["-c", "echo out; echo err >&2"])
                    .append_output(&log),
            )
            .unwrap();
        assert_eq!(out.code, 0);
        assert!(out.stdout.is_empty());
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.starts_with("++ header\nout\n"));
        assert!(text.contains("err\n"));
    }
}
