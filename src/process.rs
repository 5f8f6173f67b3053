//! External tool invocation.
//!
//! Every tool the build drives (7z, unsquashfs, mksquashfs, xorriso, mount,
//! chroot, openssl) is started through [`Cmd`]. A failed tool surfaces as an
//! error carrying its exit code and stderr, and every invocation is logged at
//! debug level with its full argument list.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Captured outcome of a finished tool.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code; `-1` when the child died from a signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

#[derive(Debug, Clone)]
enum Input {
    Inherit,
    Null,
    Bytes(Vec<u8>),
}

/// A tool invocation under construction.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    input: Input,
    allow_fail: bool,
    failure_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            input: Input::Inherit,
            allow_fail: false,
            failure_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| OsString::from(a.as_ref())));
        self
    }

    /// Paths go through untouched, even when they are not valid UTF-8.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs.push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.envs.extend(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string())),
        );
        self
    }

    /// Write `input` to the child's stdin and close it. Secrets handed over
    /// this way never appear in argv or on disk.
    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Input::Bytes(input.into());
        self
    }

    /// Attach stdin to /dev/null so the child can never block on a prompt.
    pub fn stdin_null(mut self) -> Self {
        self.input = Input::Null;
        self
    }

    /// Hand back non-zero exits as a result instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// First line of the error when the tool fails.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.failure_msg = Some(msg.as_ref().to_string());
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(&a.to_string_lossy());
        }
        line
    }

    fn spawn_error(&self) -> String {
        format!("Could not start '{}'. Is it installed?", self.program)
    }

    fn failure(&self, code: i32, stderr: &str) -> anyhow::Error {
        let head = self
            .failure_msg
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program));
        if stderr.is_empty() {
            anyhow::anyhow!("{} (exit code {})", head, code)
        } else {
            anyhow::anyhow!("{} (exit code {}):\n{}", head, code, stderr)
        }
    }

    /// Run with stdout and stderr captured.
    pub fn run(self) -> Result<CommandResult> {
        debug!(command = %self.command_line(), "running");
        let mut cmd = self.build();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(match self.input {
            Input::Inherit => Stdio::inherit(),
            Input::Null => Stdio::null(),
            Input::Bytes(_) => Stdio::piped(),
        });

        let mut child = cmd.spawn().with_context(|| self.spawn_error())?;
        if let Input::Bytes(bytes) = &self.input {
            // Dropping the handle at the end of this block closes the pipe.
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes)
                    .with_context(|| format!("Failed to feed stdin of '{}'", self.program))?;
            }
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed waiting for '{}'", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() && !self.allow_fail {
            return Err(self.failure(result.code(), result.stderr_trimmed()));
        }
        Ok(result)
    }

    /// Run attached to the terminal. For long tools whose progress the
    /// operator should see, and for the vendor installer, which may prompt.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        debug!(command = %self.command_line(), "running attached");
        let mut cmd = self.build();
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        cmd.stdin(match self.input {
            Input::Null => Stdio::null(),
            Input::Inherit | Input::Bytes(_) => Stdio::inherit(),
        });

        let status = cmd.status().with_context(|| self.spawn_error())?;
        if !status.success() && !self.allow_fail {
            return Err(self.failure(status.code().unwrap_or(-1), ""));
        }
        Ok(status)
    }
}

/// Whether `program` resolves on `PATH`.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}
