//! External command execution.
//!
//! Every tool the builder shells out to goes through [`Cmd`] and an
//! injectable [`CommandRunner`]. [`HostRunner`] spawns real processes; tests
//! swap in a recording runner with scripted output.
//!
//! ```rust,ignore
//! use vm_builder::process::{Cmd, HostRunner};
//!
//! let out = Cmd::new("kpartx")
//!     .args(["-av"])
//!     .arg_path(&image)
//!     .error_msg("kpartx failed to map partitions")
//!     .run(&HostRunner)?;
//! ```

use crate::error::{Error, Result};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs a fully described command and reports how it went.
///
/// Implementations only execute and capture; whether a non-zero exit is an
/// error is decided by [`Cmd::run`].
pub trait CommandRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandOutput>;
}

/// Builder for an external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            error_msg: None,
            allow_fail: false,
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

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Extra environment variable for the child, on top of `LANG=C`.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `input` to the child's stdin instead of `/dev/null`.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Message prefixed to the error when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Do not treat a non-zero exit status as an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Execute through `runner`, turning a non-zero exit into
    /// [`Error::ExternalTool`] unless [`Cmd::allow_fail`] was set.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CommandOutput> {
        debug!("{}", self);
        let output = runner.execute(self)?;

        if !output.stderr.is_empty() {
            if self.allow_fail {
                debug!("{}: {}", self.program, output.stderr.trim_end());
            } else {
                info!("{}: {}", self.program, output.stderr.trim_end());
            }
        }

        if !self.allow_fail && !output.success() {
            return Err(Error::ExternalTool {
                message: self
                    .error_msg
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", self.program)),
                command: self.to_string(),
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Spawns real processes on the host.
///
/// The locale is forced to `C` so tool output can be parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandOutput> {
        let mut command = Command::new(cmd.program());
        command
            .args(cmd.get_args())
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in cmd.get_env() {
            command.env(key, value);
        }
        command.stdin(if cmd.get_stdin().is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound(cmd.program().to_string())
            } else {
                Error::Spawn {
                    program: cmd.program().to_string(),
                    source: e,
                }
            }
        })?;

        if let (Some(input), Some(mut stdin)) = (cmd.get_stdin(), child.stdin.take()) {
            stdin.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
