//! Execution of external system commands.
//!
//! Every interaction with the operating system (interface configuration,
//! service control, status queries) goes through [`CommandRunner`] so a hard
//! per-call timeout applies everywhere and tests can replace the OS.

use crate::error::{NetworkError, NetworkResult};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{fmt, io::ErrorKind, process::Stdio, time::Duration};
use tokio::{process::Command, time::timeout};
use trait_variant::make;

/// A program invocation with its arguments.
///
/// Arguments added with [`SystemCommand::secret_arg`] are masked whenever the
/// command is displayed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemCommand {
    program: String,
    args: Vec<String>,
    redacted: Vec<usize>,
}

impl SystemCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.redacted.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// True if the program name and the leading arguments match `prefix`.
    pub fn starts_with(&self, program: &str, prefix: &[&str]) -> bool {
        self.program == program
            && self.args.len() >= prefix.len()
            && self.args.iter().zip(prefix).all(|(arg, p)| arg == p)
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.redacted.contains(&i) {
                write!(f, " ***")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit status into [`NetworkError::CommandFailed`].
    pub fn checked(self, command: &SystemCommand) -> NetworkResult<Self> {
        if self.success() {
            return Ok(self);
        }

        let status = match self.exit_code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };

        let stderr = self.stderr.trim();
        let reason = if stderr.is_empty() {
            status
        } else {
            format!("{status}: {stderr}")
        };

        Err(NetworkError::command_failed(command, reason))
    }
}

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CommandRunner: Sync {
    /// Run a command to completion.
    ///
    /// A non-zero exit status is not an error here; see [`run_checked`].
    /// Fails with `ToolMissing` if the program does not exist and with
    /// `CommandFailed` if it could not be spawned or timed out.
    async fn run(&self, command: &SystemCommand) -> NetworkResult<CommandOutput>;
}

/// Run a command and require a zero exit status.
pub async fn run_checked<R>(runner: &R, command: &SystemCommand) -> NetworkResult<CommandOutput>
where
    R: CommandRunner,
{
    runner.run(command).await?.checked(command)
}

/// [`CommandRunner`] spawning real processes with a hard timeout.
#[derive(Clone, Debug)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &SystemCommand) -> NetworkResult<CommandOutput> {
        debug!("run: {command}");

        let child = Command::new(command.program())
            .args(command.arguments())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(NetworkError::tool_missing(command.program()));
            }
            Ok(Err(e)) => {
                return Err(NetworkError::command_failed(
                    command,
                    format!("failed to spawn: {e}"),
                ));
            }
            Err(_) => {
                return Err(NetworkError::command_failed(
                    command,
                    format!("timed out after {}ms", self.timeout.as_millis()),
                ));
            }
        };

        let output = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!("{command} exited with {:?}", output.exit_code);

        Ok(output)
    }
}
