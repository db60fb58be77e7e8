//! Running external command line tools.
//!
//! Everything the service does to the token happens through external
//! programs. A [`ToolCommand`] describes one invocation. Running it spawns
//! the program, waits for it for at most the configured time, and collects
//! its exit status and output. If the wait is abandoned, either because
//! the timeout passed or because the future was dropped, the child is
//! killed and reaped by the runtime.
//!
//! Arguments that carry secrets are kept in a [`SecretString`] and are
//! replaced by a masked rendition whenever the command is displayed. The
//! [`Redactor`] does the same for text the tool itself prints.

use std::fmt;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use log::trace;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use crate::commons::error::{Error, IoError};
use crate::constants::REDACTED;


//------------ ToolArg -------------------------------------------------------

enum ToolArg {
    Plain(OsString),
    Secret { value: SecretString, shown: String },
}


//------------ ToolCommand ---------------------------------------------------

/// A single invocation of an external tool.
pub struct ToolCommand {
    /// A short name for use in log and error messages.
    name: String,

    program: OsString,

    args: Vec<ToolArg>,

    timeout: Duration,
}

impl ToolCommand {
    /// Creates a new command.
    ///
    /// The `argv` is the configured command line prefix: the program
    /// followed by any fixed arguments.
    pub fn new(
        name: impl Into<String>,
        argv: &[String],
        timeout: Duration,
    ) -> Result<Self, Error> {
        let name = name.into();
        let (program, fixed) = argv.split_first().ok_or_else(|| {
            Error::custom(format!("no command configured for {name}"))
        })?;
        Ok(ToolCommand {
            name,
            program: program.into(),
            args: fixed.iter().map(|arg| ToolArg::Plain(arg.into())).collect(),
            timeout,
        })
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(ToolArg::Plain(arg.into()));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Adds an argument that must never be shown.
    ///
    /// The `shown` value is used in its place when displaying the command.
    pub fn secret_arg(
        mut self, value: SecretString, shown: impl Into<String>
    ) -> Self {
        self.args.push(ToolArg::Secret { value, shown: shown.into() });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the command to completion.
    ///
    /// Returns an error if the program could not be started or did not
    /// finish in time. A non-zero exit is not an error at this level, the
    /// caller gets to decide what it means.
    pub async fn run(&self) -> Result<ToolOutput, Error> {
        trace!("Running {self}");

        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            match arg {
                ToolArg::Plain(arg) => cmd.arg(arg),
                ToolArg::Secret { value, .. } => cmd.arg(value.expose_secret()),
            };
        }
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                IoError::new(format!("Cannot start {}", self.name), err)
            })?;

        let output = match tokio::time::timeout(
            self.timeout, child.wait_with_output()
        ).await {
            Ok(output) => output.map_err(|err| {
                IoError::new(format!("Cannot wait for {}", self.name), err)
            })?,
            Err(_) => {
                return Err(Error::ToolTimeout {
                    tool: self.name.clone(),
                    timeout: self.timeout,
                })
            }
        };

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            match arg {
                ToolArg::Plain(arg) => write!(f, " {}", arg.to_string_lossy())?,
                ToolArg::Secret { shown, .. } => write!(f, " {shown}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("name", &self.name)
            .field("cmd", &self.to_string())
            .field("timeout", &self.timeout)
            .finish()
    }
}


//------------ ToolOutput ----------------------------------------------------

/// The outcome of a finished tool.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Returns the exit code or `None` if the tool was killed by a signal.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Returns what the tool had to say about a failure.
    ///
    /// This is stderr, unless that is empty, in which case it is stdout.
    pub fn diagnostics(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        }
        else {
            stderr
        }
    }
}


//------------ Redactor ------------------------------------------------------

/// Scrubs secrets and local paths from tool output.
#[derive(Default)]
pub struct Redactor {
    replacements: Vec<(String, String)>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every occurrence of `secret` by a fixed mask.
    pub fn secret(self, secret: &str) -> Self {
        self.replace(secret, REDACTED)
    }

    /// Replaces every occurrence of `path` by `label`.
    pub fn path(self, path: &Path, label: &str) -> Self {
        self.replace(&path.to_string_lossy(), label)
    }

    fn replace(mut self, from: &str, to: &str) -> Self {
        if !from.is_empty() {
            self.replacements.push((from.to_string(), to.to_string()));
            // Longest first, so a path is not partially replaced via a
            // shorter path that is its prefix.
            self.replacements.sort_by(|l, r| r.0.len().cmp(&l.0.len()));
        }
        self
    }

    pub fn redact(&self, text: &str) -> String {
        let mut res = text.to_string();
        for (from, to) in &self.replacements {
            res = res.replace(from.as_str(), to);
        }
        res
    }
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Redactor({} replacements)", self.replacements.len())
    }
}


//------------ Tests ---------------------------------------------------------
