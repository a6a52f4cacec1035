// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for running host commands (the VM backend, the migration tool,
//! privilege elevation) and capturing their output.

use std::{
    fmt,
    process::{Command, Stdio},
};

use camino::Utf8Path;
use thiserror::Error;
use tracing::{debug, error, info};

/// A program to run on the host together with its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    /// Builds a command from a whitespace-separated command line, e.g.
    /// `"sudo /usr/bin/python2 leapp-tool.py"`. Returns `None` if the line is
    /// blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let program = words.next()?;
        Some(Self::new(program).args(words))
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

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run `{command}` in {work_dir}")]
    Spawn {
        command: String,
        work_dir: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "`{command}` failed ({status})\n\
         === stdout for failed command ===\n{stdout}\n\
         === stderr for failed command ===\n{stderr}"
    )]
    Failed {
        command: String,
        /// The process's exit status as rendered by the OS.
        status: String,
        /// The process's exit code, or `None` if it was killed by a signal.
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Runs host commands on behalf of the rest of the framework.
///
/// This is a trait so that the VM registry and migration orchestrator can be
/// exercised without a real VM backend.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` in `work_dir` and returns its standard output.
    ///
    /// If the command exits unsuccessfully and `ignore_errors` is set, the
    /// failure is swallowed and whatever the command wrote to stdout is
    /// returned. Otherwise the command's full output is logged and the call
    /// fails with [`CommandError::Failed`].
    fn run(
        &self,
        command: &HostCommand,
        work_dir: &Utf8Path,
        ignore_errors: bool,
    ) -> Result<String, CommandError>;
}

/// Runs commands as child processes of the harness, inheriting its
/// environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostCommandRunner;

impl CommandRunner for HostCommandRunner {
    fn run(
        &self,
        command: &HostCommand,
        work_dir: &Utf8Path,
        ignore_errors: bool,
    ) -> Result<String, CommandError> {
        info!(%command, %work_dir, "Running command");

        let output = Command::new(command.program())
            .args(command.arguments())
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| CommandError::Spawn {
                command: command.to_string(),
                work_dir: work_dir.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        if ignore_errors {
            debug!(
                %command,
                error_code = output.status.code(),
                "ignoring command failure"
            );
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        error!(
            %command,
            error_code = output.status.code(),
            %stdout,
            %stderr,
            "command failed"
        );

        Err(CommandError::Failed {
            command: command.to_string(),
            status: output.status.to_string(),
            code: output.status.code(),
            stdout,
            stderr,
        })
    }
}
