//! Adapters for the external CLIs an eval drives.
//!
//! Everything an eval observes comes from other binaries: `bus` for
//! messaging, hooks and claims, `br`/`bn` for tasks, `maw` for workspaces,
//! `crit` for reviews and `botty` for spawned agents. This module wraps
//! them behind [`ToolRunner`] so the orchestration code can be exercised
//! against [`fake::ScriptedRunner`] in tests.
//!
//! [`Toolbox`] carries the runner plus the per-eval environment (most
//! importantly `BOTBUS_DATA_DIR`) and hands out typed adapters.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use thiserror::Error;

use crate::config::ToolsConfig;

pub mod botty;
pub mod bus;
pub mod crit;
pub mod fake;
pub mod maw;
pub mod tasks;

// ---------------------------------------------------------------------------
// ToolCommand / ToolOutput
// ---------------------------------------------------------------------------

/// A fully described external command invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCommand {
    /// Program name or path.
    pub program: String,
    /// Arguments, not including the program.
    pub args: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory, if not the current one.
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Wrap this command in `maw exec <workspace> -- ...`.
    ///
    /// The wrapped command keeps env and cwd; the program becomes `maw_bin`.
    #[must_use]
    pub fn via_maw_exec(self, maw_bin: &str, workspace: &str) -> Self {
        let mut args = vec![
            "exec".to_owned(),
            workspace.to_owned(),
            "--".to_owned(),
            self.program,
        ];
        args.extend(self.args);
        Self {
            program: maw_bin.to_owned(),
            args,
            env: self.env,
            cwd: self.cwd,
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.status, Some(0))
    }
}

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// Failure invoking or interpreting an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started at all.
    #[error(
        "failed to run '{program}': {source}\n  To fix: check that it is installed and on PATH:\n    evals doctor"
    )]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran but exited non-zero.
    #[error("'{command}' exited with {}: {}", exit_label(.status), first_lines(.stderr))]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The program printed output we could not interpret.
    #[error("'{command}' printed unexpected output: {detail}")]
    Parse { command: String, detail: String },

    /// Redirecting output to a file failed.
    #[error("cannot open output file {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn exit_label(status: &Option<i32>) -> String {
    status.map_or_else(|| "signal".to_owned(), |code| format!("code {code}"))
}

fn first_lines(text: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().take(5).collect();
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// ToolRunner / ProcessHandle
// ---------------------------------------------------------------------------

/// A running background process (an agent).
pub trait ProcessHandle: Send {
    /// OS process id (or a fake id in tests).
    fn id(&self) -> u32;

    /// `Some(code)` once the process has exited (`-1` for a signal),
    /// `None` while it is still running.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Forcibly terminate the process.
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Executes external commands.
pub trait ToolRunner {
    /// Run to completion and capture output. A non-zero exit is *not* an
    /// error here; use [`ToolRunner::run_ok`] for that.
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError>;

    /// Start a background process with stdout/stderr redirected to files.
    fn spawn(
        &self,
        cmd: &ToolCommand,
        stdout: File,
        stderr: File,
    ) -> Result<Box<dyn ProcessHandle>, ToolError>;

    /// Run and require a zero exit status.
    fn run_ok(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
        let out = self.run(cmd)?;
        if out.success() {
            Ok(out)
        } else {
            Err(ToolError::Failed {
                command: cmd.to_string(),
                status: out.status,
                stderr: if out.stderr.trim().is_empty() {
                    out.stdout
                } else {
                    out.stderr
                },
            })
        }
    }

    /// Run, require success, and parse stdout as JSON.
    fn run_json(&self, cmd: &ToolCommand) -> Result<serde_json::Value, ToolError> {
        let out = self.run_ok(cmd)?;
        serde_json::from_str(out.stdout.trim()).map_err(|e| ToolError::Parse {
            command: cmd.to_string(),
            detail: e.to_string(),
        })
    }
}

/// Runs commands as real child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn command(cmd: &ToolCommand) -> Command {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        command.envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        command
    }
}

impl ToolRunner for SystemRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
        tracing::debug!(command = %cmd, "run");
        let output = Self::command(cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ToolError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;
        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(
        &self,
        cmd: &ToolCommand,
        stdout: File,
        stderr: File,
    ) -> Result<Box<dyn ProcessHandle>, ToolError> {
        tracing::debug!(program = %cmd.program, "spawn");
        let child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;
        Ok(Box::new(ChildProcess(child)))
    }
}

struct ChildProcess(Child);

impl ProcessHandle for ChildProcess {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.0.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        match self.0.kill() {
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            other => {
                let _ = self.0.wait();
                other
            }
        }
    }
}

/// Open (truncate) a file for redirected process output.
pub fn output_file(path: &Path) -> Result<File, ToolError> {
    File::create(path).map_err(|source| ToolError::Output {
        path: path.to_owned(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Toolbox
// ---------------------------------------------------------------------------

/// A runner bound to one eval's environment and tool configuration.
pub struct Toolbox<'a> {
    runner: &'a dyn ToolRunner,
    bins: ToolsConfig,
    env: Vec<(String, String)>,
    project_dir: PathBuf,
}

impl<'a> Toolbox<'a> {
    pub fn new(runner: &'a dyn ToolRunner, bins: ToolsConfig, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            bins,
            env: Vec::new(),
            project_dir: project_dir.into(),
        }
    }

    /// Add an environment variable passed to every command.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn runner(&self) -> &'a dyn ToolRunner {
        self.runner
    }

    pub const fn bins(&self) -> &ToolsConfig {
        &self.bins
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Base command for `program` with the eval env and project cwd applied.
    pub fn command(&self, program: &str) -> ToolCommand {
        let mut cmd = ToolCommand::new(program).cwd(&self.project_dir);
        cmd.env.clone_from(&self.env);
        cmd
    }

    pub const fn bus(&self) -> bus::Bus<'_> {
        bus::Bus::new(self)
    }

    pub const fn tasks(&self) -> tasks::Tasks<'_> {
        tasks::Tasks::new(self)
    }

    pub const fn maw(&self) -> maw::Maw<'_> {
        maw::Maw::new(self)
    }

    pub const fn crit(&self) -> crit::Crit<'_> {
        crit::Crit::new(self)
    }

    pub const fn botty(&self) -> botty::Botty<'_> {
        botty::Botty::new(self)
    }
}
