//! In-memory [`ToolRunner`] for tests.
//!
//! Responses are keyed by program and argument prefix; the longest matching
//! prefix wins. A rule with several queued responses pops them in order and
//! keeps repeating the last one. Unmatched commands exit 127.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::{Arc, Mutex, PoisonError};

use super::{ProcessHandle, ToolCommand, ToolError, ToolOutput, ToolRunner};

#[derive(Debug)]
struct Rule {
    program: String,
    prefix: Vec<String>,
    responses: VecDeque<ToolOutput>,
}

/// Scripted stand-in for external tools.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ToolCommand>>,
    spawns: Mutex<VecDeque<FakeProcess>>,
    spawned: Mutex<Vec<ToolCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `program <prefix...>` with `output` (repeated forever).
    #[must_use]
    pub fn on(self, program: &str, prefix: &[&str], output: ToolOutput) -> Self {
        self.respond(program, prefix, [output]);
        self
    }

    /// Answer `program <prefix...>` with each output in turn; the last one
    /// repeats once the queue is drained.
    pub fn respond<I>(&self, program: &str, prefix: &[&str], outputs: I)
    where
        I: IntoIterator<Item = ToolOutput>,
    {
        lock(&self.rules).push(Rule {
            program: program.to_owned(),
            prefix: prefix.iter().map(|s| (*s).to_owned()).collect(),
            responses: outputs.into_iter().collect(),
        });
    }

    /// Queue a process handle returned by the next `spawn`.
    pub fn queue_spawn(&self, process: FakeProcess) {
        lock(&self.spawns).push_back(process);
    }

    /// Every command passed to `run`, in order.
    pub fn calls(&self) -> Vec<ToolCommand> {
        lock(&self.calls).clone()
    }

    /// Every command passed to `spawn`, in order.
    pub fn spawned(&self) -> Vec<ToolCommand> {
        lock(&self.spawned).clone()
    }

    /// Calls whose program and leading args match.
    pub fn calls_matching(&self, program: &str, prefix: &[&str]) -> Vec<ToolCommand> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program && starts_with(&c.args, prefix))
            .collect()
    }
}

fn starts_with(args: &[String], prefix: &[impl AsRef<str>]) -> bool {
    args.len() >= prefix.len()
        && args
            .iter()
            .zip(prefix)
            .all(|(a, p)| a.as_str() == p.as_ref())
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
        lock(&self.calls).push(cmd.clone());

        let mut rules = lock(&self.rules);
        let best = rules
            .iter_mut()
            .filter(|r| r.program == cmd.program && starts_with(&cmd.args, &r.prefix))
            .max_by_key(|r| r.prefix.len());

        let Some(rule) = best else {
            return Ok(ToolOutput::failed(127, format!("no scripted response for: {cmd}")));
        };
        let output = if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        };
        Ok(output.unwrap_or_default())
    }

    fn spawn(
        &self,
        cmd: &ToolCommand,
        _stdout: File,
        _stderr: File,
    ) -> Result<Box<dyn ProcessHandle>, ToolError> {
        lock(&self.spawned).push(cmd.clone());
        let process = lock(&self.spawns)
            .pop_front()
            .unwrap_or_else(|| FakeProcess::exited(4242, 0));
        Ok(Box::new(process))
    }
}

// ---------------------------------------------------------------------------
// FakeProcess
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ProcState {
    exit: Option<i32>,
    killed: bool,
    /// Exit automatically after this many `try_wait` calls.
    exit_after: Option<u32>,
    /// `kill` fails and the process keeps running.
    refuse_kill: bool,
}

/// A process whose lifetime is controlled by the test.
///
/// Clones share state, so a test keeps one clone to flip or inspect while
/// the harness owns the boxed handle.
#[derive(Clone, Debug)]
pub struct FakeProcess {
    id: u32,
    state: Arc<Mutex<ProcState>>,
}

impl FakeProcess {
    /// A process that keeps running until told otherwise.
    pub fn running(id: u32) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(ProcState {
                exit: None,
                killed: false,
                exit_after: None,
                refuse_kill: false,
            })),
        }
    }

    /// A process that has already exited.
    pub fn exited(id: u32, code: i32) -> Self {
        let p = Self::running(id);
        p.exit(code);
        p
    }

    /// A process that exits on the `polls`-th liveness check.
    pub fn exits_after(id: u32, polls: u32) -> Self {
        let p = Self::running(id);
        lock(&p.state).exit_after = Some(polls);
        p
    }

    /// A running process that cannot be killed.
    pub fn unkillable(id: u32) -> Self {
        let p = Self::running(id);
        lock(&p.state).refuse_kill = true;
        p
    }

    /// Make the process exit with `code`.
    pub fn exit(&self, code: i32) {
        lock(&self.state).exit = Some(code);
    }

    pub fn was_killed(&self) -> bool {
        lock(&self.state).killed
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).exit.is_none()
    }
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        let mut state = lock(&self.state);
        if state.exit.is_none() {
            match state.exit_after {
                Some(0) => state.exit = Some(0),
                Some(n) => state.exit_after = Some(n - 1),
                None => {}
            }
        }
        Ok(state.exit)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        let mut state = lock(&self.state);
        if state.refuse_kill {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        }
        state.killed = true;
        if state.exit.is_none() {
            state.exit = Some(-1);
        }
        Ok(())
    }
}
