//! Agent spawning.
//!
//! Builds the natural-language prompt from the scenario template and the
//! eval env, launches the agent runner in the background with its output
//! redirected into the artifacts directory, and tears agents down when the
//! run times out. There is no retry: whether an agent "worked" is decided
//! later by verification.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{AgentConfig, RunnerKind, ToolsConfig};
use crate::env_file::EvalEnv;
use crate::error::{EvalError, Result};
use crate::telemetry;
use crate::tools::{self, ProcessHandle, ToolCommand, Toolbox};

// ---------------------------------------------------------------------------
// Prompt rendering
// ---------------------------------------------------------------------------

/// Substitute `{{KEY}}` placeholders with values from `env`.
///
/// Fails listing every placeholder that has no value, so a broken template
/// is caught before an agent is launched with half a prompt.
pub fn render_prompt(template: &str, env: &EvalEnv) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut missing = BTreeSet::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = &after[..end];
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if valid {
            match env.get(key) {
                Some(value) => out.push_str(value),
                None => {
                    missing.insert(key.to_owned());
                }
            }
        } else {
            out.push_str(&rest[start..start + 2 + end + 2]);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(EvalError::PromptVars {
            missing: missing.into_iter().collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Everything needed to launch one agent.
#[derive(Clone, Debug, Serialize)]
pub struct AgentRequest {
    pub name: String,
    pub role: String,
    pub channel: String,
    pub prompt: String,
    /// Directory receiving `agent-<name>.log` and `.stderr`.
    pub log_dir: PathBuf,
}

/// Build the runner command line for `request`.
pub fn agent_command(
    tools: &Toolbox<'_>,
    agent: &AgentConfig,
    request: &AgentRequest,
) -> ToolCommand {
    let bins: &ToolsConfig = tools.bins();
    let timeout = agent.timeout_secs.to_string();
    let cmd = match agent.runner {
        RunnerKind::Botbox => tools.command(&bins.botbox).args([
            "run-agent",
            "claude",
            "-p",
            request.prompt.as_str(),
            "-m",
            agent.model.as_str(),
            "-t",
            timeout.as_str(),
        ]),
        RunnerKind::Claude => tools.command(&bins.claude).args([
            "--dangerously-skip-permissions",
            "-p",
            request.prompt.as_str(),
            "--model",
            agent.model.as_str(),
        ]),
    };
    let cmd = cmd
        .env("BOTBUS_AGENT", request.name.as_str())
        .env("BOTBUS_CHANNEL", request.channel.as_str());
    match telemetry::current_traceparent() {
        Some(traceparent) => cmd.env("TRACEPARENT", traceparent),
        None => cmd,
    }
}

/// Log file paths for an agent.
pub fn log_paths(log_dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        log_dir.join(format!("agent-{name}.log")),
        log_dir.join(format!("agent-{name}.stderr")),
    )
}

/// A launched agent.
pub struct AgentProcess {
    pub name: String,
    pub role: String,
    pub log_path: PathBuf,
    pub stderr_path: PathBuf,
    handle: Box<dyn ProcessHandle>,
}

impl AgentProcess {
    pub fn pid(&self) -> u32 {
        self.handle.id()
    }

    /// `true` while the process has not exited. A failed liveness query
    /// counts as exited.
    pub fn is_alive(&mut self) -> bool {
        match self.handle.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                tracing::warn!(agent = %self.name, error = %e, "liveness check failed");
                false
            }
        }
    }

    pub fn kill(&mut self) -> std::io::Result<()> {
        self.handle.kill()
    }
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("name", &self.name)
            .field("pid", &self.handle.id())
            .finish_non_exhaustive()
    }
}

/// Launch an agent with stdout/stderr captured to files.
pub fn spawn_agent(
    tools: &Toolbox<'_>,
    agent: &AgentConfig,
    request: &AgentRequest,
) -> Result<AgentProcess> {
    std::fs::create_dir_all(&request.log_dir)?;
    let (log_path, stderr_path) = log_paths(&request.log_dir, &request.name);
    let stdout = tools::output_file(&log_path)?;
    let stderr = tools::output_file(&stderr_path)?;

    let cmd = agent_command(tools, agent, request);
    let handle = tools.runner().spawn(&cmd, stdout, stderr)?;
    tracing::info!(
        agent = %request.name,
        role = %request.role,
        pid = handle.id(),
        runner = %agent.runner,
        model = %agent.model,
        "agent spawned"
    );
    Ok(AgentProcess {
        name: request.name.clone(),
        role: request.role.clone(),
        log_path,
        stderr_path,
        handle,
    })
}

/// What [`kill_all_agents`] did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KillReport {
    /// botty agent ids that were killed.
    pub botty_killed: Vec<String>,
    /// Directly spawned agents that were still running and got killed.
    pub processes_killed: Vec<String>,
    pub errors: Vec<String>,
}

/// Best-effort termination of every agent this eval knows about.
///
/// Lists botty agents and kills each whose id equals, or is prefixed by,
/// one of `known` (hook-spawned workers are named after their lead). Then
/// kills any still-running direct children.
pub fn kill_all_agents(
    tools: &Toolbox<'_>,
    processes: &mut [AgentProcess],
    known: &[String],
) -> KillReport {
    let mut report = KillReport::default();

    match tools.botty().list() {
        Ok(agents) => {
            for agent in agents {
                if !known.iter().any(|k| agent.id.starts_with(k.as_str())) {
                    continue;
                }
                match tools.botty().kill(&agent.id) {
                    Ok(()) => report.botty_killed.push(agent.id),
                    Err(e) => report.errors.push(format!("{}: {e}", agent.id)),
                }
            }
        }
        Err(e) => report.errors.push(format!("botty list: {e}")),
    }

    for process in processes.iter_mut() {
        if process.is_alive() {
            match process.kill() {
                Ok(()) => report.processes_killed.push(process.name.clone()),
                Err(e) => report
                    .errors
                    .push(format!("{} (pid {}): {e}", process.name, process.pid())),
            }
        }
    }

    if !report.errors.is_empty() {
        tracing::warn!(errors = ?report.errors, "some agents could not be killed");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_file::EvalEnv;
    use crate::tools::ToolOutput;
    use crate::tools::fake::{FakeProcess, ScriptedRunner};

    fn env() -> EvalEnv {
        let mut env = EvalEnv::new("/tmp/.eval-env");
        env.set("AGENT_DEV", "eval-dev");
        env.set("PROJECT_NAME", "evalproj");
        env
    }

    #[test]
    fn renders_known_placeholders() {
        let out = render_prompt("You are {{AGENT_DEV}} on {{PROJECT_NAME}}.", &env()).unwrap();
        assert_eq!(out, "You are eval-dev on evalproj.");
    }

    #[test]
    fn lists_all_missing_placeholders() {
        let err = render_prompt("{{TASK_ID}} {{AGENT_DEV}} {{EVAL_DIR}} {{TASK_ID}}", &env())
            .unwrap_err();
        match err {
            EvalError::PromptVars { missing } => assert_eq!(missing, ["EVAL_DIR", "TASK_ID"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn leaves_non_placeholder_braces_alone() {
        let out = render_prompt("fmt: {{name}} and {{ open", &env()).unwrap();
        assert_eq!(out, "fmt: {{name}} and {{ open");
    }

    fn request(dir: &Path) -> AgentRequest {
        AgentRequest {
            name: "eval-dev".to_owned(),
            role: "dev".to_owned(),
            channel: "evalproj".to_owned(),
            prompt: "do the thing".to_owned(),
            log_dir: dir.to_owned(),
        }
    }

    #[test]
    fn botbox_command_line() {
        let runner = ScriptedRunner::new();
        let tools = Toolbox::new(&runner, ToolsConfig::default(), "/tmp/p");
        let cmd = agent_command(&tools, &AgentConfig::default(), &request(Path::new("/tmp")));
        assert_eq!(cmd.program, "botbox");
        assert_eq!(
            cmd.args,
            ["run-agent", "claude", "-p", "do the thing", "-m", "sonnet", "-t", "900"]
        );
        assert!(cmd.env.contains(&("BOTBUS_AGENT".to_owned(), "eval-dev".to_owned())));
    }

    #[test]
    fn claude_command_line() {
        let runner = ScriptedRunner::new();
        let tools = Toolbox::new(&runner, ToolsConfig::default(), "/tmp/p");
        let agent = AgentConfig {
            runner: RunnerKind::Claude,
            model: "opus".to_owned(),
            ..AgentConfig::default()
        };
        let cmd = agent_command(&tools, &agent, &request(Path::new("/tmp")));
        assert_eq!(cmd.program, "claude");
        assert!(cmd.args.windows(2).any(|w| w == ["--model", "opus"]));
    }

    #[test]
    fn spawn_creates_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.queue_spawn(FakeProcess::running(99));
        let tools = Toolbox::new(&runner, ToolsConfig::default(), dir.path());
        let mut agent = spawn_agent(&tools, &AgentConfig::default(), &request(dir.path())).unwrap();
        assert_eq!(agent.pid(), 99);
        assert!(agent.is_alive());
        assert!(agent.log_path.exists());
        assert!(agent.stderr_path.exists());
        assert_eq!(runner.spawned().len(), 1);
    }

    #[test]
    fn kill_all_agents_kills_known_botty_ids_and_children() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .on(
                "botty",
                &["list"],
                ToolOutput::ok(
                    r#"[{"id":"eval-dev"},{"id":"eval-dev/worker-1"},{"id":"someone-else"}]"#,
                ),
            )
            .on("botty", &["kill"], ToolOutput::ok(""));
        let child = FakeProcess::running(5);
        runner.queue_spawn(child.clone());
        let tools = Toolbox::new(&runner, ToolsConfig::default(), dir.path());
        let agent = spawn_agent(&tools, &AgentConfig::default(), &request(dir.path())).unwrap();

        let mut processes = vec![agent];
        let report = kill_all_agents(&tools, &mut processes, &["eval-dev".to_owned()]);
        assert_eq!(report.botty_killed, ["eval-dev", "eval-dev/worker-1"]);
        assert_eq!(report.processes_killed, ["eval-dev"]);
        assert!(child.was_killed());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn failed_child_kill_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new().on("botty", &["list"], ToolOutput::ok("[]"));
        let child = FakeProcess::unkillable(6);
        runner.queue_spawn(child.clone());
        let tools = Toolbox::new(&runner, ToolsConfig::default(), dir.path());
        let agent = spawn_agent(&tools, &AgentConfig::default(), &request(dir.path())).unwrap();

        let report = kill_all_agents(&tools, &mut [agent], &["eval-dev".to_owned()]);
        assert!(report.processes_killed.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("eval-dev (pid 6)"), "{:?}", report.errors);
        assert!(child.is_running());
    }

    #[test]
    fn kill_all_agents_survives_botty_failure() {
        let runner = ScriptedRunner::new().on("botty", &["list"], ToolOutput::failed(1, "no server"));
        let tools = Toolbox::new(&runner, ToolsConfig::default(), "/tmp/p");
        let report = kill_all_agents(&tools, &mut [], &["eval-dev".to_owned()]);
        assert_eq!(report.errors.len(), 1);
    }
}
