//! Run phase: seed check, config patch, spawn, poll, cleanup, capture.
//!
//! Phases run in a fixed order. A failing phase is recorded in
//! [`RunReport::failed_phases`] and the next phase still runs; capture in
//! particular always happens so that verify has something to look at.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::scenarios::{self, Launch, PROJECT_CONFIG, Scenario, Target};
use crate::artifacts::{self, CaptureManifest, CaptureRequest, SourceFile};
use crate::config::EvalConfig;
use crate::env_file::{self, EvalEnv};
use crate::error::{EvalError, Result};
use crate::fixture;
use crate::poll::{Clock, LiveObserver, PollOutcome, PollSettings, PollState, PollTarget};
use crate::registrar::{self, HookRefresh};
use crate::spawner::{self, AgentProcess, AgentRequest, KillReport};
use crate::tools::{ToolRunner, Toolbox};

/// Report file written into the artifacts dir.
pub const RUN_REPORT: &str = "run.json";

/// A phase that returned an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PhaseFailure {
    pub phase: &'static str,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SpawnedAgent {
    pub name: String,
    pub role: String,
    pub pid: u32,
    pub log: PathBuf,
}

/// Everything the run phase did, written to `run.json`.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub failed_phases: Vec<PhaseFailure>,
    pub agents: Vec<SpawnedAgent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookRefresh>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<KillReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos_remaining: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureManifest>,
}

impl RunReport {
    fn new(scenario: &str) -> Self {
        let now = Utc::now();
        Self {
            scenario: scenario.to_owned(),
            started_at: now,
            finished_at: now,
            failed_phases: Vec::new(),
            agents: Vec::new(),
            hooks: None,
            poll: None,
            cleanup: None,
            todos_remaining: None,
            capture: None,
        }
    }

    /// Run one phase, recording its error instead of returning it.
    fn phase<T>(&mut self, name: &'static str, f: impl FnOnce() -> Result<T>) -> Option<T> {
        let _span = tracing::info_span!("phase", name).entered();
        match f() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(phase = name, error = %e, "phase failed");
                self.failed_phases.push(PhaseFailure {
                    phase: name,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    pub fn phase_failed(&self, name: &str) -> bool {
        self.failed_phases.iter().any(|f| f.phase == name)
    }

    /// Write the report as pretty JSON into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(RUN_REPORT), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Short human-readable summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "scenario: {}", self.scenario);
        for agent in &self.agents {
            let _ = writeln!(out, "agent: {} ({}) pid {}", agent.name, agent.role, agent.pid);
        }
        match &self.poll {
            Some(poll) => {
                let _ = write!(
                    out,
                    "poll: {} after {:.0}s ({} ticks)",
                    poll.state,
                    poll.elapsed.as_secs_f64(),
                    poll.ticks
                );
                match poll.worker_exited_in_grace {
                    Some(true) => out.push_str(", worker exited\n"),
                    Some(false) => out.push_str(", worker still running after grace\n"),
                    None => out.push('\n'),
                }
            }
            None => out.push_str("poll: did not run\n"),
        }
        if let Some(todos) = self.todos_remaining {
            let _ = writeln!(out, "todo!() remaining: {todos}");
        }
        if let Some(capture) = &self.capture {
            let _ = writeln!(
                out,
                "capture: {} artifacts, {} failed",
                capture.entries.len(),
                capture.failures().count()
            );
        }
        if self.failed_phases.is_empty() {
            out.push_str("failed phases: none\n");
        } else {
            out.push_str("failed phases:\n");
            for f in &self.failed_phases {
                let _ = writeln!(out, "  {}: {}", f.phase, f.error);
            }
        }
        out
    }
}

/// Run the agents for the eval described by `env`.
///
/// Only a broken env (unknown scenario, missing paths) is an error; every
/// phase failure ends up in the report.
pub fn run(
    runner: &dyn ToolRunner,
    env: &EvalEnv,
    config: &EvalConfig,
    clock: &mut dyn Clock,
) -> Result<RunReport> {
    let scenario = scenarios::find(env.require(env_file::EVAL_SCENARIO)?)?;
    let eval_dir = env.eval_dir()?;
    let project_dir = env.project_dir()?;
    let artifacts_dir = env.artifacts_dir()?;
    let tools = Toolbox::new(runner, config.tools.clone(), &project_dir)
        .with_env(env_file::BOTBUS_DATA_DIR, env.require(env_file::BOTBUS_DATA_DIR)?);

    let _span = tracing::info_span!("run", scenario = scenario.name).entered();
    let mut report = RunReport::new(scenario.name);
    let mut processes: Vec<AgentProcess> = Vec::new();

    report.phase("seed-check", || seed_check(&tools, env, &project_dir));

    if let Some(hooks) = report.phase("patch-config", || {
        patch_config(&project_dir, &scenario, env, config)?;
        registrar::refresh_hooks(&tools, env_file::BOTBUS_DATA_DIR)
    }) {
        report.hooks = Some(hooks);
    }

    report.phase("spawn", || {
        spawn_direct(&tools, &scenario, env, config, &artifacts_dir, &mut processes)
    });
    report.agents = processes
        .iter()
        .map(|p| SpawnedAgent {
            name: p.name.clone(),
            role: p.role.clone(),
            pid: p.pid(),
            log: p.log_path.clone(),
        })
        .collect();

    let workers = hook_workers(&scenario, env);
    report.poll = report.phase("poll", || {
        let task_id = env.require(env_file::TASK_ID)?.to_owned();
        let target = match scenario.target {
            Target::Task => PollTarget::Task(task_id),
            Target::ReviewedTask => PollTarget::ReviewedTask(task_id),
        };
        let mut observer = LiveObserver::new(&tools, target, &mut processes, workers);
        Ok(crate::poll::poll_until_done(
            &mut observer,
            clock,
            &PollSettings::from(&config.poll),
        ))
    });

    cleanup(&mut report, &tools, &mut processes, &scenario, env, &project_dir);

    let request = capture_request(&scenario, env, &eval_dir, &processes);
    report.capture = report.phase("capture", || {
        artifacts::capture_all(&tools, &config.capture, &request?, &artifacts_dir)
    });

    report.finished_at = Utc::now();
    if let Err(e) = report.write(&artifacts_dir) {
        tracing::error!(error = %e, "could not write {RUN_REPORT}");
    }
    tracing::info!(failed = report.failed_phases.len(), "run finished");
    Ok(report)
}

/// The project checkout exists and the seeded task is still open.
fn seed_check(tools: &Toolbox<'_>, env: &EvalEnv, project_dir: &Path) -> Result<()> {
    if !project_dir.is_dir() {
        return Err(EvalError::SeedCheck {
            detail: format!("project directory {} does not exist", project_dir.display()),
        });
    }
    let task_id = env.require(env_file::TASK_ID)?;
    let status = tools.tasks().status(task_id)?;
    if status.is_terminal() {
        return Err(EvalError::SeedCheck {
            detail: format!("task {task_id} is already {status}"),
        });
    }
    let todos = fixture::count_todos(project_dir)?;
    tracing::info!(task = task_id, %status, todos, "seed state ok");
    Ok(())
}

/// JSON-pointer patches applied to the project's `.botbox.json`.
pub fn config_patches(
    scenario: &Scenario,
    env: &EvalEnv,
    config: &EvalConfig,
) -> Result<Vec<(String, Value)>> {
    let mut patches = vec![(
        "/project/channel".to_owned(),
        Value::from(env.require(env_file::CHANNEL)?),
    )];
    for role in scenario.roles.iter().filter(|r| r.launch != Launch::Idle) {
        let base = format!("/agents/{}", role.name);
        patches.push((format!("{base}/name"), Value::from(env.agent(role.name)?)));
        patches.push((format!("{base}/model"), Value::from(config.agent.model.as_str())));
        patches.push((format!("{base}/timeout"), Value::from(config.agent.timeout_secs)));
    }
    Ok(patches)
}

fn patch_config(
    project_dir: &Path,
    scenario: &Scenario,
    env: &EvalEnv,
    config: &EvalConfig,
) -> Result<()> {
    let patches = config_patches(scenario, env, config)?;
    let borrowed: Vec<(&str, Value)> = patches
        .iter()
        .map(|(p, v)| (p.as_str(), v.clone()))
        .collect();
    let path = fixture::checkout_dir(project_dir).join(PROJECT_CONFIG);
    registrar::patch_json_config(&path, &borrowed)?;
    tracing::info!(path = %path.display(), patches = borrowed.len(), "project config patched");
    Ok(())
}

fn spawn_direct(
    tools: &Toolbox<'_>,
    scenario: &Scenario,
    env: &EvalEnv,
    config: &EvalConfig,
    log_dir: &Path,
    processes: &mut Vec<AgentProcess>,
) -> Result<()> {
    let channel = env.require(env_file::CHANNEL)?;
    for role in scenario.roles_with(Launch::Direct) {
        let request = AgentRequest {
            name: env.agent(role.name)?.to_owned(),
            role: role.name.to_owned(),
            channel: channel.to_owned(),
            prompt: spawner::render_prompt(role.prompt, env)?,
            log_dir: log_dir.to_owned(),
        };
        processes.push(spawner::spawn_agent(tools, &config.agent, &request)?);
    }
    Ok(())
}

/// Names of hook-spawned agents, used as botty id prefixes.
fn hook_workers(scenario: &Scenario, env: &EvalEnv) -> Vec<String> {
    scenario
        .roles_with(Launch::OnMention)
        .filter_map(|r| env.agent(r.name).ok().map(str::to_owned))
        .collect()
}

fn cleanup(
    report: &mut RunReport,
    tools: &Toolbox<'_>,
    processes: &mut [AgentProcess],
    scenario: &Scenario,
    env: &EvalEnv,
    project_dir: &Path,
) {
    let _span = tracing::info_span!("phase", name = "cleanup").entered();
    let must_kill = report.poll.as_ref().is_none_or(|p| {
        p.state == PollState::Timeout || p.worker_exited_in_grace == Some(false)
    });
    if must_kill {
        let known: Vec<String> = scenario
            .roles
            .iter()
            .filter(|r| r.launch != Launch::Idle)
            .filter_map(|r| env.agent(r.name).ok().map(str::to_owned))
            .collect();
        let kills = spawner::kill_all_agents(tools, processes, &known);
        if !kills.errors.is_empty() {
            report.failed_phases.push(PhaseFailure {
                phase: "cleanup",
                error: kills.errors.join("; "),
            });
        }
        report.cleanup = Some(kills);
    }
    match fixture::count_todos(project_dir) {
        Ok(n) => report.todos_remaining = Some(n),
        Err(e) => tracing::warn!(error = %e, "could not count todo!() markers"),
    }
}

fn capture_request(
    scenario: &Scenario,
    env: &EvalEnv,
    eval_dir: &Path,
    processes: &[AgentProcess],
) -> Result<CaptureRequest> {
    Ok(CaptureRequest {
        channel: env.require(env_file::CHANNEL)?.to_owned(),
        peer_channels: env
            .get(env_file::PEER_CHANNEL)
            .into_iter()
            .map(str::to_owned)
            .collect(),
        task_id: env.get(env_file::TASK_ID).map(str::to_owned),
        track_review: scenario.target == Target::ReviewedTask,
        agent_logs: processes.iter().map(|p| p.log_path.clone()).collect(),
        sources: scenario
            .snapshots
            .iter()
            .map(|s| SourceFile {
                project: s.project.to_owned(),
                project_dir: eval_dir.join(s.project),
                path: s.path.to_owned(),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::artifacts::{ArtifactSet, CHANNEL_HISTORY, TASK_JSON};
    use crate::poll::ManualClock;
    use crate::tools::ToolOutput;
    use crate::tools::fake::{FakeProcess, ScriptedRunner};

    const TASK: &[&str] = &["exec", "default", "--", "br", "show"];

    fn seeded_env(root: &Path, scenario: &str) -> EvalEnv {
        let scenario = scenarios::find(scenario).unwrap();
        for fixture in scenario.fixtures {
            fixture::write_fixture(root, fixture).unwrap();
        }
        let mut env = EvalEnv::new(root.join(env_file::ENV_FILE));
        env.set(env_file::EVAL_SCENARIO, scenario.name);
        env.set(env_file::EVAL_DIR, root.display().to_string());
        env.set(env_file::BOTBUS_DATA_DIR, root.join("bus").display().to_string());
        env.set(
            env_file::PROJECT_DIR,
            root.join(scenario.primary().name).display().to_string(),
        );
        env.set(env_file::PROJECT_NAME, scenario.primary().name);
        env.set(env_file::CHANNEL, scenario.primary().name);
        env.set(env_file::TASK_ID, "bd-1");
        for role in scenario.roles {
            env.set(env_file::agent_var(role.name), format!("eval-{}-test", role.name));
        }
        env
    }

    fn config() -> EvalConfig {
        let mut cfg = EvalConfig::default();
        cfg.poll.interval_secs = 10;
        cfg.poll.overall_timeout_secs = 120;
        cfg.poll.grace_secs = 5;
        cfg.capture.run_tests = false;
        cfg
    }

    fn tools_runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("bus", &["hooks", "list"], ToolOutput::ok("[]"))
            .on("bus", &["history"], ToolOutput::ok("eval-dev-test: Completed bd-1\n"))
            .on("bus", &["claims", "list"], ToolOutput::ok("[]"))
            .on("maw", &["ws", "list"], ToolOutput::ok("[]"))
            .on("botty", &["list"], ToolOutput::ok("[]"))
    }

    #[test]
    fn completed_run_captures_everything() {
        let dir = tempfile::tempdir().unwrap();
        let env = seeded_env(dir.path(), "worker-loop");
        let runner = tools_runner();
        runner.respond(
            "maw",
            TASK,
            [
                ToolOutput::ok(r#"{"id":"bd-1","status":"open"}"#),
                ToolOutput::ok(r#"{"id":"bd-1","status":"in_progress"}"#),
                ToolOutput::ok(r#"{"id":"bd-1","status":"closed"}"#),
            ],
        );
        runner.queue_spawn(FakeProcess::exits_after(11, 3));

        let report = run(&runner, &env, &config(), &mut ManualClock::new()).unwrap();

        assert!(report.failed_phases.is_empty(), "{:?}", report.failed_phases);
        let poll = report.poll.as_ref().unwrap();
        assert_eq!(poll.state, PollState::Completed);
        assert_eq!(poll.worker_exited_in_grace, Some(true));
        assert!(report.cleanup.is_none());
        assert_eq!(report.agents.len(), 1);
        assert_eq!(report.todos_remaining, Some(2));

        let set = ArtifactSet::load(&env.artifacts_dir().unwrap()).unwrap();
        assert!(set.get(CHANNEL_HISTORY).unwrap().contains("Completed bd-1"));
        assert!(set.get(TASK_JSON).unwrap().contains("closed"));
        assert!(set.get(RUN_REPORT).is_some());
        assert!(set.get("source/csvstats/src/lib.rs").is_some());
    }

    #[test]
    fn timeout_kills_agents_and_still_captures() {
        let dir = tempfile::tempdir().unwrap();
        let env = seeded_env(dir.path(), "worker-loop");
        let runner = tools_runner().on("maw", TASK, ToolOutput::ok(r#"{"status":"open"}"#));
        let agent = FakeProcess::running(12);
        runner.queue_spawn(agent.clone());

        let mut clock = ManualClock::new();
        let report = run(&runner, &env, &config(), &mut clock).unwrap();

        let poll = report.poll.as_ref().unwrap();
        assert_eq!(poll.state, PollState::Timeout);
        assert!(poll.elapsed <= Duration::from_secs(130));
        assert!(agent.was_killed());
        assert_eq!(
            report.cleanup.as_ref().unwrap().processes_killed,
            ["eval-dev-test"]
        );
        assert!(report.capture.is_some());
        assert!(env.artifacts_dir().unwrap().join(TASK_JSON).is_file());
    }

    #[test]
    fn unkillable_agent_fails_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let env = seeded_env(dir.path(), "worker-loop");
        let runner = tools_runner().on("maw", TASK, ToolOutput::ok(r#"{"status":"open"}"#));
        runner.queue_spawn(FakeProcess::unkillable(14));

        let report = run(&runner, &env, &config(), &mut ManualClock::new()).unwrap();

        assert_eq!(report.poll.as_ref().unwrap().state, PollState::Timeout);
        assert!(report.phase_failed("cleanup"));
        assert!(report.cleanup.as_ref().unwrap().processes_killed.is_empty());
        assert!(report.capture.is_some());
    }

    #[test]
    fn merged_review_does_not_cut_the_dev_off() {
        const REVIEWS: &[&str] = &["exec", "default", "--", "crit", "reviews", "list"];
        const REVIEW: &[&str] = &["exec", "default", "--", "crit", "review", "cr-1"];
        let dir = tempfile::tempdir().unwrap();
        let env = seeded_env(dir.path(), "review-cycle");
        // The review is merged from the first tick; the dev still has to
        // close the task, which happens on the third.
        let runner = tools_runner()
            .on("maw", REVIEWS, ToolOutput::ok(r#"[{"review_id":"cr-1"}]"#))
            .on("maw", REVIEW, ToolOutput::ok(r#"{"status":"merged"}"#));
        runner.respond(
            "maw",
            TASK,
            [
                ToolOutput::ok(r#"{"status":"in_progress"}"#),
                ToolOutput::ok(r#"{"status":"in_progress"}"#),
                ToolOutput::ok(r#"{"status":"in_progress"}"#),
                ToolOutput::ok(r#"{"status":"closed"}"#),
            ],
        );
        let dev = FakeProcess::exits_after(13, 2);
        runner.queue_spawn(dev.clone());

        let report = run(&runner, &env, &config(), &mut ManualClock::new()).unwrap();

        let poll = report.poll.as_ref().unwrap();
        assert_eq!(poll.state, PollState::Completed);
        assert_eq!(poll.ticks, 3);
        assert_eq!(poll.worker_exited_in_grace, Some(true));
        assert!(!dev.was_killed());
        assert!(report.cleanup.is_none());
        let set = ArtifactSet::load(&env.artifacts_dir().unwrap()).unwrap();
        assert!(set.get(crate::artifacts::REVIEW_JSON).unwrap().contains("merged"));
    }

    #[test]
    fn failed_phases_do_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let env = seeded_env(dir.path(), "worker-loop");
        // Task already closed: seed-check fails, the rest still runs.
        let runner = tools_runner().on("maw", TASK, ToolOutput::ok(r#"{"status":"closed"}"#));
        std::fs::remove_file(
            fixture::checkout_dir(&env.project_dir().unwrap()).join(PROJECT_CONFIG),
        )
        .unwrap();

        let report = run(&runner, &env, &config(), &mut ManualClock::new()).unwrap();

        assert!(report.phase_failed("seed-check"));
        assert!(report.phase_failed("patch-config"));
        assert!(!report.phase_failed("capture"));
        assert_eq!(report.poll.as_ref().unwrap().state, PollState::Completed);
        let text = report.render_text();
        assert!(text.contains("seed-check: seed check failed"), "{text}");
    }

    #[test]
    fn patch_config_sets_channel_and_agents() {
        let dir = tempfile::tempdir().unwrap();
        let env = seeded_env(dir.path(), "review-cycle");
        let scenario = scenarios::find("review-cycle").unwrap();
        let project = env.project_dir().unwrap();

        patch_config(&project, &scenario, &env, &config()).unwrap();

        let text = std::fs::read_to_string(project.join(PROJECT_CONFIG)).unwrap();
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["project"]["channel"], "kvparse");
        assert_eq!(doc["agents"]["dev"]["name"], "eval-dev-test");
        assert_eq!(doc["agents"]["reviewer"]["name"], "eval-reviewer-test");
        assert_eq!(doc["agents"]["reviewer"]["timeout"], config().agent.timeout_secs);
    }

    #[test]
    fn idle_roles_are_not_patched_or_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let env = seeded_env(dir.path(), "cross-project");
        let scenario = scenarios::find("cross-project").unwrap();
        let patches = config_patches(&scenario, &env, &config()).unwrap();
        assert!(patches.iter().all(|(p, _)| !p.contains("peer-lead")));

        let request = capture_request(&scenario, &env, dir.path(), &[]).unwrap();
        assert!(request.peer_channels.is_empty());
        assert_eq!(request.sources.len(), 2);
        assert_eq!(request.sources[1].project_dir, dir.path().join("libcore"));
    }
}
