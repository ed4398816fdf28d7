//! Setup phase: build a fresh eval directory and describe it in `.eval-env`.
//!
//! Any failure aborts setup. Whatever was created so far is left on disk.

use std::path::{Path, PathBuf};

use rand::Rng;

use super::scenarios::{Launch, Role, Scenario};
use crate::config::EvalConfig;
use crate::env_file::{self, EvalEnv};
use crate::error::Result;
use crate::fixture;
use crate::registrar;
use crate::spawner::{self, AgentRequest};
use crate::tools::bus::{Hook, HookCondition};
use crate::tools::{ToolRunner, Toolbox};

/// Identity used for setup-time bus messages and task creation.
pub const SETUP_ACTOR: &str = "eval-setup";

/// Subdirectory of the eval dir holding the isolated bus data.
pub const BUS_DIR: &str = "bus";

/// Subdirectory of the eval dir receiving logs and captured artifacts.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Create (or reuse) the eval directory.
///
/// With no explicit dir, a fresh `eval-<scenario>-XXXX` directory is made
/// under the system temp dir and kept after the process exits.
fn eval_dir(scenario: &Scenario, dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
        return Ok(dir.canonicalize()?);
    }
    let tmp = tempfile::Builder::new()
        .prefix(&format!("eval-{}-", scenario.name))
        .tempdir()?;
    Ok(tmp.keep())
}

/// Build the eval for `scenario` and write its `.eval-env`.
pub fn setup<R: Rng + ?Sized>(
    runner: &dyn ToolRunner,
    scenario: &Scenario,
    config: &EvalConfig,
    dir: Option<&Path>,
    rng: &mut R,
) -> Result<EvalEnv> {
    let root = eval_dir(scenario, dir)?;
    let _span = tracing::info_span!("setup", scenario = scenario.name, dir = %root.display()).entered();

    let bus_dir = root.join(BUS_DIR);
    std::fs::create_dir_all(&bus_dir)?;
    std::fs::create_dir_all(root.join(ARTIFACTS_DIR))?;
    let bus_dir_str = bus_dir.display().to_string();

    let mut projects = Vec::with_capacity(scenario.fixtures.len());
    for fixture in scenario.fixtures {
        projects.push(fixture::write_fixture(&root, fixture)?);
    }
    for (fixture, project) in scenario.fixtures.iter().zip(&projects) {
        let tools = Toolbox::new(runner, config.tools.clone(), project)
            .with_env(env_file::BOTBUS_DATA_DIR, bus_dir_str.as_str());
        fixture::verify_builds(&tools, fixture)?;
        tracing::info!(project = fixture.name, "fixture ready");
    }

    let primary = scenario.primary();
    let project_dir = &projects[0];
    let tools = Toolbox::new(runner, config.tools.clone(), project_dir)
        .with_env(env_file::BOTBUS_DATA_DIR, bus_dir_str.as_str());

    registrar::init_bus(&tools)?;
    let names = registrar::resolve_agent_names(rng, &scenario.role_names(), &config.agent.names);
    let peer = scenario.peers().first();
    let channel_of = |role: &Role| match (role.launch, peer) {
        (Launch::Idle, Some(peer)) => peer.name,
        _ => primary.name,
    };
    for role in scenario.roles {
        let name = names.get(role.name).map(String::as_str).unwrap_or_default();
        registrar::register_agents(&tools, channel_of(role), [name])?;
    }

    tools.tasks().init()?;
    let task_id = tools
        .tasks()
        .create(SETUP_ACTOR, scenario.task.title, scenario.task.description)?;
    tracing::info!(task = %task_id, "task seeded");

    let mut env = EvalEnv::new(root.join(env_file::ENV_FILE));
    env.set(env_file::EVAL_SCENARIO, scenario.name);
    env.set(env_file::EVAL_DIR, root.display().to_string());
    env.set(env_file::BOTBUS_DATA_DIR, bus_dir_str.as_str());
    env.set(env_file::PROJECT_DIR, project_dir.display().to_string());
    env.set(env_file::PROJECT_NAME, primary.name);
    env.set(env_file::CHANNEL, primary.name);
    env.set(env_file::TASK_ID, task_id);
    if let (Some(peer), Some(peer_dir)) = (peer, projects.get(1)) {
        env.set(env_file::PEER_CHANNEL, peer.name);
        env.set(env_file::PEER_PROJECT_DIR, peer_dir.display().to_string());
    }
    for (role, name) in &names {
        env.set(env_file::agent_var(role), name.as_str());
    }

    register_mention_hooks(&tools, scenario, config, &env)?;

    env.save()?;
    tracing::info!(env = %env.path().display(), "setup complete");
    Ok(env)
}

/// Register a `mention_received` hook for each on-mention role.
///
/// The hook spawns the role's agent through botty when it is @-mentioned
/// on the project channel. The run phase adds `--env-inherit` later.
fn register_mention_hooks(
    tools: &Toolbox<'_>,
    scenario: &Scenario,
    config: &EvalConfig,
    env: &EvalEnv,
) -> Result<()> {
    for role in scenario.roles_with(Launch::OnMention) {
        let name = env.agent(role.name)?.to_owned();
        let request = AgentRequest {
            name: name.clone(),
            role: role.name.to_owned(),
            channel: scenario.primary().name.to_owned(),
            prompt: spawner::render_prompt(role.prompt, env)?,
            log_dir: env.artifacts_dir()?,
        };
        let agent_cmd = spawner::agent_command(tools, &config.agent, &request);

        let mut command = vec![
            tools.bins().botty.clone(),
            "spawn".to_owned(),
            "--name".to_owned(),
            name.clone(),
            "--".to_owned(),
            agent_cmd.program,
        ];
        command.extend(agent_cmd.args);

        let hook = Hook {
            id: String::new(),
            channel: request.channel,
            condition: HookCondition::MentionReceived { agent: name },
            command,
            cwd: Some(tools.project_dir().display().to_string()),
            cooldown: Some("30s".to_owned()),
            priority: None,
            release_on_exit: false,
        };
        tools.bus().hooks_add(&hook)?;
        tracing::info!(role = role.name, "mention hook registered");
    }
    Ok(())
}
