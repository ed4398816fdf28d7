use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{CommandFactory as _, Parser, Subcommand};
use serde::Serialize;

use evals::config::EvalConfig;
use evals::env_file::{self, EvalEnv};
use evals::eval::{self, scenarios};
use evals::poll::SystemClock;
use evals::registrar::HookRefresh;
use evals::tools::SystemRunner;

mod doctor;
mod format;

use format::OutputFormat;

/// Eval harness for multi-agent coding workflows
///
/// Each eval seeds a throwaway project, lets AI agents work on it through
/// botbox, bus, maw, crit and botty, then scores what they left behind.
///
/// PHASES:
///
///   evals setup <scenario>        # prints the .eval-env path
///   evals run <env-file>          # spawn, poll, capture artifacts
///   evals verify <env-file>       # score the artifacts
///
///   evals eval <scenario>         # all three in one go
///
/// The eval directory is never deleted; artifacts/ holds agent logs,
/// channel history, task state and run.json for later inspection.
#[derive(Parser)]
#[command(name = "evals")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'evals <command> --help' for more information on a specific command.")]
struct Cli {
    /// Config file [default: ./evals.toml]
    #[arg(long, global = true, env = "EVALS_CONFIG")]
    config: Option<PathBuf>,

    /// Model passed to agents (overrides [agent] model)
    #[arg(long, global = true, env = "EVALS_MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available scenarios
    List {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Create a fresh eval directory and write its .eval-env
    ///
    /// Writes the fixture projects, initialises an isolated bus, names the
    /// agents and files the task. Any failure aborts with a non-zero exit.
    Setup {
        /// Scenario name (see 'evals list')
        scenario: String,

        /// Eval directory [default: a new temp dir]
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Spawn agents, wait for them, and capture artifacts
    ///
    /// Failed phases are reported and recorded in artifacts/run.json; the
    /// exit code is still 0 so that verify can run.
    Run {
        /// Path to .eval-env (or the eval directory)
        env_file: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Score captured artifacts
    Verify {
        /// Path to .eval-env (or the eval directory)
        env_file: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Setup, run and verify in one invocation
    Eval {
        /// Scenario name (see 'evals list')
        scenario: String,

        /// Eval directory [default: a new temp dir]
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Manage the eval's bus hooks
    #[command(subcommand)]
    Hooks(HooksCommands),

    /// Check that the external tools are installed
    Doctor {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum HooksCommands {
    /// Re-register every hook so spawned agents inherit a variable
    Refresh {
        /// Path to .eval-env (or the eval directory)
        env_file: PathBuf,

        /// Variable appended to each hook's --env-inherit list
        #[arg(long, default_value = env_file::BOTBUS_DATA_DIR)]
        inherit: String,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    let _telemetry = evals::telemetry::init();
    let cli = Cli::parse();
    let runner = SystemRunner;

    match cli.command {
        Commands::List { format } => list(format),
        Commands::Setup { ref scenario, ref dir } => {
            let config = load_config(&cli)?;
            let scenario = scenarios::find(scenario)?;
            let env = eval::setup(&runner, &scenario, &config, dir.as_deref(), &mut rand::rng())
                .with_context(|| format!("setup of '{}' failed", scenario.name))?;
            println!("{}", env.path().display());
            Ok(())
        }
        Commands::Run { ref env_file, format } => {
            let config = load_config(&cli)?;
            let env = load_env(env_file)?;
            let report = eval::run(&runner, &env, &config, &mut SystemClock::start())?;
            format.emit(&report, || report.render_text())
        }
        Commands::Verify { ref env_file, format } => {
            let config = load_config(&cli)?;
            let env = load_env(env_file)?;
            let card = eval::verify(&env, &config).context("cannot read artifacts")?;
            format.emit(&card, || card.render_text())
        }
        Commands::Eval {
            ref scenario,
            ref dir,
            format,
        } => {
            let config = load_config(&cli)?;
            let scenario = scenarios::find(scenario)?;
            let outcome = eval::eval(
                &runner,
                &scenario,
                &config,
                dir.as_deref(),
                &mut rand::rng(),
                &mut SystemClock::start(),
            )?;
            format.emit(&outcome, || {
                format!(
                    "env: {}\n\n{}\n{}",
                    outcome.env_file.display(),
                    outcome.run.render_text(),
                    outcome.scorecard.render_text()
                )
            })
        }
        Commands::Hooks(HooksCommands::Refresh {
            ref env_file,
            ref inherit,
            format,
        }) => {
            let config = load_config(&cli)?;
            let env = load_env(env_file)?;
            let refresh = eval::refresh_hooks(&runner, &env, &config, inherit)?;
            format.emit(&refresh, || render_refresh(&refresh))
        }
        Commands::Doctor { format } => doctor::run(&runner, cli.config.as_deref(), format),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "evals", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<EvalConfig> {
    let mut config = EvalConfig::resolve(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.agent.model.clone_from(model);
    }
    Ok(config)
}

/// Accept either the env file itself or the eval directory holding it.
fn load_env(path: &Path) -> Result<EvalEnv> {
    let path = if path.is_dir() {
        path.join(env_file::ENV_FILE)
    } else {
        path.to_owned()
    };
    EvalEnv::load(&path).with_context(|| format!("cannot load {}", path.display()))
}

#[derive(Serialize)]
struct ScenarioSummary {
    name: &'static str,
    description: &'static str,
    projects: Vec<&'static str>,
    roles: Vec<&'static str>,
    total_points: u64,
    criticals: usize,
}

fn list(format: OutputFormat) -> Result<()> {
    let summaries: Vec<ScenarioSummary> = scenarios::all_scenarios()
        .iter()
        .map(|s| ScenarioSummary {
            name: s.name,
            description: s.description,
            projects: s.fixtures.iter().map(|f| f.name).collect(),
            roles: s.role_names(),
            total_points: s.total_points(),
            criticals: s.criticals.len(),
        })
        .collect();
    format.emit(&summaries, || {
        let width = summaries.iter().map(|s| s.name.len()).max().unwrap_or(0);
        summaries
            .iter()
            .map(|s| {
                format!(
                    "{:width$}  {}\n{:width$}  roles: {}; {} points, {} critical checks\n",
                    s.name,
                    s.description,
                    "",
                    s.roles.join(", "),
                    s.total_points,
                    s.criticals,
                )
            })
            .collect()
    })
}

fn render_refresh(refresh: &HookRefresh) -> String {
    let mut out = format!(
        "recreated: {}, unchanged: {}, skipped: {}, failed: {}\n",
        refresh.recreated.len(),
        refresh.unchanged.len(),
        refresh.skipped.len(),
        refresh.failed.len()
    );
    for (hook, reason) in refresh.skipped.iter().chain(&refresh.failed) {
        out.push_str(&format!("  {} ({}): {reason}\n", hook.id, hook.condition.kind()));
    }
    out
}
