//! Harness configuration (`evals.toml`).
//!
//! Every field has a default, so a missing file is equivalent to an empty
//! one. Unknown keys are rejected to catch typos early.
//!
//! ```toml
//! [poll]
//! interval_secs = 30
//! overall_timeout_secs = 900
//! idle_warn_secs = 300
//! grace_secs = 15
//!
//! [agent]
//! runner = "botbox"
//! model = "sonnet"
//!
//! [tools]
//! tasks = "bn"
//! task_flavor = "bones"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EvalError, Result};

/// Default config file name looked up in the current directory.
pub const CONFIG_FILE: &str = "evals.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level harness configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl EvalConfig {
    /// Load configuration from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(EvalError::Config {
                    path: path.to_owned(),
                    detail: e.to_string(),
                });
            }
        };
        Self::parse(&text).map_err(|detail| EvalError::Config {
            path: path.to_owned(),
            detail,
        })
    }

    /// Load from an explicit path, or from [`CONFIG_FILE`] in the current
    /// directory when none is given.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(|| PathBuf::from(CONFIG_FILE), Path::to_path_buf);
        Self::load(&path)
    }

    /// Parse TOML text.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        toml::from_str(text).map_err(|e| e.message().to_owned())
    }
}

// ---------------------------------------------------------------------------
// PollConfig
// ---------------------------------------------------------------------------

/// Timing of the poll loop.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    /// Seconds between ticks.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Wall-clock budget for the whole run phase.
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,

    /// Warn when the task has not been seen active for this long.
    #[serde(default = "default_idle_warn")]
    pub idle_warn_secs: u64,

    /// After completion, how long to wait for the worker to exit.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            overall_timeout_secs: default_overall_timeout(),
            idle_warn_secs: default_idle_warn(),
            grace_secs: default_grace(),
        }
    }
}

impl PollConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }

    #[must_use]
    pub const fn idle_warn(&self) -> Duration {
        Duration::from_secs(self.idle_warn_secs)
    }

    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

const fn default_interval() -> u64 {
    30
}

const fn default_overall_timeout() -> u64 {
    900
}

const fn default_idle_warn() -> u64 {
    300
}

const fn default_grace() -> u64 {
    15
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// How agents are launched.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub runner: RunnerKind,

    /// Model name passed to the runner.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-agent timeout passed to the runner.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,

    /// Fixed agent names by role (e.g. `dev = "eval-dev"`). Roles not listed
    /// get a generated name.
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            runner: RunnerKind::default(),
            model: default_model(),
            timeout_secs: default_agent_timeout(),
            names: BTreeMap::new(),
        }
    }
}

fn default_model() -> String {
    "sonnet".to_owned()
}

const fn default_agent_timeout() -> u64 {
    900
}

/// Which binary runs an agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    /// `botbox run-agent claude -p <prompt> -m <model> -t <timeout>`
    #[default]
    Botbox,
    /// `claude -p <prompt> --model <model>`
    Claude,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Botbox => write!(f, "botbox"),
            Self::Claude => write!(f, "claude"),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolsConfig
// ---------------------------------------------------------------------------

/// External binary names and calling conventions.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default = "default_bus")]
    pub bus: String,

    /// Task tracker binary (`br` or `bn`).
    #[serde(default = "default_tasks")]
    pub tasks: String,

    #[serde(default)]
    pub task_flavor: TaskFlavor,

    /// Route task and review commands through `maw exec default --`.
    #[serde(default = "default_true")]
    pub via_maw: bool,

    #[serde(default = "default_maw")]
    pub maw: String,

    #[serde(default = "default_crit")]
    pub crit: String,

    #[serde(default = "default_botty")]
    pub botty: String,

    #[serde(default = "default_botbox")]
    pub botbox: String,

    #[serde(default = "default_claude")]
    pub claude: String,

    #[serde(default = "default_cargo")]
    pub cargo: String,

    #[serde(default = "default_jj")]
    pub jj: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bus: default_bus(),
            tasks: default_tasks(),
            task_flavor: TaskFlavor::default(),
            via_maw: true,
            maw: default_maw(),
            crit: default_crit(),
            botty: default_botty(),
            botbox: default_botbox(),
            claude: default_claude(),
            cargo: default_cargo(),
            jj: default_jj(),
        }
    }
}

fn default_bus() -> String {
    "bus".to_owned()
}
fn default_tasks() -> String {
    "br".to_owned()
}
fn default_maw() -> String {
    "maw".to_owned()
}
fn default_crit() -> String {
    "crit".to_owned()
}
fn default_botty() -> String {
    "botty".to_owned()
}
fn default_botbox() -> String {
    "botbox".to_owned()
}
fn default_claude() -> String {
    "claude".to_owned()
}
fn default_cargo() -> String {
    "cargo".to_owned()
}
fn default_jj() -> String {
    "jj".to_owned()
}
const fn default_true() -> bool {
    true
}

/// Subcommand dialect of the task tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskFlavor {
    /// `br`: `close`, `comments add`, status `open|in_progress|closed`.
    #[default]
    Beads,
    /// `bn`: `done`, `comment add`, state `ready|doing|done`.
    Bones,
}

// ---------------------------------------------------------------------------
// CaptureConfig / ScoringConfig
// ---------------------------------------------------------------------------

/// Artifact capture limits.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// Lines kept from the end of each agent log.
    #[serde(default = "default_tail")]
    pub log_tail_lines: usize,

    /// Messages fetched from channel history.
    #[serde(default = "default_history")]
    pub history_limit: usize,

    /// Run the project's test suite as part of capture.
    #[serde(default = "default_true")]
    pub run_tests: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            log_tail_lines: default_tail(),
            history_limit: default_history(),
            run_tests: true,
        }
    }
}

const fn default_tail() -> usize {
    200
}

const fn default_history() -> usize {
    200
}

/// Verdict thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringConfig {
    /// Minimum percentage of points for a pass (0-100).
    #[serde(default = "default_pass_pct")]
    pub pass_pct: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            pass_pct: default_pass_pct(),
        }
    }
}

const fn default_pass_pct() -> u8 {
    70
}
